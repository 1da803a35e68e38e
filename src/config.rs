use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::index::INDEX_ENTRY_WIDTH;

/// Tunables for a log store instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOptions {
    /// Byte cap for a segment's data file. An append that would push the file
    /// past this cap triggers rollover to a fresh segment.
    pub segment_max_size: u64,
    /// Initial byte size of a freshly created index mapping. Aligned up to a
    /// whole number of entry slots.
    pub index_initial_size: u64,
    /// Multiplier applied to the index mapping size when an append would
    /// overflow it. The mapping never shrinks.
    pub index_growth_factor: u64,
    /// Capacity of the inbound event queue.
    pub event_queue_depth: usize,
}

impl StoreOptions {
    /// Validates the configuration parameters.
    pub fn validate(&self) -> StoreResult<()> {
        if self.segment_max_size == 0 {
            return Err(StoreError::Configuration(
                "segment_max_size must be greater than 0".to_string(),
            ));
        }
        if self.index_initial_size < INDEX_ENTRY_WIDTH as u64 {
            return Err(StoreError::Configuration(format!(
                "index_initial_size must hold at least one {} byte entry",
                INDEX_ENTRY_WIDTH
            )));
        }
        if self.index_growth_factor < 2 {
            return Err(StoreError::Configuration(
                "index_growth_factor must be at least 2".to_string(),
            ));
        }
        if self.event_queue_depth == 0 {
            return Err(StoreError::Configuration(
                "event_queue_depth must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            segment_max_size: 32 * 1024 * 1024, // 32MiB per data file
            index_initial_size: 4096,
            index_growth_factor: 2,
            event_queue_depth: 1024,
        }
    }
}
