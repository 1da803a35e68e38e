use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// Basename of the metadata document inside the store directory.
pub const META_FILE_NAME: &str = "logstore.meta";

/// Offset continuity record persisted across restarts.
///
/// The on-disk form is the JSON document `{"NextOffset": <int>}`; the field
/// name is load-bearing for readers of existing stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaData {
    /// The offset the next accepted append will be assigned.
    #[serde(rename = "NextOffset")]
    pub next_offset: u64,
}

impl Default for MetaData {
    fn default() -> Self {
        MetaData { next_offset: 1 }
    }
}

impl MetaData {
    /// Reads the metadata document from `dir`. An absent file is a fresh
    /// store and yields the default.
    pub fn load(dir: &Path) -> StoreResult<Self> {
        let path = dir.join(META_FILE_NAME);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("no metadata document at {:?}, starting fresh", path);
                return Ok(MetaData::default());
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::MalformedMetadata(e.to_string()))
    }

    /// Writes the metadata document to `dir`, going through a `tmp-` sibling
    /// so a crash mid-write cannot clobber the previous document.
    pub fn persist(&self, dir: &Path) -> StoreResult<()> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| StoreError::MalformedMetadata(e.to_string()))?;

        let tmp_path = dir.join(format!("tmp-{}", META_FILE_NAME));
        let final_path = dir.join(META_FILE_NAME);
        fs::write(&tmp_path, bytes).map_err(|e| StoreError::io(&tmp_path, e))?;
        fs::rename(&tmp_path, &final_path).map_err(|e| StoreError::io(&final_path, e))?;
        debug!("persisted {:?} to {:?}", self, final_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_absent_file_defaults_to_offset_one() {
        let dir = tempdir().expect("tempdir");
        let metadata = MetaData::load(dir.path()).expect("load");
        assert_eq!(metadata.next_offset, 1);
    }

    #[test]
    fn test_persist_load_roundtrip() {
        let dir = tempdir().expect("tempdir");
        let metadata = MetaData { next_offset: 201 };
        metadata.persist(dir.path()).expect("persist");
        assert_eq!(MetaData::load(dir.path()).expect("load"), metadata);
    }

    #[test]
    fn test_on_disk_document_shape() {
        let dir = tempdir().expect("tempdir");
        MetaData { next_offset: 5 }.persist(dir.path()).expect("persist");
        let raw = fs::read_to_string(dir.path().join(META_FILE_NAME)).expect("read");
        assert_eq!(raw, r#"{"NextOffset":5}"#);
    }

    #[test]
    fn test_persist_leaves_no_temporary_behind() {
        let dir = tempdir().expect("tempdir");
        MetaData { next_offset: 9 }.persist(dir.path()).expect("persist");
        assert!(!dir.path().join(format!("tmp-{}", META_FILE_NAME)).exists());
    }

    #[test]
    fn test_malformed_document_rejected() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join(META_FILE_NAME), b"not json").expect("write");
        assert!(matches!(
            MetaData::load(dir.path()),
            Err(StoreError::MalformedMetadata(_))
        ));
    }
}
