use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::config::StoreOptions;
use crate::error::{StoreError, StoreResult};
use crate::index::{IndexEntry, SegmentIndex};

/// Basename shared by a segment's `.log` and `.index` files: the start
/// offset as a 20-digit zero-padded decimal.
pub fn base_name(start_offset: u64) -> String {
    format!("{:020}", start_offset)
}

/// An append-only data file paired with its index, covering the contiguous
/// offset range `[start_offset, next_offset)`.
///
/// A segment is writable from creation until [`Segment::close`]; a sealed
/// segment may be reopened read-only but never becomes writable again.
pub struct Segment {
    dir: PathBuf,
    start_offset: u64,
    next_offset: u64,
    max_size: u64,
    /// Append handle; dropped when the segment is sealed.
    log: Option<File>,
    index: SegmentIndex,
}

impl Segment {
    /// Creates `<base>.log` (empty, write) and a fresh index sized per
    /// `options`.
    pub fn create(dir: &Path, start_offset: u64, options: &StoreOptions) -> StoreResult<Self> {
        let log_path = log_path(dir, start_offset);
        let log = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&log_path)
            .map_err(|e| StoreError::io(&log_path, e))?;

        let index = SegmentIndex::create(
            index_path(dir, start_offset),
            options.index_initial_size,
            options.index_growth_factor,
        )?;

        let segment = Segment {
            dir: dir.to_path_buf(),
            start_offset,
            next_offset: start_offset,
            max_size: options.segment_max_size,
            log: Some(log),
            index,
        };
        debug!("{:?}: created", segment);
        Ok(segment)
    }

    /// Reopens a sealed segment read-only. The covered range is recovered
    /// from the index, so reads can be bound-checked.
    pub fn open_read_only(dir: &Path, start_offset: u64) -> StoreResult<Self> {
        let log_path = log_path(dir, start_offset);
        fs::metadata(&log_path).map_err(|e| StoreError::io(&log_path, e))?;

        let index = SegmentIndex::open_read_only(index_path(dir, start_offset))?;
        let next_offset = start_offset + index.len() as u64;

        let segment = Segment {
            dir: dir.to_path_buf(),
            start_offset,
            next_offset,
            max_size: 0, // irrelevant for reads
            log: None,
            index,
        };
        debug!("{:?}: opened read-only", segment);
        Ok(segment)
    }

    /// Appends one payload and returns the offset it was assigned.
    ///
    /// Fails with [`StoreError::SegmentReadOnly`] on a sealed segment and
    /// with [`StoreError::SegmentLimitReached`] when the data file would
    /// exceed the byte cap; neither failure writes anything.
    pub fn append(&mut self, payload: &[u8]) -> StoreResult<u64> {
        let log_path = log_path(&self.dir, self.start_offset);
        let log = match &mut self.log {
            Some(file) => file,
            None => return Err(StoreError::SegmentReadOnly),
        };

        let size = log
            .metadata()
            .map_err(|e| StoreError::io(&log_path, e))?
            .len();
        if size + payload.len() as u64 > self.max_size {
            return Err(StoreError::SegmentLimitReached {
                requested: payload.len() as u64,
                max_size: self.max_size,
            });
        }

        log.write_all(payload)
            .map_err(|e| StoreError::io(&log_path, e))?;
        self.index.append(IndexEntry {
            offset: self.next_offset as i64,
            position: size as i64,
            length: payload.len() as i64,
        })?;

        let offset = self.next_offset;
        self.next_offset += 1;
        trace!("{:?}: appended {} bytes at offset {}", self, payload.len(), offset);
        Ok(offset)
    }

    /// Reads the payload stored at `offset` through a handle independent of
    /// the append handle.
    pub fn read(&self, offset: u64) -> StoreResult<Vec<u8>> {
        if offset < self.start_offset || offset >= self.next_offset {
            return Err(StoreError::OffsetOutOfRange { offset });
        }
        let entry = self.index.lookup(offset)?;

        let log_path = log_path(&self.dir, self.start_offset);
        let mut file = File::open(&log_path).map_err(|e| StoreError::io(&log_path, e))?;
        file.seek(SeekFrom::Start(entry.position as u64))
            .map_err(|e| StoreError::io(&log_path, e))?;
        let mut payload = vec![0u8; entry.length as usize];
        file.read_exact(&mut payload)
            .map_err(|e| StoreError::io(&log_path, e))?;
        Ok(payload)
    }

    /// Current byte size of the data file, queried from the filesystem.
    pub fn size(&self) -> StoreResult<u64> {
        let log_path = log_path(&self.dir, self.start_offset);
        fs::metadata(&log_path)
            .map(|meta| meta.len())
            .map_err(|e| StoreError::io(&log_path, e))
    }

    /// Seals the segment: flushes the index mapping and drops the append
    /// handle. Safe to call more than once; the mapping itself is released
    /// on drop.
    pub fn close(&mut self) -> StoreResult<()> {
        trace!("{:?}: closing", self);
        self.index.flush()?;
        self.log = None;
        Ok(())
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// One past the last assigned offset.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    pub fn base(&self) -> String {
        base_name(self.start_offset)
    }

    pub fn is_empty(&self) -> bool {
        self.next_offset == self.start_offset
    }

    pub fn is_read_only(&self) -> bool {
        self.log.is_none()
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Segment {{ base: {}, offsets: [{}, {}), sealed: {} }}",
            self.base(),
            self.start_offset,
            self.next_offset,
            self.is_read_only()
        )
    }
}

pub(crate) fn log_path(dir: &Path, start_offset: u64) -> PathBuf {
    dir.join(format!("{}.log", base_name(start_offset)))
}

pub(crate) fn index_path(dir: &Path, start_offset: u64) -> PathBuf {
    dir.join(format!("{}.index", base_name(start_offset)))
}
