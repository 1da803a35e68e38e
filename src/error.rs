use std::path::PathBuf;
use thiserror::Error;

/// The main result type for tidelog operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Enum representing possible errors within the tidelog library.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("segment limit reached: {requested} more bytes would exceed the {max_size} byte cap")]
    SegmentLimitReached { requested: u64, max_size: u64 },

    #[error("segment is sealed and cannot be appended to")]
    SegmentReadOnly,

    #[error("index is read-only")]
    IndexReadOnly,

    #[error("offset {offset} is outside the stored range")]
    OffsetOutOfRange { offset: u64 },

    #[error("malformed offset encoding: {0}")]
    InvalidOffsetEncoding(String),

    #[error("malformed metadata document: {0}")]
    MalformedMetadata(String),

    #[error("store directory {path:?} is locked by another process")]
    StoreLocked { path: PathBuf },

    #[error("the store's consumer loop is no longer running")]
    StoreClosed,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error accessing path {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}
