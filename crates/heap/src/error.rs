use storage::{BufferError, FileStoreError, PageNo};
use thiserror::Error;

use crate::Rid;

/// Errors returned by the heap file layer.
#[derive(Debug, Error)]
pub enum HeapError {
    /// Create was called for a heap file that already exists.
    #[error("heap file {0:?} already exists")]
    FileExists(String),
    /// The file name does not fit the header's fixed capacity.
    #[error("heap file name {0:?} exceeds the header capacity")]
    NameTooLong(String),
    /// The record is empty or larger than a page can hold.
    #[error("record of {len} bytes cannot be stored (valid sizes are 1..={max})")]
    InvalidRecordLength { len: usize, max: usize },
    /// Ill-formed scan parameters.
    #[error("invalid scan parameter: {0}")]
    BadScanParam(&'static str),
    /// The RID names a slot that is deleted or out of range.
    #[error("no record at {0:?}")]
    RecordNotFound(Rid),
    /// The scan has not yielded a record to operate on.
    #[error("the scan has no current record")]
    NoCurrentRecord,
    /// A non-tail page is missing its successor link.
    #[error("page chain broken: page {0} is not the tail but has no successor")]
    BrokenChain(PageNo),
    /// Propagated from the buffer manager.
    #[error(transparent)]
    Buffer(#[from] BufferError),
    /// Propagated from the file store.
    #[error(transparent)]
    Store(#[from] FileStoreError),
}

/// Convenience alias for heap file results.
pub type HeapResult<T> = Result<T, HeapError>;
