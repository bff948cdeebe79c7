use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FifoError>;

#[derive(Debug, Error)]
pub enum FifoError {
    /// Capacity, name or backing mode rejected at open time.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A shared segment with this name already exists.
    #[error("shared segment `{0}` already exists")]
    Conflict(String),
    #[error("shared segment `{0}` does not exist")]
    NotFound(String),
    /// The element can never fit, whatever the queue level.
    #[error("element of {size} bytes does not fit a {capacity} byte queue")]
    OutOfMemory { size: usize, capacity: usize },
    #[error("operation would block")]
    WouldBlock,
    #[error("timed out waiting for an element")]
    TimedOut,
    /// The queue was switched to non-blocking while the caller was parked on it.
    #[error("queue was unblocked for shutdown")]
    Eof,
    #[error("element codec error: {0}")]
    Codec(String),
    #[error("queue state corrupted: {0}")]
    Corrupted(String),
    #[error("{call} failed with errno {errno}")]
    Sync { call: &'static str, errno: i32 },
    #[error("shared memory error: {0}")]
    SharedMemory(#[from] shared_memory::ShmemError),
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Fifo(#[from] FifoError),
    #[error("no processor registered for `{0}`")]
    UnknownProcessor(String),
    #[error("a processor is already registered for `{0}`")]
    DuplicateProcessor(String),
    #[error("invalid setting `{key}`: {reason}")]
    Settings { key: String, reason: String },
    #[error("processor failed: {0}")]
    Processor(String),
    #[error("worker thread panicked")]
    WorkerPanicked,
    #[error("worker exited abnormally: {0}")]
    WorkerFailed(String),
    /// A previous reconfiguration failed and the stage has no worker left.
    #[error("stage `{0}` is not running")]
    NotRunning(String),
    #[error("cannot spawn worker: {0}")]
    Spawn(#[source] io::Error),
}

#[inline]
pub(crate) fn check(call: &'static str, rc: libc::c_int) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(FifoError::Sync { call, errno: rc })
    }
}
