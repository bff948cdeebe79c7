mod core;
pub mod codec;
pub mod config;
pub mod errors;
pub mod fair_lock;
pub mod queue;
pub mod stage;

#[cfg(test)]
mod tests;

pub use crate::codec::{ArcCodec, ElementCodec, RawCodec};
pub use crate::config::FifoConfig;
pub use crate::core::{Backing, MAX_NAME_LEN, SEGMENT_HEADER_SIZE};
pub use crate::errors::{FifoError, StageError};
pub use crate::fair_lock::{FairLock, FairLockGuard};
pub use crate::queue::{Queue, ELEMENT_HEADER_SIZE};
pub use crate::stage::processor::{
    BypassFactory, BypassProcessor, FrameProcessor, FrameSink, ProcessorFactory, StageKind, StageSettings,
};
pub use crate::stage::registry::ProcessorRegistry;
pub use crate::stage::{Stage, StageConfig, WorkerStatus};
