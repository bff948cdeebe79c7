//! Pipeline stage: an input queue, a worker thread that feeds a
//! [`FrameProcessor`], and an output queue, with live reconfiguration.
//!
//! Reconfiguring a running stage quiesces it first:
//!
//! 1. raise the exit flag,
//! 2. switch both queues to non-blocking so nothing stays parked on them,
//! 3. take the input then the output [`FairLock`],
//! 4. join the worker,
//! 5. clear both queues and replace the processor,
//! 6. switch the queues back to blocking,
//! 7. start a new worker,
//! 8. release the locks in reverse order.
//!
//! Steps 6 to 8 run whatever happened in 4 and 5. A stage whose
//! reconfiguration failed keeps no worker; check [`Stage::is_valid`] and
//! close it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde_derive::{Deserialize, Serialize};

use crate::core::Backing;
use crate::errors::{FifoError, StageError};
use crate::fair_lock::FairLock;
use crate::queue::Queue;

pub mod processor;
pub mod registry;

use processor::{FrameProcessor, ProcessorFactory, StageKind, StageSettings};
use registry::ProcessorRegistry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub name: String,
    pub input_capacity: usize,
    pub output_capacity: usize,
    /// How long the worker waits for input before looking at its exit flag.
    pub poll_interval_ms: u64,
    /// How long a reconfiguration waits for the worker to finish.
    pub join_timeout_ms: u64,
}

impl Default for StageConfig {
    fn default() -> Self {
        StageConfig {
            name: "stage".to_string(),
            input_capacity: 1 << 20,
            output_capacity: 1 << 20,
            poll_interval_ms: 50,
            join_timeout_ms: 5_000,
        }
    }
}

/// How a worker thread ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    Stopped,
    Failed(String),
}

/// Handed back through the join handle, so the processor always has
/// exactly one owner.
struct WorkerReport {
    status: WorkerStatus,
    processor: Box<dyn FrameProcessor>,
}

struct StageQueues {
    input: Queue,
    output: Queue,
    exit: AtomicBool,
    poll: Duration,
}

pub struct Stage {
    name: String,
    kind: StageKind,
    factory: Arc<dyn ProcessorFactory>,
    queues: Arc<StageQueues>,
    input_lock: FairLock,
    output_lock: FairLock,
    settings: Mutex<StageSettings>,
    worker: Mutex<Option<JoinHandle<WorkerReport>>>,
    join_timeout: Duration,
}

impl Stage {
    pub fn open(
        config: &StageConfig,
        factory: Arc<dyn ProcessorFactory>,
        settings: StageSettings,
    ) -> Result<Stage, StageError> {
        let queues = Arc::new(StageQueues {
            input: Queue::new(config.input_capacity, true, Backing::Local)?,
            output: Queue::new(config.output_capacity, true, Backing::Local)?,
            exit: AtomicBool::new(false),
            poll: Duration::from_millis(config.poll_interval_ms.max(1)),
        });
        let processor = factory.open(&settings)?;
        let worker = spawn_worker(&config.name, Arc::clone(&queues), processor)?;
        let kind = factory.kind();
        info!("stage `{}` ({}) started", config.name, kind);
        Ok(Stage {
            name: config.name.clone(),
            kind,
            factory,
            queues,
            input_lock: FairLock::new(),
            output_lock: FairLock::new(),
            settings: Mutex::new(settings),
            worker: Mutex::new(Some(worker)),
            join_timeout: Duration::from_millis(config.join_timeout_ms),
        })
    }

    pub fn from_registry(
        registry: &ProcessorRegistry,
        scheme: &str,
        config: &StageConfig,
        settings: StageSettings,
    ) -> Result<Stage, StageError> {
        Stage::open(config, registry.get(scheme)?, settings)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    /// False once a reconfiguration failed; such a stage should be closed.
    pub fn is_valid(&self) -> bool {
        self.worker_slot().is_some()
    }

    /// Queues a frame for the worker.
    pub fn send(&self, frame: &[u8]) -> Result<(), FifoError> {
        let _turn = self.input_lock.acquire();
        self.queues.input.push(frame)
    }

    /// Takes the next processed frame.
    pub fn receive(&self, timeout: Option<Duration>) -> Result<Vec<u8>, FifoError> {
        let _turn = self.output_lock.acquire();
        self.queues.output.pull(timeout).map(|(frame, _)| frame)
    }

    pub fn input_level(&self) -> Result<usize, FifoError> {
        self.queues.input.level()
    }

    pub fn output_level(&self) -> Result<usize, FifoError> {
        self.queues.output.level()
    }

    pub fn settings(&self) -> StageSettings {
        self.settings_slot().clone()
    }

    /// Applies new settings, restarting the processor when they differ from
    /// the current ones. Returns whether a restart happened. Frames queued
    /// before the restart are discarded.
    pub fn set_settings(&self, settings: StageSettings) -> Result<bool, StageError> {
        if *self.settings_slot() == settings {
            return Ok(false);
        }
        self.reconfigure(settings).map(|()| true)
    }

    fn reconfigure(&self, settings: StageSettings) -> Result<(), StageError> {
        info!("stage `{}`: reconfiguring", self.name);
        let stopped = self.request_stop();
        let input_turn = self.input_lock.acquire();
        let output_turn = self.output_lock.acquire();

        // A concurrent reconfiguration may have restored blocking mode
        // between our first request and taking the locks.
        let swapped = stopped
            .and_then(|()| self.request_stop())
            .and_then(|()| self.join_worker())
            .and_then(|old| self.replace_processor(old, settings));
        let resumed = self.resume(swapped);

        drop(output_turn);
        drop(input_turn);
        resumed
    }

    fn request_stop(&self) -> Result<(), StageError> {
        self.queues.exit.store(true, Ordering::SeqCst);
        let input = self.queues.input.set_blocking(false);
        let output = self.queues.output.set_blocking(false);
        input.and(output).map_err(StageError::from)
    }

    fn join_worker(&self) -> Result<Box<dyn FrameProcessor>, StageError> {
        let handle = self
            .worker_slot()
            .take()
            .ok_or_else(|| StageError::NotRunning(self.name.clone()))?;
        let deadline = Instant::now() + self.join_timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                // The thread is left detached; the exit flag stays raised.
                error!("stage `{}`: worker did not stop within {:?}", self.name, self.join_timeout);
                return Err(StageError::WorkerFailed("worker did not stop".to_string()));
            }
            thread::sleep(Duration::from_millis(1));
        }
        match handle.join() {
            Err(_) => {
                error!("stage `{}`: worker panicked", self.name);
                Err(StageError::WorkerPanicked)
            }
            Ok(WorkerReport { status: WorkerStatus::Stopped, processor }) => Ok(processor),
            Ok(WorkerReport { status: WorkerStatus::Failed(reason), mut processor }) => {
                error!("stage `{}`: worker failed: {}", self.name, reason);
                processor.close();
                Err(StageError::WorkerFailed(reason))
            }
        }
    }

    fn replace_processor(
        &self,
        mut old: Box<dyn FrameProcessor>,
        settings: StageSettings,
    ) -> Result<Box<dyn FrameProcessor>, StageError> {
        let input = self.queues.input.clear();
        let output = self.queues.output.clear();
        old.close();
        drop(old);
        input.and(output)?;

        let fresh = self.factory.open(&settings)?;
        *self.settings_slot() = settings;
        Ok(fresh)
    }

    fn resume(&self, swapped: Result<Box<dyn FrameProcessor>, StageError>) -> Result<(), StageError> {
        let input = self.queues.input.set_blocking(true);
        let output = self.queues.output.set_blocking(true);
        let unblocked = input.and(output).map_err(StageError::from);

        let processor = match swapped {
            Ok(processor) => processor,
            Err(e) => {
                error!("stage `{}`: reconfiguration failed, stage left without worker: {}", self.name, e);
                return Err(e);
            }
        };
        self.queues.exit.store(false, Ordering::SeqCst);
        let handle = spawn_worker(&self.name, Arc::clone(&self.queues), processor)?;
        *self.worker_slot() = Some(handle);
        info!("stage `{}`: worker restarted", self.name);
        unblocked
    }

    fn shutdown(&self) -> Result<(), StageError> {
        if !self.is_valid() {
            return Ok(());
        }
        let stopped = self.request_stop();
        let input_turn = self.input_lock.acquire();
        let output_turn = self.output_lock.acquire();
        let result = stopped.and_then(|()| self.join_worker()).and_then(|mut processor| {
            processor.close();
            let input = self.queues.input.clear();
            let output = self.queues.output.clear();
            input.and(output).map_err(StageError::from)
        });
        drop(output_turn);
        drop(input_turn);
        debug!("stage `{}` shut down", self.name);
        result
    }

    /// Stops the worker and drops everything still queued.
    pub fn close(self) -> Result<(), StageError> {
        self.shutdown()
    }

    fn settings_slot(&self) -> MutexGuard<'_, StageSettings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn worker_slot(&self) -> MutexGuard<'_, Option<JoinHandle<WorkerReport>>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("stage `{}`: shutdown failed: {}", self.name, e);
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("valid", &self.is_valid())
            .finish()
    }
}

fn spawn_worker(
    name: &str,
    queues: Arc<StageQueues>,
    processor: Box<dyn FrameProcessor>,
) -> Result<JoinHandle<WorkerReport>, StageError> {
    thread::Builder::new()
        .name(format!("stage-{}", name))
        .spawn(move || run_worker(queues, processor))
        .map_err(StageError::Spawn)
}

fn run_worker(queues: Arc<StageQueues>, mut processor: Box<dyn FrameProcessor>) -> WorkerReport {
    let status = loop {
        if queues.exit.load(Ordering::SeqCst) {
            break WorkerStatus::Stopped;
        }
        let frame = match queues.input.pull(Some(queues.poll)) {
            Ok((frame, _)) => frame,
            Err(FifoError::TimedOut) => continue,
            Err(FifoError::WouldBlock) | Err(FifoError::Eof) => break WorkerStatus::Stopped,
            Err(e) => break WorkerStatus::Failed(e.to_string()),
        };
        let output = &queues.output;
        match processor.process(&frame, &mut |out: &[u8]| output.push(out)) {
            Ok(()) => {}
            Err(StageError::Fifo(FifoError::WouldBlock)) | Err(StageError::Fifo(FifoError::Eof)) => {
                break WorkerStatus::Stopped
            }
            Err(StageError::Fifo(FifoError::OutOfMemory { size, capacity })) => {
                warn!("dropping {} byte output frame, output queue holds {} bytes", size, capacity);
            }
            Err(e) => break WorkerStatus::Failed(e.to_string()),
        }
    };
    debug!("worker {:?} exiting: {:?}", thread::current().name(), status);
    WorkerReport { status, processor }
}
