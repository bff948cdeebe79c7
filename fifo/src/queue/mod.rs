use std::fmt;

use log::{debug, warn};

use super::codec::{ElementCodec, RawCodec};
use super::config::FifoConfig;
use super::core::sync::Signal;
use super::core::{Backing, QueueState, Segment};
use super::errors::{FifoError, Result};

mod reader;
mod writer;

/// Bytes in front of every element: its payload length as a little-endian `u64`.
pub const ELEMENT_HEADER_SIZE: usize = 8;

/// Bounded FIFO of variable-size elements over a circular byte pool.
///
/// All state, including the mutex and both condition variables, lives in the
/// segment, so queues attached to the same shared segment from different
/// processes serialize against each other.
pub struct Queue<C: ElementCodec = RawCodec> {
    segment: Segment,
    codec: C,
}

// Every access to the segment goes through its pthread mutex.
unsafe impl<C: ElementCodec> Send for Queue<C> {}
unsafe impl<C: ElementCodec> Sync for Queue<C> {}

impl Queue<RawCodec> {
    /// Opens a queue of raw byte elements.
    pub fn new(capacity: usize, blocking: bool, backing: Backing) -> Result<Queue> {
        Queue::open(capacity, blocking, backing, RawCodec)
    }

    pub fn from_config(cfg: &FifoConfig) -> Result<Queue> {
        Queue::new(cfg.capacity, cfg.blocking, cfg.backing())
    }

    /// Attaches to a shared queue created by another `Queue`, possibly in
    /// another process.
    pub fn open_existing(name: &str) -> Result<Queue> {
        Queue::open_existing_with(name, RawCodec)
    }
}

impl<C: ElementCodec> Queue<C> {
    pub fn open(capacity: usize, blocking: bool, backing: Backing, codec: C) -> Result<Queue<C>> {
        if capacity <= ELEMENT_HEADER_SIZE {
            return Err(FifoError::Configuration(format!(
                "capacity {} must exceed the {} byte element header",
                capacity, ELEMENT_HEADER_SIZE
            )));
        }
        if C::PROCESS_LOCAL && backing != Backing::Local {
            return Err(FifoError::Configuration(
                "codec hands off process-local handles and cannot back a shared queue".to_string(),
            ));
        }
        let segment = Segment::create(capacity, blocking, &backing)?;
        debug!("opened queue {:?}", segment);
        Ok(Queue { segment, codec })
    }

    pub fn open_existing_with(name: &str, codec: C) -> Result<Queue<C>> {
        if C::PROCESS_LOCAL {
            return Err(FifoError::Configuration(
                "codec hands off process-local handles and cannot attach to a shared queue".to_string(),
            ));
        }
        let segment = Segment::open(name)?;
        debug!("attached queue {:?}", segment);
        Ok(Queue { segment, codec })
    }

    /// Releases the queue. A shared segment is unlinked when this handle
    /// created it; attachers only unmap.
    pub fn close(self) {
        debug!("closing queue {:?}", self.segment);
        drop(self)
    }

    /// Unmaps without unlinking, even when this handle created the segment.
    pub fn detach(mut self) {
        self.segment.disown();
        debug!("detaching queue {:?}", self.segment);
        drop(self)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.segment.capacity()
    }

    pub fn shared_name(&self) -> Option<&str> {
        self.segment.shared_name()
    }

    pub fn is_owner(&self) -> bool {
        self.segment.is_owner()
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Switches blocking mode and wakes every thread parked on the queue so
    /// it re-evaluates under the new mode.
    pub fn set_blocking(&self, blocking: bool) -> Result<()> {
        let mut guard = self.segment.lock()?;
        guard.state().blocking = blocking as u32;
        guard.notify_all(Signal::ItemAvailable);
        guard.notify_all(Signal::SlotAvailable);
        Ok(())
    }

    pub fn is_blocking(&self) -> Result<bool> {
        Ok(self.segment.lock()?.state().is_blocking())
    }

    /// Bytes in use, element headers and stuffing included.
    pub fn level(&self) -> Result<usize> {
        Ok(self.segment.lock()?.state().level)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.level()? == 0)
    }

    /// Number of queued elements.
    pub fn len(&self) -> Result<usize> {
        let mut guard = self.segment.lock()?;
        let capacity = guard.capacity();
        let (state, pool) = guard.parts();
        let mut count = 0;
        for_each_element(state, pool, capacity, |_| count += 1)?;
        Ok(count)
    }

    /// Empties the queue. Waiters are not woken; pair with
    /// `set_blocking(false)` when they must leave.
    pub fn clear(&self) -> Result<()> {
        let mut guard = self.segment.lock()?;
        let capacity = guard.capacity();
        let (state, pool) = guard.parts();
        let walked = for_each_element(state, pool, capacity, |body| self.codec.discard(body));
        state.reset();
        walked
    }
}

impl<C: ElementCodec> Drop for Queue<C> {
    fn drop(&mut self) {
        if C::PROCESS_LOCAL {
            if let Err(e) = self.clear() {
                warn!("dropping queue with unreleased elements: {}", e);
            }
        }
    }
}

impl<C: ElementCodec> fmt::Debug for Queue<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue").field("segment", &self.segment).finish()
    }
}

/// Locates the element at the consumption offset: `(offset, payload_len)`.
fn element_at(state: &QueueState, pool: &[u8], capacity: usize) -> Result<(usize, usize)> {
    let offset = state.consumption_offset;
    let run = state.readable_run(capacity);
    if run < ELEMENT_HEADER_SIZE {
        return Err(FifoError::Corrupted(format!(
            "{} readable bytes at offset {} cannot hold an element header",
            run, offset
        )));
    }
    let mut raw = [0u8; ELEMENT_HEADER_SIZE];
    raw.copy_from_slice(&pool[offset..offset + ELEMENT_HEADER_SIZE]);
    let len = u64::from_le_bytes(raw) as usize;
    if len == 0 || len > run - ELEMENT_HEADER_SIZE {
        return Err(FifoError::Corrupted(format!(
            "element at offset {} claims {} bytes, {} readable",
            offset,
            len,
            run - ELEMENT_HEADER_SIZE
        )));
    }
    Ok((offset, len))
}

/// Visits every queued payload in order without consuming anything.
fn for_each_element<F>(state: &QueueState, pool: &[u8], capacity: usize, mut f: F) -> Result<()>
where
    F: FnMut(&[u8]),
{
    let mut cursor = *state;
    loop {
        cursor.skip_stuffing(capacity);
        if cursor.level == 0 {
            return Ok(());
        }
        let (offset, len) = element_at(&cursor, pool, capacity)?;
        let start = offset + ELEMENT_HEADER_SIZE;
        f(&pool[start..start + len]);
        cursor.commit_pull(capacity, ELEMENT_HEADER_SIZE + len);
    }
}
