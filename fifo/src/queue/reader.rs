use std::time::Duration;

use super::{element_at, Queue, ELEMENT_HEADER_SIZE};
use crate::codec::ElementCodec;
use crate::core::sync::{monotonic_deadline, Signal, WaitOutcome};
use crate::errors::{FifoError, Result};

impl<C: ElementCodec> Queue<C> {
    /// Removes the oldest element, returning it with its encoded size.
    ///
    /// `timeout` bounds the wait of a blocking queue; `None` waits until an
    /// element arrives or the queue is switched to non-blocking (`Eof`).
    pub fn pull(&self, timeout: Option<Duration>) -> Result<(C::Owned, usize)> {
        self.take(timeout, true)
    }

    /// Same as [`pull`](Queue::pull) but leaves the element queued.
    pub fn peek(&self, timeout: Option<Duration>) -> Result<(C::Owned, usize)> {
        self.take(timeout, false)
    }

    fn take(&self, timeout: Option<Duration>, consume: bool) -> Result<(C::Owned, usize)> {
        let deadline = timeout.map(monotonic_deadline);
        let mut guard = self.segment.lock()?;
        let capacity = guard.capacity();
        let mut parked = false;
        loop {
            let (state, pool) = guard.parts();
            state.skip_stuffing(capacity);
            if state.level > 0 {
                let (offset, len) = element_at(state, pool, capacity)?;
                let body = &pool[offset + ELEMENT_HEADER_SIZE..offset + ELEMENT_HEADER_SIZE + len];
                if !consume {
                    return self.codec.peek(body).map(|value| (value, len));
                }
                // The element is consumed even when decoding fails.
                let value = self.codec.decode(body);
                state.commit_pull(capacity, ELEMENT_HEADER_SIZE + len);
                guard.debug_check();
                guard.notify_all(Signal::SlotAvailable);
                return value.map(|value| (value, len));
            }
            if !state.is_blocking() {
                return Err(if parked { FifoError::Eof } else { FifoError::WouldBlock });
            }
            let outcome = guard.wait(Signal::ItemAvailable, deadline.as_ref())?;
            parked = true;
            if outcome == WaitOutcome::TimedOut && guard.state().level == 0 {
                return Err(FifoError::TimedOut);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::core::Backing;

    #[test]
    fn pull_returns_push_order() -> Result<()> {
        let queue = Queue::new(256, true, Backing::Local)?;
        for msg in ["first", "second", "third"] {
            queue.push(msg.as_bytes())?;
        }
        for msg in ["first", "second", "third"] {
            let (value, size) = queue.pull(Some(Duration::ZERO))?;
            assert_eq!(value, msg.as_bytes());
            assert_eq!(size, msg.len());
        }
        assert_eq!(queue.level()?, 0);
        Ok(())
    }

    #[test]
    fn level_after_partial_drain_is_remaining_element() -> Result<()> {
        let queue = Queue::new(64, true, Backing::Local)?;
        queue.push(&[1u8; 20])?;
        queue.push(&[2u8; 10])?;
        queue.pull(None)?;
        assert_eq!(queue.level()?, ELEMENT_HEADER_SIZE + 10);
        queue.pull(None)?;
        assert_eq!(queue.level()?, 0);
        Ok(())
    }

    #[test]
    fn peek_leaves_element_in_place() -> Result<()> {
        let queue = Queue::new(64, false, Backing::Local)?;
        queue.push(b"keep")?;
        let level = queue.level()?;
        assert_eq!(queue.peek(None)?.0, b"keep");
        assert_eq!(queue.peek(None)?.0, b"keep");
        assert_eq!(queue.level()?, level);
        assert_eq!(queue.pull(None)?.0, b"keep");
        assert!(matches!(queue.peek(None), Err(FifoError::WouldBlock)));
        Ok(())
    }

    #[test]
    fn empty_non_blocking_pull_would_block() -> Result<()> {
        let queue = Queue::new(64, false, Backing::Local)?;
        assert!(matches!(queue.pull(None), Err(FifoError::WouldBlock)));
        Ok(())
    }

    #[test]
    fn timed_pull_expires() -> Result<()> {
        let queue = Queue::new(64, true, Backing::Local)?;
        let start = Instant::now();
        assert!(matches!(queue.pull(Some(Duration::from_millis(50))), Err(FifoError::TimedOut)));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(50));
        assert!(waited < Duration::from_secs(2));
        Ok(())
    }

    #[test]
    fn unblocking_releases_parked_pull_with_eof() -> Result<()> {
        let queue = Arc::new(Queue::new(64, true, Backing::Local)?);
        let puller = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let result = queue.pull(None);
                (result, Instant::now())
            })
        };
        thread::sleep(Duration::from_millis(50));
        let unblocked_at = Instant::now();
        queue.set_blocking(false)?;
        let (result, returned_at) = puller.join().expect("puller panicked");
        assert!(matches!(result, Err(FifoError::Eof)));
        assert!(returned_at - unblocked_at < Duration::from_millis(500));
        Ok(())
    }

    #[test]
    fn blocked_pull_wakes_on_push() -> Result<()> {
        let queue = Arc::new(Queue::new(64, true, Backing::Local)?);
        let puller = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pull(Some(Duration::from_secs(5))))
        };
        thread::sleep(Duration::from_millis(20));
        queue.push(b"late")?;
        let (value, _) = puller.join().expect("puller panicked")?;
        assert_eq!(value, b"late");
        Ok(())
    }

    #[test]
    fn largest_element_fits_empty_queue_after_offsets_moved() -> Result<()> {
        let capacity = 64;
        let queue = Queue::new(capacity, false, Backing::Local)?;
        queue.push(&[3u8; 5])?;
        queue.pull(None)?;
        let largest = vec![9u8; capacity - ELEMENT_HEADER_SIZE];
        queue.push(&largest)?;
        assert_eq!(queue.level()?, capacity);
        assert_eq!(queue.pull(None)?.0, largest);
        Ok(())
    }
}
