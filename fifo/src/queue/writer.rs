use super::{Queue, ELEMENT_HEADER_SIZE};
use crate::codec::ElementCodec;
use crate::core::sync::Signal;
use crate::errors::{FifoError, Result};

impl<C: ElementCodec> Queue<C> {
    /// Appends one element.
    ///
    /// Fails with `OutOfMemory` when the element could never fit, with
    /// `WouldBlock` when the queue is non-blocking and short of space, and
    /// otherwise waits for a pull to free enough contiguous room.
    pub fn push(&self, element: &C::Element) -> Result<()> {
        let len = self.codec.encoded_len(element);
        if len == 0 {
            return Err(FifoError::Codec("zero-size elements are not accepted".to_string()));
        }
        let capacity = self.capacity();
        let stored = len
            .checked_add(ELEMENT_HEADER_SIZE)
            .filter(|stored| *stored <= capacity)
            .ok_or(FifoError::OutOfMemory { size: len, capacity })?;

        let mut guard = self.segment.lock()?;
        loop {
            let (state, pool) = guard.parts();
            if let Some(slot) = state.reserve(capacity, stored) {
                let (header, body) = pool[slot.offset..slot.offset + stored].split_at_mut(ELEMENT_HEADER_SIZE);
                // A failed encode leaves the state untouched.
                self.codec.encode(body, element)?;
                header.copy_from_slice(&(len as u64).to_le_bytes());
                state.commit_push(capacity, slot, stored);
                guard.debug_check();
                guard.notify_all(Signal::ItemAvailable);
                return Ok(());
            }
            if !state.is_blocking() {
                return Err(FifoError::WouldBlock);
            }
            guard.wait(Signal::SlotAvailable, None)?;
        }
    }
}
