/// Marker value for "no stuffing region".
pub(crate) const NO_STUFFING: usize = usize::MAX;

/// Where a pending push will land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Reservation {
    pub offset: usize,
    /// The tail past the input offset turns into stuffing on commit.
    pub wraps: bool,
}

/// Byte-level bookkeeping of the circular pool. Every method expects the
/// segment mutex to be held by the caller.
///
/// The occupied region runs circularly from `consumption_offset` to
/// `input_offset`; when the writer wrapped early, `[stuffing, capacity)` is
/// dead space that is part of the occupied region and counted in `level`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueState {
    pub input_offset: usize,
    pub consumption_offset: usize,
    pub stuffing: usize,
    pub level: usize,
    pub blocking: u32,
}

impl QueueState {
    pub fn new(blocking: bool) -> QueueState {
        QueueState {
            input_offset: 0,
            consumption_offset: 0,
            stuffing: NO_STUFFING,
            level: 0,
            blocking: blocking as u32,
        }
    }

    #[inline]
    pub fn is_blocking(&self) -> bool {
        self.blocking != 0
    }

    #[inline]
    pub fn has_stuffing(&self) -> bool {
        self.stuffing != NO_STUFFING
    }

    /// Drops every element and the stuffing marker, keeping the blocking mode.
    pub fn reset(&mut self) {
        self.input_offset = 0;
        self.consumption_offset = 0;
        self.stuffing = NO_STUFFING;
        self.level = 0;
    }

    /// Finds a contiguous run of `stored` bytes for the next element without
    /// touching the state; nothing changes until `commit_push`.
    ///
    /// When the tail past the input offset is too short but the head of the
    /// pool can take the element, the reservation starts at 0 and the tail
    /// becomes stuffing on commit. Returns `None` when the element has to wait.
    pub fn reserve(&self, capacity: usize, stored: usize) -> Option<Reservation> {
        let at = |offset| Reservation { offset, wraps: false };
        if self.level == 0 {
            return Some(at(0));
        }
        if self.level >= capacity {
            return None;
        }
        let w = self.input_offset;
        let r = self.consumption_offset;
        if w >= r {
            if capacity - w >= stored {
                return Some(at(w));
            }
            debug_assert!(!self.has_stuffing(), "stuffing while writer is ahead of reader");
            if r >= stored {
                return Some(Reservation { offset: 0, wraps: true });
            }
            None
        } else if r - w >= stored {
            Some(at(w))
        } else {
            None
        }
    }

    pub fn commit_push(&mut self, capacity: usize, slot: Reservation, stored: usize) {
        if self.level == 0 {
            self.reset();
        }
        if slot.wraps {
            self.stuffing = self.input_offset;
            self.level += capacity - self.input_offset;
        }
        self.input_offset = (slot.offset + stored) % capacity;
        self.level += stored;
    }

    /// Moves the consumption offset past a stuffing region it sits on.
    pub fn skip_stuffing(&mut self, capacity: usize) {
        if self.has_stuffing() && self.consumption_offset == self.stuffing {
            self.level -= capacity - self.stuffing;
            self.consumption_offset = 0;
            self.stuffing = NO_STUFFING;
        }
        if self.level == 0 {
            self.reset();
        }
    }

    pub fn commit_pull(&mut self, capacity: usize, stored: usize) {
        self.consumption_offset = (self.consumption_offset + stored) % capacity;
        self.level -= stored;
        self.skip_stuffing(capacity);
    }

    /// Bytes of the occupied region that are readable without wrapping,
    /// starting at the consumption offset.
    pub fn readable_run(&self, capacity: usize) -> usize {
        let end = if self.has_stuffing() && self.consumption_offset <= self.stuffing {
            self.stuffing
        } else {
            capacity
        };
        (end - self.consumption_offset).min(self.level)
    }

    pub fn check_invariants(&self, capacity: usize) -> Result<(), String> {
        if self.level > capacity {
            return Err(format!("level {} exceeds capacity {}", self.level, capacity));
        }
        if self.input_offset >= capacity || self.consumption_offset >= capacity {
            return Err(format!(
                "offsets out of range: input {}, consumption {}, capacity {}",
                self.input_offset, self.consumption_offset, capacity
            ));
        }
        if self.has_stuffing() {
            if self.stuffing >= capacity {
                return Err(format!("stuffing marker {} outside the pool", self.stuffing));
            }
            if self.consumption_offset > self.stuffing || self.input_offset > self.stuffing {
                return Err(format!(
                    "stuffing marker {} behind input {} or consumption {}",
                    self.stuffing, self.input_offset, self.consumption_offset
                ));
            }
        }
        let used = if self.input_offset > self.consumption_offset {
            self.input_offset - self.consumption_offset
        } else if self.input_offset < self.consumption_offset {
            capacity - self.consumption_offset + self.input_offset
        } else if self.level == 0 {
            0
        } else {
            capacity
        };
        if used != self.level {
            return Err(format!(
                "level {} disagrees with occupied span {} (input {}, consumption {})",
                self.level, used, self.input_offset, self.consumption_offset
            ));
        }
        Ok(())
    }
}
