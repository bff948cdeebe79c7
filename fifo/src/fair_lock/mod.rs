use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Tickets {
    head: u64,
    tail: u64,
}

/// Ticket lock: callers enter strictly in the order they called `acquire`.
///
/// Every release broadcasts; only the thread holding the next ticket goes
/// on, the rest wait again.
#[derive(Default)]
pub struct FairLock {
    tickets: Mutex<Tickets>,
    turn: Condvar,
}

impl FairLock {
    pub fn new() -> FairLock {
        FairLock::default()
    }

    // Counter updates are single increments, a panicking holder cannot
    // leave them half-written.
    fn tickets(&self) -> MutexGuard<'_, Tickets> {
        self.tickets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn acquire(&self) -> FairLockGuard<'_> {
        let mut tickets = self.tickets();
        let ticket = tickets.tail;
        tickets.tail = tickets.tail.wrapping_add(1);
        while tickets.head != ticket {
            tickets = self.turn.wait(tickets).unwrap_or_else(PoisonError::into_inner);
        }
        FairLockGuard { lock: self, ticket }
    }

    /// Succeeds only when nobody holds the lock or waits for it.
    pub fn try_acquire(&self) -> Option<FairLockGuard<'_>> {
        let mut tickets = self.tickets();
        if tickets.head != tickets.tail {
            return None;
        }
        let ticket = tickets.tail;
        tickets.tail = tickets.tail.wrapping_add(1);
        Some(FairLockGuard { lock: self, ticket })
    }

    /// Holder plus waiters.
    pub fn waiting(&self) -> u64 {
        let tickets = self.tickets();
        tickets.tail.wrapping_sub(tickets.head)
    }

    fn release(&self) {
        let mut tickets = self.tickets();
        tickets.head = tickets.head.wrapping_add(1);
        drop(tickets);
        self.turn.notify_all();
    }
}

impl fmt::Debug for FairLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tickets = self.tickets();
        f.debug_struct("FairLock")
            .field("head", &tickets.head)
            .field("tail", &tickets.tail)
            .finish()
    }
}

/// Held ticket; released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct FairLockGuard<'a> {
    lock: &'a FairLock,
    ticket: u64,
}

impl<'a> FairLockGuard<'a> {
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    pub fn release(self) {
        drop(self)
    }
}

impl<'a> Drop for FairLockGuard<'a> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl<'a> fmt::Debug for FairLockGuard<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FairLockGuard").field("ticket", &self.ticket).finish()
    }
}
