use std::cell::UnsafeCell;
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::time::Duration;

use crate::errors::{check, Result};

/// Which condition a waiter parks on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    ItemAvailable,
    SlotAvailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    Woken,
    TimedOut,
}

/// Mutex and the two condition variables of a queue. Lives inside the
/// segment header, so it must never be moved after `init`.
#[repr(C)]
pub(crate) struct SegmentSync {
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    item_available: UnsafeCell<libc::pthread_cond_t>,
    slot_available: UnsafeCell<libc::pthread_cond_t>,
}

impl SegmentSync {
    /// # Safety
    /// `this` must point to writable, suitably aligned memory that no other
    /// thread or process is using yet.
    pub unsafe fn init(this: *mut SegmentSync, process_shared: bool) -> Result<()> {
        let mutex = ptr::addr_of_mut!((*this).mutex).cast::<libc::pthread_mutex_t>();
        let item_available = ptr::addr_of_mut!((*this).item_available).cast::<libc::pthread_cond_t>();
        let slot_available = ptr::addr_of_mut!((*this).slot_available).cast::<libc::pthread_cond_t>();

        let mut mattr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        check("pthread_mutexattr_init", libc::pthread_mutexattr_init(mattr.as_mut_ptr()))?;
        let mut rc = 0;
        if process_shared {
            rc = libc::pthread_mutexattr_setpshared(mattr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
        }
        if rc == 0 {
            rc = libc::pthread_mutex_init(mutex, mattr.as_ptr());
        }
        libc::pthread_mutexattr_destroy(mattr.as_mut_ptr());
        check("pthread_mutex_init", rc)?;

        let mut cattr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        let rc = libc::pthread_condattr_init(cattr.as_mut_ptr());
        if rc != 0 {
            libc::pthread_mutex_destroy(mutex);
            return check("pthread_condattr_init", rc);
        }
        let mut rc = libc::pthread_condattr_setclock(cattr.as_mut_ptr(), libc::CLOCK_MONOTONIC);
        if rc == 0 && process_shared {
            rc = libc::pthread_condattr_setpshared(cattr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
        }
        if rc == 0 {
            rc = libc::pthread_cond_init(item_available, cattr.as_ptr());
            if rc == 0 {
                rc = libc::pthread_cond_init(slot_available, cattr.as_ptr());
                if rc != 0 {
                    libc::pthread_cond_destroy(item_available);
                }
            }
        }
        libc::pthread_condattr_destroy(cattr.as_mut_ptr());
        if rc != 0 {
            libc::pthread_mutex_destroy(mutex);
        }
        check("pthread_cond_init", rc)
    }

    /// # Safety
    /// No thread may be blocked on or holding any of the primitives.
    pub unsafe fn destroy(this: *mut SegmentSync) {
        libc::pthread_cond_destroy(ptr::addr_of_mut!((*this).slot_available).cast());
        libc::pthread_cond_destroy(ptr::addr_of_mut!((*this).item_available).cast());
        libc::pthread_mutex_destroy(ptr::addr_of_mut!((*this).mutex).cast());
    }

    pub fn lock(&self) -> Result<()> {
        check("pthread_mutex_lock", unsafe { libc::pthread_mutex_lock(self.mutex.get()) })
    }

    pub fn unlock(&self) {
        let rc = unsafe { libc::pthread_mutex_unlock(self.mutex.get()) };
        debug_assert_eq!(rc, 0, "pthread_mutex_unlock");
    }

    fn cond(&self, signal: Signal) -> *mut libc::pthread_cond_t {
        match signal {
            Signal::ItemAvailable => self.item_available.get(),
            Signal::SlotAvailable => self.slot_available.get(),
        }
    }

    /// Must be called with the mutex held; returns with it held again.
    pub fn wait(&self, signal: Signal, deadline: Option<&libc::timespec>) -> Result<WaitOutcome> {
        let cond = self.cond(signal);
        let rc = unsafe {
            match deadline {
                Some(at) => libc::pthread_cond_timedwait(cond, self.mutex.get(), at),
                None => libc::pthread_cond_wait(cond, self.mutex.get()),
            }
        };
        match rc {
            0 => Ok(WaitOutcome::Woken),
            libc::ETIMEDOUT => Ok(WaitOutcome::TimedOut),
            errno => Err(crate::FifoError::Sync { call: "pthread_cond_wait", errno }),
        }
    }

    pub fn notify_all(&self, signal: Signal) {
        let rc = unsafe { libc::pthread_cond_broadcast(self.cond(signal)) };
        debug_assert_eq!(rc, 0, "pthread_cond_broadcast");
    }
}

/// Absolute `CLOCK_MONOTONIC` deadline `timeout` from now, matching the
/// clock the condition variables were initialized with.
pub(crate) fn monotonic_deadline(timeout: Duration) -> libc::timespec {
    let mut now: libc::timespec = unsafe { mem::zeroed() };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now) };
    let nanos = now.tv_nsec as u64 + u64::from(timeout.subsec_nanos());
    let secs = (now.tv_sec as u64)
        .saturating_add(timeout.as_secs())
        .saturating_add(nanos / 1_000_000_000);
    let mut at: libc::timespec = unsafe { mem::zeroed() };
    at.tv_sec = secs.min(libc::time_t::MAX as u64) as libc::time_t;
    at.tv_nsec = (nanos % 1_000_000_000) as _;
    at
}
