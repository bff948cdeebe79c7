use std::alloc::{self, Layout};
use std::cell::UnsafeCell;
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicU32, Ordering};

use ::shared_memory::{Shmem, ShmemConf, ShmemError};
use log::debug;

use crate::errors::{FifoError, Result};

mod state;
pub(crate) mod sync;

pub(crate) use state::QueueState;
use sync::{SegmentSync, Signal, WaitOutcome};

pub const MAGIC: [u8; 8] = *b"STGFIFO\0";
pub const LAYOUT_VERSION: u32 = 1;
/// Longest accepted shared segment name, leading `/` included.
pub const MAX_NAME_LEN: usize = 64;

const READY: u32 = 0x5245_4459;
const HEADER_ALIGN: usize = 64;

/// Fixed header at offset 0 of every segment. The pool follows at
/// `SEGMENT_HEADER_SIZE`; nothing in here is a pointer, so any process can
/// map the segment at any base address.
#[repr(C)]
pub(crate) struct SegmentHeader {
    magic: [u8; 8],
    version: u32,
    ready: AtomicU32,
    capacity: u64,
    process_shared: u32,
    _reserved: u32,
    state: UnsafeCell<QueueState>,
    sync: SegmentSync,
}

pub const SEGMENT_HEADER_SIZE: usize =
    (mem::size_of::<SegmentHeader>() + HEADER_ALIGN - 1) / HEADER_ALIGN * HEADER_ALIGN;

/// Where the segment bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backing {
    /// Process-local heap memory.
    Local,
    /// Named shared-memory segment, created exclusively.
    Shared(String),
}

enum Mapping {
    Local { base: NonNull<u8>, layout: Layout },
    Shared(Shmem),
}

/// A mapped segment: header plus pool, either heap allocated or a shared
/// memory mapping.
pub(crate) struct Segment {
    mapping: Mapping,
    base: NonNull<u8>,
    capacity: usize,
}

pub(crate) fn normalize_name(name: &str) -> Result<String> {
    let trimmed = name.strip_prefix('/').unwrap_or(name);
    if trimmed.is_empty() {
        return Err(FifoError::Configuration("shared segment name is empty".to_string()));
    }
    if trimmed.contains('/') || trimmed.contains('\0') {
        return Err(FifoError::Configuration(format!(
            "shared segment name `{}` may only contain a leading `/`",
            name
        )));
    }
    let normalized = format!("/{}", trimmed);
    if normalized.len() > MAX_NAME_LEN {
        return Err(FifoError::Configuration(format!(
            "shared segment name `{}` is longer than {} bytes",
            name, MAX_NAME_LEN
        )));
    }
    Ok(normalized)
}

fn map_open_error(name: &str, err: ShmemError) -> FifoError {
    match err {
        ShmemError::MapOpenFailed(errno) if errno as i32 == libc::ENOENT => {
            FifoError::NotFound(name.to_string())
        }
        ShmemError::LinkDoesNotExist => FifoError::NotFound(name.to_string()),
        e => FifoError::SharedMemory(e),
    }
}

impl Segment {
    pub fn create(capacity: usize, blocking: bool, backing: &Backing) -> Result<Segment> {
        let total = SEGMENT_HEADER_SIZE
            .checked_add(capacity)
            .ok_or_else(|| FifoError::Configuration(format!("capacity {} overflows", capacity)))?;
        let segment = match backing {
            Backing::Local => {
                let layout = Layout::from_size_align(total, HEADER_ALIGN)
                    .map_err(|e| FifoError::Configuration(e.to_string()))?;
                let base = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
                    .ok_or_else(|| FifoError::Configuration(format!("cannot allocate {} bytes", total)))?;
                Segment { mapping: Mapping::Local { base, layout }, base, capacity }
            }
            Backing::Shared(name) => {
                let os_id = normalize_name(name)?;
                let shmem = match ShmemConf::new().size(total).os_id(&os_id).create() {
                    Ok(v) => v,
                    Err(ShmemError::MappingIdExists) | Err(ShmemError::LinkExists) => {
                        return Err(FifoError::Conflict(os_id))
                    }
                    Err(e) => return Err(e.into()),
                };
                let base = NonNull::new(shmem.as_ptr())
                    .ok_or_else(|| FifoError::Configuration(format!("`{}` mapped at null", os_id)))?;
                Segment { mapping: Mapping::Shared(shmem), base, capacity }
            }
        };
        // On error `segment` drops here: the allocation is freed, or the
        // freshly created shared object is unlinked by its owner.
        segment.init_header(blocking, matches!(backing, Backing::Shared(_)))?;
        Ok(segment)
    }

    fn init_header(&self, blocking: bool, process_shared: bool) -> Result<()> {
        let header = self.base.as_ptr() as *mut SegmentHeader;
        unsafe {
            ptr::addr_of_mut!((*header).magic).write(MAGIC);
            ptr::addr_of_mut!((*header).version).write(LAYOUT_VERSION);
            ptr::addr_of_mut!((*header).capacity).write(self.capacity as u64);
            ptr::addr_of_mut!((*header).process_shared).write(process_shared as u32);
            ptr::addr_of_mut!((*header)._reserved).write(0);
            ptr::addr_of_mut!((*header).state).write(UnsafeCell::new(QueueState::new(blocking)));
            SegmentSync::init(ptr::addr_of_mut!((*header).sync), process_shared)?;
            (*header).ready.store(READY, Ordering::Release);
        }
        Ok(())
    }

    /// Attaches to a segment another queue created. The header is read
    /// first to learn the capacity, then the mapping is checked to cover the
    /// whole pool before anything else is touched.
    pub fn open(name: &str) -> Result<Segment> {
        let os_id = normalize_name(name)?;
        let shmem = ShmemConf::new().os_id(&os_id).open().map_err(|e| map_open_error(&os_id, e))?;
        if shmem.len() < SEGMENT_HEADER_SIZE {
            return Err(FifoError::Configuration(format!(
                "`{}` is {} bytes, smaller than a segment header",
                os_id,
                shmem.len()
            )));
        }
        let base = NonNull::new(shmem.as_ptr())
            .ok_or_else(|| FifoError::Configuration(format!("`{}` mapped at null", os_id)))?;
        let header = unsafe { &*(base.as_ptr() as *const SegmentHeader) };
        if header.ready.load(Ordering::Acquire) != READY
            || header.magic != MAGIC
            || header.version != LAYOUT_VERSION
        {
            return Err(FifoError::Configuration(format!(
                "`{}` is not an initialized queue segment",
                os_id
            )));
        }
        let capacity = header.capacity as usize;
        if shmem.len() < SEGMENT_HEADER_SIZE + capacity {
            return Err(FifoError::Corrupted(format!(
                "`{}` maps {} bytes but its header announces a {} byte pool",
                os_id,
                shmem.len(),
                capacity
            )));
        }
        Ok(Segment { mapping: Mapping::Shared(shmem), base, capacity })
    }

    #[inline]
    fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.base.as_ptr() as *const SegmentHeader) }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn shared_name(&self) -> Option<&str> {
        match &self.mapping {
            Mapping::Local { .. } => None,
            Mapping::Shared(shmem) => Some(shmem.get_os_id()),
        }
    }

    pub fn is_owner(&self) -> bool {
        match &self.mapping {
            Mapping::Local { .. } => true,
            Mapping::Shared(shmem) => shmem.is_owner(),
        }
    }

    /// Gives up ownership so dropping the mapping leaves the name in place.
    pub fn disown(&mut self) {
        if let Mapping::Shared(shmem) = &mut self.mapping {
            shmem.set_owner(false);
        }
    }

    pub fn lock(&self) -> Result<SegmentGuard<'_>> {
        let header = self.header();
        header.sync.lock()?;
        Ok(SegmentGuard {
            header,
            pool: unsafe { self.base.as_ptr().add(SEGMENT_HEADER_SIZE) },
            capacity: self.capacity,
        })
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        match &self.mapping {
            Mapping::Local { base, layout } => {
                let header = base.as_ptr() as *mut SegmentHeader;
                unsafe {
                    if (*header).ready.load(Ordering::Acquire) == READY {
                        SegmentSync::destroy(ptr::addr_of_mut!((*header).sync));
                    }
                    alloc::dealloc(base.as_ptr(), *layout);
                }
            }
            // Shmem unmaps, and unlinks the name when it is the owner.
            Mapping::Shared(shmem) => {
                debug!("releasing segment {} (owner: {})", shmem.get_os_id(), shmem.is_owner());
            }
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("capacity", &self.capacity)
            .field("shared_name", &self.shared_name())
            .field("owner", &self.is_owner())
            .finish()
    }
}

/// Exclusive access to a segment's state and pool; unlocks on drop.
pub(crate) struct SegmentGuard<'a> {
    header: &'a SegmentHeader,
    pool: *mut u8,
    capacity: usize,
}

impl<'a> SegmentGuard<'a> {
    #[inline]
    pub fn state(&mut self) -> &mut QueueState {
        unsafe { &mut *self.header.state.get() }
    }

    /// State and pool at once, for copying elements in and out.
    #[inline]
    pub fn parts(&mut self) -> (&mut QueueState, &mut [u8]) {
        unsafe {
            (
                &mut *self.header.state.get(),
                slice::from_raw_parts_mut(self.pool, self.capacity),
            )
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn wait(&mut self, signal: Signal, deadline: Option<&libc::timespec>) -> Result<WaitOutcome> {
        self.header.sync.wait(signal, deadline)
    }

    pub fn notify_all(&self, signal: Signal) {
        self.header.sync.notify_all(signal)
    }

    #[inline]
    pub fn debug_check(&mut self) {
        let capacity = self.capacity;
        if cfg!(debug_assertions) {
            if let Err(e) = self.state().check_invariants(capacity) {
                panic!("queue invariant violated: {}", e);
            }
        }
    }
}

impl<'a> Drop for SegmentGuard<'a> {
    fn drop(&mut self) {
        self.header.sync.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_padded() {
        assert_eq!(SEGMENT_HEADER_SIZE % HEADER_ALIGN, 0);
        assert!(SEGMENT_HEADER_SIZE >= mem::size_of::<SegmentHeader>());
    }

    #[test]
    fn names_are_normalized() -> Result<()> {
        assert_eq!(normalize_name("frames")?, "/frames");
        assert_eq!(normalize_name("/frames")?, "/frames");
        assert!(matches!(normalize_name("/"), Err(FifoError::Configuration(_))));
        assert!(matches!(normalize_name("a/b"), Err(FifoError::Configuration(_))));
        let long = "x".repeat(MAX_NAME_LEN);
        assert!(matches!(normalize_name(&long), Err(FifoError::Configuration(_))));
        Ok(())
    }

    #[test]
    fn local_segment_starts_empty() -> Result<()> {
        let segment = Segment::create(256, true, &Backing::Local)?;
        let mut guard = segment.lock()?;
        assert_eq!(guard.capacity(), 256);
        let state = *guard.state();
        assert_eq!(state, QueueState::new(true));
        Ok(())
    }
}
