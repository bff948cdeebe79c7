//! How elements are copied into the pool and materialized out of it.

use std::marker::PhantomData;
use std::mem;
use std::sync::Arc;

use crate::errors::{FifoError, Result};

/// Encode/decode pair used by a [`Queue`](crate::Queue).
///
/// `encode` writes exactly `encoded_len(element)` bytes; `decode` and `peek`
/// get back the same bytes. `decode` takes ownership of whatever the bytes
/// stand for, `peek` must leave it in place, and `discard` releases it
/// without producing a value (used when a queue is cleared or dropped).
pub trait ElementCodec: Send + Sync {
    type Element: ?Sized;
    type Owned;

    /// The encoded form refers to memory of the pushing process, so the
    /// queue must not be backed by shared memory.
    const PROCESS_LOCAL: bool = false;

    fn encoded_len(&self, element: &Self::Element) -> usize;

    fn encode(&self, dest: &mut [u8], element: &Self::Element) -> Result<()>;

    fn decode(&self, src: &[u8]) -> Result<Self::Owned>;

    fn peek(&self, src: &[u8]) -> Result<Self::Owned> {
        self.decode(src)
    }

    fn discard(&self, _src: &[u8]) {}
}

/// Copies bytes in on push and into a fresh `Vec` on pull.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl ElementCodec for RawCodec {
    type Element = [u8];
    type Owned = Vec<u8>;

    #[inline]
    fn encoded_len(&self, element: &[u8]) -> usize {
        element.len()
    }

    fn encode(&self, dest: &mut [u8], element: &[u8]) -> Result<()> {
        if dest.len() != element.len() {
            return Err(FifoError::Codec(format!(
                "destination is {} bytes for a {} byte element",
                dest.len(),
                element.len()
            )));
        }
        dest.copy_from_slice(element);
        Ok(())
    }

    fn decode(&self, src: &[u8]) -> Result<Vec<u8>> {
        Ok(src.to_vec())
    }
}

/// Hands `Arc<T>` handles through the queue without copying `T`: the pool
/// only carries the pointer, and the reference moves from pusher to puller.
pub struct ArcCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> ArcCodec<T> {
    pub fn new() -> Self {
        ArcCodec { _marker: PhantomData }
    }

    fn read_ptr(src: &[u8]) -> Result<*const T> {
        let bytes: [u8; mem::size_of::<usize>()] = src
            .try_into()
            .map_err(|_| FifoError::Codec(format!("expected a pointer, got {} bytes", src.len())))?;
        Ok(usize::from_ne_bytes(bytes) as *const T)
    }
}

impl<T> Default for ArcCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> ElementCodec for ArcCodec<T> {
    type Element = Arc<T>;
    type Owned = Arc<T>;

    const PROCESS_LOCAL: bool = true;

    fn encoded_len(&self, _element: &Arc<T>) -> usize {
        mem::size_of::<usize>()
    }

    fn encode(&self, dest: &mut [u8], element: &Arc<T>) -> Result<()> {
        if dest.len() != mem::size_of::<usize>() {
            return Err(FifoError::Codec(format!("expected {} bytes, got {}", mem::size_of::<usize>(), dest.len())));
        }
        let raw = Arc::into_raw(Arc::clone(element)) as usize;
        dest.copy_from_slice(&raw.to_ne_bytes());
        Ok(())
    }

    fn decode(&self, src: &[u8]) -> Result<Arc<T>> {
        let ptr = Self::read_ptr(src)?;
        // The reference taken in `encode` moves to the caller.
        Ok(unsafe { Arc::from_raw(ptr) })
    }

    fn peek(&self, src: &[u8]) -> Result<Arc<T>> {
        let ptr = Self::read_ptr(src)?;
        unsafe {
            Arc::increment_strong_count(ptr);
            Ok(Arc::from_raw(ptr))
        }
    }

    fn discard(&self, src: &[u8]) {
        if let Ok(ptr) = Self::read_ptr(src) {
            drop(unsafe { Arc::from_raw(ptr) });
        }
    }
}
