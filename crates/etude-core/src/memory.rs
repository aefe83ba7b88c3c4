// src/memory.rs
//! Allocation facade for every buffer that crosses a thread boundary.
//!
//! Receive frames, outbound packets and queue envelopes all come from one
//! [`Memory`] instance so that outstanding allocations can be observed in
//! diagnostics and tests. Freeing is tied to `Drop` of [`MessageBuf`].

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct Memory {
    total_allocations: AtomicUsize,
    live: AtomicUsize,
    live_bytes: AtomicUsize,
}

impl Memory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocate a zero-filled buffer of exactly `len` bytes.
    pub fn alloc(self: &Arc<Self>, len: usize) -> MessageBuf {
        self.adopt(vec![0u8; len])
    }

    /// Take ownership of an existing vector under this allocator's accounting.
    pub fn adopt(self: &Arc<Self>, bytes: Vec<u8>) -> MessageBuf {
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        self.live.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_add(bytes.len(), Ordering::Relaxed);
        MessageBuf {
            bytes: bytes.into_boxed_slice(),
            memory: Arc::clone(self),
        }
    }

    /// Buffers allocated and not yet dropped.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    pub fn total_allocations(&self) -> usize {
        self.total_allocations.load(Ordering::Relaxed)
    }

    fn release(&self, len: usize) {
        self.live.fetch_sub(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(len, Ordering::Relaxed);
    }
}

/// An owned, accounted byte buffer. Dropping it frees it exactly once.
pub struct MessageBuf {
    bytes: Box<[u8]>,
    memory: Arc<Memory>,
}

impl MessageBuf {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Deref for MessageBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl DerefMut for MessageBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl fmt::Debug for MessageBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBuf").field("len", &self.bytes.len()).finish()
    }
}

impl Drop for MessageBuf {
    fn drop(&mut self) {
        self.memory.release(self.bytes.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_returns_accounting_to_zero() {
        let memory = Memory::new();
        let a = memory.alloc(16);
        let b = memory.adopt(vec![1, 2, 3]);
        assert_eq!(memory.live(), 2);
        assert_eq!(memory.live_bytes(), 19);
        assert!(a.iter().all(|&x| x == 0));
        assert_eq!(&b[..], &[1, 2, 3]);

        drop(a);
        drop(b);
        assert_eq!(memory.live(), 0);
        assert_eq!(memory.live_bytes(), 0);
        assert_eq!(memory.total_allocations(), 2);
    }
}
