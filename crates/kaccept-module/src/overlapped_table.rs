//! `OverlappedTable`: bounded allocator for overlapped descriptors.
//!
//! Tokens are recycled LIFO-ish through a lock-free free list, falling
//! back to fresh tokens until `capacity` is reached. Exhaustion surfaces
//! as `AcceptError::OutOfDescriptors`, the same way an OS refuses to
//! bind more descriptors.

use kaccept_core::buffer::NativeBuffer;
use kaccept_core::error::{AcceptError, Result};
use kaccept_core::overlapped::{IoCompletion, Overlapped, OverlappedHandle, OverlappedToken};

use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

pub struct OverlappedTable {
    /// Recycled tokens.
    free: ArrayQueue<u32>,
    /// Next never-used token.
    next_fresh: AtomicU32,
    /// Max live descriptors.
    capacity: u32,
    /// Descriptors currently bound.
    live: AtomicU32,
}

impl OverlappedTable {
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            free: ArrayQueue::new(capacity as usize),
            next_fresh: AtomicU32::new(0),
            capacity,
            live: AtomicU32::new(0),
        }
    }

    fn take_token(&self) -> Option<u32> {
        if let Some(token) = self.free.pop() {
            return Some(token);
        }
        loop {
            let current = self.next_fresh.load(Ordering::Acquire);
            if current >= self.capacity {
                return None;
            }
            if self
                .next_fresh
                .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(current);
            }
        }
    }

    /// Bind a descriptor to `buffer`.
    pub fn alloc(&self, buffer: NativeBuffer, target: Weak<dyn IoCompletion>) -> Result<OverlappedHandle> {
        let token = self.take_token().ok_or(AcceptError::OutOfDescriptors)?;
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(Overlapped::new(OverlappedToken(token), buffer, target)))
    }

    /// Return a descriptor's token to the free list.
    pub fn free(&self, overlapped: OverlappedHandle) {
        let token = overlapped.token();
        if token == OverlappedToken::NONE || token.0 >= self.capacity {
            return;
        }
        // Cannot overflow: at most `capacity` tokens exist.
        let _ = self.free.push(token.0);
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    /// Descriptors currently bound.
    #[inline]
    pub fn live(&self) -> u32 {
        self.live.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kaccept_core::status::ReceiveStatus;

    struct Nobody;

    impl IoCompletion for Nobody {
        fn io_completed(&self, _status: ReceiveStatus, _bytes: u32) {}
    }

    fn target() -> (Arc<Nobody>, Weak<dyn IoCompletion>) {
        let arc = Arc::new(Nobody);
        let weak: Weak<dyn IoCompletion> = Arc::downgrade(&arc) as Weak<dyn IoCompletion>;
        (arc, weak)
    }

    fn buf() -> NativeBuffer {
        NativeBuffer { ptr: std::ptr::null_mut(), len: 0 }
    }

    #[test]
    fn test_alloc_sequential_then_exhausted() {
        let table = OverlappedTable::new(2);
        let (_keep, weak) = target();
        let a = table.alloc(buf(), weak.clone()).unwrap();
        let b = table.alloc(buf(), weak.clone()).unwrap();
        assert_eq!(a.token(), OverlappedToken(0));
        assert_eq!(b.token(), OverlappedToken(1));
        assert!(matches!(table.alloc(buf(), weak), Err(AcceptError::OutOfDescriptors)));
        assert_eq!(table.live(), 2);
    }

    #[test]
    fn test_free_recycles() {
        let table = OverlappedTable::new(1);
        let (_keep, weak) = target();
        let a = table.alloc(buf(), weak.clone()).unwrap();
        table.free(a);
        assert_eq!(table.live(), 0);
        let b = table.alloc(buf(), weak).unwrap();
        assert_eq!(b.token(), OverlappedToken(0));
    }
}
