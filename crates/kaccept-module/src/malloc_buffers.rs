//! `MallocBuffers`: default `BufferProvider` implementation.
//!
//! Each buffer is a page-aligned `posix_memalign` allocation, zeroed.
//! Pinning optionally `mlock`s the pages so the kernel can write into them
//! without faulting. An optional limit on outstanding buffers models
//! native resource exhaustion.

use kaccept_core::buffer::{BufferProvider, NativeBuffer};
use kaccept_core::error::{AcceptError, Result};

use std::sync::atomic::{AtomicUsize, Ordering};

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn page_size() -> usize {
            // Safety: sysconf has no preconditions.
            let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if n > 0 { n as usize } else { 4096 }
        }

        unsafe fn raw_alloc(size: usize, align: usize) -> *mut u8 {
            let mut ptr: *mut libc::c_void = std::ptr::null_mut();
            if libc::posix_memalign(&mut ptr, align, size) != 0 {
                return std::ptr::null_mut();
            }
            ptr as *mut u8
        }

        unsafe fn raw_lock(ptr: *mut u8, len: usize) -> bool {
            libc::mlock(ptr as *const libc::c_void, len) == 0
        }

        unsafe fn raw_unlock(ptr: *mut u8, len: usize) {
            libc::munlock(ptr as *const libc::c_void, len);
        }
    } else {
        fn page_size() -> usize {
            4096
        }

        unsafe fn raw_alloc(size: usize, _align: usize) -> *mut u8 {
            libc::malloc(size) as *mut u8
        }

        unsafe fn raw_lock(_ptr: *mut u8, _len: usize) -> bool {
            true
        }

        unsafe fn raw_unlock(_ptr: *mut u8, _len: usize) {}
    }
}

pub struct MallocBuffers {
    /// Allocation alignment (page size by default).
    align: usize,
    /// `mlock` buffers on pin.
    lock_pages: bool,
    /// Max outstanding buffers; 0 = unlimited.
    limit: usize,
    /// Buffers currently outstanding.
    in_use: AtomicUsize,
    /// Total handed out.
    total: AtomicUsize,
    /// Total released.
    released: AtomicUsize,
}

impl MallocBuffers {
    pub fn new() -> Self {
        Self {
            align: page_size(),
            lock_pages: false,
            limit: 0,
            in_use: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    /// Cap outstanding buffers; further `acquire`s fail with `OutOfBuffers`.
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = n;
        self
    }

    /// `mlock` pinned buffers (subject to RLIMIT_MEMLOCK).
    pub fn lock_pages(mut self, enable: bool) -> Self {
        self.lock_pages = enable;
        self
    }

    /// Number of buffers released so far.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }

    fn reserve(&self) -> bool {
        if self.limit == 0 {
            self.in_use.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .is_ok()
    }
}

impl Default for MallocBuffers {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferProvider for MallocBuffers {
    fn acquire(&self, min_size: usize) -> Result<NativeBuffer> {
        let len = min_size.max(1);
        if !self.reserve() {
            tracing::debug!(len, limit = self.limit, "buffer limit reached");
            return Err(AcceptError::OutOfBuffers { requested: len });
        }

        // Safety: align is a power of two multiple of pointer size.
        let ptr = unsafe { raw_alloc(len, self.align) };
        if ptr.is_null() {
            self.in_use.fetch_sub(1, Ordering::AcqRel);
            return Err(AcceptError::OutOfBuffers { requested: len });
        }
        // Safety: freshly allocated region of `len` bytes.
        unsafe { std::ptr::write_bytes(ptr, 0, len) };

        self.total.fetch_add(1, Ordering::Relaxed);
        Ok(NativeBuffer { ptr, len })
    }

    fn release(&self, buffer: NativeBuffer) {
        if buffer.is_null() {
            return;
        }
        // Safety: produced by raw_alloc in acquire(), released once by the owner.
        unsafe { libc::free(buffer.ptr as *mut libc::c_void) };
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    fn pin(&self, buffer: &NativeBuffer) -> Result<()> {
        if !self.lock_pages {
            return Ok(());
        }
        // Safety: the region is live and owned by the caller.
        if unsafe { raw_lock(buffer.ptr, buffer.len) } {
            Ok(())
        } else {
            tracing::warn!(len = buffer.len, "mlock failed");
            Err(AcceptError::OutOfBuffers { requested: buffer.len })
        }
    }

    fn unpin(&self, buffer: &NativeBuffer) {
        if self.lock_pages {
            // Safety: the region is live and was locked by pin().
            unsafe { raw_unlock(buffer.ptr, buffer.len) };
        }
    }

    fn pool_size(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release() {
        let bufs = MallocBuffers::new();
        let b = bufs.acquire(100).unwrap();
        assert_eq!(b.len, 100);
        assert_eq!(b.ptr as usize % page_size(), 0);
        assert_eq!(bufs.in_use(), 1);

        let bytes = unsafe { std::slice::from_raw_parts(b.ptr, b.len) };
        assert!(bytes.iter().all(|&x| x == 0));

        bufs.release(b);
        assert_eq!(bufs.in_use(), 0);
        assert_eq!(bufs.pool_size(), 1);
        assert_eq!(bufs.released(), 1);
    }

    #[test]
    fn test_limit() {
        let bufs = MallocBuffers::new().limit(2);
        let a = bufs.acquire(16).unwrap();
        let b = bufs.acquire(16).unwrap();
        assert!(matches!(
            bufs.acquire(16),
            Err(AcceptError::OutOfBuffers { requested: 16 })
        ));
        bufs.release(a);
        let c = bufs.acquire(16).unwrap();
        bufs.release(b);
        bufs.release(c);
        assert_eq!(bufs.in_use(), 0);
    }

    #[test]
    fn test_pin_without_locking_is_noop() {
        let bufs = MallocBuffers::new();
        let b = bufs.acquire(64).unwrap();
        bufs.pin(&b).unwrap();
        bufs.unpin(&b);
        bufs.release(b);
    }
}
