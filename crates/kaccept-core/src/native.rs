//! Native request representation.
//!
//! A `NativeRequest` is a native buffer laid out as:
//!
//! ```text
//! [RawRequestHeader: 16 bytes]
//! [request bytes ...]
//! ```
//!
//! The header's `request_id` doubles as the continuation id for the next
//! receive: the accept cycle writes the id it wants to continue (or 0),
//! and the kernel overwrites it with the id it assigned.

use std::sync::Arc;

use crate::buffer::{BufferProvider, NativeBuffer};
use crate::error::Result;
use crate::id::RequestId;

/// Header the kernel writes at the start of every request buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RawRequestHeader {
    /// Kernel request id, or the continuation id before a receive.
    pub request_id: u64,
    /// Bytes of request data following the header.
    pub bytes_received: u32,
    /// `header_flags::*`.
    pub flags: u32,
}

/// Size of [`RawRequestHeader`]; the minimum size of any request buffer.
pub const HEADER_SIZE: usize = core::mem::size_of::<RawRequestHeader>();

/// Header flags.
pub mod header_flags {
    /// The connection carries authenticated credentials.
    pub const AUTHENTICATED: u32 = 1 << 0;
}

/// A request being received into (or already received into) native memory.
///
/// Owns its buffer; dropping the request unpins and releases it.
pub struct NativeRequest {
    buffer: NativeBuffer,
    provider: Arc<dyn BufferProvider>,
    pinned: bool,
    /// Bytes transferred by the completing receive (0 until completed).
    transferred: usize,
}

impl NativeRequest {
    /// Acquire a buffer of at least `size` bytes (never less than the
    /// header), write `continue_id` into the header, and pin it.
    pub fn allocate(
        provider: Arc<dyn BufferProvider>,
        size: usize,
        continue_id: RequestId,
    ) -> Result<Self> {
        let buffer = provider.acquire(size.max(HEADER_SIZE))?;
        let mut request = Self {
            buffer,
            provider,
            pinned: false,
            transferred: 0,
        };
        request.set_id(continue_id);
        request.provider.pin(&request.buffer)?;
        request.pinned = true;
        Ok(request)
    }

    /// The native buffer backing this request.
    #[inline]
    pub fn buffer(&self) -> NativeBuffer {
        self.buffer
    }

    /// Buffer size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.buffer.len
    }

    /// Bytes transferred by the completing receive.
    #[inline]
    pub fn len(&self) -> usize {
        self.transferred
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.transferred == 0
    }

    /// Record the bytes-transferred count of the completion.
    pub fn set_transferred(&mut self, bytes: usize) {
        self.transferred = bytes.min(self.buffer.len);
    }

    /// Copy of the header as currently written in native memory.
    pub fn header(&self) -> RawRequestHeader {
        // Safety: the buffer is at least HEADER_SIZE bytes (enforced in
        // allocate) and we hold it; unaligned read because providers only
        // promise byte alignment.
        unsafe { core::ptr::read_unaligned(self.buffer.ptr as *const RawRequestHeader) }
    }

    /// Request id from the header.
    #[inline]
    pub fn id(&self) -> RequestId {
        RequestId(self.header().request_id)
    }

    /// Overwrite the header's request id (continuation id for the next receive).
    pub fn set_id(&mut self, id: RequestId) {
        let mut header = self.header();
        header.request_id = id.0;
        // Safety: see `header()`.
        unsafe {
            core::ptr::write_unaligned(self.buffer.ptr as *mut RawRequestHeader, header);
        }
    }

    /// Header flags.
    #[inline]
    pub fn flags(&self) -> u32 {
        self.header().flags
    }

    /// Request bytes after the header, as reported by the header.
    pub fn bytes(&self) -> &[u8] {
        let avail = self.buffer.len - HEADER_SIZE;
        let n = (self.header().bytes_received as usize).min(avail);
        // Safety: [HEADER_SIZE, HEADER_SIZE + n) lies inside the buffer.
        unsafe { core::slice::from_raw_parts(self.buffer.ptr.add(HEADER_SIZE), n) }
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Drop the kernel-visible pin. Idempotent.
    pub fn unpin(&mut self) {
        if self.pinned {
            self.provider.unpin(&self.buffer);
            self.pinned = false;
        }
    }
}

impl Drop for NativeRequest {
    fn drop(&mut self) {
        self.unpin();
        self.provider.release(self.buffer);
    }
}

impl core::fmt::Debug for NativeRequest {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NativeRequest")
            .field("id", &self.id())
            .field("size", &self.size())
            .field("len", &self.transferred)
            .field("pinned", &self.pinned)
            .finish()
    }
}

// Safety: the buffer is exclusively owned by this request; the provider is
// Send + Sync.
unsafe impl Send for NativeRequest {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TestProvider {
        in_use: AtomicUsize,
        total: AtomicUsize,
        pins: AtomicUsize,
    }

    impl BufferProvider for TestProvider {
        fn acquire(&self, min_size: usize) -> Result<NativeBuffer> {
            let layout = Layout::from_size_align(min_size, 8).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            self.in_use.fetch_add(1, Ordering::Relaxed);
            self.total.fetch_add(1, Ordering::Relaxed);
            Ok(NativeBuffer { ptr, len: min_size })
        }

        fn release(&self, buffer: NativeBuffer) {
            let layout = Layout::from_size_align(buffer.len, 8).unwrap();
            unsafe { dealloc(buffer.ptr, layout) };
            self.in_use.fetch_sub(1, Ordering::Relaxed);
        }

        fn pin(&self, _buffer: &NativeBuffer) -> Result<()> {
            self.pins.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn unpin(&self, _buffer: &NativeBuffer) {
            self.pins.fetch_sub(1, Ordering::Relaxed);
        }

        fn pool_size(&self) -> usize {
            self.total.load(Ordering::Relaxed)
        }

        fn in_use(&self) -> usize {
            self.in_use.load(Ordering::Relaxed)
        }
    }

    #[test]
    fn test_allocate_writes_continuation_id() {
        let provider = Arc::new(TestProvider::default());
        let req = NativeRequest::allocate(provider.clone(), 64, RequestId::new(9)).unwrap();
        assert_eq!(req.id(), RequestId::new(9));
        assert_eq!(req.size(), 64);
        assert!(req.is_pinned());
        assert_eq!(provider.pins.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_minimum_size_is_header() {
        let provider = Arc::new(TestProvider::default());
        let req = NativeRequest::allocate(provider, 1, RequestId::NEW).unwrap();
        assert_eq!(req.size(), HEADER_SIZE);
        assert!(req.bytes().is_empty());
    }

    #[test]
    fn test_drop_unpins_and_releases() {
        let provider = Arc::new(TestProvider::default());
        {
            let mut req = NativeRequest::allocate(provider.clone(), 32, RequestId::NEW).unwrap();
            req.unpin();
            req.unpin();
            assert_eq!(provider.pins.load(Ordering::Relaxed), 0);
        }
        assert_eq!(provider.in_use(), 0);
        assert_eq!(provider.pins.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_bytes_follow_header() {
        let provider = Arc::new(TestProvider::default());
        let mut req = NativeRequest::allocate(provider, 64, RequestId::NEW).unwrap();
        let header = RawRequestHeader { request_id: 3, bytes_received: 5, flags: 0 };
        unsafe {
            core::ptr::write_unaligned(req.buffer().ptr as *mut RawRequestHeader, header);
            core::ptr::copy_nonoverlapping(b"GET /".as_ptr(), req.buffer().ptr.add(HEADER_SIZE), 5);
        }
        req.set_transferred(HEADER_SIZE + 5);
        assert_eq!(req.id(), RequestId::new(3));
        assert_eq!(req.bytes(), b"GET /");
        assert_eq!(req.len(), HEADER_SIZE + 5);
    }
}
