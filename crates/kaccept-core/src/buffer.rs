//! Native buffer abstraction.
//!
//! A `BufferProvider` hands out raw memory regions the kernel writes
//! request data into. The accept cycle holds exactly one at a time.
//!
//! # Implementors
//!
//! - `MallocBuffers` (default, `kaccept-module`): `posix_memalign` per
//!   buffer, page aligned, optional `mlock` pinning, optional limit on
//!   outstanding buffers.

use crate::error::Result;

/// A native memory region owned by whoever acquired it.
///
/// Plain pointer + length. The owner must hand it back to the provider
/// that produced it, exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeBuffer {
    /// Start of the region.
    pub ptr: *mut u8,
    /// Length of the region in bytes.
    pub len: usize,
}

// Safety: a buffer handle is a pointer + length; access is coordinated by
// the accept slot protocol, not by the handle.
unsafe impl Send for NativeBuffer {}
unsafe impl Sync for NativeBuffer {}

impl NativeBuffer {
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for as long
    /// as the handle is in use.
    pub const unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }
}

/// Manages native buffer lifecycle.
///
/// **Contract:**
/// - `acquire()` returns a zeroed region of at least `min_size` bytes, or
///   `AcceptError::OutOfBuffers`.
/// - `release()` frees a region obtained from the same provider.
/// - `pin()`/`unpin()` make a region safe for the kernel to write into
///   asynchronously. Providers whose memory never moves keep the defaults.
pub trait BufferProvider: Send + Sync {
    /// Acquire a buffer of at least `min_size` bytes.
    fn acquire(&self, min_size: usize) -> Result<NativeBuffer>;

    /// Release a previously acquired buffer.
    fn release(&self, buffer: NativeBuffer);

    /// Pin the buffer for kernel access.
    fn pin(&self, _buffer: &NativeBuffer) -> Result<()> {
        Ok(())
    }

    /// Drop the kernel-visible pin. Called before `release`.
    fn unpin(&self, _buffer: &NativeBuffer) {}

    /// Total number of buffers handed out over the provider's lifetime.
    fn pool_size(&self) -> usize;

    /// Number of buffers currently outstanding.
    fn in_use(&self) -> usize;
}
