//! Overlapped descriptors.
//!
//! An `Overlapped` correlates one in-flight receive with its completion.
//! It is bound to exactly one native buffer and carries a weak
//! back-reference to the party that wants the completion (the accept
//! cycle). The request queue keeps a clone while the receive is in
//! flight and calls [`Overlapped::complete`] from whatever thread the OS
//! delivers completions on.

use std::sync::{Arc, Weak};

use crate::buffer::NativeBuffer;
use crate::status::ReceiveStatus;

/// Token identifying a descriptor within its request queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct OverlappedToken(pub u32);

impl OverlappedToken {
    pub const NONE: Self = Self(u32::MAX);
}

/// Receives completion notifications.
///
/// **Contract:** `io_completed()` runs on an OS-owned thread (or inline on
/// the issuing thread). It must not block beyond what it strictly needs
/// and must not panic back into the caller.
pub trait IoCompletion: Send + Sync {
    fn io_completed(&self, status: ReceiveStatus, bytes: u32);
}

/// The descriptor itself.
pub struct Overlapped {
    token: OverlappedToken,
    buffer: NativeBuffer,
    target: Weak<dyn IoCompletion>,
}

/// Shared handle; the queue holds one clone per in-flight receive.
pub type OverlappedHandle = Arc<Overlapped>;

impl Overlapped {
    pub fn new(token: OverlappedToken, buffer: NativeBuffer, target: Weak<dyn IoCompletion>) -> Self {
        Self { token, buffer, target }
    }

    #[inline]
    pub fn token(&self) -> OverlappedToken {
        self.token
    }

    /// The buffer this descriptor is bound to.
    #[inline]
    pub fn buffer(&self) -> NativeBuffer {
        self.buffer
    }

    /// Deliver a completion. Dropped silently if the target is gone.
    pub fn complete(&self, status: ReceiveStatus, bytes: u32) {
        if let Some(target) = self.target.upgrade() {
            target.io_completed(status, bytes);
        }
    }
}

impl core::fmt::Debug for Overlapped {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Overlapped")
            .field("token", &self.token)
            .field("buffer_len", &self.buffer.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Recorder(AtomicU32);

    impl IoCompletion for Recorder {
        fn io_completed(&self, _status: ReceiveStatus, bytes: u32) {
            self.0.store(bytes, Ordering::SeqCst);
        }
    }

    fn null_buffer() -> NativeBuffer {
        NativeBuffer { ptr: core::ptr::null_mut(), len: 0 }
    }

    #[test]
    fn test_complete_forwards_to_target() {
        let target = Arc::new(Recorder(AtomicU32::new(0)));
        let weak: Weak<dyn IoCompletion> = Arc::downgrade(&target) as Weak<dyn IoCompletion>;
        let ovl = Overlapped::new(OverlappedToken(1), null_buffer(), weak);
        ovl.complete(ReceiveStatus::Success, 42);
        assert_eq!(target.0.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_complete_after_target_dropped() {
        let target = Arc::new(Recorder(AtomicU32::new(0)));
        let weak: Weak<dyn IoCompletion> = Arc::downgrade(&target) as Weak<dyn IoCompletion>;
        let ovl = Overlapped::new(OverlappedToken(1), null_buffer(), weak);
        drop(target);
        ovl.complete(ReceiveStatus::Success, 42);
    }
}
