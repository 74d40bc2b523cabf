//! Request identifiers.

use core::fmt;

/// Kernel-assigned request identifier.
///
/// Written by the OS into the native request header when a receive
/// completes. Passing a non-zero id to the next receive continues that
/// (partially received) request; [`RequestId::NEW`] asks for any new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct RequestId(pub u64);

impl RequestId {
    /// "Give me the next request", not a continuation.
    pub const NEW: Self = Self(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn is_new(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{:x}", self.0)
    }
}
