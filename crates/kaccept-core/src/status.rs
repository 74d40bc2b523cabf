//! Receive status vocabulary.
//!
//! The accept engine matches only on [`ReceiveStatus`]. Backends that speak
//! Win32-style numeric codes convert with [`ReceiveStatus::from_raw`].

use core::fmt;

/// Raw status codes, Win32 numbering.
///
/// A receive that continues a request id another party already consumed
/// fails with either `INVALID_PARAMETER` or `CONNECTION_INVALID`. Both are
/// collisions when the continuation id is non-zero, see
/// [`ReceiveStatus::is_stolen_id`]; with a zero id they stay fatal.
pub mod codes {
    pub const SUCCESS: u32 = 0;
    pub const INVALID_PARAMETER: u32 = 87;
    pub const INSUFFICIENT_BUFFER: u32 = 122;
    pub const MORE_DATA: u32 = 234;
    pub const OPERATION_ABORTED: u32 = 995;
    pub const IO_PENDING: u32 = 997;
    pub const CONNECTION_INVALID: u32 = 1229;
}

/// Outcome of a receive call or of its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStatus {
    /// Request received; `bytes` is the number of bytes transferred.
    Success,
    /// Queued; the completion arrives later through the overlapped descriptor.
    Pending,
    /// Synchronous: buffer too small, `bytes` is the required size.
    InsufficientBuffer,
    /// Completion: buffer too small, `bytes` is the size hint.
    MoreData,
    /// Bad argument. With a non-zero continuation id this means the id
    /// was invalidated by another party (slot collision).
    InvalidParameter,
    /// Anything else. Fatal for the current accept attempt.
    Other(u32),
}

impl ReceiveStatus {
    /// Map a raw status code onto the vocabulary.
    pub const fn from_raw(code: u32) -> Self {
        match code {
            codes::SUCCESS => Self::Success,
            codes::IO_PENDING => Self::Pending,
            codes::INSUFFICIENT_BUFFER => Self::InsufficientBuffer,
            codes::MORE_DATA => Self::MoreData,
            codes::INVALID_PARAMETER => Self::InvalidParameter,
            other => Self::Other(other),
        }
    }

    /// The raw code for this status.
    pub const fn raw(self) -> u32 {
        match self {
            Self::Success => codes::SUCCESS,
            Self::Pending => codes::IO_PENDING,
            Self::InsufficientBuffer => codes::INSUFFICIENT_BUFFER,
            Self::MoreData => codes::MORE_DATA,
            Self::InvalidParameter => codes::INVALID_PARAMETER,
            Self::Other(code) => code,
        }
    }

    /// Statuses that report an invalidated continuation id when the
    /// receive carried one.
    #[inline]
    pub const fn is_stolen_id(self) -> bool {
        matches!(self, Self::InvalidParameter | Self::Other(codes::CONNECTION_INVALID))
    }

    /// Statuses the completion handler treats as "not an error".
    #[inline]
    pub const fn is_completion_ok(self) -> bool {
        matches!(self, Self::Success | Self::MoreData)
    }
}

impl fmt::Display for ReceiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Pending => write!(f, "pending"),
            Self::InsufficientBuffer => write!(f, "insufficient buffer"),
            Self::MoreData => write!(f, "more data"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::Other(code) => write!(f, "status {}", code),
        }
    }
}

/// What a receive call (or a completion) reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveResult {
    pub status: ReceiveStatus,
    /// Bytes transferred on success, required size on insufficient buffer.
    pub bytes: u32,
}

impl ReceiveResult {
    #[inline]
    pub const fn new(status: ReceiveStatus, bytes: u32) -> Self {
        Self { status, bytes }
    }

    #[inline]
    pub const fn pending() -> Self {
        Self::new(ReceiveStatus::Pending, 0)
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.status == ReceiveStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_mapping() {
        assert_eq!(ReceiveStatus::from_raw(0), ReceiveStatus::Success);
        assert_eq!(ReceiveStatus::from_raw(997), ReceiveStatus::Pending);
        assert_eq!(ReceiveStatus::from_raw(122), ReceiveStatus::InsufficientBuffer);
        assert_eq!(ReceiveStatus::from_raw(234), ReceiveStatus::MoreData);
        assert_eq!(ReceiveStatus::from_raw(87), ReceiveStatus::InvalidParameter);
        assert_eq!(ReceiveStatus::from_raw(1229), ReceiveStatus::Other(1229));
        assert_eq!(ReceiveStatus::Other(995).raw(), codes::OPERATION_ABORTED);
        assert_eq!(ReceiveStatus::MoreData.raw(), codes::MORE_DATA);
    }

    #[test]
    fn test_completion_ok() {
        assert!(ReceiveStatus::Success.is_completion_ok());
        assert!(ReceiveStatus::MoreData.is_completion_ok());
        assert!(!ReceiveStatus::Pending.is_completion_ok());
        assert!(!ReceiveStatus::Other(1).is_completion_ok());
        assert!(ReceiveStatus::InvalidParameter.is_stolen_id());
        assert!(ReceiveStatus::from_raw(codes::CONNECTION_INVALID).is_stolen_id());
        assert!(!ReceiveStatus::Other(codes::OPERATION_ABORTED).is_stolen_id());
    }
}
