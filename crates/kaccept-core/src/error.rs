//! kaccept error types.

use thiserror::Error;

use crate::policy::ValidationError;
use crate::status::ReceiveStatus;

#[derive(Debug, Error)]
pub enum AcceptError {
    /// The request queue reported a fatal status.
    #[error("receive failed: {0}")]
    Os(ReceiveStatus),
    /// The request failed validation; a 400 was sent to the client.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// No native buffer of the requested size could be allocated.
    #[error("out of native buffers ({requested} bytes requested)")]
    OutOfBuffers { requested: usize },
    /// No overlapped descriptor could be allocated.
    #[error("out of overlapped descriptors")]
    OutOfDescriptors,
    /// Late initialisation of the accepted request failed.
    #[error("request init failed: {0}")]
    Init(String),
    /// An accept is already outstanding on this cycle.
    #[error("accept already in progress")]
    Busy,
    /// The accept cycle was disposed.
    #[error("accept cycle disposed")]
    Disposed,
    /// Internal protocol violated. A defect, not a runtime condition.
    #[error("invariant violated: {0}")]
    Invariant(&'static str),
    /// Completion handling panicked.
    #[error("completion handler panicked: {0}")]
    Panicked(String),
}

impl AcceptError {
    /// Whether the failure is specific to one request and the owner
    /// should simply start the next accept.
    pub fn is_per_request(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Init(_))
    }
}

pub type Result<T> = std::result::Result<T, AcceptError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = AcceptError::Os(ReceiveStatus::Other(1229));
        assert_eq!(e.to_string(), "receive failed: status 1229");

        let e: AcceptError = ValidationError::new("empty request").into();
        assert_eq!(e.to_string(), "invalid request: empty request");
        assert!(e.is_per_request());

        let e = AcceptError::OutOfBuffers { requested: 4096 };
        assert_eq!(e.to_string(), "out of native buffers (4096 bytes requested)");
        assert!(!e.is_per_request());
    }
}
