//! Request validation policy.

use core::fmt;

use crate::id::RequestId;
use crate::native::NativeRequest;

/// A request rejected by validation.
///
/// Raised (returned as `Err`) by a policy when the request is unusable;
/// the accept cycle answers the client with a 400-class status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub reason: String,
}

impl ValidationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid request: {}", self.reason)
    }
}

impl std::error::Error for ValidationError {}

/// Sends error responses for requests the application never sees.
pub trait ErrorResponder: Send + Sync {
    fn send_error(&self, id: RequestId, status: u16);
}

/// Listener policy consulted by the completion handler.
///
/// Both validators return:
/// - `Ok(true)`: accept;
/// - `Ok(false)`: not accepted, nothing raised (e.g. an auth challenge was
///   already sent); the cycle quietly receives the next request;
/// - `Err(_)`: malformed; the cycle sends a 400 and fails the accept.
///
/// Runs on the completion thread; keep it short.
pub trait RequestPolicy: Send + Sync {
    fn validate_request(&self, request: &NativeRequest) -> Result<bool, ValidationError>;

    fn validate_auth(&self, request: &NativeRequest) -> Result<bool, ValidationError>;

    fn send_error(&self, id: RequestId, status: u16);
}
