//! `BasicPolicy`: default `RequestPolicy` implementation.
//!
//! Request validation checks the shape of the request line only:
//! non-empty, under a size cap, CRLF terminated, with an upper-case
//! method token. Anything else is a bad request.
//!
//! Auth validation is optional. When required, an unauthenticated request
//! gets a challenge response (401 by default) and is not dispatched.

use kaccept_core::id::RequestId;
use kaccept_core::native::{header_flags, NativeRequest};
use kaccept_core::policy::{ErrorResponder, RequestPolicy, ValidationError};

use std::sync::Arc;

/// Default max request payload (64 KiB).
const DEFAULT_MAX_REQUEST_BYTES: usize = 64 * 1024;

pub struct BasicPolicy<R: ErrorResponder> {
    responder: Arc<R>,
    max_request_bytes: usize,
    require_auth: bool,
    challenge_status: u16,
}

impl<R: ErrorResponder> BasicPolicy<R> {
    pub fn new(responder: Arc<R>) -> Self {
        Self {
            responder,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            require_auth: false,
            challenge_status: 401,
        }
    }

    pub fn max_request_bytes(mut self, n: usize) -> Self {
        self.max_request_bytes = n;
        self
    }

    pub fn require_auth(mut self, enable: bool) -> Self {
        self.require_auth = enable;
        self
    }

    pub fn challenge_status(mut self, status: u16) -> Self {
        self.challenge_status = status;
        self
    }
}

fn check_request_line(bytes: &[u8]) -> Result<(), ValidationError> {
    let line_end = bytes
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or_else(|| ValidationError::new("request line not terminated"))?;
    let line = &bytes[..line_end];

    let method_end = line
        .iter()
        .position(|&b| b == b' ')
        .ok_or_else(|| ValidationError::new("missing request target"))?;
    let method = &line[..method_end];
    if method.is_empty() || !method.iter().all(u8::is_ascii_uppercase) {
        return Err(ValidationError::new("malformed method"));
    }
    if line[method_end + 1..].is_empty() {
        return Err(ValidationError::new("missing request target"));
    }
    Ok(())
}

impl<R: ErrorResponder> RequestPolicy for BasicPolicy<R> {
    fn validate_request(&self, request: &NativeRequest) -> Result<bool, ValidationError> {
        let bytes = request.bytes();
        if bytes.is_empty() {
            return Err(ValidationError::new("empty request"));
        }
        if bytes.len() > self.max_request_bytes {
            return Err(ValidationError::new(format!(
                "request of {} bytes exceeds {}",
                bytes.len(),
                self.max_request_bytes
            )));
        }
        check_request_line(bytes)?;
        Ok(true)
    }

    fn validate_auth(&self, request: &NativeRequest) -> Result<bool, ValidationError> {
        if !self.require_auth || request.flags() & header_flags::AUTHENTICATED != 0 {
            return Ok(true);
        }
        tracing::debug!(id = %request.id(), "challenging unauthenticated request");
        self.responder.send_error(request.id(), self.challenge_status);
        Ok(false)
    }

    fn send_error(&self, id: RequestId, status: u16) {
        self.responder.send_error(id, status);
    }
}
