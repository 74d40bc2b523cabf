//! Late initialisation of accepted requests.

use crate::error::Result;
use crate::native::NativeRequest;

/// Turns a validated native request into what the consumer receives.
///
/// Runs once per accepted request, on the completion thread, after the
/// request has been detached from the accept cycle.
pub trait RequestFactory: Send + Sync + 'static {
    type Request: Send + 'static;

    fn create(&self, native: NativeRequest) -> Result<Self::Request>;
}

/// Hands the native request through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl RequestFactory for Passthrough {
    type Request = NativeRequest;

    #[inline]
    fn create(&self, native: NativeRequest) -> Result<NativeRequest> {
        Ok(native)
    }
}
