//! OS request queue abstraction.
//!
//! A `RequestQueue` is the kernel listener: it owns the queue handle,
//! issues the non-blocking "receive next request" call, and binds
//! overlapped descriptors to buffers.
//!
//! # Implementors
//!
//! - `LoopbackQueue` (`kaccept-module`): in-process queue fed by
//!   `push_request()`, completions raised from a dedicated thread.

use std::sync::Weak;

use crate::buffer::NativeBuffer;
use crate::error::Result;
use crate::id::RequestId;
use crate::overlapped::{IoCompletion, OverlappedHandle, OverlappedToken};
use crate::status::ReceiveResult;

/// Non-blocking request receive + descriptor management.
///
/// **Contract:**
/// - `receive()` must NEVER block. It writes into `overlapped.buffer()`
///   and returns one of:
///   - `Success`: request received. If `skips_callback_on_success()` is
///     true no completion follows; otherwise one does.
///   - `Pending`: exactly one completion follows via `overlapped.complete()`.
///   - `InsufficientBuffer`: nothing follows; `bytes` is the required size
///     and the request id has been written into the header.
///   - `InvalidParameter`, `Other`: nothing follows.
///   `MoreData` should only be reported through completions.
/// - Completions carry `Success`, `MoreData` (header written, `bytes` is the
///   size hint) or an error status.
/// - `cancel()` is idempotent; a cancelled in-flight receive completes with
///   an error status (`codes::OPERATION_ABORTED`). Once `cancel()` returns
///   the queue no longer writes into the buffer.
pub trait RequestQueue: Send + Sync {
    /// Begin receiving the next request (or continue `continue_id`).
    fn receive(&self, continue_id: RequestId, overlapped: &OverlappedHandle) -> ReceiveResult;

    /// Bind a new descriptor to `buffer`, completing into `target`.
    ///
    /// Returns `AcceptError::OutOfDescriptors` when the OS is out of them.
    fn alloc_overlapped(
        &self,
        buffer: NativeBuffer,
        target: Weak<dyn IoCompletion>,
    ) -> Result<OverlappedHandle>;

    /// Free a descriptor. It must not be in flight.
    fn free_overlapped(&self, overlapped: OverlappedHandle);

    /// Abort the in-flight receive using `token`, if any.
    fn cancel(&self, token: OverlappedToken);

    /// Whether synchronous `Success` skips the completion callback.
    fn skips_callback_on_success(&self) -> bool {
        true
    }
}
