//! Accept Retry State Machine.
//!
//! Issues the receive and loops on the statuses that are recovered
//! locally. Returns once the receive is with the OS, or once a
//! synchronous completion has been handled inline.

use kaccept_core::error::{AcceptError, Result};
use kaccept_core::factory::RequestFactory;
use kaccept_core::id::RequestId;
use kaccept_core::status::ReceiveStatus;

use crate::buffers::SlotGuard;
use crate::cycle::CycleInner;
use crate::handler::Step;

impl<F: RequestFactory> CycleInner<F> {
    /// Drive receives on the pair held by `guard`.
    ///
    /// `Err` means the accept is over; the caller fails the bridge. The
    /// pair has been released by then.
    pub(crate) fn begin_receive<'a>(&'a self, guard: SlotGuard<'a>) -> Result<()> {
        let mut guard = guard;
        loop {
            if guard.is_closed() {
                guard.release();
                return Err(AcceptError::Disposed);
            }

            let lent = guard.lend()?;
            let result = self.queue.receive(lent.continue_id, &lent.overlapped);
            tracing::trace!(id = %lent.continue_id, status = %result.status, bytes = result.bytes, "receive");

            if result.is_pending() {
                self.buffers.cancel_if_closed();
                return Ok(());
            }
            if result.status == ReceiveStatus::Success && !self.queue.skips_callback_on_success() {
                return Ok(());
            }

            guard = self
                .buffers
                .reclaim()
                .ok_or(AcceptError::Invariant("synchronous status without slot ownership"))?;

            match result.status {
                ReceiveStatus::Success => match self.handle_guarded(guard, ReceiveStatus::Success, result.bytes) {
                    Step::Done => return Ok(()),
                    Step::Rearm(next) => guard = next,
                },
                ReceiveStatus::InsufficientBuffer | ReceiveStatus::MoreData => {
                    let id = guard.request_id();
                    tracing::debug!(%id, required = result.bytes, "insufficient buffer, reallocating");
                    self.stats.insufficient_retry();
                    guard.allocate(Some(result.bytes as usize), id)?;
                }
                status if status.is_stolen_id() && !lent.continue_id.is_new() => {
                    tracing::debug!(id = %lent.continue_id, "continuation id rejected, retrying as new");
                    self.stats.collision_retry();
                    guard.set_continue_id(RequestId::NEW);
                }
                status => {
                    guard.release();
                    return Err(AcceptError::Os(status));
                }
            }
        }
    }
}
