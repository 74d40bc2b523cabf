//! Completion Handler.
//!
//! Interprets one completion `(status, bytes)` for the pair held by a
//! `SlotGuard`. Runs on the OS completion thread, or inline on the
//! issuing thread when the queue skips callbacks for synchronous success.
//! Nothing escapes it: errors and panics become bridge failures.

use kaccept_core::error::AcceptError;
use kaccept_core::factory::RequestFactory;
use kaccept_core::id::RequestId;
use kaccept_core::overlapped::IoCompletion;
use kaccept_core::status::ReceiveStatus;

use crate::bridge::Version;
use crate::buffers::SlotGuard;
use crate::cycle::CycleInner;

use std::panic::{catch_unwind, AssertUnwindSafe};

/// What the caller does after a completion was handled.
pub(crate) enum Step<'a> {
    /// The bridge was resolved or failed, or the cycle is closed.
    Done,
    /// A fresh buffer is posted; issue the next receive.
    Rearm(SlotGuard<'a>),
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<F: RequestFactory> CycleInner<F> {
    /// `handle` with panics converted to a bridge failure.
    pub(crate) fn handle_guarded<'a>(&'a self, guard: SlotGuard<'a>, status: ReceiveStatus, bytes: u32) -> Step<'a> {
        let version = guard.version();
        match catch_unwind(AssertUnwindSafe(|| self.handle(guard, status, bytes))) {
            Ok(step) => step,
            Err(payload) => {
                self.recover_from_panic(version, panic_message(&*payload));
                Step::Done
            }
        }
    }

    fn recover_from_panic(&self, version: Version, message: String) {
        tracing::error!(version, %message, "completion handling panicked");
        // The guard was dropped while unwinding, or the pair was lent to a
        // receive that panicked before it reached the OS. Discard either way.
        if let Some(mut guard) = self.buffers.claim().or_else(|| self.buffers.reclaim()) {
            guard.release();
        }
        let failed = catch_unwind(AssertUnwindSafe(|| self.fail(version, AcceptError::Panicked(message))));
        if failed.is_err() {
            tracing::error!(version, "failing the bridge after a panic panicked");
        }
    }

    fn handle<'a>(&'a self, mut guard: SlotGuard<'a>, status: ReceiveStatus, bytes: u32) -> Step<'a> {
        let version = guard.version();
        if guard.is_closed() {
            guard.release();
            return Step::Done;
        }

        if !status.is_completion_ok() {
            guard.release();
            drop(guard);
            self.fail(version, AcceptError::Os(status));
            return Step::Done;
        }
        if status == ReceiveStatus::MoreData {
            let id = guard.request_id();
            tracing::debug!(%id, required = bytes, "more data, reallocating");
            self.stats.insufficient_retry();
            return self.reallocate_and_rearm(guard, version, bytes as usize, id);
        }
        self.on_success(guard, version, bytes)
    }

    fn on_success<'a>(&'a self, mut guard: SlotGuard<'a>, version: Version, bytes: u32) -> Step<'a> {
        let Some(request) = guard.request_mut() else {
            drop(guard);
            self.fail(version, AcceptError::Invariant("completion without a posted request"));
            return Step::Done;
        };
        request.set_transferred(bytes as usize);
        let id = request.id();
        let size = request.size();

        let verdict = match self.policy.validate_request(request) {
            Ok(true) => self.policy.validate_auth(request),
            other => other,
        };

        match verdict {
            Ok(true) => {
                let Some(native) = guard.detach() else {
                    drop(guard);
                    self.fail(version, AcceptError::Invariant("detach without a posted request"));
                    return Step::Done;
                };
                let created = self.factory.create(native);
                drop(guard);
                match created {
                    Ok(request) => {
                        tracing::debug!(%id, bytes, "request accepted");
                        self.stats.accepted();
                        self.resolve(version, request);
                    }
                    Err(e) => self.fail(version, e),
                }
                Step::Done
            }
            Ok(false) => {
                tracing::debug!(%id, "request not dispatched, re-arming");
                self.stats.challenge();
                self.reallocate_and_rearm(guard, version, size, RequestId::NEW)
            }
            Err(e) => {
                tracing::debug!(%id, reason = %e.reason, "request rejected");
                self.policy.send_error(id, self.config.bad_request_status);
                if let Err(alloc) = guard.allocate(Some(size), RequestId::NEW) {
                    tracing::warn!(%alloc, "no fresh buffer after rejected request");
                }
                drop(guard);
                self.fail(version, AcceptError::Validation(e));
                Step::Done
            }
        }
    }

    fn reallocate_and_rearm<'a>(
        &'a self,
        mut guard: SlotGuard<'a>,
        version: Version,
        size: usize,
        id: RequestId,
    ) -> Step<'a> {
        match guard.allocate(Some(size), id) {
            Ok(()) => Step::Rearm(guard),
            Err(e) => {
                drop(guard);
                self.fail(version, e);
                Step::Done
            }
        }
    }
}

impl<F: RequestFactory> IoCompletion for CycleInner<F> {
    fn io_completed(&self, status: ReceiveStatus, bytes: u32) {
        let Some(guard) = self.buffers.reclaim() else {
            tracing::warn!(%status, bytes, "completion for a pair that is not lent");
            return;
        };
        let version = guard.version();
        if let Step::Rearm(guard) = self.handle_guarded(guard, status, bytes) {
            tracing::trace!(version, "re-arming receive");
            let rearmed = catch_unwind(AssertUnwindSafe(|| self.begin_receive(guard)));
            match rearmed {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self.fail(version, e),
                Err(payload) => self.recover_from_panic(version, panic_message(&*payload)),
            }
        }
    }
}
