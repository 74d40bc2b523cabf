//! Completion Source Bridge.
//!
//! A single-assignment, resettable, versioned result slot. The producer
//! (an OS completion thread or the issuing thread) resolves it once per
//! version; the consumer awaits a `CompletionFuture` for that version.
//!
//! The whole protocol lives in one state word:
//!
//! ```text
//!   version << 2 | phase
//!
//!   IDLE ──reset──► PENDING ──resolve──► RESOLVING ──► READY ──take──► IDLE
//!                     (v+1)                 (v)          (v)          (v)
//! ```
//!
//! `RESOLVING` is transient: it guards the value cell while a producer
//! writes it or the consumer takes it. Only the `PENDING → RESOLVING`
//! compare-and-swap admits a producer, so a version resolves exactly once.

use kaccept_core::error::{AcceptError, Result};

use futures::task::AtomicWaker;
use std::cell::UnsafeCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

pub type Version = u64;

const IDLE: u64 = 0;
const PENDING: u64 = 1;
const RESOLVING: u64 = 2;
const READY: u64 = 3;
const PHASE_MASK: u64 = 0b11;

#[inline]
const fn pack(version: Version, phase: u64) -> u64 {
    (version << 2) | phase
}

#[inline]
const fn version_of(word: u64) -> Version {
    word >> 2
}

#[inline]
const fn phase_of(word: u64) -> u64 {
    word & PHASE_MASK
}

/// Outcome of a `resolve`/`fail` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolve {
    /// The value was stored for this version.
    Accepted,
    /// The version is not the current one.
    Stale,
    /// The version was already resolved.
    AlreadyResolved,
    /// The bridge is closed; the value was dropped.
    Closed,
}

struct Slot<T> {
    state: AtomicU64,
    value: UnsafeCell<Option<Result<T>>>,
    waker: AtomicWaker,
    closed: AtomicBool,
    strict: bool,
}

// Safety: `value` is only touched by the party that moved the state word
// into RESOLVING.
unsafe impl<T: Send> Send for Slot<T> {}
unsafe impl<T: Send> Sync for Slot<T> {}

impl<T> Slot<T> {
    /// PENDING(v) → RESOLVING → READY. The only way a value gets in.
    fn store(&self, version: Version, result: Result<T>) -> std::result::Result<(), (u64, Result<T>)> {
        match self.state.compare_exchange(
            pack(version, PENDING),
            pack(version, RESOLVING),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // Safety: we own RESOLVING(v).
                unsafe { *self.value.get() = Some(result) };
                self.state.store(pack(version, READY), Ordering::Release);
                self.waker.wake();
                Ok(())
            }
            Err(current) => Err((current, result)),
        }
    }

    /// READY(v) → RESOLVING → IDLE, handing the value out.
    fn take(&self, version: Version) -> Option<Result<T>> {
        self.state
            .compare_exchange(
                pack(version, READY),
                pack(version, RESOLVING),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()?;
        // Safety: we own RESOLVING(v).
        let value = unsafe { (*self.value.get()).take() };
        self.state.store(pack(version, IDLE), Ordering::Release);
        Some(value.unwrap_or(Err(AcceptError::Invariant("ready slot without a value"))))
    }
}

/// Producer/owner side of the bridge.
pub struct CompletionSource<T> {
    slot: Arc<Slot<T>>,
}

impl<T: Send> CompletionSource<T> {
    pub fn new(strict: bool) -> Self {
        Self {
            slot: Arc::new(Slot {
                state: AtomicU64::new(pack(0, IDLE)),
                value: UnsafeCell::new(None),
                waker: AtomicWaker::new(),
                closed: AtomicBool::new(false),
                strict,
            }),
        }
    }

    /// Advance to a fresh pending version.
    ///
    /// Drops an unconsumed result of the previous version. Fails with
    /// `Busy` if the current version is still unresolved and with
    /// `Disposed` once closed.
    pub fn reset(&self) -> Result<Version> {
        loop {
            if self.slot.closed.load(Ordering::Acquire) {
                return Err(AcceptError::Disposed);
            }
            let current = self.slot.state.load(Ordering::Acquire);
            let version = version_of(current);
            match phase_of(current) {
                PENDING => return Err(AcceptError::Busy),
                RESOLVING => {
                    std::hint::spin_loop();
                    continue;
                }
                phase => {
                    let next = pack(version + 1, PENDING);
                    if phase == READY {
                        // Lock the cell before discarding what is in it.
                        if self
                            .slot
                            .state
                            .compare_exchange(current, pack(version, RESOLVING), Ordering::AcqRel, Ordering::Acquire)
                            .is_err()
                        {
                            continue;
                        }
                        // Safety: we own RESOLVING(v).
                        let stale = unsafe { (*self.slot.value.get()).take() };
                        self.slot.state.store(next, Ordering::SeqCst);
                        if stale.is_some() {
                            tracing::debug!(version, "dropped unconsumed completion");
                        }
                        return self.admit(version + 1);
                    }
                    if self
                        .slot
                        .state
                        .compare_exchange(current, next, Ordering::SeqCst, Ordering::Acquire)
                        .is_ok()
                    {
                        return self.admit(version + 1);
                    }
                }
            }
        }
    }

    /// Second look at `closed` once PENDING(version) is published. A
    /// `close` that ran before the transition found nothing to fail, so
    /// the version is failed here instead.
    fn admit(&self, version: Version) -> Result<Version> {
        if self.slot.closed.load(Ordering::SeqCst) {
            let _ = self.slot.store(version, Err(AcceptError::Disposed));
            return Err(AcceptError::Disposed);
        }
        Ok(version)
    }

    /// Future for the current version.
    pub fn begin_wait(&self) -> (CompletionFuture<T>, Version) {
        let version = version_of(self.slot.state.load(Ordering::Acquire));
        (
            CompletionFuture {
                slot: Some(self.slot.clone()),
                version,
                immediate: None,
            },
            version,
        )
    }

    /// Current version number.
    pub fn version(&self) -> Version {
        version_of(self.slot.state.load(Ordering::Acquire))
    }

    /// Whether the current version still awaits its result.
    pub fn is_pending(&self) -> bool {
        phase_of(self.slot.state.load(Ordering::Acquire)) == PENDING
    }

    pub fn resolve(&self, version: Version, value: T) -> Resolve {
        self.complete(version, Ok(value))
    }

    pub fn fail(&self, version: Version, error: AcceptError) -> Resolve {
        self.complete(version, Err(error))
    }

    fn complete(&self, version: Version, result: Result<T>) -> Resolve {
        if self.slot.closed.load(Ordering::Acquire) {
            tracing::trace!(version, "completion after close dropped");
            return Resolve::Closed;
        }
        match self.slot.store(version, result) {
            Ok(()) => Resolve::Accepted,
            Err((current, _dropped)) => {
                let outcome = if version_of(current) != version {
                    Resolve::Stale
                } else {
                    Resolve::AlreadyResolved
                };
                self.reject(version, current, outcome);
                outcome
            }
        }
    }

    fn reject(&self, version: Version, current: u64, outcome: Resolve) {
        if self.slot.closed.load(Ordering::Acquire) {
            return;
        }
        tracing::warn!(
            version,
            current_version = version_of(current),
            phase = phase_of(current),
            ?outcome,
            "completion rejected"
        );
        if self.slot.strict {
            panic!("completion bridge resolved twice or out of turn: {outcome:?} for version {version}");
        }
    }

    /// Teardown: fail the current version if unresolved, then ignore all
    /// further producers. Idempotent.
    pub fn close(&self, error: AcceptError) {
        if self.slot.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let current = self.slot.state.load(Ordering::SeqCst);
        if phase_of(current) == PENDING {
            let _ = self.slot.store(version_of(current), Err(error));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.slot.closed.load(Ordering::Acquire)
    }
}

/// Awaitable result of one accept.
///
/// Resolves to `Ok(request)` or the error that ended the cycle. The waker
/// is woken on the resolving thread.
pub struct CompletionFuture<T> {
    slot: Option<Arc<Slot<T>>>,
    version: Version,
    immediate: Option<AcceptError>,
}

impl<T: Send> CompletionFuture<T> {
    /// A future that fails at first poll.
    pub fn failed(error: AcceptError) -> Self {
        Self {
            slot: None,
            version: 0,
            immediate: Some(error),
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Block the calling thread until resolved.
    pub fn wait(self) -> Result<T> {
        futures::executor::block_on(self)
    }

    fn try_take(&self, slot: &Slot<T>) -> Option<Result<T>> {
        let current = slot.state.load(Ordering::Acquire);
        if version_of(current) != self.version {
            return Some(Err(AcceptError::Invariant("completion superseded by a newer accept")));
        }
        if phase_of(current) != READY {
            return None;
        }
        slot.take(self.version)
    }
}

impl<T: Send> Future for CompletionFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(error) = self.immediate.take() {
            return Poll::Ready(Err(error));
        }
        let Some(slot) = self.slot.clone() else {
            return Poll::Ready(Err(AcceptError::Invariant("completion future polled after ready")));
        };
        if let Some(result) = self.try_take(&slot) {
            self.slot = None;
            return Poll::Ready(result);
        }
        slot.waker.register(cx.waker());
        if let Some(result) = self.try_take(&slot) {
            self.slot = None;
            return Poll::Ready(result);
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_resolve_once() {
        let src = CompletionSource::<u32>::new(false);
        let v = src.reset().unwrap();
        let (fut, wv) = src.begin_wait();
        assert_eq!(v, wv);
        assert_eq!(src.resolve(v, 7), Resolve::Accepted);
        assert_eq!(src.resolve(v, 8), Resolve::AlreadyResolved);
        assert_eq!(fut.wait().unwrap(), 7);
    }

    #[test]
    fn test_stale_version_rejected() {
        let src = CompletionSource::<u32>::new(false);
        let v1 = src.reset().unwrap();
        assert_eq!(src.resolve(v1, 1), Resolve::Accepted);
        let v2 = src.reset().unwrap();
        assert_eq!(v2, v1 + 1);
        assert_eq!(src.resolve(v1, 2), Resolve::Stale);
        assert!(src.is_pending());
        let (fut, _) = src.begin_wait();
        src.fail(v2, AcceptError::Os(kaccept_core::ReceiveStatus::Other(1)));
        assert!(matches!(fut.wait(), Err(AcceptError::Os(_))));
    }

    #[test]
    fn test_reset_while_pending_is_busy() {
        let src = CompletionSource::<u32>::new(false);
        src.reset().unwrap();
        assert!(matches!(src.reset(), Err(AcceptError::Busy)));
    }

    #[test]
    #[should_panic(expected = "resolved twice")]
    fn test_strict_double_resolve_panics() {
        let src = CompletionSource::<u32>::new(true);
        let v = src.reset().unwrap();
        src.resolve(v, 1);
        src.resolve(v, 2);
    }

    #[test]
    fn test_close_fails_pending_and_silences_producers() {
        let src = CompletionSource::<u32>::new(true);
        let v = src.reset().unwrap();
        let (fut, _) = src.begin_wait();
        src.close(AcceptError::Disposed);
        src.close(AcceptError::Disposed);
        assert_eq!(src.resolve(v, 1), Resolve::Closed);
        assert!(matches!(fut.wait(), Err(AcceptError::Disposed)));
        assert!(matches!(src.reset(), Err(AcceptError::Disposed)));
    }

    #[test]
    fn test_close_racing_reset_never_strands_waiter() {
        for _ in 0..2000 {
            let src = CompletionSource::<u32>::new(true);
            let barrier = Barrier::new(2);
            let future = thread::scope(|s| {
                s.spawn(|| {
                    barrier.wait();
                    src.close(AcceptError::Disposed);
                });
                barrier.wait();
                match src.reset() {
                    Ok(_) => Some(src.begin_wait().0),
                    Err(e) => {
                        assert!(matches!(e, AcceptError::Disposed));
                        None
                    }
                }
            });
            if let Some(future) = future {
                assert!(matches!(future.now_or_never(), Some(Err(AcceptError::Disposed))));
            }
            assert_eq!(src.resolve(src.version(), 1), Resolve::Closed);
        }
    }

    #[test]
    fn test_resolve_from_other_thread_wakes_waiter() {
        let src = Arc::new(CompletionSource::<String>::new(false));
        let v = src.reset().unwrap();
        let (fut, _) = src.begin_wait();
        let producer = {
            let src = src.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                src.resolve(v, "done".to_string())
            })
        };
        assert_eq!(fut.wait().unwrap(), "done");
        assert_eq!(producer.join().unwrap(), Resolve::Accepted);
    }

    #[test]
    fn test_failed_future() {
        let fut = CompletionFuture::<u32>::failed(AcceptError::Busy);
        assert!(matches!(fut.wait(), Err(AcceptError::Busy)));
    }

    #[test]
    fn test_reset_drops_unconsumed_value() {
        let src = CompletionSource::<Arc<()>>::new(false);
        let marker = Arc::new(());
        let v = src.reset().unwrap();
        src.resolve(v, marker.clone());
        assert_eq!(Arc::strong_count(&marker), 2);
        src.reset().unwrap();
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}
