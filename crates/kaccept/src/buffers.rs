//! Native Buffer Lifecycle Manager.
//!
//! Owns the cycle's single native request + overlapped descriptor pair.
//! There is no lock around the pair; ownership moves between parties
//! through one atomic slot state:
//!
//! ```text
//!   FREE ──claim──► HELD ──lend──► LENT (OS owns it for one receive)
//!    ▲               │  ◄─reclaim──┘
//!    └──guard drop───┘
//! ```
//!
//! `claim` is used by `accept_next` and by teardown, `reclaim` by the
//! retry loop for synchronous statuses and by the completion handler for
//! callbacks. Whoever holds a `SlotGuard` may touch the pair.

use kaccept_core::buffer::BufferProvider;
use kaccept_core::error::{AcceptError, Result};
use kaccept_core::id::RequestId;
use kaccept_core::native::{NativeRequest, HEADER_SIZE};
use kaccept_core::overlapped::{IoCompletion, OverlappedHandle, OverlappedToken};
use kaccept_core::queue::RequestQueue;

use crate::bridge::Version;
use crate::stats::CycleStats;

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

const FREE: u8 = 0;
const HELD: u8 = 1;
const LENT: u8 = 2;

#[derive(Default)]
struct Pair {
    request: Option<NativeRequest>,
    overlapped: Option<OverlappedHandle>,
    /// Bridge version this pair is receiving for.
    version: Version,
}

/// Unpin, free descriptor, free buffer. Safe on an empty pair.
fn release_pair(pair: &mut Pair, queue: &dyn RequestQueue) {
    if let Some(request) = pair.request.as_mut() {
        request.unpin();
    }
    if let Some(overlapped) = pair.overlapped.take() {
        queue.free_overlapped(overlapped);
    }
    if let Some(request) = pair.request.take() {
        tracing::trace!(size = request.size(), "native request released");
    }
}

pub struct NativeBuffers {
    state: AtomicU8,
    closed: AtomicBool,
    /// Token of the descriptor while LENT.
    inflight: AtomicU32,
    pair: UnsafeCell<Pair>,
    queue: Arc<dyn RequestQueue>,
    provider: Arc<dyn BufferProvider>,
    target: Weak<dyn IoCompletion>,
    default_size: usize,
    stats: Arc<CycleStats>,
}

// Safety: `pair` is only accessed through a SlotGuard (state HELD) or
// with `&mut self`.
unsafe impl Send for NativeBuffers {}
unsafe impl Sync for NativeBuffers {}

impl NativeBuffers {
    pub fn new(
        queue: Arc<dyn RequestQueue>,
        provider: Arc<dyn BufferProvider>,
        target: Weak<dyn IoCompletion>,
        default_size: usize,
        stats: Arc<CycleStats>,
    ) -> Self {
        Self {
            state: AtomicU8::new(FREE),
            closed: AtomicBool::new(false),
            inflight: AtomicU32::new(OverlappedToken::NONE.0),
            pair: UnsafeCell::new(Pair::default()),
            queue,
            provider,
            target,
            default_size,
            stats,
        }
    }

    /// FREE → HELD.
    pub fn claim(&self) -> Option<SlotGuard<'_>> {
        self.state
            .compare_exchange(FREE, HELD, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SlotGuard { buffers: self })
    }

    /// LENT → HELD, taking the pair back from the OS.
    pub fn reclaim(&self) -> Option<SlotGuard<'_>> {
        self.state
            .compare_exchange(LENT, HELD, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        self.inflight.store(OverlappedToken::NONE.0, Ordering::SeqCst);
        Some(SlotGuard { buffers: self })
    }

    /// Whether the pair is currently lent to the OS.
    pub fn is_lent(&self) -> bool {
        self.state.load(Ordering::SeqCst) == LENT
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark closed. From here on every guard drop releases the pair.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    /// Teardown after `mark_closed`: release the pair if free, cancel the
    /// receive if lent. A held pair is released by its guard.
    pub fn release_or_cancel(&self) {
        self.drain();
        if self.is_lent() {
            self.cancel_inflight();
        }
    }

    /// Called by the issuer after a receive went pending: if teardown
    /// raced with the receive, make sure it gets cancelled.
    pub fn cancel_if_closed(&self) {
        if self.is_closed() {
            self.cancel_inflight();
        }
    }

    fn cancel_inflight(&self) {
        let token = OverlappedToken(self.inflight.load(Ordering::SeqCst));
        if token != OverlappedToken::NONE {
            tracing::debug!(?token, "cancelling in-flight receive");
            self.queue.cancel(token);
        }
    }

    fn drain(&self) {
        if self
            .state
            .compare_exchange(FREE, HELD, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // Safety: we moved the slot to HELD.
            release_pair(unsafe { &mut *self.pair.get() }, &*self.queue);
            self.state.store(FREE, Ordering::SeqCst);
        }
    }
}

impl Drop for NativeBuffers {
    fn drop(&mut self) {
        release_pair(self.pair.get_mut(), &*self.queue);
    }
}

/// Exclusive ownership of the pair. Dropping it hands the slot back.
pub struct SlotGuard<'a> {
    buffers: &'a NativeBuffers,
}

/// What the issuer needs once the pair is lent.
pub struct Lent {
    pub overlapped: OverlappedHandle,
    pub continue_id: RequestId,
}

impl<'a> SlotGuard<'a> {
    fn pair(&self) -> &Pair {
        // Safety: slot is HELD by this guard.
        unsafe { &*self.buffers.pair.get() }
    }

    fn pair_mut(&mut self) -> &mut Pair {
        // Safety: slot is HELD by this guard.
        unsafe { &mut *self.buffers.pair.get() }
    }

    pub fn is_closed(&self) -> bool {
        self.buffers.is_closed()
    }

    pub fn version(&self) -> Version {
        self.pair().version
    }

    pub fn set_version(&mut self, version: Version) {
        self.pair_mut().version = version;
    }

    pub fn has_request(&self) -> bool {
        self.pair().request.is_some()
    }

    pub fn request(&self) -> Option<&NativeRequest> {
        self.pair().request.as_ref()
    }

    pub fn request_mut(&mut self) -> Option<&mut NativeRequest> {
        self.pair_mut().request.as_mut()
    }

    /// Id in the posted buffer's header, `NEW` if none is posted.
    pub fn request_id(&self) -> RequestId {
        self.request().map(NativeRequest::id).unwrap_or(RequestId::NEW)
    }

    /// Release the current pair, then post a fresh buffer of
    /// `max(size_hint or default, HEADER_SIZE)` bytes continuing
    /// `continue_id`.
    pub fn allocate(&mut self, size_hint: Option<usize>, continue_id: RequestId) -> Result<()> {
        self.release();
        let buffers = self.buffers;
        let size = size_hint.unwrap_or(buffers.default_size).max(HEADER_SIZE);

        let request = NativeRequest::allocate(buffers.provider.clone(), size, continue_id)?;
        let overlapped = buffers
            .queue
            .alloc_overlapped(request.buffer(), buffers.target.clone())?;

        tracing::trace!(size, id = %continue_id, token = overlapped.token().0, "native request allocated");
        buffers.stats.reallocation();
        let pair = self.pair_mut();
        pair.request = Some(request);
        pair.overlapped = Some(overlapped);
        Ok(())
    }

    /// Idempotent; safe with nothing allocated.
    pub fn release(&mut self) {
        let buffers = self.buffers;
        release_pair(self.pair_mut(), &*buffers.queue);
    }

    /// Move the request out and free its descriptor. The next
    /// `allocate` starts from an empty pair.
    pub fn detach(&mut self) -> Option<NativeRequest> {
        let buffers = self.buffers;
        let pair = self.pair_mut();
        if let Some(overlapped) = pair.overlapped.take() {
            buffers.queue.free_overlapped(overlapped);
        }
        let mut request = pair.request.take()?;
        request.unpin();
        Some(request)
    }

    /// Rewrite the continuation id of the posted buffer.
    pub fn set_continue_id(&mut self, id: RequestId) {
        if let Some(request) = self.request_mut() {
            request.set_id(id);
        }
    }

    /// HELD → LENT. The guard is consumed without handing the slot back;
    /// ownership returns through `NativeBuffers::reclaim`.
    pub fn lend(self) -> Result<Lent> {
        let pair = self.pair();
        let (Some(overlapped), Some(request)) = (pair.overlapped.clone(), pair.request.as_ref()) else {
            return Err(AcceptError::Invariant("lend without a posted buffer"));
        };
        let continue_id = request.id();
        let buffers = self.buffers;
        buffers.inflight.store(overlapped.token().0, Ordering::SeqCst);
        if buffers
            .state
            .compare_exchange(HELD, LENT, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::error!("slot not held while lending");
            return Err(AcceptError::Invariant("slot not held while lending"));
        }
        std::mem::forget(self);
        Ok(Lent { overlapped, continue_id })
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.buffers.state.store(FREE, Ordering::SeqCst);
        if self.buffers.is_closed() {
            self.buffers.drain();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kaccept_core::status::ReceiveStatus;
    use kaccept_module::{LoopbackConfig, LoopbackQueue, MallocBuffers};

    struct Nobody;

    impl IoCompletion for Nobody {
        fn io_completed(&self, _status: ReceiveStatus, _bytes: u32) {}
    }

    fn setup() -> (Arc<LoopbackQueue>, Arc<MallocBuffers>, Arc<Nobody>, NativeBuffers) {
        let queue = Arc::new(LoopbackQueue::new(LoopbackConfig::default()).unwrap());
        let provider = Arc::new(MallocBuffers::new());
        let target = Arc::new(Nobody);
        let weak: Weak<dyn IoCompletion> = Arc::downgrade(&target) as Weak<dyn IoCompletion>;
        let buffers = NativeBuffers::new(
            queue.clone(),
            provider.clone(),
            weak,
            256,
            Arc::new(CycleStats::default()),
        );
        (queue, provider, target, buffers)
    }

    #[test]
    fn test_allocate_releases_previous_first() {
        let (queue, provider, _t, buffers) = setup();
        let mut guard = buffers.claim().unwrap();
        guard.allocate(None, RequestId::NEW).unwrap();
        assert_eq!(guard.request().unwrap().size(), 256);
        guard.allocate(Some(1000), RequestId::new(5)).unwrap();
        assert_eq!(guard.request().unwrap().size(), 1000);
        assert_eq!(guard.request_id(), RequestId::new(5));
        assert_eq!(provider.in_use(), 1);
        assert_eq!(provider.released(), 1);
        assert_eq!(queue.live_descriptors(), 1);
    }

    #[test]
    fn test_minimum_is_header_size() {
        let (_q, _p, _t, buffers) = setup();
        let mut guard = buffers.claim().unwrap();
        guard.allocate(Some(1), RequestId::NEW).unwrap();
        assert_eq!(guard.request().unwrap().size(), HEADER_SIZE);
    }

    #[test]
    fn test_release_is_idempotent() {
        let (queue, provider, _t, buffers) = setup();
        let mut guard = buffers.claim().unwrap();
        guard.release();
        guard.allocate(None, RequestId::NEW).unwrap();
        guard.release();
        guard.release();
        assert_eq!(provider.in_use(), 0);
        assert_eq!(provider.released(), 1);
        assert_eq!(queue.live_descriptors(), 0);
    }

    #[test]
    fn test_detach_transfers_ownership() {
        let (queue, provider, _t, buffers) = setup();
        let mut guard = buffers.claim().unwrap();
        guard.allocate(None, RequestId::NEW).unwrap();
        let request = guard.detach().unwrap();
        assert!(!request.is_pinned());
        assert!(!guard.has_request());
        assert_eq!(queue.live_descriptors(), 0);

        guard.allocate(None, RequestId::NEW).unwrap();
        assert_eq!(provider.in_use(), 2);
        drop(request);
        assert_eq!(provider.in_use(), 1);
    }

    #[test]
    fn test_ownership_transitions() {
        let (_q, _p, _t, buffers) = setup();
        let mut guard = buffers.claim().unwrap();
        assert!(buffers.claim().is_none());
        assert!(buffers.reclaim().is_none());

        guard.allocate(None, RequestId::NEW).unwrap();
        let lent = guard.lend().unwrap();
        assert!(buffers.is_lent());
        assert!(buffers.claim().is_none());
        assert_eq!(lent.continue_id, RequestId::NEW);

        let guard = buffers.reclaim().unwrap();
        assert!(buffers.reclaim().is_none());
        drop(guard);
        assert!(buffers.claim().is_some());
    }

    #[test]
    fn test_lend_without_buffer_is_invariant() {
        let (_q, _p, _t, buffers) = setup();
        let guard = buffers.claim().unwrap();
        assert!(matches!(guard.lend(), Err(AcceptError::Invariant(_))));
        assert!(buffers.claim().is_some());
    }

    #[test]
    fn test_close_releases_free_pair_and_guard_on_drop() {
        let (queue, provider, _t, buffers) = setup();
        {
            let mut guard = buffers.claim().unwrap();
            guard.allocate(None, RequestId::NEW).unwrap();
        }
        assert_eq!(provider.in_use(), 1);
        assert!(buffers.mark_closed());
        assert!(!buffers.mark_closed());
        buffers.release_or_cancel();
        assert_eq!(provider.in_use(), 0);
        assert_eq!(queue.live_descriptors(), 0);

        let mut guard = buffers.claim().unwrap();
        guard.allocate(None, RequestId::NEW).unwrap();
        drop(guard);
        assert_eq!(provider.in_use(), 0);
    }
}
