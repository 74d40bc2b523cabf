//! `LoopbackQueue`: in-process `RequestQueue` + `ErrorResponder`.
//!
//! Stands in for the kernel request queue. Clients `push_request()` raw
//! request bytes; receives copy them into the posted buffer as a
//! `RawRequestHeader` followed by the payload.
//!
//! Behavior mirrors the native queue:
//! - A receive with a backlog entry completes synchronously. With
//!   `sync_completion` on, `Success` is returned and no callback follows;
//!   otherwise `Success` is returned and a callback is also posted.
//! - A buffer too small for the request yields `InsufficientBuffer`
//!   (synchronous) or `MoreData` (callback) with the required size, and
//!   the request is stashed under its id until a receive continues it.
//! - Continuing an id that is not stashed yields `InvalidParameter`.
//! - A receive with no backlog parks until a request arrives or the
//!   descriptor is cancelled.
//!
//! Callbacks are delivered by a dedicated completion thread. Dropping the
//! queue stops it; undelivered completions are discarded.

use kaccept_core::buffer::NativeBuffer;
use kaccept_core::error::Result;
use kaccept_core::id::RequestId;
use kaccept_core::native::{header_flags, RawRequestHeader, HEADER_SIZE};
use kaccept_core::overlapped::{IoCompletion, OverlappedHandle, OverlappedToken};
use kaccept_core::policy::ErrorResponder;
use kaccept_core::queue::RequestQueue;
use kaccept_core::status::{codes, ReceiveResult, ReceiveStatus};

use crate::overlapped_table::OverlappedTable;

use crossbeam_queue::ArrayQueue;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Loopback queue configuration.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Report synchronous successes without a callback.
    pub sync_completion: bool,
    /// Max live overlapped descriptors.
    pub max_descriptors: u32,
    /// Capacity of the completion queue.
    pub completion_depth: usize,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            sync_completion: true,
            max_descriptors: 64,
            completion_depth: 256,
        }
    }
}

struct Queued {
    id: RequestId,
    data: Vec<u8>,
    flags: u32,
}

struct Completion {
    overlapped: OverlappedHandle,
    result: ReceiveResult,
}

#[derive(Default)]
struct QueueState {
    /// Requests not yet handed to any receive.
    backlog: VecDeque<Queued>,
    /// Requests that did not fit, keyed by id.
    stash: HashMap<u64, Queued>,
    /// Receive waiting for a request.
    parked: Option<OverlappedHandle>,
    /// Results returned verbatim by upcoming receives.
    injected: VecDeque<ReceiveStatus>,
}

struct LoopInner {
    table: OverlappedTable,
    state: Mutex<QueueState>,
    completions: ArrayQueue<Completion>,
    shutdown: AtomicBool,
    sync_completion: bool,
    next_id: AtomicU64,
    receives: AtomicU64,
    responses: Mutex<Vec<(RequestId, u16)>>,
}

impl LoopInner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn post(&self, overlapped: OverlappedHandle, result: ReceiveResult) {
        let mut item = Completion { overlapped, result };
        loop {
            match self.completions.push(item) {
                Ok(()) => return,
                Err(back) => {
                    item = back;
                    thread::yield_now();
                }
            }
        }
    }

    /// Copy `q` into the overlapped's buffer. Returns the status and byte
    /// count to report; a request that does not fit goes to the stash.
    fn deliver(&self, state: &mut QueueState, q: Queued, buffer: NativeBuffer, inline: bool) -> ReceiveResult {
        if buffer.len < HEADER_SIZE {
            return ReceiveResult::new(ReceiveStatus::InvalidParameter, 0);
        }
        let needed = HEADER_SIZE + q.data.len();
        let fits = buffer.len >= needed;
        let header = RawRequestHeader {
            request_id: q.id.as_u64(),
            bytes_received: if fits { q.data.len() as u32 } else { 0 },
            flags: q.flags,
        };
        // Safety: buffer is at least HEADER_SIZE bytes and lent to the queue.
        unsafe { core::ptr::write_unaligned(buffer.ptr as *mut RawRequestHeader, header) };

        if !fits {
            tracing::trace!(id = %q.id, needed, have = buffer.len, "request does not fit");
            state.stash.insert(q.id.as_u64(), q);
            let status = if inline {
                ReceiveStatus::InsufficientBuffer
            } else {
                ReceiveStatus::MoreData
            };
            return ReceiveResult::new(status, needed as u32);
        }

        // Safety: fits => payload region is inside the buffer.
        unsafe {
            core::ptr::copy_nonoverlapping(q.data.as_ptr(), buffer.ptr.add(HEADER_SIZE), q.data.len());
        }
        ReceiveResult::new(ReceiveStatus::Success, needed as u32)
    }
}

pub struct LoopbackQueue {
    inner: Arc<LoopInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackQueue {
    pub fn new(config: LoopbackConfig) -> std::io::Result<Self> {
        let inner = Arc::new(LoopInner {
            table: OverlappedTable::new(config.max_descriptors),
            state: Mutex::new(QueueState::default()),
            completions: ArrayQueue::new(config.completion_depth.max(1)),
            shutdown: AtomicBool::new(false),
            sync_completion: config.sync_completion,
            next_id: AtomicU64::new(1),
            receives: AtomicU64::new(0),
            responses: Mutex::new(Vec::new()),
        });

        let worker_inner = inner.clone();
        let handle = thread::Builder::new()
            .name("kaccept-loopback".into())
            .spawn(move || completion_loop(worker_inner))?;

        Ok(Self {
            inner,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Enqueue a client request. Returns the id the queue assigned.
    pub fn push_request(&self, data: impl Into<Vec<u8>>, authenticated: bool) -> RequestId {
        let id = RequestId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let q = Queued {
            id,
            data: data.into(),
            flags: if authenticated { header_flags::AUTHENTICATED } else { 0 },
        };

        let mut state = self.inner.state();
        match state.parked.take() {
            Some(overlapped) => {
                let result = self.inner.deliver(&mut state, q, overlapped.buffer(), false);
                drop(state);
                self.inner.post(overlapped, result);
            }
            None => state.backlog.push_back(q),
        }
        id
    }

    /// Make the next receive return `status` synchronously.
    ///
    /// Only non-pending statuses make sense here: no callback follows.
    pub fn fail_next(&self, status: ReceiveStatus) {
        self.inner.state().injected.push_back(status);
    }

    /// Error responses sent so far.
    pub fn responses(&self) -> Vec<(RequestId, u16)> {
        self.inner.responses.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Requests waiting for a receive.
    pub fn backlog(&self) -> usize {
        self.inner.state().backlog.len()
    }

    /// Whether a receive is parked.
    pub fn is_parked(&self) -> bool {
        self.inner.state().parked.is_some()
    }

    /// Receives issued so far.
    pub fn receives(&self) -> u64 {
        self.inner.receives.load(Ordering::Relaxed)
    }

    /// Overlapped descriptors currently bound.
    pub fn live_descriptors(&self) -> u32 {
        self.inner.table.live()
    }
}

impl RequestQueue for LoopbackQueue {
    fn receive(&self, continue_id: RequestId, overlapped: &OverlappedHandle) -> ReceiveResult {
        self.inner.receives.fetch_add(1, Ordering::Relaxed);
        let mut state = self.inner.state();

        if let Some(status) = state.injected.pop_front() {
            tracing::debug!(%status, "injected receive result");
            return ReceiveResult::new(status, 0);
        }

        let next = if continue_id.is_new() {
            state.backlog.pop_front()
        } else {
            match state.stash.remove(&continue_id.as_u64()) {
                Some(q) => Some(q),
                None => return ReceiveResult::new(ReceiveStatus::InvalidParameter, 0),
            }
        };

        let Some(q) = next else {
            if state.parked.is_some() {
                return ReceiveResult::new(ReceiveStatus::Other(codes::CONNECTION_INVALID), 0);
            }
            state.parked = Some(overlapped.clone());
            return ReceiveResult::pending();
        };

        let result = self.inner.deliver(&mut state, q, overlapped.buffer(), true);
        drop(state);
        if result.status == ReceiveStatus::Success && !self.inner.sync_completion {
            self.inner.post(overlapped.clone(), result);
        }
        result
    }

    fn alloc_overlapped(&self, buffer: NativeBuffer, target: Weak<dyn IoCompletion>) -> Result<OverlappedHandle> {
        self.inner.table.alloc(buffer, target)
    }

    fn free_overlapped(&self, overlapped: OverlappedHandle) {
        self.inner.table.free(overlapped);
    }

    fn cancel(&self, token: OverlappedToken) {
        let mut state = self.inner.state();
        let matches = state.parked.as_ref().is_some_and(|o| o.token() == token);
        if !matches {
            return;
        }
        if let Some(overlapped) = state.parked.take() {
            drop(state);
            tracing::debug!(?token, "cancelling parked receive");
            self.inner.post(
                overlapped,
                ReceiveResult::new(ReceiveStatus::Other(codes::OPERATION_ABORTED), 0),
            );
        }
    }

    fn skips_callback_on_success(&self) -> bool {
        self.inner.sync_completion
    }
}

impl ErrorResponder for LoopbackQueue {
    fn send_error(&self, id: RequestId, status: u16) {
        tracing::debug!(%id, status, "error response");
        self.inner
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, status));
    }
}

impl Drop for LoopbackQueue {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            // The last reference can go away inside a completion.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

fn completion_loop(inner: Arc<LoopInner>) {
    tracing::debug!("loopback completion thread started");
    loop {
        if let Some(c) = inner.completions.pop() {
            c.overlapped.complete(c.result.status, c.result.bytes);
            continue;
        }
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }
        thread::park_timeout(Duration::from_millis(1));
    }
    tracing::debug!(dropped = inner.completions.len(), "loopback completion thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use kaccept_core::buffer::BufferProvider;
    use crate::MallocBuffers;
    use std::sync::mpsc;

    struct Channel(Mutex<mpsc::Sender<(ReceiveStatus, u32)>>);

    impl IoCompletion for Channel {
        fn io_completed(&self, status: ReceiveStatus, bytes: u32) {
            let _ = self.0.lock().unwrap().send((status, bytes));
        }
    }

    fn setup(
        config: LoopbackConfig,
        size: usize,
    ) -> (LoopbackQueue, MallocBuffers, NativeBuffer, Arc<Channel>, mpsc::Receiver<(ReceiveStatus, u32)>) {
        let queue = LoopbackQueue::new(config).unwrap();
        let bufs = MallocBuffers::new();
        let buf = bufs.acquire(size).unwrap();
        let (tx, rx) = mpsc::channel();
        (queue, bufs, buf, Arc::new(Channel(Mutex::new(tx))), rx)
    }

    fn header(buf: NativeBuffer) -> RawRequestHeader {
        unsafe { core::ptr::read_unaligned(buf.ptr as *const RawRequestHeader) }
    }

    #[test]
    fn test_sync_success() {
        let (queue, bufs, buf, target, _rx) = setup(LoopbackConfig::default(), 256);
        let id = queue.push_request(&b"GET / HTTP/1.1\r\n\r\n"[..], false);
        let ovl = queue.alloc_overlapped(buf, Arc::downgrade(&target) as Weak<dyn IoCompletion>).unwrap();

        let r = queue.receive(RequestId::NEW, &ovl);
        assert_eq!(r.status, ReceiveStatus::Success);
        assert_eq!(r.bytes as usize, HEADER_SIZE + 18);
        assert_eq!(header(buf).request_id, id.as_u64());
        assert_eq!(header(buf).bytes_received, 18);

        queue.free_overlapped(ovl);
        assert_eq!(queue.live_descriptors(), 0);
        bufs.release(buf);
    }

    #[test]
    fn test_insufficient_then_continue() {
        let (queue, bufs, small, target, _rx) = setup(LoopbackConfig::default(), 32);
        let id = queue.push_request(vec![b'x'; 100], false);
        let weak = Arc::downgrade(&target) as Weak<dyn IoCompletion>;
        let ovl = queue.alloc_overlapped(small, weak.clone()).unwrap();

        let r = queue.receive(RequestId::NEW, &ovl);
        assert_eq!(r.status, ReceiveStatus::InsufficientBuffer);
        assert_eq!(r.bytes as usize, HEADER_SIZE + 100);
        assert_eq!(header(small).request_id, id.as_u64());
        queue.free_overlapped(ovl);

        let big = bufs.acquire(r.bytes as usize).unwrap();
        let ovl = queue.alloc_overlapped(big, weak).unwrap();
        let r = queue.receive(id, &ovl);
        assert_eq!(r.status, ReceiveStatus::Success);

        // Continuing twice is a stale id.
        let r = queue.receive(id, &ovl);
        assert_eq!(r.status, ReceiveStatus::InvalidParameter);

        queue.free_overlapped(ovl);
        bufs.release(small);
        bufs.release(big);
    }

    #[test]
    fn test_parked_receive_completes_on_push() {
        let (queue, bufs, buf, target, rx) = setup(LoopbackConfig::default(), 256);
        let ovl = queue.alloc_overlapped(buf, Arc::downgrade(&target) as Weak<dyn IoCompletion>).unwrap();

        assert!(queue.receive(RequestId::NEW, &ovl).is_pending());
        assert!(queue.is_parked());

        queue.push_request(&b"GET /a HTTP/1.1\r\n"[..], true);
        let (status, bytes) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(status, ReceiveStatus::Success);
        assert_eq!(bytes as usize, HEADER_SIZE + 17);
        assert_eq!(header(buf).flags, header_flags::AUTHENTICATED);

        queue.free_overlapped(ovl);
        bufs.release(buf);
    }

    #[test]
    fn test_cancel_parked() {
        let (queue, bufs, buf, target, rx) = setup(LoopbackConfig::default(), 64);
        let ovl = queue.alloc_overlapped(buf, Arc::downgrade(&target) as Weak<dyn IoCompletion>).unwrap();
        assert!(queue.receive(RequestId::NEW, &ovl).is_pending());

        queue.cancel(ovl.token());
        let (status, _) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(status, ReceiveStatus::Other(codes::OPERATION_ABORTED));
        assert!(!queue.is_parked());

        queue.free_overlapped(ovl);
        bufs.release(buf);
    }

    #[test]
    fn test_callback_mode_posts_success() {
        let config = LoopbackConfig { sync_completion: false, ..Default::default() };
        let (queue, bufs, buf, target, rx) = setup(config, 128);
        assert!(!queue.skips_callback_on_success());
        queue.push_request(&b"GET / HTTP/1.1\r\n"[..], false);
        let ovl = queue.alloc_overlapped(buf, Arc::downgrade(&target) as Weak<dyn IoCompletion>).unwrap();

        assert_eq!(queue.receive(RequestId::NEW, &ovl).status, ReceiveStatus::Success);
        let (status, _) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(status, ReceiveStatus::Success);

        queue.free_overlapped(ovl);
        bufs.release(buf);
    }

    #[test]
    fn test_fail_next_and_responses() {
        let (queue, bufs, buf, target, _rx) = setup(LoopbackConfig::default(), 64);
        let ovl = queue.alloc_overlapped(buf, Arc::downgrade(&target) as Weak<dyn IoCompletion>).unwrap();
        queue.fail_next(ReceiveStatus::Other(codes::CONNECTION_INVALID));
        assert_eq!(
            queue.receive(RequestId::NEW, &ovl).status,
            ReceiveStatus::Other(codes::CONNECTION_INVALID)
        );

        queue.send_error(RequestId::new(4), 400);
        assert_eq!(queue.responses(), vec![(RequestId::new(4), 400)]);

        queue.free_overlapped(ovl);
        bufs.release(buf);
    }
}
