//! `AcceptCycle`: the long-lived accept loop value.
//!
//! One cycle owns one native request at a time and hands out one
//! `CompletionFuture` per `accept_next()`. `accept_next` and `dispose`
//! are the only mutation points visible to the owner.

use kaccept_core::buffer::BufferProvider;
use kaccept_core::error::{AcceptError, Result};
use kaccept_core::factory::RequestFactory;
use kaccept_core::id::RequestId;
use kaccept_core::overlapped::IoCompletion;
use kaccept_core::policy::RequestPolicy;
use kaccept_core::queue::RequestQueue;

use crate::bridge::{CompletionFuture, CompletionSource, Version};
use crate::buffers::NativeBuffers;
use crate::config::AcceptConfig;
use crate::stats::{CycleStats, StatsSnapshot};

use std::sync::{Arc, Weak};

pub(crate) struct CycleInner<F: RequestFactory> {
    pub(crate) queue: Arc<dyn RequestQueue>,
    pub(crate) policy: Arc<dyn RequestPolicy>,
    pub(crate) factory: F,
    pub(crate) config: AcceptConfig,
    pub(crate) bridge: CompletionSource<F::Request>,
    pub(crate) buffers: NativeBuffers,
    pub(crate) stats: Arc<CycleStats>,
}

impl<F: RequestFactory> CycleInner<F> {
    pub(crate) fn resolve(&self, version: Version, request: F::Request) {
        self.bridge.resolve(version, request);
    }

    pub(crate) fn fail(&self, version: Version, error: AcceptError) {
        tracing::debug!(version, %error, "accept failed");
        self.stats.failed();
        self.bridge.fail(version, error);
    }
}

pub struct AcceptCycle<F: RequestFactory> {
    inner: Arc<CycleInner<F>>,
}

impl<F: RequestFactory> AcceptCycle<F> {
    pub fn new(
        queue: Arc<dyn RequestQueue>,
        provider: Arc<dyn BufferProvider>,
        policy: Arc<dyn RequestPolicy>,
        factory: F,
        config: AcceptConfig,
    ) -> Result<Self> {
        config.validate().map_err(|e| AcceptError::Init(e.to_string()))?;
        let stats = Arc::new(CycleStats::default());

        let inner = Arc::new_cyclic(|weak: &Weak<CycleInner<F>>| {
            let target: Weak<dyn IoCompletion> = weak.clone();
            CycleInner {
                buffers: NativeBuffers::new(
                    queue.clone(),
                    provider,
                    target,
                    config.default_buffer_size,
                    stats.clone(),
                ),
                bridge: CompletionSource::new(config.strict_invariants),
                queue,
                policy,
                factory,
                config,
                stats,
            }
        });

        tracing::debug!(
            buffer_size = inner.config.default_buffer_size,
            strict = inner.config.strict_invariants,
            "accept cycle created"
        );
        Ok(Self { inner })
    }

    /// Start waiting for the next request.
    ///
    /// Fails immediately with `Busy` if the previous accept has not
    /// resolved yet, and with `Disposed` after `dispose()`.
    pub fn accept_next(&self) -> CompletionFuture<F::Request> {
        let inner = &self.inner;
        if inner.buffers.is_closed() {
            return CompletionFuture::failed(AcceptError::Disposed);
        }
        let version = match inner.bridge.reset() {
            Ok(v) => v,
            Err(e) => return CompletionFuture::failed(e),
        };
        let (future, _) = inner.bridge.begin_wait();

        let Some(mut guard) = inner.buffers.claim() else {
            tracing::error!(version, "buffer pair still owned at accept");
            inner.fail(version, AcceptError::Invariant("buffer pair still owned at accept"));
            return future;
        };
        guard.set_version(version);
        if !guard.has_request() {
            if let Err(e) = guard.allocate(None, RequestId::NEW) {
                drop(guard);
                inner.fail(version, e);
                return future;
            }
        }
        if let Err(e) = inner.begin_receive(guard) {
            inner.fail(version, e);
        }
        future
    }

    /// Tear the cycle down. Fails an outstanding accept with `Disposed`,
    /// releases the pair or cancels the receive holding it. Idempotent.
    pub fn dispose(&self) {
        let inner = &self.inner;
        if !inner.buffers.mark_closed() {
            return;
        }
        tracing::debug!("disposing accept cycle");
        inner.bridge.close(AcceptError::Disposed);
        inner.buffers.release_or_cancel();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.buffers.is_closed()
    }

    /// Whether a receive is currently with the OS.
    pub fn is_receiving(&self) -> bool {
        self.inner.buffers.is_lent()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn config(&self) -> &AcceptConfig {
        &self.inner.config
    }
}

impl<F: RequestFactory> Drop for AcceptCycle<F> {
    fn drop(&mut self) {
        self.dispose();
    }
}
