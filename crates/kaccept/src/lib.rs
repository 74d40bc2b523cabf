//! # kaccept: Accept cycle for kernel-assisted request queues
//!
//! The engine that turns a callback-driven OS request queue into one
//! awaitable request at a time:
//!
//! ```text
//!   owner                 AcceptCycle                     RequestQueue (OS)
//!   ─────                 ───────────                     ─────────────────
//!   accept_next() ──► reset bridge, claim pair
//!                         begin_receive ──────────────► receive(id, ovl)
//!                           ◄── InsufficientBuffer: reallocate, retry
//!                           ◄── InvalidParameter(id≠0): id = NEW, retry
//!                           ◄── Success (inline) / Pending
//!                                                 ... io_completed(status, bytes)
//!                         validate ─► resolve / fail / re-arm
//!   future.await ◄──────── bridge
//! ```
//!
//! ## Modules
//!
//! - [`bridge`]: Completion Source Bridge (versioned one-shot slot)
//! - [`buffers`]: Native Buffer Lifecycle Manager (arena of one)
//! - `retry`: Accept Retry State Machine
//! - `handler`: Completion Handler
//! - [`cycle`]: `AcceptCycle`, the owner-facing value
//! - [`config`], [`stats`]
//!
//! ## Example
//!
//! ```rust,ignore
//! let queue = Arc::new(LoopbackQueue::new(LoopbackConfig::default())?);
//! let policy = Arc::new(BasicPolicy::new(queue.clone()));
//! let cycle = AcceptCycle::new(queue.clone(), Arc::new(MallocBuffers::new()),
//!                              policy, Passthrough, AcceptConfig::from_env())?;
//!
//! queue.push_request(&b"GET / HTTP/1.1\r\n\r\n"[..], false);
//! let request = cycle.accept_next().wait()?;
//! ```

pub mod bridge;
pub mod buffers;
pub mod config;
pub mod cycle;
pub mod stats;
mod handler;
mod retry;

pub use bridge::{CompletionFuture, CompletionSource, Resolve, Version};
pub use config::AcceptConfig;
pub use cycle::AcceptCycle;
pub use stats::StatsSnapshot;

pub use kaccept_core::{AcceptError, NativeRequest, RequestId, Result};
