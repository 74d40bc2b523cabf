//! # kaccept-core: Trait definitions for kaccept
//!
//! This crate defines the boundaries between the accept cycle and the
//! parties it talks to. Each trait models one collaborator:
//!
//! - [`queue::RequestQueue`]: the OS request queue: begin receive,
//!   bind/free overlapped descriptors, cancel.
//! - [`buffer::BufferProvider`]: native memory the kernel writes into.
//! - [`policy::RequestPolicy`]: request and auth validation, error replies.
//! - [`factory::RequestFactory`]: late initialisation of accepted requests.
//!
//! Default implementations live in `kaccept-module`. The engine in
//! `kaccept` depends only on this crate.
//!
//! ## Design principle
//!
//! > "Program to the interface. Start safe. Optimize with a new impl,
//! >  not by modifying the existing one."

pub mod id;
pub mod status;
pub mod buffer;
pub mod native;
pub mod overlapped;
pub mod queue;
pub mod policy;
pub mod factory;
pub mod error;

pub use id::RequestId;
pub use status::{ReceiveResult, ReceiveStatus};
pub use buffer::{BufferProvider, NativeBuffer};
pub use native::{NativeRequest, RawRequestHeader, HEADER_SIZE};
pub use overlapped::{IoCompletion, Overlapped, OverlappedHandle, OverlappedToken};
pub use queue::RequestQueue;
pub use policy::{ErrorResponder, RequestPolicy, ValidationError};
pub use factory::{Passthrough, RequestFactory};
pub use error::{AcceptError, Result};
