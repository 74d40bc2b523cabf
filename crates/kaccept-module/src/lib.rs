//! # kaccept-module: Default (safe) implementations
//!
//! This crate provides the default implementation for every kaccept trait.
//! Each impl prioritizes correctness and simplicity over performance.
//!
//! ## Default stack
//!
//! | Trait           | Default Impl     | Notes                              |
//! |-----------------|------------------|------------------------------------|
//! | BufferProvider  | MallocBuffers    | page aligned, optional mlock/limit |
//! | RequestQueue    | LoopbackQueue    | in-process, completion thread      |
//! | ErrorResponder  | LoopbackQueue    | records responses                  |
//! | RequestPolicy   | BasicPolicy      | request line + optional auth       |
//!
//! `OverlappedTable` is the descriptor allocator queues build on.

pub mod malloc_buffers;
pub mod overlapped_table;
pub mod loopback;
pub mod basic_policy;

pub use malloc_buffers::MallocBuffers;
pub use overlapped_table::OverlappedTable;
pub use loopback::{LoopbackConfig, LoopbackQueue};
pub use basic_policy::BasicPolicy;
