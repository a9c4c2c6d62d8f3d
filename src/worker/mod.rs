//! Worker pool with one long-lived worker per data shard.
//!
//! The pool partitions a data bundle, binds one shard to a clone of the
//! kernel per worker, and keeps a message channel to each worker until it
//! is closed. Each call to `run` is coordinated by an interface.
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────────────┐
//!                  │      Parent Process      │
//!                  │  WorkerPool + Interface  │
//!                  └────────────┬─────────────┘
//!                               │ Channel (2 pipes, JSON lines)
//!               ┌───────────────┼───────────────┐
//!               │               │               │
//!         ┌─────▼─────┐   ┌─────▼─────┐   ┌─────▼─────┐
//!         │ Worker 0  │   │ Worker 1  │   │ Worker N  │
//!         │ Kernel    │   │ Kernel    │   │ Kernel    │
//!         │ Shard 0   │   │ Shard 1   │   │ Shard N   │
//!         └───────────┘   └───────────┘   └───────────┘
//! ```
//!
//! # Features
//!
//! - **Process isolation**: Forked workers own their shard and kernel state
//! - **Fault isolation**: Kernel errors and panics come back as replies
//! - **Handshake**: `build` returns only once every worker finished setup
//! - **Bounded shutdown**: Stragglers are terminated after a timeout

mod channel;
mod dispatch;
pub(crate) mod ipc;
mod pool;
mod proc;
pub mod protocol;
pub mod signals;
mod spawn;

pub use channel::Channel;
pub use pool::{WorkerPool, WorkerPoolStats};
pub use protocol::{ErrorSentinel, Failure, FailureKind, Float, Reply};
pub use signals::TerminationReason;
