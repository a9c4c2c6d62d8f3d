//! Process-pool computation engine for partial-wave analysis fits.
//!
//! A [`WorkerPool`] splits a [`DataBundle`] into one shard per worker,
//! hands each worker a clone of a [`Kernel`] bound to its shard, and
//! answers every [`WorkerPool::run`] call through an [`Interface`] that
//! broadcasts the arguments and folds the replies.
//!
//! ```no_run
//! use pwa_foreman::{DataBundle, Kernel, PoolConfig, Shard, SumInterface, WorkerPool};
//!
//! #[derive(Clone, Default)]
//! struct Scaled(Vec<f64>);
//!
//! impl Kernel for Scaled {
//!     type Request = f64;
//!     type Response = f64;
//!
//!     fn assign(&mut self, shard: Shard, _process_id: usize) {
//!         self.0 = shard.numeric("x").map(<[f64]>::to_vec).unwrap_or_default();
//!     }
//!
//!     fn process(&mut self, factor: Option<f64>) -> anyhow::Result<f64> {
//!         Ok(self.0.iter().sum::<f64>() * factor.unwrap_or(1.0))
//!     }
//! }
//!
//! let bundle = DataBundle::new().with("x", (0..100).map(f64::from).collect::<Vec<_>>());
//! let config = PoolConfig::new().with_workers(4);
//! let mut pool = WorkerPool::build(&bundle, Scaled::default(), SumInterface::new(), config)?;
//! assert_eq!(pool.run(2.0)?, 9900.0);
//! pool.close();
//! # Ok::<(), pwa_foreman::ForemanError>(())
//! ```

pub mod config;
pub mod error;
pub mod interface;
pub mod kernel;
pub mod logging;
pub mod objective;
pub mod partition;
pub mod worker;

pub use config::{Backend, Mode, PoolConfig};
pub use error::{ForemanError, Result};
pub use interface::{ConcatInterface, Interface, SumInterface, TolerantInterface};
pub use kernel::Kernel;
pub use partition::{DataBundle, Shard, ShardValue};
pub use worker::{
    Channel, ErrorSentinel, Failure, FailureKind, Float, Reply, WorkerPool, WorkerPoolStats,
};
