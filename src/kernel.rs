//! The per-worker computation contract.

use crate::partition::Shard;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// A computation unit that runs inside one worker.
///
/// The pool clones the prototype kernel once per worker, binds one shard and
/// the worker's `process_id` through [`assign`](Kernel::assign), and moves the
/// clone into the worker. Inside the worker [`setup`](Kernel::setup) runs
/// exactly once, followed by any number of [`process`](Kernel::process) calls.
///
/// Kernels never see the channel: errors returned (or panics raised) from
/// `process` are reported to the parent and the worker keeps serving.
pub trait Kernel: Clone + Send + 'static {
    /// Arguments decoded from each duplex request.
    type Request: DeserializeOwned;
    /// Value sent back for each successful call.
    type Response: Serialize;

    /// Bind this worker's shard and identifier. Called once, before spawn.
    fn assign(&mut self, shard: Shard, process_id: usize);

    /// One-time preparation inside the worker.
    fn setup(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Compute one answer.
    ///
    /// `request` is `None` for the single call a simplex worker makes.
    fn process(&mut self, request: Option<Self::Request>) -> anyhow::Result<Self::Response>;
}
