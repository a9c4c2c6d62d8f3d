//! The parent-side coordination contract.
//!
//! An [`Interface`] turns one call of [`WorkerPool::run`] into traffic on
//! the pool's channels and folds the replies into a single answer. The
//! helpers in this module cover the common patterns; interfaces with other
//! needs drive [`Channel`]s directly.
//!
//! [`WorkerPool::run`]: crate::worker::WorkerPool::run

use crate::error::{ForemanError, Result};
use crate::worker::{Channel, Failure, Float, Reply};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;

/// Coordinates one computation across all workers.
///
/// `channels` is ordered by `process_id`. An implementation must leave
/// every channel in step: each request it sends needs exactly one reply
/// consumed, and an error reply needs its failure record consumed too.
pub trait Interface {
    /// What the caller hands to `run`.
    type Args;
    /// What `run` hands back. The pool keeps a copy of the latest one.
    type Output: Clone;

    fn run(&mut self, channels: &mut [Channel], args: Self::Args) -> Result<Self::Output>;
}

/// Send the same payload to every duplex channel.
///
/// Simplex channels are skipped; their workers take no arguments.
pub fn broadcast<T: Serialize + ?Sized>(channels: &mut [Channel], payload: &T) -> Result<()> {
    let payload = serde_json::to_value(payload)?;
    for channel in channels.iter_mut().filter(|c| c.is_duplex()) {
        channel.send_value(payload.clone())?;
    }
    Ok(())
}

/// Collect one reply per channel, in `process_id` order.
///
/// Error replies stay in place as `Reply::Error`; their failure records
/// are consumed and logged.
pub fn gather<T: DeserializeOwned>(channels: &mut [Channel]) -> Result<Vec<Reply<T>>> {
    let mut replies = Vec::with_capacity(channels.len());
    for channel in channels.iter_mut() {
        let reply = channel.recv()?;
        if reply.is_error() {
            let failure = channel.recv_failure()?;
            tracing::debug!(failure = %failure, "Worker reported an error");
        }
        replies.push(reply);
    }
    Ok(replies)
}

/// Collect one outcome per channel, keeping each failure.
pub fn gather_outcomes<T: DeserializeOwned>(
    channels: &mut [Channel],
) -> Result<Vec<std::result::Result<T, Failure>>> {
    channels.iter_mut().map(Channel::recv_outcome).collect()
}

/// Collect one value per channel, or fail with the first worker failure.
///
/// Every channel is drained before the failure is raised, so the pool
/// stays usable afterwards.
pub fn gather_strict<T: DeserializeOwned>(channels: &mut [Channel]) -> Result<Vec<T>> {
    let outcomes = gather_outcomes(channels)?;
    outcomes
        .into_iter()
        .map(|outcome| outcome.map_err(ForemanError::Compute))
        .collect()
}

/// Sums one `f64` from every worker.
///
/// Duplex pools forward `A` to each worker; simplex pools ignore it.
/// Replies are read as [`Float`], so kernels that answer with `Float` keep
/// infinite values; a plain `f64` that was not finite arrives as NaN.
pub struct SumInterface<A> {
    _args: PhantomData<fn(A)>,
}

impl<A> SumInterface<A> {
    pub fn new() -> Self {
        Self { _args: PhantomData }
    }
}

impl<A> Default for SumInterface<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> fmt::Debug for SumInterface<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SumInterface")
    }
}

impl<A: Serialize> Interface for SumInterface<A> {
    type Args = A;
    type Output = f64;

    fn run(&mut self, channels: &mut [Channel], args: A) -> Result<f64> {
        broadcast(channels, &args)?;
        Ok(gather_strict::<Float>(channels)?
            .into_iter()
            .map(f64::from)
            .sum())
    }
}

/// Concatenates the `Vec<T>` each worker returns, in `process_id` order.
pub struct ConcatInterface<A, T> {
    _marker: PhantomData<fn(A) -> T>,
}

impl<A, T> ConcatInterface<A, T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<A, T> Default for ConcatInterface<A, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A, T> fmt::Debug for ConcatInterface<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConcatInterface")
    }
}

impl<A: Serialize, T: DeserializeOwned + Clone> Interface for ConcatInterface<A, T> {
    type Args = A;
    type Output = Vec<T>;

    fn run(&mut self, channels: &mut [Channel], args: A) -> Result<Vec<T>> {
        broadcast(channels, &args)?;
        Ok(gather_strict::<Vec<T>>(channels)?
            .into_iter()
            .flatten()
            .collect())
    }
}

/// Returns every worker's reply, errors included, in `process_id` order.
pub struct TolerantInterface<A, T> {
    _marker: PhantomData<fn(A) -> T>,
}

impl<A, T> TolerantInterface<A, T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<A, T> Default for TolerantInterface<A, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A, T> fmt::Debug for TolerantInterface<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TolerantInterface")
    }
}

impl<A: Serialize, T: DeserializeOwned + Clone> Interface for TolerantInterface<A, T> {
    type Args = A;
    type Output = Vec<Reply<T>>;

    fn run(&mut self, channels: &mut [Channel], args: A) -> Result<Vec<Reply<T>>> {
        broadcast(channels, &args)?;
        gather(channels)
    }
}
