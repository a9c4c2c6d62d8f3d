//! Worker pool lifecycle: build, run, liveness and close.

use super::channel::Channel;
use super::proc::WorkerHandle;
use super::protocol::{Failure, FailureKind};
use super::spawn::spawn_worker;
use crate::config::PoolConfig;
use crate::error::{ForemanError, Result};
use crate::interface::Interface;
use crate::kernel::Kernel;
use crate::partition::{self, DataBundle};
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};

/// How long a lost worker gets to be reaped before its exit is described.
const REAP_GRACE: Duration = Duration::from_millis(200);

/// A fixed set of workers, each bound to one shard, driven by an interface.
///
/// Closing is idempotent and also happens on drop.
pub struct WorkerPool<I: Interface> {
    channels: Vec<Channel>,
    workers: Vec<WorkerHandle>,
    interface: I,
    config: PoolConfig,
    closed: bool,
    runs_completed: usize,
    last_output: Option<I::Output>,
}

impl<I: Interface> WorkerPool<I> {
    /// Partition `bundle`, start one worker per shard and wait for all of
    /// them to finish setup.
    ///
    /// If any worker fails setup, every worker is shut down and the first
    /// failure (lowest `process_id`) is returned as `ForemanError::Setup`.
    /// A worker that dies before reporting ready counts as a setup failure.
    #[instrument(level = "debug", skip_all, fields(workers = config.worker_count, mode = %config.mode, backend = %config.backend))]
    pub fn build<K: Kernel>(
        bundle: &DataBundle,
        kernel: K,
        interface: I,
        config: PoolConfig,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            workers = config.worker_count,
            keys = bundle.len(),
            mode = %config.mode,
            backend = %config.backend,
            "Initializing worker pool"
        );

        let shards = partition::split(bundle, config.worker_count)?;
        let mut pool = Self {
            channels: Vec::with_capacity(shards.len()),
            workers: Vec::with_capacity(shards.len()),
            interface,
            config,
            closed: false,
            runs_completed: 0,
            last_output: None,
        };

        // An early return drops `pool`, which closes the workers started so far.
        for (process_id, shard) in shards.into_iter().enumerate() {
            let mut worker_kernel = kernel.clone();
            worker_kernel.assign(shard, process_id);
            let inherited: Vec<RawFd> = pool.channels.iter().flat_map(Channel::raw_fds).collect();
            let (channel, handle) = spawn_worker(
                worker_kernel,
                process_id,
                pool.config.mode,
                pool.config.backend,
                &inherited,
            )?;
            pool.channels.push(channel);
            pool.workers.push(handle);
        }

        let mut setup_error = None;
        for index in 0..pool.channels.len() {
            if let Err(e) = pool.channels[index].await_ready() {
                let e = pool.describe_setup_loss(e);
                warn!(process_id = index, error = %e, "Worker failed to initialize");
                if setup_error.is_none() {
                    setup_error = Some(e);
                }
            }
        }
        if let Some(e) = setup_error {
            return Err(e);
        }

        info!(workers = pool.config.worker_count, "All workers ready");
        Ok(pool)
    }

    /// Run one computation through the interface.
    ///
    /// Compute failures leave the pool usable. Lost workers and protocol
    /// violations close it before the error is returned.
    #[instrument(level = "trace", skip_all, fields(run = self.runs_completed))]
    pub fn run(&mut self, args: I::Args) -> Result<I::Output> {
        if self.closed {
            return Err(ForemanError::PoolShutdown);
        }

        let started = Instant::now();
        match self.interface.run(&mut self.channels, args) {
            Ok(output) => {
                self.runs_completed += 1;
                self.last_output = Some(output.clone());
                trace!(elapsed_us = started.elapsed().as_micros() as u64, "Run completed");
                Ok(output)
            }
            Err(e) if e.is_structural() => {
                let e = self.describe_loss(e);
                warn!(error = %e, "Worker pool is out of step; closing it");
                self.close();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Whether every worker is still running.
    ///
    /// Always `false` after `close`.
    pub fn is_alive(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.workers.iter_mut().all(WorkerHandle::is_running)
    }

    /// Shut every worker down.
    ///
    /// Sends a shutdown request on every channel, waits up to the
    /// configured timeout, then terminates whatever is left. Calling it
    /// again does nothing.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        debug!(workers = self.workers.len(), "Closing worker pool");

        for channel in &mut self.channels {
            if let Err(e) = channel.send_shutdown() {
                trace!(process_id = channel.process_id(), error = %e, "Shutdown request not delivered");
            }
        }
        // Dropping the parent ends gives idle workers EOF as well.
        self.channels.clear();

        let deadline = Instant::now() + self.config.shutdown_timeout;
        for worker in &mut self.workers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !worker.wait_timeout(remaining) {
                warn!(process_id = worker.process_id(), "Worker did not exit in time; terminating");
                worker.terminate();
            }
            if let Some(reason) = worker.exit_reason()
                && !reason.is_clean()
            {
                debug!(process_id = worker.process_id(), reason = %reason, "Worker stopped");
            }
        }
        debug!("Worker pool closed");
    }

    /// Output of the most recent successful run.
    pub fn last_output(&self) -> Option<&I::Output> {
        self.last_output.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Process ids of the spawned workers, in shard order.
    pub fn process_ids(&self) -> Vec<usize> {
        self.workers.iter().map(WorkerHandle::process_id).collect()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn interface(&self) -> &I {
        &self.interface
    }

    pub fn interface_mut(&mut self) -> &mut I {
        &mut self.interface
    }

    /// Get statistics about the worker pool.
    pub fn stats(&mut self) -> WorkerPoolStats {
        let live_workers = if self.closed {
            0
        } else {
            let mut live = 0;
            for worker in &mut self.workers {
                if worker.is_running() {
                    live += 1;
                }
            }
            live
        };
        WorkerPoolStats {
            worker_count: self.workers.len(),
            live_workers,
            runs_completed: self.runs_completed,
        }
    }

    /// Attach the exit status of a lost worker to its error.
    fn describe_loss(&mut self, error: ForemanError) -> ForemanError {
        match error {
            ForemanError::WorkerLost { process_id, reason } => {
                let exit = self.workers.get_mut(process_id).and_then(|worker| {
                    worker.wait_timeout(REAP_GRACE);
                    worker.exit_reason()
                });
                let reason = match exit {
                    Some(exit) => format!("{} ({})", reason, exit),
                    None => reason,
                };
                ForemanError::WorkerLost { process_id, reason }
            }
            other => other,
        }
    }

    /// Report a worker lost before its ready message as a setup failure.
    fn describe_setup_loss(&mut self, error: ForemanError) -> ForemanError {
        match self.describe_loss(error) {
            ForemanError::WorkerLost { process_id, reason } => ForemanError::Setup(Failure {
                process_id,
                kind: FailureKind::Setup,
                message: format!("worker died during setup: {}", reason),
                causes: Vec::new(),
            }),
            other => other,
        }
    }
}

impl<I: Interface> Drop for WorkerPool<I> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<I: Interface> std::fmt::Debug for WorkerPool<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("config", &self.config)
            .field("closed", &self.closed)
            .field("runs_completed", &self.runs_completed)
            .finish_non_exhaustive()
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolStats {
    /// Number of workers in the pool.
    pub worker_count: usize,
    /// Workers still running.
    pub live_workers: usize,
    /// Runs that returned a value.
    pub runs_completed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Backend, Mode};
    use crate::interface::{SumInterface, TolerantInterface};
    use crate::partition::Shard;
    use crate::worker::Reply;
    use anyhow::bail;

    /// Sums its shard of `x` times the request factor.
    #[derive(Clone, Default)]
    struct SumKernel {
        values: Vec<f64>,
        process_id: usize,
    }

    impl Kernel for SumKernel {
        type Request = f64;
        type Response = f64;

        fn assign(&mut self, shard: Shard, process_id: usize) {
            self.values = shard.numeric("x").map(<[f64]>::to_vec).unwrap_or_default();
            self.process_id = process_id;
        }

        fn process(&mut self, factor: Option<f64>) -> anyhow::Result<f64> {
            let factor = factor.unwrap_or(1.0);
            if factor < 0.0 && self.process_id == 1 {
                bail!("worker 1 refuses negative factors");
            }
            Ok(self.values.iter().sum::<f64>() * factor)
        }
    }

    fn bundle(n: usize) -> DataBundle {
        DataBundle::new().with("x", (0..n).map(|i| i as f64).collect::<Vec<_>>())
    }

    fn thread_config(workers: usize) -> PoolConfig {
        PoolConfig::new()
            .with_workers(workers)
            .with_backend(Backend::Thread)
            .with_shutdown_timeout(Duration::from_secs(1))
    }

    #[test]
    fn test_build_run_close() {
        let mut pool = WorkerPool::build(
            &bundle(10),
            SumKernel::default(),
            SumInterface::<f64>::new(),
            thread_config(3),
        )
        .unwrap();
        assert_eq!(pool.worker_count(), 3);
        assert_eq!(pool.process_ids(), vec![0, 1, 2]);
        assert!(pool.is_alive());
        assert_eq!(pool.last_output(), None);

        assert_eq!(pool.run(1.0).unwrap(), 45.0);
        assert_eq!(pool.run(2.0).unwrap(), 90.0);
        assert_eq!(pool.last_output(), Some(&90.0));

        let stats = pool.stats();
        assert_eq!(
            stats,
            WorkerPoolStats {
                worker_count: 3,
                live_workers: 3,
                runs_completed: 2
            }
        );

        pool.close();
        assert!(pool.is_closed());
        assert!(!pool.is_alive());
        assert_eq!(pool.stats().live_workers, 0);
        pool.close();
    }

    #[test]
    fn test_run_after_close() {
        let mut pool = WorkerPool::build(
            &bundle(4),
            SumKernel::default(),
            SumInterface::<f64>::new(),
            thread_config(2),
        )
        .unwrap();
        pool.close();
        assert!(matches!(pool.run(1.0), Err(ForemanError::PoolShutdown)));
    }

    #[test]
    fn test_compute_error_keeps_pool() {
        let mut pool = WorkerPool::build(
            &bundle(6),
            SumKernel::default(),
            SumInterface::<f64>::new(),
            thread_config(3),
        )
        .unwrap();

        assert_eq!(pool.run(2.0).unwrap(), 30.0);
        let err = pool.run(-1.0).unwrap_err();
        assert!(matches!(err, ForemanError::Compute(ref f) if f.process_id == 1));
        assert!(pool.is_alive());
        assert_eq!(pool.last_output(), Some(&30.0));
        assert_eq!(pool.run(1.0).unwrap(), 15.0);
    }

    #[test]
    fn test_tolerant_interface_sees_sentinel() {
        let mut pool = WorkerPool::build(
            &bundle(6),
            SumKernel::default(),
            TolerantInterface::<f64, f64>::new(),
            thread_config(3),
        )
        .unwrap();

        let replies = pool.run(-1.0).unwrap();
        assert_eq!(replies.len(), 3);
        assert!(!replies[0].is_error());
        assert!(replies[1].is_error());
        assert_eq!(replies[2], Reply::Value(-9.0));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let result = WorkerPool::build(
            &bundle(4),
            SumKernel::default(),
            SumInterface::<f64>::new(),
            thread_config(0),
        );
        assert!(matches!(result, Err(ForemanError::Config(_))));
    }

    #[test]
    fn test_simplex_pool_answers_once() {
        let config = thread_config(2).with_mode(Mode::Simplex);
        let mut pool = WorkerPool::build(
            &bundle(5),
            SumKernel::default(),
            SumInterface::<()>::new(),
            config,
        )
        .unwrap();

        assert_eq!(pool.run(()).unwrap(), 10.0);
        let err = pool.run(()).unwrap_err();
        assert!(matches!(err, ForemanError::SimplexExhausted { .. }));
        assert!(pool.is_alive());
    }
}
