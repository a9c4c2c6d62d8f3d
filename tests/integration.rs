//! Integration tests for the worker pool.
//!
//! Most tests fork real worker processes and are serialized so that
//! children of one test never hold pipes belonging to another.

use anyhow::{Context, bail};
use pwa_foreman::interface::{Interface, broadcast, gather_strict};
use pwa_foreman::objective::{FunctionAmplitude, Likelihood, LikelihoodOptions, Objective, Parameters};
use pwa_foreman::partition::{self, Particle, ParticlePool};
use pwa_foreman::{
    Backend, Channel, DataBundle, ErrorSentinel, FailureKind, ForemanError, Kernel, Mode,
    PoolConfig, Reply, Shard, ShardValue, SumInterface, TolerantInterface, WorkerPool,
};
use serial_test::serial;
use std::time::{Duration, Instant};

fn fork_config(workers: usize) -> PoolConfig {
    PoolConfig::new()
        .with_workers(workers)
        .with_backend(Backend::Fork)
        .with_shutdown_timeout(Duration::from_secs(2))
}

fn numbers(n: i32) -> Vec<f64> {
    (0..n).map(f64::from).collect()
}

/// Sums its shard of `data`, scaled by an optional factor.
#[derive(Clone, Default)]
struct SumKernel {
    data: Vec<f64>,
}

impl Kernel for SumKernel {
    type Request = Option<f64>;
    type Response = f64;

    fn assign(&mut self, shard: Shard, _process_id: usize) {
        self.data = shard.numeric("data").map(<[f64]>::to_vec).unwrap_or_default();
    }

    fn process(&mut self, factor: Option<Option<f64>>) -> anyhow::Result<f64> {
        Ok(self.data.iter().sum::<f64>() * factor.flatten().unwrap_or(1.0))
    }
}

/// Hands its shard back untouched.
#[derive(Clone, Default)]
struct EchoKernel {
    shard: Shard,
}

impl Kernel for EchoKernel {
    type Request = ();
    type Response = Shard;

    fn assign(&mut self, shard: Shard, _process_id: usize) {
        self.shard = shard;
    }

    fn process(&mut self, _request: Option<()>) -> anyhow::Result<Shard> {
        Ok(self.shard.clone())
    }
}

/// Collects every worker's shard and merges them back into one bundle.
struct MergeInterface;

impl Interface for MergeInterface {
    type Args = ();
    type Output = DataBundle;

    fn run(&mut self, channels: &mut [Channel], args: ()) -> pwa_foreman::Result<DataBundle> {
        broadcast(channels, &args)?;
        let shards = gather_strict::<Shard>(channels)?;
        partition::merge(&shards)
    }
}

/// Fails in whatever way the request asks for.
#[derive(Clone, Default)]
struct TroubleKernel {
    process_id: usize,
    fail_setup_on: Option<usize>,
    abort_setup_on: Option<usize>,
}

impl Kernel for TroubleKernel {
    type Request = String;
    type Response = f64;

    fn assign(&mut self, _shard: Shard, process_id: usize) {
        self.process_id = process_id;
    }

    fn setup(&mut self) -> anyhow::Result<()> {
        if self.abort_setup_on == Some(self.process_id) {
            std::process::abort();
        }
        if self.fail_setup_on == Some(self.process_id) {
            bail!("cannot open calibration for worker {}", self.process_id);
        }
        Ok(())
    }

    fn process(&mut self, request: Option<String>) -> anyhow::Result<f64> {
        match request.as_deref() {
            Some("error") => Err(anyhow::anyhow!("root cause")).context("evaluation failed"),
            Some("panic") => panic!("kernel panicked"),
            Some("exit") if self.process_id == 1 => std::process::exit(7),
            Some("nan") if self.process_id == 1 => Ok(f64::NAN),
            Some("slow") => {
                std::thread::sleep(Duration::from_secs(30));
                Ok(0.0)
            }
            _ => Ok(self.process_id as f64),
        }
    }
}

#[test]
#[serial(fork)]
fn scenario_a_sum_of_range() {
    let bundle = DataBundle::new().with("data", numbers(100));
    let mut pool =
        WorkerPool::build(&bundle, SumKernel::default(), SumInterface::<Option<f64>>::new(), fork_config(4))
            .unwrap();

    assert_eq!(pool.run(None).unwrap(), 4950.0);
    assert!(pool.is_alive());
    pool.close();
}

#[test]
fn scenario_b_round_robin_shards() {
    let letters: Vec<String> = ('a'..='j').map(String::from).collect();
    let bundle = DataBundle::new().with("data", ShardValue::records(&letters).unwrap());

    let shards = partition::split(&bundle, 3).unwrap();
    let sizes: Vec<usize> = shards.iter().map(|s| s.get("data").unwrap().len()).collect();
    assert_eq!(sizes, vec![4, 3, 3]);
    assert_eq!(
        shards[0].records("data").unwrap(),
        &["a", "d", "g", "j"].map(serde_json::Value::from)
    );
}

#[test]
fn scenario_c_short_sequence() {
    let bundle = DataBundle::new().with("data", ShardValue::records(["only"]).unwrap());
    let result = WorkerPool::build(
        &bundle,
        EchoKernel::default(),
        MergeInterface,
        fork_config(2),
    );
    assert!(matches!(result, Err(ForemanError::Partition(_))));
}

#[test]
#[serial(fork)]
fn scenario_d_close_twice() {
    let bundle = DataBundle::new().with("data", numbers(8));
    let mut pool =
        WorkerPool::build(&bundle, SumKernel::default(), SumInterface::<Option<f64>>::new(), fork_config(2))
            .unwrap();
    pool.close();
    pool.close();
    assert!(!pool.is_alive());
}

#[test]
#[serial(fork)]
fn round_trip_reproduces_bundle() {
    let tags: Vec<String> = (0..23).map(|i| format!("event-{}", i)).collect();
    let bundle = DataBundle::new()
        .with("x", numbers(23))
        .with("tag", ShardValue::records(&tags).unwrap());

    for workers in 1..=5 {
        let mut pool =
            WorkerPool::build(&bundle, EchoKernel::default(), MergeInterface, fork_config(workers))
                .unwrap();
        assert_eq!(pool.run(()).unwrap(), bundle, "workers = {}", workers);
    }
}

#[test]
#[serial(fork)]
fn runs_are_deterministic() {
    let bundle = DataBundle::new().with("data", numbers(1000));
    let mut pool =
        WorkerPool::build(&bundle, SumKernel::default(), SumInterface::new(), fork_config(3))
            .unwrap();

    let first = pool.run(Some(0.25)).unwrap();
    let second = pool.run(Some(0.25)).unwrap();
    assert_eq!(first, second);
    assert_eq!(pool.stats().runs_completed, 2);
}

#[test]
#[serial(fork)]
fn tolerant_interface_returns_sentinel() {
    let bundle = DataBundle::new().with("data", numbers(6));
    let mut pool = WorkerPool::build(
        &bundle,
        TroubleKernel::default(),
        TolerantInterface::<&str, f64>::new(),
        fork_config(3),
    )
    .unwrap();

    let replies = pool.run("error").unwrap();
    assert_eq!(replies, vec![Reply::Error(ErrorSentinel); 3]);
    assert!(pool.is_alive());

    let replies = pool.run("ok").unwrap();
    assert_eq!(
        replies,
        vec![Reply::Value(0.0), Reply::Value(1.0), Reply::Value(2.0)]
    );
}

#[test]
#[serial(fork)]
fn strict_interface_reraises_failure() {
    let bundle = DataBundle::new().with("data", numbers(6));
    let mut pool = WorkerPool::build(
        &bundle,
        TroubleKernel::default(),
        SumInterface::<&str>::new(),
        fork_config(3),
    )
    .unwrap();

    match pool.run("error").unwrap_err() {
        ForemanError::Compute(failure) => {
            assert_eq!(failure.process_id, 0);
            assert_eq!(failure.kind, FailureKind::Compute);
            assert_eq!(failure.message, "evaluation failed");
            assert_eq!(failure.causes, vec!["root cause".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(pool.is_alive());
    assert_eq!(pool.run("ok").unwrap(), 3.0);
}

#[test]
#[serial(fork)]
fn panics_are_reported_per_call() {
    let bundle = DataBundle::new().with("data", numbers(4));
    let mut pool = WorkerPool::build(
        &bundle,
        TroubleKernel::default(),
        SumInterface::<&str>::new(),
        fork_config(2),
    )
    .unwrap();

    let err = pool.run("panic").unwrap_err();
    let failure = err.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Panic);
    assert_eq!(failure.message, "kernel panicked");
    assert!(pool.is_alive());
    assert_eq!(pool.run("ok").unwrap(), 1.0);
}

#[test]
#[serial(fork)]
fn setup_failure_fails_build() {
    let bundle = DataBundle::new().with("data", numbers(9));
    let kernel = TroubleKernel {
        fail_setup_on: Some(2),
        ..Default::default()
    };
    let result = WorkerPool::build(&bundle, kernel, SumInterface::<&str>::new(), fork_config(3));

    match result {
        Err(ForemanError::Setup(failure)) => {
            assert_eq!(failure.process_id, 2);
            assert_eq!(failure.kind, FailureKind::Setup);
            assert_eq!(failure.message, "cannot open calibration for worker 2");
        }
        other => panic!("expected setup failure, got {:?}", other.map(|_| ())),
    }
}

#[test]
#[serial(fork)]
fn worker_crash_during_setup_fails_build() {
    let bundle = DataBundle::new().with("data", numbers(9));
    let kernel = TroubleKernel {
        abort_setup_on: Some(1),
        ..Default::default()
    };
    let result = WorkerPool::build(&bundle, kernel, SumInterface::<&str>::new(), fork_config(3));

    match result {
        Err(ForemanError::Setup(failure)) => {
            assert_eq!(failure.process_id, 1);
            assert_eq!(failure.kind, FailureKind::Setup);
            assert!(failure.message.contains("died during setup"), "message: {}", failure.message);
            assert!(failure.message.contains("SIGABRT"), "message: {}", failure.message);
        }
        other => panic!("expected setup failure, got {:?}", other.map(|_| ())),
    }
}

#[test]
#[serial(fork)]
fn non_finite_values_keep_pool_alive() {
    let bundle = DataBundle::new().with("data", numbers(6));
    let mut pool = WorkerPool::build(
        &bundle,
        TroubleKernel::default(),
        SumInterface::<&str>::new(),
        fork_config(3),
    )
    .unwrap();

    assert!(pool.run("nan").unwrap().is_nan());
    assert!(pool.is_alive());
    assert_eq!(pool.run("ok").unwrap(), 3.0);
}

type Calc = fn(&[f64], &Parameters) -> anyhow::Result<Vec<f64>>;

fn scaled(data: &[f64], parameters: &Parameters) -> anyhow::Result<Vec<f64>> {
    let a = parameters.get("a").copied().context("missing a")?;
    Ok(data.iter().map(|x| a * x).collect())
}

#[test]
#[serial(fork)]
fn log_likelihood_survives_zero_intensity() {
    let bundle = DataBundle::new().with("data", (1..=8).map(f64::from).collect::<Vec<_>>());
    let options = LikelihoodOptions::default().with_pool(fork_config(2));
    let mut likelihood = Likelihood::log_likelihood(
        FunctionAmplitude::new(scaled as Calc),
        Parameters::new(),
        &bundle,
        None,
        options,
    )
    .unwrap();

    let at = |a: f64| Parameters::from([("a".to_string(), a)]);
    assert_eq!(likelihood.evaluate(&at(0.0)).unwrap(), f64::INFINITY);
    assert!(likelihood.is_alive());

    let expected = -(1..=8).map(|x| f64::from(x).ln()).sum::<f64>();
    let value = likelihood.evaluate(&at(1.0)).unwrap();
    assert!((value - expected).abs() < 1e-9);
    likelihood.close();
}

#[test]
#[serial(fork)]
fn worker_exit_closes_pool() {
    let bundle = DataBundle::new().with("data", numbers(6));
    let mut pool = WorkerPool::build(
        &bundle,
        TroubleKernel::default(),
        SumInterface::<&str>::new(),
        fork_config(3),
    )
    .unwrap();

    match pool.run("exit").unwrap_err() {
        ForemanError::WorkerLost { process_id, reason } => {
            assert_eq!(process_id, 1);
            assert!(reason.contains("exited with code 7"), "reason: {}", reason);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!pool.is_alive());
    assert!(pool.is_closed());
    assert!(matches!(pool.run("ok"), Err(ForemanError::PoolShutdown)));
}

/// Sends the arguments and returns without waiting for replies.
struct FireAndForget;

impl Interface for FireAndForget {
    type Args = &'static str;
    type Output = ();

    fn run(&mut self, channels: &mut [Channel], args: &'static str) -> pwa_foreman::Result<()> {
        broadcast(channels, args)
    }
}

#[test]
#[serial(fork)]
fn close_terminates_stragglers() {
    let bundle = DataBundle::new().with("data", numbers(2));
    let config = fork_config(2).with_shutdown_timeout(Duration::from_millis(100));
    let mut pool =
        WorkerPool::build(&bundle, TroubleKernel::default(), FireAndForget, config).unwrap();

    pool.run("slow").unwrap();
    let started = Instant::now();
    pool.close();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!pool.is_alive());
    assert_eq!(pool.stats().live_workers, 0);
}

#[test]
#[serial(fork)]
fn simplex_pool_answers_once() {
    let bundle = DataBundle::new().with("data", numbers(10));
    let config = fork_config(3).with_mode(Mode::Simplex);
    let mut pool =
        WorkerPool::build(&bundle, SumKernel::default(), SumInterface::<Option<f64>>::new(), config).unwrap();

    assert_eq!(pool.run(None).unwrap(), 45.0);
    assert!(matches!(
        pool.run(None),
        Err(ForemanError::SimplexExhausted { .. })
    ));
    assert!(pool.is_alive());
}

#[test]
fn thread_backend_matches_fork_semantics() {
    let bundle = DataBundle::new().with("data", numbers(100));
    let config = PoolConfig::new()
        .with_workers(4)
        .with_backend(Backend::Thread);
    let mut pool =
        WorkerPool::build(&bundle, SumKernel::default(), SumInterface::new(), config).unwrap();

    assert_eq!(pool.run(Some(2.0)).unwrap(), 9900.0);
    assert_eq!(pool.stats().live_workers, 4);
    pool.close();
    assert_eq!(pool.stats().live_workers, 0);
}

/// Counts the events of its particle shard.
#[derive(Clone, Default)]
struct EventCountKernel {
    events: usize,
}

impl Kernel for EventCountKernel {
    type Request = ();
    type Response = f64;

    fn assign(&mut self, shard: Shard, _process_id: usize) {
        self.events = shard
            .collection::<ParticlePool>("particles")
            .map_or(0, ParticlePool::event_count);
    }

    fn process(&mut self, _request: Option<()>) -> anyhow::Result<f64> {
        Ok(self.events as f64)
    }
}

#[test]
#[serial(fork)]
fn particle_pool_is_sharded_by_event() {
    let particle = |id| {
        Particle::new(id, numbers(10), numbers(10), numbers(10), numbers(10)).unwrap()
    };
    let pool_data = ParticlePool::new(vec![particle(14), particle(8)]).unwrap();
    let bundle = DataBundle::new().with("particles", pool_data.clone());

    let shards = partition::split(&bundle, 3).unwrap();
    assert_eq!(partition::merge(&shards).unwrap(), bundle);

    let mut pool = WorkerPool::build(
        &bundle,
        EventCountKernel::default(),
        SumInterface::new(),
        fork_config(3),
    )
    .unwrap();
    assert_eq!(pool.run(()).unwrap(), 10.0);
}
