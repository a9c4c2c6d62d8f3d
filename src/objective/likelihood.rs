//! Chi-squared, log-likelihood and raw intensity objectives.

use super::{Amplitude, Objective, Parameters};
use crate::config::{Mode, PoolConfig};
use crate::error::{ForemanError, Result};
use crate::interface::{ConcatInterface, SumInterface};
use crate::kernel::Kernel;
use crate::partition::{DataBundle, Shard, ShardValue};
use crate::worker::{Float, WorkerPool, WorkerPoolStats};
use anyhow::{Context, bail, ensure};

/// Options shared by every likelihood.
#[derive(Debug, Clone)]
pub struct LikelihoodOptions {
    /// Return values suited to a minimizer (`true`) or a maximizer.
    pub minimize: bool,
    /// Pool settings. The mode is always forced to duplex.
    pub pool: PoolConfig,
}

impl Default for LikelihoodOptions {
    fn default() -> Self {
        Self {
            minimize: true,
            pool: PoolConfig::default(),
        }
    }
}

impl LikelihoodOptions {
    pub fn maximize(mut self) -> Self {
        self.minimize = false;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }
}

/// Sends the parameters to every worker and sums the partial results.
///
/// The first worker failure (lowest `process_id`) is raised after all
/// replies have been read.
pub type LikelihoodInterface = SumInterface<Parameters>;

/// A likelihood evaluated in parallel over a partitioned data bundle.
#[derive(Debug)]
pub struct Likelihood {
    pool: WorkerPool<LikelihoodInterface>,
}

impl Likelihood {
    /// Chi-squared against `binned` counts, or against `expected_values`
    /// weighted by `event_errors`.
    ///
    /// Binned: `Σ (I - b)² / b`. Expected: `Σ (I - e)² / σ`.
    pub fn chi_squared<A: Amplitude>(
        amplitude: A,
        initial: Parameters,
        data: &DataBundle,
        options: LikelihoodOptions,
    ) -> Result<Self> {
        require_contiguous(data)?;
        require_key(data, "data", "chi-squared")?;
        let binned = data.numeric("binned").is_some();
        let expected = data.numeric("expected_values").is_some() && data.numeric("event_errors").is_some();
        if !binned && !expected {
            return Err(ForemanError::Config(
                "chi-squared needs 'binned' or both 'expected_values' and 'event_errors'".to_string(),
            ));
        }

        let kernel = ChiSquaredKernel {
            multiplier: if options.minimize { 1.0 } else { -1.0 },
            amplitude,
            initial,
            data: None,
            target: ChiTarget::Unassigned,
        };
        Self::build(data, kernel, options)
    }

    /// Log-likelihood `Σ q·b·ln I`, with `binned` and `quality_factor`
    /// defaulting to one.
    ///
    /// With `monte_carlo` events and a `generated_length` the extended form
    /// `Σ q·ln I_data - (1/generated)·Σ I_mc` is used instead.
    pub fn log_likelihood<A: Amplitude>(
        amplitude: A,
        initial: Parameters,
        data: &DataBundle,
        generated_length: Option<usize>,
        options: LikelihoodOptions,
    ) -> Result<Self> {
        require_contiguous(data)?;
        require_key(data, "data", "log-likelihood")?;
        if generated_length == Some(0) {
            return Err(ForemanError::Config(
                "generated_length must be positive".to_string(),
            ));
        }

        let extended = data.contains("monte_carlo") && generated_length.is_some();
        let kernel = LogLikelihoodKernel {
            multiplier: if options.minimize { -1.0 } else { 1.0 },
            monte_carlo_amplitude: extended.then(|| amplitude.clone()),
            data_amplitude: amplitude,
            initial,
            generated_inverse: generated_length.filter(|_| extended).map(|n| 1.0 / n as f64),
            data: None,
            monte_carlo: None,
            binned: None,
            quality_factor: None,
        };
        Self::build(data, kernel, options)
    }

    fn build<K: Kernel>(data: &DataBundle, kernel: K, options: LikelihoodOptions) -> Result<Self> {
        let config = options.pool.with_mode(Mode::Duplex);
        let pool = WorkerPool::build(data, kernel, LikelihoodInterface::new(), config)?;
        Ok(Self { pool })
    }

    pub fn is_alive(&mut self) -> bool {
        self.pool.is_alive()
    }

    pub fn stats(&mut self) -> WorkerPoolStats {
        self.pool.stats()
    }

    pub fn close(&mut self) {
        self.pool.close();
    }
}

impl Objective for Likelihood {
    fn evaluate(&mut self, parameters: &Parameters) -> Result<f64> {
        self.pool.run(parameters.clone())
    }
}

/// Raw amplitude intensities, concatenated across workers in event order.
#[derive(Debug)]
pub struct Intensity {
    pool: WorkerPool<ConcatInterface<Parameters, f64>>,
}

impl Intensity {
    pub fn new<A: Amplitude>(
        amplitude: A,
        initial: Parameters,
        data: &DataBundle,
        pool: PoolConfig,
    ) -> Result<Self> {
        require_contiguous(data)?;
        require_key(data, "data", "intensity")?;
        let kernel = IntensityKernel {
            amplitude,
            initial,
            data: None,
        };
        let pool = WorkerPool::build(
            data,
            kernel,
            ConcatInterface::new(),
            pool.with_mode(Mode::Duplex),
        )?;
        Ok(Self { pool })
    }

    pub fn evaluate(&mut self, parameters: &Parameters) -> Result<Vec<f64>> {
        self.pool.run(parameters.clone())
    }

    pub fn is_alive(&mut self) -> bool {
        self.pool.is_alive()
    }

    pub fn close(&mut self) {
        self.pool.close();
    }
}

fn require_key(data: &DataBundle, key: &str, objective: &str) -> Result<()> {
    if data.contains(key) {
        Ok(())
    } else {
        Err(ForemanError::Config(format!(
            "{} needs a '{}' entry",
            objective, key
        )))
    }
}

/// Per-event arrays only line up if every key splits into contiguous runs.
pub(super) fn require_contiguous(data: &DataBundle) -> Result<()> {
    match data.iter().find(|(_, value)| value.as_records().is_some()) {
        Some((name, _)) => Err(ForemanError::Config(format!(
            "key '{}' holds records, which are not split in event order",
            name
        ))),
        None => Ok(()),
    }
}

fn take_numeric(shard: &mut Shard, key: &str) -> Option<Vec<f64>> {
    match shard.take(key) {
        Some(ShardValue::Numeric(values)) => Some(values),
        _ => None,
    }
}

fn parameters(request: Option<Parameters>) -> anyhow::Result<Parameters> {
    request.context("likelihoods are evaluated with parameters")
}

fn check_len(intensity: &[f64], expected: usize, what: &str) -> anyhow::Result<()> {
    ensure!(
        intensity.len() == expected,
        "amplitude returned {} intensities for {} {}",
        intensity.len(),
        expected,
        what
    );
    Ok(())
}

#[derive(Clone)]
enum ChiTarget {
    Unassigned,
    Binned(Vec<f64>),
    Expected { values: Vec<f64>, errors: Vec<f64> },
}

#[derive(Clone)]
struct ChiSquaredKernel<A> {
    multiplier: f64,
    amplitude: A,
    initial: Parameters,
    data: Option<ShardValue>,
    target: ChiTarget,
}

impl<A: Amplitude> Kernel for ChiSquaredKernel<A> {
    type Request = Parameters;
    type Response = Float;

    fn assign(&mut self, mut shard: Shard, _process_id: usize) {
        self.data = shard.take("data");
        self.target = match (
            take_numeric(&mut shard, "binned"),
            take_numeric(&mut shard, "expected_values"),
            take_numeric(&mut shard, "event_errors"),
        ) {
            (Some(binned), _, _) => ChiTarget::Binned(binned),
            (None, Some(values), Some(errors)) => ChiTarget::Expected { values, errors },
            _ => ChiTarget::Unassigned,
        };
    }

    fn setup(&mut self) -> anyhow::Result<()> {
        let data = self.data.as_ref().context("no 'data' in shard")?;
        if matches!(self.target, ChiTarget::Unassigned) {
            bail!("no binned or expected values in shard");
        }
        self.amplitude
            .setup(data, &self.initial)
            .context("amplitude setup failed")
    }

    fn process(&mut self, request: Option<Parameters>) -> anyhow::Result<Float> {
        let intensity = self.amplitude.calculate(&parameters(request)?)?;
        let chi = match &self.target {
            ChiTarget::Binned(binned) => {
                check_len(&intensity, binned.len(), "bins")?;
                intensity
                    .iter()
                    .zip(binned)
                    .map(|(i, b)| (i - b).powi(2) / b)
                    .sum::<f64>()
            }
            ChiTarget::Expected { values, errors } => {
                check_len(&intensity, values.len(), "expected values")?;
                intensity
                    .iter()
                    .zip(values.iter().zip(errors))
                    .map(|(i, (e, sigma))| (i - e).powi(2) / sigma)
                    .sum::<f64>()
            }
            ChiTarget::Unassigned => bail!("no binned or expected values in shard"),
        };
        Ok(Float(self.multiplier * chi))
    }
}

#[derive(Clone)]
struct LogLikelihoodKernel<A> {
    multiplier: f64,
    data_amplitude: A,
    monte_carlo_amplitude: Option<A>,
    initial: Parameters,
    generated_inverse: Option<f64>,
    data: Option<ShardValue>,
    monte_carlo: Option<ShardValue>,
    binned: Option<Vec<f64>>,
    quality_factor: Option<Vec<f64>>,
}

impl<A: Amplitude> LogLikelihoodKernel<A> {
    fn weight(&self, event: usize) -> f64 {
        let q = self.quality_factor.as_ref().map_or(1.0, |q| q[event]);
        let b = self.binned.as_ref().map_or(1.0, |b| b[event]);
        q * b
    }
}

impl<A: Amplitude> Kernel for LogLikelihoodKernel<A> {
    type Request = Parameters;
    type Response = Float;

    fn assign(&mut self, mut shard: Shard, _process_id: usize) {
        self.data = shard.take("data");
        self.monte_carlo = shard.take("monte_carlo");
        self.binned = take_numeric(&mut shard, "binned");
        self.quality_factor = take_numeric(&mut shard, "quality_factor");
    }

    fn setup(&mut self) -> anyhow::Result<()> {
        let data = self.data.as_ref().context("no 'data' in shard")?;
        self.data_amplitude
            .setup(data, &self.initial)
            .context("amplitude setup failed")?;

        if let Some(amplitude) = &mut self.monte_carlo_amplitude {
            let monte_carlo = self.monte_carlo.as_ref().context("no 'monte_carlo' in shard")?;
            amplitude
                .setup(monte_carlo, &self.initial)
                .context("Monte Carlo amplitude setup failed")?;
        }
        Ok(())
    }

    fn process(&mut self, request: Option<Parameters>) -> anyhow::Result<Float> {
        let parameters = parameters(request)?;
        let intensity = self.data_amplitude.calculate(&parameters)?;
        let events = self.data.as_ref().map_or(0, ShardValue::len);
        check_len(&intensity, events, "events")?;
        if self.weights_mismatch(events) {
            bail!("per-event weights do not match {} events", events);
        }

        let likelihood = match (&self.monte_carlo_amplitude, self.generated_inverse) {
            (Some(monte_carlo), Some(generated_inverse)) => {
                let data_term: f64 = intensity
                    .iter()
                    .enumerate()
                    .map(|(n, i)| self.quality_factor.as_ref().map_or(1.0, |q| q[n]) * i.ln())
                    .sum();
                let monte_carlo_term: f64 = monte_carlo.calculate(&parameters)?.iter().sum();
                data_term - generated_inverse * monte_carlo_term
            }
            _ => intensity
                .iter()
                .enumerate()
                .map(|(n, i)| self.weight(n) * i.ln())
                .sum(),
        };
        Ok(Float(self.multiplier * likelihood))
    }
}

impl<A> LogLikelihoodKernel<A> {
    fn weights_mismatch(&self, events: usize) -> bool {
        [&self.binned, &self.quality_factor]
            .into_iter()
            .flatten()
            .any(|weights| weights.len() != events)
    }
}

#[derive(Clone)]
struct IntensityKernel<A> {
    amplitude: A,
    initial: Parameters,
    data: Option<ShardValue>,
}

impl<A: Amplitude> Kernel for IntensityKernel<A> {
    type Request = Parameters;
    type Response = Vec<f64>;

    fn assign(&mut self, mut shard: Shard, _process_id: usize) {
        self.data = shard.take("data");
    }

    fn setup(&mut self) -> anyhow::Result<()> {
        let data = self.data.as_ref().context("no 'data' in shard")?;
        self.amplitude.setup(data, &self.initial)
    }

    fn process(&mut self, request: Option<Parameters>) -> anyhow::Result<Vec<f64>> {
        self.amplitude.calculate(&parameters(request)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;
    use crate::objective::FunctionAmplitude;

    type Calc = fn(&[f64], &Parameters) -> anyhow::Result<Vec<f64>>;

    /// Intensity `a * x + c` per event.
    fn calc(data: &[f64], p: &Parameters) -> anyhow::Result<Vec<f64>> {
        let a = p.get("a").copied().context("missing a")?;
        let c = p.get("c").copied().unwrap_or(0.0);
        Ok(data.iter().map(|x| a * x + c).collect())
    }

    fn linear() -> FunctionAmplitude<Calc> {
        FunctionAmplitude::new(calc as Calc)
    }

    fn params(a: f64, c: f64) -> Parameters {
        [("a".to_string(), a), ("c".to_string(), c)].into()
    }

    fn options(workers: usize) -> LikelihoodOptions {
        LikelihoodOptions::default().with_pool(
            PoolConfig::new()
                .with_workers(workers)
                .with_backend(Backend::Thread),
        )
    }

    fn events() -> Vec<f64> {
        (1..=9).map(f64::from).collect()
    }

    #[test]
    fn test_chi_squared_binned_matches_serial() {
        let binned: Vec<f64> = events().iter().map(|x| 2.0 * x + 0.5).collect();
        let bundle = DataBundle::new()
            .with("data", events())
            .with("binned", binned.clone());
        let mut likelihood =
            Likelihood::chi_squared(linear(), Parameters::new(), &bundle, options(3)).unwrap();

        let p = params(2.0, 1.0);
        let expected: f64 = events()
            .iter()
            .zip(&binned)
            .map(|(x, b)| (2.0 * x + 1.0 - b).powi(2) / b)
            .sum();
        let value = likelihood.evaluate(&p).unwrap();
        assert!((value - expected).abs() < 1e-12);
        likelihood.close();
    }

    #[test]
    fn test_chi_squared_expected_errors_maximizer() {
        let bundle = DataBundle::new()
            .with("data", events())
            .with("expected_values", vec![1.0; 9])
            .with("event_errors", vec![2.0; 9]);
        let mut likelihood = Likelihood::chi_squared(
            linear(),
            Parameters::new(),
            &bundle,
            options(2).maximize(),
        )
        .unwrap();

        let value = likelihood.evaluate(&params(0.0, 3.0)).unwrap();
        // (3 - 1)^2 / 2 per event, negated for a maximizer
        assert!((value + 18.0).abs() < 1e-12);
    }

    #[test]
    fn test_log_likelihood_of_zero_intensity_is_infinite() {
        let bundle = DataBundle::new().with("data", events());
        let mut likelihood =
            Likelihood::log_likelihood(linear(), Parameters::new(), &bundle, None, options(2))
                .unwrap();

        // ln(0) on every event; negated for a minimizer.
        assert_eq!(likelihood.evaluate(&params(0.0, 0.0)).unwrap(), f64::INFINITY);
        assert!(likelihood.is_alive());

        let expected: f64 = -events().iter().map(|x| x.ln()).sum::<f64>();
        let value = likelihood.evaluate(&params(1.0, 0.0)).unwrap();
        assert!((value - expected).abs() < 1e-9);
        assert_eq!(likelihood.stats().runs_completed, 2);
    }

    #[test]
    fn test_chi_squared_empty_bin_is_infinite_for_maximizer() {
        let bundle = DataBundle::new()
            .with("data", events())
            .with("binned", vec![0.0; 9]);
        let mut likelihood = Likelihood::chi_squared(
            linear(),
            Parameters::new(),
            &bundle,
            options(3).maximize(),
        )
        .unwrap();

        assert_eq!(likelihood.evaluate(&params(1.0, 0.0)).unwrap(), f64::NEG_INFINITY);
        assert!(likelihood.is_alive());
    }

    #[test]
    fn test_chi_squared_requires_target() {
        let bundle = DataBundle::new().with("data", events());
        let err = Likelihood::chi_squared(linear(), Parameters::new(), &bundle, options(2))
            .unwrap_err();
        assert!(matches!(err, ForemanError::Config(_)));
    }

    #[test]
    fn test_log_likelihood_matches_serial() {
        let quality: Vec<f64> = (0..9).map(|i| 0.5 + i as f64 / 10.0).collect();
        let bundle = DataBundle::new()
            .with("data", events())
            .with("quality_factor", quality.clone());
        let mut likelihood =
            Likelihood::log_likelihood(linear(), Parameters::new(), &bundle, None, options(4))
                .unwrap();

        let expected: f64 = -events()
            .iter()
            .zip(&quality)
            .map(|(x, q)| q * (1.5 * x).ln())
            .sum::<f64>();
        let value = likelihood.evaluate(&params(1.5, 0.0)).unwrap();
        assert!((value - expected).abs() < 1e-9);
    }

    #[test]
    fn test_extended_log_likelihood() {
        let monte_carlo: Vec<f64> = (1..=20).map(f64::from).collect();
        let bundle = DataBundle::new()
            .with("data", events())
            .with("monte_carlo", monte_carlo.clone());
        let mut likelihood = Likelihood::log_likelihood(
            linear(),
            Parameters::new(),
            &bundle,
            Some(40),
            options(3),
        )
        .unwrap();

        let data_term: f64 = events().iter().map(|x| (2.0 * x).ln()).sum();
        let mc_term: f64 = monte_carlo.iter().map(|x| 2.0 * x).sum::<f64>() / 40.0;
        let value = likelihood.evaluate(&params(2.0, 0.0)).unwrap();
        assert!((value + (data_term - mc_term)).abs() < 1e-9);
    }

    #[test]
    fn test_missing_parameter_is_compute_error() {
        let bundle = DataBundle::new().with("data", events());
        let mut likelihood =
            Likelihood::log_likelihood(linear(), Parameters::new(), &bundle, None, options(2))
                .unwrap();

        let err = likelihood.evaluate(&Parameters::new()).unwrap_err();
        let failure = err.failure().expect("compute failure");
        assert_eq!(failure.process_id, 0);
        assert_eq!(failure.message, "missing a");
        assert!(likelihood.is_alive());
        assert!(likelihood.evaluate(&params(1.0, 0.0)).is_ok());
    }

    #[test]
    fn test_intensity_concatenates_in_order() {
        let bundle = DataBundle::new().with("data", events());
        let mut intensity =
            Intensity::new(linear(), Parameters::new(), &bundle, options(4).pool).unwrap();
        let values = intensity.evaluate(&params(1.0, 1.0)).unwrap();
        assert_eq!(values, events().iter().map(|x| x + 1.0).collect::<Vec<_>>());
        intensity.close();
        assert!(!intensity.is_alive());
    }

    #[test]
    fn test_records_rejected() {
        let bundle = DataBundle::new()
            .with("data", events())
            .with("tags", ShardValue::records(["a"; 9]).unwrap());
        let err = Intensity::new(linear(), Parameters::new(), &bundle, options(2).pool)
            .unwrap_err();
        assert!(matches!(err, ForemanError::Config(_)));
    }
}
