//! Objective functions evaluated across a worker pool.
//!
//! Each objective pairs a kernel that evaluates a user [`Amplitude`] on one
//! shard with an interface that folds the per-shard answers together.
//! Optimizers drive the result through the [`Objective`] trait.
//!
//! Recognised bundle keys:
//!
//! | Key               | Used by                  | Meaning                        |
//! |-------------------|--------------------------|--------------------------------|
//! | `data`            | all                      | Events handed to the amplitude |
//! | `binned`          | chi-squared, log-lh      | Bin counts per event           |
//! | `expected_values` | chi-squared              | Expected intensity per event   |
//! | `event_errors`    | chi-squared              | Error per event                |
//! | `monte_carlo`     | extended log-likelihood  | Accepted Monte Carlo events    |
//! | `quality_factor`  | log-likelihood           | Per-event weight               |

mod likelihood;
pub mod mask;

pub use likelihood::{Intensity, Likelihood, LikelihoodInterface, LikelihoodOptions};

use crate::error::{ForemanError, Result};
use crate::partition::ShardValue;
use anyhow::Context;
use std::collections::BTreeMap;

/// Named fit parameters.
pub type Parameters = BTreeMap<String, f64>;

/// A user-supplied intensity function, evaluated per event.
///
/// Every worker gets its own clone, set up once with that worker's events.
pub trait Amplitude: Clone + Send + 'static {
    /// Bind the events this clone will evaluate.
    fn setup(&mut self, data: &ShardValue, initial: &Parameters) -> anyhow::Result<()>;

    /// Intensity of every bound event at `parameters`.
    fn calculate(&self, parameters: &Parameters) -> anyhow::Result<Vec<f64>>;
}

/// Amplitude backed by a plain function over numeric events.
#[derive(Clone)]
pub struct FunctionAmplitude<F> {
    function: F,
    data: Vec<f64>,
}

impl<F> FunctionAmplitude<F>
where
    F: Fn(&[f64], &Parameters) -> anyhow::Result<Vec<f64>> + Clone + Send + 'static,
{
    pub fn new(function: F) -> Self {
        Self {
            function,
            data: Vec::new(),
        }
    }
}

impl<F> Amplitude for FunctionAmplitude<F>
where
    F: Fn(&[f64], &Parameters) -> anyhow::Result<Vec<f64>> + Clone + Send + 'static,
{
    fn setup(&mut self, data: &ShardValue, _initial: &Parameters) -> anyhow::Result<()> {
        let values = data
            .as_numeric()
            .with_context(|| format!("expected numeric events, got {} data", data.kind()))?;
        self.data = values.to_vec();
        Ok(())
    }

    fn calculate(&self, parameters: &Parameters) -> anyhow::Result<Vec<f64>> {
        (self.function)(&self.data, parameters)
    }
}

/// Maps an optimizer's positional parameter vector onto names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterNames {
    names: Vec<String>,
}

impl ParameterNames {
    pub fn new<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn translate(&self, values: &[f64]) -> Result<Parameters> {
        if values.len() != self.names.len() {
            return Err(ForemanError::Config(format!(
                "expected {} parameter values, got {}",
                self.names.len(),
                values.len()
            )));
        }
        Ok(self.names.iter().cloned().zip(values.iter().copied()).collect())
    }
}

/// A scalar function of named parameters, as seen by an optimizer.
pub trait Objective {
    fn evaluate(&mut self, parameters: &Parameters) -> Result<f64>;

    /// Gradient by central differences with step `1e-8 * max(|x|, 1)`.
    fn gradient(&mut self, parameters: &Parameters) -> Result<Parameters> {
        let mut gradient = Parameters::new();
        let mut probe = parameters.clone();
        for (name, &value) in parameters {
            let eps = 1e-8 * value.abs().max(1.0);

            probe.insert(name.clone(), value + eps);
            let f_plus = self.evaluate(&probe)?;
            probe.insert(name.clone(), value - eps);
            let f_minus = self.evaluate(&probe)?;
            probe.insert(name.clone(), value);

            gradient.insert(name.clone(), (f_plus - f_minus) / (2.0 * eps));
        }
        Ok(gradient)
    }

    /// Evaluate at a positional parameter vector.
    fn evaluate_values(&mut self, names: &ParameterNames, values: &[f64]) -> Result<f64> {
        let parameters = names.translate(values)?;
        self.evaluate(&parameters)
    }
}
