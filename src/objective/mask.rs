//! Pass/fail masks computed once per shard by simplex workers.

use super::likelihood::require_contiguous;
use crate::config::{Mode, PoolConfig};
use crate::error::{ForemanError, Result};
use crate::interface::ConcatInterface;
use crate::kernel::Kernel;
use crate::partition::{DataBundle, Shard};
use crate::worker::WorkerPool;
use anyhow::ensure;
use std::str::FromStr;

/// Evaluate `predicate` on every shard in parallel and return the
/// event-ordered mask.
///
/// Workers run in simplex mode: each computes its part right after setup
/// and the pool is closed once the parts are collected.
pub fn compute_mask<F>(bundle: &DataBundle, predicate: F, config: PoolConfig) -> Result<Vec<bool>>
where
    F: Fn(&Shard) -> anyhow::Result<Vec<bool>> + Clone + Send + 'static,
{
    require_contiguous(bundle)?;
    let kernel = MaskKernel {
        predicate,
        shard: Shard::new(),
    };
    let mut pool = WorkerPool::build(
        bundle,
        kernel,
        ConcatInterface::<(), bool>::new(),
        config.with_mode(Mode::Simplex),
    )?;
    let mask = pool.run(());
    pool.close();
    mask
}

#[derive(Clone)]
struct MaskKernel<F> {
    predicate: F,
    shard: Shard,
}

impl<F> Kernel for MaskKernel<F>
where
    F: Fn(&Shard) -> anyhow::Result<Vec<bool>> + Clone + Send + 'static,
{
    type Request = ();
    type Response = Vec<bool>;

    fn assign(&mut self, shard: Shard, _process_id: usize) {
        self.shard = shard;
    }

    fn process(&mut self, _request: Option<()>) -> anyhow::Result<Vec<bool>> {
        let mask = (self.predicate)(&self.shard)?;
        if let Some((name, value)) = self.shard.iter().next() {
            ensure!(
                mask.len() == value.len(),
                "mask has {} entries but '{}' has {} events",
                mask.len(),
                name,
                value.len()
            );
        }
        Ok(mask)
    }
}

/// How several masks are folded into one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MaskLogic {
    #[default]
    And,
    Or,
    Xor,
}

impl MaskLogic {
    fn apply(self, a: bool, b: bool) -> bool {
        match self {
            Self::And => a && b,
            Self::Or => a || b,
            Self::Xor => a ^ b,
        }
    }
}

impl FromStr for MaskLogic {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "and" => Ok(Self::And),
            "or" => Ok(Self::Or),
            "xor" => Ok(Self::Xor),
            _ => Err(format!("Unknown mask logic: '{}'. Valid options: and, or, xor", s)),
        }
    }
}

/// Fold equally long masks together. No masks means nothing is masked.
pub fn combine(masks: &[Vec<bool>], logic: MaskLogic, events: usize) -> Result<Vec<bool>> {
    let mut combined = vec![true; events];
    for (index, mask) in masks.iter().enumerate() {
        if mask.len() != events {
            return Err(ForemanError::Config(format!(
                "mask {} has {} entries, expected {}",
                index,
                mask.len(),
                events
            )));
        }
        if index == 0 {
            combined.copy_from_slice(mask);
        } else {
            for (out, &m) in combined.iter_mut().zip(mask) {
                *out = logic.apply(*out, m);
            }
        }
    }
    Ok(combined)
}

/// Turn a list of selected event indices into a mask.
pub fn selection_to_mask(selected: &[usize], events: usize) -> Result<Vec<bool>> {
    let mut mask = vec![false; events];
    for &index in selected {
        let slot = mask.get_mut(index).ok_or_else(|| {
            ForemanError::Config(format!(
                "selected event {} is out of range for {} events",
                index, events
            ))
        })?;
        *slot = true;
    }
    Ok(mask)
}
