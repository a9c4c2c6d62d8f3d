//! Particle pools: per-particle four-momentum columns over a shared event axis.
//!
//! Only storage and partitioning live here. A pool is split by cutting every
//! component array of every particle at the same event boundaries.

use super::{Collection, chunk_bounds};
use crate::error::{ForemanError, Result};
use serde::{Deserialize, Serialize};

/// One particle's four-momentum components, one entry per event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    id: i32,
    e: Vec<f64>,
    x: Vec<f64>,
    y: Vec<f64>,
    z: Vec<f64>,
}

impl Particle {
    /// Create a particle from its component columns.
    ///
    /// All four columns must have the same number of events.
    pub fn new(id: i32, e: Vec<f64>, x: Vec<f64>, y: Vec<f64>, z: Vec<f64>) -> Result<Self> {
        let events = e.len();
        if x.len() != events || y.len() != events || z.len() != events {
            return Err(ForemanError::Partition(format!(
                "particle {} has mismatched component lengths (e={}, x={}, y={}, z={})",
                id,
                events,
                x.len(),
                y.len(),
                z.len()
            )));
        }
        Ok(Self { id, e, x, y, z })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn event_count(&self) -> usize {
        self.e.len()
    }

    pub fn e(&self) -> &[f64] {
        &self.e
    }

    pub fn x(&self) -> &[f64] {
        &self.x
    }

    pub fn y(&self) -> &[f64] {
        &self.y
    }

    pub fn z(&self) -> &[f64] {
        &self.z
    }

    /// Split into `n` particles over contiguous event ranges.
    pub fn split(&self, n: usize) -> Vec<Particle> {
        chunk_bounds(self.event_count(), n)
            .into_iter()
            .map(|range| Particle {
                id: self.id,
                e: self.e[range.clone()].to_vec(),
                x: self.x[range.clone()].to_vec(),
                y: self.y[range.clone()].to_vec(),
                z: self.z[range].to_vec(),
            })
            .collect()
    }

    fn extend(&mut self, other: &Particle) {
        self.e.extend_from_slice(&other.e);
        self.x.extend_from_slice(&other.x);
        self.y.extend_from_slice(&other.y);
        self.z.extend_from_slice(&other.z);
    }
}

/// The particles of a reaction, all sharing one event axis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticlePool {
    particles: Vec<Particle>,
}

impl ParticlePool {
    /// Create a pool; every particle must cover the same events.
    pub fn new(particles: Vec<Particle>) -> Result<Self> {
        if let Some(first) = particles.first() {
            let events = first.event_count();
            if let Some(bad) = particles.iter().find(|p| p.event_count() != events) {
                return Err(ForemanError::Partition(format!(
                    "particle {} has {} events, expected {}",
                    bad.id,
                    bad.event_count(),
                    events
                )));
            }
        }
        Ok(Self { particles })
    }

    pub fn event_count(&self) -> usize {
        self.particles.first().map_or(0, Particle::event_count)
    }

    pub fn particle_count(&self) -> usize {
        self.particles.len()
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn particles_by_id(&self, id: i32) -> Vec<&Particle> {
        self.particles.iter().filter(|p| p.id == id).collect()
    }
}

impl Collection for ParticlePool {
    fn len(&self) -> usize {
        self.event_count()
    }

    fn split(&self, n: usize) -> Result<Vec<Self>> {
        if n == 0 {
            return Err(ForemanError::Partition(
                "cannot split a particle pool into 0 parts".to_string(),
            ));
        }
        let mut pools: Vec<ParticlePool> = (0..n).map(|_| ParticlePool::default()).collect();
        for particle in &self.particles {
            for (pool, part) in pools.iter_mut().zip(particle.split(n)) {
                pool.particles.push(part);
            }
        }
        Ok(pools)
    }

    fn join(parts: Vec<Self>) -> Result<Self> {
        let mut parts = parts.into_iter();
        let Some(mut joined) = parts.next() else {
            return Ok(ParticlePool::default());
        };
        for part in parts {
            let same_layout = part.particles.len() == joined.particles.len()
                && part
                    .particles
                    .iter()
                    .zip(&joined.particles)
                    .all(|(a, b)| a.id == b.id);
            if !same_layout {
                return Err(ForemanError::Partition(
                    "particle pools disagree on particle layout".to_string(),
                ));
            }
            for (target, particle) in joined.particles.iter_mut().zip(&part.particles) {
                target.extend(particle);
            }
        }
        Ok(joined)
    }
}
