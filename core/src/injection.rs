//! Diversity injection applied after resampling.
use std::fmt::{self, Display};
use std::rc::Rc;

use log::debug;
use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use crate::map::VesselMap;
use crate::particle::{Particle, Position};
use crate::{NavError, Result};

/// Perturbs or replaces part of a freshly resampled population. Implementations never change the
/// population size.
pub trait Injector {
    fn inject(&mut self, particles: &mut Vec<Particle>, rng: &mut StdRng) -> Result<()>;
}

/// Number of particles touched for a population of `n`, `floor(n * fraction)`.
fn injected_count(n: usize, fraction: f64) -> usize {
    ((n as f64 * fraction).floor() as usize).min(n)
}

/// Redraws the alpha of the worst-weighted fraction around its current value.
#[derive(Clone, Copy, Debug)]
pub struct AlphaVarianceInjector {
    pub fraction: f64,
    /// Standard deviation of the alpha perturbation
    pub alpha_std: f64,
}
impl Default for AlphaVarianceInjector {
    fn default() -> Self {
        AlphaVarianceInjector {
            fraction: 0.05,
            alpha_std: 0.1,
        }
    }
}
impl Display for AlphaVarianceInjector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AlphaVarianceInjector(fraction: {}, alpha_std: {})",
            self.fraction, self.alpha_std
        )
    }
}
impl Injector for AlphaVarianceInjector {
    fn inject(&mut self, particles: &mut Vec<Particle>, rng: &mut StdRng) -> Result<()> {
        let count = injected_count(particles.len(), self.fraction);
        particles.sort_by(|a, b| a.weight.total_cmp(&b.weight));
        for particle in particles.iter_mut().take(count) {
            particle.alpha = Normal::new(particle.alpha, self.alpha_std)
                .map_err(|e| NavError::Configuration(format!("invalid alpha perturbation: {e}")))?
                .sample(rng);
        }
        debug!("Perturbed alpha of {count} particles");
        Ok(())
    }
}

/// Replaces the worst-weighted fraction with particles drawn uniformly over the map.
///
/// A branch is chosen uniformly among all segments and a displacement uniformly along it. New
/// particles start with `default_alpha`, an empty reference history and the mean weight `1 / n`.
/// With `injection_probability < 1` a cycle may skip injection altogether.
#[derive(Clone, Debug)]
pub struct RandomParticleInjector {
    map: Rc<VesselMap>,
    pub fraction: f64,
    pub default_alpha: f64,
    pub injection_probability: f64,
    pub history_length: usize,
}
impl RandomParticleInjector {
    pub fn new(map: Rc<VesselMap>, fraction: f64, default_alpha: f64, history_length: usize) -> Self {
        RandomParticleInjector {
            map,
            fraction,
            default_alpha,
            injection_probability: 1.0,
            history_length,
        }
    }
    pub fn with_probability(mut self, injection_probability: f64) -> Self {
        self.injection_probability = injection_probability;
        self
    }
    fn random_particle(&self, weight: f64, rng: &mut StdRng) -> Result<Particle> {
        let branch = rng.random_range(0..self.map.number_of_vessels());
        let length = self.map.segment_length(branch)?;
        let displacement = if length > 0.0 {
            rng.random_range(0.0..length)
        } else {
            0.0
        };
        Ok(Particle::new(
            Position::new(branch, displacement),
            self.default_alpha,
            weight,
            self.history_length,
        ))
    }
}
impl Display for RandomParticleInjector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RandomParticleInjector(fraction: {}, alpha: {}, probability: {})",
            self.fraction, self.default_alpha, self.injection_probability
        )
    }
}
impl Injector for RandomParticleInjector {
    fn inject(&mut self, particles: &mut Vec<Particle>, rng: &mut StdRng) -> Result<()> {
        if self.map.is_empty() {
            return Err(NavError::InvalidMap("cannot inject into an empty map".into()));
        }
        if self.injection_probability < 1.0 && rng.random::<f64>() >= self.injection_probability {
            return Ok(());
        }
        let n = particles.len();
        let count = injected_count(n, self.fraction);
        if count == 0 {
            return Ok(());
        }
        particles.sort_by(|a, b| b.weight.total_cmp(&a.weight));
        particles.truncate(n - count);
        let weight = 1.0 / n as f64;
        for _ in 0..count {
            let particle = self.random_particle(weight, rng)?;
            particles.push(particle);
        }
        debug!("Replaced {count} particles with random ones");
        Ok(())
    }
}
