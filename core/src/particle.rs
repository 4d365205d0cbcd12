//! Particle state and population resampling.
use std::fmt::{self, Display};
use std::str::FromStr;

use log::warn;
use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::NavError;
use crate::signal::RollingWindow;

/// Weight sums at or below this are treated as degenerate.
pub const WEIGHT_EPSILON: f64 = 1e-300;

/// Location of a hypothesis inside the vessel tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub branch: usize,
    /// Distance along the branch centerline from its proximal end
    pub displacement: f64,
}
impl Position {
    pub fn new(branch: usize, displacement: f64) -> Self {
        Position {
            branch,
            displacement,
        }
    }
}

/// Last map sample folded into a particle's reference history.
///
/// `index` is an integer centerline index on `branch`. It may temporarily sit one past either end of
/// the branch while the retriever is splicing several branches together.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReferenceCursor {
    pub branch: usize,
    pub index: i64,
}
impl ReferenceCursor {
    /// Cursor on the integer index nearest to `position`.
    pub fn at(position: Position) -> Self {
        ReferenceCursor {
            branch: position.branch,
            index: position.displacement.round().max(0.0) as i64,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Particle {
    pub position: Position,
    /// Personal scale between raw displacement readings and motion along the centerline
    pub alpha: f64,
    pub weight: f64,
    /// Map values sampled along this particle's own recent path, oldest first
    pub reference_history: RollingWindow,
    pub cursor: ReferenceCursor,
}
impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("branch", &self.position.branch)
            .field("displacement", &self.position.displacement)
            .field("alpha", &self.alpha)
            .field("weight", &self.weight)
            .field("history_length", &self.reference_history.len())
            .finish()
    }
}
impl Particle {
    /// New particle with an empty reference history whose cursor sits at `position`.
    pub fn new(position: Position, alpha: f64, weight: f64, history_length: usize) -> Particle {
        Particle {
            position,
            alpha,
            weight,
            reference_history: RollingWindow::new(history_length),
            cursor: ReferenceCursor::at(position),
        }
    }
    pub fn branch(&self) -> usize {
        self.position.branch
    }
    pub fn displacement(&self) -> f64 {
        self.position.displacement
    }
}

/// Divide every weight by the population total.
///
/// A zero, negative or non-finite total leaves the weights untouched; that state is an expected
/// degeneracy (every particle equally implausible) rather than an error.
pub fn normalize_weights(particles: &mut [Particle]) {
    let sum: f64 = particles.iter().map(|p| p.weight).sum();
    if sum > WEIGHT_EPSILON && sum.is_finite() {
        for particle in particles.iter_mut() {
            particle.weight /= sum;
        }
    }
}

/// Effective sample size `1 / sum(w^2)` of normalized weights; zero for an all-zero population.
pub fn effective_sample_size(particles: &[Particle]) -> f64 {
    let total: f64 = particles.iter().map(|p| p.weight).sum();
    if total <= WEIGHT_EPSILON || !total.is_finite() {
        return 0.0;
    }
    let sum_of_squares: f64 = particles.iter().map(|p| (p.weight / total).powi(2)).sum();
    1.0 / sum_of_squares
}

/// Mean alpha of the population, `None` when it is empty.
pub fn mean_alpha(particles: &[Particle]) -> Option<f64> {
    if particles.is_empty() {
        return None;
    }
    Some(particles.iter().map(|p| p.alpha).sum::<f64>() / particles.len() as f64)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ParticleResamplingStrategy {
    /// Low-variance resampling: one uniform offset, `n` evenly spaced targets
    #[default]
    Systematic,
    /// `n` independent draws from the cumulative weights
    Multinomial,
    /// Deterministic floor copies followed by systematic resampling of the remainders
    Residual,
}
impl FromStr for ParticleResamplingStrategy {
    type Err = NavError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "systematic" | "low-variance" => Ok(ParticleResamplingStrategy::Systematic),
            "multinomial" => Ok(ParticleResamplingStrategy::Multinomial),
            "residual" => Ok(ParticleResamplingStrategy::Residual),
            other => Err(NavError::Configuration(format!(
                "unknown resampling strategy '{other}'"
            ))),
        }
    }
}

impl ParticleResamplingStrategy {
    /// Draw a new population of the same size from the weighted population.
    ///
    /// Copies are independent clones and keep the weight of the particle they were drawn from, so a
    /// subsequent injector can still rank the population. Weights do not need to be normalized. A
    /// population whose total weight is degenerate is returned as an unchanged copy.
    ///
    /// # Arguments
    /// * `particles` - The weighted population.
    /// * `rng` - The filter's random source.
    ///
    /// # Returns
    /// A vector of exactly `particles.len()` particles.
    pub fn resample(&self, particles: &[Particle], rng: &mut StdRng) -> Vec<Particle> {
        let total: f64 = particles.iter().map(|p| p.weight).sum();
        if particles.is_empty() || total <= WEIGHT_EPSILON || !total.is_finite() {
            return particles.to_vec();
        }
        match self {
            ParticleResamplingStrategy::Systematic => Self::systematic_resample(particles, rng),
            ParticleResamplingStrategy::Multinomial => Self::multinomial_resample(particles, rng),
            ParticleResamplingStrategy::Residual => Self::residual_resample(particles, rng),
        }
    }
    fn systematic_resample(particles: &[Particle], rng: &mut StdRng) -> Vec<Particle> {
        let weights: Vec<f64> = particles.iter().map(|p| p.weight).collect();
        systematic_indices(&weights, particles.len(), rng)
            .into_iter()
            .map(|i| particles[i].clone())
            .collect()
    }
    fn multinomial_resample(particles: &[Particle], rng: &mut StdRng) -> Vec<Particle> {
        let n = particles.len();
        let mut cumulative = Vec::with_capacity(n);
        let mut running = 0.0;
        for particle in particles {
            running += particle.weight;
            cumulative.push(running);
        }
        (0..n)
            .map(|_| {
                let target = rng.random::<f64>() * running;
                let i = cumulative.partition_point(|&c| c < target).min(n - 1);
                particles[i].clone()
            })
            .collect()
    }
    fn residual_resample(particles: &[Particle], rng: &mut StdRng) -> Vec<Particle> {
        let n = particles.len();
        let total: f64 = particles.iter().map(|p| p.weight).sum();
        let mut new_particles = Vec::<Particle>::with_capacity(n);
        let mut residual: Vec<f64> = vec![0.0; n];
        for (i, particle) in particles.iter().enumerate() {
            let scaled = particle.weight / total * n as f64;
            let copies = scaled.floor() as usize;
            residual[i] = scaled - copies as f64;
            for _ in 0..copies {
                if new_particles.len() < n {
                    new_particles.push(particle.clone());
                }
            }
        }
        let remaining = n - new_particles.len();
        if remaining > 0 {
            let indices = if residual.iter().sum::<f64>() > WEIGHT_EPSILON {
                systematic_indices(&residual, remaining, rng)
            } else {
                let weights: Vec<f64> = particles.iter().map(|p| p.weight).collect();
                systematic_indices(&weights, remaining, rng)
            };
            new_particles.extend(indices.into_iter().map(|i| particles[i].clone()));
        }
        new_particles
    }
}

/// Indices selected by a single low-variance sweep over the cumulative `weights`.
///
/// One offset `u` is drawn in `[0, 1/count)`; target `j` is `(u + j/count)` scaled by the total weight.
/// The cursor advances until the cumulative weight first reaches the target. If floating-point drift
/// pushes the cursor past the end, the last resolved index (or the first index) is repeated instead.
fn systematic_indices(weights: &[f64], count: usize, rng: &mut StdRng) -> Vec<usize> {
    let total: f64 = weights.iter().sum();
    let step = 1.0 / count as f64;
    let offset = rng.random::<f64>() * step;
    let mut indices = Vec::with_capacity(count);
    let mut cursor = 0;
    let mut cumulative = weights.first().copied().unwrap_or(0.0);
    let mut overflowed = false;
    for j in 0..count {
        let target = (offset + j as f64 * step) * total;
        while cumulative < target && cursor < weights.len() {
            cursor += 1;
            if cursor < weights.len() {
                cumulative += weights[cursor];
            }
        }
        if cursor < weights.len() {
            indices.push(cursor);
        } else {
            overflowed = true;
            indices.push(indices.last().copied().unwrap_or(0));
        }
    }
    if overflowed {
        warn!("Systematic resampling ran past the cumulative weights; repeated the last particle");
    }
    indices
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;

    fn population(weights: &[f64]) -> Vec<Particle> {
        weights
            .iter()
            .enumerate()
            .map(|(i, &w)| Particle::new(Position::new(0, i as f64), 1.0, w, 10))
            .collect()
    }

    #[test]
    fn resampling_preserves_count() {
        let mut rng = StdRng::seed_from_u64(7);
        let particles = population(&[0.1, 0.4, 0.2, 0.3, 0.0]);
        for strategy in [
            ParticleResamplingStrategy::Systematic,
            ParticleResamplingStrategy::Multinomial,
            ParticleResamplingStrategy::Residual,
        ] {
            assert_eq!(strategy.resample(&particles, &mut rng).len(), 5);
        }
    }
    #[test]
    fn systematic_copy_counts_are_tight() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut weights = vec![0.5];
        weights.extend(std::iter::repeat_n(0.5 / 9.0, 9));
        let particles = population(&weights);
        for _ in 0..200 {
            let resampled = ParticleResamplingStrategy::Systematic.resample(&particles, &mut rng);
            let copies = resampled
                .iter()
                .filter(|p| p.position.displacement == 0.0)
                .count();
            // Low-variance sweep: a weight of 0.5 over 10 slots yields exactly 5 copies.
            assert_eq!(copies, 5);
        }
    }
    #[test]
    fn multinomial_frequency_tracks_weight() {
        let mut rng = StdRng::seed_from_u64(11);
        let particles = population(&[0.7, 0.1, 0.1, 0.1]);
        let mut hits = 0;
        let trials = 500;
        for _ in 0..trials {
            let resampled =
                ParticleResamplingStrategy::Multinomial.resample(&particles, &mut rng);
            hits += resampled
                .iter()
                .filter(|p| p.position.displacement == 0.0)
                .count();
        }
        let fraction = hits as f64 / (trials * 4) as f64;
        assert_approx_eq!(fraction, 0.7, 0.05);
    }
    #[test]
    fn residual_takes_floor_copies() {
        let mut rng = StdRng::seed_from_u64(5);
        let particles = population(&[0.5, 0.25, 0.25, 0.0]);
        let resampled = ParticleResamplingStrategy::Residual.resample(&particles, &mut rng);
        let count = |d: f64| {
            resampled
                .iter()
                .filter(|p| p.position.displacement == d)
                .count()
        };
        assert_eq!(count(0.0), 2);
        assert_eq!(count(1.0), 1);
        assert_eq!(count(2.0), 1);
        assert_eq!(count(3.0), 0);
    }
    #[test]
    fn zero_weights_are_returned_unchanged() {
        let mut rng = StdRng::seed_from_u64(1);
        let particles = population(&[0.0, 0.0, 0.0]);
        let resampled = ParticleResamplingStrategy::Systematic.resample(&particles, &mut rng);
        let displacements: Vec<f64> = resampled.iter().map(|p| p.displacement()).collect();
        assert_eq!(displacements, vec![0.0, 1.0, 2.0]);
    }
    #[test]
    fn uniform_weights_do_not_collapse() {
        let mut rng = StdRng::seed_from_u64(9);
        let particles = population(&[0.25; 4]);
        let resampled = ParticleResamplingStrategy::Systematic.resample(&particles, &mut rng);
        let mut displacements: Vec<f64> = resampled.iter().map(|p| p.displacement()).collect();
        displacements.sort_by(f64::total_cmp);
        assert_eq!(displacements, vec![0.0, 1.0, 2.0, 3.0]);
    }
    #[test]
    fn copies_are_independent() {
        let mut rng = StdRng::seed_from_u64(2);
        let particles = population(&[1.0, 0.0]);
        let mut resampled = ParticleResamplingStrategy::Systematic.resample(&particles, &mut rng);
        resampled[0].reference_history.push(4.0);
        assert!(resampled[1].reference_history.is_empty());
        assert!(particles[0].reference_history.is_empty());
    }
    #[test]
    fn normalization_and_ess() {
        let mut particles = population(&[2.0, 2.0, 4.0]);
        normalize_weights(&mut particles);
        let total: f64 = particles.iter().map(|p| p.weight).sum();
        assert_approx_eq!(total, 1.0, 1e-12);
        assert_approx_eq!(particles[2].weight, 0.5, 1e-12);
        assert_approx_eq!(effective_sample_size(&particles), 1.0 / 0.375, 1e-9);

        let mut zeros = population(&[0.0, 0.0]);
        normalize_weights(&mut zeros);
        assert!(zeros.iter().all(|p| p.weight == 0.0));
        assert_eq!(effective_sample_size(&zeros), 0.0);
    }
    #[test]
    fn strategy_names_parse() {
        assert_eq!(
            "residual".parse::<ParticleResamplingStrategy>().unwrap(),
            ParticleResamplingStrategy::Residual
        );
        assert!("stratified".parse::<ParticleResamplingStrategy>().is_err());
    }
}
