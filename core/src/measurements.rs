//! Impedance measurement models.
//!
//! Every model turns the shared impedance reading into particle weights in three fixed stages:
//!
//! 1. A strategy-specific raw discrepancy per particle (lower is better), written into `weight`.
//! 2. A [`WeightTransform`] that turns discrepancies into "higher is better" weights.
//! 3. Normalization by the population total, skipped when that total is degenerate.
//!
//! Three strategies are provided: an instantaneous comparison against the map value at the particle
//! position, a sliding-window comparison using dynamic time warping between the recent impedance
//! readings and the map values along each particle's own path, and a derivative-augmented variant of
//! the sliding window that compares rates of change.
use std::fmt::{self, Debug, Display};
use std::rc::Rc;
use std::str::FromStr;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::map::VesselMap;
use crate::particle::{Particle, ReferenceCursor, normalize_weights};
use crate::signal::{DerivativeKernel, RollingWindow, dtw_distance, exponential_smoothing};
use crate::{NavError, Result};

/// Weight assigned to a particle whose discrepancy is (numerically) zero under inversion.
pub const INVERSION_SENTINEL: f64 = 1e12;

/// Conversion from raw discrepancies to unnormalized weights.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum WeightTransform {
    /// `w = 1 / d`, with [`INVERSION_SENTINEL`] for `d` close to zero
    #[default]
    Inversion,
    /// Standardize discrepancies across the population, then `w = 1 / (z / (1 + |z|) + 1)`
    ZScoreSigmoid,
}
impl FromStr for WeightTransform {
    type Err = NavError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "inversion" | "invert" => Ok(WeightTransform::Inversion),
            "z-score-sigmoid" | "zscore" | "sigmoid" => Ok(WeightTransform::ZScoreSigmoid),
            other => Err(NavError::Configuration(format!(
                "unknown weight transform '{other}'"
            ))),
        }
    }
}
impl WeightTransform {
    pub fn apply(&self, particles: &mut [Particle]) {
        match self {
            WeightTransform::Inversion => {
                for particle in particles.iter_mut() {
                    particle.weight = if particle.weight.abs() > 1.0 / INVERSION_SENTINEL {
                        1.0 / particle.weight.abs()
                    } else {
                        INVERSION_SENTINEL
                    };
                }
            }
            WeightTransform::ZScoreSigmoid => {
                let n = particles.len();
                if n == 0 {
                    return;
                }
                let mu = particles.iter().map(|p| p.weight).sum::<f64>() / n as f64;
                let mut sigma = if n > 1 {
                    let variance = particles
                        .iter()
                        .map(|p| (p.weight - mu).powi(2))
                        .sum::<f64>()
                        / (n as f64 - 1.0);
                    variance.sqrt()
                } else {
                    0.0
                };
                // identical discrepancies: every z-score is zero
                if sigma == 0.0 || !sigma.is_finite() {
                    sigma = 1.0;
                }
                for particle in particles.iter_mut() {
                    let z = (particle.weight - mu) / sigma;
                    let squashed = z / (1.0 + z.abs()) + 1.0;
                    particle.weight = 1.0 / squashed.max(1.0 / INVERSION_SENTINEL);
                }
            }
        }
    }
}

/// Weighting strategy shared by all impedance models.
pub trait MeasurementModel {
    /// Write the strategy's raw discrepancy (lower is better) into each particle's weight.
    fn raw_weight_particles(&mut self, particles: &mut [Particle], measurement: f64) -> Result<()>;
    fn weight_transform(&self) -> WeightTransform;
    /// Raw discrepancy, transform, then normalization.
    fn weight_particles(&mut self, particles: &mut [Particle], measurement: f64) -> Result<()> {
        self.raw_weight_particles(particles, measurement)?;
        self.weight_transform().apply(particles);
        normalize_weights(particles);
        Ok(())
    }
}

/// Compares the reading with the map value at each particle's current position.
#[derive(Clone, Debug)]
pub struct InstantaneousMeasurementModel {
    map: Rc<VesselMap>,
    /// Use the squared difference instead of the absolute difference
    pub squared: bool,
    pub transform: WeightTransform,
}
impl InstantaneousMeasurementModel {
    pub fn new(map: Rc<VesselMap>, transform: WeightTransform) -> Self {
        InstantaneousMeasurementModel {
            map,
            squared: false,
            transform,
        }
    }
}
impl Display for InstantaneousMeasurementModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InstantaneousMeasurementModel(squared: {}, transform: {:?})",
            self.squared, self.transform
        )
    }
}
impl MeasurementModel for InstantaneousMeasurementModel {
    fn raw_weight_particles(&mut self, particles: &mut [Particle], measurement: f64) -> Result<()> {
        for particle in particles.iter_mut() {
            let predicted = self
                .map
                .reference_value(particle.position.branch, particle.position.displacement)?;
            let difference = measurement - predicted;
            particle.weight = if self.squared {
                difference * difference
            } else {
                difference.abs()
            };
        }
        Ok(())
    }
    fn weight_transform(&self) -> WeightTransform {
        self.transform
    }
}

/// Map values a particle sensed since its cursor was last updated, in the order it crossed them.
///
/// The particle's target is the integer centerline index nearest to its displacement. Moving forward
/// yields every newly crossed index, moving backward yields the indices being retraced. When the
/// particle changed branch, the walk follows the tree path from the cursor branch to the current one:
/// descending into a child finishes the parent up to its last index and continues from index `0` of
/// the child, ascending into a parent finishes the child down to index `0` and continues from the
/// parent's last index. A particle that did not cross any index yields the value at its target.
///
/// The cursor is moved to the target. A particle whose cursor lies in a tree disconnected from its
/// current branch (possible only on forests) has its history cleared and restarts at the target.
pub fn retrieve_reference_update(map: &VesselMap, particle: &mut Particle) -> Result<Vec<f64>> {
    let branch = particle.position.branch;
    let last = map.last_index(branch)?;
    let target = (particle.position.displacement.round() as i64).clamp(0, last);
    let sample = |b: usize, i: i64| map.reference_value(b, i as f64);

    let mut values = Vec::new();
    match map.branch_path(particle.cursor.branch, branch)? {
        None => {
            particle.reference_history.clear();
        }
        Some(path) => {
            let mut index = particle.cursor.index;
            for step in path.windows(2) {
                let (from, to) = (step[0], step[1]);
                if map.predecessor(to)? == Some(from) {
                    for i in (index + 1)..=map.last_index(from)? {
                        values.push(sample(from, i)?);
                    }
                    index = -1;
                } else {
                    for i in (0..index).rev() {
                        values.push(sample(from, i)?);
                    }
                    index = map.last_index(to)? + 1;
                }
            }
            if target > index {
                for i in (index + 1)..=target {
                    values.push(sample(branch, i)?);
                }
            } else {
                for i in (target..index).rev() {
                    values.push(sample(branch, i)?);
                }
            }
        }
    }
    if values.is_empty() {
        values.push(sample(branch, target)?);
    }
    particle.cursor = ReferenceCursor {
        branch,
        index: target,
    };
    Ok(values)
}

/// Compares the recent impedance readings with the map values along each particle's own path.
///
/// Both windows hold at most `window_length` samples. The discrepancy is the DTW distance between
/// them, which tolerates the particle and the catheter sampling the vessel at different rates.
#[derive(Clone, Debug)]
pub struct SlidingDtwMeasurementModel {
    map: Rc<VesselMap>,
    measurement_history: RollingWindow,
    pub transform: WeightTransform,
}
impl SlidingDtwMeasurementModel {
    pub fn new(map: Rc<VesselMap>, window_length: usize, transform: WeightTransform) -> Self {
        SlidingDtwMeasurementModel {
            map,
            measurement_history: RollingWindow::new(window_length),
            transform,
        }
    }
    pub fn window_length(&self) -> usize {
        self.measurement_history.capacity()
    }
    pub fn measurement_history(&self) -> &RollingWindow {
        &self.measurement_history
    }
    /// Record the reading and extend every particle's reference history; used by both DTW models.
    fn update_histories(&mut self, particles: &mut [Particle], measurement: f64) -> Result<()> {
        self.measurement_history.push(measurement);
        for particle in particles.iter_mut() {
            let update = retrieve_reference_update(&self.map, particle)?;
            particle.reference_history.extend(update);
        }
        Ok(())
    }
}
impl Display for SlidingDtwMeasurementModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SlidingDtwMeasurementModel(window: {}, transform: {:?})",
            self.window_length(),
            self.transform
        )
    }
}
impl MeasurementModel for SlidingDtwMeasurementModel {
    fn raw_weight_particles(&mut self, particles: &mut [Particle], measurement: f64) -> Result<()> {
        self.update_histories(particles, measurement)?;
        let readings = self.measurement_history.to_vec();
        for particle in particles.iter_mut() {
            particle.weight = dtw_distance(&readings, &particle.reference_history.to_vec());
        }
        Ok(())
    }
    fn weight_transform(&self) -> WeightTransform {
        self.transform
    }
}

/// Settings of the derivative-augmented comparison.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DerivativeSettings {
    /// Exponential smoothing factor applied before differentiating
    pub smoothing_factor: f64,
    pub kernel: DerivativeKernel,
    /// Convex weight of the derivative series; `0` compares levels only, `1` rates only
    pub blend: f64,
}
impl Default for DerivativeSettings {
    fn default() -> Self {
        DerivativeSettings {
            smoothing_factor: 0.5,
            kernel: DerivativeKernel::Trailing,
            blend: 0.5,
        }
    }
}
impl DerivativeSettings {
    /// Smooth, differentiate and blend a window.
    ///
    /// Windows too short for the three-point kernel are blended with a zero derivative, so the
    /// readings and a short particle history stay on the same scale.
    pub fn transform_series(&self, values: &[f64]) -> Vec<f64> {
        let smoothed = exponential_smoothing(values, self.smoothing_factor);
        let derivative = self.kernel.apply(&smoothed);
        if derivative.is_empty() {
            return values.iter().map(|v| (1.0 - self.blend) * v).collect();
        }
        derivative
            .iter()
            .enumerate()
            .map(|(i, d)| (1.0 - self.blend) * values[i + 2] + self.blend * d)
            .collect()
    }
}

/// Sliding-window DTW over smoothed rate-of-change series instead of raw levels.
#[derive(Clone, Debug)]
pub struct DerivativeDtwMeasurementModel {
    sliding: SlidingDtwMeasurementModel,
    pub settings: DerivativeSettings,
}
impl DerivativeDtwMeasurementModel {
    pub fn new(
        map: Rc<VesselMap>,
        window_length: usize,
        transform: WeightTransform,
        settings: DerivativeSettings,
    ) -> Self {
        DerivativeDtwMeasurementModel {
            sliding: SlidingDtwMeasurementModel::new(map, window_length, transform),
            settings,
        }
    }
}
impl Display for DerivativeDtwMeasurementModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DerivativeDtwMeasurementModel(window: {}, kernel: {:?}, blend: {})",
            self.sliding.window_length(),
            self.settings.kernel,
            self.settings.blend
        )
    }
}
impl MeasurementModel for DerivativeDtwMeasurementModel {
    fn raw_weight_particles(&mut self, particles: &mut [Particle], measurement: f64) -> Result<()> {
        self.sliding.update_histories(particles, measurement)?;
        let readings = self
            .settings
            .transform_series(&self.sliding.measurement_history.to_vec());
        for particle in particles.iter_mut() {
            let reference = self
                .settings
                .transform_series(&particle.reference_history.to_vec());
            particle.weight = dtw_distance(&readings, &reference);
        }
        debug!("Derivative DTW weighted {} particles", particles.len());
        Ok(())
    }
    fn weight_transform(&self) -> WeightTransform {
        self.sliding.transform
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle::Position;
    use assert_approx_eq::assert_approx_eq;

    /// Branch 0 has value `i` at index `i` (0..=10), branch 1 has `100 + i` (0..=10).
    fn ramp_tree() -> Rc<VesselMap> {
        let mut map = VesselMap::new();
        let first: Vec<f64> = (0..=10).map(|i| i as f64).collect();
        let second: Vec<f64> = (0..=10).map(|i| 100.0 + i as f64).collect();
        map.add_vessel_from_reference_values(0, &first).unwrap();
        map.add_vessel_from_reference_values(1, &second).unwrap();
        map.add_mapping(0, 1).unwrap();
        Rc::new(map)
    }
    fn particle_at(branch: usize, displacement: f64) -> Particle {
        Particle::new(Position::new(branch, displacement), 1.0, 1.0, 10)
    }

    #[test]
    fn retriever_walks_forward_and_backward() {
        let map = ramp_tree();
        let mut p = particle_at(0, 5.0);
        p.position.displacement = 8.2;
        assert_eq!(retrieve_reference_update(&map, &mut p).unwrap(), vec![6.0, 7.0, 8.0]);
        p.position.displacement = 6.0;
        assert_eq!(retrieve_reference_update(&map, &mut p).unwrap(), vec![7.0, 6.0]);
        assert_eq!(retrieve_reference_update(&map, &mut p).unwrap(), vec![6.0]);
        assert_eq!(p.cursor, ReferenceCursor { branch: 0, index: 6 });
    }
    #[test]
    fn retriever_splices_across_branches() {
        let map = ramp_tree();
        let mut p = particle_at(0, 8.0);
        p.position = Position::new(1, 2.0);
        assert_eq!(
            retrieve_reference_update(&map, &mut p).unwrap(),
            vec![9.0, 10.0, 100.0, 101.0, 102.0]
        );
        p.position = Position::new(0, 9.0);
        assert_eq!(
            retrieve_reference_update(&map, &mut p).unwrap(),
            vec![101.0, 100.0, 10.0, 9.0]
        );
    }
    #[test]
    fn inversion_uses_sentinel_for_zero() {
        let mut particles = vec![particle_at(0, 0.0), particle_at(0, 0.0)];
        particles[0].weight = 0.0;
        particles[1].weight = 4.0;
        WeightTransform::Inversion.apply(&mut particles);
        assert_eq!(particles[0].weight, INVERSION_SENTINEL);
        assert_approx_eq!(particles[1].weight, 0.25, 1e-12);
    }
    #[test]
    fn zscore_transform_prefers_small_discrepancies() {
        let mut particles: Vec<Particle> = (0..3).map(|_| particle_at(0, 0.0)).collect();
        for (p, d) in particles.iter_mut().zip([1.0, 2.0, 3.0]) {
            p.weight = d;
        }
        WeightTransform::ZScoreSigmoid.apply(&mut particles);
        // z = -1, 0, 1 -> squashed 0.5, 1.0, 1.5
        assert_approx_eq!(particles[0].weight, 2.0, 1e-12);
        assert_approx_eq!(particles[1].weight, 1.0, 1e-12);
        assert_approx_eq!(particles[2].weight, 1.0 / 1.5, 1e-12);

        let mut equal: Vec<Particle> = (0..3).map(|_| particle_at(0, 0.0)).collect();
        WeightTransform::ZScoreSigmoid.apply(&mut equal);
        assert!(equal.iter().all(|p| p.weight == 1.0));
    }
    #[test]
    fn instantaneous_weights_are_normalized() {
        let mut model = InstantaneousMeasurementModel::new(ramp_tree(), WeightTransform::Inversion);
        let mut particles = vec![particle_at(0, 2.0), particle_at(0, 4.0), particle_at(1, 0.0)];
        model.weight_particles(&mut particles, 3.0).unwrap();
        let total: f64 = particles.iter().map(|p| p.weight).sum();
        assert_approx_eq!(total, 1.0, 1e-12);
        assert_approx_eq!(particles[0].weight, particles[1].weight, 1e-12);
        assert!(particles[2].weight < particles[0].weight);
    }
    #[test]
    fn identical_discrepancies_give_uniform_weights() {
        let mut model = InstantaneousMeasurementModel::new(ramp_tree(), WeightTransform::Inversion);
        let mut particles: Vec<Particle> = (0..4).map(|_| particle_at(0, 5.0)).collect();
        model.weight_particles(&mut particles, 5.0).unwrap();
        for p in &particles {
            assert_approx_eq!(p.weight, 0.25, 1e-12);
        }
    }
    #[test]
    fn sliding_dtw_favours_matching_path() {
        let map = ramp_tree();
        let mut model = SlidingDtwMeasurementModel::new(map, 10, WeightTransform::Inversion);
        let mut particles = vec![particle_at(0, 0.0), particle_at(1, 0.0)];
        for step in 1..=4 {
            for p in particles.iter_mut() {
                p.position.displacement = step as f64;
            }
            model.weight_particles(&mut particles, step as f64).unwrap();
        }
        assert_eq!(model.measurement_history().len(), 4);
        assert!(particles[0].weight > 0.99);
        assert!(particles[1].weight < 0.01);
    }
    #[test]
    fn histories_respect_window_length() {
        let map = ramp_tree();
        let mut model = SlidingDtwMeasurementModel::new(map, 3, WeightTransform::Inversion);
        let mut particles = vec![Particle::new(Position::new(0, 0.0), 1.0, 1.0, 3)];
        for step in 1..=8 {
            particles[0].position.displacement = step as f64;
            model.weight_particles(&mut particles, step as f64).unwrap();
        }
        assert_eq!(model.measurement_history().to_vec(), vec![6.0, 7.0, 8.0]);
        assert_eq!(particles[0].reference_history.to_vec(), vec![6.0, 7.0, 8.0]);
    }
    #[test]
    fn derivative_series_blends_short_windows_with_zero_rate() {
        let settings = DerivativeSettings::default();
        assert_eq!(settings.transform_series(&[1.0, 2.0]), vec![0.5, 1.0]);
        assert_eq!(settings.transform_series(&[4.0, 4.0, 4.0]), vec![2.0]);
        let level_only = DerivativeSettings {
            blend: 0.0,
            ..DerivativeSettings::default()
        };
        assert_eq!(level_only.transform_series(&[1.0, 2.0, 3.0, 4.0]), vec![3.0, 4.0]);
    }
    #[test]
    fn fresh_particle_matches_veteran_under_derivative_dtw() {
        let mut map = VesselMap::new();
        map.add_vessel_from_reference_values(0, &[5.0; 101]).unwrap();
        let mut model = DerivativeDtwMeasurementModel::new(
            Rc::new(map),
            10,
            WeightTransform::Inversion,
            DerivativeSettings::default(),
        );
        let mut particles = vec![particle_at(0, 50.0)];
        for _ in 0..4 {
            model.raw_weight_particles(&mut particles, 5.0).unwrap();
        }
        particles.push(particle_at(0, 50.0));
        model.raw_weight_particles(&mut particles, 5.0).unwrap();
        assert_eq!(particles[0].reference_history.len(), 5);
        assert_approx_eq!(particles[0].weight, 0.0, 1e-12);
        assert_approx_eq!(particles[1].weight, particles[0].weight, 1e-12);
    }
    #[test]
    fn derivative_dtw_weights_sum_to_one() {
        let mut model = DerivativeDtwMeasurementModel::new(
            ramp_tree(),
            10,
            WeightTransform::Inversion,
            DerivativeSettings::default(),
        );
        let mut particles = vec![particle_at(0, 0.0), particle_at(0, 5.0)];
        for step in 1..=5 {
            particles[0].position.displacement = step as f64;
            particles[1].position.displacement = 5.0 + step as f64;
            model.weight_particles(&mut particles, 2.0 * step as f64).unwrap();
        }
        let total: f64 = particles.iter().map(|p| p.weight).sum();
        assert_approx_eq!(total, 1.0, 1e-9);
    }
    #[test]
    fn unknown_branch_propagates() {
        let mut model = InstantaneousMeasurementModel::new(ramp_tree(), WeightTransform::Inversion);
        let mut particles = vec![particle_at(4, 1.0)];
        assert!(model.weight_particles(&mut particles, 1.0).is_err());
    }
}
