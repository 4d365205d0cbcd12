//! Filter configuration, the four-stage particle filter and the navigator that owns the population.
//!
//! A [`ParticleFilter`] runs one update cycle over a population it is handed: motion, measurement
//! weighting, resampling, then injection, always in that order. A [`VesselNavigator`] wraps the
//! filter with everything a caller needs for online use: it builds the initial population from a
//! [`FilterConfig`], keeps the population between steps, clusters it after every step and reports
//! each step to an optional [`EventSink`].
use std::fmt::{self, Debug};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::rc::Rc;
use std::str::FromStr;

use log::{debug, info};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::estimate::{ClusterPositionEstimate, PositionEstimator};
use crate::events::{EventSink, StepEvent};
use crate::injection::{AlphaVarianceInjector, Injector, RandomParticleInjector};
use crate::map::VesselMap;
use crate::measurements::{
    DerivativeDtwMeasurementModel, DerivativeSettings, InstantaneousMeasurementModel,
    MeasurementModel, SlidingDtwMeasurementModel, WeightTransform,
};
use crate::motion::{DEFAULT_MOTION_NOISE, MotionModel};
use crate::particle::{
    Particle, ParticleResamplingStrategy, Position, effective_sample_size, mean_alpha,
};
use crate::{NavError, Result};

/// Impedance weighting strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum MeasurementType {
    Instantaneous,
    #[default]
    SlidingDtw,
    DerivativeDtw,
}
impl FromStr for MeasurementType {
    type Err = NavError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "instantaneous" | "ahistoric" => Ok(MeasurementType::Instantaneous),
            "sliding-dtw" | "dtw" => Ok(MeasurementType::SlidingDtw),
            "derivative-dtw" => Ok(MeasurementType::DerivativeDtw),
            other => Err(NavError::Configuration(format!(
                "unknown measurement type '{other}'"
            ))),
        }
    }
}

/// Post-resampling diversity strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum InjectorType {
    #[default]
    AlphaVariance,
    RandomParticle,
}
impl FromStr for InjectorType {
    type Err = NavError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "alpha-variance" | "alpha" => Ok(InjectorType::AlphaVariance),
            "random-particle" | "random" => Ok(InjectorType::RandomParticle),
            other => Err(NavError::Configuration(format!(
                "unknown injector type '{other}'"
            ))),
        }
    }
}

/// Setup parameters of a navigator.
///
/// Every field has a serde default, so configuration files only need to name what they change.
/// Call [`FilterConfig::validate`] (the navigator does) before use.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub num_particles: usize,
    pub initial_branch: usize,
    pub initial_position_center: f64,
    pub initial_position_std: f64,
    pub alpha_center: f64,
    pub alpha_std: f64,
    pub measurement_type: MeasurementType,
    /// Discrepancy-to-weight conversion; `None` selects inversion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_transform: Option<WeightTransform>,
    /// Length of the impedance and reference windows of the DTW models
    pub window_length: usize,
    /// Number of displacement readings the motion noise is estimated from
    pub displacement_window: usize,
    /// Motion noise used before two displacement readings exist
    pub default_motion_noise: f64,
    pub injector_type: InjectorType,
    pub injected_fraction: f64,
    /// Standard deviation of the alpha perturbation of the alpha-variance injector
    pub injection_alpha_std: f64,
    /// Alpha of particles created by the random-particle injector; `None` uses `alpha_center`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub injected_alpha: Option<f64>,
    /// Probability that the random-particle injector fires on a given cycle
    pub injection_probability: f64,
    pub resampling_strategy: ParticleResamplingStrategy,
    pub seed: u64,
    pub derivative: DerivativeSettings,
    pub clustering: PositionEstimator,
}
impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            num_particles: 1000,
            initial_branch: 0,
            initial_position_center: 0.0,
            initial_position_std: 1.0,
            alpha_center: 1.0,
            alpha_std: 0.1,
            measurement_type: MeasurementType::default(),
            weight_transform: None,
            window_length: 10,
            displacement_window: 10,
            default_motion_noise: DEFAULT_MOTION_NOISE,
            injector_type: InjectorType::default(),
            injected_fraction: 0.05,
            injection_alpha_std: 0.1,
            injected_alpha: None,
            injection_probability: 1.0,
            resampling_strategy: ParticleResamplingStrategy::default(),
            seed: 42,
            derivative: DerivativeSettings::default(),
            clustering: PositionEstimator::default(),
        }
    }
}

fn check(condition: bool, message: impl FnOnce() -> String) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(NavError::Configuration(message()))
    }
}

impl FilterConfig {
    /// Reject configurations the filter cannot run with.
    pub fn validate(&self) -> Result<()> {
        check(self.num_particles > 0, || {
            "num_particles must be at least 1".into()
        })?;
        for (name, value) in [
            ("initial_position_center", self.initial_position_center),
            ("alpha_center", self.alpha_center),
        ] {
            check(value.is_finite(), || format!("{name} must be finite, got {value}"))?;
        }
        for (name, value) in [
            ("initial_position_std", self.initial_position_std),
            ("alpha_std", self.alpha_std),
            ("default_motion_noise", self.default_motion_noise),
            ("injection_alpha_std", self.injection_alpha_std),
        ] {
            check(value.is_finite() && value >= 0.0, || {
                format!("{name} must be a non-negative finite number, got {value}")
            })?;
        }
        for (name, value) in [
            ("injected_fraction", self.injected_fraction),
            ("injection_probability", self.injection_probability),
            ("derivative.blend", self.derivative.blend),
        ] {
            check((0.0..=1.0).contains(&value), || {
                format!("{name} must lie in [0, 1], got {value}")
            })?;
        }
        check(
            self.derivative.smoothing_factor > 0.0 && self.derivative.smoothing_factor <= 1.0,
            || {
                format!(
                    "derivative.smoothing_factor must lie in (0, 1], got {}",
                    self.derivative.smoothing_factor
                )
            },
        )?;
        check(self.window_length > 0, || "window_length must be at least 1".into())?;
        check(self.displacement_window > 0, || {
            "displacement_window must be at least 1".into()
        })?;
        if let Some(alpha) = self.injected_alpha {
            check(alpha.is_finite(), || format!("injected_alpha must be finite, got {alpha}"))?;
        }
        check(
            self.clustering.eps > 0.0 && self.clustering.eps.is_finite(),
            || format!("clustering.eps must be positive, got {}", self.clustering.eps),
        )?;
        check(self.clustering.min_samples > 0, || {
            "clustering.min_samples must be at least 1".into()
        })
    }
    pub fn weight_transform(&self) -> WeightTransform {
        self.weight_transform.unwrap_or_default()
    }
    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(|e| NavError::Serialization(e.to_string()))
    }
    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(|e| NavError::Serialization(e.to_string()))
    }
    /// Write the configuration as YAML.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(|e| NavError::Serialization(e.to_string()))?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }
    /// Read the configuration from YAML.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(|e| NavError::Serialization(e.to_string()))
    }
    /// Write the configuration as TOML.
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(|e| NavError::Serialization(e.to_string()))?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }
    /// Read the configuration from TOML.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut s = String::new();
        File::open(path)?.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(|e| NavError::Serialization(e.to_string()))
    }
    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(unsupported_extension(p)),
        }
    }
    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(unsupported_extension(p)),
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

fn unsupported_extension(path: &Path) -> NavError {
    NavError::Configuration(format!(
        "unsupported configuration file extension: {}",
        path.display()
    ))
}

/// One motion → weighting → resampling → injection cycle over a borrowed population.
///
/// The filter owns the run's only random source; every stochastic stage draws from it, so two
/// filters built with the same seed and fed the same inputs produce identical populations.
pub struct ParticleFilter {
    motion: MotionModel,
    measurement: Box<dyn MeasurementModel>,
    resampling_strategy: ParticleResamplingStrategy,
    injector: Box<dyn Injector>,
    rng: StdRng,
    last_effective_sample_size: f64,
}
impl Debug for ParticleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParticleFilter")
            .field("motion", &self.motion)
            .field("resampling_strategy", &self.resampling_strategy)
            .field("last_effective_sample_size", &self.last_effective_sample_size)
            .finish_non_exhaustive()
    }
}
impl ParticleFilter {
    /// Assemble a filter from explicit stages.
    pub fn new(
        motion: MotionModel,
        measurement: Box<dyn MeasurementModel>,
        resampling_strategy: ParticleResamplingStrategy,
        injector: Box<dyn Injector>,
        rng: StdRng,
    ) -> Self {
        ParticleFilter {
            motion,
            measurement,
            resampling_strategy,
            injector,
            rng,
            last_effective_sample_size: 0.0,
        }
    }
    /// Assemble the stages a configuration selects.
    pub fn from_config(map: Rc<VesselMap>, config: &FilterConfig) -> Result<Self> {
        config.validate()?;
        let transform = config.weight_transform();
        let motion = MotionModel::new(
            Rc::clone(&map),
            config.displacement_window,
            config.default_motion_noise,
        );
        let measurement: Box<dyn MeasurementModel> = match config.measurement_type {
            MeasurementType::Instantaneous => {
                Box::new(InstantaneousMeasurementModel::new(Rc::clone(&map), transform))
            }
            MeasurementType::SlidingDtw => Box::new(SlidingDtwMeasurementModel::new(
                Rc::clone(&map),
                config.window_length,
                transform,
            )),
            MeasurementType::DerivativeDtw => Box::new(DerivativeDtwMeasurementModel::new(
                Rc::clone(&map),
                config.window_length,
                transform,
                config.derivative,
            )),
        };
        let injector: Box<dyn Injector> = match config.injector_type {
            InjectorType::AlphaVariance => Box::new(AlphaVarianceInjector {
                fraction: config.injected_fraction,
                alpha_std: config.injection_alpha_std,
            }),
            InjectorType::RandomParticle => Box::new(
                RandomParticleInjector::new(
                    map,
                    config.injected_fraction,
                    config.injected_alpha.unwrap_or(config.alpha_center),
                    config.window_length,
                )
                .with_probability(config.injection_probability),
            ),
        };
        Ok(ParticleFilter::new(
            motion,
            measurement,
            config.resampling_strategy,
            injector,
            StdRng::seed_from_u64(config.seed),
        ))
    }
    /// Run one full update cycle.
    ///
    /// # Arguments
    /// * `previous` - Population from the previous cycle (or the initial population).
    /// * `displacement` - Raw displacement reading for this step.
    /// * `impedance` - Impedance reading for this step.
    ///
    /// # Returns
    /// The new population, the same size as `previous`.
    ///
    /// # Errors
    /// Fails on a non-finite reading or if a particle references a branch that is not in the map.
    pub fn filter(
        &mut self,
        previous: Vec<Particle>,
        displacement: f64,
        impedance: f64,
    ) -> Result<Vec<Particle>> {
        check_reading(displacement, impedance)?;
        let mut particles = previous;
        self.motion
            .move_particles(&mut particles, displacement, &mut self.rng)?;
        self.measurement.weight_particles(&mut particles, impedance)?;
        self.last_effective_sample_size = effective_sample_size(&particles);
        let mut resampled = self.resampling_strategy.resample(&particles, &mut self.rng);
        self.injector.inject(&mut resampled, &mut self.rng)?;
        Ok(resampled)
    }
    /// Effective sample size of the weighted population of the last cycle, before resampling.
    pub fn last_effective_sample_size(&self) -> f64 {
        self.last_effective_sample_size
    }
    /// The filter's random source, for drawing initial populations from the same stream.
    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

/// Reject NaN and infinite readings before they reach the population.
fn check_reading(displacement: f64, impedance: f64) -> Result<()> {
    if !displacement.is_finite() {
        return Err(NavError::InvalidMeasurement(format!(
            "displacement reading {displacement} is not finite"
        )));
    }
    if !impedance.is_finite() {
        return Err(NavError::InvalidMeasurement(format!(
            "impedance reading {impedance} is not finite"
        )));
    }
    Ok(())
}

/// Draw the initial population around the configured position and alpha.
///
/// Displacements are clamped onto the initial branch; every particle starts with weight `1 / n`
/// and a reference cursor at its own position.
pub fn initial_particles(
    map: &VesselMap,
    config: &FilterConfig,
    rng: &mut StdRng,
) -> Result<Vec<Particle>> {
    let length = map.segment_length(config.initial_branch)?;
    let position_distribution = Normal::new(config.initial_position_center, config.initial_position_std)
        .map_err(|e| NavError::Configuration(format!("invalid initial position: {e}")))?;
    let alpha_distribution = Normal::new(config.alpha_center, config.alpha_std)
        .map_err(|e| NavError::Configuration(format!("invalid initial alpha: {e}")))?;
    let weight = 1.0 / config.num_particles as f64;
    Ok((0..config.num_particles)
        .map(|_| {
            let displacement = position_distribution.sample(rng).clamp(0.0, length);
            let alpha = alpha_distribution.sample(rng);
            Particle::new(
                Position::new(config.initial_branch, displacement),
                alpha,
                weight,
                config.window_length,
            )
        })
        .collect())
}

/// Online position estimator: owns the map, the filter and the population between steps.
#[derive(Debug)]
pub struct VesselNavigator {
    map: Rc<VesselMap>,
    config: FilterConfig,
    filter: ParticleFilter,
    estimator: PositionEstimator,
    particles: Vec<Particle>,
    step: usize,
}
impl VesselNavigator {
    /// Validate the configuration against the map and draw the initial population.
    pub fn new(map: Rc<VesselMap>, config: FilterConfig) -> Result<Self> {
        config.validate()?;
        if map.is_empty() {
            return Err(NavError::InvalidMap("map has no vessels".into()));
        }
        if map.check_branch(config.initial_branch).is_err() {
            return Err(NavError::Configuration(format!(
                "initial branch {} is not in the map ({} vessels)",
                config.initial_branch,
                map.number_of_vessels()
            )));
        }
        let mut filter = ParticleFilter::from_config(Rc::clone(&map), &config)?;
        let particles = initial_particles(&map, &config, filter.rng_mut())?;
        info!(
            "Initialized {} particles on branch {} around {} (alpha {} ± {}), {:?} weighting, {:?} injection, seed {}",
            config.num_particles,
            config.initial_branch,
            config.initial_position_center,
            config.alpha_center,
            config.alpha_std,
            config.measurement_type,
            config.injector_type,
            config.seed
        );
        Ok(VesselNavigator {
            map,
            estimator: config.clustering,
            config,
            filter,
            particles,
            step: 0,
        })
    }
    /// Advance the population by one measurement pair and cluster the result.
    ///
    /// A non-finite reading is rejected with [`NavError::InvalidMeasurement`] and leaves the
    /// population untouched.
    pub fn update_step(
        &mut self,
        displacement: f64,
        impedance: f64,
    ) -> Result<ClusterPositionEstimate> {
        check_reading(displacement, impedance)?;
        let previous = std::mem::take(&mut self.particles);
        self.particles = self.filter.filter(previous, displacement, impedance)?;
        self.step += 1;
        let estimate = self.estimate();
        debug!("Step {}: {}", self.step, estimate);
        Ok(estimate)
    }
    /// [`VesselNavigator::update_step`], reporting the step to `sink`.
    pub fn update_step_with_sink(
        &mut self,
        displacement: f64,
        impedance: f64,
        sink: &mut dyn EventSink,
    ) -> Result<ClusterPositionEstimate> {
        let estimate = self.update_step(displacement, impedance)?;
        sink.record(&StepEvent {
            step: self.step,
            displacement,
            impedance,
            effective_sample_size: self.filter.last_effective_sample_size(),
            mean_alpha: self.mean_alpha(),
            estimate: estimate.clone(),
        });
        Ok(estimate)
    }
    /// Run a sequence of `(displacement, impedance)` pairs.
    pub fn update_steps(&mut self, measurements: &[(f64, f64)]) -> Result<Vec<ClusterPositionEstimate>> {
        measurements
            .iter()
            .map(|&(displacement, impedance)| self.update_step(displacement, impedance))
            .collect()
    }
    /// Cluster the current population.
    pub fn estimate(&self) -> ClusterPositionEstimate {
        self.estimator.estimate(&self.particles)
    }
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }
    /// Mean alpha of the current population, the filter's estimate of the displacement scale.
    pub fn mean_alpha(&self) -> f64 {
        mean_alpha(&self.particles).unwrap_or(self.config.alpha_center)
    }
    /// Number of completed update steps.
    pub fn step(&self) -> usize {
        self.step
    }
    pub fn map(&self) -> &VesselMap {
        &self.map
    }
    pub fn config(&self) -> &FilterConfig {
        &self.config
    }
}
