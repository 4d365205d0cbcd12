//! Particle-filter catheter localization inside branching vessel trees
//!
//! This crate estimates the position of a catheter moving through a branching vessel tree by fusing two
//! noisy per-step measurements: a relative displacement reading (how far the catheter was advanced or
//! retracted) and an impedance reading (or an impedance derived from the local vessel diameter). The
//! estimate is a sequential Monte-Carlo (particle filter) posterior over `(branch, displacement)` positions
//! that is summarized into a small number of density clusters for reporting.
//!
//! The crate is usable both online (one [`filter::VesselNavigator::update_step`] per incoming measurement
//! pair) and post-hoc (the [`sim`] module replays a recorded trajectory and scores it against ground truth).
//!
//! The numerical work is built on a short list of dependencies:
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): motion
//!   noise, branch choices, resampling offsets and injection. A single seeded `StdRng` per filter keeps runs
//!   reproducible.
//! - [`nalgebra`](https://crates.io/crates/nalgebra): accumulated cost matrices for dynamic time warping.
//! - [`serde`](https://crates.io/crates/serde), [`csv`](https://crates.io/crates/csv) and friends: map,
//!   configuration and trajectory I/O.
//!
//! ## Crate overview
//!
//! - [map]: the static vessel tree (segment arena, reference signals, parent/child adjacency).
//! - [signal]: rolling windows, sample statistics, smoothing, derivative kernels and DTW.
//! - [particle]: particle state and the resampling strategies.
//! - [motion]: displacement-driven motion propagation across segment boundaries.
//! - [measurements]: impedance weighting strategies (instantaneous, sliding DTW, derivative DTW).
//! - [injection]: diversity injection after resampling.
//! - [filter]: configuration, the four-stage particle filter and the navigator that owns the population.
//! - [estimate]: per-branch density clustering into reportable position estimates.
//! - [events]: structured per-step events delivered to a caller-supplied sink.
//! - [sim]: post-hoc replay of recorded trajectories and accuracy metrics.
//!
//! ## Filter cycle
//!
//! Each update step runs motion → measurement weighting → resampling → injection, in that fixed order, and
//! the navigator then clusters the new population:
//!
//! 1. Every particle advances by `displacement * alpha` plus Gaussian noise sized from the standard error
//!    of the recent displacement readings. Leaving a segment walks the tree: backwards through parents
//!    (clamping at the root) or forwards through a uniformly chosen child (clamping at a leaf).
//! 2. The impedance reading is compared with each particle's map prediction (instantaneously or over a
//!    sliding window with DTW), the discrepancy is transformed into a weight and the weights normalized.
//! 3. A systematic (low-variance) resampler draws a new population of the same size.
//! 4. A small fraction of the worst particles has its alpha perturbed, or is replaced by fresh particles
//!    drawn uniformly over the map.
//!
//! ## Conventions
//!
//! Displacements are in map units (typically millimetres along the centerline). Branch indices are the
//! insertion order of the segments; the root segment has no predecessor (`None`). A particle's displacement
//! always lies in `[0, segment_length]` of its branch after a motion step.
pub mod estimate;
pub mod events;
pub mod filter;
pub mod injection;
pub mod map;
pub mod measurements;
pub mod motion;
pub mod particle;
pub mod signal;
pub mod sim;

pub use estimate::{Cluster, ClusterPositionEstimate, PositionEstimator};
pub use filter::{FilterConfig, ParticleFilter, VesselNavigator};
pub use map::VesselMap;
pub use particle::{Particle, Position};

pub use crate::error::{NavError, Result};

mod error {
    use thiserror::Error;

    /// Errors raised by map construction, filter setup, and trajectory I/O.
    ///
    /// Numerical degeneracies (zero weight sums, zero discrepancies, resampling drift) are expected
    /// steady-state conditions and are handled with fallbacks rather than reported here.
    #[derive(Error, Debug)]
    pub enum NavError {
        #[error("Invalid configuration: {0}")]
        Configuration(String),

        #[error("Invalid map: {0}")]
        InvalidMap(String),

        #[error("Invalid measurement: {0}")]
        InvalidMeasurement(String),

        #[error("Branch {branch} does not exist (map has {vessel_count} vessels)")]
        InvalidBranch { branch: usize, vessel_count: usize },

        #[error("IO error: {0}")]
        Io(#[from] std::io::Error),

        #[error("CSV error: {0}")]
        Csv(#[from] csv::Error),

        #[error("Serialization error: {0}")]
        Serialization(String),
    }

    /// Result type for vessel navigation operations
    pub type Result<T> = std::result::Result<T, NavError>;
}
