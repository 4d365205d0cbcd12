//! Post-hoc replay of recorded catheter trajectories.
//!
//! This module provides:
//! - `TrajectoryRecord` for reading and writing recorded measurement pairs to/from CSV files
//! - `run_post_hoc` to replay a recording through a navigator
//! - `EstimateRecord` for exporting the per-step estimates as CSV
//! - `evaluate` and `rms` for scoring estimates against ground truth
//! - Signal normalization helpers applied to maps and impedance streams before filtering
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::events::EventSink;
use crate::filter::VesselNavigator;
use crate::map::{CenterlineSample, VesselMap};
use crate::signal::{mean, sample_std, standard_error};
use crate::{NavError, Result};

/// Number of leading samples a normalizer is computed from.
pub const NORMALIZATION_SAMPLES: usize = 10;

/// One recorded time step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryRecord {
    /// Displacement reading since the previous step
    pub displacement: f64,
    /// Impedance (or diameter-derived impedance) reading
    pub impedance: f64,
    /// True centerline distance from the root of the tree, when known
    #[serde(default)]
    pub ground_truth: Option<f64>,
}
impl TrajectoryRecord {
    /// Reads a CSV file with `displacement`, `impedance` and optional `ground_truth` columns.
    ///
    /// # Arguments
    /// * `path` - Path to the CSV file to read.
    ///
    /// # Returns
    /// * `Ok(Vec<TrajectoryRecord>)` if successful.
    /// * `Err` if the file cannot be read or parsed.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in reader.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }
    /// Writes records to a CSV file with a header row.
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Flattened per-step estimate, one CSV row per update step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EstimateRecord {
    pub step: usize,
    pub displacement: f64,
    pub impedance: f64,
    pub first_branch: Option<usize>,
    pub first_center: Option<f64>,
    pub first_error: Option<f64>,
    /// Primary cluster center as a distance from the root, the frame of `ground_truth`
    pub first_distance: Option<f64>,
    pub second_branch: Option<usize>,
    pub second_center: Option<f64>,
    pub second_error: Option<f64>,
    pub number_of_clusters: usize,
    pub number_of_noise: usize,
    pub mean_alpha: f64,
    pub ground_truth: Option<f64>,
}
impl EstimateRecord {
    /// Signed deviation of the primary cluster from ground truth, both measured from the root.
    pub fn deviation(&self) -> Option<f64> {
        Some(self.first_distance? - self.ground_truth?)
    }
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        let mut reader = csv::Reader::from_path(path)?;
        reader
            .deserialize()
            .map(|row| row.map_err(NavError::from))
            .collect()
    }
}

/// Replay a recording through `navigator`, reporting every step to `sink`.
///
/// Impedances are passed through unchanged; normalize them beforehand (see
/// [`ImpedanceNormalizer`]) if the map holds normalized reference values.
pub fn run_post_hoc(
    navigator: &mut VesselNavigator,
    records: &[TrajectoryRecord],
    sink: &mut dyn EventSink,
) -> Result<Vec<EstimateRecord>> {
    let mut estimates = Vec::with_capacity(records.len());
    for record in records {
        let estimate =
            navigator.update_step_with_sink(record.displacement, record.impedance, sink)?;
        let first = estimate.first_cluster;
        let second = estimate.second_cluster;
        let first_distance = first
            .map(|c| navigator.map().distance_from_root(c.branch, c.center))
            .transpose()?;
        estimates.push(EstimateRecord {
            step: navigator.step(),
            displacement: record.displacement,
            impedance: record.impedance,
            first_branch: first.map(|c| c.branch),
            first_center: first.map(|c| c.center),
            first_error: first.map(|c| c.error),
            first_distance,
            second_branch: second.map(|c| c.branch),
            second_center: second.map(|c| c.center),
            second_error: second.map(|c| c.error),
            number_of_clusters: estimate.number_of_clusters,
            number_of_noise: estimate.number_of_noise,
            mean_alpha: navigator.mean_alpha(),
            ground_truth: record.ground_truth,
        });
    }
    Ok(estimates)
}

/// Accuracy of a replay against ground truth.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSummary {
    /// Steps that had both an estimate and a ground truth value
    pub steps_evaluated: usize,
    /// Root mean square of the estimate deviations
    pub rms_error: f64,
    /// Deviation at the last evaluated step
    pub final_difference: f64,
    pub mean_absolute_deviation: f64,
    pub mean_absolute_deviation_sem: f64,
    /// Mean standard error of the primary cluster, a measure of particle dispersion
    pub mean_dispersion: f64,
    /// RMS error of the raw cumulative displacement, the baseline the filter has to beat
    pub displacement_rms: Option<f64>,
}

/// Root mean square difference between a signal and its ground truth.
///
/// # Errors
/// Returns [`NavError::Configuration`] if the inputs differ in length.
pub fn rms(signal: &[f64], ground_truth: &[f64]) -> Result<f64> {
    if signal.len() != ground_truth.len() {
        return Err(NavError::Configuration(format!(
            "rms needs equal lengths, got {} and {}",
            signal.len(),
            ground_truth.len()
        )));
    }
    if signal.is_empty() {
        return Ok(0.0);
    }
    let sum: f64 = signal
        .iter()
        .zip(ground_truth)
        .map(|(s, g)| (s - g).powi(2))
        .sum();
    Ok((sum / signal.len() as f64).sqrt())
}

/// Score replayed estimates. Returns `None` when no step has both an estimate and ground truth.
pub fn evaluate(estimates: &[EstimateRecord]) -> Option<EvaluationSummary> {
    let deviations: Vec<f64> = estimates.iter().filter_map(|e| e.deviation()).collect();
    let final_difference = *deviations.last()?;
    let absolute: Vec<f64> = deviations.iter().map(|d| d.abs()).collect();
    let zeros = vec![0.0; deviations.len()];
    let dispersion: Vec<f64> = estimates.iter().filter_map(|e| e.first_error).collect();

    let displacement_rms = if estimates.iter().all(|e| e.ground_truth.is_some()) {
        let start = estimates[0].ground_truth.unwrap_or(0.0) - estimates[0].displacement;
        let cumulative: Vec<f64> = estimates
            .iter()
            .scan(start, |position, e| {
                *position += e.displacement;
                Some(*position)
            })
            .collect();
        let truth: Vec<f64> = estimates.iter().filter_map(|e| e.ground_truth).collect();
        rms(&cumulative, &truth).ok()
    } else {
        None
    };
    Some(EvaluationSummary {
        steps_evaluated: deviations.len(),
        rms_error: rms(&deviations, &zeros).ok()?,
        final_difference,
        mean_absolute_deviation: mean(&absolute)?,
        mean_absolute_deviation_sem: standard_error(&absolute).unwrap_or(0.0),
        mean_dispersion: mean(&dispersion).unwrap_or(0.0),
        displacement_rms,
    })
}

/// Mean of the first [`NORMALIZATION_SAMPLES`] values, `None` if it is missing or zero.
fn leading_mean(values: &[f64]) -> Option<f64> {
    let count = values.len().min(NORMALIZATION_SAMPLES);
    mean(&values[..count]).filter(|m| *m != 0.0 && m.is_finite())
}

/// Divide a reference signal by the mean of its first ten values.
///
/// A signal whose leading mean is zero (or that is empty) is returned unchanged.
pub fn normalize_reference(values: &[f64]) -> Vec<f64> {
    match leading_mean(values) {
        Some(normalizer) => values.iter().map(|v| v / normalizer).collect(),
        None => values.to_vec(),
    }
}

/// Scale every reference value of a map by the leading mean of the root segment `0`.
pub fn normalize_map(map: &VesselMap) -> Result<VesselMap> {
    let root: Vec<f64> = map.vessel(0)?.iter().map(|s| s.reference_signal).collect();
    let normalizer = leading_mean(&root).unwrap_or(1.0);
    let mut normalized = VesselMap::new();
    for branch in 0..map.number_of_vessels() {
        let samples = map
            .vessel(branch)?
            .iter()
            .map(|s| CenterlineSample {
                centerline_position: s.centerline_position,
                reference_signal: s.reference_signal / normalizer,
            })
            .collect();
        normalized.add_vessel(branch, samples)?;
    }
    for &(parent, child) in map.mappings() {
        normalized.add_mapping(parent, child)?;
    }
    Ok(normalized)
}

/// Online impedance normalization by the running mean of the first ten readings.
///
/// Until ten readings have been seen the normalizer tracks their mean; afterwards it is frozen.
#[derive(Clone, Debug, Default)]
pub struct ImpedanceNormalizer {
    history: Vec<f64>,
    normalizer: Option<f64>,
}
impl ImpedanceNormalizer {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn normalize(&mut self, impedance: f64) -> f64 {
        if self.history.len() < NORMALIZATION_SAMPLES {
            self.history.push(impedance);
            self.normalizer = leading_mean(&self.history);
        }
        match self.normalizer {
            Some(normalizer) => impedance / normalizer,
            None => impedance,
        }
    }
}

/// Z-score a series; a constant series maps to all zeros.
pub fn standardize(values: &[f64]) -> Vec<f64> {
    let Some(mu) = mean(values) else {
        return Vec::new();
    };
    let sigma = sample_std(values).filter(|s| *s > 0.0).unwrap_or(1.0);
    values.iter().map(|v| (v - mu) / sigma).collect()
}
