//! Structured per-step events.
//!
//! The navigator reports every update step to a caller-supplied [`EventSink`] instead of writing to
//! global state. [`LogSink`] forwards events to the `log` facade; a `Vec<StepEvent>` collects them.
use log::info;
use serde::{Deserialize, Serialize};

use crate::estimate::ClusterPositionEstimate;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    /// One-based index of the update step
    pub step: usize,
    pub displacement: f64,
    pub impedance: f64,
    /// Effective sample size of the weighted population, before resampling
    pub effective_sample_size: f64,
    pub mean_alpha: f64,
    pub estimate: ClusterPositionEstimate,
}

pub trait EventSink {
    fn record(&mut self, event: &StepEvent);
}

/// Writes one `info!` line per step.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;
impl EventSink for LogSink {
    fn record(&mut self, event: &StepEvent) {
        info!(
            "step {}: displacement {:.3}, impedance {:.3}, ess {:.1}, alpha {:.3}, {}",
            event.step,
            event.displacement,
            event.impedance,
            event.effective_sample_size,
            event.mean_alpha,
            event.estimate
        );
    }
}

impl EventSink for Vec<StepEvent> {
    fn record(&mut self, event: &StepEvent) {
        self.push(event.clone());
    }
}
