//! Per-stream numerical transforms.
//!
//! A process runs exactly one stage (detrend or integrate). Each stream key
//! gets its own [`TransformState`], created when the stream's metadata is
//! first accepted and carried across every later frame.

pub mod detrend;
pub mod kalman;

pub use detrend::DetrendState;
pub use kalman::{IntegrationOutput, IntegrationState, KalmanBoundary, KalmanTuning};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::stream::topic::SegmentRule;

/// Stage identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    #[default]
    Detrend,
    Integrate,
}

impl StageKind {
    /// Input topic segment the stage rewrites by default.
    pub const fn default_input_segment(self) -> &'static str {
        match self {
            StageKind::Detrend => "raw",
            StageKind::Integrate => "acc",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Detrend => write!(f, "detrend"),
            StageKind::Integrate => write!(f, "integrate"),
        }
    }
}

// ============================================================================
// Stage Configuration
// ============================================================================

/// Everything `configure` supplies: stage identity, topic rewrite rule and
/// filter parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub kind: StageKind,
    pub rewrite: SegmentRule,
    pub kalman: KalmanTuning,
}

impl Stage {
    /// Detrend stage publishing under `.../detrend/...`.
    pub fn detrend() -> Self {
        Self {
            kind: StageKind::Detrend,
            rewrite: SegmentRule::matching("raw", "detrend"),
            kalman: KalmanTuning::default(),
        }
    }

    /// Integration stage publishing under `.../displ/...` (or `.../vel/...`).
    pub fn integrate(kalman: KalmanTuning) -> Self {
        Self {
            kind: StageKind::Integrate,
            rewrite: SegmentRule::matching("acc", kalman.output.topic_segment()),
            kalman,
        }
    }

    pub fn with_rewrite(mut self, rewrite: SegmentRule) -> Self {
        self.rewrite = rewrite;
        self
    }

    /// `(Name, Output)` of the provenance record appended to the analysis chain.
    pub const fn analysis_record(&self) -> (&'static str, &'static str) {
        match self.kind {
            StageKind::Detrend => ("Detrend", "detrended"),
            StageKind::Integrate => ("Integration", self.kalman.output.quantity()),
        }
    }

    /// Replacement for `Data.Unit`, if the stage changes the physical unit.
    pub const fn output_unit(&self) -> Option<&'static str> {
        match self.kind {
            StageKind::Detrend => None,
            StageKind::Integrate => Some(self.kalman.output.unit()),
        }
    }

    /// Whether metadata must carry `"Analysis chain"[0].Sampling`.
    pub const fn requires_sampling(&self) -> bool {
        matches!(self.kind, StageKind::Integrate)
    }

    /// Seed state for a newly registered stream.
    pub fn initial_state(&self, sampling_interval: Option<f64>) -> TransformState {
        match self.kind {
            StageKind::Detrend => TransformState::Detrend(DetrendState::default()),
            StageKind::Integrate => TransformState::Integration {
                state: IntegrationState::new(sampling_interval.unwrap_or_default()),
                tuning: self.kalman,
            },
        }
    }
}

impl Default for Stage {
    fn default() -> Self {
        Self::detrend()
    }
}

// ============================================================================
// Transform State
// ============================================================================

/// Carried state of one stream's transform.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformState {
    Detrend(DetrendState),
    /// Tuning is captured at creation so reconfiguring the dispatcher does not
    /// alter streams already in flight.
    Integration {
        state: IntegrationState,
        tuning: KalmanTuning,
    },
}

impl TransformState {
    pub const fn kind(&self) -> StageKind {
        match self {
            TransformState::Detrend(_) => StageKind::Detrend,
            TransformState::Integration { .. } => StageKind::Integrate,
        }
    }

    /// Transform one frame in place; output length always equals input length.
    pub fn apply(&mut self, samples: &mut [f64]) {
        match self {
            TransformState::Detrend(state) => state.apply(samples),
            TransformState::Integration { state, tuning } => state.apply(samples, tuning),
        }
    }
}
