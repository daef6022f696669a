//! Kalman Integrator - acceleration to displacement/velocity
//!
//! Constant-velocity model with state `x = [position, velocity]` driven by the
//! acceleration sample as control input:
//!
//! ```text
//! A = [[1, Ts], [0, 1]]     B = [Ts^2/2, Ts]     C = [1, 0]
//!
//! predict:  x- = A x + B a
//!           P- = A P A' + Q (B B')
//! correct:  S  = C P- C' + R
//!           K  = P- C' / S
//!           x  = x- + K (0 - C x-)
//!           P  = (I - K C) P-
//! ```
//!
//! There is no real measurement. A zero pseudo-measurement on position bounds
//! the drift a pure double integration would accumulate. Process noise enters
//! through the control channel (`Q B B'`), not as `Q I`.

use nalgebra::{Matrix2, RowVector2, Vector2};
use serde::{Deserialize, Serialize};

use crate::config::defaults::{DEFAULT_MEASUREMENT_NOISE, DEFAULT_PROCESS_NOISE};

/// Which state component a stream publishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationOutput {
    #[default]
    Displacement,
    Velocity,
}

impl IntegrationOutput {
    /// `Output` field of the provenance record.
    pub const fn quantity(self) -> &'static str {
        match self {
            IntegrationOutput::Displacement => "displacement",
            IntegrationOutput::Velocity => "velocity",
        }
    }

    /// `Data.Unit` written into the output metadata.
    pub const fn unit(self) -> &'static str {
        match self {
            IntegrationOutput::Displacement => "m",
            IntegrationOutput::Velocity => "m/s",
        }
    }

    /// Default topic segment replacing `acc`.
    pub const fn topic_segment(self) -> &'static str {
        match self {
            IntegrationOutput::Displacement => "displ",
            IntegrationOutput::Velocity => "vel",
        }
    }
}

/// How the recursion is aligned with frame boundaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KalmanBoundary {
    /// Every frame emits the carried estimate at index 0 unfiltered and runs
    /// steps `1..N`, step `k` driven by `a[k-1]`. The last acceleration sample
    /// of each frame is not used. Reproduces the reference numerics.
    #[default]
    CarryOver,
    /// Only the very first frame emits the seed state. Later frames step from
    /// index 0 using the previous frame's last acceleration, so the output
    /// does not depend on how the signal is split into frames.
    Seamless,
}

/// Filter tuning shared by all streams created under one stage configuration.
///
/// Doubles as the `[kalman]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KalmanTuning {
    /// Q: process-noise scalar.
    pub process_noise: f64,
    /// R: pseudo-measurement noise variance.
    pub measurement_noise: f64,
    pub boundary: KalmanBoundary,
    pub output: IntegrationOutput,
}

impl Default for KalmanTuning {
    fn default() -> Self {
        Self {
            process_noise: DEFAULT_PROCESS_NOISE,
            measurement_noise: DEFAULT_MEASUREMENT_NOISE,
            boundary: KalmanBoundary::default(),
            output: IntegrationOutput::default(),
        }
    }
}

// ============================================================================
// Integration State
// ============================================================================

/// Carried filter state for one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationState {
    pub position: f64,
    pub velocity: f64,
    pub covariance: Matrix2<f64>,
    /// Ts = 1 / sampling rate.
    pub sampling_interval: f64,
    /// Last acceleration sample of the previous frame, not yet applied.
    pending_acceleration: Option<f64>,
}

impl IntegrationState {
    /// Fresh state: at rest at the origin with identity covariance.
    pub fn new(sampling_interval: f64) -> Self {
        Self::with_initial(sampling_interval, 0.0, 0.0, Matrix2::identity())
    }

    pub fn with_initial(
        sampling_interval: f64,
        position: f64,
        velocity: f64,
        covariance: Matrix2<f64>,
    ) -> Self {
        Self {
            position,
            velocity,
            covariance,
            sampling_interval,
            pending_acceleration: None,
        }
    }

    /// One predict/correct cycle driven by `acceleration`.
    pub fn step(&mut self, acceleration: f64, process_noise: f64, measurement_noise: f64) {
        let ts = self.sampling_interval;
        let a = Matrix2::new(1.0, ts, 0.0, 1.0);
        let b = Vector2::new(0.5 * ts * ts, ts);
        let c = RowVector2::new(1.0, 0.0);

        // Predict
        let x_minus = a * Vector2::new(self.position, self.velocity) + b * acceleration;
        let p_minus = a * self.covariance * a.transpose() + (b * b.transpose()) * process_noise;

        // Correct against the zero pseudo-measurement
        let s = (c * p_minus * c.transpose())[(0, 0)] + measurement_noise;
        let gain = p_minus * c.transpose() / s;
        let innovation = 0.0 - (c * x_minus)[(0, 0)];
        let x = x_minus + gain * innovation;

        self.covariance = (Matrix2::identity() - gain * c) * p_minus;
        self.position = x[0];
        self.velocity = x[1];
    }

    fn emit(&self, output: IntegrationOutput) -> f64 {
        match output {
            IntegrationOutput::Displacement => self.position,
            IntegrationOutput::Velocity => self.velocity,
        }
    }

    /// Replace the acceleration frame in place with the integrated signal.
    pub fn apply(&mut self, samples: &mut [f64], tuning: &KalmanTuning) {
        let Some(&first) = samples.first() else {
            return;
        };

        let carried = match tuning.boundary {
            KalmanBoundary::CarryOver => None,
            KalmanBoundary::Seamless => self.pending_acceleration,
        };

        let (mut pending, start) = match carried {
            Some(previous) => (previous, 0),
            None => {
                samples[0] = self.emit(tuning.output);
                (first, 1)
            }
        };

        for sample in &mut samples[start..] {
            let acceleration = pending;
            pending = *sample;
            self.step(acceleration, tuning.process_noise, tuning.measurement_noise);
            *sample = self.emit(tuning.output);
        }

        self.pending_acceleration = Some(pending);
    }
}
