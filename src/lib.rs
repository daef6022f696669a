//! CP-SENS stream processor
//!
//! Per-channel streaming transforms for CP-SENS sensor telemetry on a
//! publish/subscribe bus.
//!
//! ## Architecture
//!
//! - **Stream**: topic classification, binary frame codec, metadata handling
//!   and the per-key registry
//! - **Transform**: streaming detrend and Kalman double integration
//! - **Pipeline**: dispatcher plus the async loop between a message source
//!   and sink
//! - **API**: read-only status endpoints

pub mod api;
pub mod config;
pub mod pipeline;
pub mod stream;
pub mod transform;

// Re-export configuration
pub use config::StreamConfig;

// Re-export the dispatcher surface
pub use pipeline::{BusMessage, DispatchStats, Dispatcher, Handled, Outcome};

// Re-export stream protocol types
pub use stream::{
    ElementType, Frame, RetentionPolicy, SampleCount, StreamError, StreamKey, StreamRegistry,
};

// Re-export transforms
pub use transform::{Stage, StageKind, TransformState};
