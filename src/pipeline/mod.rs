//! Processing Pipeline Module
//!
//! ```text
//! MessageSource ──> Dispatcher ──> MessageSink
//!  (stdin/tcp/       │  classify topic
//!   channel)         │  metadata: build entry, republish cached document
//!                    │  data: decode -> transform -> encode
//!                    └─ StreamRegistry (one entry per stream key)
//! ```
//!
//! One message is handled at a time. The processing loop owns the dispatcher
//! and publishes snapshots into [`AppState`] for the status API.

mod state;
pub mod dispatcher;
pub mod envelope;
pub mod processing_loop;
pub mod source;

pub use dispatcher::{DispatchStats, Dispatcher, Handled, Outcome};
pub use envelope::BusMessage;
pub use processing_loop::ProcessingLoop;
pub use state::*;
