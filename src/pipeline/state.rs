//! Application State and System Status
//!
//! Snapshot of the dispatcher shared with the status API. The processing
//! loop is the only writer.

use serde::Serialize;
use std::time::Instant;

use super::dispatcher::{DispatchStats, Dispatcher};
use crate::stream::registry::StreamSummary;
use crate::transform::StageKind;

// ============================================================================
// Application State
// ============================================================================

/// Shared state read by API handlers.
///
/// Wrapped in `Arc<RwLock<>>` for access across the async runtime.
#[derive(Debug, Clone, Serialize)]
pub struct AppState {
    /// Process start (serializes as seconds via `uptime_secs`)
    #[serde(skip)]
    pub uptime: Instant,

    pub status: SystemStatus,

    /// Active stage
    pub stage: StageKind,

    /// Source and sink names, e.g. "stdin" / "stdout"
    pub source: String,
    pub sink: String,

    /// Last inbound message time
    pub last_message_time: Option<chrono::DateTime<chrono::Utc>>,

    /// Dispatcher counters as of the last snapshot
    pub stats: DispatchStats,

    /// Registry summaries as of the last refresh
    pub streams: Vec<StreamSummary>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            uptime: Instant::now(),
            status: SystemStatus::Initializing,
            stage: StageKind::default(),
            source: String::new(),
            sink: String::new(),
            last_message_time: None,
            stats: DispatchStats::default(),
            streams: Vec::new(),
        }
    }
}

impl AppState {
    pub fn for_stage(stage: StageKind) -> Self {
        Self {
            stage,
            ..Self::default()
        }
    }

    /// Copy counters from the dispatcher; streams only when `include_streams`.
    pub fn sync_from(&mut self, dispatcher: &Dispatcher, include_streams: bool) {
        self.stats = dispatcher.stats().clone();
        if include_streams {
            self.streams = dispatcher.registry().summaries();
        }
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.uptime.elapsed().as_secs()
    }
}

/// System operational status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SystemStatus {
    /// Loop not started yet
    Initializing,
    /// Processing messages
    Running,
    /// Source exhausted or cancelled
    Stopped,
    /// Source or sink failed
    Error,
}

impl std::fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SystemStatus::Initializing => write!(f, "Initializing"),
            SystemStatus::Running => write!(f, "Running"),
            SystemStatus::Stopped => write!(f, "Stopped"),
            SystemStatus::Error => write!(f, "Error"),
        }
    }
}
