//! API route handlers
//!
//! Every handler takes a read lock on [`AppState`] and copies out a
//! response; the processing loop is the only writer.

use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::pipeline::{AppState, DispatchStats, SystemStatus};
use crate::stream::registry::StreamSummary;
use crate::transform::StageKind;

// ============================================================================
// API State
// ============================================================================

/// Shared state for API handlers
#[derive(Clone)]
pub struct DashboardState {
    /// Application state from the pipeline
    pub app_state: Arc<RwLock<AppState>>,
}

impl DashboardState {
    pub fn new(app_state: Arc<RwLock<AppState>>) -> Self {
        Self { app_state }
    }
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always "ok" while the server answers
    pub status: &'static str,
    pub uptime_secs: u64,
    /// Processing loop status
    pub pipeline: SystemStatus,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub status: SystemStatus,
    pub stage: StageKind,
    pub source: String,
    pub sink: String,
    pub last_message_time: Option<DateTime<Utc>>,
    pub active_streams: usize,
    pub counters: DispatchStats,
}

#[derive(Debug, Serialize)]
pub struct StreamsResponse {
    pub count: usize,
    pub streams: Vec<StreamSummary>,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/v1/health
pub async fn get_health(State(state): State<DashboardState>) -> Json<HealthResponse> {
    let app_state = state.app_state.read().await;
    Json(HealthResponse {
        status: "ok",
        uptime_secs: app_state.uptime_secs(),
        pipeline: app_state.status,
    })
}

/// GET /api/v1/stats
pub async fn get_stats(State(state): State<DashboardState>) -> Json<StatsResponse> {
    let app_state = state.app_state.read().await;
    Json(StatsResponse {
        status: app_state.status,
        stage: app_state.stage,
        source: app_state.source.clone(),
        sink: app_state.sink.clone(),
        last_message_time: app_state.last_message_time,
        active_streams: app_state.streams.len(),
        counters: app_state.stats.clone(),
    })
}

/// GET /api/v1/streams
pub async fn get_streams(State(state): State<DashboardState>) -> Json<StreamsResponse> {
    let app_state = state.app_state.read().await;
    Json(StreamsResponse {
        count: app_state.streams.len(),
        streams: app_state.streams.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Dispatcher;
    use crate::transform::Stage;

    fn create_test_state() -> DashboardState {
        DashboardState::new(Arc::new(RwLock::new(AppState::default())))
    }

    #[tokio::test]
    async fn test_get_health() {
        let state = create_test_state();
        let Json(response) = get_health(State(state)).await;
        assert_eq!(response.status, "ok");
        assert_eq!(response.pipeline, SystemStatus::Initializing);
    }

    #[tokio::test]
    async fn test_get_stats_empty() {
        let state = create_test_state();
        let Json(response) = get_stats(State(state)).await;
        assert_eq!(response.counters, DispatchStats::default());
        assert_eq!(response.active_streams, 0);
        assert!(response.last_message_time.is_none());
    }

    #[tokio::test]
    async fn test_get_streams_after_sync() {
        let state = create_test_state();
        let mut dispatcher = Dispatcher::new(Stage::detrend());
        dispatcher
            .handle_message(
                "cpsns/s/n/ch1/raw/metadata",
                br#"{"Data":{"Samples":4,"Type":"f"},"Analysis chain":[]}"#,
            )
            .unwrap();
        state.app_state.write().await.sync_from(&dispatcher, true);

        let Json(response) = get_streams(State(state)).await;
        assert_eq!(response.count, 1);
        assert_eq!(response.streams[0].key, "cpsns/s/n/ch1/raw");
        assert_eq!(
            response.streams[0].output_data_topic,
            "cpsns/s/n/ch1/detrend/data"
        );
    }
}
