//! API route definitions
//!
//! - /api/v1/health - liveness and uptime
//! - /api/v1/stats - dispatcher counters by outcome
//! - /api/v1/streams - one summary per registered stream

use axum::{routing::get, Router};

use super::handlers::{self, DashboardState};

/// Create all v1 API routes
pub fn api_routes(state: DashboardState) -> Router {
    Router::new()
        .route("/health", get(handlers::get_health))
        .route("/stats", get(handlers::get_stats))
        .route("/streams", get(handlers::get_streams))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::AppState;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tokio::sync::RwLock;
    use tower::ServiceExt;

    fn create_test_state() -> DashboardState {
        DashboardState::new(Arc::new(RwLock::new(AppState::default())))
    }

    async fn get_status_code(uri: &str) -> StatusCode {
        let app = api_routes(create_test_state());
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        response.status()
    }

    #[tokio::test]
    async fn test_api_routes_health() {
        assert_eq!(get_status_code("/health").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_stats() {
        assert_eq!(get_status_code("/stats").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_streams() {
        assert_eq!(get_status_code("/streams").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_unknown() {
        assert_eq!(get_status_code("/spectrum").await, StatusCode::NOT_FOUND);
    }
}
