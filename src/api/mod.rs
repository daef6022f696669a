//! REST API module using Axum
//!
//! Read-only status surface for the stream processor: liveness, counters by
//! outcome and the current stream registry.

pub mod handlers;
mod routes;

pub use handlers::DashboardState;

use axum::http::{header, Method};
use axum::Router;
use std::time::Duration;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::defaults::{HTTP_MAX_CONCURRENT_REQUESTS, HTTP_REQUEST_TIMEOUT_SECS};

/// Build a CORS layer that is restrictive by default (same-origin only).
///
/// Set `CPSENS_CORS_ORIGINS` to a comma-separated list of allowed origins.
fn build_cors_layer() -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_headers([header::CONTENT_TYPE]);

    match std::env::var("CPSENS_CORS_ORIGINS") {
        Ok(origins) => {
            let allowed: Vec<_> = origins
                .split(',')
                .filter_map(|o| o.trim().parse().ok())
                .collect();
            tracing::info!(origins = %origins, "CORS: allowing configured origins");
            base.allow_origin(allowed)
        }
        Err(_) => base,
    }
}

/// Create the complete application router.
pub fn create_app(state: DashboardState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes(state))
        .layer(TimeoutLayer::new(Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECS)))
        .layer(ConcurrencyLimitLayer::new(HTTP_MAX_CONCURRENT_REQUESTS))
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer())
}
