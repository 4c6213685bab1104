//! API module for statecache
//!
//! This module contains all HTTP API endpoints and server setup: health and
//! readiness probes, version information and the item endpoints that write
//! through the outbox and read from the materialized view.

pub mod health;
pub mod items;
pub mod server;

pub use health::{health_check, health_monitor, live_check, ready_check, version_info, HealthState};
pub use items::{query_items, remove_item, retrieve_item, store_item};
pub use server::{create_router, create_server};

use axum::{
    extract::Request,
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::db::Storage;
use crate::readiness::ReadinessGate;
use crate::shutdown::Shutdown;

/// Header carrying the caller's correlation id, echoed on every item response
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Stored item header that overrides the correlation id on retrieval
pub const CORRELATION_ID_ITEM_HEADER: &str = "correlationId";

/// Build information populated at compile time
pub const BUILD_INFO: BuildInfo = BuildInfo {
    version: env!("CARGO_PKG_VERSION"),
    commit: match option_env!("GIT_COMMIT") {
        Some(commit) => commit,
        None => "unknown",
    },
    build_id: match option_env!("BUILD_ID") {
        Some(build) => build,
        None => "unknown",
    },
};

/// Build information structure
#[derive(Debug, Clone, serde::Serialize)]
pub struct BuildInfo {
    /// Application version from Cargo.toml
    pub version: &'static str,
    /// Git commit hash
    pub commit: &'static str,
    /// Pipeline build id
    pub build_id: &'static str,
}

/// Health check response
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct HealthResponse {
    /// Service status
    pub status: HealthStatus,
    /// Optional message
    pub message: Option<String>,
    /// Current timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Component health status
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ComponentHealth {
    /// Component status
    pub status: HealthStatus,
    /// Optional error message
    pub message: Option<String>,
    /// Last check timestamp
    pub last_check: chrono::DateTime<chrono::Utc>,
}

/// Liveness response with per-component detail
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct LiveResponse {
    pub status: HealthStatus,
    pub checks: std::collections::HashMap<String, ComponentHealth>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Health status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Service is healthy
    Healthy,
    /// Service is degraded but operational
    Degraded,
    /// Service is unhealthy
    Unhealthy,
}

impl HealthStatus {
    /// Check if the status is healthy
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// Convert to HTTP status code
    pub fn to_status_code(&self) -> axum::http::StatusCode {
        match self {
            HealthStatus::Healthy => axum::http::StatusCode::OK,
            HealthStatus::Degraded => axum::http::StatusCode::OK,
            HealthStatus::Unhealthy => axum::http::StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Shared state behind every route
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub readiness: Arc<ReadinessGate>,
    pub health: Arc<HealthState>,
    pub shutdown: Shutdown,
}

impl AppState {
    pub fn new(storage: Storage, shutdown: Shutdown) -> Self {
        let readiness = Arc::new(ReadinessGate::new(Arc::clone(&storage.store)));
        Self {
            storage,
            readiness,
            health: Arc::new(HealthState::new()),
            shutdown,
        }
    }
}

/// The caller's correlation id, or a fresh one
pub fn request_correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Header value for a correlation id, dropping ids that are not valid header text
pub(crate) fn correlation_header(id: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(id).ok()
}

/// Correlation id of the current request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(pub String);

/// Attach a correlation id to the request and echo it on the response
///
/// A handler may set the header itself to report a different id.
pub async fn correlation_id(mut request: Request, next: Next) -> Response {
    let id = request_correlation_id(request.headers());
    request.extensions_mut().insert(CorrelationId(id.clone()));

    let mut response = next.run(request).await;
    if !response.headers().contains_key(CORRELATION_ID_HEADER) {
        if let Some(value) = correlation_header(&id) {
            response.headers_mut().insert(CORRELATION_ID_HEADER, value);
        }
    }
    response
}
