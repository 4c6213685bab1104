//! Health check endpoints for statecache
//!
//! This module implements the probes used by Kubernetes and other
//! orchestration platforms. Readiness means the materialized view has caught
//! up with the log as it was at startup.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::api::{AppState, ComponentHealth, HealthResponse, HealthStatus, LiveResponse, BUILD_INFO};
use crate::db::Storage;

/// Component health tracking, refreshed by [`health_monitor`]
#[derive(Clone)]
pub struct HealthState {
    /// Shared state for component health tracking
    pub components: Arc<tokio::sync::RwLock<HashMap<String, ComponentHealth>>>,
}

impl HealthState {
    /// Create a new health state
    pub fn new() -> Self {
        Self {
            components: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
        }
    }

    /// Update component health status
    pub async fn update_component(
        &self,
        name: impl Into<String>,
        status: HealthStatus,
        message: Option<String>,
    ) {
        let mut components = self.components.write().await;
        components.insert(
            name.into(),
            ComponentHealth {
                status,
                message,
                last_check: Utc::now(),
            },
        );
    }

    /// Get overall health status
    pub async fn get_status(&self) -> HealthStatus {
        let components = self.components.read().await;

        // If any component is unhealthy, overall status is unhealthy
        if components.values().any(|c| c.status == HealthStatus::Unhealthy) {
            return HealthStatus::Unhealthy;
        }

        // If any component is degraded, overall status is degraded
        if components.values().any(|c| c.status == HealthStatus::Degraded) {
            return HealthStatus::Degraded;
        }

        HealthStatus::Healthy
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Startup probe
///
/// Returns 200 OK once the HTTP server is up.
///
/// # Example
/// ```text
/// GET /healthz
/// ```
pub async fn health_check() -> Response {
    let response = HealthResponse {
        status: HealthStatus::Healthy,
        message: Some("Started successfully".to_string()),
        timestamp: Utc::now(),
    };

    (StatusCode::OK, Json(response)).into_response()
}

/// Liveness probe
///
/// Reports the components refreshed by the health monitor. Only an
/// unhealthy component fails the probe.
///
/// # Example
/// ```text
/// GET /healthz/live
/// ```
pub async fn live_check(State(state): State<AppState>) -> Response {
    let checks = state.health.components.read().await.clone();
    let status = state.health.get_status().await;

    let response = LiveResponse {
        status,
        checks,
        timestamp: Utc::now(),
    };

    (status.to_status_code(), Json(response)).into_response()
}

/// Readiness probe
///
/// 200 once every partition has been consumed up to its startup watermark,
/// otherwise 503 with the progress of each partition.
///
/// # Example
/// ```text
/// GET /healthz/ready
/// ```
pub async fn ready_check(State(state): State<AppState>) -> Response {
    match state.readiness.report().await {
        Ok(report) if report.ready => {
            (StatusCode::OK, Json(json!({ "status": "ready" }))).into_response()
        },
        Ok(report) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "message": "State hasn't caught up",
                "partitions": report.partitions,
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            crate::error::Error::NotReady(format!("offset ledger unavailable: {}", e))
                .into_response()
        },
    }
}

/// Build information endpoint
///
/// # Example
/// ```text
/// GET /version
/// ```
pub async fn version_info() -> Response {
    (StatusCode::OK, Json(&BUILD_INFO)).into_response()
}

/// Check the materialized store
pub async fn check_storage_health(storage: &Storage) -> ComponentHealth {
    let (status, message) = match storage.store.health_check().await {
        Ok(()) => match storage.store.count().await {
            Ok(count) => (HealthStatus::Healthy, format!("{} items materialized", count)),
            Err(e) => (HealthStatus::Degraded, format!("Item count failed: {}", e)),
        },
        Err(e) => (HealthStatus::Unhealthy, format!("Store unavailable: {}", e)),
    };

    ComponentHealth {
        status,
        message: Some(message),
        last_check: Utc::now(),
    }
}

/// Check the outbox; quarantined entries degrade it
pub async fn check_outbox_health(storage: &Storage) -> ComponentHealth {
    let pending = storage.outbox.pending_count().await;
    let failed = storage.outbox.failed_count().await;

    let (status, message) = match (pending, failed) {
        (Ok(pending), Ok(0)) => (HealthStatus::Healthy, format!("{} entries pending", pending)),
        (Ok(pending), Ok(failed)) => (
            HealthStatus::Degraded,
            format!("{} entries pending, {} quarantined", pending, failed),
        ),
        (Err(e), _) | (_, Err(e)) => (HealthStatus::Unhealthy, format!("Outbox unavailable: {}", e)),
    };

    ComponentHealth {
        status,
        message: Some(message),
        last_check: Utc::now(),
    }
}

/// Background task to periodically update component health
pub async fn health_monitor(state: AppState, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            biased;
            _ = state.shutdown.wait() => break,
            _ = ticker.tick() => {},
        }

        let storage = check_storage_health(&state.storage).await;
        state.health.update_component("storage", storage.status, storage.message).await;

        let outbox = check_outbox_health(&state.storage).await;
        state.health.update_component("outbox", outbox.status, outbox.message).await;

        tracing::debug!("Health check completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryConfig;
    use crate::models::Record;
    use crate::shutdown::Shutdown;

    #[tokio::test]
    async fn test_health_state() {
        let state = HealthState::new();

        // Initially healthy
        assert_eq!(state.get_status().await, HealthStatus::Healthy);

        state.update_component("test", HealthStatus::Degraded, None).await;
        assert_eq!(state.get_status().await, HealthStatus::Degraded);

        state
            .update_component(
                "failing",
                HealthStatus::Unhealthy,
                Some("Connection failed".to_string()),
            )
            .await;
        assert_eq!(state.get_status().await, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_health_check_endpoint() {
        let response = health_check().await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_quarantined_entries_degrade_outbox() {
        let storage = Storage::in_memory(QueryConfig::default());
        storage.outbox.enqueue(&Record::new("k", b"v".to_vec())).await.unwrap();
        assert_eq!(check_outbox_health(&storage).await.status, HealthStatus::Healthy);

        storage.outbox.mark_oldest_failed().await.unwrap();
        assert_eq!(check_outbox_health(&storage).await.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_monitor_stops_on_shutdown() {
        let state = AppState::new(Storage::in_memory(QueryConfig::default()), Shutdown::new());
        let monitor = tokio::spawn(health_monitor(state.clone(), Duration::from_millis(5)));

        tokio::time::sleep(Duration::from_millis(20)).await;
        state.shutdown.trigger(crate::shutdown::ShutdownReason::Requested);
        monitor.await.unwrap();

        assert!(state.health.components.read().await.contains_key("storage"));
    }

    #[tokio::test]
    async fn test_version_endpoint() {
        let response = version_info().await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
