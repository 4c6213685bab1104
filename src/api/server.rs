//! HTTP server implementation for statecache
//!
//! This module sets up the Axum web server with all routes, middleware,
//! and graceful shutdown handling.

use anyhow::Context;
use axum::{
    extract::MatchedPath,
    http::{header, HeaderName, Method, Request},
    middleware,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer},
    LatencyUnit,
};
use uuid::Uuid;

use crate::{
    api::{
        correlation_id,
        health::{health_check, live_check, ready_check, version_info},
        items::{query_items, remove_item, retrieve_item, store_item},
        AppState,
    },
    config::ServerConfig,
    error::Result,
};

/// Request ID generator
#[derive(Clone, Default)]
struct MakeRequestUuid;

impl MakeRequestId for MakeRequestUuid {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        let id = Uuid::new_v4().to_string();
        Some(RequestId::new(id.parse().ok()?))
    }
}

/// Create the main application router
pub fn create_router(state: AppState, server: &ServerConfig) -> Router {
    let health_routes = Router::new()
        .route("/healthz", get(health_check))
        .route("/healthz/live", get(live_check))
        .route("/healthz/ready", get(ready_check))
        .route("/version", get(version_info));

    let item_routes = Router::new()
        .route("/store", post(store_item))
        .route("/remove", post(remove_item))
        .route("/retrieve", post(retrieve_item))
        .route("/query", post(query_items))
        .layer(middleware::from_fn(correlation_id));

    let request_id = HeaderName::from_static("x-request-id");

    // Apply middleware
    Router::new()
        .merge(health_routes)
        .merge(item_routes)
        .with_state(state)
        .layer(TimeoutLayer::new(server.request_timeout()))
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([
                    header::CONTENT_TYPE,
                    HeaderName::from_static(crate::api::CORRELATION_ID_HEADER),
                ]),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let matched_path =
                        request.extensions().get::<MatchedPath>().map(MatchedPath::as_str);
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("unknown");

                    tracing::info_span!(
                        "http_request",
                        method = ?request.method(),
                        matched_path,
                        request_id,
                        latency = tracing::field::Empty,
                        status = tracing::field::Empty,
                    )
                })
                .on_request(DefaultOnRequest::new().level(tracing::Level::INFO))
                .on_response(
                    DefaultOnResponse::new()
                        .level(tracing::Level::INFO)
                        .latency_unit(LatencyUnit::Millis),
                ),
        )
}

/// Create and start the HTTP server
///
/// Serves until the shared shutdown fires, then drains in-flight requests.
pub async fn create_server(state: AppState, server: &ServerConfig) -> Result<()> {
    let app = create_router(state.clone(), server);
    let addr: SocketAddr = server
        .address()
        .parse()
        .map_err(|e| crate::error::Error::config(format!("Invalid server address: {}", e)))?;

    tracing::info!(
        address = %addr,
        environment = %server.environment,
        "Starting HTTP server"
    );

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    tracing::info!(
        address = %addr,
        "HTTP server listening"
    );

    let shutdown = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let reason = shutdown.wait().await;
            tracing::info!(reason = %reason, "Starting graceful shutdown of HTTP server");
        })
        .await
        .context("Server error")?;

    Ok(())
}
