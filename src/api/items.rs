//! Item endpoints
//!
//! Writes never touch the materialized view directly: they go to the outbox
//! and come back through the log. Reads are served from the view.

use axum::{
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use validator::Validate;

use crate::api::{
    correlation_header, AppState, CorrelationId, CORRELATION_ID_HEADER, CORRELATION_ID_ITEM_HEADER,
};
use crate::error::{Error, Result};
use crate::logging::Timer;
use crate::models::{ItemResponse, KeyRequest, Query, QueryStatus, QueryStatusKind, StoreItemRequest};

pub const QUERY_RESULT_STATUS_HEADER: &str = "x-query-result-status";
pub const QUERY_RESULTS_COUNT_HEADER: &str = "x-query-results-count";
pub const WARNING_REASON_HEADER: &str = "x-warning-reason";
pub const ERROR_REASON_HEADER: &str = "x-error-reason";

fn reject_when_shutting_down(state: &AppState) -> Result<()> {
    if state.shutdown.is_triggered() {
        return Err(Error::ShuttingDown);
    }
    Ok(())
}

/// Queue an item for the log
///
/// # Example
/// ```text
/// POST /store
/// {"key": "user-1", "value": "{\"name\":\"Ada\"}", "headers": [{"name": "correlationId", "value": "abc"}]}
/// ```
pub async fn store_item(
    State(state): State<AppState>,
    Extension(CorrelationId(correlation_id)): Extension<CorrelationId>,
    Json(request): Json<StoreItemRequest>,
) -> Result<Response> {
    request.validate()?;
    reject_when_shutting_down(&state)?;

    let key = request.key.clone();
    state.storage.outbox.enqueue(&request.into_record()).await.map_err(|e| {
        tracing::error!(key = %key, correlation_id = %correlation_id, error = %e, "Failed to enqueue item");
        Error::from(e)
    })?;

    tracing::debug!(key = %key, correlation_id = %correlation_id, "Item queued for the log");
    Ok((StatusCode::OK, Json("Stored")).into_response())
}

/// Queue a tombstone for the log
///
/// # Example
/// ```text
/// POST /remove
/// {"key": "user-1"}
/// ```
pub async fn remove_item(
    State(state): State<AppState>,
    Extension(CorrelationId(correlation_id)): Extension<CorrelationId>,
    Json(request): Json<KeyRequest>,
) -> Result<Response> {
    request.validate()?;
    reject_when_shutting_down(&state)?;

    let key = request.key.clone();
    state.storage.outbox.enqueue(&request.into_tombstone()).await.map_err(|e| {
        tracing::error!(key = %key, correlation_id = %correlation_id, error = %e, "Failed to enqueue removal");
        Error::from(e)
    })?;

    tracing::debug!(key = %key, correlation_id = %correlation_id, "Removal queued for the log");
    Ok((StatusCode::OK, Json("Removed")).into_response())
}

/// Look up one item in the materialized view
///
/// A stored `correlationId` header replaces the request's correlation id.
///
/// # Example
/// ```text
/// POST /retrieve
/// {"key": "user-1"}
/// ```
pub async fn retrieve_item(
    State(state): State<AppState>,
    Json(request): Json<KeyRequest>,
) -> Result<Response> {
    request.validate()?;

    let item = state
        .storage
        .store
        .get(&request.key)
        .await?
        .ok_or_else(|| Error::NotFound(format!("key '{}'", request.key)))?;

    let stored_correlation = item
        .header(CORRELATION_ID_ITEM_HEADER)
        .filter(|id| !id.trim().is_empty())
        .and_then(correlation_header);

    let mut response = Json(ItemResponse::from(item)).into_response();
    if let Some(value) = stored_correlation {
        response.headers_mut().insert(CORRELATION_ID_HEADER, value);
    }
    Ok(response)
}

fn status_headers(status: &QueryStatus) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static(QUERY_RESULT_STATUS_HEADER),
        HeaderValue::from_static(match status.status {
            QueryStatusKind::Success => "Success",
            QueryStatusKind::Warning => "Warning",
            QueryStatusKind::Error => "Error",
        }),
    );
    headers.insert(
        HeaderName::from_static(QUERY_RESULTS_COUNT_HEADER),
        HeaderValue::from(status.result_count),
    );

    let reason_header = match status.status {
        QueryStatusKind::Success => None,
        QueryStatusKind::Warning => Some(WARNING_REASON_HEADER),
        QueryStatusKind::Error => Some(ERROR_REASON_HEADER),
    };
    if let (Some(name), Some(reason)) = (reason_header, status.reason.as_deref()) {
        if let Ok(value) = HeaderValue::from_str(reason) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
    headers
}

/// Run a closed-field query against the materialized view
///
/// Rows found before a timeout or shutdown are still returned; the status
/// headers say how the scan ended.
///
/// # Example
/// ```text
/// POST /query
/// {"requestedFields": ["Key", "Value"], "filters": [{"field": "Key", "criteria": "Contains", "value": "user"}]}
/// ```
pub async fn query_items(
    State(state): State<AppState>,
    Extension(CorrelationId(correlation_id)): Extension<CorrelationId>,
    Json(query): Json<Query>,
) -> Response {
    if let Err(e) = query.validate() {
        return Error::from(e).into_response();
    }

    let timer = Timer::start("query");
    let result = state.storage.store.query(&query, &state.shutdown).await;
    timer.stop();

    match result {
        Ok(outcome) => {
            tracing::debug!(
                correlation_id = %correlation_id,
                status = %outcome.status.status,
                results = outcome.status.result_count,
                "Query finished"
            );
            (status_headers(&outcome.status), Json(outcome.items)).into_response()
        },
        Err(e) => {
            tracing::error!(correlation_id = %correlation_id, error = %e, "Query failed");
            let mut response = Error::from(e).into_response();
            let headers = response.headers_mut();
            headers.insert(
                HeaderName::from_static(QUERY_RESULT_STATUS_HEADER),
                HeaderValue::from_static("Error"),
            );
            headers.insert(
                HeaderName::from_static(ERROR_REASON_HEADER),
                HeaderValue::from_static("Exception"),
            );
            response
        },
    }
}
