//! HTTP API for report ingestion and bucket queries.
//!
//! Monitors POST their batches to `/report`; dashboards read aggregated
//! windows back from `/minutes` and `/hours`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRef, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::aggregate::{AggregateError, Aggregator};
use crate::message::EnrichedMessage;
use crate::metrics::{health_handler, metrics_handler};
use crate::stats::PipelineStats;

pub const DEFAULT_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;

/// Upper bound on records returned by one range query.
pub const MAX_RECORDS: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<Aggregator>,
    pub stats: Arc<PipelineStats>,
}

impl FromRef<AppState> for Arc<PipelineStats> {
    fn from_ref(state: &AppState) -> Self {
        state.stats.clone()
    }
}

#[derive(Debug, Deserialize)]
pub struct ReportParams {
    id: Option<String>,
    band: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RangeParams {
    id: Option<String>,
    band: Option<String>,
    begin: Option<i64>,
    end: Option<i64>,
}

impl RangeParams {
    fn validate(self) -> Option<(String, String, i64, i64)> {
        match self {
            RangeParams {
                id: Some(id),
                band: Some(band),
                begin: Some(begin),
                end: Some(end),
            } if !id.is_empty() && !band.is_empty() && begin <= end => Some((id, band, begin, end)),
            _ => None,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/report", post(report_handler))
        .route("/minutes", get(minutes_handler))
        .route("/hours", get(hours_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve the API on `addr` until `shutdown` flips to true.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("API server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}

fn bad_request(reason: &str) -> Response {
    (StatusCode::BAD_REQUEST, format!("Bad request params: {reason}\n")).into_response()
}

fn store_failure(err: AggregateError) -> Response {
    error!("Persistence failure: {}", err);
    (StatusCode::BAD_GATEWAY, format!("Server error when accessing data: {err}\n")).into_response()
}

/// Run a blocking aggregator call off the async executor.
async fn with_aggregator<T, F>(aggregator: Arc<Aggregator>, f: F) -> Result<T, Response>
where
    T: Send + 'static,
    F: FnOnce(&Aggregator) -> Result<T, AggregateError> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || f(&aggregator)).await {
        Ok(result) => result.map_err(store_failure),
        Err(e) => {
            error!("Aggregator task failed: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

async fn report_handler(
    State(state): State<AppState>,
    Query(params): Query<ReportParams>,
    Json(messages): Json<Vec<EnrichedMessage>>,
) -> Response {
    let (Some(monitor), Some(band)) = (params.id, params.band) else {
        return bad_request("missing id or band");
    };
    if monitor.is_empty() || band.is_empty() {
        return bad_request("missing id or band");
    }

    let received = messages.len();
    let messages: Vec<EnrichedMessage> = messages.into_iter().filter(|m| !m.is_error()).collect();
    debug!(
        "Report from {}/{}: {} messages ({} usable)",
        monitor,
        band,
        received,
        messages.len()
    );

    match with_aggregator(state.aggregator, move |agg| agg.ingest(&monitor, &band, messages)).await {
        Ok(outcome) => {
            state.stats.record_ingested(outcome.messages as u64);
            (StatusCode::OK, "success").into_response()
        }
        Err(response) => response,
    }
}

async fn minutes_handler(
    State(state): State<AppState>,
    Query(params): Query<RangeParams>,
) -> Response {
    let Some((monitor, band, begin, end)) = params.validate() else {
        return bad_request("need id, band, begin <= end");
    };
    match with_aggregator(state.aggregator, move |agg| {
        agg.fetch_minutes(&monitor, &band, begin, end)
    })
    .await
    {
        Ok(mut minutes) => {
            minutes.truncate(MAX_RECORDS);
            Json(minutes).into_response()
        }
        Err(response) => response,
    }
}

async fn hours_handler(
    State(state): State<AppState>,
    Query(params): Query<RangeParams>,
) -> Response {
    let Some((monitor, band, begin, end)) = params.validate() else {
        return bad_request("need id, band, begin <= end");
    };
    match with_aggregator(state.aggregator, move |agg| {
        agg.fetch_hours(&monitor, &band, begin, end)
    })
    .await
    {
        Ok(mut hours) => {
            hours.truncate(MAX_RECORDS);
            Json(hours).into_response()
        }
        Err(response) => response,
    }
}
