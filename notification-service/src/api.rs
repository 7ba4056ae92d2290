use std::{collections::HashMap, sync::Arc};

use anyhow::{Error, Result};
use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    clients::health::HealthChecker,
    config::{ServerConfig, WorkerConfig},
    handler::ChannelHandler,
    metrics::render_metrics,
    models::{
        health::HealthStatus, provider::DeliveryReport, request::Channel,
        response::ApiResponse, status::DeliveryStatus,
    },
    tracker::DeliveryTracker,
    utils::ShutdownCoordinator,
};

pub struct AppState {
    health_checker: HealthChecker,
    handlers: HashMap<Channel, Arc<ChannelHandler>>,
    tracker: DeliveryTracker,
    max_page: usize,
}

impl AppState {
    pub fn new(
        health_checker: HealthChecker,
        handlers: &[Arc<ChannelHandler>],
        tracker: DeliveryTracker,
        workers: &WorkerConfig,
    ) -> Self {
        Self {
            health_checker,
            handlers: handlers
                .iter()
                .map(|h| (h.channel(), Arc::clone(h)))
                .collect(),
            tracker,
            max_page: workers.batch_size.max(1),
        }
    }

    fn handler(&self, channel: &str) -> Option<&Arc<ChannelHandler>> {
        channel
            .parse::<Channel>()
            .ok()
            .and_then(|c| self.handlers.get(&c))
    }

    fn page(&self, limit: Option<usize>) -> usize {
        limit.unwrap_or(self.max_page).clamp(1, self.max_page)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
}

type ApiResult<T> = (StatusCode, Json<ApiResponse<T>>);

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/deliveries/failed", get(failed_deliveries))
        .route("/deliveries/retries", get(due_retries))
        .route("/deliveries/{message_id}", get(delivery_status))
        .route(
            "/deliveries/{channel}/{message_id}/refresh",
            post(refresh_delivery),
        )
        .route("/callbacks/{channel}", post(provider_callback))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn metrics_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serves the operational API and the metrics endpoint until shutdown.
pub async fn run_api_server(
    server: &ServerConfig,
    state: Arc<AppState>,
    shutdown: ShutdownCoordinator,
) -> Result<(), Error> {
    let api_addr = format!("0.0.0.0:{}", server.health_port);
    let metrics_addr = format!("0.0.0.0:{}", server.metrics_port);

    let api_listener = TcpListener::bind(&api_addr).await?;
    let metrics_listener = TcpListener::bind(&metrics_addr).await?;

    info!(address = %api_addr, "API server started");
    info!(address = %metrics_addr, "Metrics server started");

    let api_shutdown = shutdown.clone();
    let api = axum::serve(api_listener, router(Arc::clone(&state)))
        .with_graceful_shutdown(async move { api_shutdown.wait().await });
    let metrics = axum::serve(metrics_listener, metrics_router(state))
        .with_graceful_shutdown(async move { shutdown.wait().await });

    tokio::try_join!(async move { api.await }, async move { metrics.await })?;

    info!("API servers stopped");
    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_checker.check_all().await;

    let status_code = match health.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.health_checker.refresh_gauges().await;
    render_metrics()
}

pub async fn failed_deliveries(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Vec<DeliveryStatus>> {
    let limit = state.page(query.limit);

    match state.tracker.get_failed_deliveries(limit).await {
        Ok(failed) => {
            let message = format!("{} failed deliveries", failed.len());
            (StatusCode::OK, Json(ApiResponse::page(failed, limit, message)))
        }
        Err(e) => internal_error(e.to_string()),
    }
}

pub async fn due_retries(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Vec<String>> {
    let limit = state.page(query.limit);

    match state.tracker.due_retries(Utc::now(), limit).await {
        Ok(ids) => {
            let message = format!("{} retries due", ids.len());
            (StatusCode::OK, Json(ApiResponse::page(ids, limit, message)))
        }
        Err(e) => internal_error(e.to_string()),
    }
}

pub async fn delivery_status(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<String>,
) -> ApiResult<DeliveryStatus> {
    match state.tracker.get_delivery_status(&message_id).await {
        Ok(Some(status)) => (
            StatusCode::OK,
            Json(ApiResponse::success(status, "Delivery found".to_string())),
        ),
        Ok(None) => not_found(format!("No delivery recorded for {}", message_id)),
        Err(e) => internal_error(e.to_string()),
    }
}

/// Asks the provider for the latest state of a delivery awaiting confirmation.
pub async fn refresh_delivery(
    State(state): State<Arc<AppState>>,
    Path((channel, message_id)): Path<(String, String)>,
) -> ApiResult<Option<DeliveryStatus>> {
    let Some(handler) = state.handler(&channel) else {
        return not_found(format!("Channel {} is not enabled", channel));
    };

    match handler.poll_delivery_status(&message_id).await {
        Ok(change) => {
            let message = if change.is_some() {
                "Delivery status updated"
            } else {
                "No status change"
            };
            (
                StatusCode::OK,
                Json(ApiResponse::success(
                    change.map(|c| c.after),
                    message.to_string(),
                )),
            )
        }
        Err(e) => {
            warn!(%channel, %message_id, error = %e, "Delivery status refresh failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(ApiResponse::error(
                    e.to_string(),
                    "Failed to refresh delivery status".to_string(),
                )),
            )
        }
    }
}

/// Provider push notifications. Reports for unknown provider ids are accepted and ignored.
pub async fn provider_callback(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    Json(report): Json<DeliveryReport>,
) -> ApiResult<Option<DeliveryStatus>> {
    let Some(handler) = state.handler(&channel) else {
        return not_found(format!("Channel {} is not enabled", channel));
    };

    match handler.apply_report(&report).await {
        Ok(change) => (
            StatusCode::OK,
            Json(ApiResponse::success(
                change.map(|c| c.after),
                "Report accepted".to_string(),
            )),
        ),
        Err(e) => internal_error(e.to_string()),
    }
}

fn not_found<T>(error: String) -> ApiResult<T> {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::error(error, "Not found".to_string())),
    )
}

fn internal_error<T>(error: String) -> ApiResult<T> {
    warn!(error = %error, "API request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiResponse::error(error, "Internal error".to_string())),
    )
}
