mod breaker_service;
mod config;
mod error;
mod frame_layer;
mod modbus_frame;
mod models;
mod monitor;
mod recovery;
mod status;
mod store;
#[cfg(test)]
mod test_support;
mod transport;
mod trip_reason;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use breaker_service::BreakerService;
use config::AppConfig;
use error::{BreakerError, ErrorKind};
use frame_layer::{FrameCaptureLayer, LogStore};
use models::{BreakerId, ControlAction};
use monitor::FleetMonitor;
use recovery::{GatewayReset, RecoveryManager, TcpGatewayReset};
use store::{BreakerStore, JsonStore};
use transport::{ModbusLink, TcpModbusClient};

#[derive(Clone)]
struct AppState {
    service: Arc<BreakerService>,
    monitor: Arc<FleetMonitor>,
    log_store: LogStore,
}

impl AppState {
    /// Monitoring and control use separate links so they can carry
    /// different timeouts.
    async fn assemble(
        config: &AppConfig,
        store: Arc<dyn BreakerStore>,
        monitor_link: Arc<dyn ModbusLink>,
        control_link: Arc<dyn ModbusLink>,
        gateway: Arc<dyn GatewayReset>,
        log_store: LogStore,
    ) -> Self {
        let settle = config.gateway.settle();
        let monitor_recovery = Arc::new(RecoveryManager::new(monitor_link, gateway.clone(), settle));
        let control_recovery = Arc::new(RecoveryManager::new(control_link, gateway, settle));
        let monitor = FleetMonitor::new(store.clone(), monitor_recovery)
            .with_default_config(config.monitor.clone())
            .await;
        let service = BreakerService::new(store, control_recovery, config.control.clone());
        Self {
            service: Arc::new(service),
            monitor: Arc::new(monitor),
            log_store,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_store = LogStore::new();

    use tracing_subscriber::prelude::*;
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,breaker_controller=debug"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(filter)
        .with(FrameCaptureLayer::new(log_store.clone()))
        .init();

    let config = AppConfig::load().await.context("loading configuration")?;
    let store = Arc::new(
        JsonStore::open(&config.store_path)
            .await
            .with_context(|| format!("opening store {}", config.store_path.display()))?
            .with_history_limit(config.operation_history),
    );
    seed_breakers(&config, store.as_ref()).await?;

    let (monitor_dial, monitor_read) = config.timeouts.monitor();
    let (control_dial, control_read) = config.timeouts.control();
    let state = AppState::assemble(
        &config,
        store,
        Arc::new(TcpModbusClient::new(monitor_dial, monitor_read)),
        Arc::new(TcpModbusClient::new(control_dial, control_read)),
        Arc::new(TcpGatewayReset::new(&config.gateway, monitor_dial)),
        log_store,
    )
    .await;

    state.monitor.start().await;
    let monitor = state.monitor.clone();

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    println!("\n🚀 Breaker controller listening on {}\n", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server")?;

    monitor.stop().await;
    Ok(())
}

/// Provision breakers named in the config file that the store does not know yet.
async fn seed_breakers(config: &AppConfig, store: &dyn BreakerStore) -> anyhow::Result<()> {
    for seed in &config.breakers {
        match store.breaker(seed.id).await {
            Ok(_) => {}
            Err(BreakerError::BreakerNotFound(_)) => {
                store.upsert_breaker(seed.to_breaker()).await?;
                info!(breaker_id = seed.id, "Provisioned breaker {}", seed.name);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/breakers/:id/status", get(status_handler))
        .route("/api/breakers/:id/control", post(control_handler))
        .route("/api/breakers/:id/lock", post(lock_handler))
        .route("/api/breakers/:id/reset", post(reset_handler))
        .route("/api/breakers/:id/gateway-reset", post(gateway_reset_handler))
        .route("/api/breakers/:id/trip", get(trip_handler))
        .route("/api/breakers/:id/measurements", get(measurements_handler))
        .route("/api/breakers/:id/electrical", post(electrical_handler))
        .route("/api/operations/:control_id", get(operation_handler))
        .route("/api/monitor", get(monitor_handler))
        .route("/api/monitor/interval", post(interval_handler))
        .route("/api/monitor/poll", post(poll_handler))
        .route("/api/logs", get(get_logs_handler))
        .route("/api/frames", get(get_frames_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[derive(Serialize)]
struct ApiResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<ErrorKind>,
}

struct ApiError(BreakerError);

impl From<BreakerError> for ApiError {
    fn from(e: BreakerError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::UnsupportedOperation | ErrorKind::InvalidConfig => StatusCode::BAD_REQUEST,
            ErrorKind::DeviceLocked => StatusCode::CONFLICT,
            ErrorKind::OperationTimedOut => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Transport | ErrorKind::ProtocolException | ErrorKind::ResponseMalformed => {
                StatusCode::BAD_GATEWAY
            }
            ErrorKind::Store => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ApiResponse {
            success: false,
            error: Some(self.0.to_string()),
            kind: Some(kind),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn status_handler(State(state): State<AppState>, Path(id): Path<BreakerId>) -> ApiResult<models::StatusReport> {
    Ok(Json(state.service.get_breaker_status(id).await?))
}

#[derive(Deserialize)]
struct ControlRequest {
    action: String,
}

/// Answers once the operation is terminal; a failed switch is still a 200
/// carrying `success: false`.
async fn control_handler(
    State(state): State<AppState>,
    Path(id): Path<BreakerId>,
    Json(req): Json<ControlRequest>,
) -> ApiResult<models::ControlOperation> {
    let action: ControlAction = req.action.parse()?;
    Ok(Json(state.service.set_breaker(id, action).await?))
}

async fn operation_handler(State(state): State<AppState>, Path(control_id): Path<String>) -> Response {
    match state.service.operation(&control_id).await {
        Ok(Some(op)) => Json(op).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse {
                success: false,
                error: Some(format!("operation {} not found", control_id)),
                kind: Some(ErrorKind::NotFound),
            }),
        )
            .into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

#[derive(Deserialize)]
struct LockRequest {
    locked: bool,
}

async fn lock_handler(
    State(state): State<AppState>,
    Path(id): Path<BreakerId>,
    Json(req): Json<LockRequest>,
) -> ApiResult<models::Breaker> {
    Ok(Json(state.service.set_remote_lock(id, req.locked).await?))
}

async fn reset_handler(State(state): State<AppState>, Path(id): Path<BreakerId>) -> ApiResult<ApiResponse> {
    state.service.reset_device(id).await?;
    Ok(Json(ApiResponse {
        success: true,
        error: None,
        kind: None,
    }))
}

async fn gateway_reset_handler(
    State(state): State<AppState>,
    Path(id): Path<BreakerId>,
) -> ApiResult<recovery::GatewayResetPath> {
    Ok(Json(state.service.reset_gateway(id).await?))
}

async fn trip_handler(
    State(state): State<AppState>,
    Path(id): Path<BreakerId>,
) -> ApiResult<trip_reason::TripDiagnosis> {
    Ok(Json(state.service.trip_diagnosis(id).await?))
}

async fn measurements_handler(
    State(state): State<AppState>,
    Path(id): Path<BreakerId>,
) -> ApiResult<models::Measurements> {
    Ok(Json(state.service.read_measurements(id).await?))
}

async fn electrical_handler(
    State(state): State<AppState>,
    Path(id): Path<BreakerId>,
) -> ApiResult<models::ElectricalConfig> {
    Ok(Json(state.service.refresh_electrical_config(id).await?))
}

async fn monitor_handler(State(state): State<AppState>) -> Json<monitor::MonitorSnapshot> {
    Json(state.monitor.snapshot().await)
}

#[derive(Deserialize)]
struct IntervalRequest {
    interval_secs: u64,
}

async fn interval_handler(
    State(state): State<AppState>,
    Json(req): Json<IntervalRequest>,
) -> ApiResult<models::MonitorConfig> {
    Ok(Json(state.monitor.set_interval(req.interval_secs).await?))
}

async fn poll_handler(State(state): State<AppState>) -> Json<monitor::CycleSummary> {
    Json(state.monitor.poll_once().await)
}

#[derive(Deserialize)]
struct SinceQuery {
    after: Option<u64>,
}

async fn get_logs_handler(State(state): State<AppState>, Query(q): Query<SinceQuery>) -> Json<serde_json::Value> {
    let logs = state.log_store.logs_since(q.after).await;
    Json(serde_json::json!({ "logs": logs }))
}

async fn get_frames_handler(State(state): State<AppState>, Query(q): Query<SinceQuery>) -> Json<serde_json::Value> {
    let frames = state.log_store.frames_since(q.after).await;
    Json(serde_json::json!({ "frames": frames }))
}
