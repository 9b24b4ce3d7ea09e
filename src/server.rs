//! HTTP surface of the control plane.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::ble::BtleRadio;
use crate::config::ServerConfig;
use crate::control::{ControlPlane, INVALID_ZONES};
use crate::error::{ApiError, ApiResult};
use crate::manager::{ConnectionManager, ManagerSettings};
use crate::signal::DeviceRecord;
use crate::worker::{WorkerCommand, WorkerSupervisor};

pub type AppState = Arc<ControlPlane>;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/devices", get(list_devices))
        .route("/connect", post(connect))
        .route("/zones", get(get_zones).post(set_zones))
        .route("/worker", get(worker_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run a blocking control plane operation off the async workers.
async fn blocking<T, F>(state: AppState, op: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&ControlPlane) -> ApiResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || op(state.as_ref()))
        .await
        .map_err(|e| ApiError::Internal(format!("request task failed: {e}")))?
}

async fn list_devices(State(state): State<AppState>) -> ApiResult<Json<Vec<DeviceRecord>>> {
    let devices = blocking(state, ControlPlane::list_devices).await?;
    Ok(Json(devices))
}

#[derive(Debug, Default, Deserialize)]
struct ConnectRequest {
    address: Option<String>,
}

async fn connect(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<Value>> {
    // A body we cannot read is treated the same as one without an address.
    let request: ConnectRequest = serde_json::from_slice(&body).unwrap_or_default();
    let message = blocking(state, move |plane| plane.connect(request.address.as_deref())).await?;
    Ok(Json(json!({ "status": message })))
}

async fn set_zones(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<Value>> {
    let payload: Value = serde_json::from_slice(&body).map_err(|_| ApiError::Validation(INVALID_ZONES))?;
    blocking(state, move |plane| plane.set_zones(payload)).await?;
    Ok(Json(json!({ "status": "Zones received successfully!" })))
}

async fn get_zones(State(state): State<AppState>) -> Json<Value> {
    Json(state.zones().unwrap_or_else(|| json!({})))
}

async fn worker_status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let status = blocking(state, |plane| Ok(plane.worker_status())).await?;
    Ok(Json(json!({ "worker": status })))
}

pub async fn serve(config: ServerConfig) -> Result<()> {
    let settings = ManagerSettings {
        scan_window: config.scan_window(),
        connect_timeout: config.connect_timeout(),
    };
    let manager = ConnectionManager::start(BtleRadio::default, settings)
        .context("failed to start connection manager")?;

    let command = WorkerCommand::current_exe()
        .context("failed to locate worker executable")?
        .arg("--zones")
        .arg(&config.zones_path)
        .arg("--connect-timeout-secs")
        .arg(config.connect_timeout_secs.to_string());
    let supervisor = WorkerSupervisor::new(command, config.worker_stop_timeout());

    let state: AppState = Arc::new(ControlPlane::new(manager, supervisor, &config.zones_path));
    let app = build_router(state.clone());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", config.host, config.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, zones = %config.zones_path.display(), "Control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("Stopping monitoring worker");
    let plane = state.clone();
    tokio::task::spawn_blocking(move || plane.shutdown())
        .await
        .context("shutdown task failed")??;

    // The manager thread joins when the last reference drops, which may
    // block, so let it go on the blocking pool too.
    tokio::task::spawn_blocking(move || drop(state))
        .await
        .context("shutdown task failed")?;

    tracing::info!("Control plane stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
