use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use hopper_common::{CaptureError, ConfigError, OperatingMode, ReferenceLevel, SettingsGroup};

use super::{with_monitor_blocking, SharedMonitor};

const NO_MATCHING_ROUTE: &str = "No matching route";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    Reboot,
    FactoryReset,
}

#[derive(Clone)]
pub struct AppState {
    pub monitor: SharedMonitor,
    pub restart: mpsc::Sender<RestartReason>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/alive", get(handle_alive))
        .route("/pelletlevel", get(handle_pellet_level))
        .route("/sys/{action}", post(handle_sys))
        .route("/calibrate/mode", get(handle_get_mode))
        .route("/calibrate/mode/{mode}", post(handle_set_mode))
        .route(
            "/calibrate/{level}",
            get(handle_get_calibration).post(handle_capture_calibration),
        )
        .route(
            "/configure/{group}",
            get(handle_get_config).post(handle_set_config),
        )
        .fallback(handle_fallback)
        .method_not_allowed_fallback(handle_fallback)
        .with_state(state)
}

async fn handle_alive() -> impl IntoResponse {
    "1"
}

async fn handle_pellet_level(State(state): State<AppState>) -> impl IntoResponse {
    let level = state.monitor.lock().await.level();
    level.to_string()
}

async fn handle_sys(State(state): State<AppState>, Path(action): Path<String>) -> Response {
    let reason = match action.as_str() {
        "reboot" => RestartReason::Reboot,
        "reset" => {
            let mut monitor = state.monitor.lock().await;
            match monitor.store_mut().reset_all() {
                Ok(_restart) => RestartReason::FactoryReset,
                Err(err) => {
                    warn!("factory reset failed: {err}");
                    return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
                }
            }
        }
        _ => return no_matching_route(),
    };

    info!("restart requested: {reason:?}");
    // A full queue means a restart is already pending.
    if let Err(err) = state.restart.try_send(reason) {
        warn!("restart signal not queued: {err}");
    }
    match reason {
        RestartReason::Reboot => "rebooting",
        RestartReason::FactoryReset => "resetting",
    }
    .into_response()
}

async fn handle_get_mode(State(state): State<AppState>) -> impl IntoResponse {
    let mode = state.monitor.lock().await.mode();
    mode.as_str()
}

async fn handle_set_mode(State(state): State<AppState>, Path(mode): Path<String>) -> Response {
    let Ok(mode) = mode.parse::<OperatingMode>() else {
        return no_matching_route();
    };
    state.monitor.lock().await.set_mode(mode);
    info!("operating mode set to {mode}");
    mode.as_str().into_response()
}

async fn handle_get_calibration(
    State(state): State<AppState>,
    Path(level): Path<String>,
) -> Response {
    let Ok(level) = level.parse::<ReferenceLevel>() else {
        return no_matching_route();
    };
    let points = state.monitor.lock().await.store().calibration();
    points.get(level).to_string().into_response()
}

async fn handle_capture_calibration(
    State(state): State<AppState>,
    Path(level): Path<String>,
) -> Response {
    let Ok(level) = level.parse::<ReferenceLevel>() else {
        return no_matching_route();
    };

    let captured =
        with_monitor_blocking(&state.monitor, move |monitor| monitor.capture_reference(level))
            .await;
    let captured = match captured {
        Ok(captured) => captured,
        Err(err) => {
            warn!("{level} capture aborted: {err:#}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "capture aborted");
        }
    };
    match captured {
        Ok(raw_cm) => {
            info!("captured {level} reference at {raw_cm:.1} cm");
            raw_cm.to_string().into_response()
        }
        Err(CaptureError::Sensor(err)) => {
            warn!("{level} capture failed: {err}");
            error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string())
        }
        Err(CaptureError::Config(err)) => {
            warn!("{level} capture not stored: {err}");
            config_error_response(&err)
        }
    }
}

async fn handle_get_config(State(state): State<AppState>, Path(group): Path<String>) -> Response {
    let Ok(group) = group.parse::<SettingsGroup>() else {
        return no_matching_route();
    };
    let settings = state.monitor.lock().await.store().get_json(group);
    Json(settings).into_response()
}

async fn handle_set_config(
    State(state): State<AppState>,
    Path(group): Path<String>,
    body: Bytes,
) -> Response {
    let Ok(group) = group.parse::<SettingsGroup>() else {
        return no_matching_route();
    };

    let updated = state.monitor.lock().await.store_mut().set_json(group, &body);
    match updated {
        Ok(()) => {
            info!("{group} settings updated");
            format!("saved_{group}_settings").into_response()
        }
        Err(err) => {
            warn!("{group} settings rejected: {err}");
            config_error_response(&err)
        }
    }
}

async fn handle_fallback() -> Response {
    no_matching_route()
}

fn no_matching_route() -> Response {
    (StatusCode::NOT_FOUND, NO_MATCHING_ROUTE).into_response()
}

fn config_error_response(err: &ConfigError) -> Response {
    let status = match err {
        ConfigError::Invalid { .. } => StatusCode::BAD_REQUEST,
        ConfigError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
