//! Request handlers for the device API and the probe endpoints

use super::{ApiRejection, AppState};
use crate::error::{LightError, LightResult};
use crate::http::auth::Caller;
use crate::observability::{liveness, metrics};
use crate::protocol::ControlRequest;
use crate::store::{
    hours_before, DeviceState, HistoryQuery, SensorHistory, SettingsUpdate, UserSettings,
};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use tracing::{debug, info};
use warp::http::StatusCode;
use warp::{Rejection, Reply};

/// Rows included in the dashboard snapshot
pub const DASHBOARD_HISTORY_LIMIT: usize = 50;

/// `GET /api/device/history` query string
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<i64>,
    pub hours: Option<i64>,
}

/// `DELETE /api/device/history` query string
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrimParams {
    pub keep_hours: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub total: usize,
    pub hours: u32,
    pub data: Vec<SensorHistory>,
}

#[derive(Debug, Serialize)]
pub struct TrimResponse {
    pub deleted: u64,
    pub keep_hours: u32,
}

/// Summary of the sensor readings in a history slice
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SensorStats {
    pub count: usize,
    pub min: Option<u32>,
    pub max: Option<u32>,
    pub avg: Option<f64>,
}

impl SensorStats {
    /// Aggregate `rows` (pure function)
    pub fn from_history(rows: &[SensorHistory]) -> Self {
        if rows.is_empty() {
            return Self::default();
        }
        let values = rows.iter().map(|row| row.sensor_value);
        let total: u64 = values.clone().map(u64::from).sum();
        Self {
            count: rows.len(),
            min: values.clone().min(),
            max: values.max(),
            avg: Some(total as f64 / rows.len() as f64),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DashboardResponse {
    pub device: DeviceState,
    pub settings: UserSettings,
    pub mqtt_connected: bool,
    pub recent_history: Vec<SensorHistory>,
    pub sensor_stats: SensorStats,
}

#[derive(Debug, Serialize)]
struct ApiIndex {
    service: &'static str,
    version: &'static str,
    endpoints: BTreeMap<&'static str, &'static str>,
}

fn positive_hours(name: &str, value: i64) -> LightResult<u32> {
    if value <= 0 {
        return Err(LightError::invalid_argument(format!(
            "{name} must be greater than 0"
        )));
    }
    u32::try_from(value)
        .map_err(|_| LightError::invalid_argument(format!("{name} {value} is too large")))
}

/// Apply defaults and bounds to history query parameters (pure function)
pub fn resolve_history_params(
    params: &HistoryParams,
    history: &crate::config::HistorySection,
) -> LightResult<(u32, usize)> {
    let hours = match params.hours {
        Some(hours) => positive_hours("hours", hours)?,
        None => history.default_hours,
    };
    let limit = params.limit.unwrap_or(i64::from(history.default_limit));
    if limit < 1 || limit > i64::from(history.max_limit) {
        return Err(LightError::invalid_argument(format!(
            "limit must be within 1..={}",
            history.max_limit
        )));
    }
    Ok((hours, limit as usize))
}

/// Apply defaults and bounds to trim parameters (pure function)
pub fn resolve_keep_hours(
    params: &TrimParams,
    history: &crate::config::HistorySection,
) -> LightResult<u32> {
    match params.keep_hours {
        Some(keep_hours) => positive_hours("keep_hours", keep_hours),
        None => Ok(history.default_keep_hours),
    }
}

fn reject(error: LightError) -> Rejection {
    warp::reject::custom(ApiRejection(error))
}

pub async fn get_status<T: Transport>(
    caller: Caller,
    state: AppState<T>,
) -> Result<impl Reply, Rejection> {
    debug!(user = %caller.username, "Device status requested");
    let device = state
        .store
        .device_state()
        .await
        .map_err(|e| reject(e.into()))?;
    Ok(warp::reply::json(&device))
}

pub async fn post_control<T: Transport + 'static>(
    caller: Caller,
    state: AppState<T>,
    request: ControlRequest,
) -> Result<impl Reply, Rejection> {
    info!(user = %caller.username, action = %request.action, "Control request");
    let response = state.dispatcher.dispatch(&request).await.map_err(reject)?;
    Ok(warp::reply::json(&response))
}

pub async fn get_history<T: Transport>(
    caller: Caller,
    state: AppState<T>,
    params: HistoryParams,
) -> Result<impl Reply, Rejection> {
    let (hours, limit) = resolve_history_params(&params, &state.history).map_err(reject)?;
    debug!(user = %caller.username, hours, limit, "History requested");

    let query = HistoryQuery::last_hours(Utc::now(), hours, limit);
    let data = state
        .store
        .history(&query)
        .await
        .map_err(|e| reject(e.into()))?;
    Ok(warp::reply::json(&HistoryResponse {
        total: data.len(),
        hours,
        data,
    }))
}

pub async fn delete_history<T: Transport>(
    caller: Caller,
    state: AppState<T>,
    params: TrimParams,
) -> Result<impl Reply, Rejection> {
    let keep_hours = resolve_keep_hours(&params, &state.history).map_err(reject)?;
    let cutoff = hours_before(Utc::now(), keep_hours).unwrap_or(DateTime::<Utc>::MIN_UTC);
    let deleted = state
        .store
        .trim_history(cutoff)
        .await
        .map_err(|e| reject(e.into()))?;

    info!(user = %caller.username, deleted, keep_hours, "Sensor history trimmed");
    Ok(warp::reply::json(&TrimResponse {
        deleted,
        keep_hours,
    }))
}

pub async fn get_settings<T: Transport>(
    _caller: Caller,
    state: AppState<T>,
) -> Result<impl Reply, Rejection> {
    let settings = state.store.settings().await.map_err(|e| reject(e.into()))?;
    Ok(warp::reply::json(&settings))
}

pub async fn put_settings<T: Transport>(
    caller: Caller,
    state: AppState<T>,
    update: SettingsUpdate,
) -> Result<impl Reply, Rejection> {
    let settings = state
        .store
        .update_settings(Box::new(move |settings: &mut UserSettings| {
            update.apply_to(settings)
        }))
        .await
        .map_err(|e| reject(e.into()))?;

    info!(
        user = %caller.username,
        low = settings.light_threshold_low,
        high = settings.light_threshold_high,
        auto_brightness = settings.auto_brightness,
        "Settings updated"
    );
    Ok(warp::reply::json(&settings))
}

pub async fn get_dashboard<T: Transport>(
    _caller: Caller,
    state: AppState<T>,
) -> Result<impl Reply, Rejection> {
    let device = state
        .store
        .device_state()
        .await
        .map_err(|e| reject(e.into()))?;
    let settings = state.store.settings().await.map_err(|e| reject(e.into()))?;
    let query = HistoryQuery::last_hours(
        Utc::now(),
        state.history.default_hours,
        DASHBOARD_HISTORY_LIMIT,
    );
    let recent_history = state
        .store
        .history(&query)
        .await
        .map_err(|e| reject(e.into()))?;

    Ok(warp::reply::json(&DashboardResponse {
        device,
        settings,
        mqtt_connected: state.transport.is_connected(),
        sensor_stats: SensorStats::from_history(&recent_history),
        recent_history,
    }))
}

pub async fn health<T: Transport>(state: AppState<T>) -> Result<impl Reply, Infallible> {
    let status = state.health.health_status().await;
    let code = if status.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok(warp::reply::with_status(warp::reply::json(&status), code))
}

pub async fn ready<T: Transport>(state: AppState<T>) -> Result<impl Reply, Infallible> {
    let response = state.health.readiness().await;
    let code = if response.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok(warp::reply::with_status(warp::reply::json(&response), code))
}

pub async fn live() -> Result<impl Reply, Infallible> {
    Ok(warp::reply::json(&liveness()))
}

pub async fn metrics_snapshot() -> Result<impl Reply, Infallible> {
    Ok(warp::reply::json(&metrics().get_metrics()))
}

pub async fn index() -> Result<impl Reply, Infallible> {
    let endpoints = BTreeMap::from([
        ("GET /api/device/status", "Current device state"),
        ("POST /api/device/control", "SET_BRIGHTNESS, TOGGLE_POWER or SET_AUTO"),
        ("GET /api/device/history", "Sensor history, oldest first (?hours&limit)"),
        ("DELETE /api/device/history", "Drop history older than ?keep_hours"),
        ("GET /api/device/settings", "Automatic control thresholds"),
        ("PUT /api/device/settings", "Partial settings update"),
        ("GET /api/device/dashboard", "Device, settings and recent history"),
        ("GET /health", "Overall health with per-check detail"),
        ("GET /ready", "Readiness probe"),
        ("GET /live", "Liveness probe"),
        ("GET /metrics", "Counters snapshot"),
    ]);
    Ok(warp::reply::json(&ApiIndex {
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        endpoints,
    }))
}
