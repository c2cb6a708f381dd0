//! HTTP surface: the device API under `/api/device` plus health probes
//!
//! Built on warp filters. Device routes require a caller from the
//! [`auth::Authenticator`]; the probes and `/metrics` are open. Every error
//! leaves as `{"detail": "..."}` with the status from [`LightError::status_code`].

pub mod auth;
pub mod handlers;

use crate::config::HistorySection;
use crate::control::CommandDispatcher;
use crate::error::{sanitize_error_message, ErrorBody, LightError};
use crate::observability::HealthChecker;
use crate::protocol::ControlRequest;
use crate::store::{SettingsUpdate, StateStore};
use crate::transport::Transport;
use auth::{Authenticator, Caller};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use warp::http::header::{HeaderValue, WWW_AUTHENTICATE};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

/// Largest accepted JSON body
const MAX_BODY_BYTES: u64 = 16 * 1024;

/// Shared handles for every request
pub struct AppState<T: Transport> {
    pub store: Arc<dyn StateStore>,
    pub transport: Arc<T>,
    pub dispatcher: CommandDispatcher<T>,
    pub health: HealthChecker<T>,
    pub auth: Arc<dyn Authenticator>,
    pub history: HistorySection,
}

impl<T: Transport> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            transport: self.transport.clone(),
            dispatcher: self.dispatcher.clone(),
            health: self.health.clone(),
            auth: self.auth.clone(),
            history: self.history.clone(),
        }
    }
}

impl<T: Transport + 'static> AppState<T> {
    pub fn new(
        store: Arc<dyn StateStore>,
        transport: Arc<T>,
        auth: Arc<dyn Authenticator>,
        history: HistorySection,
    ) -> Self {
        Self {
            dispatcher: CommandDispatcher::new(store.clone(), transport.clone()),
            health: HealthChecker::new(store.clone(), transport.clone()),
            store,
            transport,
            auth,
            history,
        }
    }
}

/// A [`LightError`] carried through warp's rejection chain
#[derive(Debug)]
pub struct ApiRejection(pub LightError);

impl warp::reject::Reject for ApiRejection {}

fn with_state<T: Transport + 'static>(
    state: AppState<T>,
) -> impl Filter<Extract = (AppState<T>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// Resolve the caller from the `Authorization` header or reject with 401
pub fn with_caller(
    auth: Arc<dyn Authenticator>,
) -> impl Filter<Extract = (Caller,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization").and_then(move |header: Option<String>| {
        let auth = auth.clone();
        async move {
            auth.authenticate(header.as_deref())
                .map_err(|e| warp::reject::custom(ApiRejection(LightError::from(e))))
        }
    })
}

fn json_body<B>() -> impl Filter<Extract = (B,), Error = Rejection> + Clone
where
    B: serde::de::DeserializeOwned + Send,
{
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

/// Every route, with CORS, request tracing and error rendering applied
pub fn routes<T: Transport + 'static>(
    state: AppState<T>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let caller = with_caller(state.auth.clone());

    let status = warp::path!("api" / "device" / "status")
        .and(warp::get())
        .and(caller.clone())
        .and(with_state(state.clone()))
        .and_then(handlers::get_status::<T>);

    let control = warp::path!("api" / "device" / "control")
        .and(warp::post())
        .and(caller.clone())
        .and(with_state(state.clone()))
        .and(json_body::<ControlRequest>())
        .and_then(handlers::post_control::<T>);

    let history = warp::path!("api" / "device" / "history")
        .and(warp::get())
        .and(caller.clone())
        .and(with_state(state.clone()))
        .and(warp::query::<handlers::HistoryParams>())
        .and_then(handlers::get_history::<T>);

    let trim = warp::path!("api" / "device" / "history")
        .and(warp::delete())
        .and(caller.clone())
        .and(with_state(state.clone()))
        .and(warp::query::<handlers::TrimParams>())
        .and_then(handlers::delete_history::<T>);

    let get_settings = warp::path!("api" / "device" / "settings")
        .and(warp::get())
        .and(caller.clone())
        .and(with_state(state.clone()))
        .and_then(handlers::get_settings::<T>);

    let put_settings = warp::path!("api" / "device" / "settings")
        .and(warp::put())
        .and(caller.clone())
        .and(with_state(state.clone()))
        .and(json_body::<SettingsUpdate>())
        .and_then(handlers::put_settings::<T>);

    let dashboard = warp::path!("api" / "device" / "dashboard")
        .and(warp::get())
        .and(caller)
        .and(with_state(state.clone()))
        .and_then(handlers::get_dashboard::<T>);

    let health = warp::path!("health")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handlers::health::<T>);

    let ready = warp::path!("ready")
        .and(warp::get())
        .and(with_state(state))
        .and_then(handlers::ready::<T>);

    let live = warp::path!("live").and(warp::get()).and_then(handlers::live);

    let metrics = warp::path!("metrics")
        .and(warp::get())
        .and_then(handlers::metrics_snapshot);

    let index = warp::path::end().and(warp::get()).and_then(handlers::index);

    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"])
        .allow_headers(vec!["authorization", "content-type"]);

    status
        .or(control)
        .or(history)
        .or(trim)
        .or(get_settings)
        .or(put_settings)
        .or(dashboard)
        .or(health)
        .or(ready)
        .or(live)
        .or(metrics)
        .or(index)
        .recover(handle_rejection)
        .with(cors)
        .with(warp::trace::request())
}

fn error_response(status: StatusCode, detail: String) -> Response {
    let mut response =
        warp::reply::with_status(warp::reply::json(&ErrorBody { detail }), status).into_response();
    if status == StatusCode::UNAUTHORIZED {
        response
            .headers_mut()
            .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
    }
    response
}

/// Render rejections as `{"detail": ...}` bodies
pub async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    if let Some(ApiRejection(light_error)) = err.find::<ApiRejection>() {
        let status = StatusCode::from_u16(light_error.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %light_error, "Request failed");
        }
        return Ok(error_response(status, light_error.to_error_body().detail));
    }

    let (status, detail) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not Found".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            sanitize_error_message(&format!("Invalid request body: {e}")),
        )
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (
            StatusCode::BAD_REQUEST,
            sanitize_error_message(&format!("Invalid query string: {e}")),
        )
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "Method Not Allowed".to_string(),
        )
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            "Request body too large".to_string(),
        )
    } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
        (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Expected application/json".to_string(),
        )
    } else {
        error!(rejection = ?err, "Unhandled rejection");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal Server Error".to_string(),
        )
    };

    Ok(error_response(status, detail))
}

/// Serve until `shutdown` resolves
pub async fn serve<T, S>(
    state: AppState<T>,
    addr: SocketAddr,
    shutdown: S,
) -> Result<(), warp::Error>
where
    T: Transport + 'static,
    S: Future<Output = ()> + Send + 'static,
{
    let (bound, server) =
        warp::serve(routes(state)).try_bind_with_graceful_shutdown(addr, shutdown)?;
    info!(address = %bound, "HTTP server listening");
    server.await;
    info!("HTTP server stopped");
    Ok(())
}
