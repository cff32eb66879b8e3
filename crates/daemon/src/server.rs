//! HTTP surface: the auth API and the channel upgrade endpoint.
//!
//! | Route | Method | Purpose |
//! |---|---|---|
//! | `/api/auth/login` | POST | verify credentials, set session cookie |
//! | `/api/auth/logout` | POST | invalidate session, clear cookie |
//! | `/api/auth/status` | GET | report whether the caller is logged in |
//! | `/api/auth/shutdown` | POST | stop the server (requires a session) |
//! | `/ws` | GET | upgrade to a terminal channel |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::header::{CONNECTION, COOKIE, RETRY_AFTER, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use protocol::{ApiResponse, AuthStatus, LoginRequest, ANONYMOUS_USER};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::{AuthError, LoginRateLimiter, RateLimitError, SessionStore, SESSION_COOKIE};
use crate::gateway::ChannelGateway;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SessionStore>,
    pub limiter: Arc<LoginRateLimiter>,
    pub gateway: Arc<ChannelGateway>,
    pub shutdown: CancellationToken,
}

/// Errors returned by the HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    RateLimited(#[from] RateLimitError),

    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ApiResponse::error(self.to_string()));
        match self {
            ApiError::Auth(_) => (StatusCode::UNAUTHORIZED, body).into_response(),
            ApiError::RateLimited(ref err) => {
                let retry_after = err.retry_after_secs().to_string();
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(RETRY_AFTER, retry_after)],
                    body,
                )
                    .into_response()
            }
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, body).into_response(),
        }
    }
}

/// Builds the application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/status", get(status))
        .route("/api/auth/shutdown", post(shutdown))
        .route("/ws", get(channel_upgrade))
        .with_state(state)
}

async fn login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    state.limiter.check(addr.ip())?;
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    if !state.store.auth_enabled() {
        let token = state.store.issue(ANONYMOUS_USER);
        return Ok(with_session_cookie(
            &token,
            state.store.timeout(),
            ApiResponse::ok("Authentication disabled"),
        ));
    }

    if let Err(e) = state.store.verify(&request.username, &request.password) {
        warn!(addr = %addr, username = %request.username, "Failed login attempt");
        return Err(e.into());
    }

    let token = state.store.issue(&request.username);
    info!(addr = %addr, username = %request.username, "User logged in");

    Ok(with_session_cookie(
        &token,
        state.store.timeout(),
        ApiResponse::ok("Login successful"),
    ))
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(token) = session_token(&headers) {
        state.store.invalidate(&token);
    }

    (
        [(SET_COOKIE, clear_cookie())],
        Json(ApiResponse::ok("Logged out")),
    )
        .into_response()
}

async fn status(State(state): State<AppState>, headers: HeaderMap) -> Json<AuthStatus> {
    if !state.store.auth_enabled() {
        return Json(AuthStatus {
            authenticated: true,
            auth_enabled: false,
            username: Some(ANONYMOUS_USER.to_string()),
        });
    }

    let username = session_token(&headers).and_then(|token| state.store.touch(&token));
    Json(AuthStatus {
        authenticated: username.is_some(),
        auth_enabled: true,
        username,
    })
}

async fn shutdown(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse>, ApiError> {
    let username = state.store.authorize(session_token(&headers).as_deref())?;
    info!(addr = %addr, username = %username, "Shutdown requested over HTTP");

    state.shutdown.cancel();
    Ok(Json(ApiResponse::ok("Server shutting down...")))
}

async fn channel_upgrade(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let admission = match state.gateway.admit(session_token(&headers).as_deref()) {
        Ok(admission) => admission,
        Err(e) => {
            warn!(addr = %addr, error = %e, "Rejected channel");
            return (
                StatusCode::UNAUTHORIZED,
                [(CONNECTION, "close")],
                Json(ApiResponse::error(e.to_string())),
            )
                .into_response();
        }
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let gateway = Arc::clone(&state.gateway);
    upgrade.on_upgrade(move |socket| async move { gateway.serve(socket, admission).await })
}

/// Extracts the session token from the `Cookie` header(s).
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

fn session_cookie(token: &str, max_age: Duration) -> String {
    format!(
        "{}={}; HttpOnly; SameSite=Strict; Path=/; Max-Age={}",
        SESSION_COOKIE,
        token,
        max_age.as_secs()
    )
}

fn clear_cookie() -> String {
    format!(
        "{}=; HttpOnly; SameSite=Strict; Path=/; Max-Age=0",
        SESSION_COOKIE
    )
}

fn with_session_cookie(token: &str, max_age: Duration, body: ApiResponse) -> Response {
    match HeaderValue::from_str(&session_cookie(token, max_age)) {
        Ok(cookie) => ([(SET_COOKIE, cookie)], Json(body)).into_response(),
        // Tokens are hex, so this cannot happen in practice.
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error("Failed to set session cookie")),
        )
            .into_response(),
    }
}
