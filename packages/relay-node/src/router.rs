//! HTTP transport glue. Thin by design: handlers decode, poke the
//! controller, and encode. All stateful behavior lives behind it.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use relay_node_error::{NodeError, ProblemDetails};

use crate::backend::singbox::SingBoxConfig;
use crate::backend::{BackendStats, BackendType};
use crate::controller::{BaseInfo, Controller};
use crate::host::SystemStats;
use crate::user::User;

const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Node(#[from] NodeError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Node(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

pub struct AppState {
    pub controller: Arc<Controller>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub backend_type: String,
    pub config: String,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub exclude_inbounds: Vec<String>,
    #[serde(default)]
    pub keep_alive: u64,
}

pub fn build_router(controller: Arc<Controller>) -> Router {
    let state = Arc::new(AppState { controller });

    let mut router = Router::new()
        .route("/base", get(get_base))
        .route("/start", post(start_session))
        .route("/stop", post(stop_session))
        .route("/user/sync", post(sync_user))
        .route("/users/sync", post(sync_users))
        .route("/stats/system", get(get_system_stats))
        .route("/stats/backend", get(get_backend_stats))
        .route("/logs", get(stream_logs))
        .with_state(state.clone());

    if state.controller.config().api_key.is_some() {
        router = router.layer(axum::middleware::from_fn_with_state(state, require_api_key));
    }

    router.layer(TraceLayer::new_for_http())
}

async fn require_api_key(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.controller.config().api_key else {
        return Ok(next.run(req).await);
    };

    let provided = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value.trim()).ok());

    if provided == Some(expected) {
        Ok(next.run(req).await)
    } else {
        Err(NodeError::Unauthorized.into())
    }
}

async fn get_base(State(state): State<Arc<AppState>>) -> Json<BaseInfo> {
    state.controller.new_request();
    Json(state.controller.base_info().await)
}

/// Starts a session, taking ownership away from any previous client.
async fn start_session(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Json(request): Json<StartRequest>,
) -> Result<Json<BaseInfo>, ApiError> {
    let kind: BackendType = request.backend_type.parse()?;
    let config = SingBoxConfig::new(&request.config, &request.exclude_inbounds)?;

    let client_id = connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    if state.controller.backend().is_some() {
        tracing::info!(
            client = %client_id,
            previous = %state.controller.client_id(),
            "core control access taken away from previous client"
        );
        state.controller.disconnect().await;
    }

    state.controller.connect(client_id, request.keep_alive);
    state
        .controller
        .start_backend(kind, config, &request.users)
        .await?;

    Ok(Json(state.controller.base_info().await))
}

/// Always succeeds, even with no session to stop.
async fn stop_session(State(state): State<Arc<AppState>>) -> StatusCode {
    state.controller.disconnect().await;
    StatusCode::NO_CONTENT
}

async fn sync_user(
    State(state): State<Arc<AppState>>,
    Json(user): Json<User>,
) -> Result<StatusCode, ApiError> {
    state.controller.new_request();
    let backend = state.controller.backend().ok_or(NodeError::BackendNotRunning)?;
    backend.sync_user(&user).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn sync_users(
    State(state): State<Arc<AppState>>,
    Json(users): Json<Vec<User>>,
) -> Result<StatusCode, ApiError> {
    state.controller.new_request();
    let backend = state.controller.backend().ok_or(NodeError::BackendNotRunning)?;
    backend.sync_users(&users).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_system_stats(
    State(state): State<Arc<AppState>>,
) -> Json<Option<SystemStats>> {
    state.controller.new_request();
    Json(state.controller.system_stats())
}

async fn get_backend_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<BackendStats>, ApiError> {
    state.controller.new_request();
    let backend = state.controller.backend().ok_or(NodeError::BackendNotRunning)?;
    Ok(Json(backend.sys_stats().await?))
}

/// Live log tail as SSE. Lagging consumers silently lose the oldest lines;
/// the capture side never blocks on them.
async fn stream_logs(
    State(state): State<Arc<AppState>>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    state.controller.new_request();
    let backend = state.controller.backend().ok_or(NodeError::BackendNotRunning)?;
    let receiver = backend.logs();

    let stream = BroadcastStream::new(receiver).filter_map(|result| async move {
        match result {
            Ok(line) => Some(Ok::<Event, Infallible>(Event::default().data(line))),
            Err(_) => None,
        }
    });

    Ok(Sse::new(stream))
}
