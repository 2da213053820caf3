//! Thin HTTP/SSE transport over a [`ControlSurface`].

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use ap_core::types::TaskId;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::PasswordLayer;
use crate::control::{dispatch, ControlError, ControlSurface};
use crate::hub::Subscription;
use crate::protocol::{BridgeMessage, ControlRequest};

type ApiState = Arc<dyn ControlSurface>;

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = match &self {
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::Conflict(_) => StatusCode::CONFLICT,
            ControlError::Invalid(_) => StatusCode::BAD_REQUEST,
            ControlError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Build the API router. `password` enables the shared-password gate.
pub fn router(surface: ApiState, password: Option<String>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/snapshot", get(get_snapshot))
        .route("/api/events", get(events))
        .route("/api/control", post(control))
        .route("/api/refresh", post(refresh))
        .route("/api/tasks/{id}/log", get(task_log))
        .layer(PasswordLayer::new(password))
        .layer(TraceLayer::new_for_http())
        .with_state(surface)
}

/// Serve `app` on `addr` until `cancel` fires.
pub async fn serve(addr: &str, app: Router, cancel: CancellationToken) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> &'static str {
    "ok"
}

async fn get_snapshot(State(surface): State<ApiState>) -> impl IntoResponse {
    Json((*surface.snapshot()).clone())
}

async fn control(
    State(surface): State<ApiState>,
    Json(req): Json<ControlRequest>,
) -> Result<Json<serde_json::Value>, ControlError> {
    dispatch(surface.as_ref(), req).await.map(Json)
}

async fn refresh(State(surface): State<ApiState>) -> StatusCode {
    surface.request_refresh();
    StatusCode::ACCEPTED
}

async fn task_log(
    State(surface): State<ApiState>,
    Path(id): Path<TaskId>,
) -> Result<Json<Vec<String>>, ControlError> {
    surface.task_log(id).map(Json)
}

/// Current snapshot first, then every hub message until the client leaves.
async fn events(
    State(surface): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let initial = BridgeMessage::Snapshot(Box::new((*surface.snapshot()).clone()));
    let initial = serde_json::to_string(&initial).unwrap_or_default();
    let sub = surface.subscribe();

    let first = stream::once(async move { Ok::<_, Infallible>(Event::default().data(initial)) });
    let rest = stream::unfold(sub, |sub: Subscription| async move {
        let msg = sub.recv().await?;
        let data = serde_json::to_string(&*msg).unwrap_or_default();
        Some((Ok::<_, Infallible>(Event::default().data(data)), sub))
    });

    Sse::new(futures_util::StreamExt::chain(first, rest))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
