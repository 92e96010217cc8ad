//! HTTP control surface over [`PatrolService`].
//!
//! | Route | Action |
//! |---|---|
//! | `POST /points` | append one point `{"point": "..."}` |
//! | `POST /points/batch` | append several `{"points": [...]}` |
//! | `GET /points` | list the queue |
//! | `DELETE /points` | clear the queue |
//! | `POST /run` | start a run `{"persist": bool}` |
//! | `POST /stop` | request cancellation |
//! | `GET /status` | run state, queue length, buffered readings, last report |
//! | `GET /connectivity` | robot, sensor and sink reachability |

use crate::error::RunRejected;
use crate::inspection::RunOptions;
use crate::service::{ConnectivityReport, PatrolService, StatusReport};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Body of `POST /points`.
#[derive(Debug, Deserialize)]
pub struct PointRequest {
    /// Label as it appears on the robot screen.
    pub point: String,
}

/// Body of `POST /points/batch`.
#[derive(Debug, Deserialize)]
pub struct PointsRequest {
    /// Labels in visiting order.
    pub points: Vec<String>,
}

/// The queue after a change, next point first.
#[derive(Debug, Serialize, Deserialize)]
pub struct QueueResponse {
    /// Current queue.
    pub points: Vec<String>,
}

/// Reply to `DELETE /points`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClearedResponse {
    /// Points dropped from the queue.
    pub cleared: usize,
}

/// Reply to an accepted `POST /run`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunStarted {
    /// Identifier to match against `GET /status`.
    pub run_id: Uuid,
}

/// Reply to `POST /stop`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StopResponse {
    /// A run was active and has been asked to stop.
    pub stopping: bool,
}

/// JSON error payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable reason.
    pub error: String,
}

impl IntoResponse for RunRejected {
    fn into_response(self) -> Response {
        let status = match self {
            RunRejected::AlreadyRunning => StatusCode::CONFLICT,
            RunRejected::QueueEmpty => StatusCode::UNPROCESSABLE_ENTITY,
        };
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Routes of the control surface, bound to one service.
pub fn router(service: PatrolService) -> Router {
    Router::new()
        .route("/points", get(list_points).post(append_point).delete(clear_points))
        .route("/points/batch", post(append_points))
        .route("/run", post(start_run))
        .route("/stop", post(stop_run))
        .route("/status", get(status))
        .route("/connectivity", get(connectivity))
        .with_state(service)
}

/// Serves the router on `listener` until `shutdown` fires.
pub async fn serve(
    service: PatrolService,
    listener: tokio::net::TcpListener,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "HTTP control surface listening");
    axum::serve(listener, router(service))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn append_point(
    State(service): State<PatrolService>,
    Json(req): Json<PointRequest>,
) -> Json<QueueResponse> {
    Json(QueueResponse {
        points: service.append_point(req.point),
    })
}

async fn append_points(
    State(service): State<PatrolService>,
    Json(req): Json<PointsRequest>,
) -> Json<QueueResponse> {
    Json(QueueResponse {
        points: service.append_points(req.points),
    })
}

async fn list_points(State(service): State<PatrolService>) -> Json<QueueResponse> {
    Json(QueueResponse {
        points: service.list_points(),
    })
}

async fn clear_points(State(service): State<PatrolService>) -> Json<ClearedResponse> {
    Json(ClearedResponse {
        cleared: service.clear_points(),
    })
}

async fn start_run(
    State(service): State<PatrolService>,
    options: Option<Json<RunOptions>>,
) -> Result<(StatusCode, Json<RunStarted>), RunRejected> {
    let options = options.map(|Json(o)| o).unwrap_or_default();
    let run_id = service.start_run(options)?;
    Ok((StatusCode::ACCEPTED, Json(RunStarted { run_id })))
}

async fn stop_run(State(service): State<PatrolService>) -> Json<StopResponse> {
    Json(StopResponse {
        stopping: service.stop_run(),
    })
}

async fn status(State(service): State<PatrolService>) -> Json<StatusReport> {
    Json(service.status())
}

async fn connectivity(State(service): State<PatrolService>) -> Json<ConnectivityReport> {
    Json(service.connectivity().await)
}
