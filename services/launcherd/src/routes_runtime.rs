use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ApiError;
use crate::log_ring::LogEntry;
use crate::runtime::StatusSnapshot;
use crate::state::SharedState;
use crate::supervisor::{StartInfo, StopInfo};

pub const DEFAULT_LOG_LINES: usize = 50;

#[derive(Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub status: StatusSnapshot,
    pub request_count: u64,
}

pub async fn get_status(State(st): State<SharedState>) -> Json<StatusResponse> {
    let request_count = st.bump_requests();
    let status = st.supervisor.status().await;
    Json(StatusResponse { status, request_count })
}

#[derive(Serialize)]
pub struct StartResponse {
    pub success: bool,
    #[serde(flatten)]
    pub started: StartInfo,
}

pub async fn post_start(
    State(st): State<SharedState>,
    Path(model_id): Path<String>,
) -> Result<(StatusCode, Json<StartResponse>), ApiError> {
    info!(model = %model_id, "start requested");
    let started = st.supervisor.start(&model_id).await?;
    Ok((StatusCode::ACCEPTED, Json(StartResponse { success: true, started })))
}

#[derive(Serialize)]
pub struct StopResponse {
    pub success: bool,
    #[serde(flatten)]
    pub stopped: StopInfo,
}

pub async fn post_stop(State(st): State<SharedState>) -> Result<Json<StopResponse>, ApiError> {
    let stopped = st.supervisor.stop().await?;
    Ok(Json(StopResponse { success: true, stopped }))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    pub lines: Option<usize>,
}

#[derive(Serialize)]
pub struct LogsResponse {
    pub generation: u64,
    /// Lines currently buffered, of at most `capacity`.
    pub total: usize,
    pub capacity: usize,
    pub logs: Vec<LogEntry>,
}

pub async fn get_logs(State(st): State<SharedState>, Query(q): Query<LogsQuery>) -> Json<LogsResponse> {
    let lines = q.lines.unwrap_or(DEFAULT_LOG_LINES);
    let ring = st.supervisor.logs();
    Json(LogsResponse {
        generation: ring.generation(),
        total: ring.len(),
        capacity: ring.capacity(),
        logs: ring.tail(lines),
    })
}
