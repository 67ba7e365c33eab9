use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Unknown model: {0}")]
    ModelNotFound(String),

    #[error("Model '{0}' is already active; stop it first")]
    AlreadyRunning(String),

    #[error("Failed to launch llama-server: {0}")]
    LaunchFailure(String),

    #[error("llama-server not ready after {0}s")]
    HealthTimeout(u64),

    #[error("llama-server exited unexpectedly ({0})")]
    UnexpectedExit(String),

    #[error("Stop failed: {0}")]
    StopFailure(String),

    #[error("Telemetry unavailable: {0}")]
    TelemetryUnavailable(String),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

#[derive(Serialize)]
pub struct ApiErrorBody {
    pub error: String,
}

/// Everything a handler can fail with.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Supervisor(e) => match e {
                SupervisorError::ModelNotFound(_) => StatusCode::NOT_FOUND,
                SupervisorError::AlreadyRunning(_) => StatusCode::CONFLICT,
                SupervisorError::TelemetryUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                SupervisorError::HealthTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
                SupervisorError::LaunchFailure(_)
                | SupervisorError::UnexpectedExit(_)
                | SupervisorError::StopFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(ApiErrorBody { error: self.to_string() })).into_response()
    }
}
