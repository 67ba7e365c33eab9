use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::error::ApiError;
use crate::state::SharedState;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Shared-secret check for every `/api` route.
#[derive(Clone)]
pub struct AuthGate {
    secret: String,
}

impl AuthGate {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }

    /// Constant-time over the key contents; an empty configured key never
    /// matches.
    pub fn check(&self, credential: Option<&str>) -> bool {
        let Some(provided) = credential else {
            return false;
        };
        let expected = self.secret.as_bytes();
        if expected.is_empty() {
            return false;
        }
        let provided = provided.as_bytes();
        if expected.len() != provided.len() {
            let _ = expected.ct_eq(expected);
            return false;
        }
        expected.ct_eq(provided).into()
    }

    /// First few characters, for the startup banner.
    pub fn hint(&self) -> String {
        let shown: String = self.secret.chars().take(8).collect();
        format!("{shown}...")
    }
}

/// `X-API-Key: <key>`, or `Authorization: Bearer <key>`.
pub fn credential(headers: &HeaderMap) -> Option<&str> {
    if let Some(v) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(v.trim());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

pub async fn require_api_key(
    State(state): State<SharedState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !state.auth.check(credential(req.headers())) {
        warn!(method = %req.method(), path = %req.uri().path(), "rejected request without valid API key");
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(req).await)
}
