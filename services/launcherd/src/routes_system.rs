use axum::{extract::State, Json};
use serde::Serialize;

use crate::network::{discover, NetworkInfo};
use crate::state::SharedState;
use crate::stats::StatsSnapshot;

pub async fn get_stats(State(st): State<SharedState>) -> Json<StatsSnapshot> {
    Json(st.stats.collect().await)
}

pub async fn get_network(State(st): State<SharedState>) -> Json<NetworkInfo> {
    Json(discover(st.port, st.telemetry_timeout()).await)
}

#[derive(Serialize)]
pub struct VersionResponse {
    pub service: &'static str,
    pub version: &'static str,
}

pub async fn get_version() -> Json<VersionResponse> {
    Json(VersionResponse {
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}
