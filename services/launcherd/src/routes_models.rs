use axum::{extract::State, Json};
use modelcfg::ModelSummary;
use serde::Serialize;

use crate::state::SharedState;

#[derive(Serialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelSummary>,
}

pub async fn get_models(State(st): State<SharedState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: st.config.list_models(),
    })
}
