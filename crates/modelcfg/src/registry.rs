use std::path::Path;

use serde::Serialize;
use thiserror::Error;

use crate::{LauncherConfig, ModelConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

pub fn load_config(path: &Path) -> Result<LauncherConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&raw)
}

pub fn parse_config(raw: &str) -> Result<LauncherConfig> {
    Ok(serde_json::from_str(raw)?)
}

/// What `/api/models` exposes per entry.
#[derive(Clone, Debug, Serialize)]
pub struct ModelSummary {
    pub id: String,
    pub name: String,
    pub context: u32,
    pub gpu_layers: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_moe: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_p: Option<f32>,
}

impl LauncherConfig {
    pub fn model(&self, id: &str) -> Option<&ModelConfig> {
        self.models.get(id)
    }

    /// Sorted by id (BTreeMap order).
    pub fn list_models(&self) -> Vec<ModelSummary> {
        self.models
            .iter()
            .map(|(id, m)| ModelSummary {
                id: id.clone(),
                name: m.display_name(id).to_string(),
                context: m.context,
                gpu_layers: m.gpu_layers,
                cpu_moe: m.cpu_moe,
                temp: m.temp,
                top_k: m.top_k,
                top_p: m.top_p,
                min_p: m.min_p,
            })
            .collect()
    }
}
