use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Placeholder key shipped in the sample config.json.
pub const DEFAULT_API_KEY: &str = "CHANGE_ME_TO_SOMETHING_RANDOM_1234567890";

pub const DEFAULT_CONTEXT: u32 = 8192;
pub const DEFAULT_GPU_LAYERS: u32 = 48;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LauncherConfig {
    pub server: ServerSection,
    pub security: SecuritySection,
    pub paths: PathsSection,
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
    #[serde(default)]
    pub supervisor: SupervisorSection,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerSection {
    /// Control server bind host.
    pub host: String,
    pub port: u16,
    /// Where llama-server is told to listen.
    pub llama_host: String,
    pub llama_port: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecuritySection {
    pub api_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PathsSection {
    pub llama_server: PathBuf,
    pub models_base: PathBuf,
}

/// One launchable model. The registry key is its identifier.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub name: Option<String>,
    /// Relative to `paths.models_base`.
    pub file: String,
    #[serde(default = "default_context")]
    pub context: u32,
    #[serde(default = "default_gpu_layers")]
    pub gpu_layers: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_moe: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

impl ModelConfig {
    /// Display name, falling back to the registry id.
    pub fn display_name<'a>(&'a self, id: &'a str) -> &'a str {
        self.name.as_deref().unwrap_or(id)
    }
}

/// Tunables for the process supervisor. Every field has a default so the
/// whole section may be omitted.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub log_capacity: usize,
    pub probe_interval_ms: u64,
    pub health_timeout_secs: u64,
    pub stop_grace_secs: u64,
    pub telemetry_timeout_ms: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            log_capacity: 2000,
            probe_interval_ms: 1000,
            health_timeout_secs: 300,
            stop_grace_secs: 10,
            telemetry_timeout_ms: 5000,
        }
    }
}

fn default_context() -> u32 {
    DEFAULT_CONTEXT
}

fn default_gpu_layers() -> u32 {
    DEFAULT_GPU_LAYERS
}
