use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use modelcfg::{load_config, validate_config, LauncherConfig};
use tracing::warn;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub config_path: PathBuf,
    /// `LAUNCHER_BIND_ADDR`; falls back to `server.host:server.port`.
    pub bind_addr: Option<String>,
    pub nvidia_smi: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let config_path = std::env::var("LAUNCHER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.json"));
        let bind_addr = std::env::var("LAUNCHER_BIND_ADDR").ok().filter(|s| !s.trim().is_empty());
        let nvidia_smi = std::env::var("LAUNCHER_NVIDIA_SMI").unwrap_or_else(|_| "nvidia-smi".to_string());

        if let Some(addr) = &bind_addr {
            if !addr.contains(':') {
                bail!("LAUNCHER_BIND_ADDR must be host:port, got {addr:?}");
            }
        }

        Ok(Self {
            config_path,
            bind_addr,
            nvidia_smi,
        })
    }

    /// Reads and validates the JSON config. Validation errors abort startup,
    /// warnings are logged.
    pub fn load_launcher_config(&self) -> Result<LauncherConfig> {
        let cfg = load_config(&self.config_path)
            .with_context(|| format!("Failed to load {}", self.config_path.display()))?;

        let report = validate_config(&cfg);
        for w in &report.warnings {
            warn!("config: {w}");
        }
        if !report.is_ok() {
            bail!(
                "invalid config {}:\n  - {}",
                self.config_path.display(),
                report.errors.join("\n  - ")
            );
        }
        Ok(cfg)
    }

    pub fn bind_addr_for(&self, cfg: &LauncherConfig) -> String {
        self.bind_addr
            .clone()
            .unwrap_or_else(|| format!("{}:{}", cfg.server.host, cfg.server.port))
    }
}
