use crate::{model_path, LauncherConfig, DEFAULT_API_KEY};

/// Errors block startup, warnings are only reported.
#[derive(Clone, Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Checks that the referenced paths exist and that the model table is usable.
/// Touches the filesystem (existence checks only).
pub fn validate_config(cfg: &LauncherConfig) -> ValidationReport {
    let mut report = ValidationReport::default();

    if cfg.security.api_key.trim().is_empty() {
        report.errors.push("security.api_key must not be empty".to_string());
    } else if cfg.security.api_key == DEFAULT_API_KEY {
        report
            .warnings
            .push("Using default API key - please change for security!".to_string());
    }

    if !cfg.paths.llama_server.exists() {
        report.errors.push(format!(
            "llama-server not found at: {}",
            cfg.paths.llama_server.display()
        ));
    }

    let base_ok = cfg.paths.models_base.exists();
    if !base_ok {
        report.errors.push(format!(
            "Models directory not found at: {}",
            cfg.paths.models_base.display()
        ));
    }

    if cfg.models.is_empty() {
        report.warnings.push("No models defined in config".to_string());
    }

    for (id, m) in &cfg.models {
        if m.name.is_none() {
            report.warnings.push(format!("Model '{id}' missing 'name' field"));
        }
        if m.file.trim().is_empty() {
            report.errors.push(format!("Model '{id}' missing 'file' field"));
            continue;
        }
        if base_ok {
            let p = model_path(&cfg.paths.models_base, m);
            if !p.exists() {
                report
                    .warnings
                    .push(format!("Model file not found: {}", p.display()));
            }
        }
    }

    if cfg.supervisor.log_capacity == 0 {
        report
            .errors
            .push("supervisor.log_capacity must be at least 1".to_string());
    }
    if cfg.supervisor.probe_interval_ms == 0 {
        report
            .errors
            .push("supervisor.probe_interval_ms must be at least 1".to_string());
    }

    report
}
