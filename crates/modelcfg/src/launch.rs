use std::path::{Path, PathBuf};

use crate::{LauncherConfig, ModelConfig};

/// Fully resolved llama-server invocation for one model.
#[derive(Clone, Debug, PartialEq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl LaunchSpec {
    /// Shell-ish rendering for log lines. Not meant to be re-parsed.
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for a in &self.args {
            line.push(' ');
            line.push_str(a);
        }
        line
    }
}

pub fn model_path(models_base: &Path, model: &ModelConfig) -> PathBuf {
    models_base.join(&model.file)
}

/// Argument order:
/// - model, bind host/port, context, gpu layers
/// - optional cpu-moe and sampling flags, in that order
/// - extra_args verbatim, last
pub fn launch_args(
    model: &ModelConfig,
    models_base: &Path,
    llama_host: &str,
    llama_port: u16,
) -> Vec<String> {
    let mut args = vec![
        "-m".to_string(),
        model_path(models_base, model).display().to_string(),
        "--host".to_string(),
        llama_host.to_string(),
        "--port".to_string(),
        llama_port.to_string(),
        "-c".to_string(),
        model.context.to_string(),
        "-ngl".to_string(),
        model.gpu_layers.to_string(),
    ];

    if let Some(n) = model.cpu_moe {
        args.extend(["--n-cpu-moe".to_string(), n.to_string()]);
    }
    if let Some(t) = model.temp {
        args.extend(["--temp".to_string(), t.to_string()]);
    }
    if let Some(k) = model.top_k {
        args.extend(["--top-k".to_string(), k.to_string()]);
    }
    if let Some(p) = model.top_p {
        args.extend(["--top-p".to_string(), p.to_string()]);
    }
    if let Some(p) = model.min_p {
        args.extend(["--min-p".to_string(), p.to_string()]);
    }
    args.extend(model.extra_args.iter().cloned());
    args
}

impl LauncherConfig {
    pub fn launch_spec(&self, model: &ModelConfig) -> LaunchSpec {
        LaunchSpec {
            program: self.paths.llama_server.clone(),
            args: launch_args(
                model,
                &self.paths.models_base,
                &self.server.llama_host,
                self.server.llama_port,
            ),
        }
    }
}
