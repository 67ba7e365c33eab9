//! GPU and host telemetry. GPU readings come from `nvidia-smi`; a missing
//! tool or GPU only degrades the `gpu` section, host CPU/RAM are always
//! reported.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use sysinfo::System;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{Result, SupervisorError};

const GPU_QUERY: &str = "--query-gpu=name,memory.used,memory.total,utilization.gpu,temperature.gpu";
const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GpuStats {
    pub name: String,
    pub vram_used_mb: Option<u64>,
    pub vram_total_mb: Option<u64>,
    pub utilization: Option<u32>,
    pub temp_c: Option<u32>,
}

#[derive(Clone, Debug, Serialize)]
pub struct MemoryStats {
    pub used_gb: f64,
    pub total_gb: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct CpuStats {
    pub usage_percent: f32,
    pub cores: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatsSnapshot {
    /// First GPU, the one llama-server offloads to by default.
    pub gpu: Option<GpuStats>,
    pub gpus: Vec<GpuStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_error: Option<String>,
    pub memory: MemoryStats,
    pub cpu: CpuStats,
}

#[derive(Clone, Debug)]
pub struct StatsCollector {
    nvidia_smi: PathBuf,
    timeout: Duration,
}

impl StatsCollector {
    pub fn new(nvidia_smi: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            nvidia_smi: nvidia_smi.into(),
            timeout,
        }
    }

    pub async fn collect(&self) -> StatsSnapshot {
        let (gpus, (memory, cpu)) = tokio::join!(self.query_gpus(), host_stats());
        let (gpus, gpu_error) = match gpus {
            Ok(g) => (g, None),
            Err(e) => {
                debug!("{e}");
                (Vec::new(), Some(e.to_string()))
            }
        };
        StatsSnapshot {
            gpu: gpus.first().cloned(),
            gpus,
            gpu_error,
            memory,
            cpu,
        }
    }

    async fn query_gpus(&self) -> Result<Vec<GpuStats>> {
        let unavailable = |msg: String| SupervisorError::TelemetryUnavailable(msg);

        let run = Command::new(&self.nvidia_smi)
            .args([GPU_QUERY, "--format=csv,noheader,nounits"])
            .kill_on_drop(true)
            .output();
        let out = timeout(self.timeout, run)
            .await
            .map_err(|_| unavailable(format!("nvidia-smi timed out after {:?}", self.timeout)))?
            .map_err(|e| unavailable(format!("{}: {e}", self.nvidia_smi.display())))?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let stdout = String::from_utf8_lossy(&out.stdout);
            let msg = if stderr.trim().is_empty() { stdout } else { stderr };
            return Err(unavailable(format!("nvidia-smi failed: {}", msg.trim())));
        }

        let gpus = parse_nvidia_smi(&String::from_utf8_lossy(&out.stdout));
        if gpus.is_empty() {
            return Err(unavailable("nvidia-smi reported no GPUs".into()));
        }
        Ok(gpus)
    }
}

/// One GPU per line: `name, used, total, util, temp`. Fields reported as
/// `[N/A]` (or otherwise unparsable) become `None`; lines with fewer than
/// five fields are skipped.
pub fn parse_nvidia_smi(raw: &str) -> Vec<GpuStats> {
    raw.lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').map(str::trim).collect();
            if parts.len() < 5 || parts[0].is_empty() {
                return None;
            }
            Some(GpuStats {
                name: parts[0].to_string(),
                vram_used_mb: parts[1].parse().ok(),
                vram_total_mb: parts[2].parse().ok(),
                utilization: parts[3].parse().ok(),
                temp_c: parts[4].parse().ok(),
            })
        })
        .collect()
}

async fn host_stats() -> (MemoryStats, CpuStats) {
    let sampled = tokio::task::spawn_blocking(|| {
        let mut sys = System::new();
        // cpu usage is a delta between two refreshes
        sys.refresh_cpu_usage();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        (
            MemoryStats {
                used_gb: gib(sys.used_memory()),
                total_gb: gib(sys.total_memory()),
            },
            CpuStats {
                usage_percent: sys.global_cpu_usage(),
                cores: sys.cpus().len(),
            },
        )
    })
    .await;

    sampled.unwrap_or_else(|e| {
        debug!("host stats task failed: {e}");
        (
            MemoryStats { used_gb: 0.0, total_gb: 0.0 },
            CpuStats { usage_percent: 0.0, cores: 0 },
        )
    })
}

/// Bytes to GiB, one decimal.
fn gib(bytes: u64) -> f64 {
    (bytes as f64 / BYTES_PER_GIB * 10.0).round() / 10.0
}
