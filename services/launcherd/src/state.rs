use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use modelcfg::LauncherConfig;
use tracing::debug;

use crate::auth::AuthGate;
use crate::health::HttpReadinessProbe;
use crate::log_ring::LogRing;
use crate::stats::StatsCollector;
use crate::supervisor::{Supervisor, SupervisorSettings};

pub type SharedState = Arc<AppState>;

const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

pub struct AppState {
    pub config: Arc<LauncherConfig>,
    pub supervisor: Arc<Supervisor>,
    pub stats: StatsCollector,
    pub auth: AuthGate,
    /// Port the control server listens on, for the advertised URLs.
    pub port: u16,
    request_count: AtomicU64,
}

impl AppState {
    pub fn new(config: LauncherConfig, nvidia_smi: &str, port: u16) -> Self {
        let config = Arc::new(config);
        let sup_cfg = &config.supervisor;
        let settings = SupervisorSettings::from(sup_cfg);
        let probe = HttpReadinessProbe::new(
            &config.server.llama_host,
            config.server.llama_port,
            PROBE_REQUEST_TIMEOUT,
        );
        debug!(url = probe.url(), "readiness probe");
        let logs = Arc::new(LogRing::new(sup_cfg.log_capacity));
        let supervisor = Arc::new(Supervisor::new(config.clone(), settings, Arc::new(probe), logs));

        Self {
            stats: StatsCollector::new(nvidia_smi, Duration::from_millis(sup_cfg.telemetry_timeout_ms)),
            auth: AuthGate::new(config.security.api_key.clone()),
            supervisor,
            config,
            port,
            request_count: AtomicU64::new(0),
        }
    }

    pub fn telemetry_timeout(&self) -> Duration {
        Duration::from_millis(self.config.supervisor.telemetry_timeout_ms)
    }

    /// Counts status polls; returns the new total.
    pub fn bump_requests(&self) -> u64 {
        self.request_count.fetch_add(1, Ordering::Relaxed) + 1
    }
}
