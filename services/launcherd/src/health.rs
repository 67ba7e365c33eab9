//! Readiness polling for a freshly started llama-server.
//!
//! llama-server answers `GET /health` with 503 while the model is loading and
//! with `200 {"status":"ok"}` once it can serve completions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::supervisor::Supervisor;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// Nothing listening yet (or connection timed out).
    Unreachable,
    /// Port open, model not loaded.
    Loading,
    Ready,
}

#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn check(&self) -> Readiness;
}

pub struct HttpReadinessProbe {
    url: String,
    client: reqwest::Client,
    request_timeout: Duration,
}

impl HttpReadinessProbe {
    pub fn new(llama_host: &str, llama_port: u16, request_timeout: Duration) -> Self {
        let host = connect_host(llama_host);
        let client = match reqwest::Client::builder().timeout(request_timeout).build() {
            Ok(c) => c,
            Err(e) => {
                warn!("health probe client: {e}; using defaults");
                reqwest::Client::new()
            }
        };
        Self {
            url: format!("http://{host}:{llama_port}/health"),
            client,
            request_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ReadinessProbe for HttpReadinessProbe {
    async fn check(&self) -> Readiness {
        // per-request bound holds even for a fallback client
        let resp = match self.client.get(&self.url).timeout(self.request_timeout).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(url = %self.url, "health probe: {e}");
                return Readiness::Unreachable;
            }
        };
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        classify(status, &body)
    }
}

/// Maps a `/health` answer to a readiness level. Anything that answered at
/// all but is not a clean 200/"ok" counts as loading.
pub fn classify(status: u16, body: &str) -> Readiness {
    if status != 200 {
        return Readiness::Loading;
    }
    let reported = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("status").and_then(|s| s.as_str()).map(str::to_owned));
    match reported.as_deref() {
        None | Some("ok") => Readiness::Ready,
        Some(_) => Readiness::Loading,
    }
}

/// Wildcard bind addresses are not connectable everywhere.
fn connect_host(host: &str) -> String {
    match host {
        "0.0.0.0" | "" => "127.0.0.1".to_string(),
        "::" | "[::]" => "[::1]".to_string(),
        h if h.contains(':') && !h.starts_with('[') => format!("[{h}]"),
        h => h.to_string(),
    }
}

pub enum ProbeStep {
    Continue,
    Done,
}

/// One loop per start. Ends on readiness, on cancellation, when the
/// generation it belongs to is no longer current, or after `health_timeout`.
pub async fn run_probe_loop(sup: Arc<Supervisor>, generation: u64, cancel: CancellationToken) {
    let settings = sup.settings().clone();
    let deadline = Instant::now() + settings.health_timeout;
    let mut ticker = interval(settings.probe_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(generation, "probe cancelled");
                return;
            }
            _ = ticker.tick() => {}
        }

        if Instant::now() >= deadline {
            sup.expire_startup(generation, &cancel).await;
            return;
        }

        let readiness = tokio::select! {
            _ = cancel.cancelled() => return,
            r = sup.probe().check() => r,
        };

        if let ProbeStep::Done = sup.apply_readiness(generation, readiness).await {
            return;
        }
    }
}
