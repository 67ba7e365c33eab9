//! Addresses a client can reach the control server on.

use std::net::{IpAddr, UdpSocket};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

#[derive(Clone, Debug, Default, Serialize)]
pub struct NetworkInfo {
    pub hostname: Option<String>,
    pub local: Option<String>,
    pub tailscale_ip: Option<String>,
    pub tailscale_dns: Option<String>,
    pub urls: Vec<String>,
}

/// The subset of `tailscale status --json` we read.
#[derive(Deserialize)]
struct TailscaleStatus {
    #[serde(rename = "Self")]
    self_node: Option<TailscaleNode>,
}

#[derive(Deserialize)]
struct TailscaleNode {
    #[serde(rename = "DNSName", default)]
    dns_name: String,
    #[serde(rename = "TailscaleIPs", default)]
    ips: Vec<IpAddr>,
}

/// (ip, dns) of this node; IPv4 preferred.
pub fn parse_tailscale_status(raw: &str) -> (Option<String>, Option<String>) {
    let Ok(status) = serde_json::from_str::<TailscaleStatus>(raw) else {
        return (None, None);
    };
    let Some(node) = status.self_node else {
        return (None, None);
    };
    let ip = node
        .ips
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| node.ips.first())
        .map(ToString::to_string);
    let dns = Some(node.dns_name.trim_end_matches('.').to_string()).filter(|d| !d.is_empty());
    (ip, dns)
}

/// Primary outbound interface address. Connecting a UDP socket sends no
/// packets; it only selects a route.
pub fn local_ip() -> Option<String> {
    let sock = UdpSocket::bind("0.0.0.0:0").ok()?;
    sock.connect("8.8.8.8:80").ok()?;
    sock.local_addr().ok().map(|a| a.ip().to_string())
}

async fn tailscale(limit: Duration) -> (Option<String>, Option<String>) {
    let run = Command::new("tailscale")
        .args(["status", "--json"])
        .kill_on_drop(true)
        .output();
    match timeout(limit, run).await {
        Ok(Ok(out)) if out.status.success() => parse_tailscale_status(&String::from_utf8_lossy(&out.stdout)),
        Ok(Ok(out)) => {
            debug!(code = ?out.status.code(), "tailscale status failed");
            (None, None)
        }
        Ok(Err(e)) => {
            debug!("tailscale not available: {e}");
            (None, None)
        }
        Err(_) => {
            debug!("tailscale status timed out");
            (None, None)
        }
    }
}

pub async fn discover(port: u16, limit: Duration) -> NetworkInfo {
    let (tailscale_ip, tailscale_dns) = tailscale(limit).await;
    let mut info = NetworkInfo {
        hostname: System::host_name(),
        local: local_ip(),
        tailscale_ip,
        tailscale_dns,
        urls: Vec::new(),
    };
    info.urls = urls_for(&info, port);
    info
}

fn urls_for(info: &NetworkInfo, port: u16) -> Vec<String> {
    let mut urls = vec![format!("http://localhost:{port}")];
    for host in [&info.local, &info.tailscale_ip, &info.tailscale_dns]
        .into_iter()
        .flatten()
    {
        let url = format!("http://{host}:{port}");
        if !urls.contains(&url) {
            urls.push(url);
        }
    }
    urls
}
