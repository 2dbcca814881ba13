/// Single-shot HTTP health probe against a candidate panel address.
///
/// Success is strictly a 200 response within the configured deadline.
/// No retries, no body inspection, no logging per failed attempt.

use std::net::Ipv4Addr;

use reqwest::header::CONNECTION;
use reqwest::{Client, StatusCode};

use crate::config::Config;

#[derive(Clone)]
pub struct Prober {
    client: Client,
    port: u16,
    path: String,
}

impl Prober {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let client = Client::builder()
            .http1_only()
            .connect_timeout(cfg.connect_timeout())
            .timeout(cfg.probe_deadline())
            .user_agent(crate::USER_AGENT)
            // Probes must hit the LAN directly and hold nothing open between ticks.
            .no_proxy()
            .pool_max_idle_per_host(0)
            .build()?;

        let mut path = cfg.panel_health_path.clone();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }

        Ok(Self {
            client,
            port: cfg.panel_port,
            path,
        })
    }

    /// Probe one address. Any transport error, timeout, or non-200 status
    /// counts as unhealthy.
    pub async fn probe(&self, ip: Ipv4Addr) -> bool {
        let url = format!("http://{}:{}{}", ip, self.port, self.path);
        match self
            .client
            .get(&url)
            .header(CONNECTION, "close")
            .send()
            .await
        {
            Ok(resp) => resp.status() == StatusCode::OK,
            Err(_) => false,
        }
    }
}
