/// The periodic control loop: probe, update availability, discover when
/// needed, publish the router snapshot, keep the browser alive.
///
/// Every fallible step inside a tick is logged and swallowed; the loop
/// always advances until shutdown is requested.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use ipnet::Ipv4Net;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kiosk_core::availability::{Availability, Mode, Transition};
use kiosk_core::cache::TargetCache;
use kiosk_core::config::Config;
use kiosk_core::discovery;
use kiosk_core::netinfo;
use kiosk_core::probe::Prober;
use kiosk_core::router::Router;

use crate::browser::BrowserSupervisor;

pub struct KioskController {
    cfg: Arc<Config>,
    prober: Prober,
    cache: TargetCache,
    availability: Availability,
    router: Arc<Router>,
    browser: BrowserSupervisor,
    network: Option<Ipv4Net>,
    router_url: String,
}

impl KioskController {
    pub async fn new(cfg: Arc<Config>, router: Arc<Router>) -> anyhow::Result<Self> {
        let prober = Prober::new(&cfg)?;
        let cache = TargetCache::new(&cfg.cache_file);
        let network = netinfo::default_cidr().await;

        let cached = cache.load();
        let availability = Availability::new(&cfg, cached.first().copied());

        match network {
            Some(net) => info!(%net, "Local network detected"),
            None => warn!("Could not determine the local network"),
        }
        if cached.is_empty() {
            info!("Target cache is empty");
        } else {
            info!(ips = ?cached, "Target cache loaded");
        }

        Ok(Self {
            browser: BrowserSupervisor::new(Arc::clone(&cfg)),
            router_url: cfg.router_url(),
            cfg,
            prober,
            cache,
            availability,
            router,
            network,
        })
    }

    /// Run ticks until cancelled, then take the browser down with us.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!(router_url = %self.router_url, "Kiosk controller starting");

        self.router
            .publish(Mode::Down, self.availability.target_ip(), String::new());
        self.browser.ensure_running(&self.router_url).await;

        if let Some(ip) = self.availability.target_ip() {
            info!(%ip, "Starting with cached target");
        }

        let mut ticker = tokio::time::interval(self.cfg.check_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        info!("Control loop stopped, shutting down browser");
        self.browser.kill().await;
    }

    async fn tick(&mut self) {
        // No target counts as a failed probe.
        let healthy = match self.availability.target_ip() {
            Some(ip) => self.prober.probe(ip).await,
            None => false,
        };

        match self.availability.observe(healthy, Instant::now()) {
            Some(Transition::CameUp) => {
                info!(target = ?self.availability.target_ip(), "Panel is UP");
            }
            Some(Transition::WentDown) => {
                warn!(target = ?self.availability.target_ip(), "Panel is DOWN");
            }
            None => {}
        }

        if self.availability.mode() == Mode::Down {
            self.maybe_discover().await;
        } else if let Some(ip) = self.availability.target_ip() {
            // Refresh the cache timestamp on every healthy tick so the file
            // orders targets by most recent contact.
            if let Err(e) = self.cache.record_success(ip) {
                warn!(error = %e, "Failed to update the target cache");
            }
        }

        self.router.publish(
            self.availability.mode(),
            self.availability.target_ip(),
            self.panel_url(),
        );
        self.browser.ensure_running(&self.router_url).await;
    }

    /// Scan for a panel, honoring the recovery window and the cooldown.
    async fn maybe_discover(&mut self) {
        let now = Instant::now();
        if !self.availability.may_discover(now) {
            return;
        }
        self.availability.note_discovery_attempt(now);

        // The interface may come up after we do (boot ordering); keep
        // trying until a network is known.
        if self.network.is_none() {
            self.network = netinfo::default_cidr().await;
            if let Some(net) = self.network {
                info!(%net, "Local network detected");
            }
        }

        let seeds = self.gather_seeds().await;
        let found = discovery::discover(
            &self.prober,
            self.network,
            &seeds,
            self.cfg.discovery_budget(),
            self.cfg.discovery_workers,
        )
        .await;

        if let Some(ip) = found {
            self.availability.adopt_target(ip);
            if let Err(e) = self.cache.record_success(ip) {
                warn!(error = %e, "Failed to record the discovered target");
            }
        }
    }

    /// Cache entries first, then ARP neighbors. Addresses outside the
    /// local network cannot be the panel and are dropped when the network
    /// is known.
    async fn gather_seeds(&self) -> Vec<Ipv4Addr> {
        let mut seeds = self.cache.load();
        if let Some(net) = self.network {
            seeds.retain(|ip| net.contains(ip));
        }
        for ip in netinfo::neighbor_ips().await {
            let in_network = self.network.map_or(true, |net| net.contains(&ip));
            if in_network && !seeds.contains(&ip) {
                seeds.push(ip);
            }
        }
        seeds
    }

    fn panel_url(&self) -> String {
        panel_url(&self.cfg, self.availability.mode(), self.availability.target_ip())
    }
}

/// The URL the router page embeds while the panel is up; empty otherwise
/// (the page then shows the splash).
fn panel_url(cfg: &Config, mode: Mode, target_ip: Option<Ipv4Addr>) -> String {
    match (mode, target_ip) {
        (Mode::Up, Some(ip)) => format!("http://{}:{}/", ip, cfg.panel_port),
        _ => String::new(),
    }
}
