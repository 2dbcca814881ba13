/// Runtime configuration.
///
/// Resolution order: `--config <path>` (or `$KIOSK_CONFIG`), else
/// `/etc/kiosk-controller.json` if present, else built-in defaults.
/// After the file, individual `KIOSK_*` environment variables override
/// single fields. A file that fails to parse falls back to defaults;
/// configuration problems never abort startup.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    // Indirection router
    pub router_port: u16,

    // Panel health endpoint
    pub panel_port: u16,
    pub panel_health_path: String,
    pub check_interval_sec: f64,

    // Hysteresis against flapping
    pub fails_to_down: u32,
    pub oks_to_up: u32,

    // After the first failure, only the last known IP is probed for this long
    pub recovery_window_sec: f64,

    // Discovery
    pub discovery_budget_sec: f64,
    pub discovery_cooldown_sec: f64,
    pub discovery_workers: usize,

    // Health probe timeouts
    pub connect_timeout_sec: f64,
    pub read_timeout_sec: f64,

    // Firefox / watchdog
    pub firefox_startup_grace_sec: f64,
    pub firefox_kill_timeout_sec: f64,
    pub window_missing_to_restart_sec: f64,

    // Paths
    pub cache_dir: PathBuf,
    pub cache_file: PathBuf,
    pub profile_dir: PathBuf,
    pub splash_file: PathBuf,
    pub log_file: PathBuf,

    // X defaults for spawned processes
    pub display: String,
    pub xauthority: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let cache_dir = home.join(".cache").join("kiosk");
        Self {
            router_port: 8765,
            panel_port: 1111,
            panel_health_path: "/api?sensors=STIME".to_string(),
            check_interval_sec: 2.0,
            fails_to_down: 3,
            oks_to_up: 2,
            recovery_window_sec: 12.0,
            discovery_budget_sec: 10.0,
            discovery_cooldown_sec: 90.0,
            discovery_workers: 64,
            connect_timeout_sec: 0.45,
            read_timeout_sec: 0.75,
            firefox_startup_grace_sec: 10.0,
            firefox_kill_timeout_sec: 4.0,
            window_missing_to_restart_sec: 20.0,
            cache_file: cache_dir.join("target_ips.json"),
            splash_file: cache_dir.join("loading.html"),
            log_file: cache_dir.join("kiosk_controller.log"),
            cache_dir,
            profile_dir: home.join(".mozilla").join("kiosk-profile"),
            display: ":0".to_string(),
            xauthority: home.join(".Xauthority"),
        }
    }
}

/// What `Config::resolve` did, reported back so the caller can log it once
/// the logging stack is up.
#[derive(Debug, Default)]
pub struct ConfigReport {
    /// Config file that was actually read, if any.
    pub used_path: Option<PathBuf>,
    /// Parse error for that file, if it was unusable.
    pub file_error: Option<String>,
}

impl Config {
    /// Resolve the effective configuration from an optional explicit path.
    pub fn resolve(explicit: Option<&Path>) -> (Self, ConfigReport) {
        let mut report = ConfigReport::default();

        let path = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => {
                let default = PathBuf::from(crate::DEFAULT_CONFIG_PATH);
                default.exists().then_some(default)
            }
        };

        let mut cfg = match &path {
            Some(p) => match std::fs::read_to_string(p) {
                Ok(raw) => match serde_json::from_str::<Config>(&raw) {
                    Ok(cfg) => {
                        report.used_path = Some(p.clone());
                        cfg
                    }
                    Err(e) => {
                        report.file_error = Some(format!("{}: {}", p.display(), e));
                        Config::default()
                    }
                },
                Err(e) => {
                    report.file_error = Some(format!("{}: {}", p.display(), e));
                    Config::default()
                }
            },
            None => Config::default(),
        };

        cfg.apply_env_overrides();
        (cfg, report)
    }

    /// Apply `KIOSK_*` environment overrides on top of the current values.
    /// Empty and unparseable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        fn set<T: FromStr>(dst: &mut T, raw: &str) {
            if let Ok(v) = raw.parse() {
                *dst = v;
            }
        }

        for (var, raw) in std::env::vars() {
            if raw.is_empty() {
                continue;
            }
            match var.as_str() {
                "KIOSK_ROUTER_PORT" => set(&mut self.router_port, &raw),
                "KIOSK_PANEL_PORT" => set(&mut self.panel_port, &raw),
                "KIOSK_PANEL_HEALTH_PATH" => self.panel_health_path = raw,
                "KIOSK_CHECK_INTERVAL_SEC" => set(&mut self.check_interval_sec, &raw),
                "KIOSK_FAILS_TO_DOWN" => set(&mut self.fails_to_down, &raw),
                "KIOSK_OKS_TO_UP" => set(&mut self.oks_to_up, &raw),
                "KIOSK_RECOVERY_WINDOW_SEC" => set(&mut self.recovery_window_sec, &raw),
                "KIOSK_DISCOVERY_BUDGET_SEC" => set(&mut self.discovery_budget_sec, &raw),
                "KIOSK_DISCOVERY_COOLDOWN_SEC" => set(&mut self.discovery_cooldown_sec, &raw),
                "KIOSK_DISCOVERY_WORKERS" => set(&mut self.discovery_workers, &raw),
                "KIOSK_CONNECT_TIMEOUT_SEC" => set(&mut self.connect_timeout_sec, &raw),
                "KIOSK_READ_TIMEOUT_SEC" => set(&mut self.read_timeout_sec, &raw),
                "KIOSK_FIREFOX_STARTUP_GRACE_SEC" => {
                    set(&mut self.firefox_startup_grace_sec, &raw)
                }
                "KIOSK_FIREFOX_KILL_TIMEOUT_SEC" => set(&mut self.firefox_kill_timeout_sec, &raw),
                "KIOSK_WINDOW_MISSING_TO_RESTART_SEC" => {
                    set(&mut self.window_missing_to_restart_sec, &raw)
                }
                "KIOSK_CACHE_DIR" => self.cache_dir = PathBuf::from(raw),
                "KIOSK_CACHE_FILE" => self.cache_file = PathBuf::from(raw),
                "KIOSK_PROFILE_DIR" => self.profile_dir = PathBuf::from(raw),
                "KIOSK_SPLASH_FILE" => self.splash_file = PathBuf::from(raw),
                "KIOSK_LOG_FILE" => self.log_file = PathBuf::from(raw),
                "KIOSK_DISPLAY" => self.display = raw,
                "KIOSK_XAUTHORITY" => self.xauthority = PathBuf::from(raw),
                _ => {}
            }
        }
    }

    pub fn check_interval(&self) -> Duration {
        // The periodic timer cannot run with a zero period.
        secs(self.check_interval_sec).max(Duration::from_millis(100))
    }

    pub fn connect_timeout(&self) -> Duration {
        secs(self.connect_timeout_sec)
    }

    pub fn read_timeout(&self) -> Duration {
        secs(self.read_timeout_sec)
    }

    /// Total per-probe deadline.
    pub fn probe_deadline(&self) -> Duration {
        (self.connect_timeout() + self.read_timeout()).max(Duration::from_millis(100))
    }

    pub fn recovery_window(&self) -> Duration {
        secs(self.recovery_window_sec)
    }

    pub fn discovery_budget(&self) -> Duration {
        secs(self.discovery_budget_sec)
    }

    pub fn discovery_cooldown(&self) -> Duration {
        secs(self.discovery_cooldown_sec)
    }

    pub fn firefox_startup_grace(&self) -> Duration {
        secs(self.firefox_startup_grace_sec)
    }

    pub fn firefox_kill_timeout(&self) -> Duration {
        secs(self.firefox_kill_timeout_sec)
    }

    pub fn window_missing_to_restart(&self) -> Duration {
        secs(self.window_missing_to_restart_sec)
    }

    /// The only URL the browser is ever pointed at.
    pub fn router_url(&self) -> String {
        format!("http://127.0.0.1:{}/", self.router_port)
    }
}

/// Negative or non-finite durations from a config file collapse to zero.
fn secs(v: f64) -> Duration {
    if v.is_finite() && v > 0.0 {
        Duration::from_secs_f64(v)
    } else {
        Duration::ZERO
    }
}
