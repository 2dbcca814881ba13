/// Browser supervisor: keeps a kiosk-mode Firefox with an isolated profile
/// alive and pointed at the indirection router.
///
/// Liveness is judged by processes whose command line references the kiosk
/// profile directory; window presence via wmctrl, then xdotool. The
/// supervisor never navigates the browser; the router page steers content.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, RefreshKind, Signal, System, UpdateKind};
use tokio::process::Command;
use tracing::{error, info, warn};

use kiosk_core::config::Config;

const X_TOOL_TIMEOUT: Duration = Duration::from_secs(2);
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(200);
const RESTART_PAUSE: Duration = Duration::from_millis(500);

/// Resolve a tool on PATH; first match wins.
pub fn which(name: &str) -> Option<PathBuf> {
    let output = std::process::Command::new("which").arg(name).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8_lossy(&output.stdout);
    let p = PathBuf::from(path.trim());
    p.exists().then_some(p)
}

/// Decides when a running browser that shows no window gets restarted.
/// Pure bookkeeping over injected instants so the timing is testable.
struct WindowWatchdog {
    startup_grace: Duration,
    missing_to_restart: Duration,
    last_start: Option<Instant>,
    missing_since: Option<Instant>,
}

impl WindowWatchdog {
    fn new(cfg: &Config) -> Self {
        Self {
            startup_grace: cfg.firefox_startup_grace(),
            missing_to_restart: cfg.window_missing_to_restart(),
            last_start: None,
            missing_since: None,
        }
    }

    fn note_start(&mut self, now: Instant) {
        self.last_start = Some(now);
        self.missing_since = None;
    }

    /// Returns true when the window has been missing long enough that the
    /// browser should be restarted. An unknown start time (a browser left
    /// over from a previous run) counts as past the grace period.
    fn assess(&mut self, window_present: bool, now: Instant) -> bool {
        if window_present {
            self.missing_since = None;
            return false;
        }
        if let Some(started) = self.last_start {
            if now.duration_since(started) <= self.startup_grace {
                return false;
            }
        }
        match self.missing_since {
            None => {
                self.missing_since = Some(now);
                false
            }
            Some(since) => now.duration_since(since) > self.missing_to_restart,
        }
    }
}

pub struct BrowserSupervisor {
    cfg: Arc<Config>,
    firefox_path: Option<PathBuf>,
    sys: System,
    watchdog: WindowWatchdog,
}

impl BrowserSupervisor {
    pub fn new(cfg: Arc<Config>) -> Self {
        let firefox_path = ["firefox-esr", "firefox"].into_iter().find_map(which);
        match &firefox_path {
            Some(path) => info!(path = %path.display(), "Browser binary resolved"),
            None => warn!("firefox/firefox-esr not found on PATH, browser starts will fail"),
        }

        let sys = System::new_with_specifics(
            RefreshKind::new()
                .with_processes(ProcessRefreshKind::new().with_cmd(UpdateKind::Always)),
        );

        Self {
            watchdog: WindowWatchdog::new(&cfg),
            cfg,
            firefox_path,
            sys,
        }
    }

    fn profile_pids(&mut self) -> Vec<sysinfo::Pid> {
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new().with_cmd(UpdateKind::Always),
        );
        let needle = self.cfg.profile_dir.to_string_lossy().into_owned();
        self.sys
            .processes()
            .iter()
            .filter(|(_, process)| {
                process
                    .cmd()
                    .iter()
                    .any(|arg| arg.to_string_lossy().contains(&needle))
            })
            .map(|(pid, _)| *pid)
            .collect()
    }

    pub fn is_running(&mut self) -> bool {
        !self.profile_pids().is_empty()
    }

    /// Launch the browser in kiosk mode against `url` (always the router).
    pub fn start(&mut self, url: &str) -> bool {
        let Some(firefox) = self.firefox_path.clone() else {
            error!("Cannot start browser: firefox/firefox-esr not found");
            return false;
        };
        if let Err(e) = std::fs::create_dir_all(&self.cfg.profile_dir) {
            error!(error = %e, "Cannot create browser profile directory");
            return false;
        }

        let mut cmd = Command::new(&firefox);
        cmd.arg("--kiosk")
            .arg("--profile")
            .arg(&self.cfg.profile_dir)
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        apply_x_env(&mut cmd, &self.cfg);

        match cmd.spawn() {
            Ok(child) => {
                info!(url, pid = child.id(), "Browser started");
                // Fire and forget; the runtime reaps the child when it exits.
                drop(child);
                self.watchdog.note_start(Instant::now());
                true
            }
            Err(e) => {
                error!(error = %e, "Browser start failed");
                false
            }
        }
    }

    /// Terminate every process using the kiosk profile, escalating to
    /// SIGKILL after `firefox_kill_timeout`.
    pub async fn kill(&mut self) {
        let pids = self.profile_pids();
        if pids.is_empty() {
            return;
        }
        info!(count = pids.len(), "Stopping browser");
        for pid in &pids {
            if let Some(process) = self.sys.process(*pid) {
                if process.kill_with(Signal::Term).is_none() {
                    process.kill();
                }
            }
        }

        let deadline = Instant::now() + self.cfg.firefox_kill_timeout();
        while Instant::now() < deadline {
            if self.profile_pids().is_empty() {
                return;
            }
            tokio::time::sleep(KILL_POLL_INTERVAL).await;
        }

        let leftover = self.profile_pids();
        if !leftover.is_empty() {
            warn!(count = leftover.len(), "Browser ignored SIGTERM, killing");
            for pid in leftover {
                if let Some(process) = self.sys.process(pid) {
                    process.kill();
                }
            }
        }
    }

    pub async fn restart(&mut self, url: &str) {
        info!("Restarting browser");
        self.kill().await;
        tokio::time::sleep(RESTART_PAUSE).await;
        self.start(url);
    }

    /// Called every tick: start the browser if absent, otherwise run the
    /// window watchdog.
    pub async fn ensure_running(&mut self, url: &str) {
        if !self.is_running() {
            self.start(url);
            return;
        }

        let window_present = has_browser_window(&self.cfg).await;
        if self.watchdog.assess(window_present, Instant::now()) {
            info!("Browser is running but shows no window, restarting");
            self.restart(url).await;
        }
    }
}

fn apply_x_env(cmd: &mut Command, cfg: &Config) {
    // Inherit DISPLAY/XAUTHORITY when the environment has them; fall back
    // to the configured defaults otherwise.
    if std::env::var_os("DISPLAY").is_none() {
        cmd.env("DISPLAY", &cfg.display);
    }
    if std::env::var_os("XAUTHORITY").is_none() {
        cmd.env("XAUTHORITY", &cfg.xauthority);
    }
}

pub async fn has_browser_window(cfg: &Config) -> bool {
    find_browser_window(cfg).await.is_some()
}

async fn find_browser_window(cfg: &Config) -> Option<String> {
    // wmctrl lists windows with their class; any firefox window counts.
    if let Some(listing) = run_x_tool(cfg, "wmctrl", &["-lx"]).await {
        for line in listing.lines() {
            if line.to_lowercase().contains("firefox") {
                if let Some(id) = line.split_whitespace().next() {
                    return Some(id.to_string());
                }
            }
        }
    }

    // Fallback: xdotool search across the classes firefox actually uses.
    for class in ["firefox", "firefox-esr", "Navigator"] {
        if let Some(out) = run_x_tool(
            cfg,
            "xdotool",
            &["search", "--onlyvisible", "--class", class],
        )
        .await
        {
            if let Some(id) = out.split_whitespace().next() {
                return Some(id.to_string());
            }
        }
    }

    None
}

async fn run_x_tool(cfg: &Config, program: &str, args: &[&str]) -> Option<String> {
    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null());
    apply_x_env(&mut cmd, cfg);

    let out = tokio::time::timeout(X_TOOL_TIMEOUT, cmd.output())
        .await
        .ok()?
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&out.stdout).into_owned();
    if text.trim().is_empty() {
        return None;
    }
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watchdog(grace_sec: u64, missing_sec: u64) -> WindowWatchdog {
        let cfg = Config {
            firefox_startup_grace_sec: grace_sec as f64,
            window_missing_to_restart_sec: missing_sec as f64,
            ..Config::default()
        };
        WindowWatchdog::new(&cfg)
    }

    fn at(t0: Instant, secs: u64) -> Instant {
        t0 + Duration::from_secs(secs)
    }

    #[test]
    fn window_missing_past_threshold_triggers_restart() {
        let mut wd = watchdog(10, 20);
        let t0 = Instant::now();
        wd.note_start(t0);

        // inside the startup grace: never armed
        assert!(!wd.assess(false, at(t0, 5)));
        assert!(wd.missing_since.is_none());

        // past grace: armed at t=11, restart only once missing > 20 s
        assert!(!wd.assess(false, at(t0, 11)));
        assert_eq!(wd.missing_since, Some(at(t0, 11)));
        assert!(!wd.assess(false, at(t0, 30)));
        assert!(wd.assess(false, at(t0, 32)));
    }

    #[test]
    fn window_reappearing_disarms_the_watchdog() {
        let mut wd = watchdog(10, 20);
        let t0 = Instant::now();
        wd.note_start(t0);

        assert!(!wd.assess(false, at(t0, 12)));
        assert!(wd.missing_since.is_some());
        assert!(!wd.assess(true, at(t0, 14)));
        assert!(wd.missing_since.is_none());

        // a fresh disappearance starts a fresh countdown
        assert!(!wd.assess(false, at(t0, 16)));
        assert!(!wd.assess(false, at(t0, 35)));
        assert!(wd.assess(false, at(t0, 37)));
    }

    #[test]
    fn preexisting_browser_counts_as_past_grace() {
        let mut wd = watchdog(10, 20);
        let t0 = Instant::now();
        // no note_start: adopted a browser from a previous run
        assert!(!wd.assess(false, t0));
        assert!(wd.missing_since.is_some());
        assert!(wd.assess(false, at(t0, 21)));
    }

    #[test]
    fn restart_note_clears_the_missing_anchor() {
        let mut wd = watchdog(10, 20);
        let t0 = Instant::now();
        assert!(!wd.assess(false, t0));
        assert!(wd.missing_since.is_some());
        wd.note_start(at(t0, 1));
        assert!(wd.missing_since.is_none());
    }
}
