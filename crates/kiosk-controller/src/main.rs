mod browser;
mod controller;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use kiosk_core::config::Config;
use kiosk_core::router::{self, Router};

use crate::controller::KioskController;

#[derive(Parser, Debug)]
#[command(name = "kiosk-controller", about = "Resilient kiosk display controller")]
struct Args {
    /// Path to the JSON configuration file
    /// (default: $KIOSK_CONFIG, then /etc/kiosk-controller.json if present)
    #[arg(long, env = "KIOSK_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let (cfg, report) = Config::resolve(args.config.as_deref());
    let cfg = Arc::new(cfg);

    let _log_guard = init_logging(&cfg);

    match &report.used_path {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => info!("No config file used (defaults and environment)"),
    }
    if let Some(err) = &report.file_error {
        warn!("Config file ignored: {}", err);
    }

    // `ip` (iproute2) carries both network detection and neighbor lookup;
    // without it the controller can never find a panel.
    if browser::which("ip").is_none() {
        error!("Required tool `ip` (iproute2) not found");
        return ExitCode::from(2);
    }
    if browser::which("wmctrl").is_none() {
        warn!("wmctrl not found, window checks degraded (apt install wmctrl)");
    }
    if browser::which("xdotool").is_none() {
        warn!("xdotool not found, window checks degraded (apt install xdotool)");
    }
    if std::env::var_os("DISPLAY").is_none() {
        warn!(expected = %cfg.display, "DISPLAY not set");
    }
    if std::env::var_os("XAUTHORITY").is_none() {
        warn!(expected = %cfg.xauthority.display(), "XAUTHORITY not set");
    }

    match run(cfg).await {
        Ok(()) => {
            info!("Exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Fatal: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: Arc<Config>) -> anyhow::Result<()> {
    if let Err(e) = router::ensure_splash_file(&cfg.splash_file) {
        warn!(error = %e, "Could not write the splash file, using the built-in page");
    }
    let splash = router::load_splash(&cfg.splash_file);

    // A taken router port is fatal: the browser would have nothing to show.
    let listener = router::bind(cfg.router_port).await?;
    let router = Arc::new(Router::new());
    tokio::spawn(router::serve(listener, Arc::clone(&router), splash));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let signal = wait_for_termination().await;
            info!(signal, "Termination signal received, shutting down");
            shutdown.cancel();
        });
    }

    let mut controller = KioskController::new(Arc::clone(&cfg), router).await?;
    controller.run(shutdown).await;
    Ok(())
}

async fn wait_for_termination() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => "SIGINT",
                _ = term.recv() => "SIGTERM",
            }
        }
        Err(_) => {
            let _ = ctrl_c.await;
            "SIGINT"
        }
    }
}

/// Stdout always; the log file under the cache directory when writable.
/// Logging problems never prevent startup.
fn init_logging(cfg: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(parent) = cfg.log_file.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&cfg.log_file);

    match file {
        Ok(file) => {
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                )
                .init();
            Some(guard)
        }
        Err(e) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            warn!(
                path = %cfg.log_file.display(),
                error = %e,
                "Log file unavailable, logging to stdout only"
            );
            None
        }
    }
}
