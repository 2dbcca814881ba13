/// Loopback indirection router.
///
/// The browser is locked to `http://127.0.0.1:<router_port>/` for its whole
/// life. The page served there polls `/state.json` once a second and swaps
/// an embedded frame between `/splash` and the live panel URL, so target
/// changes never require driving the browser itself.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::availability::Mode;

/// Latest published state; no history is kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSnapshot {
    pub mode: Mode,
    pub target_ip: Option<Ipv4Addr>,
    pub url: String,
    /// Wall-clock seconds of the last update.
    pub ts: f64,
}

impl Default for RouterSnapshot {
    fn default() -> Self {
        Self {
            mode: Mode::Down,
            target_ip: None,
            url: String::new(),
            ts: 0.0,
        }
    }
}

/// Shared between the control loop (writer) and request handlers (readers).
pub struct Router {
    snapshot: Mutex<RouterSnapshot>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            snapshot: Mutex::new(RouterSnapshot::default()),
        }
    }

    pub fn publish(&self, mode: Mode, target_ip: Option<Ipv4Addr>, url: String) {
        let ts = wall_seconds();
        // A poisoned lock still holds a consistent snapshot.
        let mut guard = self
            .snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = RouterSnapshot {
            mode,
            target_ip,
            url,
            ts,
        };
    }

    pub fn snapshot(&self) -> RouterSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn wall_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

// ── HTTP surface ────────────────────────────────────────────────────────

#[derive(Clone)]
struct RouterApp {
    router: Arc<Router>,
    splash: Arc<String>,
}

/// Bind the loopback listener. Kept separate from [`serve`] so a taken
/// port fails startup instead of surfacing later inside a task.
pub async fn bind(port: u16) -> anyhow::Result<TcpListener> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind indirection router on {addr}"))
}

/// Serve until the process exits. Should be spawned as a tokio task.
pub async fn serve(listener: TcpListener, router: Arc<Router>, splash: String) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Indirection router listening on localhost");
    }

    let app = axum::Router::new()
        .route("/", get(index_handler))
        .route("/state.json", get(state_handler))
        .route("/splash", get(splash_handler))
        .fallback(|| async { (StatusCode::NOT_FOUND, "not found") })
        .with_state(RouterApp {
            router,
            splash: Arc::new(splash),
        });

    if let Err(e) = axum::serve(listener, app).await {
        error!("Indirection router server error: {}", e);
    }
}

async fn index_handler() -> Response {
    no_store(Html(INDEX_HTML))
}

async fn state_handler(State(app): State<RouterApp>) -> Response {
    no_store(Json(app.router.snapshot()))
}

async fn splash_handler(State(app): State<RouterApp>) -> Response {
    no_store(Html(app.splash.as_ref().clone()))
}

fn no_store(resp: impl IntoResponse) -> Response {
    let mut resp = resp.into_response();
    resp.headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    resp
}

// ── Splash handling ─────────────────────────────────────────────────────

/// Write the built-in splash page to `splash_file` if none exists yet,
/// creating parent directories as needed.
pub fn ensure_splash_file(splash_file: &Path) -> anyhow::Result<()> {
    if splash_file.exists() {
        return Ok(());
    }
    if let Some(parent) = splash_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(splash_file, DEFAULT_SPLASH_HTML)
        .with_context(|| format!("failed to write splash file {}", splash_file.display()))
}

/// Splash HTML is loaded once at startup; a missing or unreadable file
/// falls back to the built-in page.
pub fn load_splash(splash_file: &Path) -> String {
    std::fs::read_to_string(splash_file).unwrap_or_else(|_| DEFAULT_SPLASH_HTML.to_string())
}

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width,initial-scale=1">
  <title>Kiosk Router</title>
  <style>
    html,body { height:100%; margin:0; background:#000; color:#fff; font-family:sans-serif; }
    #bar { position:fixed; top:0; left:0; right:0; padding:6px 10px; font-size:14px; background:rgba(0,0,0,0.6); z-index:2; }
    #frame { position:absolute; top:0; left:0; width:100%; height:100%; border:0; }
  </style>
</head>
<body>
  <div id="bar">Status: <span id="st">?</span> <span id="ip"></span></div>
  <iframe id="frame" src="/splash"></iframe>

  <script>
    const st = document.getElementById('st');
    const ip = document.getElementById('ip');
    const frame = document.getElementById('frame');
    let lastSrc = "";

    async function poll() {
      try {
        const r = await fetch('/state.json', {cache:'no-store'});
        const s = await r.json();

        st.textContent = s.mode || '?';
        ip.textContent = s.target_ip ? ('(' + s.target_ip + ')') : '';

        let desired = '/splash';
        if (s.mode === 'UP' && s.url) desired = s.url;

        // Only touch the frame when the desired source actually changed.
        if (desired !== lastSrc) {
          lastSrc = desired;
          frame.src = desired;
        }
      } catch (e) {
        st.textContent = 'ERR';
        ip.textContent = '';
      }
    }

    poll();
    setInterval(poll, 1000);
  </script>
</body>
</html>
"#;

const DEFAULT_SPLASH_HTML: &str = r#"<!doctype html>
<html>
<head>
  <meta charset="utf-8">
  <meta http-equiv="refresh" content="30">
  <title>Connecting</title>
  <style>
    html,body { height:100%; margin:0; background:#000; color:#fff; font-family:sans-serif; }
    .wrap { height:100%; display:flex; align-items:center; justify-content:center; flex-direction:column; gap:14px; }
    .spinner {
      width: 48px; height: 48px; border: 4px solid rgba(255,255,255,0.25);
      border-top-color: rgba(255,255,255,0.9); border-radius: 50%;
      animation: spin 1s linear infinite;
    }
    @keyframes spin { to { transform: rotate(360deg); } }
    .small { opacity: 0.8; font-size: 14px; }
  </style>
</head>
<body>
  <div class="wrap">
    <div class="spinner"></div>
    <div>Connecting to panel&hellip;</div>
    <div class="small">Please wait</div>
  </div>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serializes_like_the_wire_format() {
        let router = Router::new();
        router.publish(
            Mode::Up,
            Some(Ipv4Addr::new(10, 0, 0, 5)),
            "http://10.0.0.5:1111/".to_string(),
        );

        let json = serde_json::to_value(router.snapshot()).unwrap();
        assert_eq!(json["mode"], "UP");
        assert_eq!(json["target_ip"], "10.0.0.5");
        assert_eq!(json["url"], "http://10.0.0.5:1111/");
        assert!(json["ts"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn down_snapshot_has_null_target() {
        let router = Router::new();
        router.publish(Mode::Down, None, String::new());
        let json = serde_json::to_value(router.snapshot()).unwrap();
        assert_eq!(json["mode"], "DOWN");
        assert!(json["target_ip"].is_null());
    }

    #[test]
    fn missing_splash_file_falls_back_to_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let splash = load_splash(&dir.path().join("nope.html"));
        assert!(splash.contains("spinner"));
    }

    #[test]
    fn ensure_splash_writes_once_and_keeps_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("loading.html");

        ensure_splash_file(&path).unwrap();
        assert!(load_splash(&path).contains("Connecting"));

        std::fs::write(&path, "<html>custom</html>").unwrap();
        ensure_splash_file(&path).unwrap();
        assert_eq!(load_splash(&path), "<html>custom</html>");
    }
}
