//! HTTP scrape endpoint: `/`, `/health`, `/metrics`.
//!
//! A scrape runs gather → transform → render and writes the exposition.
//! Render or gather failures answer 500 with a fixed body; `/health` is a
//! liveness probe and never reflects scrape failures.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::sync::{mpsc, watch, RwLock};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::collectors::Registry;
use crate::render::{render, RenderOpts};
use crate::transform::{apply_all, Transform};

const CONTENT_TYPE_EXPOSITION: &str = "text/plain; version=0.0.4";
const HANDLER_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(3);

/// Bound on the push-mode channel: a couple of renders, never unbounded.
const TICKER_CHANNEL_CAPACITY: usize = 4;

const LANDING_PAGE: &str = "<html>\n\
<head><title>GPU Exporter</title></head>\n\
<body>\n\
<h1>GPU Exporter</h1>\n\
<p><a href=\"./metrics\">Metrics</a></p>\n\
</body>\n\
</html>\n";

/// One end-to-end scrape: gather → transform → render.
pub struct MetricsPipeline {
    pub registry: Arc<Registry>,
    pub transforms: Vec<Box<dyn Transform>>,
    pub render_opts: RenderOpts,
}

impl MetricsPipeline {
    pub async fn scrape(&self) -> Result<String> {
        let mut metrics = self.registry.gather().await?;
        apply_all(&self.transforms, &mut metrics).await?;
        render(&metrics, &self.render_opts)
    }
}

#[derive(Clone)]
struct AppState {
    pipeline: Arc<MetricsPipeline>,
    /// Latest push-mode render; `None` in pull mode.
    cached: Option<Arc<RwLock<String>>>,
}

pub fn router(pipeline: Arc<MetricsPipeline>, cached: Option<Arc<RwLock<String>>>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TimeoutLayer::new(HANDLER_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { pipeline, cached })
}

async fn index_handler() -> Html<&'static str> {
    Html(LANDING_PAGE)
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    let body = match &state.cached {
        Some(cached) => Ok(cached.read().await.clone()),
        None => state.pipeline.scrape().await,
    };
    match body {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, CONTENT_TYPE_EXPOSITION)],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Scrape failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
        }
    }
}

/// Background render loop for push mode: renders at the collect interval
/// and sends into a bounded channel. On a full channel the new value is
/// dropped and logged; on a render error an empty string is pushed so the
/// reader flushes stale data. Exits when the shutdown signal flips.
pub fn spawn_ticker(
    pipeline: Arc<MetricsPipeline>,
    interval_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(TICKER_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        interval.tick().await; // first tick is immediate — skip it
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }
            let body = match pipeline.scrape().await {
                Ok(body) => body,
                Err(e) => {
                    warn!(error = %e, "Ticker render failed");
                    String::new()
                }
            };
            match tx.try_send(body) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Ticker channel full; dropping rendered metrics");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
        info!("Ticker loop stopped");
    });
    rx
}

/// Drain the ticker channel into the cache the `/metrics` handler serves.
pub fn spawn_cache_writer(
    mut rx: mpsc::Receiver<String>,
    cached: Arc<RwLock<String>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(body) = rx.recv().await {
            *cached.write().await = body;
        }
    })
}

#[derive(Debug, Deserialize, Default)]
struct WebConfig {
    tls_server_config: Option<TlsServerConfig>,
}

#[derive(Debug, Deserialize)]
struct TlsServerConfig {
    cert_file: String,
    key_file: String,
}

/// Serve the router until `shutdown` flips, then drain connections for a
/// bounded interval. TLS is enabled when the web config file carries a
/// certificate pair.
pub async fn serve(
    app: Router,
    address: &str,
    web_config_file: Option<&Path>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr: SocketAddr = address
        .parse()
        .with_context(|| format!("invalid listen address {address}"))?;

    let handle = axum_server::Handle::new();
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            let _ = shutdown.changed().await;
            info!("Shutting down HTTP server");
            handle.graceful_shutdown(Some(SHUTDOWN_DRAIN));
        });
    }

    let tls = match web_config_file {
        Some(path) => load_web_config(path)?.tls_server_config,
        None => None,
    };

    match tls {
        Some(tls) => {
            info!(%addr, "Listening with TLS");
            let config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                &tls.cert_file,
                &tls.key_file,
            )
            .await
            .context("could not load TLS certificate pair")?;
            axum_server::bind_rustls(addr, config)
                .handle(handle)
                .serve(app.into_make_service())
                .await
                .context("HTTPS server failed")
        }
        None => {
            info!(%addr, "Listening");
            axum_server::bind(addr)
                .handle(handle)
                .serve(app.into_make_service())
                .await
                .context("HTTP server failed")
        }
    }
}

fn load_web_config(path: &Path) -> Result<WebConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("could not read web config file {}", path.display()))?;
    serde_yaml::from_str(&contents)
        .with_context(|| format!("could not parse web config file {}", path.display()))
}
