mod api;
mod config;
mod error;
mod peer;
mod protocol;
mod registry;
mod room;
mod router;
mod sfu;
mod ws;
mod wrtc;

use anyhow::Context;
use axum::{
    extract::{Request, State},
    http::{HeaderName, HeaderValue, Method},
    middleware::{self, Next},
    response::{IntoResponse, Json},
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogFormat};
use crate::peer::PeerConnector;
use crate::registry::SocketRegistry;
use crate::router::{HandlerTable, RoomRouter};
use crate::sfu::SfuManager;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ─── Signaling core ─────────────────────────────────────────────────────────

/// The registry, SFU manager and router, wired together once at startup.
pub struct Signaling {
    pub registry: Arc<SocketRegistry>,
    pub sfu: Arc<SfuManager>,
    pub router: Arc<RoomRouter>,
}

impl Signaling {
    pub fn init(config: &Config, connector: Arc<dyn PeerConnector>) -> Self {
        let registry = Arc::new(SocketRegistry::new());
        let sfu = Arc::new(SfuManager::new(
            registry.clone(),
            connector,
            config.negotiation_timeout,
        ));

        let mut handlers = HandlerTable::new();
        sfu::register_handlers(&sfu, &mut handlers);
        let router = Arc::new(RoomRouter::new(registry.clone(), handlers));

        Self {
            registry,
            sfu,
            router,
        }
    }

    /// Close every peer connection. Sockets are left to the HTTP server.
    pub async fn shutdown(&self) {
        self.sfu.shutdown().await;
    }
}

// ─── AppState ───────────────────────────────────────────────────────────────

pub struct AppState {
    pub config: Config,
    pub signaling: Signaling,
}

// ─── Health endpoint ────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": VERSION,
        "rooms": state.signaling.registry.room_count(),
        "sfu_rooms": state.signaling.sfu.room_count(),
    }))
}

// ─── Version header middleware ──────────────────────────────────────────────

async fn version_header_middleware(request: Request, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        HeaderName::from_static("x-relay-version"),
        HeaderValue::from_static(VERSION),
    );
    response
}

// ─── CORS configuration ────────────────────────────────────────────────────

fn build_cors_layer(allowed_origins: &str) -> CorsLayer {
    if allowed_origins == "*" {
        warn!("CORS: permissive mode (allow all origins), not suitable for production");
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<HeaderValue>() {
            Ok(origin) => Some(origin),
            Err(_) => {
                warn!("CORS: ignoring invalid origin '{s}'");
                None
            }
        })
        .collect();

    info!("CORS: restricted to {} origin(s)", origins.len());

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers([HeaderName::from_static("content-type")])
}

// ─── Router ─────────────────────────────────────────────────────────────────

pub fn app(state: Arc<AppState>) -> Router {
    let cors = build_cors_layer(&state.config.allowed_origins);

    Router::new()
        .route("/health", get(health_handler))
        // WebSocket signaling
        .route("/ws", get(ws::ws_handler))
        // SDP negotiation
        .route("/broadcast", post(api::broadcast))
        .route("/subscribe", post(api::subscribe))
        // Room queries
        .route("/poll", put(api::poll))
        .route("/room", put(api::room_tenancy))
        // Middleware
        .layer(middleware::from_fn(version_header_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ─── Logging ────────────────────────────────────────────────────────────────

fn init_tracing(config: &Config) {
    // RUST_LOG wins over RELAY_LOG_LEVEL.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

// ─── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // rustls 0.23 needs a process-wide provider before any TLS/DTLS work,
    // including WebRTC.
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let cfg = Config::from_env();
    init_tracing(&cfg);
    cfg.log_summary();

    if cfg.turn_urls.is_empty() {
        warn!("No TURN server configured, clients behind symmetric NAT will fail to connect");
    }

    let connector = Arc::new(wrtc::WebRtcConnector::new(&cfg));
    let signaling = Signaling::init(&cfg, connector);
    let bind_addr = cfg.bind_addr.clone();
    let tls_paths = cfg
        .tls_paths()
        .map(|(cert, key)| (cert.to_string(), key.to_string()));
    if cfg.tls_enabled && tls_paths.is_none() {
        anyhow::bail!("RELAY_TLS_ENABLED is set but the certificate or key path is missing");
    }

    let state = Arc::new(AppState {
        config: cfg,
        signaling,
    });
    let app = app(state.clone());

    // ── Shutdown: close every peer, then stop serving ───────────────────
    let stop = CancellationToken::new();
    {
        let state = state.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for Ctrl-C: {e}");
                return;
            }
            info!("shutdown requested");
            state.signaling.shutdown().await;
            stop.cancel();
        });
    }

    // ── Start server (plain HTTP or HTTPS) ──────────────────────────────
    match tls_paths {
        Some((cert_path, key_path)) => {
            info!("Loading TLS certificate from: {cert_path}");
            info!("Loading TLS private key from:  {key_path}");
            let tls_config =
                axum_server::tls_rustls::RustlsConfig::from_pem_file(&cert_path, &key_path)
                    .await
                    .context("failed to load TLS configuration")?;

            let addr: std::net::SocketAddr = bind_addr
                .parse()
                .with_context(|| format!("invalid bind address '{bind_addr}'"))?;

            let handle = axum_server::Handle::new();
            {
                let handle = handle.clone();
                tokio::spawn(async move {
                    stop.cancelled().await;
                    handle.graceful_shutdown(Some(Duration::from_secs(5)));
                });
            }

            info!("Relay listening on https://{bind_addr}");
            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            let listener = tokio::net::TcpListener::bind(&bind_addr)
                .await
                .with_context(|| format!("failed to bind {bind_addr}"))?;
            info!("Relay listening on http://{bind_addr}");
            axum::serve(listener, app)
                .with_graceful_shutdown(stop.cancelled_owned())
                .await?;
        }
    }

    info!("server stopped");
    Ok(())
}
