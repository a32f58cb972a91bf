//! Gateway main structure
//!
//! The HTTP server that upgrades `/ws` requests into chat sessions and
//! answers `/health` checks.

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use parlor_config::{Config, HubConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::hub::Hub;
use crate::session::{serve_connection, AdmissionError, SessionSettings};

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bind address (e.g., "0.0.0.0:8080")
    pub bind: String,
    /// Hub limits and per-connection timing
    pub hub: HubConfig,
    /// How long open sessions get to flush and close after shutdown
    pub shutdown_grace: Duration,
}

/// Default wait for sessions to close once the server stops accepting
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            hub: HubConfig::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl From<&Config> for GatewayConfig {
    fn from(config: &Config) -> Self {
        Self {
            bind: format!("{}:{}", config.server.host, config.server.port),
            hub: config.hub.clone(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

#[derive(Debug, Clone)]
struct GatewayState {
    hub: Arc<Hub>,
    settings: SessionSettings,
    sessions: TaskTracker,
}

/// The chat server
#[derive(Debug, Clone)]
pub struct Gateway {
    config: GatewayConfig,
    hub: Arc<Hub>,
    settings: SessionSettings,
    sessions: TaskTracker,
}

impl Gateway {
    /// Create a new Gateway instance
    pub fn new(config: GatewayConfig) -> Self {
        let hub = Arc::new(Hub::new(config.hub.max_connections));
        let settings = SessionSettings::from(&config.hub);
        Self {
            config,
            hub,
            settings,
            sessions: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Get the hub
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// `GET /ws` and `GET /health`
    pub fn router(&self) -> Router {
        let state = GatewayState {
            hub: Arc::clone(&self.hub),
            settings: self.settings.clone(),
            sessions: self.sessions.clone(),
        };
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind the configured address and serve until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), GatewayError> {
        let addr: SocketAddr = self.config.bind.parse()?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    ///
    /// Cancelling `shutdown` stops accepting connections and closes every
    /// session. Upgraded sockets outlive `axum::serve`, so this returns only
    /// once every session task has finished or `shutdown_grace` ran out.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), GatewayError> {
        let addr = listener.local_addr()?;
        info!("Chat server listening on ws://{}/ws", addr);

        let hub = Arc::clone(&self.hub);
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Shutting down chat server");
            hub.shutdown();
        })
        .await?;

        self.sessions.close();
        let open = self.sessions.len();
        if open > 0 {
            debug!("Waiting for {} sessions to close", open);
        }
        if tokio::time::timeout(self.config.shutdown_grace, self.sessions.wait())
            .await
            .is_err()
        {
            warn!(
                "{} sessions still open after {:?}",
                self.sessions.len(),
                self.config.shutdown_grace
            );
        }

        info!("Chat server stopped");
        Ok(())
    }
}

impl std::fmt::Display for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Gateway({})", self.config.bind)
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<GatewayState>,
) -> Response {
    let sessions = state.sessions.clone();
    ws.on_upgrade(move |socket| sessions.track_future(handle_socket(socket, addr, state)))
}

async fn handle_socket(socket: WebSocket, addr: SocketAddr, state: GatewayState) {
    debug!("New connection from {}", addr);
    let (sink, stream) = socket.split();

    match serve_connection(state.hub, state.settings, sink, stream).await {
        Ok(exit) => debug!(%addr, ?exit, "Connection finished"),
        Err(AdmissionError::Connection(e)) => debug!(%addr, "Handshake failed: {}", e),
        Err(e) => debug!(%addr, "Connection not admitted: {}", e),
    }
}

async fn health_handler() -> &'static str {
    "OK"
}

/// Gateway errors
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid bind address: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
}
