//! HTTP entry point of the proxy
//!
//! [`ProxyServer`] owns its own axum [`Router`], built once at startup. Every
//! request on the configured path becomes a [`Session`] registered in the
//! shared [`Hub`]; the session is dropped from the hub again when it stops.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, Method},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};
use wsproxy_config::{ConfigError, DstConfig, ServerConfig};
use wsproxy_control::{Hub, Session, SessionError};
use wsproxy_relay::Handshake;

pub const BLANK_PAGE: &str =
    "Hello! This is blank page, well, you can set your cookies, for example.";
pub const GET_ONLY: &str = "GET method only acceptable";
pub const REGISTER_FAILED: &str = "System error, try later (1)";
pub const INIT_FAILED: &str = "System error, try later (2)";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to bind to {address}: {reason}")]
    Bind { address: String, reason: String },

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

struct ProxyState {
    hub: Arc<Hub>,
    dst: DstConfig,
}

pub struct ProxyServer {
    config: ServerConfig,
    state: Arc<ProxyState>,
}

impl ProxyServer {
    pub fn new(config: ServerConfig, dst: DstConfig, hub: Arc<Hub>) -> Self {
        Self {
            config,
            state: Arc::new(ProxyState { hub, dst }),
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.state.hub
    }

    /// Build the router: the proxy handler on the configured path, the
    /// placeholder page everywhere else. A `/` path proxies every path.
    pub fn build_router(&self) -> Router {
        let path = self.config.path();

        let router = if path == "/" {
            Router::new()
                .route("/", any(handle_proxy))
                .fallback(handle_proxy)
        } else {
            Router::new()
                .route(path, any(handle_proxy))
                .fallback(blank_page)
        };

        router
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Validate the listen config, bind `host:port` and serve until the
    /// listener fails
    pub async fn start(self) -> Result<(), ServerError> {
        self.config.validate()?;

        let address = self.config.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| ServerError::Bind {
                address: address.clone(),
                reason: e.to_string(),
            })?;

        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        let router = self.build_router();

        match listener.local_addr() {
            Ok(addr) => info!(
                "Starting proxy server on {}{} to {}",
                addr,
                self.config.path(),
                self.state.dst
            ),
            Err(_) => info!(
                "Starting proxy server on {} to {}",
                self.config, self.state.dst
            ),
        }

        axum::serve(listener, router).await?;

        Ok(())
    }
}

async fn blank_page() -> &'static str {
    BLANK_PAGE
}

async fn handle_proxy(
    State(state): State<Arc<ProxyState>>,
    method: Method,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if method != Method::GET {
        info!("server handler: got bad method: {}", method);
        return GET_ONLY.into_response();
    }

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            info!("server handler: not a websocket handshake: {}", rejection);
            return rejection.into_response();
        }
    };

    // Runs detached from the request so the hub is cleaned up even when the
    // client goes away mid-dial and the request future is dropped
    let opening = tokio::spawn(open_session(state, Handshake::new(upgrade, headers)));
    match opening.await {
        Ok(response) => response,
        Err(e) => {
            error!("server handler: session task failed: {}", e);
            INIT_FAILED.into_response()
        }
    }
}

/// Register a new session, initialize it and answer the handshake.
///
/// Failed sessions are released before returning, running ones once they stop.
async fn open_session(state: Arc<ProxyState>, handshake: Handshake) -> Response {
    let session = Arc::new(Session::new(state.hub.next_correlation_name()));
    if let Err(e) = state.hub.add(session.clone()).await {
        info!(
            "server handler: cannot add connection {}: {}",
            session.name(),
            e
        );
        return REGISTER_FAILED.into_response();
    }

    match session.init(handshake, &state.dst).await {
        Ok(response) => {
            release_when_stopped(state.hub.clone(), session);
            response
        }
        Err(e) => {
            state.hub.release(&session).await;
            info!("server handler: {}", e);

            match e {
                SessionError::Proxy { source, .. } => source.failure_response().into_response(),
                SessionError::BadState { .. } => INIT_FAILED.into_response(),
            }
        }
    }
}

fn release_when_stopped(hub: Arc<Hub>, session: Arc<Session>) {
    tokio::spawn(async move {
        session.stopped().await;
        if hub.release(&session).await {
            debug!("connection {} released from hub", session.name());
        }
    });
}
