//! Proxied client session
//!
//! A session wraps one relay engine and moves through `Init -> Running -> Stopped`
//! or `Init -> Stopped`. It closes itself when its relay reports a terminal
//! error, so a failure on either side needs no outside intervention.

use axum::response::Response;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use wsproxy_config::DstConfig;
use wsproxy_relay::{Handshake, Proxy, ProxyError, RelayError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Running,
    Stopped,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection {name} init: bad state ({state:?})")]
    BadState { name: u64, state: SessionState },

    #[error("connection {name} init: proxy error: {source}")]
    Proxy {
        name: u64,
        #[source]
        source: ProxyError,
    },
}

struct SessionInner {
    state: SessionState,
    /// Init runs at most once, even if it failed and the state stayed `Init`
    init_attempted: bool,
    proxy: Option<Proxy>,
    /// Releases the watcher when the session is closed from outside
    watcher_stop: CancellationToken,
}

pub struct Session {
    id: u64,
    name: u64,
    inner: Mutex<SessionInner>,
    stopped: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl Session {
    /// New session in `Init` with a random 63-bit id
    pub fn new(name: u64) -> Self {
        Self::with_id(rand::random::<u64>() >> 1, name)
    }

    pub(crate) fn with_id(id: u64, name: u64) -> Self {
        Self {
            id,
            name,
            inner: Mutex::new(SessionInner {
                state: SessionState::Init,
                init_attempted: false,
                proxy: None,
                watcher_stop: CancellationToken::new(),
            }),
            stopped: CancellationToken::new(),
        }
    }

    /// Registry key
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Correlation name used in logs
    pub fn name(&self) -> u64 {
        self.name
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Resolves once the session reached `Stopped`
    pub async fn stopped(&self) {
        self.stopped.cancelled().await
    }

    /// Connect the inbound handshake to the backend.
    ///
    /// On success the session is `Running` and the returned response completes
    /// the client's upgrade. On failure the session stays in `Init` and the
    /// caller is expected to drop it from the registry. A second call always
    /// fails with [`SessionError::BadState`].
    ///
    /// The backend is dialed without holding the session lock, so `close()`
    /// returns at once even while a dial is pending. A session closed during
    /// its dial stays `Stopped`: the freshly built relay is stopped and
    /// [`SessionError::BadState`] is returned.
    pub async fn init(
        self: &Arc<Self>,
        handshake: Handshake,
        dst: &DstConfig,
    ) -> Result<Response, SessionError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != SessionState::Init || inner.init_attempted {
                return Err(SessionError::BadState {
                    name: self.name,
                    state: inner.state,
                });
            }
            inner.init_attempted = true;
        }

        let mut proxy = Proxy::new(self.name);
        let response = proxy
            .run(handshake, dst)
            .await
            .map_err(|source| SessionError::Proxy {
                name: self.name,
                source,
            })?;

        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Init {
            proxy.stop();
            info!("connection {} closed while dialing", self.name);
            return Err(SessionError::BadState {
                name: self.name,
                state: inner.state,
            });
        }

        if let Some(errors) = proxy.take_errors() {
            self.spawn_watcher(errors, inner.watcher_stop.clone());
        }

        inner.proxy = Some(proxy);
        inner.state = SessionState::Running;
        debug!("connection {} running", self.name);

        Ok(response)
    }

    fn spawn_watcher(self: &Arc<Self>, mut errors: mpsc::Receiver<RelayError>, stop: CancellationToken) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                Some(err) = errors.recv() => {
                    info!("connection {} stop: proxy err: {}", session.name, err);
                    session.close().await;
                }
                _ = stop.cancelled() => {
                    info!("connection {} stop: by stop event", session.name);
                }
            }
        });
    }

    /// Close the session gracefully.
    ///
    /// Returns `true` for the call that moved the session to `Stopped` and
    /// `false` for every call after that.
    pub async fn close(&self) -> bool {
        let mut inner = self.inner.lock().await;

        match inner.state {
            SessionState::Stopped => return false,
            SessionState::Init => {}
            SessionState::Running => {
                if let Some(proxy) = &inner.proxy {
                    proxy.stop();
                }
                inner.watcher_stop.cancel();
            }
        }

        inner.state = SessionState::Stopped;
        self.stopped.cancel();
        debug!("connection {} stopped", self.name);
        true
    }
}
