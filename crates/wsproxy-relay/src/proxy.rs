//! Relay engine for one proxied session

use axum::extract::ws::WebSocketUpgrade;
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wsproxy_config::DstConfig;

use crate::endpoint::Endpoint;
use crate::replicate::{replicate, RelayError};

/// Inbound side of a session: the validated upgrade and the request headers
pub struct Handshake {
    pub upgrade: WebSocketUpgrade,
    pub headers: HeaderMap,
}

impl Handshake {
    pub fn new(upgrade: WebSocketUpgrade, headers: HeaderMap) -> Self {
        Self { upgrade, headers }
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// HTTP answer sent to the original caller when the backend could not be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl FailureResponse {
    pub fn service_unavailable() -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            headers,
            body: Bytes::from_static(b"Service Unavailable"),
        }
    }

    /// The backend's own HTTP answer when it sent one, otherwise 503
    fn from_dial_error(err: &tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => {
                let mut headers = HeaderMap::new();
                for (name, value) in response.headers() {
                    if !is_framing_header(name) {
                        headers.append(name.clone(), value.clone());
                    }
                }
                let raw = response.body().as_deref().unwrap_or_default();
                let body = if is_chunked(response.headers()) {
                    Bytes::from(decode_chunked(raw))
                } else {
                    Bytes::copy_from_slice(raw)
                };
                Self {
                    status: response.status(),
                    headers,
                    body,
                }
            }
            _ => Self::service_unavailable(),
        }
    }
}

impl IntoResponse for FailureResponse {
    fn into_response(self) -> Response {
        (self.status, self.headers, self.body).into_response()
    }
}

// Body length and connection handling are recomputed for the relayed response
fn is_framing_header(name: &HeaderName) -> bool {
    name == header::CONTENT_LENGTH
        || name == header::TRANSFER_ENCODING
        || name == header::CONNECTION
        || name.as_str() == "keep-alive"
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

/// Strip chunked transfer framing from the bytes read past the response head.
///
/// Decoding stops at the last chunk or where the buffered bytes run out;
/// chunk extensions and trailers are ignored.
fn decode_chunked(mut raw: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();

    loop {
        let Some(line_end) = raw.windows(2).position(|w| w == b"\r\n") else {
            break;
        };
        let size_field = String::from_utf8_lossy(&raw[..line_end]);
        let size_field = size_field.split(';').next().unwrap_or_default().trim();
        let Ok(size) = usize::from_str_radix(size_field, 16) else {
            break;
        };
        if size == 0 {
            break;
        }

        raw = &raw[line_end + 2..];
        let take = size.min(raw.len());
        body.extend_from_slice(&raw[..take]);
        if take < size || raw.len() < size + 2 {
            break;
        }
        raw = &raw[size + 2..];
    }

    body
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid backend url {url}: {source}")]
    InvalidUrl {
        url: String,
        source: Box<tungstenite::Error>,
    },

    #[error("could not connect to {url}: {source}")]
    Dial {
        url: String,
        source: Box<tungstenite::Error>,
        response: FailureResponse,
    },
}

impl ProxyError {
    /// What the original caller should see for this failure
    pub fn failure_response(&self) -> FailureResponse {
        match self {
            ProxyError::Dial { response, .. } => response.clone(),
            ProxyError::InvalidUrl { .. } => FailureResponse::service_unavailable(),
        }
    }
}

/// Relay engine: owns both sides of one session once [`Proxy::run`] succeeds.
///
/// The terminal error signal carries at most one [`RelayError`]; a relay that
/// ends because of [`Proxy::stop`] reports nothing.
pub struct Proxy {
    name: u64,
    stop: CancellationToken,
    errors_tx: mpsc::Sender<RelayError>,
    errors_rx: Option<mpsc::Receiver<RelayError>>,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("name", &self.name)
            .field("stopped", &self.stop.is_cancelled())
            .finish()
    }
}

impl Proxy {
    pub fn new(name: u64) -> Self {
        let (errors_tx, errors_rx) = mpsc::channel(1);
        Self {
            name,
            stop: CancellationToken::new(),
            errors_tx,
            errors_rx: Some(errors_rx),
        }
    }

    pub fn name(&self) -> u64 {
        self.name
    }

    /// Receiver of the terminal error signal. Can be taken once.
    pub fn take_errors(&mut self) -> Option<mpsc::Receiver<RelayError>> {
        self.errors_rx.take()
    }

    /// Ask the coordinator to stop both directions. Safe to call any number of
    /// times, before the relay started or after it finished.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Dial the backend and hand back the response that completes the inbound upgrade.
    ///
    /// The inbound handshake was already validated when `handshake` was
    /// extracted. Only `Cookie` headers are forwarded to the backend. When the
    /// dial fails the returned error carries the answer for the caller and no
    /// relay is started. On success the relay starts once the upgraded client
    /// connection is handed over.
    pub async fn run(&self, handshake: Handshake, dst: &DstConfig) -> Result<Response, ProxyError> {
        let url = dst.url();

        let mut request =
            url.as_str()
                .into_client_request()
                .map_err(|e| ProxyError::InvalidUrl {
                    url: url.clone(),
                    source: Box::new(e),
                })?;

        for cookie in handshake.headers.get_all(header::COOKIE) {
            info!("proxy {}: cookie: {:?}", self.name, cookie);
            request
                .headers_mut()
                .append(header::COOKIE, cookie.clone());
        }

        if !dst.insecure {
            ensure_crypto_provider();
        }

        let backend = match tokio_tungstenite::connect_async(request).await {
            Ok((backend, _response)) => backend,
            Err(e) => {
                warn!("proxy {}: could not connect to {}: {}", self.name, url, e);
                let response = FailureResponse::from_dial_error(&e);
                return Err(ProxyError::Dial {
                    url,
                    source: Box::new(e),
                    response,
                });
            }
        };

        info!("proxy {}: connection opened", self.name);

        let name = self.name;
        let stop = self.stop.clone();
        let errors = self.errors_tx.clone();
        let upgrade_errors = self.errors_tx.clone();

        let response = handshake
            .upgrade
            .on_failed_upgrade(move |e: axum::Error| {
                warn!("proxy {}: upgrade socket error: {}", name, e);
                let _ = upgrade_errors.try_send(RelayError::Upgrade(e.to_string()));
            })
            .on_upgrade(move |socket| async move {
                debug!("proxy {}: client upgraded, starting relay", name);
                let client = Endpoint::from_axum(socket);
                let backend = Endpoint::from_tungstenite(backend);
                if let Some(err) = replicate(name, client, backend, stop).await {
                    let _ = errors.try_send(err);
                }
            });

        Ok(response)
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}
