//! Address and path descriptors for the proxy's listen side and backend side
//!
//! Both sides are described by a [`ServerConfig`]. The backend side adds an
//! `insecure` flag in [`DstConfig`] that selects `ws://` instead of `wss://`.
//! Paths are normalized on construction so they always start with exactly one `/`.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("You have to specify port")]
    MissingPort,
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Normalize a URI path to a single leading separator.
///
/// `""`, `"/"` and `"///"` all become `"/"`; `"ws-proxy"` and `"//ws-proxy"`
/// become `"/ws-proxy"`. Applying it twice yields the same value.
pub fn normalize_path(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

/// Listen address of the proxy, or the address part of a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: String,
    path: String,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: impl Into<String>, path: &str) -> Self {
        Self {
            host: host.into(),
            port: port.into(),
            path: normalize_path(path),
        }
    }

    /// URI path, always starting with one `/`
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Replace the path, normalizing it
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = normalize_path(path);
        self
    }

    /// `host:port` as accepted by `TcpListener::bind`; an empty host binds all interfaces
    pub fn bind_address(&self) -> String {
        let host = if self.host.is_empty() {
            "0.0.0.0"
        } else {
            &self.host
        };
        format!("{}:{}", host, self.port)
    }

    /// The listen side needs an explicit port
    pub fn validate(&self) -> ConfigResult<()> {
        if self.port.is_empty() {
            return Err(ConfigError::MissingPort);
        }
        Ok(())
    }
}

impl fmt::Display for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{}", self.host, self.port, self.path)
    }
}

/// Backend the proxy dials for every inbound session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DstConfig {
    pub server: ServerConfig,
    /// Use `ws` instead of `wss`
    pub insecure: bool,
}

impl DstConfig {
    pub fn new(server: ServerConfig, insecure: bool) -> Self {
        Self { server, insecure }
    }

    pub fn scheme(&self) -> &'static str {
        if self.insecure {
            "ws"
        } else {
            "wss"
        }
    }

    /// Backend URL: `scheme://host[:port]path`, the port segment only when set
    pub fn url(&self) -> String {
        if self.server.port.is_empty() {
            format!(
                "{}://{}{}",
                self.scheme(),
                self.server.host,
                self.server.path()
            )
        } else {
            format!(
                "{}://{}:{}{}",
                self.scheme(),
                self.server.host,
                self.server.port,
                self.server.path()
            )
        }
    }
}

impl fmt::Display for DstConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}
