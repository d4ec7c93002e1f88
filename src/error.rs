//! Error type shared by the tunnel, the upstream proxy and startup code.

use std::io;

use thiserror::Error;

/// Everything that can go wrong while running the connector.
///
/// Most variants are channel-fatal: the task that hits them returns and the
/// surrounding cycle is torn down. [`Error::InvalidRequest`] and
/// [`Error::MissingSessionId`] only cost the one request that produced them.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("dial {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("handshake failed <{written}>: {reason}")]
    Handshake { written: usize, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("malformed tunnelled request: {0}")]
    InvalidRequest(String),

    #[error("request carries no usable X-Tunnel-Session-ID header")]
    MissingSessionId,

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("connection is being cut")]
    ConnectionCut,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection closed by peer")]
    Closed,

    #[error("task failed: {0}")]
    Task(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// True for errors confined to a single tunnelled request. The channel
    /// that produced them keeps reading.
    pub fn is_request_local(&self) -> bool {
        matches!(self, Error::InvalidRequest(_) | Error::MissingSessionId)
    }
}

impl From<hyper::Error> for Error {
    fn from(e: hyper::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<hyper::http::Error> for Error {
    fn from(e: hyper::http::Error) -> Self {
        Error::InvalidRequest(e.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout("operation")
    }
}
