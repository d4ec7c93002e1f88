//! Raw connection establishment: plain TCP, or TCP + TLS.
//!
//! Both the relay and the API server are reached through a [`Dialer`], so
//! tests can swap in loopback TCP or in-memory pipes.

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};

/// Overall budget for TCP connect plus TLS handshake.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// A byte stream usable as a tunnel channel.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Io for T {}

pub type BoxedIo = Box<dyn Io>;

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> io::Result<BoxedIo>;

    /// Address being dialled, for logs and errors.
    fn address(&self) -> &str;
}

/// Plain TCP.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: String,
}

impl TcpDialer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

async fn connect_tcp(addr: &str) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> io::Result<BoxedIo> {
        let stream = tokio::time::timeout(DIAL_TIMEOUT, connect_tcp(&self.addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))??;
        Ok(Box::new(stream))
    }

    fn address(&self) -> &str {
        &self.addr
    }
}

/// TCP followed by a TLS client handshake.
pub struct TlsDialer {
    addr: String,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    timeout: Duration,
}

impl fmt::Debug for TlsDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsDialer")
            .field("addr", &self.addr)
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl TlsDialer {
    /// `addr` is `host:port`; the host part doubles as the TLS server name
    /// unless [`with_server_name`](Self::with_server_name) overrides it.
    pub fn new(addr: impl Into<String>, config: Arc<rustls::ClientConfig>) -> Result<Self> {
        let addr = addr.into();
        let server_name = server_name_for(host_of(&addr))?;
        Ok(Self {
            addr,
            server_name,
            connector: TlsConnector::from(config),
            timeout: DIAL_TIMEOUT,
        })
    }

    pub fn with_server_name(mut self, name: &str) -> Result<Self> {
        self.server_name = server_name_for(name)?;
        Ok(self)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn connect(&self) -> io::Result<BoxedIo> {
        let tcp = connect_tcp(&self.addr).await?;
        let tls = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await?;
        Ok(Box::new(tls))
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self) -> io::Result<BoxedIo> {
        tokio::time::timeout(self.timeout, self.connect())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))?
    }

    fn address(&self) -> &str {
        &self.addr
    }
}

/// Host part of `host:port`, with IPv6 brackets removed.
pub fn host_of(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match addr.rsplit_once(':') {
        Some((host, _)) => host,
        None => addr,
    }
}

fn server_name_for(host: &str) -> Result<ServerName<'static>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string())
        .map_err(|e| Error::Tls(format!("invalid server name {host:?}: {e}")))
}
