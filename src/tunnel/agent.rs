//! One connection cycle: the request channels, their heartbeats, the meta
//! channel, and the sessions spawned from inbound requests.
//!
//! Every long-lived task in a cycle is a sibling under one cancellation
//! token. The first sibling to finish ends the cycle and the rest are torn
//! down with it; the reconnect loop in [`super::client`] decides what
//! happens next.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use hyper::header::UPGRADE;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use super::connector::StubConnector;
use super::heartbeat::{self, ClusterProbe, HeartbeatConfig};
use super::kube_proxy::KubernetesClientManager;
use super::meta::{self, MetaSource, MetaSyncConfig};
use super::pipe::{self, UpgradeProtocol};
use super::{wire, ChannelKind};
use crate::error::{Error, Result};

/// Consecutive malformed requests tolerated on one request channel.
pub const MAX_CONSECUTIVE_MALFORMED: usize = 16;

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub tunnels_per_agent: usize,
    pub max_malformed: usize,
    pub heartbeat: HeartbeatConfig,
    pub meta: MetaSyncConfig,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            tunnels_per_agent: 1,
            max_malformed: MAX_CONSECUTIVE_MALFORMED,
            heartbeat: HeartbeatConfig::default(),
            meta: MetaSyncConfig::default(),
        }
    }
}

/// How a cycle ended when it did not fail to start.
#[derive(Debug)]
pub enum CycleEnd {
    /// Process shutdown was requested.
    Shutdown,
    /// A sibling failed; the channel set is gone.
    ChannelLost(Error),
}

#[derive(Debug, Clone, Copy)]
enum Sibling {
    Reader(usize),
    Heartbeat(usize),
    Meta,
}

impl fmt::Display for Sibling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sibling::Reader(i) => write!(f, "request reader #{i}"),
            Sibling::Heartbeat(i) => write!(f, "heartbeat #{i}"),
            Sibling::Meta => f.write_str("meta sync"),
        }
    }
}

/// Read side of a request channel. The lock guarantees that only one
/// request head is being read at a time.
pub struct RequestChannel<R> {
    index: usize,
    reader: Mutex<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> RequestChannel<R> {
    pub fn new(index: usize, reader: R) -> Self {
        Self {
            index,
            reader: Mutex::new(BufReader::new(reader)),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Parse the next request and its session id. The lock is released
    /// before the request is handed off.
    pub async fn next_request(&self) -> Result<(u16, Request<Bytes>)> {
        let request = {
            let mut reader = self.reader.lock().await;
            wire::read_request(&mut *reader).await?
        };
        let session_id = wire::session_id(&request)?;
        Ok((session_id, request))
    }
}

/// Everything a cycle needs, shared by its tasks.
#[derive(Clone)]
pub struct Agent {
    connector: Arc<StubConnector>,
    upstream: Arc<KubernetesClientManager>,
    probe: Arc<dyn ClusterProbe>,
    meta_source: Arc<dyn MetaSource>,
    options: Arc<AgentOptions>,
}

impl Agent {
    pub fn new(
        connector: StubConnector,
        upstream: KubernetesClientManager,
        probe: Arc<dyn ClusterProbe>,
        meta_source: Arc<dyn MetaSource>,
        options: AgentOptions,
    ) -> Self {
        Self {
            connector: Arc::new(connector),
            upstream: Arc::new(upstream),
            probe,
            meta_source,
            options: Arc::new(options),
        }
    }

    pub fn relay_address(&self) -> &str {
        self.connector.relay_address()
    }

    pub fn upstream(&self) -> &KubernetesClientManager {
        &self.upstream
    }

    /// Run one cycle until a sibling ends or `shutdown` fires.
    ///
    /// Failing to open the request channels is an error; anything that goes
    /// wrong afterwards is reported as [`CycleEnd::ChannelLost`].
    pub async fn run_cycle(&self, shutdown: &CancellationToken) -> Result<CycleEnd> {
        let cancel = shutdown.child_token();
        let _guard = cancel.clone().drop_guard();

        let count = self.options.tunnels_per_agent.max(1);
        let mut channels = Vec::with_capacity(count);
        for _ in 0..count {
            let conn = tokio::select! {
                () = cancel.cancelled() => return Ok(CycleEnd::Shutdown),
                conn = self.connector.connect(ChannelKind::Request, 0) => conn?,
            };
            channels.push(conn);
        }
        info!(channels = count, "request channels established");

        let mut tasks: JoinSet<(Sibling, Result<()>)> = JoinSet::new();
        for (index, conn) in channels.into_iter().enumerate() {
            let (read_half, write_half) = tokio::io::split(conn);

            let probe = self.probe.clone();
            let config = self.options.heartbeat.clone();
            let c = cancel.clone();
            tasks.spawn(async move {
                let result = heartbeat::run(write_half, probe, &config, &c).await;
                (Sibling::Heartbeat(index), result)
            });

            let agent = self.clone();
            let channel = RequestChannel::new(index, read_half);
            let c = cancel.clone();
            tasks.spawn(async move {
                let result = agent.dispatch_requests(&channel, &c).await;
                (Sibling::Reader(index), result)
            });
        }

        let agent = self.clone();
        let c = cancel.clone();
        tasks.spawn(async move { (Sibling::Meta, agent.meta_task(&c).await) });

        let end = tokio::select! {
            biased;
            () = shutdown.cancelled() => CycleEnd::Shutdown,
            joined = tasks.join_next() => match joined {
                Some(Ok((sibling, Err(e)))) => {
                    warn!(%sibling, error = %e, "cycle sibling failed");
                    CycleEnd::ChannelLost(e)
                }
                Some(Ok((_, Ok(())))) if shutdown.is_cancelled() => CycleEnd::Shutdown,
                Some(Ok((sibling, Ok(())))) => {
                    CycleEnd::ChannelLost(Error::Task(format!("{sibling} exited")))
                }
                Some(Err(e)) => {
                    error!(error = %e, "cycle sibling panicked");
                    CycleEnd::ChannelLost(Error::Task(e.to_string()))
                }
                None => CycleEnd::ChannelLost(Error::Closed),
            },
        };

        cancel.cancel();
        tasks.shutdown().await;
        debug!("cycle torn down");
        Ok(end)
    }

    /// Dispatch requests from one channel until it fails or `cancel` fires.
    async fn dispatch_requests<R>(
        &self,
        channel: &RequestChannel<R>,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut malformed = 0usize;
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                next = channel.next_request() => next,
            };
            match next {
                Ok((session_id, request)) => {
                    malformed = 0;
                    trace!(channel = channel.index(), session_id, method = %request.method(), uri = %request.uri(), "request received");
                    let agent = self.clone();
                    let c = cancel.clone();
                    tokio::spawn(
                        async move { agent.session(session_id, request, &c).await }
                            .instrument(info_span!("session", session_id)),
                    );
                }
                Err(e) if e.is_request_local() => {
                    malformed += 1;
                    warn!(channel = channel.index(), error = %e, malformed, "dropping malformed request");
                    if malformed > self.options.max_malformed {
                        return Err(Error::InvalidRequest(format!(
                            "{malformed} consecutive malformed requests"
                        )));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn session(&self, session_id: u16, request: Request<Bytes>, cancel: &CancellationToken) {
        let result = tokio::select! {
            () = cancel.cancelled() => {
                debug!("session cancelled");
                return;
            }
            result = self.proxy_session(session_id, request, cancel) => result,
        };
        if let Err(e) = result {
            warn!(error = %e, "session failed");
        }
    }

    /// Proxy one exchange and, if it upgraded, pipe frames until either
    /// side closes.
    async fn proxy_session(
        &self,
        session_id: u16,
        request: Request<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let requested_upgrade = request.headers().get(UPGRADE).cloned();
        let (mut response, _connection) = self.upstream.execute(session_id, request).await?;
        let mut tunnel = self.connector.connect(ChannelKind::Session, session_id).await?;

        let protocol = UpgradeProtocol::negotiated(requested_upgrade.as_ref(), response.status());
        let pending = protocol.map(|_| hyper::upgrade::on(&mut response));
        let status = response.status();
        wire::write_response(&mut tunnel, response).await?;

        let (Some(protocol), Some(pending)) = (protocol, pending) else {
            trace!(%status, "response relayed");
            return Ok(());
        };
        let upgraded = pending.await?;
        debug!(?protocol, "session upgraded, piping frames");
        pipe::run(tunnel, TokioIo::new(upgraded), protocol.frame_format(), cancel).await?;
        debug!("session pipe closed");
        Ok(())
    }

    async fn meta_task(&self, cancel: &CancellationToken) -> Result<()> {
        info!("meta connection establishing");
        let conn = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            conn = self.connector.connect(ChannelKind::Meta, 0) => conn?,
        };
        info!("meta connection established");
        meta::sync(conn, self.meta_source.as_ref(), &self.options.meta, cancel).await
    }
}
