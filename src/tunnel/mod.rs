//! Reverse tunnel to the relay ("stub") server.
//!
//! The connector keeps a small pool of outbound TLS connections open to the
//! relay. The relay writes HTTP requests destined for the Kubernetes API
//! server onto those connections; the connector proxies each one and streams
//! the response back on a fresh connection dialled for that session.
//!
//! ```text
//! mod.rs        channel kinds, handshake wire format
//! backoff.rs    exponential backoff with jitter for channel dials
//! dial.rs       Dialer trait, TCP and TLS dialers
//! connector.rs  dial + handshake (StubConnector)
//! wire.rs       HTTP/1.1 request parsing and response serialisation
//! kube_proxy.rs forwards one request to the API server on its own connection
//! frame.rs      SPDY and WebSocket frame readers
//! pipe.rs       frame-granular duplex pipe for upgraded sessions
//! heartbeat.rs  health byte stream and API server probe
//! meta.rs       periodic cluster metadata upload
//! agent.rs      one connection cycle and its sibling tasks
//! client.rs     reconnect loop with flap detection
//! ```
//!
//! Every channel opens with a 3-byte handshake: one kind byte followed by a
//! big-endian 16-bit session id. Request and meta channels follow it with the
//! 32-byte [`ClusterId`](crate::identity::ClusterId).

pub mod agent;
pub mod backoff;
pub mod client;
pub mod connector;
pub mod dial;
pub mod frame;
pub mod heartbeat;
pub mod kube_proxy;
pub mod meta;
pub mod pipe;
pub mod wire;

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::identity::{ClusterId, CLUSTER_ID_LEN};

/// Header the relay uses to tag a tunnelled request with its session id.
pub const SESSION_ID_HEADER: &str = "X-Tunnel-Session-ID";

/// Size of each heartbeat write on a request channel.
pub const HEARTBEAT_PAYLOAD_LEN: usize = 8;

/// Size of the kind + session id prefix every channel starts with.
pub const HANDSHAKE_LEN: usize = 3;

/// Acknowledgement the relay returns for each metadata upload.
pub const META_ACK: &[u8; 3] = b"ack";

/// What a relay connection is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelKind {
    /// Long-lived, carries inbound requests and outbound heartbeats.
    Request = 0,
    /// Short-lived, carries one response (and an upgraded stream if any).
    Session = 1,
    /// Long-lived, carries metadata uploads and their acks.
    Meta = 2,
}

impl ChannelKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(ChannelKind::Request),
            1 => Some(ChannelKind::Session),
            2 => Some(ChannelKind::Meta),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Long-lived channels are redialled with backoff; session channels
    /// get exactly one attempt.
    pub fn retries_dial(self) -> bool {
        !matches!(self, ChannelKind::Session)
    }

    /// Whether the cluster identity follows the handshake.
    pub fn sends_identity(self) -> bool {
        !matches!(self, ChannelKind::Session)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Request => "request",
            ChannelKind::Session => "session",
            ChannelKind::Meta => "meta",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The 3-byte prefix written on every freshly dialled channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub kind: ChannelKind,
    pub session_id: u16,
}

impl Handshake {
    pub fn new(kind: ChannelKind, session_id: u16) -> Self {
        Self { kind, session_id }
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let [hi, lo] = self.session_id.to_be_bytes();
        [self.kind.as_u8(), hi, lo]
    }

    pub fn decode(bytes: [u8; HANDSHAKE_LEN]) -> Option<Self> {
        let kind = ChannelKind::from_u8(bytes[0])?;
        Some(Self {
            kind,
            session_id: u16::from_be_bytes([bytes[1], bytes[2]]),
        })
    }
}

/// Relay side of the handshake: read the prefix and, for long-lived
/// channels, the cluster identity that follows it.
pub async fn accept_handshake<R>(reader: &mut R) -> Result<(Handshake, Option<ClusterId>)>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; HANDSHAKE_LEN];
    reader.read_exact(&mut prefix).await?;
    let handshake = Handshake::decode(prefix).ok_or_else(|| Error::Handshake {
        written: 0,
        reason: format!("unknown channel kind {}", prefix[0]),
    })?;
    if !handshake.kind.sends_identity() {
        return Ok((handshake, None));
    }
    let mut id = [0u8; CLUSTER_ID_LEN];
    reader.read_exact(&mut id).await?;
    Ok((handshake, Some(ClusterId::from_bytes(id))))
}
