//! Opens relay channels: dial, then write the handshake.

use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace};

use super::backoff::{self, BackoffPolicy};
use super::dial::{BoxedIo, Dialer};
use super::{ChannelKind, Handshake};
use crate::error::{Error, Result};
use crate::identity::ClusterId;

/// Dials the relay and introduces each new channel.
pub struct StubConnector {
    dialer: Arc<dyn Dialer>,
    cluster_id: ClusterId,
    backoff: BackoffPolicy,
}

impl StubConnector {
    pub fn new(dialer: Arc<dyn Dialer>, cluster_id: ClusterId) -> Self {
        Self {
            dialer,
            cluster_id,
            backoff: BackoffPolicy::channel_dial(),
        }
    }

    pub fn with_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = policy;
        self
    }

    pub fn relay_address(&self) -> &str {
        self.dialer.address()
    }

    /// Open a channel of the given kind. Request and meta channels are
    /// redialled under the backoff policy; a session channel gets one try.
    pub async fn connect(&self, kind: ChannelKind, session_id: u16) -> Result<BoxedIo> {
        let addr = self.dialer.address();
        let dialed = if kind.retries_dial() {
            backoff::retry(&self.backoff, "dial relay", || self.dialer.dial()).await
        } else {
            self.dialer.dial().await
        };
        let mut conn = dialed.map_err(|source| Error::Dial {
            addr: addr.to_string(),
            source,
        })?;

        let identity = kind.sends_identity().then_some(&self.cluster_id);
        if let Err(e) = write_handshake(&mut conn, Handshake::new(kind, session_id), identity).await
        {
            let _ = conn.shutdown().await;
            return Err(e);
        }

        match kind {
            ChannelKind::Session => trace!(session_id, "session channel open"),
            _ => info!(%kind, relay = addr, "channel connected"),
        }
        Ok(conn)
    }
}

/// Write the handshake prefix and, when given, the cluster identity.
pub async fn write_handshake<W>(
    writer: &mut W,
    handshake: Handshake,
    identity: Option<&ClusterId>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(&handshake.encode())
        .await
        .map_err(|e| Error::Handshake {
            written: 0,
            reason: e.to_string(),
        })?;
    if let Some(id) = identity {
        writer
            .write_all(id.as_bytes())
            .await
            .map_err(|e| Error::Handshake {
                written: super::HANDSHAKE_LEN,
                reason: format!("cluster id: {e}"),
            })?;
    }
    writer.flush().await.map_err(|e| Error::Handshake {
        written: super::HANDSHAKE_LEN,
        reason: e.to_string(),
    })?;
    debug!(kind = %handshake.kind, session_id = handshake.session_id, "handshake sent");
    Ok(())
}
