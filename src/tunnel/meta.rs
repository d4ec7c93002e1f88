//! Cluster metadata upload over the meta channel.
//!
//! Every few seconds the connector writes a JSON document describing the
//! cluster and waits for a 3-byte `ack`. Collecting the document costs
//! several API calls, so it is refreshed only every `refresh_every`
//! iterations and the last copy is resent in between.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::META_ACK;
use crate::error::{Error, Result};

pub const META_INTERVAL: Duration = Duration::from_secs(3);
pub const META_IO_TIMEOUT: Duration = Duration::from_secs(3);
pub const META_REFRESH_EVERY: u32 = 20;

/// Document uploaded on the meta channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMeta {
    pub provider: String,
    #[serde(rename = "k8sversion")]
    pub k8s_version: String,
    #[serde(rename = "isintranet")]
    pub is_intranet: String,
    #[serde(rename = "customizecommand")]
    pub customize_command: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// Produces the metadata document. Implementations swallow their own
/// errors and return an empty document instead.
#[async_trait]
pub trait MetaSource: Send + Sync {
    async fn collect(&self) -> AgentMeta;
}

#[derive(Debug, Clone)]
pub struct MetaSyncConfig {
    pub interval: Duration,
    pub io_timeout: Duration,
    pub refresh_every: u32,
}

impl Default for MetaSyncConfig {
    fn default() -> Self {
        Self {
            interval: META_INTERVAL,
            io_timeout: META_IO_TIMEOUT,
            refresh_every: META_REFRESH_EVERY,
        }
    }
}

/// Upload metadata until an I/O error, a timeout, or cancellation. Returns
/// `Ok` only when cancelled.
pub async fn sync<S>(
    mut conn: S,
    source: &dyn MetaSource,
    config: &MetaSyncConfig,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let refresh_every = config.refresh_every.max(1);
    let mut meta = AgentMeta::default();
    let mut iteration: u32 = 0;

    loop {
        if iteration == 0 {
            meta = source.collect().await;
            debug!(provider = %meta.provider, version = %meta.k8s_version, "metadata refreshed");
        }

        match serde_json::to_vec(&meta) {
            Ok(payload) => {
                let write = async {
                    conn.write_all(&payload).await?;
                    conn.flush().await
                };
                tokio::time::timeout(config.io_timeout, write)
                    .await
                    .map_err(|_| Error::Timeout("metadata write"))??;
            }
            Err(e) => error!(error = %e, "cannot encode metadata"),
        }

        let mut ack = [0u8; 3];
        tokio::time::timeout(config.io_timeout, conn.read_exact(&mut ack))
            .await
            .map_err(|_| Error::Timeout("metadata ack"))??;
        if &ack != META_ACK {
            warn!(got = ?String::from_utf8_lossy(&ack), "unexpected metadata ack");
        }

        iteration = (iteration + 1) % refresh_every;

        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            () = tokio::time::sleep(config.interval) => {}
        }
    }
}
