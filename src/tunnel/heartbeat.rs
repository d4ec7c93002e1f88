//! Heartbeats on request channels.
//!
//! Two loops per channel. The checker probes the API server and records the
//! outcome in a shared health flag; the beater writes that flag to the relay
//! as 8 identical bytes on a fixed cadence. A slow probe never delays a beat.
//!
//! | Byte | Meaning                          |
//! |------|----------------------------------|
//! | `0`  | API server reachable             |
//! | `1`  | unknown, or last probe failed    |

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::HEARTBEAT_PAYLOAD_LEN;
use crate::error::{Error, Result};

pub const BEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const CHECK_INTERVAL: Duration = Duration::from_secs(75);
pub const BEAT_WRITE_TIMEOUT: Duration = Duration::from_secs(15);

/// Label selecting nodes the probe lists.
pub const DEFAULT_PROBE_LABEL_SELECTOR: &str = "alibabacloud.com/external=true";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HealthStatus {
    Healthy = 0,
    Unhealthy = 1,
}

/// Latest probe outcome, shared between the checker and the beater.
#[derive(Debug, Clone)]
pub struct HealthFlag(Arc<AtomicU8>);

impl Default for HealthFlag {
    /// Starts unhealthy until the first probe says otherwise.
    fn default() -> Self {
        Self(Arc::new(AtomicU8::new(HealthStatus::Unhealthy as u8)))
    }
}

impl HealthFlag {
    pub fn set(&self, status: HealthStatus) {
        self.0.store(status as u8, Ordering::SeqCst);
    }

    pub fn get(&self) -> HealthStatus {
        if self.0.load(Ordering::SeqCst) == HealthStatus::Healthy as u8 {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    /// One load, so every byte of a payload agrees.
    pub fn payload(&self) -> [u8; HEARTBEAT_PAYLOAD_LEN] {
        [self.0.load(Ordering::SeqCst); HEARTBEAT_PAYLOAD_LEN]
    }
}

/// Reachability check against the API server.
#[async_trait]
pub trait ClusterProbe: Send + Sync {
    async fn probe(&self) -> Result<()>;
}

/// Lists nodes carrying a label. Any successful list counts as healthy,
/// including an empty one.
pub struct NodeListProbe {
    client: kube::Client,
    label_selector: String,
}

impl NodeListProbe {
    pub fn new(client: kube::Client, label_selector: impl Into<String>) -> Self {
        Self {
            client,
            label_selector: label_selector.into(),
        }
    }
}

#[async_trait]
impl ClusterProbe for NodeListProbe {
    async fn probe(&self) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes
            .list(&ListParams::default().labels(&self.label_selector))
            .await?;
        trace!(nodes = list.items.len(), "health probe listed nodes");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub beat_interval: Duration,
    pub check_interval: Duration,
    pub write_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            beat_interval: BEAT_INTERVAL,
            check_interval: CHECK_INTERVAL,
            write_timeout: BEAT_WRITE_TIMEOUT,
        }
    }
}

/// Run both loops until a beat fails or `cancel` fires. Returns `Ok` only
/// on cancellation.
pub async fn run<W>(
    writer: W,
    probe: Arc<dyn ClusterProbe>,
    config: &HeartbeatConfig,
    cancel: &CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if config.beat_interval.is_zero() || config.check_interval.is_zero() {
        return Err(Error::Config("heartbeat intervals must be non-zero".into()));
    }
    let flag = HealthFlag::default();
    let checker = tokio::spawn(check_loop(
        probe,
        flag.clone(),
        config.check_interval,
        cancel.child_token(),
    ));
    let result = beat_loop(writer, &flag, config, cancel).await;
    checker.abort();
    result
}

/// Probe immediately, then once per `period`.
pub async fn check_loop(
    probe: Arc<dyn ClusterProbe>,
    flag: HealthFlag,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now(), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match probe.probe().await {
            Ok(()) => flag.set(HealthStatus::Healthy),
            Err(e) => {
                warn!(error = %e, "API server health probe failed");
                flag.set(HealthStatus::Unhealthy);
            }
        }
    }
}

/// Write the flag every `beat_interval`, first beat one interval in.
pub async fn beat_loop<W>(
    mut writer: W,
    flag: &HealthFlag,
    config: &HeartbeatConfig,
    cancel: &CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut ticker = interval_at(Instant::now() + config.beat_interval, config.beat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut beats: u64 = 0;
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        let payload = flag.payload();
        let write = async {
            writer.write_all(&payload).await?;
            writer.flush().await
        };
        match tokio::time::timeout(config.write_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(Error::Io(e)),
            Err(_) => return Err(Error::Timeout("heartbeat write")),
        }
        beats += 1;
        if beats % 10 == 0 {
            debug!(beats, status = payload[0], "heartbeats sent");
        }
    }
}
