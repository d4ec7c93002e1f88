//! Reconnect loop around [`Agent::run_cycle`].
//!
//! A lost channel set is rebuilt from scratch. If the relay keeps cutting
//! the connection, two losses inside the flap window stop the process so
//! the orchestrator can restart it with a clean slate.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::agent::{Agent, CycleEnd};
use crate::error::{Error, Result};

/// Minimum spacing between two cycle losses.
pub const FLAP_WINDOW: Duration = Duration::from_secs(5);

/// Remembers when the last cycle ended.
#[derive(Debug)]
pub struct FlapDetector {
    window: Duration,
    last: Option<Instant>,
}

impl FlapDetector {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Record a cycle ending at `now`; fails if the previous one ended less
    /// than a window earlier.
    pub fn record(&mut self, now: Instant) -> Result<()> {
        let flapped = self
            .last
            .is_some_and(|prev| now.saturating_duration_since(prev) < self.window);
        self.last = Some(now);
        if flapped {
            Err(Error::ConnectionCut)
        } else {
            Ok(())
        }
    }
}

/// Run cycles until shutdown, a cycle fails to start, or the connection
/// flaps.
pub async fn run(agent: &Agent, flap_window: Duration, shutdown: &CancellationToken) -> Result<()> {
    info!(
        relay = agent.relay_address(),
        upstream = %agent.upstream().target(),
        "agent started"
    );
    let mut flaps = FlapDetector::new(flap_window);
    let mut cycles: u64 = 0;

    loop {
        cycles += 1;
        match agent.run_cycle(shutdown).await? {
            CycleEnd::Shutdown => {
                info!(cycles, "agent stopped");
                return Ok(());
            }
            CycleEnd::ChannelLost(e) => {
                warn!(cycle = cycles, error = %e, "connection disconnected");
                flaps.record(Instant::now())?;
                info!("reconnecting");
            }
        }
    }
}
