//! Frame-granular duplex pipe between a session channel and an upgraded
//! API server connection.

use std::io;

use hyper::header::HeaderValue;
use hyper::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::frame::FrameFormat;

/// Protocol negotiated by a successful `101 Switching Protocols`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeProtocol {
    Spdy,
    WebSocket,
}

impl UpgradeProtocol {
    /// Decide from the request's `Upgrade` header and the response status
    /// whether the exchange turned into a streaming session.
    pub fn negotiated(request_upgrade: Option<&HeaderValue>, status: StatusCode) -> Option<Self> {
        if status != StatusCode::SWITCHING_PROTOCOLS {
            return None;
        }
        let upgrade = request_upgrade?.to_str().ok()?.trim();
        if upgrade == "SPDY/3.1" {
            Some(UpgradeProtocol::Spdy)
        } else if upgrade.eq_ignore_ascii_case("websocket") {
            Some(UpgradeProtocol::WebSocket)
        } else {
            None
        }
    }

    pub fn frame_format(self) -> FrameFormat {
        match self {
            UpgradeProtocol::Spdy => FrameFormat::Spdy,
            UpgradeProtocol::WebSocket => FrameFormat::WebSocket,
        }
    }
}

/// Relay frames between `a` and `b` until either side closes, a read or
/// write fails, or `cancel` fires. Both streams are dropped on return,
/// which closes them.
pub async fn run<A, B>(a: A, b: B, format: FrameFormat, cancel: &CancellationToken) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let result = tokio::select! {
        r = relay(&mut a_read, &mut b_write, format, "forward") => r,
        r = relay(&mut b_read, &mut a_write, format, "backward") => r,
        () = cancel.cancelled() => {
            debug!("pipe cancelled");
            Ok(())
        }
    };

    match result {
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            debug!("pipe peer closed");
            Ok(())
        }
        other => other,
    }
}

async fn relay<R, W>(
    reader: &mut R,
    writer: &mut W,
    format: FrameFormat,
    direction: &'static str,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut frames: u64 = 0;
    loop {
        let frame = format.read_frame(reader).await?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        frames += 1;
        trace!(direction, frames, len = frame.len(), "frame relayed");
    }
}
