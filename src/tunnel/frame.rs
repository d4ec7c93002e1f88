//! Frame readers for upgraded streams.
//!
//! The pipe relays whole frames so a write on either side never splits one.
//! Readers return the frame's raw bytes, header included, exactly as they
//! appeared on the wire. WebSocket payloads are never unmasked.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// SPDY/3 frames carry an 8-byte header whose last three bytes are the
/// big-endian payload length.
pub const SPDY_HEADER_LEN: usize = 8;

const WS_LEN_16: u8 = 126;
const WS_LEN_64: u8 = 127;
const WS_MASK_KEY_LEN: usize = 4;

/// Largest WebSocket payload relayed as one frame. SPDY's 24-bit length
/// field already keeps its frames under 16 MiB.
pub const MAX_WEBSOCKET_PAYLOAD_LEN: u64 = 16 * 1024 * 1024;

/// Which framing an upgraded stream uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Spdy,
    WebSocket,
}

impl FrameFormat {
    pub async fn read_frame<R>(self, reader: &mut R) -> io::Result<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        match self {
            FrameFormat::Spdy => read_spdy_frame(reader).await,
            FrameFormat::WebSocket => read_websocket_frame(reader).await,
        }
    }
}

/// Read one SPDY frame: the 8-byte header followed by its payload.
pub async fn read_spdy_frame<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; SPDY_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let len = u32::from_be_bytes([0, header[5], header[6], header[7]]);

    let mut frame = Vec::with_capacity(SPDY_HEADER_LEN + len as usize);
    frame.extend_from_slice(&header);
    append_exact(reader, &mut frame, u64::from(len)).await?;
    Ok(frame)
}

/// Read one WebSocket frame (RFC 6455 §5.2).
pub async fn read_websocket_frame<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 2];
    reader.read_exact(&mut head).await?;
    let masked = head[1] & 0x80 != 0;
    let short_len = head[1] & 0x7f;

    let mut frame = Vec::with_capacity(14);
    frame.extend_from_slice(&head);

    let payload_len = match short_len {
        WS_LEN_16 => {
            let mut ext = [0u8; 2];
            reader.read_exact(&mut ext).await?;
            frame.extend_from_slice(&ext);
            u64::from(u16::from_be_bytes(ext))
        }
        WS_LEN_64 => {
            let mut ext = [0u8; 8];
            reader.read_exact(&mut ext).await?;
            frame.extend_from_slice(&ext);
            u64::from_be_bytes(ext)
        }
        n => u64::from(n),
    };
    if payload_len > MAX_WEBSOCKET_PAYLOAD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("websocket payload of {payload_len} bytes exceeds {MAX_WEBSOCKET_PAYLOAD_LEN}"),
        ));
    }

    if masked {
        let mut key = [0u8; WS_MASK_KEY_LEN];
        reader.read_exact(&mut key).await?;
        frame.extend_from_slice(&key);
    }

    append_exact(reader, &mut frame, payload_len).await?;
    Ok(frame)
}

/// Append exactly `len` bytes from `reader` to `buf`, tolerating short reads.
async fn append_exact<R>(reader: &mut R, buf: &mut Vec<u8>, len: u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let read = reader.take(len).read_to_end(buf).await?;
    if (read as u64) < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("frame truncated: wanted {len} payload bytes, got {read}"),
        ));
    }
    Ok(())
}
