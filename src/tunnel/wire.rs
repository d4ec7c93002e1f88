//! HTTP/1.1 as it travels over relay channels.
//!
//! Requests arrive back to back on a request channel with no other framing,
//! so the body has to be consumed exactly (by `Content-Length` or chunked
//! encoding) before the next request can be parsed. Responses are written to
//! session channels with canonical header names; a chunked upstream body is
//! re-chunked so the relay sees the same framing.

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::http::{request, response};
use hyper::{Method, Request, Response, StatusCode, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::SESSION_ID_HEADER;
use crate::error::{Error, Result};

const MAX_HEAD_LEN: usize = 64 * 1024;
const MAX_HEADERS: usize = 100;
const MAX_BODY_LEN: u64 = 64 * 1024 * 1024;

/// Read one request from a relay channel.
///
/// Returns [`Error::Closed`] when the channel ends cleanly between requests
/// and [`Error::InvalidRequest`] when the bytes do not parse.
pub async fn read_request<R>(reader: &mut R) -> Result<Request<Bytes>>
where
    R: AsyncBufRead + Unpin,
{
    let head = read_head(reader).await?;
    let mut parts = parse_head(&head)?;
    let body = read_body(reader, &parts.headers).await?;

    if is_chunked(&parts.headers) {
        // Forwarded with a fixed length instead.
        parts.headers.remove(TRANSFER_ENCODING);
        parts
            .headers
            .insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    }
    Ok(Request::from_parts(parts, body))
}

/// Session id carried by a tunnelled request.
pub fn session_id<B>(request: &Request<B>) -> Result<u16> {
    request
        .headers()
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u16>().ok())
        .ok_or(Error::MissingSessionId)
}

async fn read_head<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);
    loop {
        let limit = (MAX_HEAD_LEN - head.len()) as u64;
        let n = (&mut *reader).take(limit).read_until(b'\n', &mut head).await?;
        if n == 0 {
            return Err(if head.is_empty() {
                Error::Closed
            } else {
                Error::Io(std::io::ErrorKind::UnexpectedEof.into())
            });
        }
        // Stray line breaks between requests are tolerated.
        if head == b"\r\n" || head == b"\n" {
            head.clear();
            continue;
        }
        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
            return Ok(head);
        }
        if head.len() >= MAX_HEAD_LEN {
            return Err(Error::InvalidRequest("request head too large".into()));
        }
    }
}

fn parse_head(head: &[u8]) -> Result<request::Parts> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    match parsed.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(Error::InvalidRequest("incomplete request head".into()))
        }
        Err(e) => return Err(Error::InvalidRequest(e.to_string())),
    }

    let method = Method::from_bytes(parsed.method.unwrap_or_default().as_bytes())
        .map_err(|e| Error::InvalidRequest(e.to_string()))?;
    let version = if parsed.version == Some(0) {
        Version::HTTP_10
    } else {
        Version::HTTP_11
    };
    let mut builder = Request::builder()
        .method(method)
        .uri(parsed.path.unwrap_or("/"))
        .version(version);
    for h in parsed.headers.iter() {
        builder = builder.header(h.name, h.value);
    }
    let (parts, ()) = builder.body(())?.into_parts();
    Ok(parts)
}

async fn read_body<R>(reader: &mut R, headers: &HeaderMap) -> Result<Bytes>
where
    R: AsyncBufRead + Unpin,
{
    if is_chunked(headers) {
        return read_chunked(reader).await;
    }
    let Some(len) = content_length(headers)? else {
        return Ok(Bytes::new());
    };
    if len > MAX_BODY_LEN {
        return Err(Error::InvalidRequest(format!("body of {len} bytes too large")));
    }
    let mut body = Vec::with_capacity(len as usize);
    let read = reader.take(len).read_to_end(&mut body).await?;
    if (read as u64) < len {
        return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    Ok(body.into())
}

async fn read_chunked<R>(reader: &mut R) -> Result<Bytes>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        let size = parse_chunk_size(&line)?;
        if size == 0 {
            break;
        }
        if body.len() as u64 + size > MAX_BODY_LEN {
            return Err(Error::InvalidRequest("chunked body too large".into()));
        }
        let start = body.len();
        body.resize(start + size as usize, 0);
        reader.read_exact(&mut body[start..]).await?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
        if &crlf != b"\r\n" {
            return Err(Error::InvalidRequest("chunk not terminated by CRLF".into()));
        }
    }
    // Trailers, up to the blank line.
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 || line == b"\r\n" || line == b"\n" {
            break;
        }
    }
    Ok(body.into())
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| Error::InvalidRequest("chunk size is not UTF-8".into()))?;
    let digits = text.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(digits, 16)
        .map_err(|_| Error::InvalidRequest(format!("bad chunk size {digits:?}")))
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>> {
    let Some(value) = headers.get(CONTENT_LENGTH) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| Error::InvalidRequest("bad Content-Length".into()))
}

/// Whether the message body uses chunked transfer coding.
pub fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

/// `content-type` → `Content-Type`, `x-tunnel-session-id` → `X-Tunnel-Session-Id`.
pub fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c.to_ascii_lowercase());
        }
        upper = c == '-';
    }
    out
}

/// Serialise the status line and headers.
pub fn encode_response_head(parts: &response::Parts) -> Vec<u8> {
    let version = if parts.version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    };
    let reason = parts.status.canonical_reason().unwrap_or("");
    let mut head = format!("{version} {} {reason}\r\n", parts.status.as_u16()).into_bytes();
    for (name, value) in &parts.headers {
        head.extend_from_slice(canonical_header_name(name.as_str()).as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// Write a full response, streaming the body as it arrives.
///
/// A `101` response has no body; whatever follows belongs to the upgraded
/// protocol and is handled by the pipe.
pub async fn write_response<W, B>(writer: &mut W, response: Response<B>) -> Result<()>
where
    W: AsyncWrite + Unpin,
    B: Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    let (parts, mut body) = response.into_parts();
    writer.write_all(&encode_response_head(&parts)).await?;

    if parts.status != StatusCode::SWITCHING_PROTOCOLS {
        let chunked = is_chunked(&parts.headers);
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| Error::Http(e.to_string()))?;
            let Ok(data) = frame.into_data() else {
                continue;
            };
            if data.is_empty() {
                continue;
            }
            if chunked {
                writer
                    .write_all(format!("{:x}\r\n", data.len()).as_bytes())
                    .await?;
                writer.write_all(&data).await?;
                writer.write_all(b"\r\n").await?;
            } else {
                writer.write_all(&data).await?;
            }
            writer.flush().await?;
        }
        if chunked {
            writer.write_all(b"0\r\n\r\n").await?;
        }
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::convert::Infallible;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use http_body_util::Full;
    use hyper::body::Frame;
    use tokio::io::BufReader;

    use super::*;

    /// Body yielding one data frame per queued chunk.
    struct Chunks(VecDeque<Bytes>);

    impl Body for Chunks {
        type Data = Bytes;
        type Error = Infallible;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<std::result::Result<Frame<Bytes>, Infallible>>> {
            Poll::Ready(self.0.pop_front().map(|b| Ok(Frame::data(b))))
        }
    }

    async fn parse(raw: &[u8]) -> Result<Request<Bytes>> {
        let mut reader = BufReader::new(raw);
        read_request(&mut reader).await
    }

    #[tokio::test]
    async fn test_read_simple_get() {
        let req = parse(
            b"GET /api/v1/pods?watch=1 HTTP/1.1\r\nHost: relay\r\nX-Tunnel-Session-ID: 42\r\n\r\n",
        )
        .await
        .unwrap();
        assert_eq!(req.method(), Method::GET);
        assert_eq!(req.uri().path(), "/api/v1/pods");
        assert_eq!(req.uri().query(), Some("watch=1"));
        assert_eq!(session_id(&req).unwrap(), 42);
        assert!(req.body().is_empty());
    }

    #[tokio::test]
    async fn test_read_content_length_body_then_next_request() {
        let raw = b"POST /a HTTP/1.1\r\nContent-Length: 5\r\n\r\nhelloGET /b HTTP/1.1\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let first = read_request(&mut reader).await.unwrap();
        assert_eq!(first.body().as_ref(), b"hello");
        let second = read_request(&mut reader).await.unwrap();
        assert_eq!(second.uri().path(), "/b");
        assert!(matches!(read_request(&mut reader).await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_read_chunked_body() {
        let raw = b"PATCH /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\n\r\n";
        let req = parse(raw).await.unwrap();
        assert_eq!(req.body().as_ref(), b"Wikipedia");
        assert!(req.headers().get(TRANSFER_ENCODING).is_none());
        assert_eq!(req.headers()[CONTENT_LENGTH], "9");
    }

    #[tokio::test]
    async fn test_malformed_head_is_request_local() {
        let err = parse(b"NOT A REQUEST\r\n\r\n").await.unwrap_err();
        assert!(err.is_request_local(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_unterminated_header_line_is_bounded() {
        let (near, mut far) = tokio::io::duplex(8 * 1024);
        let writer = tokio::spawn(async move {
            far.write_all(b"GET / HTTP/1.1\r\nX-Filler: ").await.unwrap();
            let filler = vec![b'a'; 4096];
            // Never sends a line break; stops once the reader gives up.
            while far.write_all(&filler).await.is_ok() {}
        });

        let mut reader = BufReader::new(near);
        let err = tokio::time::timeout(std::time::Duration::from_secs(5), read_request(&mut reader))
            .await
            .expect("head reading must stop at the size limit")
            .unwrap_err();
        assert!(err.is_request_local(), "{err}");

        drop(reader);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_truncated_body_is_fatal() {
        let err = parse(b"POST /a HTTP/1.1\r\nContent-Length: 10\r\n\r\nshort")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_session_id_header() {
        let req = Request::builder()
            .header(SESSION_ID_HEADER, "65535")
            .body(())
            .unwrap();
        assert_eq!(session_id(&req).unwrap(), 65535);

        let bad = Request::builder()
            .header(SESSION_ID_HEADER, "65536")
            .body(())
            .unwrap();
        assert!(matches!(session_id(&bad), Err(Error::MissingSessionId)));

        let none = Request::builder().body(()).unwrap();
        assert!(matches!(session_id(&none), Err(Error::MissingSessionId)));
    }

    #[test]
    fn test_canonical_header_name() {
        assert_eq!(canonical_header_name("content-type"), "Content-Type");
        assert_eq!(canonical_header_name("x-tunnel-session-id"), "X-Tunnel-Session-Id");
        assert_eq!(canonical_header_name("WWW-AUTHENTICATE"), "Www-Authenticate");
        assert_eq!(canonical_header_name("etag"), "Etag");
    }

    #[tokio::test]
    async fn test_write_fixed_length_response() {
        let resp = Response::builder()
            .status(200)
            .header("content-type", "application/json")
            .header("content-length", "2")
            .body(Full::new(Bytes::from_static(b"{}")))
            .unwrap();
        let mut out = Vec::new();
        write_response(&mut out, resp).await.unwrap();
        assert_eq!(
            out,
            b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n{}"
        );
    }

    #[tokio::test]
    async fn test_write_rechunks_chunked_body() {
        let body = Chunks(VecDeque::from([
            Bytes::from_static(b"abc"),
            Bytes::from_static(b"0123456789abcdef"),
        ]));
        let resp = Response::builder()
            .status(200)
            .header("transfer-encoding", "chunked")
            .body(body)
            .unwrap();
        let mut out = Vec::new();
        write_response(&mut out, resp).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n"));
        assert!(text.ends_with("3\r\nabc\r\n10\r\n0123456789abcdef\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_write_switching_protocols_has_no_body() {
        let resp = Response::builder()
            .status(101)
            .header("upgrade", "SPDY/3.1")
            .header("connection", "Upgrade")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let mut out = Vec::new();
        write_response(&mut out, resp).await.unwrap();
        assert_eq!(
            out,
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: SPDY/3.1\r\nConnection: Upgrade\r\n\r\n"
        );
    }
}
