//! Minimal HTTP/1.1 head codec for the origin side.
//!
//! Only heads are encoded and parsed; bodies are relayed as raw bytes. Every
//! origin exchange uses a fresh connection with `Connection: close`, so the
//! response body ends at origin EOF.

use crate::domain::entities::{RequestHead, ResponseHead};
use crate::domain::ports::OriginError;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a response head.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

const SWITCHING_PROTOCOLS: u16 = 101;

const HOP_BY_HOP: [&str; 4] = ["connection", "keep-alive", "proxy-connection", "upgrade"];

/// Encode a request head for the origin.
///
/// Hop-by-hop headers are replaced: a plain request gets `Connection: close`,
/// an upgrade keeps `Connection: upgrade` and its `Upgrade` header.
pub fn encode_request_head(head: &RequestHead, host: &str, upgrade: bool) -> Vec<u8> {
    let mut out = String::with_capacity(256);
    out.push_str(&head.method);
    out.push(' ');
    out.push_str(if head.path.is_empty() { "/" } else { &head.path });
    out.push_str(" HTTP/1.1\r\n");

    if head.header("host").is_none() {
        out.push_str("Host: ");
        out.push_str(host);
        out.push_str("\r\n");
    }

    for (name, value) in &head.headers {
        if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }

    if upgrade {
        out.push_str("Connection: upgrade\r\n");
        out.push_str("Upgrade: ");
        out.push_str(head.header("upgrade").unwrap_or("websocket"));
        out.push_str("\r\n");
    } else {
        out.push_str("Connection: close\r\n");
    }
    out.push_str("\r\n");
    out.into_bytes()
}

pub async fn write_request_head<W: AsyncWrite + Unpin>(
    w: &mut W,
    head: &RequestHead,
    host: &str,
    upgrade: bool,
) -> std::io::Result<()> {
    w.write_all(&encode_request_head(head, host, upgrade)).await?;
    w.flush().await
}

/// Read the final response head.
///
/// Interim `1xx` heads (`100 Continue`, `103 Early Hints`) are skipped. A
/// `101` is final only when the request asked for an `upgrade`. Returns the
/// parsed head and whatever body bytes arrived with it.
pub async fn read_response_head<R: AsyncRead + Unpin>(
    r: &mut R,
    upgrade: bool,
) -> Result<(ResponseHead, Bytes), OriginError> {
    let mut buf = BytesMut::with_capacity(4096);
    let mut scanned = 0;

    loop {
        if let Some(end) = find_head_end(&buf, scanned) {
            let head = parse_response_head(&buf[..end])?;
            let rest = buf.split_off(end + 4);

            match head.status {
                SWITCHING_PROTOCOLS if !upgrade => {
                    return Err(OriginError::MalformedResponse(
                        "origin switched protocols without an upgrade request".to_string(),
                    ));
                }
                100..=199 if head.status != SWITCHING_PROTOCOLS => {
                    tracing::trace!(status = head.status, "skipping interim response");
                    buf = rest;
                    scanned = 0;
                    continue;
                }
                _ => return Ok((head, rest.freeze())),
            }
        }
        // The terminator may straddle two reads
        scanned = buf.len().saturating_sub(3);

        if buf.len() >= MAX_HEAD_BYTES {
            return Err(OriginError::MalformedResponse(format!(
                "response head exceeds {} bytes",
                MAX_HEAD_BYTES
            )));
        }

        let n = r.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(OriginError::MalformedResponse(
                "origin closed before sending a response head".to_string(),
            ));
        }
    }
}

fn find_head_end(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + from)
}

/// Parse a status line and header block (without the final blank line).
pub fn parse_response_head(raw: &[u8]) -> Result<ResponseHead, OriginError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| OriginError::MalformedResponse("response head is not utf-8".to_string()))?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(OriginError::MalformedResponse(format!(
            "bad status line {:?}",
            status_line
        )));
    }
    let status: u16 = parts
        .next()
        .and_then(|code| code.parse().ok())
        .filter(|code| (100..1000).contains(code))
        .ok_or_else(|| {
            OriginError::MalformedResponse(format!("bad status code in {:?}", status_line))
        })?;

    let mut head = ResponseHead::new(status);
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| {
            OriginError::MalformedResponse(format!("bad header line {:?}", line))
        })?;
        head.headers
            .push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(head)
}
