//! Per-connection proxy plumbing: parse each request head, route by
//! Host, inject `X-Forwarded-*`, relay bodies by Content-Length, and
//! splice upgraded (WebSocket) connections bidirectionally.

use crate::Proxy;
use hearth_core::HttpError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const MAX_HEAD: usize = 16 * 1024;

struct Head {
    method: String,
    target: String,
    headers: Vec<(String, String)>,
    keep_alive: bool,
}

impl Head {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn content_length(&self) -> u64 {
        self.header("content-length").and_then(|v| v.trim().parse().ok()).unwrap_or(0)
    }

    fn wants_upgrade(&self) -> bool {
        self.header("upgrade").is_some()
            || self
                .header("connection")
                .map(|v| v.to_ascii_lowercase().contains("upgrade"))
                .unwrap_or(false)
    }
}

/// Serve one client connection until it closes. Every keep-alive request
/// re-parses its head and re-routes, so forwarded headers stay accurate.
pub async fn handle<S>(proxy: Arc<Proxy>, mut client: S, peer: SocketAddr, secure: bool)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client_ip = peer.ip();
    let mut client_carry: Vec<u8> = Vec::new();
    // Backend connection reused across keep-alive requests to the same
    // address.
    let mut backend: Option<(String, TcpStream, Vec<u8>)> = None;

    loop {
        let head = match read_head(&mut client, &mut client_carry).await {
            Ok(Some(head)) => head,
            _ => return,
        };

        let host = head.header("host").unwrap_or("").to_string();
        let Some(addr) = proxy.route(&host).map(|a| a.to_string()) else {
            proxy.note_miss(&client_ip, &host);
            return;
        };
        proxy.note_served();

        // Reuse the held backend only when the address matches.
        let (mut upstream, mut upstream_carry) = match backend.take() {
            Some((held_addr, stream, carry)) if held_addr == addr => (stream, carry),
            _ => match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    (stream, Vec::new())
                }
                Err(e) => {
                    tracing::warn!(proxy = %proxy.name, addr = %addr, error = %e, "Backend connect failed");
                    proxy.note_error();
                    let _ = write_error(&mut client, &e.to_string()).await;
                    return;
                }
            },
        };

        let upgrade = head.wants_upgrade();
        let forward = build_forward_head(&head, &client_ip.to_string(), &host, secure, upgrade);
        if upstream.write_all(&forward).await.is_err() {
            // A stale pooled connection; retry once with a fresh one.
            upstream = match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    stream
                }
                Err(e) => {
                    proxy.note_error();
                    let _ = write_error(&mut client, &e.to_string()).await;
                    return;
                }
            };
            upstream_carry = Vec::new();
            if let Err(e) = upstream.write_all(&forward).await {
                proxy.note_error();
                let _ = write_error(&mut client, &e.to_string()).await;
                return;
            }
        }

        if upgrade {
            // Hand the rest of the connection over to both peers.
            if !client_carry.is_empty() {
                let leftover = std::mem::take(&mut client_carry);
                if upstream.write_all(&leftover).await.is_err() {
                    return;
                }
            }
            tracing::debug!(proxy = %proxy.name, addr = %addr, "Upgrade passthrough");
            let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
            return;
        }

        // Request body, framed by Content-Length.
        if copy_exact(&mut client, &mut client_carry, &mut upstream, head.content_length())
            .await
            .is_err()
        {
            return;
        }

        // Relay the backend response.
        let response_head = match read_head_raw(&mut upstream, &mut upstream_carry).await {
            Ok(Some(raw)) => raw,
            _ => {
                proxy.note_error();
                let _ = write_error(&mut client, "upstream closed without response").await;
                return;
            }
        };
        let (resp_len, upstream_keep_alive) = parse_response_meta(&response_head);
        if client.write_all(&response_head).await.is_err() {
            return;
        }

        match resp_len {
            Some(len) => {
                if copy_exact(&mut upstream, &mut upstream_carry, &mut client, len).await.is_err() {
                    return;
                }
            }
            None => {
                // No length: stream until the backend closes, then close.
                if !upstream_carry.is_empty() {
                    let leftover = std::mem::take(&mut upstream_carry);
                    if client.write_all(&leftover).await.is_err() {
                        return;
                    }
                }
                let _ = tokio::io::copy(&mut upstream, &mut client).await;
                return;
            }
        }
        let _ = client.flush().await;

        if upstream_keep_alive {
            backend = Some((addr, upstream, upstream_carry));
        }
        if !head.keep_alive {
            return;
        }
    }
}

/// Read and parse one request head; `carry` keeps bytes beyond it.
async fn read_head<S>(stream: &mut S, carry: &mut Vec<u8>) -> Result<Option<Head>, HttpError>
where
    S: AsyncRead + Unpin,
{
    let Some(raw) = read_head_raw(stream, carry).await? else {
        return Ok(None);
    };

    let mut headers_raw = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers_raw);
    match req.parse(&raw) {
        Ok(httparse::Status::Complete(_)) => {
            let mut headers = Vec::with_capacity(req.headers.len());
            let mut keep_alive = req.version.unwrap_or(1) == 1;
            for h in req.headers.iter() {
                if h.name.is_empty() {
                    break;
                }
                let value = String::from_utf8_lossy(h.value).to_string();
                if h.name.eq_ignore_ascii_case("connection")
                    && value.eq_ignore_ascii_case("close")
                {
                    keep_alive = false;
                }
                headers.push((h.name.to_string(), value));
            }
            Ok(Some(Head {
                method: req.method.unwrap_or("GET").to_string(),
                target: req.path.unwrap_or("/").to_string(),
                headers,
                keep_alive,
            }))
        }
        _ => Err(HttpError::BadRequest("Malformed request head".into())),
    }
}

/// Pull raw bytes through the end of a head (`\r\n\r\n`), leaving any
/// excess in `carry`.
async fn read_head_raw<S>(stream: &mut S, carry: &mut Vec<u8>) -> Result<Option<Vec<u8>>, HttpError>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(pos) = carry.windows(4).position(|w| w == b"\r\n\r\n") {
            let raw: Vec<u8> = carry.drain(..pos + 4).collect();
            return Ok(Some(raw));
        }
        if carry.len() > MAX_HEAD {
            return Err(HttpError::BadRequest("Head too large".into()));
        }
        let n = stream.read(&mut chunk).await.map_err(|e| HttpError::Internal(e.to_string()))?;
        if n == 0 {
            if carry.is_empty() {
                return Ok(None);
            }
            return Err(HttpError::BadRequest("Truncated head".into()));
        }
        carry.extend_from_slice(&chunk[..n]);
    }
}

/// Rebuild the request head for the backend: hop-by-hop headers are
/// dropped (kept for upgrades), `X-Forwarded-*` are appended.
fn build_forward_head(
    head: &Head,
    client_ip: &str,
    host: &str,
    secure: bool,
    upgrade: bool,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(512);
    buf.extend_from_slice(head.method.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(head.target.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");

    for (name, value) in &head.headers {
        let hop_by_hop = name.eq_ignore_ascii_case("connection")
            || name.eq_ignore_ascii_case("keep-alive")
            || name.eq_ignore_ascii_case("upgrade")
            || name.eq_ignore_ascii_case("proxy-connection");
        if hop_by_hop && !upgrade {
            continue;
        }
        if name.to_ascii_lowercase().starts_with("x-forwarded-") {
            continue;
        }
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    if !upgrade {
        buf.extend_from_slice(b"connection: keep-alive\r\n");
    }
    buf.extend_from_slice(format!("x-forwarded-for: {client_ip}\r\n").as_bytes());
    buf.extend_from_slice(
        format!("x-forwarded-proto: {}\r\n", if secure { "https" } else { "http" }).as_bytes(),
    );
    buf.extend_from_slice(format!("x-forwarded-host: {host}\r\n").as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

/// Content length (None means read-to-close) and keep-alive flag of a
/// raw response head.
fn parse_response_meta(raw: &[u8]) -> (Option<u64>, bool) {
    let mut headers_raw = [httparse::EMPTY_HEADER; 64];
    let mut resp = httparse::Response::new(&mut headers_raw);
    let mut len = None;
    let mut keep_alive = true;

    if let Ok(httparse::Status::Complete(_)) = resp.parse(raw) {
        for h in resp.headers.iter() {
            if h.name.is_empty() {
                break;
            }
            if h.name.eq_ignore_ascii_case("content-length") {
                len = std::str::from_utf8(h.value).ok().and_then(|v| v.trim().parse().ok());
            }
            if h.name.eq_ignore_ascii_case("connection")
                && String::from_utf8_lossy(h.value).eq_ignore_ascii_case("close")
            {
                keep_alive = false;
            }
            if h.name.eq_ignore_ascii_case("transfer-encoding") {
                // Chunked responses relay until close.
                len = None;
                keep_alive = false;
            }
        }
    } else {
        keep_alive = false;
    }
    (len, keep_alive)
}

/// Copy exactly `n` body bytes, consuming `carry` first.
async fn copy_exact<R, W>(
    from: &mut R,
    carry: &mut Vec<u8>,
    to: &mut W,
    mut n: u64,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if n == 0 {
        return Ok(());
    }

    if !carry.is_empty() {
        let take = (carry.len() as u64).min(n) as usize;
        let head: Vec<u8> = carry.drain(..take).collect();
        to.write_all(&head).await?;
        n -= take as u64;
    }

    let mut buf = vec![0u8; 64 * 1024];
    while n > 0 {
        let want = n.min(buf.len() as u64) as usize;
        let read = from.read(&mut buf[..want]).await?;
        if read == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short body"));
        }
        to.write_all(&buf[..read]).await?;
        n -= read as u64;
    }
    Ok(())
}

/// Canonical 500 envelope for upstream failures.
async fn write_error<S>(stream: &mut S, detail: &str) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let body = HttpError::Detailed {
        code: 500,
        msg: "Upstream failure".to_string(),
        detail: detail.to_string(),
    }
    .envelope()
    .to_string();
    let head = format!(
        "HTTP/1.1 500 Internal Server Error\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body.as_bytes()).await?;
    stream.flush().await
}
