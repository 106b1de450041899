//! Minimal HTTP/1.1 framing over a byte stream: head parsing with
//! `httparse`, a content-length body reader, and hand-built responses.

use bytes::Bytes;
use hearth_core::error::status_text;
use hearth_core::HttpError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Request heads larger than this are rejected outright.
const MAX_HEAD: usize = 16 * 1024;

/// A parsed request head. Header names are stored lowercase.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub keep_alive: bool,
}

impl RequestHead {
    /// Case-insensitive single-header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers.iter().find(|(k, _)| *k == name).map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }

    /// Media type without parameters, lowercase.
    pub fn content_type(&self) -> Option<String> {
        self.header("content-type")
            .map(|v| v.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
    }
}

/// Read one request head. `carry` holds bytes already read off the stream
/// (keep-alive leftovers); on return it holds the bytes after the head.
///
/// `Ok(None)` is a clean close between requests.
pub async fn read_head<S>(stream: &mut S, carry: &mut Vec<u8>) -> Result<Option<RequestHead>, HttpError>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = find_head_end(carry) {
            let head = parse_head(&carry[..end])?;
            carry.drain(..end);
            return Ok(Some(head));
        }
        if carry.len() > MAX_HEAD {
            return Err(HttpError::BadRequest("Request head too large".into()));
        }

        let n = stream.read(&mut chunk).await.map_err(|e| HttpError::Internal(e.to_string()))?;
        if n == 0 {
            if carry.is_empty() {
                return Ok(None);
            }
            return Err(HttpError::BadRequest("Truncated request head".into()));
        }
        carry.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_head(raw: &[u8]) -> Result<RequestHead, HttpError> {
    let mut headers_raw = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers_raw);

    match req.parse(raw) {
        Ok(httparse::Status::Complete(_)) => {
            let method = req.method.unwrap_or("GET").to_string();
            let target = req.path.unwrap_or("/").to_string();
            let minor = req.version.unwrap_or(1);

            let mut headers = Vec::with_capacity(req.headers.len());
            let mut keep_alive = minor == 1;
            for h in req.headers.iter() {
                if h.name.is_empty() {
                    break;
                }
                let value = std::str::from_utf8(h.value).unwrap_or("").to_string();
                let name = h.name.to_ascii_lowercase();
                if name == "connection" {
                    keep_alive = !value.eq_ignore_ascii_case("close");
                }
                headers.push((name, value));
            }
            Ok(RequestHead { method, target, headers, keep_alive })
        }
        Ok(httparse::Status::Partial) => Err(HttpError::BadRequest("Incomplete request head".into())),
        Err(e) => Err(HttpError::BadRequest(format!("Malformed request: {e}"))),
    }
}

/// Content-length-bounded body reader. Bytes beyond the declared length
/// stay in `carry` for the next keep-alive request.
pub struct BodyReader<'a, S> {
    stream: &'a mut S,
    carry: &'a mut Vec<u8>,
    remaining: u64,
}

impl<'a, S> BodyReader<'a, S>
where
    S: AsyncRead + Unpin,
{
    pub fn new(stream: &'a mut S, carry: &'a mut Vec<u8>, content_length: u64) -> Self {
        Self { stream, carry, remaining: content_length }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Next chunk of the body, `None` once the declared length is
    /// consumed.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, HttpError> {
        if self.remaining == 0 {
            return Ok(None);
        }

        if !self.carry.is_empty() {
            let take = (self.carry.len() as u64).min(self.remaining) as usize;
            let data: Vec<u8> = self.carry.drain(..take).collect();
            self.remaining -= take as u64;
            return Ok(Some(Bytes::from(data)));
        }

        let want = self.remaining.min(16 * 1024) as usize;
        let mut buf = vec![0u8; want];
        let n = self
            .stream
            .read(&mut buf)
            .await
            .map_err(|e| HttpError::Internal(e.to_string()))?;
        if n == 0 {
            return Err(HttpError::BadRequest("Body shorter than Content-Length".into()));
        }
        buf.truncate(n);
        self.remaining -= n as u64;
        Ok(Some(Bytes::from(buf)))
    }

    /// Drain whatever the handler did not consume, so the connection can
    /// be reused.
    pub async fn discard(&mut self) -> Result<(), HttpError> {
        while self.chunk().await?.is_some() {}
        Ok(())
    }
}

/// Serialize a response head; header values are written as-is.
pub fn encode_head(status: u16, headers: &[(String, String)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(b"HTTP/1.1 ");
    buf.extend_from_slice(status.to_string().as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(status_text(status).as_bytes());
    buf.extend_from_slice(b"\r\n");
    for (name, value) in headers {
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf
}

/// Write a buffered response with exact Content-Length. `include_body`
/// false sends the head only (HEAD requests). Returns body bytes written.
pub async fn write_response<S>(
    stream: &mut S,
    status: u16,
    headers: &[(String, String)],
    body: &[u8],
    include_body: bool,
) -> std::io::Result<u64>
where
    S: AsyncWrite + Unpin,
{
    let mut all: Vec<(String, String)> = headers.to_vec();
    all.push(("content-length".to_string(), body.len().to_string()));
    stream.write_all(&encode_head(status, &all)).await?;
    if include_body && !body.is_empty() {
        stream.write_all(body).await?;
        stream.flush().await?;
        return Ok(body.len() as u64);
    }
    stream.flush().await?;
    Ok(0)
}

/// Chunked transfer-encoding writer for streams of unknown length
/// (on-the-fly gzip).
pub struct ChunkedWriter<'a, S> {
    stream: &'a mut S,
    written: u64,
}

impl<'a, S> ChunkedWriter<'a, S>
where
    S: AsyncWrite + Unpin,
{
    pub fn new(stream: &'a mut S) -> Self {
        Self { stream, written: 0 }
    }

    pub async fn write_chunk(&mut self, data: &[u8]) -> std::io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.stream.write_all(format!("{:x}\r\n", data.len()).as_bytes()).await?;
        self.stream.write_all(data).await?;
        self.stream.write_all(b"\r\n").await?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Terminal zero chunk; returns total body bytes written.
    pub async fn finish(mut self) -> std::io::Result<u64> {
        self.stream.write_all(b"0\r\n\r\n").await?;
        self.stream.flush().await?;
        Ok(self.written)
    }
}
