//! Streaming multipart/form-data parser.
//!
//! Buffers until each boundary, parses part sub-headers to the blank
//! line, then either collects a field value in memory or streams a file
//! part into a temp file, watching for `\r\n--boundary` across chunk
//! borders.

use super::{temp_path, BodyLimits};
use crate::context::{BodyData, UploadedFile};
use crate::http::BodyReader;
use hearth_core::HttpError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWriteExt};

pub async fn parse<S>(
    reader: &mut BodyReader<'_, S>,
    boundary: &str,
    limits: &BodyLimits,
    temp_dir: &Path,
    temp_files: &mut Vec<PathBuf>,
) -> Result<BodyData, HttpError>
where
    S: AsyncRead + Unpin,
{
    let delim = format!("--{boundary}").into_bytes();
    let closer = format!("\r\n--{boundary}").into_bytes();

    let mut feed = Feed { reader, buf: Vec::new(), eof: false };
    let mut fields = HashMap::new();
    let mut files = Vec::new();
    let mut in_memory: u64 = 0;

    // Skip the preamble through the first boundary.
    loop {
        if let Some(pos) = find(&feed.buf, &delim) {
            feed.buf.drain(..pos + delim.len());
            break;
        }
        if feed.buf.len() as u64 > limits.request_max {
            return Err(HttpError::PayloadTooLarge("Request body exceeds limit".into()));
        }
        if !feed.fill().await? {
            return Err(HttpError::BadRequest("Multipart body without boundary".into()));
        }
    }

    loop {
        // Right after `--boundary`: either the terminal `--` or CRLF into
        // the part headers.
        while feed.buf.len() < 2 && feed.fill().await? {}
        if feed.buf.starts_with(b"--") {
            break;
        }
        if !feed.buf.starts_with(b"\r\n") {
            return Err(HttpError::BadRequest("Malformed multipart boundary".into()));
        }
        feed.buf.drain(..2);

        // Part sub-headers up to the blank line.
        let head_end = loop {
            if let Some(pos) = find(&feed.buf, b"\r\n\r\n") {
                break pos;
            }
            if feed.buf.len() as u64 > limits.request_max {
                return Err(HttpError::PayloadTooLarge("Request body exceeds limit".into()));
            }
            if !feed.fill().await? {
                return Err(HttpError::BadRequest("Truncated multipart headers".into()));
            }
        };
        let header_block = String::from_utf8_lossy(&feed.buf[..head_end]).to_string();
        feed.buf.drain(..head_end + 4);

        let (name, filename, mime) = parse_part_headers(&header_block)?;

        match filename {
            Some(filename) => {
                let path = temp_path(temp_dir);
                temp_files.push(path.clone());
                match stream_file_part(&mut feed, &closer, limits, &path).await {
                    Ok(size) => files.push(UploadedFile {
                        filename: Some(filename),
                        mime,
                        temp_file: path,
                        size,
                    }),
                    Err(e) => {
                        let _ = tokio::fs::remove_file(&path).await;
                        return Err(e);
                    }
                }
            }
            None => {
                let value = collect_part(&mut feed, &closer, limits).await?;
                in_memory += value.len() as u64;
                if in_memory > limits.request_max {
                    return Err(HttpError::PayloadTooLarge("Request body exceeds limit".into()));
                }
                fields.insert(name, String::from_utf8_lossy(&value).to_string());
            }
        }
    }

    Ok(BodyData::Multipart { fields, files })
}

struct Feed<'a, 'b, S> {
    reader: &'a mut BodyReader<'b, S>,
    buf: Vec<u8>,
    eof: bool,
}

impl<S: AsyncRead + Unpin> Feed<'_, '_, S> {
    /// Pull one chunk into the buffer; false at end of body.
    async fn fill(&mut self) -> Result<bool, HttpError> {
        if self.eof {
            return Ok(false);
        }
        match self.reader.chunk().await? {
            Some(chunk) => {
                self.buf.extend_from_slice(&chunk);
                Ok(true)
            }
            None => {
                self.eof = true;
                Ok(false)
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Collect one part's content (everything up to `\r\n--boundary`) in
/// memory. Leaves the buffer positioned right after the boundary.
async fn collect_part<S: AsyncRead + Unpin>(
    feed: &mut Feed<'_, '_, S>,
    closer: &[u8],
    limits: &BodyLimits,
) -> Result<Vec<u8>, HttpError> {
    let mut out = Vec::new();
    loop {
        if let Some(pos) = find(&feed.buf, closer) {
            out.extend_from_slice(&feed.buf[..pos]);
            feed.buf.drain(..pos + closer.len());
            return Ok(out);
        }
        // Keep a tail that could be a split boundary prefix.
        let keep = closer.len() - 1;
        if feed.buf.len() > keep {
            let take = feed.buf.len() - keep;
            out.extend(feed.buf.drain(..take));
        }
        if out.len() as u64 > limits.request_max {
            return Err(HttpError::PayloadTooLarge("Request body exceeds limit".into()));
        }
        if !feed.fill().await? {
            return Err(HttpError::BadRequest("Truncated multipart part".into()));
        }
    }
}

/// Stream one file part into `path`, enforcing the per-file ceiling.
/// Leaves the buffer positioned right after the boundary.
async fn stream_file_part<S: AsyncRead + Unpin>(
    feed: &mut Feed<'_, '_, S>,
    closer: &[u8],
    limits: &BodyLimits,
    path: &Path,
) -> Result<u64, HttpError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| HttpError::Internal(format!("Temp file create failed: {e}")))?;
    let mut size: u64 = 0;

    loop {
        if let Some(pos) = find(&feed.buf, closer) {
            size += pos as u64;
            if size > limits.upload_max {
                return Err(HttpError::PayloadTooLarge("Upload exceeds limit".into()));
            }
            file.write_all(&feed.buf[..pos])
                .await
                .map_err(|e| HttpError::Internal(format!("Temp file write failed: {e}")))?;
            file.flush().await.map_err(|e| HttpError::Internal(e.to_string()))?;
            feed.buf.drain(..pos + closer.len());
            return Ok(size);
        }

        let keep = closer.len() - 1;
        if feed.buf.len() > keep {
            let take = feed.buf.len() - keep;
            size += take as u64;
            if size > limits.upload_max {
                return Err(HttpError::PayloadTooLarge("Upload exceeds limit".into()));
            }
            let data: Vec<u8> = feed.buf.drain(..take).collect();
            file.write_all(&data)
                .await
                .map_err(|e| HttpError::Internal(format!("Temp file write failed: {e}")))?;
        }
        if !feed.fill().await? {
            return Err(HttpError::BadRequest("Truncated multipart part".into()));
        }
    }
}

/// Parse a part's sub-header block into (field name, filename, mime).
fn parse_part_headers(block: &str) -> Result<(String, Option<String>, String), HttpError> {
    let mut name = None;
    let mut filename = None;
    let mut mime = "application/octet-stream".to_string();

    for line in block.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else { continue };
        match key.trim().to_ascii_lowercase().as_str() {
            "content-disposition" => {
                for attr in value.split(';').map(str::trim) {
                    if let Some(v) = attr.strip_prefix("name=") {
                        name = Some(v.trim_matches('"').to_string());
                    } else if let Some(v) = attr.strip_prefix("filename=") {
                        filename = Some(v.trim_matches('"').to_string());
                    }
                }
            }
            "content-type" => mime = value.trim().to_string(),
            _ => {}
        }
    }

    let name = name.ok_or_else(|| {
        HttpError::BadRequest("Multipart part without a content-disposition name".into())
    })?;
    Ok((name, filename, mime))
}
