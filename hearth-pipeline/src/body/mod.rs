//! Content-type-dispatched body parsing with hard ceilings.
//!
//! `request_max` bounds everything held in memory, `upload_max` bounds
//! each file streamed to disk; either overflow fails the request with 413.
//! Temp files are registered with the caller as soon as they are created;
//! the pipeline removes them after the response, never the parser. A
//! parser does unlink its own partial file when it fails mid-stream.

pub mod json;
pub mod multipart;

use crate::context::{BodyData, UploadedFile};
use crate::http::{BodyReader, RequestHead};
use bytes::Bytes;
use hearth_core::HttpError;
use rand::Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWriteExt};

#[derive(Debug, Clone, Copy)]
pub struct BodyLimits {
    pub request_max: u64,
    pub upload_max: u64,
}

/// Parse the request body according to its content type.
pub async fn parse<S>(
    head: &RequestHead,
    reader: &mut BodyReader<'_, S>,
    limits: &BodyLimits,
    temp_dir: &Path,
    temp_files: &mut Vec<PathBuf>,
) -> Result<BodyData, HttpError>
where
    S: AsyncRead + Unpin,
{
    if reader.remaining() == 0 {
        return Ok(BodyData::None);
    }

    let content_type = head.content_type().unwrap_or_default();
    match content_type.as_str() {
        "application/json" => json::parse(reader, limits, temp_dir, temp_files).await,
        "multipart/form-data" => {
            let boundary = boundary_of(head.header("content-type").unwrap_or(""))
                .ok_or_else(|| HttpError::BadRequest("Multipart body without boundary".into()))?;
            multipart::parse(reader, &boundary, limits, temp_dir, temp_files).await
        }
        "application/x-www-form-urlencoded" => {
            let raw = read_all(reader, limits.request_max).await?;
            let form: HashMap<String, String> = serde_urlencoded::from_bytes(&raw)
                .map_err(|e| HttpError::BadRequest(format!("Invalid form body: {e}")))?;
            Ok(BodyData::Form(form))
        }
        "application/octet-stream" => octet(reader, limits, temp_dir, temp_files).await,
        other if other.starts_with("text/") => {
            let raw = read_all(reader, limits.request_max).await?;
            let text = String::from_utf8(raw.to_vec())
                .map_err(|_| HttpError::BadRequest("Text body is not valid UTF-8".into()))?;
            Ok(BodyData::Text(text))
        }
        other => Err(HttpError::NotImplemented(format!("Unsupported content type: {other}"))),
    }
}

/// Pull the full body into memory, bounded by `max`.
async fn read_all<S>(reader: &mut BodyReader<'_, S>, max: u64) -> Result<Bytes, HttpError>
where
    S: AsyncRead + Unpin,
{
    let mut out: Vec<u8> = Vec::new();
    while let Some(chunk) = reader.chunk().await? {
        if out.len() as u64 + chunk.len() as u64 > max {
            return Err(HttpError::PayloadTooLarge("Request body exceeds limit".into()));
        }
        out.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(out))
}

/// Stream an opaque body straight to one temp file.
async fn octet<S>(
    reader: &mut BodyReader<'_, S>,
    limits: &BodyLimits,
    temp_dir: &Path,
    temp_files: &mut Vec<PathBuf>,
) -> Result<BodyData, HttpError>
where
    S: AsyncRead + Unpin,
{
    let path = temp_path(temp_dir);
    temp_files.push(path.clone());
    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(|e| HttpError::Internal(format!("Temp file create failed: {e}")))?;

    let mut size: u64 = 0;
    while let Some(chunk) = reader.chunk().await? {
        size += chunk.len() as u64;
        if size > limits.upload_max {
            drop(file);
            let _ = tokio::fs::remove_file(&path).await;
            return Err(HttpError::PayloadTooLarge("Upload exceeds limit".into()));
        }
        file.write_all(&chunk)
            .await
            .map_err(|e| HttpError::Internal(format!("Temp file write failed: {e}")))?;
    }
    file.flush().await.map_err(|e| HttpError::Internal(e.to_string()))?;

    Ok(BodyData::Octet(UploadedFile {
        filename: None,
        mime: "application/octet-stream".to_string(),
        temp_file: path,
        size,
    }))
}

/// Random 8-char base-36 name with a `.tmp` suffix.
pub fn temp_path(dir: &Path) -> PathBuf {
    const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let name: String = (0..8).map(|_| ALPHABET[rng.gen_range(0..36)] as char).collect();
    dir.join(format!("{name}.tmp"))
}

fn boundary_of(content_type: &str) -> Option<String> {
    content_type.split(';').map(str::trim).find_map(|part| {
        part.strip_prefix("boundary=").map(|b| b.trim_matches('"').to_string())
    })
}
