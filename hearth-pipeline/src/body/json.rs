//! Streaming JSON parser that intercepts `data:<mime>;base64,` payloads
//! embedded in string values.
//!
//! JSON text accumulates in memory (bounded by `request_max`); each data
//! URL's base64 payload is decoded on the fly into a temp file (bounded by
//! `upload_max`) and the whole string is replaced in the accumulator by a
//! `{size, tag, tempFile, mime, encoding}` stub object. Decoder alignment
//! is kept across chunks by carrying up to three base64 characters.

use super::{temp_path, BodyLimits};
use crate::context::BodyData;
use crate::http::BodyReader;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use hearth_core::HttpError;
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWriteExt};

enum State {
    /// Outside any string.
    Json,
    /// Inside an ordinary string.
    Str,
    /// Inside a string, right after a backslash.
    StrEscape,
    /// Just opened a string; buffering while it could still be a data URL.
    Probe,
    /// Streaming a base64 payload to disk.
    Payload,
}

enum Probe {
    Partial,
    Complete,
    Mismatch,
}

pub async fn parse<S>(
    reader: &mut BodyReader<'_, S>,
    limits: &BodyLimits,
    temp_dir: &Path,
    temp_files: &mut Vec<PathBuf>,
) -> Result<BodyData, HttpError>
where
    S: AsyncRead + Unpin,
{
    let mut scanner = Scanner::new(limits, temp_dir);
    while let Some(chunk) = reader.chunk().await? {
        scanner.push(&chunk, temp_files).await?;
    }
    scanner.finish().await
}

struct Scanner<'a> {
    limits: &'a BodyLimits,
    temp_dir: &'a Path,
    state: State,
    acc: Vec<u8>,
    probe: Vec<u8>,
    b64: String,
    file: Option<tokio::fs::File>,
    file_path: PathBuf,
    file_size: u64,
    mime: String,
}

impl<'a> Scanner<'a> {
    fn new(limits: &'a BodyLimits, temp_dir: &'a Path) -> Self {
        Self {
            limits,
            temp_dir,
            state: State::Json,
            acc: Vec::new(),
            probe: Vec::new(),
            b64: String::new(),
            file: None,
            file_path: PathBuf::new(),
            file_size: 0,
            mime: String::new(),
        }
    }

    async fn push(&mut self, chunk: &[u8], temp_files: &mut Vec<PathBuf>) -> Result<(), HttpError> {
        for &byte in chunk {
            match self.state {
                State::Json => {
                    if byte == b'"' {
                        self.probe.clear();
                        self.state = State::Probe;
                    } else {
                        self.acc.push(byte);
                    }
                }
                State::Str => {
                    self.acc.push(byte);
                    match byte {
                        b'"' => self.state = State::Json,
                        b'\\' => self.state = State::StrEscape,
                        _ => {}
                    }
                }
                State::StrEscape => {
                    self.acc.push(byte);
                    self.state = State::Str;
                }
                State::Probe => match byte {
                    b'"' => {
                        // Short plain string, never a data URL.
                        self.flush_probe();
                        self.acc.push(b'"');
                        self.state = State::Json;
                    }
                    b'\\' => {
                        self.flush_probe();
                        self.acc.push(b'\\');
                        self.state = State::StrEscape;
                    }
                    _ => {
                        self.probe.push(byte);
                        match probe_status(&self.probe) {
                            Probe::Partial => {}
                            Probe::Complete => {
                                self.begin_payload(temp_files).await?;
                            }
                            Probe::Mismatch => {
                                self.flush_probe();
                                self.state = State::Str;
                            }
                        }
                    }
                },
                State::Payload => match byte {
                    b'"' => self.end_payload().await?,
                    b'\\' => {
                        self.abort_file().await;
                        return Err(HttpError::BadRequest(
                            "Escape sequence inside base64 payload".into(),
                        ));
                    }
                    b' ' | b'\r' | b'\n' | b'\t' => {}
                    _ => self.b64.push(byte as char),
                },
            }
        }

        // Keep alignment: decode only whole quads, carry the remainder.
        if matches!(self.state, State::Payload) {
            let quads = self.b64.len() - self.b64.len() % 4;
            if quads > 0 {
                let ready: String = self.b64.drain(..quads).collect();
                self.write_decoded(&ready, false).await?;
            }
        }

        if self.acc.len() as u64 > self.limits.request_max {
            self.abort_file().await;
            return Err(HttpError::PayloadTooLarge("Request body exceeds limit".into()));
        }
        Ok(())
    }

    async fn finish(mut self) -> Result<BodyData, HttpError> {
        if !matches!(self.state, State::Json) {
            self.abort_file().await;
            return Err(HttpError::BadRequest("Unterminated JSON body".into()));
        }
        let text = String::from_utf8(self.acc)
            .map_err(|_| HttpError::BadRequest("JSON body is not valid UTF-8".into()))?;
        let value = serde_json::from_str(&text)
            .map_err(|e| HttpError::BadRequest(format!("Invalid JSON: {e}")))?;
        Ok(BodyData::Json(value))
    }

    fn flush_probe(&mut self) {
        self.acc.push(b'"');
        self.acc.append(&mut self.probe);
    }

    async fn begin_payload(&mut self, temp_files: &mut Vec<PathBuf>) -> Result<(), HttpError> {
        // probe holds `data:<mime>;base64,`
        let text = String::from_utf8_lossy(&self.probe);
        self.mime = text
            .strip_prefix("data:")
            .and_then(|rest| rest.split(';').next())
            .unwrap_or("")
            .to_string();
        self.probe.clear();

        self.file_path = temp_path(self.temp_dir);
        temp_files.push(self.file_path.clone());
        let file = tokio::fs::File::create(&self.file_path)
            .await
            .map_err(|e| HttpError::Internal(format!("Temp file create failed: {e}")))?;
        self.file = Some(file);
        self.file_size = 0;
        self.b64.clear();
        self.state = State::Payload;
        Ok(())
    }

    async fn write_decoded(&mut self, b64: &str, last: bool) -> Result<(), HttpError> {
        let decoded = if last {
            STANDARD_NO_PAD.decode(b64.trim_end_matches('='))
        } else {
            STANDARD.decode(b64)
        };
        let bytes = match decoded {
            Ok(bytes) => bytes,
            Err(_) => {
                self.abort_file().await;
                return Err(HttpError::BadRequest("Invalid base64 payload".into()));
            }
        };

        self.file_size += bytes.len() as u64;
        if self.file_size > self.limits.upload_max {
            self.abort_file().await;
            return Err(HttpError::PayloadTooLarge("Upload exceeds limit".into()));
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(&bytes)
                .await
                .map_err(|e| HttpError::Internal(format!("Temp file write failed: {e}")))?;
        }
        Ok(())
    }

    async fn end_payload(&mut self) -> Result<(), HttpError> {
        let remainder: String = std::mem::take(&mut self.b64);
        if !remainder.is_empty() {
            self.write_decoded(&remainder, true).await?;
        }
        if let Some(mut file) = self.file.take() {
            file.flush().await.map_err(|e| HttpError::Internal(e.to_string()))?;
        }

        let tag = self
            .file_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let stub = json!({
            "size": self.file_size,
            "tag": tag,
            "tempFile": self.file_path.to_string_lossy(),
            "mime": self.mime,
            "encoding": "base64",
        });
        self.acc.extend_from_slice(stub.to_string().as_bytes());
        self.state = State::Json;
        Ok(())
    }

    async fn abort_file(&mut self) {
        if self.file.take().is_some() {
            let _ = tokio::fs::remove_file(&self.file_path).await;
        }
    }
}

/// Is the buffered string-start still (or exactly) a data-URL marker?
fn probe_status(probe: &[u8]) -> Probe {
    const MARKER: &[u8] = b"data:";
    const SUFFIX: &[u8] = b"base64,";

    if probe.len() <= MARKER.len() {
        return if MARKER.starts_with(probe) { Probe::Partial } else { Probe::Mismatch };
    }
    if probe.len() > 160 {
        return Probe::Mismatch;
    }

    let rest = &probe[MARKER.len()..];
    match rest.iter().position(|&b| b == b';') {
        Some(semi) => {
            let mime_ok = rest[..semi]
                .iter()
                .all(|&b| b.is_ascii_alphanumeric() || b"/+.-".contains(&b));
            if !mime_ok {
                return Probe::Mismatch;
            }
            let after = &rest[semi + 1..];
            if after.len() < SUFFIX.len() {
                if SUFFIX.starts_with(after) { Probe::Partial } else { Probe::Mismatch }
            } else if after == SUFFIX {
                Probe::Complete
            } else {
                Probe::Mismatch
            }
        }
        None => {
            let mime_ok =
                rest.iter().all(|&b| b.is_ascii_alphanumeric() || b"/+.-".contains(&b));
            if mime_ok { Probe::Partial } else { Probe::Mismatch }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;

    const LIMITS: BodyLimits = BodyLimits { request_max: 64 * 1024, upload_max: 4096 };

    async fn run_chunked(
        body: &[u8],
        chunk_size: usize,
        dir: &Path,
    ) -> (Result<BodyData, HttpError>, Vec<PathBuf>) {
        let mut scanner = Scanner::new(&LIMITS, dir);
        let mut temp_files = Vec::new();
        for chunk in body.chunks(chunk_size) {
            if let Err(e) = scanner.push(chunk, &mut temp_files).await {
                return (Err(e), temp_files);
            }
        }
        (scanner.finish().await, temp_files)
    }

    fn json_of(body: BodyData) -> serde_json::Value {
        match body {
            BodyData::Json(v) => v,
            other => panic!("expected json, got {other:?}"),
        }
    }

    // ── Plain JSON passes through ───────────────────────────────

    #[tokio::test]
    async fn plain_json_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let body = br#"{"name": "al\"ice", "n": [1, 2, 3], "note": "dat is fine"}"#;
        let (result, files) = run_chunked(body, 7, dir.path()).await;
        let v = json_of(result.unwrap());
        assert_eq!(v["name"], "al\"ice");
        assert_eq!(v["n"][2], 3);
        assert_eq!(v["note"], "dat is fine");
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn string_starting_like_marker_but_not_matching_passes() {
        let dir = tempfile::tempdir().unwrap();
        let body = br#"{"a": "data:text only", "b": "database"}"#;
        let v = json_of(run_chunked(body, 3, dir.path()).await.0.unwrap());
        assert_eq!(v["a"], "data:text only");
        assert_eq!(v["b"], "database");
    }

    // ── Data URLs ───────────────────────────────────────────────

    #[tokio::test]
    async fn data_url_is_replaced_by_stub_and_streamed() {
        let dir = tempfile::tempdir().unwrap();
        let payload = b"hello file contents";
        let body = format!(
            r#"{{"doc": "data:text/plain;base64,{}", "other": 1}}"#,
            STANDARD.encode(payload)
        );

        for chunk_size in [1, 3, 5, 64, body.len()] {
            let (result, files) = run_chunked(body.as_bytes(), chunk_size, dir.path()).await;
            let v = json_of(result.unwrap());
            assert_eq!(v["other"], 1);
            assert_eq!(v["doc"]["mime"], "text/plain");
            assert_eq!(v["doc"]["encoding"], "base64");
            assert_eq!(v["doc"]["size"], payload.len());
            let temp = PathBuf::from(v["doc"]["tempFile"].as_str().unwrap());
            assert_eq!(std::fs::read(&temp).unwrap(), payload);
            assert_eq!(files, vec![temp]);
        }
    }

    #[tokio::test]
    async fn unpadded_base64_decodes() {
        let dir = tempfile::tempdir().unwrap();
        // "ab" encodes to "YWI="; strip the padding.
        let body = br#"{"f": "data:application/octet-stream;base64,YWI"}"#;
        let v = json_of(run_chunked(body, 4, dir.path()).await.0.unwrap());
        let temp = PathBuf::from(v["f"]["tempFile"].as_str().unwrap());
        assert_eq!(std::fs::read(&temp).unwrap(), b"ab");
    }

    #[tokio::test]
    async fn oversized_payload_is_413_and_partial_file_is_unlinked() {
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![9u8; 8192]; // above upload_max
        let body = format!(r#"{{"f": "data:application/zip;base64,{}"}}"#, STANDARD.encode(&payload));
        let (result, files) = run_chunked(body.as_bytes(), 1024, dir.path()).await;
        assert_eq!(result.unwrap_err().code(), 413);
        assert_eq!(files.len(), 1);
        assert!(!files[0].exists(), "partial temp file must be unlinked");
    }

    #[tokio::test]
    async fn invalid_base64_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let body = br#"{"f": "data:text/plain;base64,@@@@"}"#;
        let (result, _) = run_chunked(body, 8, dir.path()).await;
        assert_eq!(result.unwrap_err().code(), 400);
    }

    #[tokio::test]
    async fn unterminated_body_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let (result, _) = run_chunked(br#"{"a": "unclosed"#, 4, dir.path()).await;
        assert_eq!(result.unwrap_err().code(), 400);
    }

    #[tokio::test]
    async fn two_data_urls_in_one_body() {
        let dir = tempfile::tempdir().unwrap();
        let body = format!(
            r#"{{"a": "data:text/plain;base64,{}", "b": "data:text/plain;base64,{}"}}"#,
            STANDARD.encode(b"one"),
            STANDARD.encode(b"two")
        );
        let (result, files) = run_chunked(body.as_bytes(), 11, dir.path()).await;
        let v = json_of(result.unwrap());
        assert_eq!(files.len(), 2);
        let a = std::fs::read(v["a"]["tempFile"].as_str().unwrap()).unwrap();
        let b = std::fs::read(v["b"]["tempFile"].as_str().unwrap()).unwrap();
        assert_eq!(a, b"one");
        assert_eq!(b, b"two");
    }
}
