//! Static-content cache keyed by absolute file path.
//!
//! Each entry carries a fingerprint tag, an HMAC over path, size, and
//! mtime, that doubles as the ETag (weak and strong forms share it).
//! Files under the buffered ceiling keep raw and gzip payloads in memory
//! with exact lengths; larger files are served streaming by the caller.

use bytes::Bytes;
use dashmap::DashMap;
use flate2::write::GzEncoder;
use flate2::Compression;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// Fixed fingerprint key: tags must agree across processes for equal
/// (path, size, mtime) inputs.
const TAG_KEY: &[u8] = b"hearth-cache-tag-v1";

/// One cached file. Immutable once published; a fingerprint change
/// replaces the whole entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub abs_path: PathBuf,
    pub url_path: String,
    pub size: u64,
    pub mtime: SystemTime,
    pub mime: String,
    /// HMAC(path + size + mtime), hex, truncated. ETag and cache key.
    pub tag: String,
    /// Raw payload; absent means streaming mode.
    pub raw: Option<Bytes>,
    /// Gzip payload, present for buffered compressible entries.
    pub gzip: Option<Bytes>,
}

impl CacheEntry {
    pub fn etag_strong(&self) -> String {
        format!("\"{}\"", self.tag)
    }

    pub fn etag_weak(&self) -> String {
        format!("W/\"{}\"", self.tag)
    }

    pub fn etag_gzip(&self) -> String {
        format!("\"{}-gz\"", self.tag)
    }

    pub fn last_modified(&self) -> String {
        httpdate::fmt_http_date(self.mtime)
    }

    /// Buffered entries serve from memory; everything else streams.
    pub fn buffered(&self) -> bool {
        self.raw.is_some()
    }

    /// Match a comma-separated `If-None-Match` list against the tag or
    /// its gzip variant. `*` matches anything.
    pub fn matches_etag(&self, if_none_match: &str) -> bool {
        if_none_match.split(',').any(|candidate| {
            let candidate = candidate
                .trim()
                .trim_start_matches("W/")
                .trim_matches('"');
            candidate == "*" || candidate == self.tag || candidate == format!("{}-gz", self.tag)
        })
    }

    /// `If-Modified-Since` comparison at one-second granularity.
    pub fn unmodified_since(&self, header: &str) -> bool {
        let Ok(since) = httpdate::parse_http_date(header) else {
            return false;
        };
        match self.mtime.duration_since(since) {
            // Modified after the header date only when strictly newer by
            // at least a second (HTTP dates have second resolution).
            Ok(newer) => newer.as_secs() == 0,
            Err(_) => true,
        }
    }
}

/// Concurrent path→entry cache with atomic replace on fingerprint change.
pub struct FileCache {
    entries: DashMap<PathBuf, Arc<CacheEntry>>,
    /// Buffered payload ceiling; files at or above stream.
    max: u64,
    /// Optional global entry cap.
    limit: Option<usize>,
}

impl FileCache {
    pub fn new(max: u64, limit: Option<usize>) -> Self {
        Self { entries: DashMap::new(), max, limit }
    }

    pub fn get(&self, path: &Path) -> Option<Arc<CacheEntry>> {
        self.entries.get(path).map(|e| Arc::clone(&e))
    }

    /// Publish an entry, replacing any previous one for the same path.
    pub fn put(&self, entry: Arc<CacheEntry>) {
        let key = entry.abs_path.clone();
        self.entries.insert(key.clone(), entry);
        self.enforce_limit(&key);
    }

    pub fn delete(&self, path: &Path) {
        self.entries.remove(path);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Return the current entry for a file, rebuilding it when absent or
    /// when the on-disk fingerprint moved. `compress` controls whether a
    /// buffered gzip payload is prepared.
    pub async fn fetch(
        &self,
        abs_path: &Path,
        url_path: &str,
        compress: bool,
    ) -> std::io::Result<Arc<CacheEntry>> {
        let meta = tokio::fs::metadata(abs_path).await?;
        let size = meta.len();
        let mtime = meta.modified()?;
        let tag = fingerprint(abs_path, size, mtime);

        if let Some(entry) = self.get(abs_path)
            && entry.tag == tag
        {
            return Ok(entry);
        }

        let mime = mime_guess::from_path(abs_path).first_or_octet_stream().to_string();
        let (raw, gzip) = if size < self.max {
            let data = Bytes::from(tokio::fs::read(abs_path).await?);
            let gzip = if compress { Some(gzip_bytes(&data)?) } else { None };
            (Some(data), gzip)
        } else {
            (None, None)
        };

        let entry = Arc::new(CacheEntry {
            abs_path: abs_path.to_path_buf(),
            url_path: url_path.to_string(),
            size,
            mtime,
            mime,
            tag,
            raw,
            gzip,
        });

        self.put(Arc::clone(&entry));
        tracing::debug!(path = %abs_path.display(), size, buffered = entry.buffered(), "Cache entry built");
        Ok(entry)
    }

    fn enforce_limit(&self, keep: &Path) {
        let Some(limit) = self.limit else { return };
        while self.entries.len() > limit {
            let victim = self
                .entries
                .iter()
                .map(|e| e.key().clone())
                .find(|k| k.as_path() != keep);
            match victim {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

/// `hmac(path + size + mtime)`, stable across processes.
pub fn fingerprint(path: &Path, size: u64, mtime: SystemTime) -> String {
    let mtime_secs = mtime
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut mac = Hmac::<Sha256>::new_from_slice(TAG_KEY).expect("hmac accepts any key size");
    mac.update(path.to_string_lossy().as_bytes());
    mac.update(size.to_string().as_bytes());
    mac.update(mtime_secs.to_string().as_bytes());
    let digest = mac.finalize().into_bytes();
    let mut hex = String::with_capacity(32);
    for byte in digest.iter().take(16) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

fn gzip_bytes(data: &[u8]) -> std::io::Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(Bytes::from(encoder.finish()?))
}
