use crate::scope::SiteScope;
use async_trait::async_trait;
use hearth_core::HttpError;
use hearth_pipeline::{BodyData, Context, Middleware, Outcome, Reply, ReplyBody};
use serde::Deserialize;
use serde_json::json;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Static-content middleware: negotiated caching and compression for GET,
/// uploads for POST.
pub struct ContentWare {
    scope: Arc<SiteScope>,
    cfg: ContentOptions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentOptions {
    pub root: PathBuf,

    /// Group gates per verb; empty lists mean open.
    #[serde(default)]
    pub auth: ContentAuth,

    /// Cache-Control value sent with every 200.
    #[serde(default = "default_cache_header")]
    pub cache_header: String,

    /// Extensions worth compressing.
    #[serde(default = "default_compress")]
    pub compress: Vec<String>,

    #[serde(default = "default_index")]
    pub index: String,

    /// Directory listings; disabled directories answer 403.
    #[serde(default)]
    pub indexing: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContentAuth {
    #[serde(default)]
    pub get: Vec<String>,
    #[serde(default)]
    pub post: Vec<String>,
}

impl ContentOptions {
    /// The default open content root appended after all configured
    /// handlers.
    pub fn open(root: PathBuf) -> Self {
        Self {
            root,
            auth: ContentAuth::default(),
            cache_header: default_cache_header(),
            compress: default_compress(),
            index: default_index(),
            indexing: false,
        }
    }
}

fn default_cache_header() -> String {
    "max-age=600".to_string()
}

fn default_compress() -> Vec<String> {
    ["html", "css", "js", "json", "svg", "txt", "xml", "md"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_index() -> String {
    "index.html".to_string()
}

impl ContentWare {
    pub fn new(scope: Arc<SiteScope>, cfg: ContentOptions) -> Self {
        Self { scope, cfg }
    }

    fn gate(&self, ctx: &Context, groups: &[String]) -> Result<(), HttpError> {
        if groups.is_empty() {
            return Ok(());
        }
        let allowed: Vec<&str> = groups.iter().map(|s| s.as_str()).collect();
        if ctx.authorized(&allowed) {
            Ok(())
        } else {
            Err(HttpError::Unauthorized("Not authorized for this content".into()))
        }
    }

    fn compressible(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .map(|e| self.cfg.compress.iter().any(|c| *c == e))
            .unwrap_or(false)
    }

    async fn serve(&self, ctx: &mut Context) -> Result<Outcome, HttpError> {
        self.gate(ctx, &self.cfg.auth.get)?;

        let mut path = resolve_safe(&self.cfg.root, &ctx.request.url.pathname)?;
        let Ok(meta) = tokio::fs::symlink_metadata(&path).await else {
            return Ok(Outcome::Next);
        };
        if meta.file_type().is_symlink() {
            return Ok(Outcome::Next);
        }

        if meta.is_dir() {
            let index = path.join(&self.cfg.index);
            match tokio::fs::symlink_metadata(&index).await {
                Ok(m) if m.is_file() => path = index,
                _ if self.cfg.indexing => return self.listing(&path).await,
                _ => return Err(HttpError::Forbidden("Directory listing disabled".into())),
            }
        }

        let compressible = self.compressible(&path);
        let entry = self
            .scope
            .cache
            .fetch(&path, &ctx.request.url.pathname, compressible)
            .await
            .map_err(HttpError::from)?;

        // Conditional GET: a matching validator short-circuits to 304.
        let if_none_match = ctx.request.header("if-none-match");
        let not_modified = match if_none_match {
            Some(inm) => entry.matches_etag(inm),
            None => ctx
                .request
                .header("if-modified-since")
                .map(|ims| entry.unmodified_since(ims))
                .unwrap_or(false),
        };

        ctx.set_header("cache-control", &self.cfg.cache_header);
        ctx.set_header("last-modified", &entry.last_modified());

        if not_modified {
            ctx.set_header("etag", &entry.etag_strong());
            return Ok(Outcome::Reply(Reply::status(304)));
        }

        let accepts_gzip = ctx
            .request
            .header("accept-encoding")
            .map(|v| v.to_ascii_lowercase().contains("gzip"))
            .unwrap_or(false);

        if entry.buffered() {
            let (data, gzipped) = match (&entry.gzip, accepts_gzip) {
                (Some(gz), true) => (gz.clone(), true),
                _ => (entry.raw.clone().unwrap_or_default(), false),
            };
            if gzipped {
                ctx.set_header("content-encoding", "gzip");
                ctx.set_header("etag", &entry.etag_gzip());
            } else {
                ctx.set_header("etag", &entry.etag_strong());
            }
            return Ok(Outcome::Reply(Reply {
                status: 200,
                headers: Vec::new(),
                body: ReplyBody::Bytes { content_type: entry.mime.clone(), data },
            }));
        }

        // Streaming plan for large files.
        let gzip = accepts_gzip && compressible;
        if gzip {
            ctx.set_header("content-encoding", "gzip");
        }
        ctx.set_header("etag", &entry.etag_weak());
        Ok(Outcome::Reply(Reply {
            status: 200,
            headers: Vec::new(),
            body: ReplyBody::Stream {
                path: entry.abs_path.clone(),
                len: entry.size,
                content_type: entry.mime.clone(),
                gzip,
            },
        }))
    }

    async fn listing(&self, dir: &Path) -> Result<Outcome, HttpError> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await.map_err(HttpError::from)?;
        while let Some(entry) = entries.next_entry().await.map_err(HttpError::from)? {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(Outcome::Payload(json!(names)))
    }

    async fn upload(&self, ctx: &mut Context) -> Result<Outcome, HttpError> {
        self.gate(ctx, &self.cfg.auth.post)?;

        let BodyData::Multipart { fields, files } = &ctx.request.body else {
            return Err(HttpError::BadRequest("Upload body required".into()));
        };
        if files.is_empty() {
            return Err(HttpError::BadRequest("No files in upload".into()));
        }

        let force = fields.get("force").map(|v| v == "true" || v == "1").unwrap_or(false);
        let backup = fields.get("backup").filter(|v| !v.is_empty()).cloned();
        let folder = fields.get("folder").cloned().unwrap_or_default();

        let mut dir = resolve_safe(&self.cfg.root, &ctx.request.url.pathname)?;
        if !folder.is_empty() {
            dir = resolve_safe(&dir, &folder)?;
        }
        tokio::fs::create_dir_all(&dir).await.map_err(HttpError::from)?;

        let mut report = Vec::with_capacity(files.len());
        for file in files {
            let Some(name) = file
                .filename
                .as_deref()
                .and_then(|f| Path::new(f).file_name())
                .map(|n| n.to_os_string())
            else {
                report.push(json!({"filename": file.filename, "op": "skipped"}));
                continue;
            };
            let dest = dir.join(&name);

            let exists = tokio::fs::try_exists(&dest).await.unwrap_or(false);
            let mut op = "saved";
            if exists {
                match &backup {
                    Some(backup_name) => {
                        let sibling = dir.join(backup_name);
                        tokio::fs::copy(&dest, &sibling).await.map_err(HttpError::from)?;
                        op = "backed-up";
                    }
                    None if force => {}
                    None => {
                        report.push(json!({
                            "filename": name.to_string_lossy(),
                            "op": "skipped",
                        }));
                        continue;
                    }
                }
            }

            tokio::fs::copy(&file.temp_file, &dest).await.map_err(HttpError::from)?;
            tracing::info!(dest = %dest.display(), bytes = file.size, "Upload stored");
            report.push(json!({"filename": name.to_string_lossy(), "op": op, "size": file.size}));
        }

        Ok(Outcome::Payload(json!(report)))
    }
}

#[async_trait]
impl Middleware for ContentWare {
    async fn handle(&self, ctx: &mut Context) -> Result<Outcome, HttpError> {
        match ctx.request.verb().as_str() {
            "get" | "head" => self.serve(ctx).await,
            "post" => self.upload(ctx).await,
            _ => Err(HttpError::MethodNotAllowed),
        }
    }
}

/// Resolve a request path strictly under `root`. Rejects any `..`
/// traversal; the result is always a descendant of `root`.
pub fn resolve_safe(root: &Path, request_path: &str) -> Result<PathBuf, HttpError> {
    let mut out = root.to_path_buf();
    for component in Path::new(request_path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return Err(HttpError::Forbidden("Path traversal rejected".into())),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{scope_with, test_ctx};
    use hearth_pipeline::UploadedFile;

    fn ware_at(root: &Path) -> ContentWare {
        ContentWare::new(scope_with(json!({})), ContentOptions::open(root.to_path_buf()))
    }

    // ── Path safety ─────────────────────────────────────────────

    #[test]
    fn resolve_safe_stays_under_root() {
        let root = Path::new("/srv/site");
        assert_eq!(resolve_safe(root, "/a/b.html").unwrap(), root.join("a/b.html"));
        assert_eq!(resolve_safe(root, "/./a").unwrap(), root.join("a"));
        assert!(resolve_safe(root, "/../etc/passwd").is_err());
        assert!(resolve_safe(root, "/a/../../b").is_err());
    }

    // ── GET ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn serves_file_with_etag_and_cache_headers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("page.html"), "<h1>hi</h1>").unwrap();
        let ware = ware_at(dir.path());

        let mut ctx = test_ctx("GET", "/page.html", vec![]);
        let outcome = ware.handle(&mut ctx).await.unwrap();
        match outcome {
            Outcome::Reply(reply) => {
                assert_eq!(reply.status, 200);
                match reply.body {
                    ReplyBody::Bytes { content_type, data } => {
                        assert_eq!(content_type, "text/html");
                        assert_eq!(data.as_ref(), b"<h1>hi</h1>");
                    }
                    other => panic!("unexpected body {other:?}"),
                }
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(ctx.headers.iter().any(|(k, _)| k == "etag"));
        assert!(ctx.headers.iter().any(|(k, _)| k == "last-modified"));
        assert!(ctx.headers.contains(&("cache-control".to_string(), "max-age=600".to_string())));
    }

    #[tokio::test]
    async fn matching_etag_returns_304() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("page.html"), "<h1>hi</h1>").unwrap();
        let ware = ware_at(dir.path());

        let mut first = test_ctx("GET", "/page.html", vec![]);
        ware.handle(&mut first).await.unwrap();
        let etag = first.headers.iter().find(|(k, _)| k == "etag").unwrap().1.clone();

        let mut second = test_ctx("GET", "/page.html", vec![("if-none-match", &etag)]);
        match ware.handle(&mut second).await.unwrap() {
            Outcome::Reply(reply) => {
                assert_eq!(reply.status, 304);
                assert!(matches!(reply.body, ReplyBody::Empty));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn gzip_served_only_when_accepted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.js"), "console.log('x');".repeat(10)).unwrap();
        let ware = ware_at(dir.path());

        let mut plain = test_ctx("GET", "/app.js", vec![]);
        ware.handle(&mut plain).await.unwrap();
        assert!(!plain.headers.iter().any(|(k, _)| k == "content-encoding"));

        let mut gz = test_ctx("GET", "/app.js", vec![("accept-encoding", "gzip, br")]);
        ware.handle(&mut gz).await.unwrap();
        assert!(gz.headers.contains(&("content-encoding".to_string(), "gzip".to_string())));
        let etag = &gz.headers.iter().find(|(k, _)| k == "etag").unwrap().1;
        assert!(etag.ends_with("-gz\""));
    }

    #[tokio::test]
    async fn missing_file_delegates_to_next_route() {
        let dir = tempfile::tempdir().unwrap();
        let ware = ware_at(dir.path());
        let mut ctx = test_ctx("GET", "/absent.html", vec![]);
        assert!(matches!(ware.handle(&mut ctx).await.unwrap(), Outcome::Next));
    }

    #[tokio::test]
    async fn directory_without_index_is_403_unless_listing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/a.txt"), "a").unwrap();

        let ware = ware_at(dir.path());
        let mut ctx = test_ctx("GET", "/docs", vec![]);
        assert_eq!(ware.handle(&mut ctx).await.unwrap_err().code(), 403);

        let mut cfg = ContentOptions::open(dir.path().to_path_buf());
        cfg.indexing = true;
        let listing = ContentWare::new(scope_with(json!({})), cfg);
        let mut ctx = test_ctx("GET", "/docs", vec![]);
        match listing.handle(&mut ctx).await.unwrap() {
            Outcome::Payload(v) => assert_eq!(v, json!(["a.txt"])),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn directory_with_index_serves_it() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "home").unwrap();
        let ware = ware_at(dir.path());
        let mut ctx = test_ctx("GET", "/", vec![]);
        match ware.handle(&mut ctx).await.unwrap() {
            Outcome::Reply(reply) => match reply.body {
                ReplyBody::Bytes { data, .. } => assert_eq!(data.as_ref(), b"home"),
                other => panic!("unexpected body {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_delegates_to_next_route() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("real.txt"), "x").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("link.txt"))
            .unwrap();
        let ware = ware_at(dir.path());
        let mut ctx = test_ctx("GET", "/link.txt", vec![]);
        assert!(matches!(ware.handle(&mut ctx).await.unwrap(), Outcome::Next));
    }

    #[tokio::test]
    async fn auth_gate_rejects_unauthorized_get() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("secret.html"), "s").unwrap();
        let mut cfg = ContentOptions::open(dir.path().to_path_buf());
        cfg.auth.get = vec!["staff".into()];
        let ware = ContentWare::new(scope_with(json!({})), cfg);
        let mut ctx = test_ctx("GET", "/secret.html", vec![]);
        assert_eq!(ware.handle(&mut ctx).await.unwrap_err().code(), 401);
    }

    // ── POST uploads ────────────────────────────────────────────

    fn upload_ctx(
        dir: &Path,
        fields: &[(&str, &str)],
        name: &str,
        content: &[u8],
    ) -> hearth_pipeline::Context {
        let temp = dir.join("upload-src.tmp");
        std::fs::write(&temp, content).unwrap();
        let mut ctx = test_ctx("POST", "/files", vec![]);
        ctx.request.body = BodyData::Multipart {
            fields: fields.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            files: vec![UploadedFile {
                filename: Some(name.to_string()),
                mime: "text/plain".into(),
                temp_file: temp,
                size: content.len() as u64,
            }],
        };
        ctx
    }

    #[tokio::test]
    async fn upload_writes_file_under_root() {
        let root = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let ware = ware_at(root.path());

        let mut ctx = upload_ctx(staging.path(), &[], "note.txt", b"hello");
        let Outcome::Payload(report) = ware.handle(&mut ctx).await.unwrap() else { panic!() };
        assert_eq!(report[0]["op"], "saved");
        assert_eq!(std::fs::read(root.path().join("files/note.txt")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn existing_file_is_skipped_without_force() {
        let root = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("files")).unwrap();
        std::fs::write(root.path().join("files/note.txt"), b"old").unwrap();
        let ware = ware_at(root.path());

        let mut ctx = upload_ctx(staging.path(), &[], "note.txt", b"new");
        let Outcome::Payload(report) = ware.handle(&mut ctx).await.unwrap() else { panic!() };
        assert_eq!(report[0]["op"], "skipped");
        assert_eq!(std::fs::read(root.path().join("files/note.txt")).unwrap(), b"old");

        let mut ctx = upload_ctx(staging.path(), &[("force", "true")], "note.txt", b"new");
        let Outcome::Payload(report) = ware.handle(&mut ctx).await.unwrap() else { panic!() };
        assert_eq!(report[0]["op"], "saved");
        assert_eq!(std::fs::read(root.path().join("files/note.txt")).unwrap(), b"new");
    }

    #[tokio::test]
    async fn backup_copies_existing_before_overwrite() {
        let root = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("files")).unwrap();
        std::fs::write(root.path().join("files/note.txt"), b"old").unwrap();
        let ware = ware_at(root.path());

        let mut ctx = upload_ctx(staging.path(), &[("backup", "note.txt.bak")], "note.txt", b"new");
        let Outcome::Payload(report) = ware.handle(&mut ctx).await.unwrap() else { panic!() };
        assert_eq!(report[0]["op"], "backed-up");
        assert_eq!(std::fs::read(root.path().join("files/note.txt")).unwrap(), b"new");
        assert_eq!(std::fs::read(root.path().join("files/note.txt.bak")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn upload_filename_is_sanitized_to_basename() {
        let root = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let ware = ware_at(root.path());
        let mut ctx = upload_ctx(staging.path(), &[], "../../evil.txt", b"x");
        ware.handle(&mut ctx).await.unwrap();
        assert!(root.path().join("files/evil.txt").exists());
        assert!(!root.path().parent().unwrap().join("evil.txt").exists());
    }
}
