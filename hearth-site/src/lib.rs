//! A SiteApp: one logical backend serving a set of hostnames.
//!
//! Construction merges shared and site-local databases and headers,
//! builds the route table in a fixed order (analytics → cors → account +
//! login when auth is enabled → configured handlers → default open
//! content root), and runs a keep-alive listener whose every request
//! flows through the pipeline bound to the site's scope.

use hearth_auth::{Throttle, TokenService};
use hearth_cache::FileCache;
use hearth_core::config::{Config, SiteConfig};
use hearth_core::HttpError;
use hearth_notify::{Mailer, Texter};
use hearth_observability::{Scribe, Stats};
use hearth_pipeline::body::{self, BodyLimits};
use hearth_pipeline::http::{read_head, write_response, BodyReader, ChunkedWriter, RequestHead};
use hearth_pipeline::{
    authenticate, funnel, respond, Context, Middleware, Pipeline, Reply, ReplyBody, Request, Route,
};
use hearth_store::Store;
use hearth_ware::{
    AccountWare, AnalyticsWare, ContentOptions, ContentWare, CorsWare, LoginWare, SiteScope,
    WareRegistry,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncReadExt, AsyncWriteExt};

/// Process-wide services and shared databases handed to every site.
pub struct Shared {
    pub stores: HashMap<String, Arc<Store>>,
    pub headers: HashMap<String, String>,
    pub tokens: Arc<TokenService>,
    pub throttle: Arc<Throttle>,
    pub stats: Arc<Stats>,
    pub scribe: Arc<Scribe>,
    pub mailer: Arc<Mailer>,
    pub texter: Arc<Texter>,
    pub temp_dir: PathBuf,
}

pub struct SiteApp {
    tag: String,
    scope: Arc<SiteScope>,
    pipeline: Pipeline,
    limits: BodyLimits,
    timeout: Duration,
}

impl SiteApp {
    /// Assemble a site from its config. Store-open failures are fatal to
    /// this site (the caller decides whether the process survives).
    pub fn build(
        tag: &str,
        cfg: SiteConfig,
        shared: &Shared,
        registry: &WareRegistry,
    ) -> anyhow::Result<Arc<SiteApp>> {
        // Site databases merge over the shared set.
        let mut stores = shared.stores.clone();
        for (name, db_cfg) in &cfg.databases {
            stores.insert(name.clone(), Store::open(name, db_cfg)?);
        }

        // Site headers over shared headers.
        let mut headers = shared.headers.clone();
        for (name, value) in &cfg.headers {
            headers.insert(name.clone(), value.clone());
        }

        let scope = Arc::new(SiteScope {
            name: tag.to_string(),
            cfg: SiteConfig { headers, ..cfg.clone() },
            stores,
            cache: Arc::new(FileCache::new(cfg.options.cache_max, cfg.options.cache_limit)),
            tokens: Arc::clone(&shared.tokens),
            throttle: Arc::clone(&shared.throttle),
            stats: Arc::clone(&shared.stats),
            scribe: Arc::clone(&shared.scribe),
            mailer: Arc::clone(&shared.mailer),
            texter: Arc::clone(&shared.texter),
            temp_dir: shared.temp_dir.clone(),
        });

        let routes = build_routes(&scope, registry)?;
        let pipeline =
            Pipeline::new(routes, &cfg.options.rewrites, cfg.options.redirect.as_ref());

        Ok(Arc::new(SiteApp {
            tag: tag.to_string(),
            scope,
            pipeline,
            limits: BodyLimits {
                request_max: cfg.options.request_max,
                upload_max: cfg.options.upload_max,
            },
            timeout: Duration::from_millis(cfg.options.timeout_ms),
        }))
    }

    pub fn scope(&self) -> &Arc<SiteScope> {
        &self.scope
    }

    /// Bind the site listener and serve until the task is aborted.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.scope.cfg.bind, self.scope.cfg.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(site = %self.tag, addr = %addr, host = %self.scope.cfg.host, "Site listening");

        loop {
            let (stream, peer) = listener.accept().await?;
            let site = Arc::clone(&self);
            tokio::spawn(async move {
                site.handle_connection(stream, peer).await;
            });
        }
    }

    /// Keep-alive connection loop: parse a head, process one request,
    /// repeat until close. Any per-request failure after headers have
    /// been sent only logs.
    pub async fn handle_connection<S>(self: Arc<Self>, mut stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut carry: Vec<u8> = Vec::new();
        loop {
            let head = match read_head(&mut stream, &mut carry).await {
                Ok(Some(head)) => head,
                Ok(None) => return,
                Err(e) => {
                    let reply = Reply::json(e.code(), &e.envelope());
                    let _ = write_reply(&mut stream, false, reply).await;
                    return;
                }
            };
            let keep_alive = head.keep_alive;

            let served = tokio::time::timeout(
                self.timeout,
                self.serve_one(&mut stream, &mut carry, head, &peer),
            )
            .await;

            match served {
                Ok(Ok(())) if keep_alive => continue,
                Ok(Ok(())) => return,
                Ok(Err(())) => return,
                Err(_) => {
                    tracing::warn!(site = %self.tag, peer = %peer, "Request timed out");
                    return;
                }
            }
        }
    }

    /// Process one request end to end. `Err(())` closes the connection.
    async fn serve_one<S>(
        &self,
        stream: &mut S,
        carry: &mut Vec<u8>,
        head: RequestHead,
        peer: &SocketAddr,
    ) -> Result<(), ()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let started = Instant::now();
        let is_head = head.method.eq_ignore_ascii_case("head");

        // Chunked request bodies are not accepted; bodies are framed by
        // Content-Length.
        if head
            .header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
        {
            let err = HttpError::BadRequest("Chunked request bodies are not supported".into());
            let _ = write_reply(stream, is_head, Reply::json(err.code(), &err.envelope())).await;
            return Err(());
        }

        let content_length = head.content_length().unwrap_or(0);
        let host = head.header("host").unwrap_or(&self.scope.cfg.host).to_string();
        let (url, debug) = hearth_pipeline::context::parse_url(&head.target, &host, false);

        // Proxy-forwarded address wins over the transport peer.
        let remote_ip = head
            .header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| peer.ip().to_string());

        let mut ctx = Context::new(
            Request {
                method: head.method.clone(),
                url,
                headers: head.headers.clone(),
                remote_ip,
                remote_port: peer.port(),
                content_type: head.content_type(),
                body: hearth_pipeline::BodyData::None,
            },
            debug,
        );
        for (name, value) in &self.scope.cfg.headers {
            ctx.set_header(name, value);
        }

        // Body parse, then the chain; any error lands in the funnel.
        let outcome = {
            let mut reader = BodyReader::new(stream, carry, content_length);
            let parsed = body::parse(
                &head,
                &mut reader,
                &self.limits,
                &self.scope.temp_dir,
                &mut ctx.temp_files,
            )
            .await;
            let result = match parsed {
                Ok(body_data) => {
                    ctx.request.body = body_data;
                    self.run_chain(&mut ctx).await
                }
                Err(e) => Err(e),
            };
            // Unread body bytes would corrupt the next keep-alive request.
            if reader.discard().await.is_err() {
                self.cleanup(&ctx).await;
                return Err(());
            }
            result
        };

        let reply = match outcome {
            Ok(outcome) => respond(&ctx, outcome),
            Err(e) => {
                if e.code() >= 500 {
                    tracing::error!(site = %self.tag, path = %ctx.request.url.pathname, error = %e, "Request failed");
                }
                funnel(&ctx, &e, self.pipeline.redirect.as_ref())
            }
        };

        let status = reply.status;
        let written = write_reply(stream, is_head, reply).await;
        self.cleanup(&ctx).await;

        let bytes = match written {
            Ok(n) => n,
            Err(_) => return Err(()),
        };
        tracing::debug!(
            site = %self.tag,
            method = %ctx.request.method,
            path = %ctx.request.url.pathname,
            status,
            bytes,
            ms = started.elapsed().as_millis() as u64,
            ip = %ctx.request.remote_ip,
            "Request served"
        );
        Ok(())
    }

    async fn run_chain(&self, ctx: &mut Context) -> Result<hearth_pipeline::Outcome, HttpError> {
        authenticate(
            ctx,
            self.scope.users().as_ref(),
            &self.scope.tokens,
            &self.scope.throttle,
        )
        .await?;
        self.pipeline.apply_rewrites(ctx);
        self.pipeline.dispatch(ctx).await
    }

    /// Temp files belong to the request; remove them once it is answered.
    async fn cleanup(&self, ctx: &Context) {
        for path in &ctx.temp_files {
            if tokio::fs::remove_file(path).await.is_err() && path.exists() {
                tracing::warn!(path = %path.display(), "Temp file removal failed");
            }
        }
    }
}

/// Route-table order is fixed: analytics → cors → (account + login) →
/// configured handlers → default open content root.
fn build_routes(scope: &Arc<SiteScope>, registry: &WareRegistry) -> anyhow::Result<Vec<Route>> {
    let mut routes: Vec<Route> = Vec::new();
    let route = |method: &str, pattern: &str, handler: Arc<dyn Middleware>| {
        Route::new(method, pattern, handler).map_err(|e| anyhow::anyhow!(e))
    };

    routes.push(route("any", "*", Arc::new(AnalyticsWare::new(Arc::clone(scope))))?);

    if let Some(cors) = &scope.cfg.cors {
        routes.push(route("any", "*", Arc::new(CorsWare::new(cors.clone())))?);
    }

    if scope.cfg.auth {
        let account = Arc::new(AccountWare::new(Arc::clone(scope)));
        routes.push(route("any", "/user/:action/:user?/:opt?", account)?);
        let login: Arc<dyn Middleware> = Arc::new(LoginWare::new(Arc::clone(scope)));
        routes.push(route("any", "/login", Arc::clone(&login))?);
        routes.push(route("any", "/logout", login)?);
    }

    for handler in &scope.cfg.handlers {
        let ware = registry
            .build(&handler.code, Arc::clone(scope), &handler.options)
            .map_err(|e| anyhow::anyhow!("site {}: {e}", scope.name))?;
        routes.push(route(&handler.method, &handler.route, ware)?);
    }

    if let Some(root) = &scope.cfg.root {
        let open = Arc::new(ContentWare::new(Arc::clone(scope), ContentOptions::open(root.clone())));
        routes.push(route("any", "*", open)?);
    }

    Ok(routes)
}

/// Write a reply to the stream. Returns body bytes written (the access
/// log's byte counter). HEAD requests get headers only.
async fn write_reply<S>(stream: &mut S, is_head: bool, reply: Reply) -> std::io::Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match reply.body {
        ReplyBody::Empty => {
            write_response(stream, reply.status, &reply.headers, b"", false).await
        }
        ReplyBody::Bytes { content_type, data } => {
            let mut headers = reply.headers;
            headers.push(("content-type".to_string(), content_type));
            write_response(stream, reply.status, &headers, &data, !is_head).await
        }
        ReplyBody::Stream { path, len, content_type, gzip } => {
            let mut headers = reply.headers;
            headers.push(("content-type".to_string(), content_type));

            if !gzip {
                headers.push(("content-length".to_string(), len.to_string()));
                stream
                    .write_all(&hearth_pipeline::http::encode_head(reply.status, &headers))
                    .await?;
                if is_head {
                    stream.flush().await?;
                    return Ok(0);
                }
                return stream_raw(stream, &path).await;
            }

            headers.push(("transfer-encoding".to_string(), "chunked".to_string()));
            stream
                .write_all(&hearth_pipeline::http::encode_head(reply.status, &headers))
                .await?;
            if is_head {
                stream.flush().await?;
                return Ok(0);
            }
            stream_gzip(stream, &path).await
        }
    }
}

async fn stream_raw<S>(stream: &mut S, path: &std::path::Path) -> std::io::Result<u64>
where
    S: AsyncWrite + Unpin,
{
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut written: u64 = 0;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stream.write_all(&buf[..n]).await?;
        written += n as u64;
    }
    stream.flush().await?;
    Ok(written)
}

/// Gzip-on-the-fly streaming with chunked framing.
async fn stream_gzip<S>(stream: &mut S, path: &std::path::Path) -> std::io::Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut file = tokio::fs::File::open(path).await?;
    let mut encoder = GzEncoder::new(Vec::with_capacity(64 * 1024), Compression::default());
    let mut buf = vec![0u8; 64 * 1024];
    let mut writer = ChunkedWriter::new(stream);

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        encoder.write_all(&buf[..n])?;
        let ready = encoder.get_mut();
        if !ready.is_empty() {
            let pending = std::mem::take(ready);
            writer.write_chunk(&pending).await?;
        }
    }
    let rest = encoder.finish()?;
    writer.write_chunk(&rest).await?;
    writer.finish().await
}

/// Build each configured site against the shared context. A site that
/// fails to assemble is logged as fatal for that site only.
pub fn build_sites(
    config: &Config,
    shared: &Shared,
    registry: &WareRegistry,
) -> Vec<Arc<SiteApp>> {
    let mut sites = Vec::new();
    for (tag, site_cfg) in &config.sites {
        match SiteApp::build(tag, site_cfg.clone(), shared, registry) {
            Ok(site) => sites.push(site),
            Err(e) => {
                tracing::error!(site = %tag, error = %e, "Site failed to start; other sites continue");
            }
        }
    }
    sites
}
