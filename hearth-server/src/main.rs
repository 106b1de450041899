// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Hearth — small multi-tenant HTTP/HTTPS hosting runtime
//
//  One process: proxy front-ends terminate TLS once and route by Host
//  to per-site backends, each running its own middleware pipeline over
//  shared stores, tokens, and counters.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use clap::Parser;
use hearth_auth::{Throttle, TokenService};
use hearth_core::config::Config;
use hearth_notify::{Mailer, Texter};
use hearth_observability::{Scribe, Stats};
use hearth_proxy::Proxy;
use hearth_site::{build_sites, Shared};
use hearth_store::Store;
use hearth_ware::{register_builtin, WareRegistry};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "hearth", version, about = "Hearth — multi-tenant hosting runtime")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides the configured scribe level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref().and_then(|p| p.to_str()))?;

    let level = cli.log_level.clone().unwrap_or_else(|| config.scribe.level.clone());
    let scribe = Scribe::init(&level);

    info!(version = env!("CARGO_PKG_VERSION"), "Hearth starting");

    tokio::fs::create_dir_all(&config.temp_dir).await?;

    // ── Process-wide services ──
    let client = reqwest::Client::new();
    let stats = Arc::new(Stats::new());
    let throttle = Arc::new(Throttle::new());
    let tokens = Arc::new(TokenService::new(config.secret.as_deref()));
    let mailer = Arc::new(Mailer::new(client.clone(), config.mail.clone()));
    let texter = Arc::new(Texter::new(client, config.sms.clone()));

    // ── Shared databases; a broken shared store is fatal ──
    let mut shared_stores = HashMap::new();
    for (name, db_cfg) in &config.databases {
        shared_stores.insert(name.clone(), Store::open(name, db_cfg)?);
    }

    let shared = Shared {
        stores: shared_stores,
        headers: config.headers.clone(),
        tokens,
        throttle,
        stats: Arc::clone(&stats),
        scribe,
        mailer,
        texter,
        temp_dir: config.temp_dir.clone(),
    };

    // ── Middleware registry ──
    let mut registry = WareRegistry::new();
    register_builtin(&mut registry);
    info!(handlers = ?registry.list(), "Middleware registered");

    // ── Sites: each on its own task; one failing site never takes the
    //    process down ──
    let sites = build_sites(&config, &shared, &registry);
    if sites.is_empty() && !config.sites.is_empty() {
        anyhow::bail!("no site started successfully");
    }
    let mut all_stores: Vec<Arc<Store>> = Vec::new();
    for site in &sites {
        for store in site.scope().stores.values() {
            if !all_stores.iter().any(|s| Arc::ptr_eq(s, store)) {
                all_stores.push(Arc::clone(store));
            }
        }
        let site = Arc::clone(site);
        tokio::spawn(async move {
            if let Err(e) = site.run().await {
                error!(error = %e, "Site listener failed");
            }
        });
    }

    // ── Proxy front-ends ──
    for proxy_cfg in &config.proxies {
        let proxy = Arc::new(Proxy::new(proxy_cfg.clone(), &config.sites, Arc::clone(&stats)));
        tokio::spawn(async move {
            if let Err(e) = proxy.run().await {
                error!(error = %e, "Proxy listener failed");
            }
        });
    }

    info!(sites = sites.len(), proxies = config.proxies.len(), "Hearth is serving");

    shutdown_signal().await;
    info!("Shutdown signal received, flushing stores");
    for store in &all_stores {
        store.flush().await;
    }
    info!("Hearth stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
