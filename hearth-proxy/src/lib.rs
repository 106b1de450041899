//! The front-end proxy: one TCP port per proxy config, optional TLS
//! termination with hot certificate reload, Host-header routing to site
//! backends, WebSocket passthrough, and probe/blacklist accounting.

pub mod conn;
pub mod tls;

use hearth_core::config::{Config, ProxyConfig, SiteConfig};
use hearth_observability::Stats;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

pub struct Proxy {
    pub name: String,
    cfg: ProxyConfig,
    /// Exact lowercase hostname → backend address.
    hosts: HashMap<String, String>,
    /// Wildcard suffixes (`*.suffix` with the star stripped) → backend.
    wildcards: Vec<(String, String)>,
    stats: Arc<Stats>,
}

impl Proxy {
    /// Build the host table from the proxy's site list: every site's
    /// host and aliases map to that site's backend address.
    pub fn new(cfg: ProxyConfig, sites: &HashMap<String, SiteConfig>, stats: Arc<Stats>) -> Self {
        let mut hosts = HashMap::new();
        let mut wildcards = Vec::new();

        for tag in &cfg.sites {
            let Some(site) = sites.get(tag) else {
                tracing::warn!(proxy = %cfg.name, site = %tag, "Proxy references unknown site");
                continue;
            };
            let backend = Config::backend_addr(site);
            for name in std::iter::once(&site.host).chain(site.aliases.iter()) {
                let name = name.to_ascii_lowercase();
                match name.strip_prefix("*.") {
                    Some(suffix) => wildcards.push((suffix.to_string(), backend.clone())),
                    None => {
                        hosts.insert(name, backend.clone());
                    }
                }
            }
        }

        Self { name: cfg.name.clone(), cfg, hosts, wildcards, stats }
    }

    /// Host lookup: exact match first, then wildcard one label up.
    pub fn route(&self, host: &str) -> Option<&str> {
        let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
        if let Some(backend) = self.hosts.get(&host) {
            return Some(backend);
        }
        let suffix = host.split_once('.')?.1;
        self.wildcards.iter().find(|(s, _)| s == suffix).map(|(_, b)| b.as_str())
    }

    /// Account for a request that matched no host. Private callers stay
    /// quiet unless the proxy is verbose; everyone else lands in the
    /// probe and blacklist counters.
    pub fn note_miss(&self, ip: &IpAddr, host: &str) {
        if is_private(ip) && !self.cfg.verbose {
            return;
        }
        self.stats.inc("proxy", "probes");
        self.stats.inc("blacklist", &ip.to_string());
        tracing::warn!(proxy = %self.name, ip = %ip, host, "Unrouted probe");
    }

    pub fn note_served(&self) {
        self.stats.inc("proxy", "served");
    }

    pub fn note_error(&self) {
        self.stats.inc("proxy", "errors");
    }

    /// Bind the listener and serve. TLS proxies terminate once at the
    /// edge and forward plain HTTP to the site backends.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.cfg.bind, self.cfg.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        let acceptor = match &self.cfg.tls {
            Some(files) => {
                let bundle = tls::CertBundle::load(&files.cert, &files.key)?;
                bundle.spawn_watcher()?;
                Some(TlsAcceptor::from(bundle.server_config()))
            }
            None => None,
        };

        tracing::info!(
            proxy = %self.name,
            addr = %addr,
            tls = acceptor.is_some(),
            hosts = self.hosts.len(),
            "Proxy listening"
        );

        loop {
            let (stream, peer) = listener.accept().await?;
            let proxy = Arc::clone(&self);
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => conn::handle(proxy, tls_stream, peer, true).await,
                        Err(e) => {
                            tracing::debug!(proxy = %proxy.name, peer = %peer, error = %e, "TLS handshake failed");
                        }
                    },
                    None => conn::handle(proxy, stream, peer, false).await,
                }
            });
        }
    }
}

/// RFC1918, loopback, and link-local callers are "ours".
fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let nets = [
                "10.0.0.0/8",
                "172.16.0.0/12",
                "192.168.0.0/16",
                "127.0.0.0/8",
                "169.254.0.0/16",
            ];
            nets.iter().any(|net| {
                net.parse::<ipnet::Ipv4Net>().expect("static network literal").contains(v4)
            })
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || ["fe80::/10", "fc00::/7"].iter().any(|net| {
                    net.parse::<ipnet::Ipv6Net>().expect("static network literal").contains(v6)
                })
        }
    }
}
