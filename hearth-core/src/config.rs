use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Top-level configuration for the Hearth runtime.
///
/// One process hosts a handful of sites behind one or more proxy
/// front-ends. Shared databases and headers apply to every site unless the
/// site overrides them.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Logging configuration (the scribe).
    #[serde(default)]
    pub scribe: ScribeConfig,

    /// Token-signing secret. A random 256-bit value is generated at
    /// process start when absent.
    #[serde(default)]
    pub secret: Option<String>,

    /// Directory for streamed upload temp files.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Shared databases, available to every site.
    #[serde(default)]
    pub databases: HashMap<String, DatabaseConfig>,

    /// Default response headers, merged under site headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// SendGrid mail credentials.
    #[serde(default)]
    pub mail: Option<MailConfig>,

    /// Twilio SMS credentials.
    #[serde(default)]
    pub sms: Option<SmsConfig>,

    /// Front-end proxy listeners.
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,

    /// Site apps keyed by a short tag.
    #[serde(default)]
    pub sites: HashMap<String, SiteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScribeConfig {
    /// Default tracing filter, overridable at runtime via the `@scribe`
    /// action.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ScribeConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the backing JSON file.
    pub file: PathBuf,

    /// Read-only stores reject modification and never persist.
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    pub api_key: String,
    pub from: String,

    #[serde(default = "default_mail_endpoint")]
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from: String,

    /// Number texted when Twilio reports an undelivered message.
    #[serde(default)]
    pub callback: Option<String>,

    #[serde(default = "default_sms_endpoint")]
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub name: String,

    /// Listener port.
    pub port: u16,

    /// Bind address.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// TLS certificate and key; presence makes this an HTTPS listener.
    #[serde(default)]
    pub tls: Option<TlsFiles>,

    /// Tags of the sites this proxy routes to.
    #[serde(default)]
    pub sites: Vec<String>,

    /// Log and count probes even from private addresses.
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Public hostname.
    pub host: String,

    /// Extra hostnames served by this site.
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Backend listener port.
    pub port: u16,

    /// Backend bind address; proxies forward here.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Site-local databases, merged over the shared set.
    #[serde(default)]
    pub databases: HashMap<String, DatabaseConfig>,

    /// Site response headers, merged over the shared set.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Enables the login and account routes.
    #[serde(default)]
    pub auth: bool,

    /// Default open content root appended after all handlers.
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Ordered handler chain.
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,

    /// CORS policy; absent disables the middleware.
    #[serde(default)]
    pub cors: Option<CorsConfig>,

    /// Token minting policy for this site.
    #[serde(default)]
    pub token: TokenConfig,

    #[serde(default)]
    pub options: SiteOptions,
}

/// One entry of a site's handler chain: a registered middleware code, the
/// route pattern it owns, and its free-form options blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Registered middleware code, e.g. `content` or `api`.
    pub code: String,

    /// HTTP verb, `any` by default.
    #[serde(default = "default_any")]
    pub method: String,

    /// Express-style route pattern.
    pub route: String,

    #[serde(default)]
    pub options: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins, matched exactly.
    pub origins: Vec<String>,

    #[serde(default = "default_cors_headers")]
    pub headers: Vec<String>,

    #[serde(default = "default_cors_methods")]
    pub methods: Vec<String>,

    #[serde(default)]
    pub credentials: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Token lifetime in seconds.
    #[serde(default = "default_token_expiration")]
    pub expiration: u64,

    /// Whether bearer-authenticated `/login` may renew a token.
    #[serde(default = "default_true")]
    pub renewal: bool,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self { expiration: default_token_expiration(), renewal: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteOptions {
    /// Total in-memory body ceiling (bytes).
    #[serde(default = "default_request_max")]
    pub request_max: u64,

    /// Per-file upload ceiling (bytes).
    #[serde(default = "default_upload_max")]
    pub upload_max: u64,

    /// Per-request timeout (milliseconds).
    #[serde(default = "default_request_timeout")]
    pub timeout_ms: u64,

    /// Buffered-cache payload ceiling; larger files stream.
    #[serde(default = "default_cache_max")]
    pub cache_max: u64,

    /// Optional global cache entry cap.
    #[serde(default)]
    pub cache_limit: Option<usize>,

    /// URL rewrite rules applied after body parse.
    #[serde(default)]
    pub rewrites: Vec<RewriteRule>,

    /// 404 redirect rewrite; a hit answers 301 with the rewritten URL.
    #[serde(default)]
    pub redirect: Option<RewriteRule>,
}

impl Default for SiteOptions {
    fn default() -> Self {
        Self {
            request_max: default_request_max(),
            upload_max: default_upload_max(),
            timeout_ms: default_request_timeout(),
            cache_max: default_cache_max(),
            cache_limit: None,
            rewrites: Vec::new(),
            redirect: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteRule {
    /// Regex applied to the request path.
    pub pattern: String,

    /// Replacement, `$1`-style capture references allowed.
    pub replace: String,
}

impl Config {
    /// Load configuration from a YAML file plus `HEARTH_`-prefixed
    /// environment variables (`HEARTH_SCRIBE__LEVEL=debug`).
    pub fn load(config_path: Option<&str>) -> anyhow::Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        } else {
            for default_path in &["hearth.yaml", "/etc/hearth/hearth.yaml", "config/hearth.yaml"] {
                if std::path::Path::new(default_path).exists() {
                    figment = figment.merge(Yaml::file(default_path));
                    break;
                }
            }
        }

        figment = figment.merge(Env::prefixed("HEARTH_").split("__"));

        let config: Self = figment.extract()?;
        Ok(config)
    }

    /// Backend address a proxy forwards to for the given site.
    pub fn backend_addr(site: &SiteConfig) -> String {
        format!("{}:{}", site.bind, site.port)
    }
}

// Serde default functions

fn default_log_level() -> String {
    "info".to_string()
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("/tmp/hearth")
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_mail_endpoint() -> String {
    "https://api.sendgrid.com/v3/mail/send".to_string()
}

fn default_sms_endpoint() -> String {
    "https://api.twilio.com/2010-04-01".to_string()
}

fn default_any() -> String {
    "any".to_string()
}

fn default_cors_headers() -> Vec<String> {
    vec!["Authorization".to_string(), "Content-Type".to_string()]
}

fn default_cors_methods() -> Vec<String> {
    vec!["POST".to_string(), "GET".to_string(), "OPTIONS".to_string()]
}

fn default_token_expiration() -> u64 {
    604_800 // 7 days
}

fn default_request_max() -> u64 {
    8 * 1024 * 1024
}

fn default_upload_max() -> u64 {
    32 * 1024 * 1024
}

fn default_request_timeout() -> u64 {
    30_000
}

fn default_cache_max() -> u64 {
    1024 * 1024
}

fn default_true() -> bool {
    true
}
