use hearth_core::user::User;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use url::Url;

/// Parsed request URL pieces.
#[derive(Debug, Clone, Default)]
pub struct UrlParts {
    pub origin: String,
    pub host: String,
    pub hostname: String,
    pub port: Option<u16>,
    pub pathname: String,
    pub search: String,
    pub query: HashMap<String, String>,
}

/// Split a request target against its Host header. A trailing `!` on the
/// path enables the per-request debug flag and is stripped.
pub fn parse_url(target: &str, host: &str, secure: bool) -> (UrlParts, bool) {
    let scheme = if secure { "https" } else { "http" };
    let base = format!("{scheme}://{}", if host.is_empty() { "localhost" } else { host });

    let (target, debug) = match target.split_once('?') {
        Some((path, search)) => match path.strip_suffix('!') {
            Some(stripped) => (format!("{stripped}?{search}"), true),
            None => (target.to_string(), false),
        },
        None => match target.strip_suffix('!') {
            Some(stripped) => (stripped.to_string(), true),
            None => (target.to_string(), false),
        },
    };

    let parsed = Url::parse(&base).and_then(|b| b.join(&target));
    let parts = match parsed {
        Ok(url) => UrlParts {
            origin: url.origin().ascii_serialization(),
            host: match (url.host_str(), url.port()) {
                (Some(h), Some(p)) => format!("{h}:{p}"),
                (Some(h), None) => h.to_string(),
                _ => String::new(),
            },
            hostname: url.host_str().map(|h| h.to_string()).unwrap_or_default(),
            port: url.port(),
            pathname: url.path().to_string(),
            search: url.query().map(|q| format!("?{q}")).unwrap_or_default(),
            query: url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect(),
        },
        Err(_) => UrlParts { pathname: target.clone(), ..Default::default() },
    };
    (parts, debug)
}

/// One uploaded file, parked in the temp directory. The pipeline owns
/// removal; parsers never delete.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: Option<String>,
    pub mime: String,
    pub temp_file: PathBuf,
    pub size: u64,
}

impl UploadedFile {
    pub fn to_value(&self) -> Value {
        json!({
            "filename": self.filename,
            "mime": self.mime,
            "tempFile": self.temp_file.to_string_lossy(),
            "size": self.size,
        })
    }
}

/// Parsed request body, shaped by content type.
#[derive(Debug, Clone, Default)]
pub enum BodyData {
    #[default]
    None,
    Json(Value),
    Form(HashMap<String, String>),
    Text(String),
    Multipart { fields: HashMap<String, String>, files: Vec<UploadedFile> },
    Octet(UploadedFile),
}

impl BodyData {
    pub fn json(&self) -> Option<&Value> {
        match self {
            BodyData::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Loose JSON view used by the debug serializer.
    pub fn to_value(&self) -> Value {
        match self {
            BodyData::None => Value::Null,
            BodyData::Json(v) => v.clone(),
            BodyData::Form(map) => json!(map),
            BodyData::Text(s) => json!(s),
            BodyData::Multipart { fields, files } => json!({
                "fields": fields,
                "files": files.iter().map(|f| f.to_value()).collect::<Vec<_>>(),
            }),
            BodyData::Octet(f) => f.to_value(),
        }
    }
}

/// The parsed request a middleware sees.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub url: UrlParts,
    pub headers: Vec<(String, String)>,
    pub remote_ip: String,
    pub remote_port: u16,
    pub content_type: Option<String>,
    pub body: BodyData,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers.iter().find(|(k, _)| *k == name).map(|(_, v)| v.as_str())
    }

    /// Lowercased method.
    pub fn verb(&self) -> String {
        self.method.to_ascii_lowercase()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthKind {
    #[default]
    None,
    Basic,
    Bearer,
}

/// Per-request mutable state threaded through the middleware chain.
#[derive(Debug)]
pub struct Context {
    pub request: Request,

    pub auth: AuthKind,

    /// Recognized user; never carries credentials.
    pub user: Option<User>,

    /// Response-header accumulator.
    pub headers: Vec<(String, String)>,

    /// Params extracted by the matched route.
    pub params: HashMap<String, String>,

    /// Verbose error/debug payloads for this request.
    pub debug: bool,

    /// Temp files created by body parsing; removed after the response.
    pub temp_files: Vec<PathBuf>,

    /// Free-form intermediate state shared along the chain.
    pub state: Map<String, Value>,
}

impl Context {
    pub fn new(request: Request, debug: bool) -> Self {
        Self {
            request,
            auth: AuthKind::None,
            user: None,
            headers: Vec::new(),
            params: HashMap::new(),
            debug,
            temp_files: Vec::new(),
            state: Map::new(),
        }
    }

    pub fn authenticated(&self) -> bool {
        self.auth != AuthKind::None && self.user.is_some()
    }

    /// The authorization predicate: member ∩ allowed ≠ ∅, or admin.
    pub fn authorized(&self, allowed: &[&str]) -> bool {
        self.user.as_ref().map(|u| u.authorized(allowed)).unwrap_or(false)
    }

    pub fn username(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.username.as_str())
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(|s| s.as_str())
    }

    /// Set (replace) a response header.
    pub fn set_header(&mut self, name: &str, value: &str) {
        let lower = name.to_ascii_lowercase();
        self.headers.retain(|(k, _)| *k != lower);
        self.headers.push((lower, value.to_string()));
    }

    /// Whole-context view emitted instead of the payload when the debug
    /// flag is set.
    pub fn debug_view(&self, payload: &Value) -> Value {
        json!({
            "request": {
                "method": self.request.method,
                "pathname": self.request.url.pathname,
                "search": self.request.url.search,
                "query": self.request.url.query,
                "headers": self.request.headers,
                "remote": {"ip": self.request.remote_ip, "port": self.request.remote_port},
                "body": self.request.body.to_value(),
            },
            "auth": match self.auth {
                AuthKind::None => "none",
                AuthKind::Basic => "basic",
                AuthKind::Bearer => "bearer",
            },
            "user": self.user.as_ref().map(|u| u.profile()),
            "params": self.params,
            "state": self.state,
            "payload": payload,
        })
    }
}
