use serde_json::json;
use thiserror::Error;

/// Unified request-level error for Hearth.
///
/// Middleware returns these instead of throwing; the pipeline funnel maps
/// each variant to the canonical JSON envelope
/// `{"error":true,"code":N,"msg":"…","detail":"…"}`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HttpError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("{0}")]
    NotImplemented(String),

    #[error("Upstream failure: {0}")]
    Upstream(String),

    #[error("{0}")]
    Internal(String),

    /// Bare status code with no message of its own.
    #[error("HTTP status {0}")]
    Status(u16),

    /// Fully specified error with an extra detail string.
    #[error("{msg}")]
    Detailed { code: u16, msg: String, detail: String },
}

impl HttpError {
    /// Map to HTTP status code.
    pub fn code(&self) -> u16 {
        match self {
            HttpError::BadRequest(_) => 400,
            HttpError::Unauthorized(_) => 401,
            HttpError::Forbidden(_) => 403,
            HttpError::NotFound(_) => 404,
            HttpError::MethodNotAllowed => 405,
            HttpError::PayloadTooLarge(_) => 413,
            HttpError::NotImplemented(_) => 501,
            HttpError::Upstream(_) | HttpError::Internal(_) => 500,
            HttpError::Status(code) => *code,
            HttpError::Detailed { code, .. } => *code,
        }
    }

    /// Canonical error envelope.
    pub fn envelope(&self) -> serde_json::Value {
        let detail = match self {
            HttpError::Detailed { detail, .. } => detail.clone(),
            _ => String::new(),
        };
        json!({
            "error": true,
            "code": self.code(),
            "msg": self.to_string(),
            "detail": detail,
        })
    }

    /// Standard reason phrase for the mapped status.
    pub fn reason(&self) -> &'static str {
        status_text(self.code())
    }
}

impl From<std::io::Error> for HttpError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => HttpError::NotFound(e.to_string()),
            _ => HttpError::Internal(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for HttpError {
    fn from(e: serde_json::Error) -> Self {
        HttpError::BadRequest(format!("Invalid JSON: {e}"))
    }
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}
