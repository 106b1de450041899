use crate::context::Context;
use async_trait::async_trait;
use bytes::Bytes;
use hearth_core::HttpError;
use serde_json::Value;
use std::path::PathBuf;

/// What a middleware did with the request.
#[derive(Debug)]
pub enum Outcome {
    /// Delegate to the next matching route (the chain continuation).
    Next,

    /// A plain payload; the serializer turns it into a JSON response.
    Payload(Value),

    /// A fully typed response with its own content and headers.
    Reply(Reply),
}

/// A constructed response.
#[derive(Debug)]
pub struct Reply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ReplyBody,
}

#[derive(Debug)]
pub enum ReplyBody {
    Empty,

    Bytes { content_type: String, data: Bytes },

    /// Streamed from disk by the listener; `gzip` selects on-the-fly
    /// compression (chunked transfer).
    Stream { path: PathBuf, len: u64, content_type: String, gzip: bool },
}

impl Reply {
    pub fn status(status: u16) -> Self {
        Self { status, headers: Vec::new(), body: ReplyBody::Empty }
    }

    pub fn json(status: u16, value: &Value) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: ReplyBody::Bytes {
                content_type: "application/json".to_string(),
                data: Bytes::from(value.to_string()),
            },
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.to_string()));
        self
    }
}

/// The middleware capability: handle a request in place, produce a
/// payload/response, or pass to the next route.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: &mut Context) -> Result<Outcome, HttpError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_reply_carries_serialized_payload() {
        let reply = Reply::json(200, &serde_json::json!({"a": 1}));
        match reply.body {
            ReplyBody::Bytes { content_type, data } => {
                assert_eq!(content_type, "application/json");
                assert_eq!(data.as_ref(), br#"{"a":1}"#);
            }
            other => panic!("expected bytes body, got {other:?}"),
        }
    }

    #[test]
    fn with_header_lowercases_names() {
        let reply = Reply::status(204).with_header("X-Custom", "v");
        assert_eq!(reply.headers, vec![("x-custom".to_string(), "v".to_string())]);
    }
}
