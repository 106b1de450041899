//! The per-site request pipeline: HTTP framing, context construction,
//! body parsing, authentication, routing with continuation, response
//! serialization, and the error funnel.

pub mod body;
pub mod context;
pub mod http;
pub mod middleware;
pub mod pipeline;
pub mod route;

pub use context::{AuthKind, BodyData, Context, Request, UploadedFile, UrlParts};
pub use middleware::{Middleware, Outcome, Reply, ReplyBody};
pub use pipeline::{authenticate, funnel, respond, Pipeline};
pub use route::Route;
