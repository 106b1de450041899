use async_trait::async_trait;
use hearth_core::config::CorsConfig;
use hearth_core::HttpError;
use hearth_pipeline::{Context, Middleware, Outcome, Reply};

/// CORS policy middleware.
///
/// Non-CORS requests pass through untouched. Allowed origins are echoed
/// back exactly; preflights terminate with a 204-style null response.
pub struct CorsWare {
    cfg: CorsConfig,
}

impl CorsWare {
    pub fn new(cfg: CorsConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl Middleware for CorsWare {
    async fn handle(&self, ctx: &mut Context) -> Result<Outcome, HttpError> {
        let Some(origin) = ctx.request.header("origin").map(|o| o.to_string()) else {
            return Ok(Outcome::Next);
        };

        if !self.cfg.origins.iter().any(|o| *o == origin) {
            return Err(HttpError::Forbidden("Origin not allowed".into()));
        }

        ctx.set_header("access-control-allow-origin", &origin);
        ctx.set_header("access-control-expose-headers", "*");

        if ctx.request.method.eq_ignore_ascii_case("options") {
            ctx.set_header("access-control-allow-methods", &self.cfg.methods.join(", "));
            ctx.set_header("access-control-allow-headers", &self.cfg.headers.join(", "));
            if self.cfg.credentials {
                ctx.set_header("access-control-allow-credentials", "true");
            }
            return Ok(Outcome::Reply(Reply::status(204)));
        }

        Ok(Outcome::Next)
    }
}
