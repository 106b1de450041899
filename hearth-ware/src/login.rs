use crate::scope::SiteScope;
use async_trait::async_trait;
use hearth_core::HttpError;
use hearth_pipeline::{AuthKind, Context, Middleware, Outcome};
use serde_json::json;
use std::sync::Arc;

/// `/login` and `/logout`.
///
/// Login requires a recognized user (Basic or an existing bearer token)
/// and mints a fresh token carrying the public profile; the token is also
/// set as a `Authorization: Bearer` response header. Logout is stateless
/// and answers `{}`.
pub struct LoginWare {
    scope: Arc<SiteScope>,
}

impl LoginWare {
    pub fn new(scope: Arc<SiteScope>) -> Self {
        Self { scope }
    }
}

#[async_trait]
impl Middleware for LoginWare {
    async fn handle(&self, ctx: &mut Context) -> Result<Outcome, HttpError> {
        if ctx.request.url.pathname.ends_with("/logout") {
            return Ok(Outcome::Payload(json!({})));
        }

        let Some(user) = ctx.user.clone() else {
            return Err(HttpError::Unauthorized("Authentication required".into()));
        };

        let token_cfg = &self.scope.cfg.token;
        if ctx.auth == AuthKind::Bearer && !token_cfg.renewal {
            return Err(HttpError::Unauthorized("Token renewal requires login".into()));
        }

        let token = self.scope.tokens.create(&user.profile(), token_cfg.expiration, token_cfg.renewal);
        let payload = self
            .scope
            .tokens
            .verify(&token)
            .ok_or_else(|| HttpError::Internal("Minted token failed verification".into()))?;

        ctx.set_header("authorization", &format!("Bearer {token}"));
        Ok(Outcome::Payload(json!({"token": token, "payload": payload})))
    }
}
