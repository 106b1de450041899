//! The recipe-driven API: `/<prefix><recipe>[/opts…]` with prefix `$`
//! (data), `@` (actions), or `!` (info).

pub mod actions;
pub mod data;
pub mod info;

use crate::scope::SiteScope;
use async_trait::async_trait;
use hearth_core::HttpError;
use hearth_pipeline::{Context, Middleware, Outcome};
use hearth_store::Store;
use std::sync::Arc;

/// Route pattern this middleware expects to be mounted on.
pub const API_ROUTE: &str = "/:prefix([$@!]):recipe/:opts*";

pub struct ApiWare {
    scope: Arc<SiteScope>,
    db: Arc<Store>,
}

impl ApiWare {
    pub fn new(scope: Arc<SiteScope>, db: Arc<Store>) -> Self {
        Self { scope, db }
    }
}

#[async_trait]
impl Middleware for ApiWare {
    async fn handle(&self, ctx: &mut Context) -> Result<Outcome, HttpError> {
        let prefix = ctx
            .param("prefix")
            .map(|s| s.to_string())
            .ok_or_else(|| HttpError::BadRequest("API prefix required".into()))?;
        let recipe = ctx
            .param("recipe")
            .map(|s| s.to_string())
            .ok_or_else(|| HttpError::BadRequest("Recipe name required".into()))?;
        let opts: Vec<String> = ctx
            .param("opts")
            .map(|raw| raw.split('/').filter(|s| !s.is_empty()).map(|s| s.to_string()).collect())
            .unwrap_or_default();

        match prefix.as_str() {
            "$" => data::handle(ctx, &self.db, &recipe, &opts),
            "@" => actions::handle(ctx, &self.scope, &self.db, &recipe, &opts).await,
            "!" => info::handle(ctx, &self.scope, &recipe),
            other => Err(HttpError::NotImplemented(format!("Unknown API prefix: {other}"))),
        }
    }
}

/// Recipe-level authorization: an empty set is open, otherwise the caller
/// needs one of the listed groups (admin always passes).
pub(crate) fn check_recipe_auth(ctx: &Context, auth: &[String]) -> Result<(), HttpError> {
    if auth.is_empty() {
        return Ok(());
    }
    let allowed: Vec<&str> = auth.iter().map(|s| s.as_str()).collect();
    if ctx.authorized(&allowed) {
        Ok(())
    } else {
        Err(HttpError::Unauthorized("Not authorized for this recipe".into()))
    }
}
