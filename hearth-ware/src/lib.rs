//! Built-in site middlewares and the registry that maps handler codes to
//! factories bound to a [`SiteScope`].

pub mod account;
pub mod analytics;
pub mod api;
pub mod content;
pub mod cors;
pub mod login;
pub mod scope;

pub use account::AccountWare;
pub use analytics::AnalyticsWare;
pub use api::ApiWare;
pub use content::{ContentOptions, ContentWare};
pub use cors::CorsWare;
pub use login::LoginWare;
pub use scope::SiteScope;

use hearth_pipeline::Middleware;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

type Factory = Box<dyn Fn(Arc<SiteScope>, &Value) -> anyhow::Result<Arc<dyn Middleware>> + Send + Sync>;

/// Registry mapping handler codes (from site config) to middleware
/// factories. Built once at startup, immutable thereafter.
pub struct WareRegistry {
    factories: HashMap<String, Factory>,
}

impl WareRegistry {
    pub fn new() -> Self {
        Self { factories: HashMap::new() }
    }

    pub fn register<F>(&mut self, code: &str, factory: F)
    where
        F: Fn(Arc<SiteScope>, &Value) -> anyhow::Result<Arc<dyn Middleware>> + Send + Sync + 'static,
    {
        tracing::debug!(code, "Registered middleware factory");
        self.factories.insert(code.to_string(), Box::new(factory));
    }

    /// Instantiate a handler for one site.
    pub fn build(
        &self,
        code: &str,
        scope: Arc<SiteScope>,
        options: &Value,
    ) -> anyhow::Result<Arc<dyn Middleware>> {
        let factory = self
            .factories
            .get(code)
            .ok_or_else(|| anyhow::anyhow!("unknown handler code: {code}"))?;
        factory(scope, options)
    }

    pub fn contains(&self, code: &str) -> bool {
        self.factories.contains_key(code)
    }

    pub fn list(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for WareRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Register the built-in handler codes: `content` and `api`.
pub fn register_builtin(registry: &mut WareRegistry) {
    registry.register("content", |scope, options| {
        let cfg: ContentOptions = serde_json::from_value(options.clone())
            .map_err(|e| anyhow::anyhow!("content options: {e}"))?;
        Ok(Arc::new(ContentWare::new(scope, cfg)) as Arc<dyn Middleware>)
    });

    registry.register("api", |scope, options| {
        let database = options
            .get("database")
            .and_then(Value::as_str)
            .unwrap_or("site")
            .to_string();
        let db = scope
            .db(&database)
            .ok_or_else(|| anyhow::anyhow!("api handler needs database {database}"))?;
        Ok(Arc::new(ApiWare::new(scope, db)) as Arc<dyn Middleware>)
    });
}
