use hearth_auth::{Throttle, TokenService};
use hearth_cache::FileCache;
use hearth_core::config::SiteConfig;
use hearth_notify::{Mailer, Texter};
use hearth_observability::{Scribe, Stats};
use hearth_store::Store;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything a site's middleware needs, passed to factories instead of
/// per-module globals.
pub struct SiteScope {
    pub name: String,
    pub cfg: SiteConfig,

    /// Shared + site databases, site entries winning on name clashes.
    pub stores: HashMap<String, Arc<Store>>,

    pub cache: Arc<FileCache>,
    pub tokens: Arc<TokenService>,
    pub throttle: Arc<Throttle>,
    pub stats: Arc<Stats>,
    pub scribe: Arc<Scribe>,
    pub mailer: Arc<Mailer>,
    pub texter: Arc<Texter>,

    /// Temp-upload directory.
    pub temp_dir: PathBuf,
}

impl SiteScope {
    pub fn db(&self, name: &str) -> Option<Arc<Store>> {
        self.stores.get(name).cloned()
    }

    /// The store holding the `users` and `groups` collections. By
    /// convention the database named `users`, falling back to `site`.
    pub fn users(&self) -> Option<Arc<Store>> {
        self.db("users").or_else(|| self.db("site"))
    }
}
