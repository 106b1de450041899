use crate::scope::SiteScope;
use async_trait::async_trait;
use hearth_core::HttpError;
use hearth_pipeline::{Context, Middleware, Outcome};
use std::sync::Arc;

/// Counts every request into the `ip`, `page`, and `user` namespaces and
/// always continues the chain.
pub struct AnalyticsWare {
    scope: Arc<SiteScope>,
}

impl AnalyticsWare {
    pub fn new(scope: Arc<SiteScope>) -> Self {
        Self { scope }
    }
}

#[async_trait]
impl Middleware for AnalyticsWare {
    async fn handle(&self, ctx: &mut Context) -> Result<Outcome, HttpError> {
        let stats = &self.scope.stats;
        stats.inc("ip", &ctx.request.remote_ip);
        stats.inc("page", &ctx.request.url.pathname);
        if let Some(user) = ctx.username() {
            stats.inc("user", user);
        }
        Ok(Outcome::Next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{scope_with, test_ctx};

    #[tokio::test]
    async fn counts_ip_page_and_user_then_continues() {
        let scope = scope_with(serde_json::json!({}));
        let ware = AnalyticsWare::new(Arc::clone(&scope));

        let mut ctx = test_ctx("GET", "/page", vec![]);
        assert!(matches!(ware.handle(&mut ctx).await.unwrap(), Outcome::Next));
        assert_eq!(scope.stats.get("ip", "9.9.9.9"), 1);
        assert_eq!(scope.stats.get("page", "/page"), 1);

        let mut ctx = test_ctx("GET", "/page", vec![]);
        ctx.user = Some(crate::test_support::active_user("alice", &["users"]));
        ware.handle(&mut ctx).await.unwrap();
        assert_eq!(scope.stats.get("user", "alice"), 1);
        assert_eq!(scope.stats.get("page", "/page"), 2);
    }
}
