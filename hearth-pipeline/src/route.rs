use crate::middleware::Middleware;
use hearth_core::pattern::Pattern;
use std::sync::Arc;

/// An immutable route-table entry. Routes are evaluated in insertion
/// order; the first verb+pattern match runs.
#[derive(Clone)]
pub struct Route {
    /// Lowercase verb, or `any`.
    pub method: String,
    pub pattern: Pattern,
    pub handler: Arc<dyn Middleware>,
}

impl Route {
    pub fn new(method: &str, pattern: &str, handler: Arc<dyn Middleware>) -> Result<Self, String> {
        Ok(Self {
            method: method.to_ascii_lowercase(),
            pattern: Pattern::compile(pattern)?,
            handler,
        })
    }
}

/// Verb matching: `any` matches everything, `get` also serves `head`.
pub fn verb_matches(route_method: &str, request_method: &str) -> bool {
    let request = request_method.to_ascii_lowercase();
    match route_method {
        "any" => true,
        "get" => request == "get" || request == "head",
        m => m == request,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_matches_all_verbs() {
        assert!(verb_matches("any", "GET"));
        assert!(verb_matches("any", "POST"));
        assert!(verb_matches("any", "DELETE"));
    }

    #[test]
    fn get_also_matches_head() {
        assert!(verb_matches("get", "GET"));
        assert!(verb_matches("get", "HEAD"));
        assert!(!verb_matches("get", "POST"));
    }

    #[test]
    fn explicit_verbs_match_exactly() {
        assert!(verb_matches("post", "POST"));
        assert!(!verb_matches("post", "GET"));
        assert!(!verb_matches("head", "GET"));
    }
}
