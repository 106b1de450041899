use crate::context::{AuthKind, Context};
use crate::middleware::{Outcome, Reply};
use crate::route::{verb_matches, Route};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hearth_auth::{check_code, AttemptKind, Throttle, TokenService};
use hearth_core::config::RewriteRule;
use hearth_core::user::{scrub_credentials, User};
use hearth_core::HttpError;
use hearth_store::Store;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;

/// A site's request pipeline: the ordered route table plus URL rewrite
/// and 404-redirect policies.
pub struct Pipeline {
    pub routes: Vec<Route>,
    pub rewrites: Vec<CompiledRewrite>,
    pub redirect: Option<CompiledRewrite>,
}

impl Pipeline {
    pub fn new(routes: Vec<Route>, rewrites: &[RewriteRule], redirect: Option<&RewriteRule>) -> Self {
        Self {
            routes,
            rewrites: compile_rewrites(rewrites),
            redirect: redirect.and_then(compile_rewrite),
        }
    }

    /// Walk the route table in insertion order. The first verb+pattern
    /// match runs; `Outcome::Next` delegates onward. Exhaustion is 404.
    pub async fn dispatch(&self, ctx: &mut Context) -> Result<Outcome, HttpError> {
        for route in &self.routes {
            if !verb_matches(&route.method, &ctx.request.method) {
                continue;
            }
            let Some(params) = route.pattern.matches(&ctx.request.url.pathname) else {
                continue;
            };
            ctx.params = params;
            match route.handler.handle(ctx).await? {
                Outcome::Next => continue,
                done => return Ok(done),
            }
        }
        Err(HttpError::NotFound(format!("No route for {}", ctx.request.url.pathname)))
    }

    /// Apply configured rewrite rules to the parsed path, in order.
    pub fn apply_rewrites(&self, ctx: &mut Context) {
        for rule in &self.rewrites {
            let rewritten = rule.regex.replace(&ctx.request.url.pathname, rule.replace.as_str());
            if rewritten != ctx.request.url.pathname {
                tracing::info!(
                    from = %ctx.request.url.pathname,
                    to = %rewritten,
                    "URL rewritten"
                );
                ctx.request.url.pathname = rewritten.into_owned();
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledRewrite {
    pub regex: Regex,
    pub replace: String,
}

fn compile_rewrite(rule: &RewriteRule) -> Option<CompiledRewrite> {
    match Regex::new(&rule.pattern) {
        Ok(regex) => Some(CompiledRewrite { regex, replace: rule.replace.clone() }),
        Err(e) => {
            tracing::warn!(pattern = %rule.pattern, error = %e, "Bad rewrite pattern ignored");
            None
        }
    }
}

fn compile_rewrites(rules: &[RewriteRule]) -> Vec<CompiledRewrite> {
    rules.iter().filter_map(compile_rewrite).collect()
}

/// The authentication step: consume an `Authorization` header if present.
///
/// Basic credentials check the password hash first, then the stored
/// short code; bearer tokens install the verified payload as the user.
/// The context user never carries credentials. Failures are counted into
/// the throttle; a locked account refuses even correct passwords.
pub async fn authenticate(
    ctx: &mut Context,
    users: Option<&Arc<Store>>,
    tokens: &TokenService,
    throttle: &Throttle,
) -> Result<(), HttpError> {
    let Some(header) = ctx.request.header("authorization").map(|h| h.to_string()) else {
        return Ok(());
    };

    if let Some(encoded) = strip_scheme(&header, "basic") {
        let decoded = BASE64
            .decode(encoded.trim())
            .ok()
            .and_then(|b| String::from_utf8(b).ok())
            .ok_or_else(|| HttpError::Unauthorized("Authentication failed".into()))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| HttpError::Unauthorized("Authentication failed".into()))?;
        let username = username.to_ascii_lowercase();

        if throttle.locked(&username) {
            throttle.record(&username, AttemptKind::FailLocked);
            return Err(HttpError::Unauthorized("Account locked".into()));
        }

        let record = users.and_then(|store| store.find_by("users", "username", &Value::String(username.clone())));
        let Some(record) = record else {
            throttle.record(&username, AttemptKind::FailUnknown);
            return Err(HttpError::Unauthorized("Authentication failed".into()));
        };
        let Ok(user) = serde_json::from_value::<User>(record) else {
            throttle.record(&username, AttemptKind::FailUnknown);
            return Err(HttpError::Unauthorized("Authentication failed".into()));
        };
        if !user.is_active() {
            throttle.record(&username, AttemptKind::FailUnknown);
            return Err(HttpError::Unauthorized("Authentication failed".into()));
        }

        let by_password = hearth_auth::passwords::verify_password(password, &user.credentials.hash);
        let by_code = !by_password
            && user.credentials.passcode.as_ref().map(|pc| check_code(password, pc)).unwrap_or(false);

        if !by_password && !by_code {
            throttle.record(&username, AttemptKind::FailPassword);
            return Err(HttpError::Unauthorized("Authentication failed".into()));
        }

        throttle.record(&username, if by_password { AttemptKind::Basic } else { AttemptKind::Code });
        ctx.user = Some(User { credentials: Default::default(), ..user });
        ctx.auth = AuthKind::Basic;
        return Ok(());
    }

    if let Some(token) = strip_scheme(&header, "bearer") {
        let Some(payload) = tokens.verify(token.trim()) else {
            return Err(HttpError::Unauthorized("Authentication failed".into()));
        };
        let Ok(user) = serde_json::from_value::<User>(payload.clone()) else {
            return Err(HttpError::Unauthorized("Authentication failed".into()));
        };
        ctx.state.insert("token".to_string(), payload);
        ctx.user = Some(User { credentials: Default::default(), ..user });
        ctx.auth = AuthKind::Bearer;
        return Ok(());
    }

    Err(HttpError::Unauthorized("Authentication failed".into()))
}

fn strip_scheme<'a>(header: &'a str, scheme: &str) -> Option<&'a str> {
    let (head, rest) = header.split_once(' ')?;
    if head.eq_ignore_ascii_case(scheme) { Some(rest) } else { None }
}

/// Serialize a middleware outcome into a response, merging accumulated
/// context headers (a typed reply's own headers win). Plain payloads are
/// scrubbed of credential fields and sent as JSON; the debug flag swaps
/// in the whole-context view.
pub fn respond(ctx: &Context, outcome: Outcome) -> Reply {
    let mut reply = match outcome {
        Outcome::Payload(mut value) => {
            scrub_credentials(&mut value);
            let payload = if ctx.debug { ctx.debug_view(&value) } else { value };
            Reply::json(200, &payload)
        }
        Outcome::Reply(reply) => reply,
        Outcome::Next => Reply::status(404),
    };

    let mut headers = Vec::with_capacity(ctx.headers.len() + reply.headers.len());
    for (name, value) in &ctx.headers {
        if !reply.headers.iter().any(|(k, _)| k == name) {
            headers.push((name.clone(), value.clone()));
        }
    }
    headers.append(&mut reply.headers);
    reply.headers = headers;
    reply
}

/// The error funnel: map any middleware error to the canonical envelope.
///
/// Non-error codes below 400 become status-only responses; a configured
/// redirect turns 404 into a 301 at the rewritten location.
pub fn funnel(ctx: &Context, err: &HttpError, redirect: Option<&CompiledRewrite>) -> Reply {
    let code = err.code();
    if code < 400 {
        return Reply::status(code);
    }

    if code == 404
        && let Some(rule) = redirect
    {
        let location = rule.regex.replace(&ctx.request.url.pathname, rule.replace.as_str());
        if location != ctx.request.url.pathname {
            tracing::info!(from = %ctx.request.url.pathname, to = %location, "404 redirected");
            return Reply::status(301).with_header("location", &location);
        }
    }

    let mut envelope = err.envelope();
    if ctx.debug
        && let Some(obj) = envelope.as_object_mut()
    {
        obj.insert("context".to_string(), ctx.debug_view(&Value::Null));
    }
    Reply::json(code, &envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{parse_url, BodyData, Request};
    use crate::middleware::{Middleware, ReplyBody};
    use async_trait::async_trait;
    use serde_json::json;

    fn ctx_for(method: &str, path: &str, headers: Vec<(&str, &str)>) -> Context {
        let (url, debug) = parse_url(path, "site.test", false);
        Context::new(
            Request {
                method: method.into(),
                url,
                headers: headers
                    .into_iter()
                    .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                    .collect(),
                remote_ip: "9.9.9.9".into(),
                remote_port: 1234,
                content_type: None,
                body: BodyData::None,
            },
            debug,
        )
    }

    struct Fixed(Value);

    #[async_trait]
    impl Middleware for Fixed {
        async fn handle(&self, _ctx: &mut Context) -> Result<Outcome, HttpError> {
            Ok(Outcome::Payload(self.0.clone()))
        }
    }

    struct PassThrough;

    #[async_trait]
    impl Middleware for PassThrough {
        async fn handle(&self, ctx: &mut Context) -> Result<Outcome, HttpError> {
            ctx.set_header("x-seen", "1");
            Ok(Outcome::Next)
        }
    }

    fn pipeline(routes: Vec<Route>) -> Pipeline {
        Pipeline::new(routes, &[], None)
    }

    // ── Dispatch ────────────────────────────────────────────────

    #[tokio::test]
    async fn first_match_wins_in_insertion_order() {
        let p = pipeline(vec![
            Route::new("get", "/a", Arc::new(Fixed(json!(1)))).unwrap(),
            Route::new("any", "/a", Arc::new(Fixed(json!(2)))).unwrap(),
        ]);
        let mut ctx = ctx_for("GET", "/a", vec![]);
        match p.dispatch(&mut ctx).await.unwrap() {
            Outcome::Payload(v) => assert_eq!(v, json!(1)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn next_delegates_to_later_route() {
        let p = pipeline(vec![
            Route::new("any", "*", Arc::new(PassThrough)).unwrap(),
            Route::new("get", "/a", Arc::new(Fixed(json!("second")))).unwrap(),
        ]);
        let mut ctx = ctx_for("GET", "/a", vec![]);
        match p.dispatch(&mut ctx).await.unwrap() {
            Outcome::Payload(v) => assert_eq!(v, json!("second")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(ctx.headers, vec![("x-seen".to_string(), "1".to_string())]);
    }

    #[tokio::test]
    async fn exhaustion_is_404() {
        let p = pipeline(vec![Route::new("post", "/a", Arc::new(Fixed(json!(1)))).unwrap()]);
        let mut ctx = ctx_for("GET", "/a", vec![]);
        assert_eq!(p.dispatch(&mut ctx).await.unwrap_err().code(), 404);
    }

    #[tokio::test]
    async fn head_reaches_get_routes() {
        let p = pipeline(vec![Route::new("get", "/a", Arc::new(Fixed(json!(1)))).unwrap()]);
        let mut ctx = ctx_for("HEAD", "/a", vec![]);
        assert!(p.dispatch(&mut ctx).await.is_ok());
    }

    // ── Rewrites ────────────────────────────────────────────────

    #[tokio::test]
    async fn rewrites_change_the_path_before_routing() {
        let p = Pipeline::new(
            vec![Route::new("get", "/new", Arc::new(Fixed(json!("ok")))).unwrap()],
            &[RewriteRule { pattern: "^/old$".into(), replace: "/new".into() }],
            None,
        );
        let mut ctx = ctx_for("GET", "/old", vec![]);
        p.apply_rewrites(&mut ctx);
        assert_eq!(ctx.request.url.pathname, "/new");
        assert!(p.dispatch(&mut ctx).await.is_ok());
    }

    // ── Authentication ──────────────────────────────────────────

    fn users_store(pw_hash: &str) -> Arc<Store> {
        Store::in_memory(
            "users",
            json!({
                "users": [
                    {
                        "username": "alice",
                        "status": "ACTIVE",
                        "member": ["users"],
                        "credentials": {"hash": pw_hash},
                    },
                    {
                        "username": "pending",
                        "status": "PENDING",
                        "member": [],
                        "credentials": {"hash": pw_hash},
                    },
                ]
            }),
        )
    }

    fn basic(user: &str, pw: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{user}:{pw}")))
    }

    #[tokio::test]
    async fn no_authorization_header_continues_unauthenticated() {
        let mut ctx = ctx_for("GET", "/", vec![]);
        let tokens = TokenService::new(Some("s"));
        let throttle = Throttle::new();
        authenticate(&mut ctx, None, &tokens, &throttle).await.unwrap();
        assert!(!ctx.authenticated());
    }

    #[tokio::test]
    async fn basic_auth_happy_path_strips_credentials() {
        let hash = hearth_auth::passwords::hash_password("s3cret", 4).unwrap();
        let store = users_store(&hash);
        let header = basic("Alice", "s3cret");
        let mut ctx = ctx_for("GET", "/", vec![("authorization", &header)]);
        let tokens = TokenService::new(Some("s"));
        let throttle = Throttle::new();

        authenticate(&mut ctx, Some(&store), &tokens, &throttle).await.unwrap();
        assert_eq!(ctx.auth, AuthKind::Basic);
        let user = ctx.user.as_ref().unwrap();
        assert_eq!(user.username, "alice", "username is matched lowercase");
        assert!(user.credentials.hash.is_empty(), "credentials must not enter the context");
    }

    #[tokio::test]
    async fn wrong_password_is_401_and_counted() {
        let hash = hearth_auth::passwords::hash_password("s3cret", 4).unwrap();
        let store = users_store(&hash);
        let tokens = TokenService::new(Some("s"));
        let throttle = Throttle::new();

        let header = basic("alice", "wrong");
        for _ in 0..4 {
            let mut ctx = ctx_for("GET", "/", vec![("authorization", &header)]);
            let err = authenticate(&mut ctx, Some(&store), &tokens, &throttle).await.unwrap_err();
            assert_eq!(err.to_string(), "Authentication failed");
        }

        // Fifth attempt with the CORRECT password: still refused.
        let good = basic("alice", "s3cret");
        let mut ctx = ctx_for("GET", "/", vec![("authorization", &good)]);
        let err = authenticate(&mut ctx, Some(&store), &tokens, &throttle).await.unwrap_err();
        assert_eq!(err.to_string(), "Account locked");
    }

    #[tokio::test]
    async fn inactive_user_is_rejected() {
        let hash = hearth_auth::passwords::hash_password("s3cret", 4).unwrap();
        let store = users_store(&hash);
        let tokens = TokenService::new(Some("s"));
        let throttle = Throttle::new();
        let header = basic("pending", "s3cret");
        let mut ctx = ctx_for("GET", "/", vec![("authorization", &header)]);
        assert!(authenticate(&mut ctx, Some(&store), &tokens, &throttle).await.is_err());
    }

    #[tokio::test]
    async fn short_code_authenticates_when_password_fails() {
        let hash = hearth_auth::passwords::hash_password("s3cret", 4).unwrap();
        let code = hearth_auth::generate_code(6, 36, 15);
        let store = Store::in_memory(
            "users",
            json!({
                "users": [{
                    "username": "alice",
                    "status": "ACTIVE",
                    "member": [],
                    "credentials": {"hash": hash, "passcode": code.clone()},
                }]
            }),
        );
        let header = basic("alice", &code.code);
        let mut ctx = ctx_for("GET", "/", vec![("authorization", &header)]);
        let tokens = TokenService::new(Some("s"));
        let throttle = Throttle::new();
        authenticate(&mut ctx, Some(&store), &tokens, &throttle).await.unwrap();
        assert!(ctx.authenticated());
    }

    #[tokio::test]
    async fn bearer_token_installs_payload_user() {
        let tokens = TokenService::new(Some("s"));
        let token = tokens.create(&json!({"username": "alice", "member": ["users"], "status": "ACTIVE"}), 60, false);
        let header = format!("Bearer {token}");
        let mut ctx = ctx_for("GET", "/", vec![("authorization", &header)]);
        let throttle = Throttle::new();

        authenticate(&mut ctx, None, &tokens, &throttle).await.unwrap();
        assert_eq!(ctx.auth, AuthKind::Bearer);
        assert_eq!(ctx.username(), Some("alice"));
        assert!(ctx.authorized(&["users"]));
    }

    #[tokio::test]
    async fn garbage_bearer_token_is_401() {
        let tokens = TokenService::new(Some("s"));
        let mut ctx = ctx_for("GET", "/", vec![("authorization", "Bearer nope")]);
        let throttle = Throttle::new();
        assert!(authenticate(&mut ctx, None, &tokens, &throttle).await.is_err());
    }

    // ── Respond and funnel ──────────────────────────────────────

    #[test]
    fn respond_scrubs_credentials_from_payloads() {
        let ctx = ctx_for("GET", "/", vec![]);
        let outcome = Outcome::Payload(json!({"user": {"username": "a", "credentials": {"hash": "h"}}}));
        let reply = respond(&ctx, outcome);
        match reply.body {
            ReplyBody::Bytes { data, .. } => {
                let v: Value = serde_json::from_slice(&data).unwrap();
                assert!(v["user"].get("credentials").is_none());
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn respond_merges_context_headers_with_reply_winning() {
        let mut ctx = ctx_for("GET", "/", vec![]);
        ctx.set_header("x-shared", "ctx");
        ctx.set_header("x-only-ctx", "1");
        let reply = Reply::status(204).with_header("x-shared", "reply");
        let merged = respond(&ctx, Outcome::Reply(reply));
        assert!(merged.headers.contains(&("x-only-ctx".to_string(), "1".to_string())));
        assert!(merged.headers.contains(&("x-shared".to_string(), "reply".to_string())));
        assert!(!merged.headers.contains(&("x-shared".to_string(), "ctx".to_string())));
    }

    #[test]
    fn funnel_produces_canonical_envelope() {
        let ctx = ctx_for("GET", "/missing", vec![]);
        let reply = funnel(&ctx, &HttpError::NotFound("No route".into()), None);
        assert_eq!(reply.status, 404);
        match reply.body {
            ReplyBody::Bytes { data, .. } => {
                let v: Value = serde_json::from_slice(&data).unwrap();
                assert_eq!(v["error"], true);
                assert_eq!(v["code"], 404);
                assert_eq!(v["msg"], "No route");
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn funnel_redirects_404_when_configured() {
        let ctx = ctx_for("GET", "/old/page", vec![]);
        let rule = compile_rewrite(&RewriteRule {
            pattern: "^/old/(.*)$".into(),
            replace: "/new/$1".into(),
        })
        .unwrap();
        let reply = funnel(&ctx, &HttpError::NotFound("x".into()), Some(&rule));
        assert_eq!(reply.status, 301);
        assert!(reply.headers.contains(&("location".to_string(), "/new/page".to_string())));
    }

    #[test]
    fn funnel_sub_400_codes_are_status_only() {
        let ctx = ctx_for("GET", "/", vec![]);
        let reply = funnel(&ctx, &HttpError::Status(204), None);
        assert_eq!(reply.status, 204);
        assert!(matches!(reply.body, ReplyBody::Empty));
    }
}
