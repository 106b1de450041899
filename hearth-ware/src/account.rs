use crate::scope::SiteScope;
use async_trait::async_trait;
use hearth_auth::{check_code, generate_code, passwords};
use hearth_core::user::User;
use hearth_core::HttpError;
use hearth_notify::MailMessage;
use hearth_pipeline::{BodyData, Context, Middleware, Outcome};
use hearth_store::{ModifyEntry, Store};
use serde_json::{json, Value};
use std::sync::Arc;

/// Account management under `/user/:action/:user?/:opt?`.
///
/// GET: `code` issues a fresh short code (SMS by default, mail with an
/// `opt`), `contacts`/`groups`/`users` answer manager-gated recipes,
/// `names` answers any authenticated user. POST: `code/<user>/<code>`
/// activates pending accounts, `change` maintains user records with the
/// self-or-admin rule, `groups` maintains the groups collection.
pub struct AccountWare {
    scope: Arc<SiteScope>,
}

impl AccountWare {
    pub fn new(scope: Arc<SiteScope>) -> Self {
        Self { scope }
    }

    fn users_db(&self) -> Result<Arc<Store>, HttpError> {
        self.scope
            .users()
            .ok_or_else(|| HttpError::NotImplemented("No user database configured".into()))
    }

    fn load_user(&self, db: &Store, username: &str) -> Result<User, HttpError> {
        let record = db
            .find_by("users", "username", &Value::String(username.to_ascii_lowercase()))
            .ok_or_else(|| HttpError::NotFound(format!("Unknown user: {username}")))?;
        serde_json::from_value(record)
            .map_err(|e| HttpError::Internal(format!("Malformed user record: {e}")))
    }

    fn modify(
        &self,
        db: &Store,
        recipe_name: &str,
        entries: &[ModifyEntry],
    ) -> Result<Outcome, HttpError> {
        let recipe = db
            .lookup(recipe_name)
            .ok_or_else(|| HttpError::NotImplemented(format!("No {recipe_name} recipe")))?;
        let ops = db.modify(&recipe, entries)?;
        Ok(Outcome::Payload(Value::Array(ops.iter().map(|op| op.to_value()).collect())))
    }

    // ── GET actions ──────────────────────────────────────────────

    async fn issue_code(&self, ctx: &Context, target: &str, by_mail: bool) -> Result<Outcome, HttpError> {
        let db = self.users_db()?;
        let user = self.load_user(&db, target)?;

        let code = generate_code(6, 36, 15);
        self.modify(
            &db,
            "user",
            &[ModifyEntry {
                reference: Some(json!(user.username)),
                record: Some(json!({"credentials": {"passcode": code.clone()}})),
            }],
        )?;

        let report = if by_mail {
            self.scope
                .mailer
                .send(&MailMessage {
                    to: vec![user.email.clone()],
                    subject: "Login code".into(),
                    text: format!("Login code: {} (expires in 15 minutes)", code.code),
                    ..Default::default()
                })
                .await
        } else {
            self.scope
                .texter
                .send(
                    std::slice::from_ref(&user.phone),
                    &format!("Login code: {} (expires in 15 minutes)", code.code),
                )
                .await
        };

        let mut payload = json!({"sent": report});
        // Only privileged callers may see the code itself.
        if ctx.authorized(&["manager"]) {
            payload["code"] = json!(code.code);
        }
        Ok(Outcome::Payload(payload))
    }

    fn run_recipe(&self, name: &str) -> Result<Outcome, HttpError> {
        let db = self.users_db()?;
        let recipe = db
            .lookup(name)
            .ok_or_else(|| HttpError::NotImplemented(format!("No {name} recipe")))?;
        Ok(Outcome::Payload(db.query(&recipe, &serde_json::Map::new())))
    }

    // ── POST actions ─────────────────────────────────────────────

    fn activate(&self, target: &str, challenge: &str) -> Result<Outcome, HttpError> {
        let db = self.users_db()?;
        let user = self.load_user(&db, target)?;

        let valid = user
            .credentials
            .passcode
            .as_ref()
            .map(|pc| check_code(challenge, pc))
            .unwrap_or(false);
        if !valid {
            return Err(HttpError::Unauthorized("Invalid activation code".into()));
        }

        if user.status == hearth_core::user::AccountStatus::Pending {
            self.modify(
                &db,
                "user",
                &[ModifyEntry {
                    reference: Some(json!(user.username)),
                    record: Some(json!({"status": "ACTIVE"})),
                }],
            )?;
            return Ok(Outcome::Payload(json!({"ok": true, "activated": true})));
        }
        Ok(Outcome::Payload(json!({"ok": true, "activated": false})))
    }

    fn change(&self, ctx: &Context) -> Result<Outcome, HttpError> {
        let Some(entries) = ctx.request.body.json().and_then(Value::as_array) else {
            return Err(HttpError::BadRequest("Body must be a list of {ref, record}".into()));
        };
        let admin = ctx.authorized(&[]);
        let caller = ctx.username().unwrap_or_default().to_string();

        let mut prepared = Vec::with_capacity(entries.len());
        for entry in entries {
            let reference = entry.get("ref").cloned().filter(|v| !v.is_null());
            let record = entry.get("record").cloned().filter(|v| !v.is_null());

            let Some(mut record) = record else {
                // Deletion is admin territory.
                if !admin {
                    return Err(HttpError::Unauthorized("Only admin may delete users".into()));
                }
                prepared.push(ModifyEntry { reference, record: None });
                continue;
            };

            let target = record
                .get("username")
                .and_then(Value::as_str)
                .map(|s| s.to_string())
                .or_else(|| reference.as_ref().and_then(Value::as_str).map(|s| s.to_string()))
                .ok_or_else(|| HttpError::BadRequest("Record without username".into()))?
                .to_ascii_lowercase();

            if !admin && target != caller {
                return Err(HttpError::Unauthorized("May only change own account".into()));
            }

            if let Some(obj) = record.as_object_mut() {
                obj.insert("username".to_string(), json!(target));
                if !admin {
                    obj.remove("member");
                    obj.remove("status");
                }
                // Incoming plaintext password moves under credentials as
                // a hash before anything is persisted.
                if let Some(pw) = obj.remove("password") {
                    let pw = pw.as_str().ok_or_else(|| {
                        HttpError::BadRequest("Password must be a string".into())
                    })?;
                    let hash = passwords::hash_password(pw, passwords::DEFAULT_COST)?;
                    let creds = obj.entry("credentials".to_string()).or_insert_with(|| json!({}));
                    if let Some(creds) = creds.as_object_mut() {
                        creds.insert("hash".to_string(), json!(hash));
                    }
                }
            }
            prepared.push(ModifyEntry { reference, record: Some(record) });
        }

        let db = self.users_db()?;
        self.modify(&db, "user", &prepared)
    }

    fn change_groups(&self, ctx: &Context) -> Result<Outcome, HttpError> {
        if !ctx.authorized(&[]) {
            return Err(HttpError::Unauthorized("Admin required".into()));
        }
        let Some(raw) = ctx.request.body.json() else {
            return Err(HttpError::BadRequest("Body must be a list of {ref, record}".into()));
        };
        let entries: Vec<ModifyEntry> = serde_json::from_value(raw.clone())
            .map_err(|e| HttpError::BadRequest(format!("Bad group entries: {e}")))?;
        let db = self.users_db()?;
        self.modify(&db, "group", &entries)
    }
}

#[async_trait]
impl Middleware for AccountWare {
    async fn handle(&self, ctx: &mut Context) -> Result<Outcome, HttpError> {
        let action = ctx
            .param("action")
            .map(|s| s.to_string())
            .ok_or_else(|| HttpError::BadRequest("Account action required".into()))?;
        let target = ctx.param("user").map(|s| s.to_string());
        let opt = ctx.param("opt").map(|s| s.to_string());

        match ctx.request.verb().as_str() {
            "get" | "head" => match action.as_str() {
                "code" => {
                    let target =
                        target.ok_or_else(|| HttpError::BadRequest("User required".into()))?;
                    self.issue_code(ctx, &target, opt.is_some()).await
                }
                "contacts" | "groups" | "users" => {
                    if !ctx.authorized(&["manager"]) {
                        return Err(HttpError::Unauthorized("Manager required".into()));
                    }
                    self.run_recipe(&action)
                }
                "names" => {
                    if !ctx.authenticated() {
                        return Err(HttpError::Unauthorized("Authentication required".into()));
                    }
                    self.run_recipe("names")
                }
                other => Err(HttpError::BadRequest(format!("Unknown account action: {other}"))),
            },
            "post" => match action.as_str() {
                "code" => {
                    let target =
                        target.ok_or_else(|| HttpError::BadRequest("User required".into()))?;
                    let challenge =
                        opt.ok_or_else(|| HttpError::BadRequest("Code required".into()))?;
                    self.activate(&target, &challenge)
                }
                "change" => self.change(ctx),
                "groups" => self.change_groups(ctx),
                other => Err(HttpError::BadRequest(format!("Unknown account action: {other}"))),
            },
            _ => Err(HttpError::MethodNotAllowed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{active_user, scope_with, test_ctx};
    use hearth_pipeline::AuthKind;

    fn seeded_scope() -> Arc<SiteScope> {
        scope_with(json!({
            "recipes": [
                {
                    "name": "user",
                    "collection": "users",
                    "reference": "$.users[?(@.username == $ref)]",
                    "unique": {"key": "username"},
                    "defaults": {"status": "PENDING", "member": []},
                },
                {
                    "name": "group",
                    "collection": "groups",
                    "reference": "$.groups[?(@.name == $ref)]",
                    "unique": {"key": "name"},
                },
                {"name": "names", "expression": "$.users[*].username"},
                {"name": "users", "expression": "$.users[*]"},
            ],
            "users": [
                {
                    "username": "alice",
                    "status": "ACTIVE",
                    "member": ["admin"],
                    "phone": "+15551230001",
                    "email": "alice@x.net",
                    "credentials": {"hash": "$2b$04$placeholder"},
                },
                {
                    "username": "bob",
                    "status": "PENDING",
                    "member": [],
                    "phone": "+15551230002",
                    "email": "bob@x.net",
                    "credentials": {
                        "hash": "",
                        "passcode": {"code": "abc123", "iat": now(), "exp": 900},
                    },
                },
            ],
            "groups": [{"name": "users", "description": "everyone"}],
        }))
    }

    fn now() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    fn ctx_as(
        method: &str,
        path: &str,
        params: &[(&str, &str)],
        user: Option<User>,
    ) -> hearth_pipeline::Context {
        let mut ctx = test_ctx(method, path, vec![]);
        for (k, v) in params {
            ctx.params.insert(k.to_string(), v.to_string());
        }
        if user.is_some() {
            ctx.auth = AuthKind::Basic;
        }
        ctx.user = user;
        ctx
    }

    // ── POST code (activation) ──────────────────────────────────

    #[tokio::test]
    async fn valid_code_activates_pending_user() {
        let scope = seeded_scope();
        let ware = AccountWare::new(Arc::clone(&scope));
        let mut ctx = ctx_as("POST", "/user/code/bob/abc123", &[("action", "code"), ("user", "bob"), ("opt", "abc123")], None);

        let Outcome::Payload(v) = ware.handle(&mut ctx).await.unwrap() else { panic!() };
        assert_eq!(v["activated"], true);

        let db = scope.users().unwrap();
        let bob = db.find_by("users", "username", &json!("bob")).unwrap();
        assert_eq!(bob["status"], "ACTIVE");
    }

    #[tokio::test]
    async fn wrong_code_is_401() {
        let scope = seeded_scope();
        let ware = AccountWare::new(scope);
        let mut ctx = ctx_as("POST", "/user/code/bob/zzz", &[("action", "code"), ("user", "bob"), ("opt", "zzz")], None);
        assert_eq!(ware.handle(&mut ctx).await.unwrap_err().code(), 401);
    }

    // ── GET code ────────────────────────────────────────────────

    #[tokio::test]
    async fn issued_code_is_stored_and_hidden_from_plain_users() {
        let scope = seeded_scope();
        let ware = AccountWare::new(Arc::clone(&scope));
        let mut ctx = ctx_as("GET", "/user/code/bob", &[("action", "code"), ("user", "bob")], None);

        let Outcome::Payload(v) = ware.handle(&mut ctx).await.unwrap() else { panic!() };
        assert!(v.get("code").is_none(), "plain callers must not see the code");
        assert!(v["sent"].is_object());

        let db = scope.users().unwrap();
        let bob = db.find_by("users", "username", &json!("bob")).unwrap();
        let stored = bob["credentials"]["passcode"]["code"].as_str().unwrap();
        assert_ne!(stored, "abc123", "a fresh code replaces the old one");
        assert_eq!(stored.len(), 6);
    }

    #[tokio::test]
    async fn admin_sees_the_issued_code() {
        let scope = seeded_scope();
        let ware = AccountWare::new(scope);
        let admin = active_user("alice", &["admin"]);
        let mut ctx = ctx_as("GET", "/user/code/bob", &[("action", "code"), ("user", "bob")], Some(admin));
        let Outcome::Payload(v) = ware.handle(&mut ctx).await.unwrap() else { panic!() };
        assert!(v["code"].is_string());
    }

    // ── Recipe-backed reads ─────────────────────────────────────

    #[tokio::test]
    async fn names_requires_authentication() {
        let scope = seeded_scope();
        let ware = AccountWare::new(scope);
        let mut ctx = ctx_as("GET", "/user/names", &[("action", "names")], None);
        assert_eq!(ware.handle(&mut ctx).await.unwrap_err().code(), 401);

        let mut ctx = ctx_as(
            "GET",
            "/user/names",
            &[("action", "names")],
            Some(active_user("bob", &[])),
        );
        let Outcome::Payload(v) = ware.handle(&mut ctx).await.unwrap() else { panic!() };
        assert_eq!(v, json!(["alice", "bob"]));
    }

    #[tokio::test]
    async fn users_requires_manager() {
        let scope = seeded_scope();
        let ware = AccountWare::new(scope);
        let plain = active_user("bob", &["users"]);
        let mut ctx = ctx_as("GET", "/user/users", &[("action", "users")], Some(plain));
        assert_eq!(ware.handle(&mut ctx).await.unwrap_err().code(), 401);
    }

    // ── change ──────────────────────────────────────────────────

    fn with_body(mut ctx: hearth_pipeline::Context, body: Value) -> hearth_pipeline::Context {
        ctx.request.body = BodyData::Json(body);
        ctx
    }

    #[tokio::test]
    async fn user_may_change_own_record_but_not_membership() {
        let scope = seeded_scope();
        let ware = AccountWare::new(Arc::clone(&scope));
        let me = active_user("bob", &["users"]);
        let ctx = ctx_as("POST", "/user/change", &[("action", "change")], Some(me));
        let mut ctx = with_body(
            ctx,
            json!([{"ref": "bob", "record": {"username": "bob", "fullname": "Bob B.", "member": ["admin"], "password": "newpw"}}]),
        );

        let Outcome::Payload(ops) = ware.handle(&mut ctx).await.unwrap() else { panic!() };
        assert_eq!(ops[0][0], "change");

        let db = scope.users().unwrap();
        let bob = db.find_by("users", "username", &json!("bob")).unwrap();
        assert_eq!(bob["fullname"], "Bob B.");
        assert_eq!(bob["member"], json!([]), "non-admin cannot grant membership");
        assert!(bob.get("password").is_none(), "plaintext password never persists");
        let hash = bob["credentials"]["hash"].as_str().unwrap();
        assert!(hearth_auth::passwords::verify_password("newpw", hash));
    }

    #[tokio::test]
    async fn user_may_not_change_another_account() {
        let scope = seeded_scope();
        let ware = AccountWare::new(scope);
        let me = active_user("bob", &["users"]);
        let ctx = ctx_as("POST", "/user/change", &[("action", "change")], Some(me));
        let mut ctx = with_body(ctx, json!([{"ref": "alice", "record": {"username": "alice", "fullname": "Hacked"}}]));
        assert_eq!(ware.handle(&mut ctx).await.unwrap_err().code(), 401);
    }

    #[tokio::test]
    async fn admin_may_create_and_delete_users() {
        let scope = seeded_scope();
        let ware = AccountWare::new(Arc::clone(&scope));
        let admin = active_user("alice", &["admin"]);

        let ctx = ctx_as("POST", "/user/change", &[("action", "change")], Some(admin.clone()));
        let mut ctx = with_body(
            ctx,
            json!([{"ref": "carol", "record": {"username": "carol", "member": ["users"], "status": "ACTIVE"}}]),
        );
        let Outcome::Payload(ops) = ware.handle(&mut ctx).await.unwrap() else { panic!() };
        assert_eq!(ops[0][0], "add");

        let ctx = ctx_as("POST", "/user/change", &[("action", "change")], Some(admin));
        let mut ctx = with_body(ctx, json!([{"ref": "carol"}]));
        let Outcome::Payload(ops) = ware.handle(&mut ctx).await.unwrap() else { panic!() };
        assert_eq!(ops[0][0], "delete");
    }

    #[tokio::test]
    async fn delete_requires_admin() {
        let scope = seeded_scope();
        let ware = AccountWare::new(scope);
        let me = active_user("bob", &["users"]);
        let ctx = ctx_as("POST", "/user/change", &[("action", "change")], Some(me));
        let mut ctx = with_body(ctx, json!([{"ref": "bob"}]));
        assert_eq!(ware.handle(&mut ctx).await.unwrap_err().code(), 401);
    }

    // ── groups ──────────────────────────────────────────────────

    #[tokio::test]
    async fn groups_maintenance_is_admin_only() {
        let scope = seeded_scope();
        let ware = AccountWare::new(Arc::clone(&scope));

        let plain = active_user("bob", &["users"]);
        let ctx = ctx_as("POST", "/user/groups", &[("action", "groups")], Some(plain));
        let mut ctx = with_body(ctx, json!([{"ref": "new", "record": {"name": "new"}}]));
        assert_eq!(ware.handle(&mut ctx).await.unwrap_err().code(), 401);

        let admin = active_user("alice", &["admin"]);
        let ctx = ctx_as("POST", "/user/groups", &[("action", "groups")], Some(admin));
        let mut ctx = with_body(ctx, json!([{"ref": "new", "record": {"name": "new", "description": "d"}}]));
        let Outcome::Payload(ops) = ware.handle(&mut ctx).await.unwrap() else { panic!() };
        assert_eq!(ops[0][0], "add");
        let db = scope.users().unwrap();
        assert!(db.find_by("groups", "name", &json!("new")).is_some());
    }
}
