use crate::scope::SiteScope;
use hearth_auth::generate_code;
use hearth_core::user::User;
use hearth_core::HttpError;
use hearth_notify::MailMessage;
use hearth_pipeline::{BodyData, Context, Outcome, Reply, ReplyBody};
use hearth_store::{ModifyEntry, Store};
use serde_json::{json, Value};

/// Seven days, the hard ceiling on granted code lifetimes.
const GRANT_MAX_MINUTES: u64 = 7 * 24 * 60;

const XML_NO_REPLIES: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Message>No one monitors this number; no replies!</Message></Response>";
const XML_EMPTY: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response></Response>";

/// `@action` dispatch. POST only, except the `twilio` webhook.
pub async fn handle(
    ctx: &mut Context,
    scope: &SiteScope,
    db: &Store,
    action: &str,
    opts: &[String],
) -> Result<Outcome, HttpError> {
    if action != "twilio" && ctx.request.verb() != "post" {
        return Err(HttpError::MethodNotAllowed);
    }

    match action {
        "grant" => grant(ctx, scope, opts).await,
        "scribe" => scribe(ctx, scope),
        "mail" => mail(ctx, scope, db).await,
        "text" => text(ctx, scope, db).await,
        "twilio" => twilio(ctx, scope, opts).await,
        other => Err(HttpError::NotImplemented(format!("Unknown action: {other}"))),
    }
}

/// Issue login short codes to a list of users, dispatched by SMS (default)
/// or mail (`mail` opt). Expiration clamps to seven days.
async fn grant(ctx: &mut Context, scope: &SiteScope, opts: &[String]) -> Result<Outcome, HttpError> {
    if !ctx.authorized(&["grant"]) {
        return Err(HttpError::Unauthorized("Not authorized to grant access".into()));
    }
    let db = scope
        .users()
        .ok_or_else(|| HttpError::NotImplemented("No user database configured".into()))?;
    let recipe = db
        .lookup("user")
        .ok_or_else(|| HttpError::NotImplemented("No user recipe".into()))?;

    let body = ctx.request.body.json().cloned().unwrap_or(Value::Null);
    let users: Vec<String> = match body.get("users") {
        Some(Value::Array(list)) => {
            list.iter().filter_map(Value::as_str).map(|s| s.to_ascii_lowercase()).collect()
        }
        _ => return Err(HttpError::BadRequest("Body must carry a users list".into())),
    };
    if users.is_empty() {
        return Err(HttpError::BadRequest("Empty users list".into()));
    }

    let minutes = body
        .get("expires")
        .and_then(Value::as_u64)
        .unwrap_or(30)
        .min(GRANT_MAX_MINUTES);
    let by_mail = opts.iter().any(|o| o == "mail");

    let mut report = serde_json::Map::new();
    for username in users {
        let Some(record) = db.find_by("users", "username", &Value::String(username.clone()))
        else {
            report.insert(username, json!({"ok": false, "error": "unknown user"}));
            continue;
        };
        let Ok(user) = serde_json::from_value::<User>(record) else {
            report.insert(username, json!({"ok": false, "error": "malformed record"}));
            continue;
        };

        let code = generate_code(6, 36, minutes);
        db.modify(
            &recipe,
            &[ModifyEntry {
                reference: Some(json!(user.username)),
                record: Some(json!({"credentials": {"passcode": code.clone()}})),
            }],
        )?;

        let message = format!(
            "{} issued a login code: {} (expires in {} minutes)",
            ctx.username().unwrap_or("admin"),
            code.code,
            minutes
        );
        let sent = if by_mail {
            scope
                .mailer
                .send(&MailMessage {
                    to: vec![user.email.clone()],
                    subject: "Access granted".into(),
                    text: message,
                    ..Default::default()
                })
                .await
        } else {
            scope.texter.send(std::slice::from_ref(&user.phone), &message).await
        };
        let ok = sent.get("ok").and_then(Value::as_bool).unwrap_or(false);
        report.insert(user.username, json!({"ok": ok, "sent": sent}));
    }
    Ok(Outcome::Payload(Value::Object(report)))
}

/// Read or set the scribe verbosity mask.
fn scribe(ctx: &Context, scope: &SiteScope) -> Result<Outcome, HttpError> {
    if !ctx.authorized(&["server"]) {
        return Err(HttpError::Unauthorized("Server authorization required".into()));
    }
    if let Some(mask) = ctx.request.body.json().and_then(|b| b.get("mask")).and_then(Value::as_str)
    {
        scope
            .scribe
            .set_mask(mask)
            .map_err(|e| HttpError::Internal(e.to_string()))?;
    }
    Ok(Outcome::Payload(json!({"mask": scope.scribe.mask()})))
}

/// Send mail, translating usernames in the address lists through the
/// users collection.
async fn mail(ctx: &Context, scope: &SiteScope, db: &Store) -> Result<Outcome, HttpError> {
    if !ctx.authorized(&["contact"]) {
        return Err(HttpError::Unauthorized("Contact authorization required".into()));
    }
    let body = ctx
        .request
        .body
        .json()
        .cloned()
        .ok_or_else(|| HttpError::BadRequest("JSON body required".into()))?;
    let mut msg: MailMessage = serde_json::from_value(body)
        .map_err(|e| HttpError::BadRequest(format!("Bad mail request: {e}")))?;

    msg.to = translate(db, &msg.to, "email");
    msg.cc = translate(db, &msg.cc, "email");
    msg.bcc = translate(db, &msg.bcc, "email");
    if let Some(from) = &msg.from {
        msg.from = translate(db, std::slice::from_ref(from), "email").into_iter().next();
    }

    let report = scope.mailer.send(&msg).await;
    Ok(Outcome::Payload(json!({"report": report})))
}

/// Send SMS, translating usernames to phone numbers.
async fn text(ctx: &Context, scope: &SiteScope, db: &Store) -> Result<Outcome, HttpError> {
    if !ctx.authorized(&["contact"]) {
        return Err(HttpError::Unauthorized("Contact authorization required".into()));
    }
    let body = ctx
        .request
        .body
        .json()
        .ok_or_else(|| HttpError::BadRequest("JSON body required".into()))?;
    let to: Vec<String> = body
        .get("to")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(Value::as_str).map(|s| s.to_string()).collect())
        .unwrap_or_default();
    let message = body.get("text").and_then(Value::as_str).unwrap_or_default();
    if to.is_empty() || message.is_empty() {
        return Err(HttpError::BadRequest("Both to and text are required".into()));
    }

    let numbers = translate(db, &to, "phone");
    let report = scope.texter.send(&numbers, message).await;
    Ok(Outcome::Payload(json!({"report": report})))
}

/// Twilio webhook. Non-status paths answer a canned "no replies" XML;
/// undelivered status reports warn and fire a callback SMS. Always XML.
async fn twilio(ctx: &Context, scope: &SiteScope, opts: &[String]) -> Result<Outcome, HttpError> {
    if opts.first().map(String::as_str) != Some("status") {
        return Ok(xml_reply(XML_NO_REPLIES));
    }

    let status = match &ctx.request.body {
        BodyData::Form(fields) => fields.get("MessageStatus").cloned().unwrap_or_default(),
        _ => String::new(),
    };
    if status == "undelivered" {
        tracing::warn!(site = %scope.name, "Twilio reports an undelivered message");
        if let Some(callback) = scope.texter.callback_number() {
            let _ = scope
                .texter
                .send(&[callback], &format!("Undelivered SMS reported for {}", scope.name))
                .await;
        }
    }
    Ok(xml_reply(XML_EMPTY))
}

fn xml_reply(body: &str) -> Outcome {
    Outcome::Reply(Reply {
        status: 200,
        headers: Vec::new(),
        body: ReplyBody::Bytes {
            content_type: "text/xml".to_string(),
            data: bytes::Bytes::from(body.to_string()),
        },
    })
}

/// Map usernames to a contact field via the users collection; entries
/// that are not usernames pass through unchanged (already addresses).
fn translate(db: &Store, list: &[String], field: &str) -> Vec<String> {
    list.iter()
        .map(|entry| {
            db.find_by("users", "username", &Value::String(entry.to_ascii_lowercase()))
                .and_then(|record| {
                    record.get(field).and_then(Value::as_str).map(|s| s.to_string())
                })
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| entry.clone())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{active_user, scope_with, test_ctx};
    use hearth_pipeline::Outcome;

    fn seeded_scope() -> std::sync::Arc<SiteScope> {
        scope_with(json!({
            "recipes": [{
                "name": "user",
                "collection": "users",
                "reference": "$.users[?(@.username == $ref)]",
                "unique": {"key": "username"},
            }],
            "users": [
                {"username": "bob", "email": "bob@x.net", "phone": "+15550002222",
                 "status": "ACTIVE", "member": [], "credentials": {"hash": ""}},
            ],
        }))
    }

    // ── Authorization gates ─────────────────────────────────────

    #[tokio::test]
    async fn grant_requires_grant_permission() {
        let scope = seeded_scope();
        let db = scope.users().unwrap();
        let mut ctx = test_ctx("POST", "/@grant", vec![]);
        ctx.user = Some(active_user("bob", &["users"]));
        let err = handle(&mut ctx, &scope, &db, "grant", &[]).await.unwrap_err();
        assert_eq!(err.code(), 401);
    }

    #[tokio::test]
    async fn actions_other_than_twilio_are_post_only() {
        let scope = seeded_scope();
        let db = scope.users().unwrap();
        let mut ctx = test_ctx("GET", "/@mail", vec![]);
        ctx.user = Some(active_user("a", &["admin"]));
        let err = handle(&mut ctx, &scope, &db, "mail", &[]).await.unwrap_err();
        assert_eq!(err.code(), 405);
    }

    // ── grant ───────────────────────────────────────────────────

    #[tokio::test]
    async fn grant_stores_code_and_reports_per_user() {
        let scope = seeded_scope();
        let db = scope.users().unwrap();
        let mut ctx = test_ctx("POST", "/@grant", vec![]);
        ctx.user = Some(active_user("root", &["admin"]));
        ctx.request.body = BodyData::Json(json!({"users": ["bob", "ghost"], "expires": 99999999}));

        let Outcome::Payload(report) = handle(&mut ctx, &scope, &db, "grant", &[]).await.unwrap()
        else {
            panic!()
        };
        // Unknown users are reported, not fatal.
        assert_eq!(report["ghost"]["ok"], false);
        // The transport is unconfigured in tests, so sending fails, but
        // the code must still be stored with a clamped expiry.
        let bob = db.find_by("users", "username", &json!("bob")).unwrap();
        let passcode = &bob["credentials"]["passcode"];
        assert_eq!(passcode["code"].as_str().unwrap().len(), 6);
        assert_eq!(passcode["exp"], GRANT_MAX_MINUTES * 60);
    }

    // ── scribe ──────────────────────────────────────────────────

    #[tokio::test]
    async fn scribe_gets_and_sets_mask() {
        let scope = seeded_scope();
        let db = scope.users().unwrap();
        let mut ctx = test_ctx("POST", "/@scribe", vec![]);
        ctx.user = Some(active_user("ops", &["server"]));
        ctx.request.body = BodyData::Json(json!({"mask": "debug"}));

        let Outcome::Payload(v) = handle(&mut ctx, &scope, &db, "scribe", &[]).await.unwrap()
        else {
            panic!()
        };
        assert_eq!(v["mask"], "debug");
        assert_eq!(scope.scribe.mask(), "debug");
    }

    // ── mail/text translation ───────────────────────────────────

    #[test]
    fn translate_maps_usernames_and_passes_addresses() {
        let scope = seeded_scope();
        let db = scope.users().unwrap();
        let out = translate(&db, &["bob".into(), "carol@elsewhere.net".into()], "email");
        assert_eq!(out, vec!["bob@x.net".to_string(), "carol@elsewhere.net".to_string()]);
        let out = translate(&db, &["Bob".into()], "phone");
        assert_eq!(out, vec!["+15550002222".to_string()]);
    }

    #[tokio::test]
    async fn mail_requires_contact_permission() {
        let scope = seeded_scope();
        let db = scope.users().unwrap();
        let mut ctx = test_ctx("POST", "/@mail", vec![]);
        ctx.user = Some(active_user("bob", &["users"]));
        ctx.request.body = BodyData::Json(json!({"to": ["bob"], "subject": "s", "text": "t"}));
        assert_eq!(handle(&mut ctx, &scope, &db, "mail", &[]).await.unwrap_err().code(), 401);
    }

    // ── twilio ──────────────────────────────────────────────────

    #[tokio::test]
    async fn twilio_non_status_answers_canned_xml() {
        let scope = seeded_scope();
        let db = scope.users().unwrap();
        let mut ctx = test_ctx("POST", "/@twilio", vec![]);
        let Outcome::Reply(reply) = handle(&mut ctx, &scope, &db, "twilio", &[]).await.unwrap()
        else {
            panic!()
        };
        match reply.body {
            ReplyBody::Bytes { content_type, data } => {
                assert_eq!(content_type, "text/xml");
                assert!(String::from_utf8_lossy(&data).contains("no replies"));
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[tokio::test]
    async fn twilio_status_answers_empty_xml() {
        let scope = seeded_scope();
        let db = scope.users().unwrap();
        let mut ctx = test_ctx("POST", "/@twilio/status", vec![]);
        ctx.request.body = BodyData::Form(
            [("MessageStatus".to_string(), "delivered".to_string())].into_iter().collect(),
        );
        let Outcome::Reply(reply) =
            handle(&mut ctx, &scope, &db, "twilio", &["status".to_string()]).await.unwrap()
        else {
            panic!()
        };
        match reply.body {
            ReplyBody::Bytes { data, .. } => {
                assert_eq!(String::from_utf8_lossy(&data), XML_EMPTY);
            }
            other => panic!("unexpected body {other:?}"),
        }
    }
}
