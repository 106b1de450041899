use crate::scope::SiteScope;
use chrono::{Datelike, Timelike, Utc};
use hearth_core::HttpError;
use hearth_pipeline::{Context, Outcome};
use serde_json::{json, Value};
use std::net::IpAddr;

/// `!recipe` — request/server introspection, GET only.
///
/// Everyone gets their own address and the clock; `server`-authorized
/// callers also get statistics, analytics, blacklists, and login history.
/// The special recipe `iot` answers a compact payload for constrained
/// clients.
pub fn handle(ctx: &Context, scope: &SiteScope, recipe: &str) -> Result<Outcome, HttpError> {
    if ctx.request.verb() != "get" && ctx.request.verb() != "head" {
        return Err(HttpError::MethodNotAllowed);
    }

    let now = Utc::now();
    let ip = ip_block(&ctx.request.remote_ip, ctx.request.remote_port);

    if recipe == "iot" {
        return Ok(Outcome::Payload(json!({
            "ip": ctx.request.remote_ip,
            "time": now.timestamp(),
            "iso": now.to_rfc3339(),
        })));
    }

    let mut payload = json!({
        "ip": ip,
        "date": {
            "epoch": now.timestamp(),
            "iso": now.to_rfc3339(),
            "utc": {
                "year": now.year(),
                "month": now.month(),
                "day": now.day(),
                "hour": now.hour(),
                "minute": now.minute(),
                "second": now.second(),
            },
        },
    });

    if ctx.authorized(&["server"])
        && let Some(obj) = payload.as_object_mut()
    {
        obj.insert("statistics".to_string(), scope.stats.snapshot());
        obj.insert("analytics".to_string(), json!({
            "ip": scope.stats.snapshot_tag("ip"),
            "page": scope.stats.snapshot_tag("page"),
            "user": scope.stats.snapshot_tag("user"),
        }));
        obj.insert("blacklist".to_string(), scope.stats.snapshot_tag("blacklist"));
        obj.insert("logins".to_string(), scope.throttle.history());
    }

    Ok(Outcome::Payload(payload))
}

fn ip_block(raw: &str, port: u16) -> Value {
    let parsed: Option<IpAddr> = raw.parse().ok();
    let (v4, v6) = match parsed {
        Some(IpAddr::V4(ip)) => (ip.to_string(), ip.to_ipv6_mapped().to_string()),
        Some(IpAddr::V6(ip)) => (
            ip.to_ipv4_mapped().map(|m| m.to_string()).unwrap_or_default(),
            ip.to_string(),
        ),
        None => (String::new(), String::new()),
    };
    json!({"raw": raw, "v4": v4, "v6": v6, "port": port})
}
