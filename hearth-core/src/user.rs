use crate::ADMIN_GROUP;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Account lifecycle states. Only ACTIVE users authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountStatus {
    #[default]
    Pending,
    Active,
    Inactive,
}

/// Secrets attached to a user record. Never serialized into responses;
/// callers project through [`User::profile`] instead.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Credentials {
    /// bcrypt password hash.
    #[serde(default)]
    pub hash: String,

    /// Time-limited one-shot login code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passcode: Option<Passcode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Passcode {
    pub code: String,
    /// Issue time, unix seconds.
    pub iat: u64,
    /// Lifetime, seconds.
    pub exp: u64,
}

/// A user record as stored in a site's `users` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,

    #[serde(default)]
    pub credentials: Credentials,

    #[serde(default)]
    pub member: Vec<String>,

    #[serde(default)]
    pub status: AccountStatus,

    #[serde(default)]
    pub fullname: String,

    #[serde(default)]
    pub phone: String,

    #[serde(default)]
    pub email: String,

    #[serde(default)]
    pub other: Value,
}

impl User {
    /// Public projection, safe to embed in tokens and responses. Does not
    /// contain `credentials`.
    pub fn profile(&self) -> Value {
        json!({
            "username": self.username,
            "member": self.member,
            "status": self.status,
            "fullname": self.fullname,
            "phone": self.phone,
            "email": self.email,
            "other": self.other,
        })
    }

    /// True when the user belongs to any of `allowed`, or to the admin
    /// group.
    pub fn authorized(&self, allowed: &[&str]) -> bool {
        self.member.iter().any(|g| g == ADMIN_GROUP)
            || self.member.iter().any(|g| allowed.iter().any(|a| a == g))
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

/// Strip any `credentials` key from a record tree, recursively. Applied to
/// every payload that could carry user records out of the process.
pub fn scrub_credentials(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove("credentials");
            for v in map.values_mut() {
                scrub_credentials(v);
            }
        }
        Value::Array(items) => {
            for v in items {
                scrub_credentials(v);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(member: &[&str], status: AccountStatus) -> User {
        User {
            username: "alice".into(),
            credentials: Credentials { hash: "$2b$11$abc".into(), passcode: None },
            member: member.iter().map(|s| s.to_string()).collect(),
            status,
            fullname: "Alice Example".into(),
            phone: "+15551234567".into(),
            email: "alice@example.net".into(),
            other: Value::Null,
        }
    }

    // ── Authorization ───────────────────────────────────────────

    #[test]
    fn member_of_allowed_group_is_authorized() {
        let u = user(&["users"], AccountStatus::Active);
        assert!(u.authorized(&["users", "managers"]));
    }

    #[test]
    fn admin_is_always_authorized() {
        let u = user(&["admin"], AccountStatus::Active);
        assert!(u.authorized(&["whatever"]));
        assert!(u.authorized(&[]));
    }

    #[test]
    fn outsider_is_not_authorized() {
        let u = user(&["users"], AccountStatus::Active);
        assert!(!u.authorized(&["managers"]));
    }

    // ── Profile projection ──────────────────────────────────────

    #[test]
    fn profile_never_contains_credentials() {
        let u = user(&["users"], AccountStatus::Active);
        let profile = u.profile();
        assert!(profile.get("credentials").is_none());
        assert_eq!(profile["username"], "alice");
        assert_eq!(profile["member"][0], "users");
    }

    #[test]
    fn status_serializes_uppercase() {
        let u = user(&[], AccountStatus::Pending);
        let v = serde_json::to_value(&u).unwrap();
        assert_eq!(v["status"], "PENDING");
    }

    #[test]
    fn record_with_unknown_status_defaults_to_pending() {
        let u: User = serde_json::from_value(json!({"username": "bob"})).unwrap();
        assert_eq!(u.status, AccountStatus::Pending);
        assert!(!u.is_active());
    }

    // ── Credential scrubbing ────────────────────────────────────

    #[test]
    fn scrub_removes_credentials_at_any_depth() {
        let mut v = json!({
            "users": [
                {"username": "a", "credentials": {"hash": "h"}},
                {"nested": {"credentials": {"hash": "h2"}, "keep": 1}}
            ],
            "credentials": {"hash": "top"}
        });
        scrub_credentials(&mut v);
        assert!(v.get("credentials").is_none());
        assert!(v["users"][0].get("credentials").is_none());
        assert!(v["users"][1]["nested"].get("credentials").is_none());
        assert_eq!(v["users"][1]["nested"]["keep"], 1);
    }
}
