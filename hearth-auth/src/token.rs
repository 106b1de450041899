use crate::unix_now;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde_json::{json, Map, Value};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Parsed but unvalidated token pieces, as returned by
/// [`TokenService::extract`].
#[derive(Debug, Clone)]
pub struct TokenParts {
    pub header: Value,
    pub payload: Value,
    pub signature: Vec<u8>,
}

/// Mints and verifies compact three-part signed tokens.
///
/// `header.payload.signature`, each part URL-safe base64 without padding;
/// the signature is HMAC-SHA256 over `header.payload`. The payload carries
/// `iat` (unix seconds), `exp` (lifetime in seconds, not an absolute
/// time), and `ext` (renewal allowed).
pub struct TokenService {
    secret: Vec<u8>,
}

impl TokenService {
    /// Use a configured secret, or a random 256-bit one for this process.
    pub fn new(secret: Option<&str>) -> Self {
        let secret = match secret {
            Some(s) if !s.is_empty() => s.as_bytes().to_vec(),
            _ => {
                let mut bytes = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                tracing::info!("No token secret configured; using a process-local random secret");
                bytes
            }
        };
        Self { secret }
    }

    /// Mint a token over `payload`, augmented with `iat`, `exp`, `ext`.
    pub fn create(&self, payload: &Value, exp_secs: u64, renewal: bool) -> String {
        let header = json!({"alg": "HS256", "typ": "JWT"});

        let mut claims: Map<String, Value> = match payload {
            Value::Object(map) => map.clone(),
            other => {
                let mut m = Map::new();
                if !other.is_null() {
                    m.insert("sub".to_string(), other.clone());
                }
                m
            }
        };
        claims.insert("iat".to_string(), json!(unix_now()));
        claims.insert("exp".to_string(), json!(exp_secs));
        claims.insert("ext".to_string(), json!(renewal));

        let head = URL_SAFE_NO_PAD.encode(header.to_string());
        let body = URL_SAFE_NO_PAD.encode(Value::Object(claims).to_string());
        let signed = format!("{head}.{body}");
        let sig = URL_SAFE_NO_PAD.encode(self.sign(signed.as_bytes()));
        format!("{signed}.{sig}")
    }

    /// Verify signature (constant time) and expiry. Returns the payload,
    /// or `None` for anything tampered, malformed, or expired.
    pub fn verify(&self, token: &str) -> Option<Value> {
        let (signed, sig) = token.rsplit_once('.')?;
        let sig = URL_SAFE_NO_PAD.decode(sig).ok()?;

        let mut mac = HmacSha256::new_from_slice(&self.secret).ok()?;
        mac.update(signed.as_bytes());
        mac.verify_slice(&sig).ok()?;

        let (_, body) = signed.split_once('.')?;
        let payload: Value = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(body).ok()?).ok()?;

        let iat = payload.get("iat").and_then(Value::as_u64)?;
        let exp = payload.get("exp").and_then(Value::as_u64)?;
        if exp > 0 && unix_now() >= iat + exp {
            return None;
        }
        Some(payload)
    }

    /// Parse only; no signature or expiry validation.
    pub fn extract(token: &str) -> Option<TokenParts> {
        let mut parts = token.split('.');
        let head = parts.next()?;
        let body = parts.next()?;
        let sig = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        Some(TokenParts {
            header: serde_json::from_slice(&URL_SAFE_NO_PAD.decode(head).ok()?).ok()?,
            payload: serde_json::from_slice(&URL_SAFE_NO_PAD.decode(body).ok()?).ok()?,
            signature: URL_SAFE_NO_PAD.decode(sig).ok()?,
        })
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc() -> TokenService {
        TokenService::new(Some("test-secret"))
    }

    // ── Round trip ──────────────────────────────────────────────

    #[test]
    fn minted_token_verifies_with_same_payload() {
        let svc = svc();
        let payload = json!({"username": "alice", "member": ["users"]});
        let token = svc.create(&payload, 3600, false);

        let verified = svc.verify(&token).expect("fresh token must verify");
        assert_eq!(verified["username"], "alice");
        assert_eq!(verified["member"][0], "users");
        assert_eq!(verified["exp"], 3600);
        assert_eq!(verified["ext"], false);
        assert!(verified["iat"].as_u64().unwrap() > 0);
    }

    #[test]
    fn token_is_three_url_safe_parts() {
        let token = svc().create(&json!({"u": 1}), 60, true);
        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);
        for part in parts {
            assert!(!part.contains('='), "no padding allowed: {part}");
            assert!(part.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
    }

    // ── Rejections ──────────────────────────────────────────────

    #[test]
    fn tampered_payload_is_rejected() {
        let svc = svc();
        let token = svc.create(&json!({"username": "alice"}), 3600, false);
        let (signed, sig) = token.rsplit_once('.').unwrap();
        let (head, _) = signed.split_once('.').unwrap();
        let forged_body = URL_SAFE_NO_PAD.encode(r#"{"username":"admin","iat":1,"exp":0}"#);
        assert!(svc.verify(&format!("{head}.{forged_body}.{sig}")).is_none());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = svc().create(&json!({"u": 1}), 3600, false);
        assert!(TokenService::new(Some("other")).verify(&token).is_none());
    }

    #[test]
    fn expired_token_is_rejected() {
        let svc = svc();
        // exp of 0 with positive guard disabled means non-expiring; build an
        // already-expired one by hand instead.
        let mut payload = json!({"username": "alice"});
        payload["iat"] = json!(unix_now() - 7200);
        payload["exp"] = json!(3600u64);
        let head = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string());
        let signed = format!("{head}.{body}");
        let sig = URL_SAFE_NO_PAD.encode(svc.sign(signed.as_bytes()));
        assert!(svc.verify(&format!("{signed}.{sig}")).is_none());
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let svc = svc();
        assert!(svc.verify("").is_none());
        assert!(svc.verify("only-one-part").is_none());
        assert!(svc.verify("a.b").is_none());
        assert!(svc.verify("!!.!!.!!").is_none());
    }

    // ── Extract ─────────────────────────────────────────────────

    #[test]
    fn extract_parses_without_validating() {
        let svc = svc();
        let token = svc.create(&json!({"username": "bob"}), 60, true);
        let parts = TokenService::extract(&token).unwrap();
        assert_eq!(parts.header["alg"], "HS256");
        assert_eq!(parts.payload["username"], "bob");
        assert_eq!(parts.payload["ext"], true);
        assert!(!parts.signature.is_empty());
    }

    #[test]
    fn extract_rejects_wrong_part_count() {
        assert!(TokenService::extract("a.b").is_none());
        assert!(TokenService::extract("a.b.c.d").is_none());
    }

    // ── Secrets ─────────────────────────────────────────────────

    #[test]
    fn random_secret_services_disagree() {
        let a = TokenService::new(None);
        let b = TokenService::new(None);
        let token = a.create(&json!({"u": 1}), 60, false);
        assert!(a.verify(&token).is_some());
        assert!(b.verify(&token).is_none());
    }
}
