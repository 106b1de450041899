//! Outbound messaging collaborators: SendGrid email and Twilio SMS.
//!
//! Both transports return the provider response as a JSON report that
//! passes through unchanged into action reports. Unconfigured transports
//! answer every send with an error report instead of failing the request.

use hearth_core::config::{MailConfig, SmsConfig};
use serde::Deserialize;
use serde_json::{json, Value};

/// An outbound email. Addresses are already resolved; username
/// translation happens in the action layer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MailMessage {
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub text: String,
}

/// SendGrid v3 mail transport.
pub struct Mailer {
    client: reqwest::Client,
    cfg: Option<MailConfig>,
}

impl Mailer {
    pub fn new(client: reqwest::Client, cfg: Option<MailConfig>) -> Self {
        Self { client, cfg }
    }

    pub fn configured(&self) -> bool {
        self.cfg.is_some()
    }

    /// Send one message; the report mirrors the provider response.
    pub async fn send(&self, msg: &MailMessage) -> Value {
        let Some(cfg) = &self.cfg else {
            return json!({"ok": false, "error": "mail transport not configured"});
        };
        if msg.to.is_empty() {
            return json!({"ok": false, "error": "no recipients"});
        }

        let personalization = {
            let mut p = json!({ "to": address_list(&msg.to) });
            if !msg.cc.is_empty() {
                p["cc"] = address_list(&msg.cc);
            }
            if !msg.bcc.is_empty() {
                p["bcc"] = address_list(&msg.bcc);
            }
            p
        };
        let body = json!({
            "personalizations": [personalization],
            "from": {"email": msg.from.clone().unwrap_or_else(|| cfg.from.clone())},
            "subject": msg.subject,
            "content": [{"type": "text/plain", "value": msg.text}],
        });

        let result = self
            .client
            .post(&cfg.endpoint)
            .bearer_auth(&cfg.api_key)
            .json(&body)
            .send()
            .await;

        match result {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let detail = resp.json::<Value>().await.unwrap_or(Value::Null);
                if (200..300).contains(&status) {
                    json!({"ok": true, "status": status, "response": detail})
                } else {
                    tracing::warn!(status, "Mail send rejected");
                    json!({"ok": false, "status": status, "response": detail})
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Mail send failed");
                json!({"ok": false, "error": e.to_string()})
            }
        }
    }
}

/// Twilio SMS transport.
pub struct Texter {
    client: reqwest::Client,
    cfg: Option<SmsConfig>,
}

impl Texter {
    pub fn new(client: reqwest::Client, cfg: Option<SmsConfig>) -> Self {
        Self { client, cfg }
    }

    pub fn configured(&self) -> bool {
        self.cfg.is_some()
    }

    /// Number texted when the provider reports an undelivered message.
    pub fn callback_number(&self) -> Option<String> {
        self.cfg.as_ref().and_then(|c| c.callback.clone())
    }

    /// Send `body` to each number; per-number results aggregate into one
    /// report.
    pub async fn send(&self, to: &[String], body: &str) -> Value {
        let Some(cfg) = &self.cfg else {
            return json!({"ok": false, "error": "sms transport not configured"});
        };
        if to.is_empty() {
            return json!({"ok": false, "error": "no recipients"});
        }

        let url = format!("{}/Accounts/{}/Messages.json", cfg.endpoint, cfg.account_sid);
        let mut reports = Vec::with_capacity(to.len());
        let mut all_ok = true;

        for number in to {
            let form = [("To", number.as_str()), ("From", cfg.from.as_str()), ("Body", body)];
            let result = self
                .client
                .post(&url)
                .basic_auth(&cfg.account_sid, Some(&cfg.auth_token))
                .form(&form)
                .send()
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let detail = resp.json::<Value>().await.unwrap_or(Value::Null);
                    let ok = (200..300).contains(&status);
                    all_ok &= ok;
                    if !ok {
                        tracing::warn!(status, to = %number, "SMS send rejected");
                    }
                    reports.push(json!({"to": number, "ok": ok, "status": status, "response": detail}));
                }
                Err(e) => {
                    all_ok = false;
                    tracing::error!(error = %e, to = %number, "SMS send failed");
                    reports.push(json!({"to": number, "ok": false, "error": e.to_string()}));
                }
            }
        }

        json!({"ok": all_ok, "reports": reports})
    }
}

fn address_list(addrs: &[String]) -> Value {
    Value::Array(addrs.iter().map(|a| json!({"email": a})).collect())
}
