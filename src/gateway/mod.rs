//! Credential gateway: the three remote operations the orchestrator
//! consumes, behind one trait.
//!
//! ## Design
//! - `ChatBackend` is the seam; [`HttpGateway`] is the production
//!   implementation over the widget's proxy routes
//! - Remote payloads are duck-typed: deployed proxies disagree on field
//!   names, so extraction walks an ordered candidate list and the first
//!   non-empty string wins. The candidate lists live here and nowhere else
//! - No retries here. Retrying is a policy of the session managers

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{Error, Result};

/// Route minting a chat session id.
const CHAT_START_PATH: &str = "/api/chat/start";
/// Route forwarding one user message.
const CHAT_SEND_PATH: &str = "/api/chat/send";
/// Route minting a short-lived streaming token.
const STREAM_TOKEN_PATH: &str = "/api/stream-token";

/// Candidate fields for the streaming token, in trust order.
const TOKEN_FIELDS: &[&str] = &["/token", "/data/token", "/accessToken"];
/// Candidate fields for the chat session id.
const CHAT_ID_FIELDS: &[&str] = &["/chatId", "/chat_id", "/data/chatId", "/id"];
/// Candidate fields for the assistant reply.
const REPLY_FIELDS: &[&str] = &["/reply", "/message", "/text"];

/// The three opaque remote operations the orchestrator is built on.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Mint a new chat session; returns its id.
    async fn start_chat(&self) -> Result<String>;

    /// Forward one message into an existing session; returns the reply.
    async fn send_chat(&self, chat_id: &str, text: &str) -> Result<String>;

    /// Mint a short-lived streaming token for the media session.
    async fn stream_token(&self) -> Result<String>;
}

/// Production gateway over the widget's HTTP proxy routes.
///
/// One `reqwest::Client` is built at construction and reused for every
/// call.
pub struct HttpGateway {
    http: reqwest::Client,
    base: String,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn get(&self, path: &str) -> Result<(u16, Value)> {
        let response = self.http.get(self.url(path)).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok((status, parse_body(&body)))
    }

    async fn post(&self, path: &str, payload: &Value) -> Result<(u16, Value)> {
        let response = self.http.post(self.url(path)).json(payload).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok((status, parse_body(&body)))
    }
}

#[async_trait]
impl ChatBackend for HttpGateway {
    async fn start_chat(&self) -> Result<String> {
        let (status, body) = self.get(CHAT_START_PATH).await?;
        check_envelope(status, &body)?;
        let id = first_string(&body, CHAT_ID_FIELDS).ok_or(Error::NoPayload)?;
        tracing::debug!(chat_id = %id, "chat session minted");
        Ok(id)
    }

    async fn send_chat(&self, chat_id: &str, text: &str) -> Result<String> {
        if chat_id.trim().is_empty() {
            return Err(Error::EmptyInput("chat_id"));
        }
        if text.trim().is_empty() {
            return Err(Error::EmptyInput("text"));
        }
        let payload = json!({ "chatId": chat_id, "text": text });
        let (status, body) = self.post(CHAT_SEND_PATH, &payload).await?;
        check_envelope(status, &body)?;
        first_string(&body, REPLY_FIELDS).ok_or(Error::NoPayload)
    }

    async fn stream_token(&self) -> Result<String> {
        let (status, body) = self.get(STREAM_TOKEN_PATH).await?;
        check_envelope(status, &body)?;
        first_string(&body, TOKEN_FIELDS).ok_or(Error::NoPayload)
    }
}

/// The proxies answer JSON on the happy path but are not guaranteed to on
/// errors; anything unparseable is treated as an empty body.
fn parse_body(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or(Value::Null)
}

/// Walk `candidates` (JSON pointers) over `value`; first non-empty string
/// wins.
fn first_string(value: &Value, candidates: &[&str]) -> Option<String> {
    candidates.iter().find_map(|pointer| {
        value
            .pointer(pointer)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

/// Accept a success envelope or classify the rejection.
///
/// The proxies report failure two ways: a non-2xx HTTP status, or a 2xx
/// answer whose body carries `ok: false` plus the upstream status.
fn check_envelope(http_status: u16, body: &Value) -> Result<()> {
    let ok_flag = body.get("ok").and_then(Value::as_bool);
    if (200..300).contains(&http_status) && ok_flag != Some(false) {
        return Ok(());
    }

    let status = body
        .get("status")
        .and_then(Value::as_u64)
        .map(|s| s as u16)
        .unwrap_or(http_status);
    let detail = match body.get("error") {
        Some(Value::String(s)) => s.clone(),
        Some(v) if !v.is_null() => v.to_string(),
        _ => String::new(),
    };

    if is_config_missing(&detail) {
        tracing::error!("remote reports a missing server-side credential");
        return Err(Error::ConfigMissing);
    }
    tracing::debug!(status, detail = %detail, "remote rejected request");
    Err(Error::RemoteRejected { status, detail })
}

/// A deployment problem, not a transient: the proxy says its own
/// credential is absent.
fn is_config_missing(detail: &str) -> bool {
    let lower = detail.to_ascii_lowercase();
    lower == "config" || (lower.contains("missing") && lower.contains("key"))
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_string_respects_candidate_order() {
        let body = json!({ "accessToken": "b", "token": "a" });
        assert_eq!(first_string(&body, TOKEN_FIELDS), Some("a".into()));

        let nested = json!({ "data": { "token": "nested" } });
        assert_eq!(first_string(&nested, TOKEN_FIELDS), Some("nested".into()));
    }

    #[test]
    fn first_string_skips_empty_and_non_string_values() {
        let body = json!({ "token": "", "data": { "token": 42 }, "accessToken": "  t  " });
        assert_eq!(first_string(&body, TOKEN_FIELDS), Some("t".into()));
        assert_eq!(first_string(&json!({}), TOKEN_FIELDS), None);
    }

    #[test]
    fn reply_falls_back_across_known_names() {
        assert_eq!(
            first_string(&json!({ "message": "hi" }), REPLY_FIELDS),
            Some("hi".into())
        );
        assert_eq!(
            first_string(&json!({ "text": "hi" }), REPLY_FIELDS),
            Some("hi".into())
        );
    }

    #[test]
    fn envelope_accepts_plain_success() {
        assert!(check_envelope(200, &json!({ "ok": true, "reply": "x" })).is_ok());
        // proxies that omit the ok flag entirely
        assert!(check_envelope(200, &json!({ "reply": "x" })).is_ok());
    }

    #[test]
    fn body_level_status_wins_over_transport_status() {
        // a 200 answer wrapping an upstream 400
        let err = check_envelope(200, &json!({ "ok": false, "status": 400, "error": "BAD_REQUEST" }))
            .unwrap_err();
        assert_eq!(err.status(), Some(400));
    }

    #[test]
    fn transport_status_used_when_body_has_none() {
        let err = check_envelope(503, &Value::Null).unwrap_err();
        assert_eq!(err.status(), Some(503));
    }

    #[test]
    fn missing_credential_is_config_missing() {
        let err =
            check_envelope(500, &json!({ "ok": false, "error": "Missing STREAM_API_KEY" }))
                .unwrap_err();
        assert!(matches!(err, Error::ConfigMissing));

        let err = check_envelope(200, &json!({ "ok": false, "status": 500, "error": "CONFIG" }))
            .unwrap_err();
        assert!(matches!(err, Error::ConfigMissing));
    }

    #[test]
    fn object_error_bodies_are_preserved_as_detail() {
        let err = check_envelope(
            200,
            &json!({ "ok": false, "status": 400, "error": { "message": "chat is not ongoing" } }),
        )
        .unwrap_err();
        assert!(err.detail().unwrap_or_default().contains("not ongoing"));
    }

    #[test]
    fn unparseable_bodies_become_null() {
        assert_eq!(parse_body("not json"), Value::Null);
        assert_eq!(parse_body(""), Value::Null);
    }
}
