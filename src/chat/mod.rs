//! Chat session ownership: identity, persistence, expiry recovery.
//!
//! ## Design
//! - at most one id is current; a fresh id fully replaces the prior one
//!   and the prior id is never retried
//! - `send` recovers from a likely-expired session exactly once with a
//!   brand-new id; a second failure surfaces unmodified
//! - the durable slot is written only by this manager

pub mod store;

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::gateway::ChatBackend;
use store::{ChatSession, SessionStore};

/// Error-text pattern suggesting the remote no longer tracks the session.
/// Best effort: a false negative surfaces the original error, a false
/// positive costs one extra start call.
const EXPIRED_PATTERN: &str = r"(?i)expired|invalid|not.*ongoing|bad request";

fn expired_matcher() -> &'static Regex {
    static MATCHER: OnceLock<Regex> = OnceLock::new();
    MATCHER.get_or_init(|| Regex::new(EXPIRED_PATTERN).expect("static pattern compiles"))
}

/// Owns chat-session identity across sends, reloads, and expiry.
pub struct ChatSessionManager {
    backend: Arc<dyn ChatBackend>,
    store: Arc<dyn SessionStore>,
    current: Mutex<Option<String>>,
}

impl ChatSessionManager {
    pub fn new(backend: Arc<dyn ChatBackend>, store: Arc<dyn SessionStore>) -> Self {
        Self {
            backend,
            store,
            current: Mutex::new(None),
        }
    }

    /// Resolve the current chat id, minting one only when needed.
    ///
    /// With `force_new` false, an id already held in memory or in the
    /// durable slot is returned without a network call.
    pub async fn ensure(&self, force_new: bool) -> Result<String> {
        if !force_new {
            if let Some(id) = self.current.lock().clone() {
                return Ok(id);
            }
            if let Some(saved) = self.store.load()? {
                tracing::debug!(chat_id = %saved.id, "resumed chat session from storage");
                *self.current.lock() = Some(saved.id.clone());
                return Ok(saved.id);
            }
        }

        let id = match self.backend.start_chat().await {
            Ok(id) => id,
            Err(Error::ConfigMissing) => return Err(Error::ConfigMissing),
            Err(err @ Error::Network(_)) => return Err(err),
            Err(err) => {
                let status = err.status();
                tracing::warn!(?status, error = %err, "chat session start failed");
                return Err(Error::ChatStartFailed { status });
            }
        };

        let session = ChatSession::new(id.clone());
        *self.current.lock() = Some(id.clone());
        self.store.save(&session)?;
        tracing::info!(chat_id = %id, "chat session started");
        Ok(id)
    }

    /// Send one message, recovering once from a likely-expired session.
    pub async fn send(&self, text: &str) -> Result<String> {
        let id = self.ensure(false).await?;
        match self.backend.send_chat(&id, text).await {
            Ok(reply) => Ok(reply),
            Err(err) if likely_expired(&err) => {
                tracing::info!(
                    chat_id = %id,
                    error = %err,
                    "send failed on likely-expired session; retrying once with a fresh id"
                );
                let fresh = self.ensure(true).await?;
                self.backend
                    .send_chat(&fresh, text)
                    .await
                    .map_err(into_send_failed)
            }
            Err(err) => Err(into_send_failed(err)),
        }
    }

    /// Drop the cached and persisted id; the next `ensure` mints fresh.
    pub fn restart(&self) -> Result<()> {
        *self.current.lock() = None;
        self.store.clear()
    }
}

/// Heuristic classifier for an expired or invalid session. Network-level
/// failures are never treated as expiry.
fn likely_expired(err: &Error) -> bool {
    if matches!(err, Error::Network(_)) {
        return false;
    }
    if err.status() == Some(400) {
        return true;
    }
    let matcher = expired_matcher();
    err.detail().is_some_and(|d| matcher.is_match(d)) || matcher.is_match(&err.to_string())
}

fn into_send_failed(err: Error) -> Error {
    match err {
        Error::Network(_) | Error::ConfigMissing => err,
        other => {
            let status = other.status();
            let detail = other.detail().unwrap_or_default().to_string();
            Error::SendFailed { status, detail }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────
