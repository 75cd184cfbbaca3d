//! Crate-wide error taxonomy.
//!
//! Failures keep the remote status code when one exists so the embedding
//! UI can render a status-qualified message. Transport failures with no
//! response at all are the distinct [`Error::Network`] kind; everything
//! else was an answer we did not like.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The remote reports a missing server-side credential. A deployment
    /// problem: surfaced immediately, never retried.
    #[error("server-side credential is not configured")]
    ConfigMissing,

    /// The remote answered with a non-success envelope.
    #[error("remote rejected the request (status {status})")]
    RemoteRejected { status: u16, detail: String },

    /// Success status, but none of the known payload fields was present.
    #[error("response carried no usable payload")]
    NoPayload,

    /// No response at all (DNS, connect, read, or decode at transport level).
    #[error("network error: {0}")]
    Network(String),

    #[error("{0} must not be empty")]
    EmptyInput(&'static str),

    #[error("chat session start failed{}", fmt_status(.status))]
    ChatStartFailed { status: Option<u16> },

    #[error("chat send failed{}", fmt_status(.status))]
    SendFailed { status: Option<u16>, detail: String },

    /// The token endpoint answered without a usable streaming token.
    #[error("no streaming token in response")]
    TokenMissing,

    /// The vendor media bridge could not be loaded by the host.
    #[error("media sdk unavailable")]
    SdkUnavailable,

    /// The media session never signalled ready within the allowed window.
    #[error("stream not ready within {0:?}")]
    NotReadyTimeout(Duration),

    /// The media transport dropped. Expected transient; feeds the
    /// reconnect policy rather than the user.
    #[error("stream disconnected")]
    Disconnected,

    #[error("gave up after {attempts} connection attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("microphone permission denied")]
    MicBlocked,

    #[error("speech recognition is not available on this platform")]
    MicUnsupported,

    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl Error {
    /// Remote status code, when this failure carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RemoteRejected { status, .. } => Some(*status),
            Self::ChatStartFailed { status } | Self::SendFailed { status, .. } => *status,
            _ => None,
        }
    }

    /// Remote error body, when this failure preserved one.
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::RemoteRejected { detail, .. } | Self::SendFailed { detail, .. } => {
                Some(detail.as_str())
            }
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

fn fmt_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (status {code})"),
        None => String::new(),
    }
}

// ── Tests ───────────────────────────────────────────────────────
