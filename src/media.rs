//! Seam to the vendor streaming-avatar SDK and the page's media output.
//!
//! The real SDK lives in the embedding host. This crate consumes only the
//! narrow capability the orchestrator needs: open a session with a
//! short-lived token, speak text, disconnect, and receive the two
//! lifecycle events on a single channel. Hosts whose vendor bridge fails
//! to load return [`crate::Error::SdkUnavailable`] from `connect`, which
//! feeds the reconnect policy like any other failed attempt.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

/// Rendering quality requested from the vendor on connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    #[default]
    Medium,
    High,
}

impl Quality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Options forwarded to the vendor when opening a stream session.
#[derive(Debug, Clone)]
pub struct AvatarOptions {
    /// Vendor-side avatar identifier.
    pub avatar_id: String,
    pub quality: Quality,
}

/// Opaque identifier of a live audio/video stream, handed to the output
/// sink on the ready transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream(pub String);

/// Lifecycle events of a live media session.
///
/// Exactly two cases, delivered through one channel per session; there is
/// no listener registration to scatter across call sites.
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// The session is live and carries a stream for the output sink.
    Ready { stream: MediaStream },
    /// The transport dropped.
    Disconnected,
}

/// How spoken text is rendered by the vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    /// Speak the text verbatim, no rephrasing.
    Repeat,
}

/// A unit of text scheduled to be rendered as avatar speech.
#[derive(Debug, Clone)]
pub struct SpeakRequest {
    pub text: String,
    pub task_type: TaskType,
}

impl SpeakRequest {
    pub fn repeat(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            task_type: TaskType::Repeat,
        }
    }
}

/// A live vendor session: the exclusive handle plus its event channel.
pub struct AvatarSession {
    pub handle: Box<dyn AvatarHandle>,
    pub events: mpsc::Receiver<MediaEvent>,
}

/// Factory for vendor sessions.
#[async_trait]
pub trait AvatarClient: Send + Sync {
    /// Open a session with a freshly minted streaming token.
    async fn connect(&self, token: &str, options: &AvatarOptions) -> Result<AvatarSession>;
}

/// The narrow surface of a connected vendor session.
#[async_trait]
pub trait AvatarHandle: Send + Sync {
    async fn speak(&self, request: SpeakRequest) -> Result<()>;

    /// Best-effort teardown; vendor-side rejections are swallowed.
    async fn disconnect(&self);
}

/// Sink for the avatar's audio/video, standing in for the page's player
/// element.
pub trait MediaOutput: Send + Sync {
    fn attach(&self, stream: MediaStream);
    fn detach(&self);
    fn set_muted(&self, muted: bool);
}

/// Output sink that discards everything, for headless embeddings.
#[derive(Debug, Default)]
pub struct NullOutput;

impl MediaOutput for NullOutput {
    fn attach(&self, _stream: MediaStream) {}
    fn detach(&self) {}
    fn set_muted(&self, _muted: bool) {}
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_round_trips_through_serde() {
        assert_eq!(serde_json::to_string(&Quality::High).unwrap(), "\"high\"");
        let q: Quality = serde_json::from_str("\"low\"").unwrap();
        assert_eq!(q, Quality::Low);
        assert_eq!(Quality::default(), Quality::Medium);
    }

    #[test]
    fn speak_request_defaults_to_repeat() {
        let req = SpeakRequest::repeat("hello");
        assert_eq!(req.task_type, TaskType::Repeat);
        assert_eq!(req.text, "hello");
    }
}
