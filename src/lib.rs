//! avatarlink: session orchestration core for an embeddable live-avatar
//! chat widget.
//!
//! Pairs a turn-based chat backend with a live avatar stream so that a
//! visitor's speech or typed text produces both a textual reply and a
//! synchronized talking-head reply. The crate owns the part worth getting
//! right once: credential acquisition, the chat and media session
//! lifecycles, reconnect policy with bounded backoff, the speak queue,
//! input deduplication, microphone supervision, and idle-driven teardown.
//! Rendering and the vendor SDK stay in the embedding host behind small
//! traits.
//!
//! ## Architecture
//! - [`gateway`]: the three opaque remote operations (start chat, send
//!   message, mint streaming token) behind one trait, with duck-typed
//!   response handling
//! - [`chat`]: chat-session identity, durable persistence, and
//!   retry-once expiry recovery
//! - [`stream`]: the media session state machine
//!   (idle/connecting/ready/reconnecting/error) and the speak queue
//! - [`mic`]: supervised continuous speech recognition
//! - [`dedupe`]: trailing-window duplicate suppression, one guard per
//!   direction
//! - [`widget`]: the orchestrator the host embeds
//!
//! ```no_run
//! use std::sync::Arc;
//! use avatarlink::{AvatarWidget, WidgetConfig};
//! # async fn example(vendor: Arc<dyn avatarlink::AvatarClient>) -> avatarlink::Result<()> {
//! let mut config = WidgetConfig::default();
//! config.gateway_base_url = "https://widget.example".into();
//! config.avatar_id = "anna".into();
//!
//! let widget = AvatarWidget::builder(config).client(vendor).build()?;
//! widget.open().await;
//! widget.submit_text("hello").await;
//! # Ok(())
//! # }
//! ```

pub mod chat;
pub mod config;
pub mod dedupe;
pub mod error;
pub mod gateway;
pub mod media;
pub mod mic;
pub mod stream;
pub mod widget;

pub use chat::store::{ChatSession, MemorySessionStore, SessionStore, SqliteSessionStore};
pub use chat::ChatSessionManager;
pub use config::{ReconnectPolicy, WidgetConfig};
pub use dedupe::DedupeGuard;
pub use error::{Error, Result};
pub use gateway::{ChatBackend, HttpGateway};
pub use media::{
    AvatarClient, AvatarHandle, AvatarOptions, AvatarSession, MediaEvent, MediaOutput,
    MediaStream, NullOutput, Quality, SpeakRequest, TaskType,
};
pub use mic::{MicState, MicSupervisor, Recognizer, RecognizerEvent, SpeechBackend, UnsupportedBackend};
pub use stream::{speak::SpeakQueue, StreamSessionManager, StreamStatus};
pub use widget::{AvatarWidget, Role, TranscriptEntry, WidgetBuilder};
