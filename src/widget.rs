//! The orchestrator: composes the gateway, chat and stream sessions, the
//! microphone supervisor, the duplicate guards, and the idle timer into
//! one observable widget session.
//!
//! ## Design
//! - `open()` starts the media session in the background, then chat, then
//!   the microphone; each step's failure is caught independently, so a
//!   dead stream never blocks typed chat
//! - every inbound utterance and typed submission takes the same path:
//!   user guard, chat send, assistant guard, speak queue
//! - failed sends become system-role transcript entries instead of
//!   errors thrown at the embedding UI
//! - an idle timer bounds the cost of unattended open sessions

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::chat::store::{MemorySessionStore, SessionStore, SqliteSessionStore};
use crate::chat::ChatSessionManager;
use crate::config::WidgetConfig;
use crate::dedupe::DedupeGuard;
use crate::error::{Error, Result};
use crate::gateway::{ChatBackend, HttpGateway};
use crate::media::{AvatarClient, AvatarOptions, MediaOutput, NullOutput};
use crate::mic::{MicState, MicSupervisor, SpeechBackend, UnsupportedBackend};
use crate::stream::{StreamSessionManager, StreamStatus};

/// Who authored a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One line of the running transcript.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Handle to one widget session. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct AvatarWidget {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AvatarWidget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvatarWidget").finish_non_exhaustive()
    }
}

struct Inner {
    chat: ChatSessionManager,
    stream: Arc<StreamSessionManager>,
    mic: Arc<MicSupervisor>,
    output: Arc<dyn MediaOutput>,
    guard_user: Mutex<DedupeGuard>,
    guard_assistant: Mutex<DedupeGuard>,
    transcript: Mutex<Vec<TranscriptEntry>>,
    idle_timeout: Duration,
    last_activity: Mutex<Instant>,
    open: AtomicBool,
    lifecycle: Mutex<CancellationToken>,
    utterance_rx: Mutex<Option<mpsc::Receiver<String>>>,
    pump_started: AtomicBool,
}

impl AvatarWidget {
    pub fn builder(config: WidgetConfig) -> WidgetBuilder {
        WidgetBuilder::new(config)
    }

    /// Open the widget: media session, chat session, microphone, in that
    /// order. Safe to call again after an idle close or a terminal error.
    pub async fn open(&self) {
        if self.inner.open.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("widget opening");
        self.touch();

        let token = CancellationToken::new();
        *self.inner.lifecycle.lock() = token.clone();

        // media first, but in the background: its retries must never hold
        // up chat availability for typed input
        {
            let stream = Arc::clone(&self.inner.stream);
            tokio::spawn(async move {
                if let Err(err) = stream.begin().await {
                    tracing::warn!(error = %err, "stream failed to start");
                }
            });
        }

        if let Err(err) = self.inner.chat.ensure(false).await {
            tracing::warn!(error = %err, "chat session unavailable at open");
        }

        if let Err(err) = Arc::clone(&self.inner.mic).start().await {
            tracing::info!(error = %err, "voice input unavailable");
        }

        self.spawn_utterance_pump();
        self.spawn_idle_monitor(token);
    }

    /// Close the widget: stop the microphone and the media session, reset
    /// status to idle. Idempotent.
    pub async fn close(&self) {
        if !self.inner.open.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("widget closing");
        self.inner.lifecycle.lock().cancel();
        self.inner.mic.stop();
        self.inner.stream.stop().await;
    }

    /// Submit typed text. Takes the same path as a voice utterance.
    pub async fn submit_text(&self, text: &str) {
        self.handle_input(text).await;
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> StreamStatus {
        self.inner.stream.status()
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamStatus> {
        self.inner.stream.subscribe()
    }

    /// Short human-readable companion to the current status.
    pub fn status_notice(&self) -> String {
        self.inner.stream.notice()
    }

    pub fn mic_state(&self) -> MicState {
        self.inner.mic.state()
    }

    /// Snapshot of the running transcript, in order.
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.inner.transcript.lock().clone()
    }

    /// Mute or unmute the output sink. The speak queue unmutes on its own
    /// before rendering speech.
    pub fn set_muted(&self, muted: bool) {
        self.inner.output.set_muted(muted);
    }

    /// Forget the current chat session; the next message mints a new one.
    pub fn restart_chat(&self) -> Result<()> {
        self.inner.chat.restart()
    }

    async fn handle_input(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if !self.inner.guard_user.lock().accept(text) {
            tracing::debug!("duplicate input dropped");
            return;
        }
        self.touch();
        self.push(Role::User, text);

        match self.inner.chat.send(text).await {
            Ok(reply) => {
                self.touch();
                if self.inner.guard_assistant.lock().accept(&reply) {
                    self.push(Role::Assistant, &reply);
                    self.inner.stream.speak(reply).await;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "message delivery failed");
                self.push(Role::System, &friendly_fail(err.status()));
            }
        }
    }

    fn push(&self, role: Role, text: &str) {
        self.inner.transcript.lock().push(TranscriptEntry {
            role,
            text: text.to_string(),
            at: Utc::now(),
        });
    }

    fn touch(&self) {
        *self.inner.last_activity.lock() = Instant::now();
    }

    /// Route recognized utterances into the input path. Spawned once per
    /// widget; survives close/reopen cycles and drops input while closed.
    fn spawn_utterance_pump(&self) {
        if self.inner.pump_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(mut rx) = self.inner.utterance_rx.lock().take() else {
            return;
        };
        let widget = self.clone();
        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if !widget.is_open() {
                    continue;
                }
                widget.handle_input(&text).await;
            }
        });
    }

    fn spawn_idle_monitor(&self, token: CancellationToken) {
        let widget = self.clone();
        tokio::spawn(async move {
            loop {
                let idle_for = widget.inner.last_activity.lock().elapsed();
                if idle_for >= widget.inner.idle_timeout {
                    tracing::info!("idle timeout; closing widget");
                    widget.close().await;
                    return;
                }
                let rest = widget.inner.idle_timeout - idle_for;
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(rest) => {}
                }
            }
        });
    }
}

fn friendly_fail(status: Option<u16>) -> String {
    match status {
        Some(code) if code != 0 => format!("Message failed ({code}). Please try again."),
        _ => "Message failed. Please try again.".to_string(),
    }
}

// ── Builder ──────────────────────────────────────────────────────

/// Assembles a widget from config plus the host-provided collaborators.
pub struct WidgetBuilder {
    config: WidgetConfig,
    gateway: Option<Arc<dyn ChatBackend>>,
    client: Option<Arc<dyn AvatarClient>>,
    output: Option<Arc<dyn MediaOutput>>,
    speech: Option<Arc<dyn SpeechBackend>>,
    store: Option<Arc<dyn SessionStore>>,
    idle_timeout: Option<Duration>,
}

impl WidgetBuilder {
    pub fn new(config: WidgetConfig) -> Self {
        Self {
            config,
            gateway: None,
            client: None,
            output: None,
            speech: None,
            store: None,
            idle_timeout: None,
        }
    }

    /// Override the HTTP gateway (tests, alternative transports).
    pub fn gateway(mut self, gateway: Arc<dyn ChatBackend>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// The vendor media bridge. Required.
    pub fn client(mut self, client: Arc<dyn AvatarClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn output(mut self, output: Arc<dyn MediaOutput>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn speech(mut self, speech: Arc<dyn SpeechBackend>) -> Self {
        self.speech = Some(speech);
        self
    }

    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sub-second override for the idle timeout; the config knob is in
    /// whole seconds.
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = Some(idle_timeout);
        self
    }

    pub fn build(self) -> Result<AvatarWidget> {
        self.config.validate()?;

        let client = self.client.ok_or(Error::SdkUnavailable)?;
        let gateway: Arc<dyn ChatBackend> = match self.gateway {
            Some(gateway) => gateway,
            None => Arc::new(HttpGateway::new(self.config.gateway_base_url.as_str())),
        };
        let output: Arc<dyn MediaOutput> = self.output.unwrap_or_else(|| Arc::new(NullOutput));
        let speech: Arc<dyn SpeechBackend> =
            self.speech.unwrap_or_else(|| Arc::new(UnsupportedBackend));
        let store: Arc<dyn SessionStore> = match self.store {
            Some(store) => store,
            None => match &self.config.state_db {
                Some(path) => Arc::new(SqliteSessionStore::open(path)?),
                None => Arc::new(MemorySessionStore::default()),
            },
        };

        let (utterance_tx, utterance_rx) = mpsc::channel(32);

        let stream = StreamSessionManager::new(
            Arc::clone(&gateway),
            client,
            Arc::clone(&output),
            AvatarOptions {
                avatar_id: self.config.avatar_id.clone(),
                quality: self.config.quality,
            },
            self.config.reconnect.clone(),
            self.config.ready_timeout(),
        );
        let mic = MicSupervisor::new(speech, utterance_tx, self.config.mic_restart_delay());
        let chat = ChatSessionManager::new(gateway, store);

        let window = self.config.dedupe_window();
        let idle_timeout = self.idle_timeout.unwrap_or_else(|| self.config.idle_timeout());

        Ok(AvatarWidget {
            inner: Arc::new(Inner {
                chat,
                stream,
                mic,
                output,
                guard_user: Mutex::new(DedupeGuard::new(window)),
                guard_assistant: Mutex::new(DedupeGuard::new(window)),
                transcript: Mutex::new(Vec::new()),
                idle_timeout,
                last_activity: Mutex::new(Instant::now()),
                open: AtomicBool::new(false),
                lifecycle: Mutex::new(CancellationToken::new()),
                utterance_rx: Mutex::new(Some(utterance_rx)),
                pump_started: AtomicBool::new(false),
            }),
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────
