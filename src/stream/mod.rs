//! Stream session lifecycle: token, connect, ready, supervise, bounded
//! reconnect.
//!
//! ## Protocol overview
//!
//! 1. **Token** - mint a fresh streaming token (every attempt, never reused)
//! 2. **Connect** - open the vendor session with that token
//! 3. **Ready** - await the `Ready` event within a fixed window; attach
//!    the stream to output, reset the attempt counter, flush queued speech
//! 4. **Supervise** - watch the session's event channel; a disconnect
//!    tears the handle down and re-enters the bounded retry loop
//!
//! The media transport is a best-effort real-time channel subject to
//! transient blips and provider-side early closes. A short, capped
//! backoff masks single blips without flapping the observable state into
//! an error; the attempt cap terminates definitively instead of retrying
//! forever. After the cap, only an explicit `begin()` restarts.

pub mod speak;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;

use crate::config::ReconnectPolicy;
use crate::error::{Error, Result};
use crate::gateway::ChatBackend;
use crate::media::{AvatarClient, AvatarHandle, AvatarOptions, MediaEvent, MediaOutput};
use speak::SpeakQueue;

/// Observable state of the widget's media side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Idle,
    Connecting,
    Ready,
    Reconnecting,
    Error,
}

impl StreamStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }
}

/// Owns the one live media handle and its lifecycle.
///
/// No other component calls the handle directly; speech goes through
/// [`StreamSessionManager::speak`], which drains the queue against the
/// handle when one is installed.
pub struct StreamSessionManager {
    gateway: Arc<dyn ChatBackend>,
    client: Arc<dyn AvatarClient>,
    output: Arc<dyn MediaOutput>,
    options: AvatarOptions,
    policy: ReconnectPolicy,
    ready_timeout: Duration,
    status_tx: watch::Sender<StreamStatus>,
    notice: parking_lot::Mutex<String>,
    handle: Mutex<Option<Box<dyn AvatarHandle>>>,
    queue: SpeakQueue,
    /// Serializes `begin()` with itself and with disconnect-driven retries.
    start_lock: Mutex<()>,
    attempt: AtomicU32,
    /// Bumped on every connect and on `stop()`; supervision loops carry
    /// the epoch they were born under and ignore the world once it moves on.
    epoch: AtomicU64,
    closed: AtomicBool,
}

impl StreamSessionManager {
    pub fn new(
        gateway: Arc<dyn ChatBackend>,
        client: Arc<dyn AvatarClient>,
        output: Arc<dyn MediaOutput>,
        options: AvatarOptions,
        policy: ReconnectPolicy,
        ready_timeout: Duration,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(StreamStatus::Idle);
        Arc::new(Self {
            gateway,
            client,
            output,
            options,
            policy,
            ready_timeout,
            status_tx,
            notice: parking_lot::Mutex::new(String::new()),
            handle: Mutex::new(None),
            queue: SpeakQueue::new(),
            start_lock: Mutex::new(()),
            attempt: AtomicU32::new(0),
            epoch: AtomicU64::new(0),
            closed: AtomicBool::new(true),
        })
    }

    pub fn status(&self) -> StreamStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamStatus> {
        self.status_tx.subscribe()
    }

    /// Short human-readable companion to the current status.
    pub fn notice(&self) -> String {
        self.notice.lock().clone()
    }

    /// Start (or restart) the media session.
    ///
    /// Serialized: a second call while one is in flight is a no-op. An
    /// explicit call after the terminal error state restarts with a fresh
    /// attempt budget.
    pub async fn begin(self: Arc<Self>) -> Result<()> {
        let Ok(_guard) = self.start_lock.try_lock() else {
            tracing::debug!("stream start already in flight");
            return Ok(());
        };
        self.closed.store(false, Ordering::SeqCst);
        self.attempt.store(0, Ordering::SeqCst);
        Self::drive(&self, false).await
    }

    /// Bounded attempt loop. `after_ready_loss` forces the reconnecting
    /// label even on the first attempt.
    fn drive<'a>(
        this: &'a Arc<Self>,
        after_ready_loss: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
        loop {
            if this.closed.load(Ordering::SeqCst) {
                return Ok(());
            }
            let attempt = this.attempt.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > this.policy.max_attempts {
                this.attempt.store(0, Ordering::SeqCst);
                this.set_status(StreamStatus::Error, "Network unstable. Please try again.");
                tracing::warn!(
                    max_attempts = this.policy.max_attempts,
                    "stream retries exhausted"
                );
                return Err(Error::RetriesExhausted {
                    attempts: this.policy.max_attempts,
                });
            }

            if attempt == 1 && !after_ready_loss {
                this.set_status(StreamStatus::Connecting, "Connecting");
            } else {
                this.set_status(StreamStatus::Reconnecting, "Reconnecting");
            }

            match this.try_connect().await {
                Ok(events) => {
                    this.attempt.store(0, Ordering::SeqCst);
                    this.set_status(StreamStatus::Ready, "");
                    tracing::info!(attempt, "stream ready");
                    this.flush_queue().await;
                    let epoch = this.epoch.load(Ordering::SeqCst);
                    let supervisor = Arc::clone(this);
                    tokio::spawn(async move {
                        Self::supervise(supervisor, events, epoch).await;
                    });
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "stream attempt failed");
                    this.teardown_handle().await;
                    let delay = this.policy.delay(attempt);
                    tokio::time::sleep(delay).await;
                }
            }
        }
        })
    }

    /// One attempt: token, connect, install the handle, await ready.
    async fn try_connect(&self) -> Result<mpsc::Receiver<MediaEvent>> {
        // any old handle goes away before a new one exists
        self.teardown_handle().await;

        let token = self.gateway.stream_token().await.map_err(|err| match err {
            Error::NoPayload => Error::TokenMissing,
            other => other,
        })?;

        let session = self.client.connect(&token, &self.options).await?;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let mut events = session.events;
        *self.handle.lock().await = Some(session.handle);

        match timeout(self.ready_timeout, events.recv()).await {
            Ok(Some(MediaEvent::Ready { stream })) => {
                self.output.attach(stream);
                // muted until the first speak unmutes; placates autoplay
                self.output.set_muted(true);
                Ok(events)
            }
            Ok(Some(MediaEvent::Disconnected)) | Ok(None) => Err(Error::Disconnected),
            Err(_) => Err(Error::NotReadyTimeout(self.ready_timeout)),
        }
    }

    /// Watch a live session's events until it drops or the world moves on.
    async fn supervise(this: Arc<Self>, mut events: mpsc::Receiver<MediaEvent>, epoch: u64) {
        while let Some(event) = events.recv().await {
            if this.epoch.load(Ordering::SeqCst) != epoch {
                return; // trailing event from a torn-down session
            }
            match event {
                MediaEvent::Ready { stream } => {
                    // vendor re-announced the stream; refresh the sink
                    this.output.attach(stream);
                }
                MediaEvent::Disconnected => {
                    tracing::info!("stream disconnected; scheduling reconnect");
                    this.teardown_handle().await;
                    let Some(_guard) = Self::acquire_for_retry(&this, epoch).await else {
                        return;
                    };
                    let _ = Self::drive(&this, true).await;
                    return;
                }
            }
        }
    }

    /// Wait for the start lock, then re-check that no newer session or
    /// explicit stop superseded this retry while we waited.
    async fn acquire_for_retry(
        this: &Arc<Self>,
        epoch: u64,
    ) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        let guard = this.start_lock.lock().await;
        if this.epoch.load(Ordering::SeqCst) != epoch || this.closed.load(Ordering::SeqCst) {
            return None;
        }
        Some(guard)
    }

    /// Queue text for speech and drain if a handle is installed.
    ///
    /// With no live handle the text stays queued; the ready transition
    /// re-flushes.
    pub async fn speak(&self, text: impl Into<String>) {
        self.queue.enqueue(text);
        self.flush_queue().await;
    }

    async fn flush_queue(&self) {
        let guard = self.handle.lock().await;
        if let Some(handle) = guard.as_ref() {
            self.queue.flush(handle.as_ref(), self.output.as_ref()).await;
        }
    }

    /// Idempotent teardown: disconnect the handle, clear the output,
    /// reset to idle. Late events from the dead session are ignored via
    /// the epoch bump.
    pub async fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.teardown_handle().await;
        self.attempt.store(0, Ordering::SeqCst);
        self.set_status(StreamStatus::Idle, "");
    }

    async fn teardown_handle(&self) {
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            handle.disconnect().await;
        }
        self.output.detach();
    }

    fn set_status(&self, status: StreamStatus, notice: &str) {
        *self.notice.lock() = notice.to_string();
        self.status_tx.send_replace(status);
    }
}

// ── Tests ───────────────────────────────────────────────────────
