//! Microphone supervision: a continuous recognition loop with automatic
//! restart and stale-callback invalidation.
//!
//! The platform recognizer is a leaky abstraction: it stops on its own
//! after silence, errors out on transient device problems, and keeps
//! firing trailing callbacks after being stopped. The supervisor absorbs
//! all three. A monotonic session counter is the cancellation mechanism:
//! any event arriving with a stale counter belongs to a replaced loop and
//! is dropped before it can reach a newly started one.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};

/// Observable microphone state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicState {
    Off,
    Starting,
    On,
    Blocked,
    Unsupported,
}

/// Events surfaced by a running recognizer.
#[derive(Debug, Clone)]
pub enum RecognizerEvent {
    /// A final recognized utterance (no interim results).
    Utterance(String),
    /// The recognizer stopped on its own without an error.
    Ended,
    /// The recognizer stopped with an error.
    Errored(String),
}

/// Platform speech-recognition capability.
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// Whether the platform has a recognizer at all.
    fn is_supported(&self) -> bool;

    /// Prime the permission prompt: acquire the capture device and release
    /// it immediately without using it. An error means denied.
    async fn request_permission(&self) -> Result<()>;

    /// Build a recognizer that reports into `events`. Does not start it.
    fn create(&self, events: mpsc::Sender<RecognizerEvent>) -> Result<Box<dyn Recognizer>>;
}

/// A continuous recognizer. `start` may be called again after `Ended`.
pub trait Recognizer: Send + Sync {
    fn start(&self) -> Result<()>;
    fn stop(&self);
}

/// A backend for platforms with no speech recognition; typed input still
/// works, voice just reports unsupported.
pub struct UnsupportedBackend;

#[async_trait]
impl SpeechBackend for UnsupportedBackend {
    fn is_supported(&self) -> bool {
        false
    }
    async fn request_permission(&self) -> Result<()> {
        Err(Error::MicUnsupported)
    }
    fn create(&self, _events: mpsc::Sender<RecognizerEvent>) -> Result<Box<dyn Recognizer>> {
        Err(Error::MicUnsupported)
    }
}

/// Starts, restarts, and stops the one recognition loop.
pub struct MicSupervisor {
    backend: Arc<dyn SpeechBackend>,
    utterances: mpsc::Sender<String>,
    restart_delay: Duration,
    state_tx: watch::Sender<MicState>,
    recognizer: Mutex<Option<Box<dyn Recognizer>>>,
    session_id: AtomicU64,
    wanted: AtomicBool,
    active: AtomicBool,
}

impl MicSupervisor {
    pub fn new(
        backend: Arc<dyn SpeechBackend>,
        utterances: mpsc::Sender<String>,
        restart_delay: Duration,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(MicState::Off);
        Arc::new(Self {
            backend,
            utterances,
            restart_delay,
            state_tx,
            recognizer: Mutex::new(None),
            session_id: AtomicU64::new(0),
            wanted: AtomicBool::new(false),
            active: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> MicState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<MicState> {
        self.state_tx.subscribe()
    }

    /// Start listening. A no-op when already active.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        if self.active.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !self.backend.is_supported() {
            self.state_tx.send_replace(MicState::Unsupported);
            return Err(Error::MicUnsupported);
        }
        self.state_tx.send_replace(MicState::Starting);

        if let Err(err) = self.backend.request_permission().await {
            tracing::info!(error = %err, "microphone permission denied");
            self.state_tx.send_replace(MicState::Blocked);
            return Err(Error::MicBlocked);
        }

        // a replaced loop must be stopped before its successor starts
        if let Some(old) = self.recognizer.lock().take() {
            old.stop();
        }
        let session = self.session_id.fetch_add(1, Ordering::SeqCst) + 1;

        let (event_tx, event_rx) = mpsc::channel(32);
        let recognizer = match self.backend.create(event_tx) {
            Ok(recognizer) => recognizer,
            Err(err) => {
                tracing::warn!(error = %err, "recognizer construction failed");
                self.state_tx.send_replace(MicState::Blocked);
                return Err(Error::MicBlocked);
            }
        };
        if let Err(err) = recognizer.start() {
            tracing::info!(error = %err, "recognizer refused to start");
            self.state_tx.send_replace(MicState::Blocked);
            return Err(Error::MicBlocked);
        }
        *self.recognizer.lock() = Some(recognizer);

        self.wanted.store(true, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);
        self.state_tx.send_replace(MicState::On);
        tracing::info!(session, "microphone listening");

        let pump = Arc::clone(&self);
        tokio::spawn(async move {
            Self::pump(pump, event_rx, session).await;
        });
        Ok(())
    }

    async fn pump(this: Arc<Self>, mut events: mpsc::Receiver<RecognizerEvent>, session: u64) {
        while let Some(event) = events.recv().await {
            if this.session_id.load(Ordering::SeqCst) != session {
                return; // trailing events from a replaced loop
            }
            match event {
                RecognizerEvent::Utterance(text) => {
                    let text = text.trim().to_string();
                    if text.is_empty() {
                        continue;
                    }
                    if this.utterances.send(text).await.is_err() {
                        return;
                    }
                }
                RecognizerEvent::Ended => {
                    if !this.wanted.load(Ordering::SeqCst) {
                        return;
                    }
                    this.restart(session, None).await;
                }
                RecognizerEvent::Errored(message) => {
                    if !this.wanted.load(Ordering::SeqCst) {
                        return;
                    }
                    tracing::debug!(%message, "recognizer error; restarting after delay");
                    this.restart(session, Some(this.restart_delay)).await;
                }
            }
        }
    }

    /// Restart the current recognizer, optionally after a cool-down that
    /// keeps a persistent failure from hot-looping.
    async fn restart(&self, session: u64, delay: Option<Duration>) {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.session_id.load(Ordering::SeqCst) != session
            || !self.wanted.load(Ordering::SeqCst)
        {
            return;
        }
        if let Some(recognizer) = self.recognizer.lock().as_ref() {
            if let Err(err) = recognizer.start() {
                tracing::debug!(error = %err, "recognizer restart failed");
            }
        }
    }

    /// Stop listening. Idempotent; late recognizer callbacks after this
    /// have nothing to reach.
    pub fn stop(&self) {
        self.wanted.store(false, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        if let Some(recognizer) = self.recognizer.lock().take() {
            recognizer.stop();
        }
        self.state_tx.send_replace(MicState::Off);
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FakeBackend {
        supported: bool,
        allow: bool,
        created: AtomicUsize,
        event_tx: Mutex<Option<mpsc::Sender<RecognizerEvent>>>,
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
    }

    impl FakeBackend {
        fn new(supported: bool, allow: bool) -> Arc<Self> {
            Arc::new(Self {
                supported,
                allow,
                created: AtomicUsize::new(0),
                event_tx: Mutex::new(None),
                starts: Arc::new(AtomicUsize::new(0)),
                stops: Arc::new(AtomicUsize::new(0)),
            })
        }

        fn emit(&self) -> mpsc::Sender<RecognizerEvent> {
            self.event_tx.lock().clone().expect("recognizer created")
        }
    }

    #[async_trait]
    impl SpeechBackend for FakeBackend {
        fn is_supported(&self) -> bool {
            self.supported
        }

        async fn request_permission(&self) -> Result<()> {
            if self.allow {
                Ok(())
            } else {
                Err(Error::MicBlocked)
            }
        }

        fn create(&self, events: mpsc::Sender<RecognizerEvent>) -> Result<Box<dyn Recognizer>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            *self.event_tx.lock() = Some(events);
            Ok(Box::new(FakeRecognizer {
                starts: Arc::clone(&self.starts),
                stops: Arc::clone(&self.stops),
            }))
        }
    }

    struct FakeRecognizer {
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
    }

    impl Recognizer for FakeRecognizer {
        fn start(&self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn supervisor(
        backend: Arc<FakeBackend>,
    ) -> (Arc<MicSupervisor>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(8);
        let sup = MicSupervisor::new(backend, tx, Duration::from_millis(30));
        (sup, rx)
    }

    #[tokio::test]
    async fn unsupported_platform_reports_without_constructing() {
        let backend = FakeBackend::new(false, true);
        let (sup, _rx) = supervisor(Arc::clone(&backend));

        let err = Arc::clone(&sup).start().await.unwrap_err();
        assert!(matches!(err, Error::MicUnsupported));
        assert_eq!(sup.state(), MicState::Unsupported);
        assert_eq!(backend.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn denied_permission_blocks_without_constructing() {
        let backend = FakeBackend::new(true, false);
        let (sup, _rx) = supervisor(Arc::clone(&backend));

        let err = Arc::clone(&sup).start().await.unwrap_err();
        assert!(matches!(err, Error::MicBlocked));
        assert_eq!(sup.state(), MicState::Blocked);
        assert_eq!(backend.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn utterances_are_forwarded() {
        let backend = FakeBackend::new(true, true);
        let (sup, mut rx) = supervisor(Arc::clone(&backend));
        Arc::clone(&sup).start().await.unwrap();
        assert_eq!(sup.state(), MicState::On);

        backend
            .emit()
            .send(RecognizerEvent::Utterance("  hello there  ".into()))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), "hello there");
    }

    #[tokio::test]
    async fn stale_session_events_are_dropped() {
        let backend = FakeBackend::new(true, true);
        let (sup, mut rx) = supervisor(Arc::clone(&backend));

        Arc::clone(&sup).start().await.unwrap();
        let stale = backend.emit();

        sup.stop();
        Arc::clone(&sup).start().await.unwrap();

        // the first loop's trailing utterance must not surface
        stale
            .send(RecognizerEvent::Utterance("ghost".into()))
            .await
            .ok();
        backend
            .emit()
            .send(RecognizerEvent::Utterance("real".into()))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), "real");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn benign_end_restarts_immediately() {
        let backend = FakeBackend::new(true, true);
        let (sup, _rx) = supervisor(Arc::clone(&backend));
        Arc::clone(&sup).start().await.unwrap();
        assert_eq!(backend.starts.load(Ordering::SeqCst), 1);

        backend.emit().send(RecognizerEvent::Ended).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn error_end_restarts_after_the_cool_down() {
        let backend = FakeBackend::new(true, true);
        let (sup, _rx) = supervisor(Arc::clone(&backend));
        Arc::clone(&sup).start().await.unwrap();

        backend
            .emit()
            .send(RecognizerEvent::Errored("audio-capture".into()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.starts.load(Ordering::SeqCst), 1, "restarted too early");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn end_after_stop_does_not_restart() {
        let backend = FakeBackend::new(true, true);
        let (sup, _rx) = supervisor(Arc::clone(&backend));
        Arc::clone(&sup).start().await.unwrap();
        let emit = backend.emit();

        sup.stop();
        emit.send(RecognizerEvent::Ended).await.ok();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let backend = FakeBackend::new(true, true);
        let (sup, _rx) = supervisor(Arc::clone(&backend));
        Arc::clone(&sup).start().await.unwrap();

        sup.stop();
        sup.stop();
        assert_eq!(sup.state(), MicState::Off);
        assert_eq!(backend.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_while_active_is_a_no_op() {
        let backend = FakeBackend::new(true, true);
        let (sup, _rx) = supervisor(Arc::clone(&backend));
        Arc::clone(&sup).start().await.unwrap();
        Arc::clone(&sup).start().await.unwrap();
        assert_eq!(backend.created.load(Ordering::SeqCst), 1);
    }
}
