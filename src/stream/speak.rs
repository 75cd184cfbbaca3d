//! FIFO speak queue with at-least-once delivery to the media handle.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::media::{AvatarHandle, MediaOutput, SpeakRequest};

/// Serializes text-to-be-spoken against the media handle.
///
/// Tasks are never reordered. A task that fails to send is re-appended to
/// the tail, so it replays after everything that was already queued; the
/// stream manager's own reconnect-or-give-up policy bounds the retries.
pub struct SpeakQueue {
    items: Mutex<VecDeque<String>>,
    flushing: AtomicBool,
}

impl SpeakQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            flushing: AtomicBool::new(false),
        }
    }

    pub fn enqueue(&self, text: impl Into<String>) {
        let text = text.into();
        if text.trim().is_empty() {
            return;
        }
        self.items.lock().push_back(text);
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Drain the queue against `handle` in arrival order.
    ///
    /// Re-entrant calls while a flush is running are no-ops; the running
    /// flush drains whatever is enqueued up to the point it observes an
    /// empty queue. A failed speak re-queues the text at the tail and
    /// ends this pass; the next trigger (typically the ready transition)
    /// resumes. Output audio is unmuted before each attempt and left
    /// untouched when an attempt fails.
    pub async fn flush(&self, handle: &dyn AvatarHandle, output: &dyn MediaOutput) {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        loop {
            let Some(text) = self.items.lock().pop_front() else {
                break;
            };
            output.set_muted(false);
            if let Err(err) = handle.speak(SpeakRequest::repeat(text.clone())).await {
                tracing::debug!(error = %err, "speak failed; re-queued at tail");
                self.items.lock().push_back(text);
                break;
            }
        }

        self.flushing.store(false, Ordering::Release);
    }
}

impl Default for SpeakQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::media::MediaStream;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingHandle {
        spoken: Mutex<Vec<String>>,
        fail_once_on: Mutex<Vec<String>>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl AvatarHandle for RecordingHandle {
        async fn speak(&self, request: SpeakRequest) -> Result<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut failures = self.fail_once_on.lock();
            if let Some(pos) = failures.iter().position(|t| *t == request.text) {
                failures.remove(pos);
                return Err(Error::Disconnected);
            }
            drop(failures);
            self.spoken.lock().push(request.text);
            Ok(())
        }

        async fn disconnect(&self) {}
    }

    #[derive(Default)]
    struct GateOutput {
        unmutes: Mutex<Vec<bool>>,
    }

    impl MediaOutput for GateOutput {
        fn attach(&self, _stream: MediaStream) {}
        fn detach(&self) {}
        fn set_muted(&self, muted: bool) {
            self.unmutes.lock().push(muted);
        }
    }

    #[tokio::test]
    async fn flush_preserves_fifo_order() {
        let queue = SpeakQueue::new();
        let handle = RecordingHandle::default();
        let output = GateOutput::default();

        queue.enqueue("a");
        queue.enqueue("b");
        queue.flush(&handle, &output).await;

        assert_eq!(*handle.spoken.lock(), vec!["a", "b"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn failed_task_goes_to_the_tail_and_ends_the_pass() {
        let queue = SpeakQueue::new();
        let handle = RecordingHandle::default();
        handle.fail_once_on.lock().push("a".into());
        let output = GateOutput::default();

        queue.enqueue("a");
        queue.enqueue("b");
        queue.flush(&handle, &output).await;

        // "a" failed and was re-queued behind "b"; nothing spoken yet
        assert!(handle.spoken.lock().is_empty());
        assert_eq!(queue.len(), 2);

        queue.enqueue("c");
        queue.flush(&handle, &output).await;
        assert_eq!(*handle.spoken.lock(), vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn concurrent_flush_is_a_no_op() {
        let queue = Arc::new(SpeakQueue::new());
        let handle = Arc::new(RecordingHandle {
            delay: Some(Duration::from_millis(30)),
            ..RecordingHandle::default()
        });
        let output = Arc::new(GateOutput::default());

        queue.enqueue("only");
        let first = {
            let (q, h, o) = (Arc::clone(&queue), Arc::clone(&handle), Arc::clone(&output));
            tokio::spawn(async move { q.flush(h.as_ref(), o.as_ref()).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        // second call returns immediately while the first is mid-speak
        queue.flush(handle.as_ref(), output.as_ref()).await;
        first.await.unwrap();

        assert_eq!(*handle.spoken.lock(), vec!["only"]);
    }

    #[tokio::test]
    async fn unmute_requested_per_attempt_and_never_remuted() {
        let queue = SpeakQueue::new();
        let handle = RecordingHandle::default();
        handle.fail_once_on.lock().push("x".into());
        let output = GateOutput::default();

        queue.enqueue("x");
        queue.flush(&handle, &output).await; // failed attempt
        queue.flush(&handle, &output).await; // succeeds

        let calls = output.unmutes.lock();
        assert_eq!(*calls, vec![false, false]);
    }

    #[tokio::test]
    async fn blank_text_is_not_enqueued() {
        let queue = SpeakQueue::new();
        queue.enqueue("  ");
        queue.enqueue("");
        assert!(queue.is_empty());
    }
}
