//! Trailing-window duplicate suppression.
//!
//! Both directions of the conversation need their own guard: the
//! recognition engine can emit the same phrase twice in quick succession,
//! and the assistant can legitimately give the same canned answer twice.
//! One shared guard would let either side mask the other.

use std::time::{Duration, Instant};

/// Rejects a string identical to the previously accepted one while a
/// trailing window is still open.
#[derive(Debug)]
pub struct DedupeGuard {
    window: Duration,
    last_text: String,
    last_at: Option<Instant>,
}

impl DedupeGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_text: String::new(),
            last_at: None,
        }
    }

    /// Accept or reject `text`.
    ///
    /// Trimmed-empty input is always rejected. Input equal to the last
    /// accepted text is rejected while the window is open. Acceptance
    /// records the new comparison point; rejection never mutates state.
    pub fn accept(&mut self, text: &str) -> bool {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return false;
        }
        let now = Instant::now();
        if let Some(at) = self.last_at {
            if trimmed == self.last_text && now.duration_since(at) < self.window {
                return false;
            }
        }
        self.last_text = trimmed.to_string();
        self.last_at = Some(now);
        true
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_repeat_is_rejected() {
        let mut guard = DedupeGuard::new(Duration::from_millis(200));
        assert!(guard.accept("hello"));
        assert!(!guard.accept("hello"));
        assert!(!guard.accept("  hello  "));
    }

    #[test]
    fn repeat_after_window_is_accepted() {
        let mut guard = DedupeGuard::new(Duration::from_millis(20));
        assert!(guard.accept("hello"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(guard.accept("hello"));
    }

    #[test]
    fn different_text_is_always_accepted() {
        let mut guard = DedupeGuard::new(Duration::from_secs(60));
        assert!(guard.accept("one"));
        assert!(guard.accept("two"));
        assert!(guard.accept("one"));
    }

    #[test]
    fn blank_input_is_rejected_without_clobbering_state() {
        let mut guard = DedupeGuard::new(Duration::from_secs(60));
        assert!(guard.accept("hello"));
        assert!(!guard.accept("   "));
        assert!(!guard.accept(""));
        // the "last accepted" slot still holds "hello"
        assert!(!guard.accept("hello"));
    }
}
