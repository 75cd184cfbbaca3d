//! Widget configuration.
//!
//! One explicit struct with enumerated fields, a default for every knob,
//! and a `validate()` pass run once at startup. Loadable from TOML so the
//! embedding host can ship tuning without a rebuild.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::media::Quality;

/// Trailing window for the duplicate guards (ms).
const DEFAULT_DEDUPE_WINDOW_MS: u64 = 2_500;
/// Inactivity duration after which an open session is torn down (s).
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;
/// Wait for the media ready event before treating an attempt as failed (ms).
const DEFAULT_READY_TIMEOUT_MS: u64 = 10_000;
/// Delay before restarting an errored recognizer (ms).
const DEFAULT_MIC_RESTART_DELAY_MS: u64 = 350;

/// Reconnect policy for the stream session: bounded exponential backoff
/// with uniform jitter, terminal after `max_attempts` total tries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// First-retry base delay (ms); doubles per attempt.
    pub base_ms: u64,
    /// Upper bound on the exponential part (ms), before jitter.
    pub cap_ms: u64,
    /// Uniform random jitter added on top (ms).
    pub jitter_ms: u64,
    /// Total tries before the terminal error state.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_ms: 600,
            cap_ms: 6_000,
            jitter_ms: 300,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay scheduled after the given 1-based attempt fails.
    ///
    /// `min(cap, base * 2^(attempt-1)) + uniform(0, jitter)`. The
    /// exponent is clamped so a corrupt attempt counter cannot overflow.
    pub fn delay(&self, attempt: u32) -> Duration {
        use rand::RngExt;
        let exp = attempt.saturating_sub(1).min(20);
        let raw = self.base_ms.saturating_mul(1u64 << exp);
        let capped = raw.min(self.cap_ms);
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..self.jitter_ms)
        };
        Duration::from_millis(capped + jitter)
    }
}

/// Everything the orchestrator needs to know at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WidgetConfig {
    /// Vendor avatar identifier forwarded on connect. May be empty when
    /// the vendor account has a single default avatar.
    pub avatar_id: String,
    /// Rendering quality requested from the vendor.
    pub quality: Quality,
    /// Base URL of the widget's proxy routes, e.g. `https://host.example`.
    pub gateway_base_url: String,
    pub reconnect: ReconnectPolicy,
    pub ready_timeout_ms: u64,
    pub dedupe_window_ms: u64,
    pub idle_timeout_secs: u64,
    pub mic_restart_delay_ms: u64,
    /// Durable slot for the chat session id. `None` keeps the id in
    /// memory only, so it will not survive a restart.
    pub state_db: Option<PathBuf>,
}

impl Default for WidgetConfig {
    fn default() -> Self {
        Self {
            avatar_id: String::new(),
            quality: Quality::default(),
            gateway_base_url: String::new(),
            reconnect: ReconnectPolicy::default(),
            ready_timeout_ms: DEFAULT_READY_TIMEOUT_MS,
            dedupe_window_ms: DEFAULT_DEDUPE_WINDOW_MS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            mic_restart_delay_ms: DEFAULT_MIC_RESTART_DELAY_MS,
            state_db: None,
        }
    }
}

impl WidgetConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let config: Self = toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the orchestrator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.reconnect.max_attempts == 0 {
            return Err(Error::Config("reconnect.max_attempts must be at least 1".into()));
        }
        if self.reconnect.base_ms == 0 {
            return Err(Error::Config("reconnect.base_ms must be at least 1".into()));
        }
        if self.reconnect.cap_ms < self.reconnect.base_ms {
            return Err(Error::Config("reconnect.cap_ms must not undercut base_ms".into()));
        }
        if self.ready_timeout_ms == 0 {
            return Err(Error::Config("ready_timeout_ms must be at least 1".into()));
        }
        if self.idle_timeout_secs == 0 {
            return Err(Error::Config("idle_timeout_secs must be at least 1".into()));
        }
        if self.avatar_id.is_empty() {
            tracing::warn!("avatar_id is empty; the vendor default avatar will be used");
        }
        Ok(())
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn dedupe_window(&self) -> Duration {
        Duration::from_millis(self.dedupe_window_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn mic_restart_delay(&self) -> Duration {
        Duration::from_millis(self.mic_restart_delay_ms)
    }
}

// ── Tests ───────────────────────────────────────────────────────
