//! Post-session suppression latch.

use std::time::{Duration, Instant};

/// Global latch that blocks new capture sessions for a fixed time after
/// one completes.
///
/// There is one gate per pipeline, not one per identity: it cannot tell a
/// lingering visitor from a new one arriving right after.
#[derive(Debug, Clone)]
pub struct CooldownGate {
    duration: Duration,
    expires_at: Option<Instant>,
}

impl CooldownGate {
    pub fn new(duration: Duration) -> Self {
        Self { duration, expires_at: None }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Whether a new session may start at `now`.
    pub fn is_open(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |expiry| now >= expiry)
    }

    /// Close the gate until `now + duration`.
    pub fn arm(&mut self, now: Instant) {
        self.expires_at = Some(now + self.duration);
        tracing::debug!(cooldown_ms = self.duration.as_millis() as u64, "cooldown armed");
    }

    /// Time left before the gate reopens.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at
            .map(|expiry| expiry.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }
}
