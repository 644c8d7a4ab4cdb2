//! Process-wide failure latch.
//!
//! Poll failures across the whole process feed one counter. Once more than
//! [`FAILURE_THRESHOLD`] consecutive failures accumulate the latch engages
//! and reconcilers converge from cached state; the next successful poll
//! releases it. `bounce` is a one-shot flag that forces the next converge
//! pass even when the Message is byte-identical to cache (set when the
//! host's outbound address changes).

use parking_lot::Mutex;

/// Consecutive poll failures tolerated before the latch engages.
pub const FAILURE_THRESHOLD: u32 = 3;

#[derive(Default)]
struct Inner {
    consecutive_failures: u32,
    active: bool,
    acted: bool,
    bounce: bool,
}

#[derive(Default)]
pub struct FailSafe {
    inner: Mutex<Inner>,
}

impl FailSafe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one poll failure. Returns whether the latch is now engaged.
    pub fn record_failure(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        if inner.consecutive_failures > FAILURE_THRESHOLD {
            inner.active = true;
        }
        inner.active
    }

    /// Record a successful poll, releasing the latch. Returns true when a
    /// "connectivity restored" notification should be emitted: only once,
    /// and only if the latch actually acted on a tunnel while engaged.
    pub fn record_success(&self) -> bool {
        let mut inner = self.inner.lock();
        let restored = inner.active && inner.acted;
        inner.consecutive_failures = 0;
        inner.active = false;
        inner.acted = false;
        restored
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    /// Mark that the latch stopped or started a tunnel while engaged.
    pub fn mark_acted(&self) {
        self.inner.lock().acted = true;
    }

    pub fn set_bounce(&self) {
        self.inner.lock().bounce = true;
    }

    pub fn bounce_pending(&self) -> bool {
        self.inner.lock().bounce
    }

    pub fn clear_bounce(&self) {
        self.inner.lock().bounce = false;
    }
}
