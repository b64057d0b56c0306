use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::screen::{ScreenHash, ScreenHost, ScreenSnapshot};
use crate::timer::{TimerKind, TimerSink, TimerSlot, TimerToken};

/// A stabilized screen that passed suppression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenChange {
    pub snapshot: ScreenSnapshot,
    pub hash: ScreenHash,
    pub forced: bool,
}

/// Turns bursts of tree mutations into at most one stabilized snapshot.
pub struct ScreenObserver {
    host: Arc<dyn ScreenHost>,
    sink: TimerSink,
    debounce_delay: Duration,
    forced_delay: Duration,
    hash_prefix: usize,
    debounce: TimerSlot,
    forced: TimerSlot,
    last_hash: Option<ScreenHash>,
    follow_up_sent: bool,
    local_action_since: bool,
    captures: u64,
}

impl ScreenObserver {
    pub fn new(
        host: Arc<dyn ScreenHost>,
        sink: TimerSink,
        debounce_delay: Duration,
        forced_delay: Duration,
        hash_prefix: usize,
    ) -> Self {
        Self {
            host,
            sink,
            debounce_delay,
            forced_delay,
            hash_prefix,
            debounce: TimerSlot::new(TimerKind::Debounce),
            forced: TimerSlot::new(TimerKind::ForcedCapture),
            last_hash: None,
            follow_up_sent: false,
            local_action_since: false,
            captures: 0,
        }
    }

    /// Tree-mutation notification. Restarts the stabilization delay.
    pub fn on_mutation(&mut self) {
        trace!("screen mutation, debounce restarted");
        self.debounce.arm(self.debounce_delay, &self.sink);
    }

    pub fn on_debounce(&mut self, token: TimerToken) -> Option<ScreenChange> {
        if !self.debounce.accept(token) {
            return None;
        }
        self.capture_and_filter(false)
    }

    /// Schedule the post-action capture that bypasses the debounce.
    pub fn schedule_forced_capture(&mut self) {
        self.forced.arm(self.forced_delay, &self.sink);
    }

    /// `last_action_failed` skips the capture: nothing on screen could have moved.
    pub fn on_forced(&mut self, token: TimerToken, last_action_failed: bool) -> Option<ScreenChange> {
        if !self.forced.accept(token) {
            return None;
        }
        if last_action_failed {
            debug!("forced capture skipped after failed action");
            return None;
        }
        self.capture_and_filter(true)
    }

    pub fn forced_pending(&self) -> bool {
        self.forced.is_armed()
    }

    pub fn note_local_action(&mut self) {
        self.local_action_since = true;
        self.follow_up_sent = false;
    }

    pub fn mark_follow_up_sent(&mut self) {
        self.follow_up_sent = true;
    }

    /// A new follow-up window starts with nothing sent.
    pub fn reset_window(&mut self) {
        self.follow_up_sent = false;
    }

    pub fn cancel_timers(&mut self) {
        self.debounce.cancel();
        self.forced.cancel();
    }

    /// The current screen without touching suppression state.
    pub fn snapshot(&self) -> ScreenSnapshot {
        ScreenSnapshot::from_tree(self.host.root().as_ref())
    }

    /// How many stabilized captures have been computed.
    pub fn captures(&self) -> u64 {
        self.captures
    }

    fn capture_and_filter(&mut self, forced: bool) -> Option<ScreenChange> {
        let snapshot = self.snapshot();
        let hash = snapshot.hash(self.hash_prefix);
        self.captures += 1;

        let unchanged = self.last_hash == Some(hash);
        if self.follow_up_sent && unchanged && !self.local_action_since {
            debug!(%hash, "screen unchanged since last follow-up, suppressed");
            return None;
        }
        self.last_hash = Some(hash);
        self.local_action_since = false;
        debug!(%hash, forced, lines = snapshot.lines.len(), "screen stabilized");
        Some(ScreenChange {
            snapshot,
            hash,
            forced,
        })
    }
}
