use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What a timer was armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Debounce,
    ForcedCapture,
    FollowUpExpiry,
    ListenWatchdog,
    GuidedTimeout,
}

/// Delivered on the timer channel when a slot fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken {
    pub kind: TimerKind,
    pub generation: u64,
}

pub type TimerSink = mpsc::UnboundedSender<TimerToken>;

/// A single-shot timer that is replaced, never stacked.
///
/// Arming aborts the previous sleep; tokens from older generations are rejected by
/// [`TimerSlot::accept`] even if they were already queued.
#[derive(Debug)]
pub struct TimerSlot {
    kind: TimerKind,
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl TimerSlot {
    pub fn new(kind: TimerKind) -> Self {
        Self {
            kind,
            generation: 0,
            handle: None,
        }
    }

    pub fn arm(&mut self, delay: Duration, sink: &TimerSink) -> TimerToken {
        self.cancel();
        let token = TimerToken {
            kind: self.kind,
            generation: self.generation,
        };
        let sink = sink.clone();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sink.send(token);
        }));
        token
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.generation += 1;
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    /// True if `token` is this slot's live firing; the slot is disarmed.
    pub fn accept(&mut self, token: TimerToken) -> bool {
        if token.kind != self.kind || token.generation != self.generation || self.handle.is_none() {
            return false;
        }
        self.handle = None;
        self.generation += 1;
        true
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
