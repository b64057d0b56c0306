//! Process-wide publish/subscribe channel between the engine and its observers.
//!
//! UI intents only matter in their latest form, so they ride a depth-1 broadcast
//! channel where a lagging subscriber skips straight to the newest intent. State
//! confirmations must not be dropped and ride a separate, deep channel.

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, error};

use crate::conversation::ConversationState;
use crate::guided::FlowOutcome;
use crate::screen::Bounds;
use crate::types::{Action, Selector, TaskState};

const INTENT_DEPTH: usize = 1;
const DEFAULT_NOTICE_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BusEvent {
    ActionRequested { action: Action },
    HighlightRequested { selector: Selector, bounds: Bounds },
    StateChanged { state: ConversationState },
    TaskChanged { task: TaskState },
    Spoke { text: String },
    TurnReady,
    FlowFinished { flow: String, outcome: FlowOutcome },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Superseded by the next event of the same family; safe to drop.
    Latest,
    /// Must reach every live subscriber.
    Reliable,
}

impl BusEvent {
    pub fn delivery(&self) -> Delivery {
        match self {
            BusEvent::ActionRequested { .. } | BusEvent::HighlightRequested { .. } => {
                Delivery::Latest
            }
            _ => Delivery::Reliable,
        }
    }

    /// Name used for SSE event types.
    pub fn name(&self) -> &'static str {
        match self {
            BusEvent::ActionRequested { .. } => "action_requested",
            BusEvent::HighlightRequested { .. } => "highlight_requested",
            BusEvent::StateChanged { .. } => "state_changed",
            BusEvent::TaskChanged { .. } => "task_changed",
            BusEvent::Spoke { .. } => "spoke",
            BusEvent::TurnReady => "turn_ready",
            BusEvent::FlowFinished { .. } => "flow_finished",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    intents: broadcast::Sender<BusEvent>,
    notices: broadcast::Sender<BusEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_NOTICE_DEPTH)
    }
}

impl EventBus {
    pub fn new(notice_depth: usize) -> Self {
        let (intents, _) = broadcast::channel(INTENT_DEPTH);
        let (notices, _) = broadcast::channel(notice_depth.max(1));
        Self { intents, notices }
    }

    /// Never blocks; publishing with no subscribers is fine.
    pub fn publish(&self, event: BusEvent) {
        let channel = match event.delivery() {
            Delivery::Latest => &self.intents,
            Delivery::Reliable => &self.notices,
        };
        if channel.send(event).is_err() {
            debug!("bus event dropped: no subscribers");
        }
    }

    pub fn subscribe(&self) -> BusSubscription {
        BusSubscription {
            intents: self.intents.subscribe(),
            notices: self.notices.subscribe(),
        }
    }

    /// Raw receivers, for adapters that stream each class separately.
    pub fn receivers(&self) -> (broadcast::Receiver<BusEvent>, broadcast::Receiver<BusEvent>) {
        (self.intents.subscribe(), self.notices.subscribe())
    }
}

pub struct BusSubscription {
    intents: broadcast::Receiver<BusEvent>,
    notices: broadcast::Receiver<BusEvent>,
}

impl BusSubscription {
    /// Next event of either class. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        let mut intents_open = true;
        let mut notices_open = true;
        while intents_open || notices_open {
            tokio::select! {
                biased;
                res = self.notices.recv(), if notices_open => match res {
                    Ok(event) => return Some(event),
                    Err(RecvError::Lagged(n)) => error!(missed = n, "bus subscriber lost state notices"),
                    Err(RecvError::Closed) => notices_open = false,
                },
                res = self.intents.recv(), if intents_open => match res {
                    Ok(event) => return Some(event),
                    Err(RecvError::Lagged(n)) => debug!(skipped = n, "superseded UI intents dropped"),
                    Err(RecvError::Closed) => intents_open = false,
                },
            }
        }
        None
    }

    /// Non-blocking variant of [`BusSubscription::recv`].
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.notices.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(n)) => {
                    error!(missed = n, "bus subscriber lost state notices");
                    continue;
                }
                Err(_) => break,
            }
        }
        loop {
            match self.intents.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    pub fn drain(&mut self) -> Vec<BusEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
