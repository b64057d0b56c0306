use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one utterance so a late completion can be told apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UtteranceId(pub u64);

impl fmt::Display for UtteranceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeechPriority {
    /// Interrupt whatever is playing.
    Flush,
    /// Play after what is already queued.
    Enqueue,
}

/// What happens once an utterance has finished playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterSpeech {
    Nothing,
    /// Open a new listening session.
    Listen,
    /// Open the follow-up window so screen changes reach the planner.
    OpenFollowUp,
}

/// Text-to-speech. Must report completion of every utterance exactly once,
/// e.g. through `EngineHandle::speech_done`.
pub trait Speaker: Send + Sync {
    fn speak(&self, id: UtteranceId, text: &str, priority: SpeechPriority);

    fn stop(&self);
}

/// Speech recognition. Results come back as one delimiter-joined hypothesis
/// string, or an empty string on error or timeout.
pub trait Listener: Send + Sync {
    fn start_listening(&self);

    fn cancel(&self);
}

/// Monotonic utterance id source.
#[derive(Debug, Default)]
pub struct UtteranceIds {
    next: u64,
}

impl UtteranceIds {
    pub fn next_id(&mut self) -> UtteranceId {
        self.next += 1;
        UtteranceId(self.next)
    }
}
