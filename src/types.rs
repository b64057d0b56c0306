use serde::{Deserialize, Serialize};
use std::fmt;

/// Goal value meaning "no multi-step task is active".
pub const NO_GOAL: &str = "NONE";

/// Utterance text meaning "no new user speech, the screen advanced on its own".
pub const FOLLOW_UP_SENTINEL: &str = "FOLLOW_UP";

/// Separator between ranked recognition hypotheses in one result string.
pub const HYPOTHESIS_DELIMITER: char = '|';

/// How a [`Selector`] locates an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Text,
    Id,
    #[serde(alias = "desc", alias = "content_description")]
    Description,
}

impl MatchKind {
    fn as_str(self) -> &'static str {
        match self {
            MatchKind::Text => "text",
            MatchKind::Id => "id",
            MatchKind::Description => "description",
        }
    }
}

/// A rule for locating one element on the screen.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    pub match_kind: MatchKind,
    pub value: String,
}

impl Selector {
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            match_kind: MatchKind::Text,
            value: value.into(),
        }
    }

    pub fn id(value: impl Into<String>) -> Self {
        Self {
            match_kind: MatchKind::Id,
            value: value.into(),
        }
    }

    pub fn description(value: impl Into<String>) -> Self {
        Self {
            match_kind: MatchKind::Description,
            value: value.into(),
        }
    }

    /// Canonical string form, used to key strike counters.
    pub fn key(&self) -> String {
        format!("{}:{}", self.match_kind.as_str(), self.value.trim())
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    pub fn is_vertical(self) -> bool {
        matches!(self, ScrollDirection::Up | ScrollDirection::Down)
    }

    /// Down and right map onto the platform's forward scroll.
    pub fn is_forward(self) -> bool {
        matches!(self, ScrollDirection::Down | ScrollDirection::Right)
    }
}

/// One UI action, as issued by the planner or a local command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Click { selector: Selector },
    Scroll { direction: ScrollDirection },
    Highlight { selector: Selector },
    InputText { value: String },
    Back,
    Home,
    SetGoal { value: String },
    StopTask,
}

impl Action {
    /// Actions that touch the screen and therefore warrant a follow-up capture.
    pub fn changes_screen(&self) -> bool {
        matches!(
            self,
            Action::Click { .. }
                | Action::Scroll { .. }
                | Action::InputText { .. }
                | Action::Back
                | Action::Home
        )
    }
}

/// The active multi-step task. `goal == NO_GOAL` means idle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    pub goal: String,
    pub step: u32,
}

impl Default for TaskState {
    fn default() -> Self {
        Self {
            goal: NO_GOAL.to_string(),
            step: 0,
        }
    }
}

impl TaskState {
    pub fn is_active(&self) -> bool {
        self.goal != NO_GOAL
    }

    /// Start a fresh task at step zero.
    pub fn assign(&mut self, goal: impl Into<String>) {
        let goal = goal.into();
        let goal = goal.trim();
        if goal.is_empty() || goal == NO_GOAL {
            self.reset();
            return;
        }
        self.goal = goal.to_string();
        self.step = 0;
    }

    /// Count one planner round trip. No-op without a goal.
    pub fn advance(&mut self) -> u32 {
        if self.is_active() {
            self.step += 1;
        }
        self.step
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
