use thiserror::Error;

use crate::types::Selector;

/// Failures while resolving or performing a UI action.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("no visible element matches {0}")]
    ElementNotFound(Selector),
    #[error("no scrollable container on screen")]
    NoScrollableTarget,
    #[error("no focused input field")]
    NoFocusedInput,
    #[error("no active window")]
    NoActiveWindow,
    #[error("host rejected the action: {0}")]
    Host(String),
}

/// Failures talking to the remote planner.
#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("planner request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("planner answered {code}: {body}")]
    Status { code: u16, body: String },
    #[error("planner response could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}
