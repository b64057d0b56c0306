//! Task orchestration for a voice-driven screen guide.
//!
//! The user speaks, a remote planner decides what to say and do, and the
//! engine executes actions against whatever screen host it is given, watching
//! the screen for the next step.

pub mod apps;
pub mod bus;
pub mod commands;
pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod executor;
pub mod followup;
pub mod guided;
pub mod logging;
pub mod observer;
pub mod planner;
pub mod prefs;
pub mod screen;
pub mod selector;
pub mod speech;
pub mod status;
pub mod timer;
pub mod types;

pub use bus::{BusEvent, EventBus};
pub use config::{Config, EngineTimings};
pub use engine::{Collaborators, CommandMessage, Engine, EngineHandle, EngineInput};
pub use error::{ExecError, PlannerError};
pub use screen::{ScreenHost, ScreenNode, ScreenTree};
pub use types::{Action, Selector, TaskState};
