//! The dialog controller.
//!
//! A pure reducer: every handler mutates the session context and returns the
//! [`Effect`]s the engine must carry out. It never talks to a collaborator itself.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::apps;
use crate::commands::{self, LocalCommand};
use crate::error::PlannerError;
use crate::planner::{PlannerResponse, sanitize_reply};
use crate::prefs::{Language, Preferences, SpeedChange};
use crate::screen::{LaunchableApp, SettingsPage};
use crate::speech::{AfterSpeech, SpeechPriority};
use crate::types::{Action, FOLLOW_UP_SENTINEL, TaskState};

pub mod phrases {
    pub const PLANNER_FAILED: &str =
        "Sorry, I couldn't work that out right now. Please try again.";
    pub const PLANNER_SILENT: &str = "Sorry, I didn't get that. Please try again.";
    pub const TASK_ABANDONED: &str =
        "I'm sorry, I couldn't finish this task. Let's start again from the beginning.";
    pub const TASK_STOPPED: &str = "Okay, I stopped.";
    pub const SETTINGS_MENU: &str =
        "What would you like to change: your name, my language, or how fast I speak?";
    pub const ASK_NAME: &str = "What should I call you?";
    pub const ASK_LANGUAGE: &str = "Which language should I speak?";
    pub const ASK_SPEED: &str = "Should I speak faster or slower?";
    pub const NOT_UNDERSTOOD: &str = "Sorry, I didn't understand.";
    pub const SETTING_ABANDONED: &str = "Sorry, I still didn't understand. Let's leave it as it is.";
    pub const CANCELLED: &str = "Okay.";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Idle,
    AwaitingSettingChoice,
    AwaitingNewName,
    AwaitingNewLanguage,
    AwaitingNewSpeed,
}

impl ConversationState {
    fn prompt(self) -> &'static str {
        match self {
            ConversationState::Idle => "",
            ConversationState::AwaitingSettingChoice => phrases::SETTINGS_MENU,
            ConversationState::AwaitingNewName => phrases::ASK_NAME,
            ConversationState::AwaitingNewLanguage => phrases::ASK_LANGUAGE,
            ConversationState::AwaitingNewSpeed => phrases::ASK_SPEED,
        }
    }
}

/// Everything the planner call needs from the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannerQuery {
    pub session_id: String,
    pub user_text: String,
    /// Screen text delivered with the utterance; the engine captures one if absent.
    pub screen_context: Option<String>,
    pub task: TaskState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Speak {
        text: String,
        priority: SpeechPriority,
        then: AfterSpeech,
    },
    CallPlanner(PlannerQuery),
    Execute(Action),
    /// Launch an app; on success `goal` seeds a new task.
    Launch {
        app: LaunchableApp,
        goal: Option<String>,
    },
    OpenSettings(SettingsPage),
    CloseFollowUp,
    ResetStrikes,
    /// The voice turn is over; the UI may show "ready".
    TurnFinished,
}

impl Effect {
    fn say(text: impl Into<String>, then: AfterSpeech) -> Self {
        Effect::Speak {
            text: text.into(),
            priority: SpeechPriority::Flush,
            then,
        }
    }
}

/// Inputs that arrive alongside an utterance.
#[derive(Debug, Clone, Default)]
pub struct TurnContext<'a> {
    pub apps: &'a [LaunchableApp],
    pub screen_context: Option<String>,
}

enum SettingReply {
    Name(String),
    Language(Language),
    Speed(SpeedChange),
    Ask(ConversationState),
    Cancel,
}

pub struct Conversation {
    state: ConversationState,
    task: TaskState,
    session_id: Option<String>,
    retry_used: bool,
    awaiting_planner: bool,
    max_task_steps: u32,
    prefs: Arc<dyn Preferences>,
}

impl Conversation {
    pub fn new(prefs: Arc<dyn Preferences>, max_task_steps: u32) -> Self {
        Self {
            state: ConversationState::Idle,
            task: TaskState::default(),
            session_id: None,
            retry_used: false,
            awaiting_planner: false,
            max_task_steps,
            prefs,
        }
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn task(&self) -> &TaskState {
        &self.task
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// A planner call has been issued and its reply not yet applied.
    pub fn awaiting_planner(&self) -> bool {
        self.awaiting_planner
    }

    /// Push-to-talk without speech: greet and open a listening session.
    pub fn on_button_press(&mut self) -> Vec<Effect> {
        let greeting = match self.prefs.user_name() {
            Some(name) => format!("Hi {name}, how can I help?"),
            None => "How can I help?".to_string(),
        };
        vec![Effect::CloseFollowUp, Effect::say(greeting, AfterSpeech::Listen)]
    }

    /// Recognized speech (or the follow-up sentinel) from the user.
    pub fn on_utterance(&mut self, text: &str, ctx: TurnContext<'_>) -> Vec<Effect> {
        if text.trim() == FOLLOW_UP_SENTINEL {
            return self.on_follow_up(ctx.screen_context);
        }
        let hypotheses = commands::split_hypotheses(text);
        let mut effects = vec![Effect::CloseFollowUp, Effect::ResetStrikes];
        if self.state == ConversationState::Idle {
            effects.extend(self.handle_idle(&hypotheses, ctx));
        } else {
            effects.extend(self.handle_awaiting(&hypotheses));
        }
        effects
    }

    /// The screen moved on its own inside an open follow-up window.
    pub fn on_follow_up(&mut self, screen_context: Option<String>) -> Vec<Effect> {
        if self.state != ConversationState::Idle {
            debug!(state = ?self.state, "follow-up ignored outside idle");
            return Vec::new();
        }
        self.query_planner(FOLLOW_UP_SENTINEL.to_string(), screen_context)
    }

    pub fn on_planner_reply(
        &mut self,
        result: Result<PlannerResponse, PlannerError>,
    ) -> Vec<Effect> {
        self.awaiting_planner = false;
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "planner call failed");
                return vec![
                    Effect::say(phrases::PLANNER_FAILED, AfterSpeech::Nothing),
                    Effect::TurnFinished,
                ];
            }
        };
        if response.is_silent() {
            warn!("planner returned neither text nor actions");
            return vec![
                Effect::say(phrases::PLANNER_SILENT, AfterSpeech::Nothing),
                Effect::TurnFinished,
            ];
        }

        let mut effects = Vec::new();
        let stops = response.actions.contains(&Action::StopTask);
        let reply = response
            .reply_text
            .as_deref()
            .map(sanitize_reply)
            .unwrap_or_default();
        if !reply.is_empty() {
            let then = if stops {
                AfterSpeech::Nothing
            } else {
                AfterSpeech::OpenFollowUp
            };
            effects.push(Effect::say(reply, then));
        }
        for action in response.actions {
            match action {
                Action::SetGoal { value } => {
                    info!(goal = %value, "planner set a new goal");
                    self.task.assign(value);
                }
                Action::StopTask => {
                    info!("planner finished the task");
                    self.task.reset();
                }
                other => effects.push(Effect::Execute(other)),
            }
        }
        effects.push(Effect::TurnFinished);
        effects
    }

    /// A launch with a trailing request succeeded; that request becomes the task.
    pub fn seed_goal(&mut self, goal: &str) {
        info!(goal, "task seeded from app launch");
        self.task.assign(goal);
    }

    /// Back to Idle with no task and no session.
    pub fn reset_to_idle(&mut self) -> Vec<Effect> {
        self.state = ConversationState::Idle;
        self.task.reset();
        self.session_id = None;
        self.retry_used = false;
        self.awaiting_planner = false;
        vec![Effect::CloseFollowUp, Effect::ResetStrikes, Effect::TurnFinished]
    }

    fn handle_idle(&mut self, hypotheses: &[String], ctx: TurnContext<'_>) -> Vec<Effect> {
        let Some(primary) = hypotheses.first() else {
            debug!("empty recognition result, no command");
            return vec![Effect::TurnFinished];
        };
        let (utterance, command) = hypotheses
            .iter()
            .map(|h| (h, commands::parse(h)))
            .find(|(_, command)| command.is_known())
            .unwrap_or((primary, LocalCommand::Unknown));
        debug!(?command, "parsed utterance");

        match command {
            LocalCommand::Unknown => self.query_planner(utterance.clone(), ctx.screen_context),
            LocalCommand::Stop => {
                self.task.reset();
                vec![
                    Effect::say(phrases::TASK_STOPPED, AfterSpeech::Nothing),
                    Effect::TurnFinished,
                ]
            }
            LocalCommand::Back => vec![Effect::Execute(Action::Back), Effect::TurnFinished],
            LocalCommand::Home => vec![Effect::Execute(Action::Home), Effect::TurnFinished],
            LocalCommand::Scroll(direction) => vec![
                Effect::Execute(Action::Scroll { direction }),
                Effect::TurnFinished,
            ],
            LocalCommand::LaunchApp(query) => match apps::match_app(ctx.apps, &query) {
                Some(found) => {
                    let goal = Some(found.remainder).filter(|r| !r.is_empty());
                    let then = if goal.is_some() {
                        AfterSpeech::OpenFollowUp
                    } else {
                        AfterSpeech::Nothing
                    };
                    vec![
                        Effect::Launch {
                            app: found.app.clone(),
                            goal,
                        },
                        Effect::say(format!("Opening {}.", found.app.label), then),
                        Effect::TurnFinished,
                    ]
                }
                None => {
                    debug!(%query, "no launchable app matched, asking planner");
                    self.query_planner(utterance.clone(), ctx.screen_context)
                }
            },
            LocalCommand::OpenSettings(page) => vec![
                Effect::OpenSettings(page),
                Effect::say("Opening settings.", AfterSpeech::Nothing),
                Effect::TurnFinished,
            ],
            LocalCommand::AssistantSettings => self.ask(ConversationState::AwaitingSettingChoice),
            LocalCommand::ChangeName(Some(name)) => match commands::extract_name(&name) {
                Some(name) => self.apply(SettingReply::Name(name)),
                None => self.ask(ConversationState::AwaitingNewName),
            },
            LocalCommand::ChangeName(None) => self.ask(ConversationState::AwaitingNewName),
            LocalCommand::ChangeLanguage(Some(language)) => {
                self.apply(SettingReply::Language(language))
            }
            LocalCommand::ChangeLanguage(None) => self.ask(ConversationState::AwaitingNewLanguage),
            LocalCommand::ChangeSpeed(Some(change)) => self.apply(SettingReply::Speed(change)),
            LocalCommand::ChangeSpeed(None) => self.ask(ConversationState::AwaitingNewSpeed),
        }
    }

    fn handle_awaiting(&mut self, hypotheses: &[String]) -> Vec<Effect> {
        let reply = hypotheses.iter().find_map(|h| self.parse_setting_reply(h));
        match reply {
            Some(reply) => self.apply(reply),
            None if !self.retry_used => {
                self.retry_used = true;
                debug!(state = ?self.state, "setting reply not understood, retrying once");
                let prompt = format!("{} {}", phrases::NOT_UNDERSTOOD, self.state.prompt());
                vec![Effect::say(prompt, AfterSpeech::Listen)]
            }
            None => {
                info!(state = ?self.state, "setting reply not understood twice, giving up");
                self.state = ConversationState::Idle;
                vec![
                    Effect::say(phrases::SETTING_ABANDONED, AfterSpeech::Nothing),
                    Effect::TurnFinished,
                ]
            }
        }
    }

    /// State-specific grammar first, then the general command parser.
    fn parse_setting_reply(&self, text: &str) -> Option<SettingReply> {
        let general = commands::parse(text);
        if general == LocalCommand::Stop {
            return Some(SettingReply::Cancel);
        }
        let specific = match self.state {
            ConversationState::Idle => None,
            ConversationState::AwaitingSettingChoice => {
                let words = commands::normalize(text);
                if let Some(change) = commands::detect_speed(text) {
                    Some(SettingReply::Speed(change))
                } else if let Some(language) = commands::detect_language(text) {
                    Some(SettingReply::Language(language))
                } else if words.contains("name") {
                    Some(SettingReply::Ask(ConversationState::AwaitingNewName))
                } else if words.contains("language") {
                    Some(SettingReply::Ask(ConversationState::AwaitingNewLanguage))
                } else if ["speed", "rate", "fast", "slow"].iter().any(|w| words.contains(w)) {
                    Some(SettingReply::Ask(ConversationState::AwaitingNewSpeed))
                } else {
                    None
                }
            }
            ConversationState::AwaitingNewName => commands::extract_name(text).map(SettingReply::Name),
            ConversationState::AwaitingNewLanguage => {
                commands::detect_language(text).map(SettingReply::Language)
            }
            ConversationState::AwaitingNewSpeed => {
                commands::detect_speed(text).map(SettingReply::Speed)
            }
        };
        specific.or(match general {
            LocalCommand::ChangeName(Some(name)) => {
                commands::extract_name(&name).map(SettingReply::Name)
            }
            LocalCommand::ChangeLanguage(Some(language)) => Some(SettingReply::Language(language)),
            LocalCommand::ChangeSpeed(Some(change)) => Some(SettingReply::Speed(change)),
            _ => None,
        })
    }

    fn ask(&mut self, state: ConversationState) -> Vec<Effect> {
        self.state = state;
        self.retry_used = false;
        vec![Effect::say(state.prompt(), AfterSpeech::Listen)]
    }

    fn apply(&mut self, reply: SettingReply) -> Vec<Effect> {
        let confirmation = match reply {
            SettingReply::Ask(next) => return self.ask(next),
            SettingReply::Cancel => phrases::CANCELLED.to_string(),
            SettingReply::Name(name) => {
                self.prefs.set_user_name(&name);
                format!("Okay, I'll call you {name}.")
            }
            SettingReply::Language(language) => {
                self.prefs.set_language(language);
                format!("Okay, I'll speak {}.", language.display_name())
            }
            SettingReply::Speed(change) => {
                let rate = change.apply(self.prefs.speech_rate());
                self.prefs.set_speech_rate(rate);
                match change {
                    SpeedChange::Faster => "Okay, I'll speak faster.".to_string(),
                    SpeedChange::Slower => "Okay, I'll speak slower.".to_string(),
                }
            }
        };
        self.state = ConversationState::Idle;
        self.retry_used = false;
        vec![
            Effect::say(confirmation, AfterSpeech::Nothing),
            Effect::TurnFinished,
        ]
    }

    /// One planner round trip, guarded by the step fuse.
    fn query_planner(&mut self, user_text: String, screen_context: Option<String>) -> Vec<Effect> {
        if self.task.is_active() {
            if self.task.step >= self.max_task_steps {
                warn!(
                    goal = %self.task.goal,
                    step = self.task.step,
                    "task step ceiling reached, abandoning task"
                );
                self.task.reset();
                self.state = ConversationState::Idle;
                return vec![
                    Effect::say(phrases::TASK_ABANDONED, AfterSpeech::Nothing),
                    Effect::TurnFinished,
                ];
            }
            self.task.advance();
        }
        self.awaiting_planner = true;
        let session_id = self
            .session_id
            .get_or_insert_with(new_session_id)
            .clone();
        vec![Effect::CallPlanner(PlannerQuery {
            session_id,
            user_text,
            screen_context,
            task: self.task.clone(),
        })]
    }
}

fn new_session_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}
