//! The serialized execution context.
//!
//! One task owns the conversation, the observer, the executor, the follow-up
//! window and every timer. Hosts talk to it through [`EngineHandle`]; planner
//! calls run on worker tasks and come back as replies applied to current state.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::bus::{BusEvent, EventBus};
use crate::config::EngineTimings;
use crate::conversation::{Conversation, ConversationState, Effect, PlannerQuery, TurnContext};
use crate::error::PlannerError;
use crate::executor::{ActionExecutor, ExecReport};
use crate::followup::FollowUpWindow;
use crate::observer::{ScreenChange, ScreenObserver};
use crate::planner::{Planner, PlannerRequest, PlannerResponse};
use crate::prefs::Preferences;
use crate::screen::ScreenHost;
use crate::speech::{AfterSpeech, Listener, Speaker, SpeechPriority, UtteranceId, UtteranceIds};
use crate::status::StatusProvider;
use crate::timer::{TimerKind, TimerSlot, TimerToken};
use crate::types::{FOLLOW_UP_SENTINEL, TaskState};

/// Recognized text and screen context delivered together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CommandMessage {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub screen_context: Option<String>,
}

#[derive(Debug)]
pub enum EngineInput {
    /// IPC command: empty text is a button press, `FOLLOW_UP` forces a follow-up call.
    Command(CommandMessage),
    /// A listening session ended with this (possibly empty) hypothesis string.
    Recognized(String),
    ScreenMutated,
    SpeechDone(UtteranceId),
    Reset,
    Shutdown,
}

/// External collaborators the engine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub host: Arc<dyn ScreenHost>,
    pub speaker: Arc<dyn Speaker>,
    pub listener: Arc<dyn Listener>,
    pub planner: Arc<dyn Planner>,
    pub status: Arc<dyn StatusProvider>,
    pub prefs: Arc<dyn Preferences>,
}

#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineInput>,
}

impl EngineHandle {
    /// False once the engine has stopped.
    pub fn send(&self, input: EngineInput) -> bool {
        if self.tx.send(input).is_err() {
            warn!("engine is gone, input dropped");
            return false;
        }
        true
    }

    pub fn submit_command(&self, message: CommandMessage) -> bool {
        self.send(EngineInput::Command(message))
    }

    pub fn recognized(&self, text: impl Into<String>) -> bool {
        self.send(EngineInput::Recognized(text.into()))
    }

    pub fn screen_mutated(&self) -> bool {
        self.send(EngineInput::ScreenMutated)
    }

    pub fn speech_done(&self, id: UtteranceId) -> bool {
        self.send(EngineInput::SpeechDone(id))
    }

    pub fn reset(&self) -> bool {
        self.send(EngineInput::Reset)
    }

    pub fn shutdown(&self) -> bool {
        self.send(EngineInput::Shutdown)
    }
}

type PlannerResult = Result<PlannerResponse, PlannerError>;

pub struct Engine {
    timings: EngineTimings,
    parts: Collaborators,
    bus: EventBus,
    conversation: Conversation,
    observer: ScreenObserver,
    executor: ActionExecutor,
    window: FollowUpWindow,
    expiry: TimerSlot,
    watchdog: TimerSlot,
    timer_tx: mpsc::UnboundedSender<TimerToken>,
    timer_rx: mpsc::UnboundedReceiver<TimerToken>,
    inbox: mpsc::UnboundedReceiver<EngineInput>,
    reply_tx: mpsc::UnboundedSender<PlannerResult>,
    reply_rx: mpsc::UnboundedReceiver<PlannerResult>,
    ids: UtteranceIds,
    pending_speech: HashMap<UtteranceId, AfterSpeech>,
    published_state: ConversationState,
    published_task: TaskState,
    /// A successful action ran while the window was closed; its capture is
    /// re-armed once the window opens.
    capture_owed: bool,
}

impl Engine {
    pub fn new(timings: EngineTimings, parts: Collaborators, bus: EventBus) -> (Self, EngineHandle) {
        let (tx, inbox) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let observer = ScreenObserver::new(
            parts.host.clone(),
            timer_tx.clone(),
            timings.debounce,
            timings.forced_capture,
            timings.snapshot_hash_prefix,
        );
        let executor = ActionExecutor::new(parts.host.clone(), bus.clone(), timings.strike_limit);
        let conversation = Conversation::new(parts.prefs.clone(), timings.max_task_steps);
        let engine = Self {
            timings,
            parts,
            bus,
            conversation,
            observer,
            executor,
            window: FollowUpWindow::default(),
            expiry: TimerSlot::new(TimerKind::FollowUpExpiry),
            watchdog: TimerSlot::new(TimerKind::ListenWatchdog),
            timer_tx,
            timer_rx,
            inbox,
            reply_tx,
            reply_rx,
            ids: UtteranceIds::default(),
            pending_speech: HashMap::new(),
            published_state: ConversationState::Idle,
            published_task: TaskState::default(),
            capture_owed: false,
        };
        (engine, EngineHandle { tx })
    }

    pub fn spawn(
        timings: EngineTimings,
        parts: Collaborators,
        bus: EventBus,
    ) -> (EngineHandle, JoinHandle<()>) {
        let (engine, handle) = Self::new(timings, parts, bus);
        (handle, tokio::spawn(engine.run()))
    }

    pub async fn run(mut self) {
        info!("engine started");
        loop {
            tokio::select! {
                input = self.inbox.recv() => match input {
                    Some(EngineInput::Shutdown) | None => break,
                    Some(input) => self.on_input(input),
                },
                Some(reply) = self.reply_rx.recv() => {
                    let effects = self.conversation.on_planner_reply(reply);
                    self.apply(effects);
                }
                Some(token) = self.timer_rx.recv() => self.on_timer(token),
            }
            self.publish_changes();
        }
        self.observer.cancel_timers();
        self.parts.listener.cancel();
        self.parts.speaker.stop();
        info!("engine stopped");
    }

    fn on_input(&mut self, input: EngineInput) {
        match input {
            EngineInput::Command(message) => self.on_command(message),
            EngineInput::Recognized(text) => self.on_utterance(&text, None),
            EngineInput::ScreenMutated => self.observer.on_mutation(),
            EngineInput::SpeechDone(id) => self.on_speech_done(id),
            EngineInput::Reset => {
                info!("resetting to idle");
                self.parts.speaker.stop();
                self.parts.listener.cancel();
                self.pending_speech.clear();
                self.watchdog.cancel();
                self.observer.cancel_timers();
                self.capture_owed = false;
                let effects = self.conversation.reset_to_idle();
                self.apply(effects);
            }
            EngineInput::Shutdown => {}
        }
    }

    fn on_command(&mut self, message: CommandMessage) {
        let text = message.text.trim();
        if text.is_empty() {
            debug!("button press without speech");
            self.parts.listener.cancel();
            let effects = self.conversation.on_button_press();
            self.apply(effects);
        } else if text == FOLLOW_UP_SENTINEL {
            debug!("follow-up requested over IPC");
            self.observer.mark_follow_up_sent();
            let effects = self.conversation.on_follow_up(message.screen_context);
            self.apply(effects);
        } else {
            self.on_utterance(text, message.screen_context);
        }
    }

    fn on_utterance(&mut self, text: &str, screen_context: Option<String>) {
        self.watchdog.cancel();
        self.observer.cancel_timers();
        self.capture_owed = false;
        let apps = self.parts.host.launchable_apps();
        let ctx = TurnContext {
            apps: &apps,
            screen_context,
        };
        let effects = self.conversation.on_utterance(text, ctx);
        self.apply(effects);
    }

    fn on_timer(&mut self, token: TimerToken) {
        match token.kind {
            TimerKind::Debounce => {
                if let Some(change) = self.observer.on_debounce(token) {
                    self.on_screen_change(change);
                }
            }
            TimerKind::ForcedCapture => {
                let failed = self.executor.last_action_failed();
                if let Some(change) = self.observer.on_forced(token, failed) {
                    self.on_screen_change(change);
                }
            }
            TimerKind::FollowUpExpiry => {
                if self.expiry.accept(token) {
                    info!("follow-up window expired");
                    self.window.close();
                }
            }
            TimerKind::ListenWatchdog => {
                if self.watchdog.accept(token) {
                    warn!("voice turn timed out");
                    self.parts.listener.cancel();
                    self.bus.publish(BusEvent::TurnReady);
                }
            }
            TimerKind::GuidedTimeout => trace!("guided timer token on engine channel"),
        }
    }

    fn on_screen_change(&mut self, change: ScreenChange) {
        if !self.window.is_open(Instant::now()) {
            trace!(hash = %change.hash, "screen change outside follow-up window");
            return;
        }
        if self.conversation.state() != ConversationState::Idle
            || self.conversation.awaiting_planner()
        {
            debug!(hash = %change.hash, "screen change while busy, not forwarded");
            return;
        }
        info!(hash = %change.hash, forced = change.forced, "forwarding screen change to planner");
        self.observer.mark_follow_up_sent();
        let effects = self
            .conversation
            .on_follow_up(Some(change.snapshot.to_text()));
        self.apply(effects);
    }

    fn on_speech_done(&mut self, id: UtteranceId) {
        let Some(then) = self.pending_speech.remove(&id) else {
            debug!(%id, "stale speech completion discarded");
            return;
        };
        trace!(%id, ?then, "speech finished");
        match then {
            AfterSpeech::Nothing => {}
            AfterSpeech::Listen => self.begin_listening(),
            AfterSpeech::OpenFollowUp => self.open_follow_up(),
        }
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Speak {
                    text,
                    priority,
                    then,
                } => self.speak(text, priority, then),
                Effect::CallPlanner(query) => self.call_planner(query),
                Effect::Execute(action) => {
                    let report = self.executor.execute(&action);
                    if action.changes_screen() {
                        self.after_local_action(report.is_ok());
                    }
                    self.speak_feedback(report);
                }
                Effect::Launch { app, goal } => {
                    let report = self.executor.launch(&app);
                    if report.is_ok() {
                        if let Some(goal) = goal {
                            self.conversation.seed_goal(&goal);
                        }
                        self.after_local_action(true);
                    }
                    self.speak_feedback(report);
                }
                Effect::OpenSettings(page) => {
                    let report = self.executor.open_settings(page);
                    if report.is_ok() {
                        self.after_local_action(true);
                    }
                    self.speak_feedback(report);
                }
                Effect::CloseFollowUp => {
                    if self.window.expires_at().is_some() {
                        debug!("follow-up window closed");
                    }
                    self.window.close();
                    self.expiry.cancel();
                }
                Effect::ResetStrikes => self.executor.reset_strikes(),
                Effect::TurnFinished => self.bus.publish(BusEvent::TurnReady),
            }
        }
    }

    /// A failed action still arms the forced capture, which then skips itself,
    /// but leaves suppression alone: nothing on screen moved.
    fn after_local_action(&mut self, succeeded: bool) {
        if succeeded {
            self.observer.note_local_action();
            if !self.window.is_open(Instant::now()) {
                self.capture_owed = true;
            }
        }
        self.observer.schedule_forced_capture();
    }

    fn speak_feedback(&mut self, report: ExecReport) {
        if let Some(feedback) = report.feedback {
            self.speak(feedback.phrase(), SpeechPriority::Enqueue, AfterSpeech::Nothing);
        }
    }

    fn speak(&mut self, text: String, priority: SpeechPriority, then: AfterSpeech) {
        let id = self.ids.next_id();
        if priority == SpeechPriority::Flush {
            self.pending_speech.clear();
        }
        self.pending_speech.insert(id, then);
        debug!(%id, ?priority, %text, "speaking");
        self.parts.speaker.speak(id, &text, priority);
        self.bus.publish(BusEvent::Spoke { text });
    }

    fn begin_listening(&mut self) {
        self.window.close();
        self.expiry.cancel();
        debug!("listening");
        self.parts.listener.start_listening();
        self.watchdog
            .arm(self.timings.listen_watchdog, &self.timer_tx);
    }

    fn open_follow_up(&mut self) {
        self.window
            .open(Instant::now(), self.timings.follow_up_window);
        self.expiry
            .arm(self.timings.follow_up_window, &self.timer_tx);
        self.observer.reset_window();
        info!(
            secs = self.timings.follow_up_window.as_secs(),
            "follow-up window opened"
        );
        if std::mem::take(&mut self.capture_owed) && !self.observer.forced_pending() {
            debug!("action finished while speaking, forced capture re-armed");
            self.observer.schedule_forced_capture();
        }
    }

    fn call_planner(&mut self, query: PlannerQuery) {
        let screen_context = query
            .screen_context
            .unwrap_or_else(|| self.observer.snapshot().to_text());
        let request = PlannerRequest {
            session_id: query.session_id,
            user_text: query.user_text,
            screen_context,
            status: self.parts.status.current().serialize_compact(),
            task_state: query.task,
        };
        info!(
            session = %request.session_id,
            goal = %request.task_state.goal,
            step = request.task_state.step,
            "planner call"
        );
        let planner = self.parts.planner.clone();
        let reply_tx = self.reply_tx.clone();
        tokio::spawn(async move {
            let reply = planner.plan(request).await;
            let _ = reply_tx.send(reply);
        });
    }

    fn publish_changes(&mut self) {
        let state = self.conversation.state();
        if state != self.published_state {
            debug!(?state, "conversation state changed");
            self.published_state = state;
            self.bus.publish(BusEvent::StateChanged { state });
        }
        if self.conversation.task() != &self.published_task {
            let task = self.conversation.task().clone();
            debug!(goal = %task.goal, step = task.step, "task changed");
            self.published_task = task.clone();
            self.bus.publish(BusEvent::TaskChanged { task });
        }
    }
}
