//! Scripted step sequences: say a phrase, wait for the screen to match, repeat on timeout.
//!
//! [`GuidedMachine`] is the transition table and never touches a clock or a speaker.
//! [`GuidedRunner`] drives one machine on its own task.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bus::{BusEvent, EventBus};
use crate::screen::ScreenTree;
use crate::speech::{SpeechPriority, Speaker, UtteranceId, UtteranceIds};
use crate::timer::{TimerKind, TimerSlot, TimerToken};

/// Tags and key/value extras derived from one screen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScreenFacts {
    pub tags: BTreeSet<String>,
    pub extras: BTreeMap<String, String>,
}

impl ScreenFacts {
    /// Tags: the package id plus every visible text and description, lower-cased.
    /// Extras: `package` and, when an input has focus, `focused`.
    pub fn from_tree(tree: Option<&ScreenTree>) -> Self {
        let mut facts = ScreenFacts::default();
        let Some(tree) = tree else {
            return facts;
        };
        if !tree.package.is_empty() {
            facts.tags.insert(tree.package.to_lowercase());
            facts
                .extras
                .insert("package".to_string(), tree.package.clone());
        }
        for (_, _, node) in tree.visible_nodes() {
            facts.tags.extend(node.label().map(str::to_lowercase));
            facts.tags.extend(node.desc().map(str::to_lowercase));
        }
        if let Some((_, node)) = tree.focused_input() {
            let name = node
                .desc()
                .or(node.view_id.as_deref())
                .or(node.label())
                .unwrap_or_default();
            facts.extras.insert("focused".to_string(), name.to_string());
        }
        facts
    }

    pub fn with_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ScreenFacts {
            tags: tags.into_iter().map(Into::into).collect(),
            extras: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, key: &str, value: &str) -> Self {
        self.extras.insert(key.to_string(), value.to_string());
        self
    }
}

/// Boolean predicate over [`ScreenFacts`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchCondition {
    AnyTag(Vec<String>),
    AllTags(Vec<String>),
    Extra { key: String, value: String },
    And(Vec<MatchCondition>),
    Or(Vec<MatchCondition>),
    Not(Box<MatchCondition>),
}

impl MatchCondition {
    pub fn any_tag<S: Into<String>>(tags: impl IntoIterator<Item = S>) -> Self {
        MatchCondition::AnyTag(tags.into_iter().map(Into::into).collect())
    }

    pub fn all_tags<S: Into<String>>(tags: impl IntoIterator<Item = S>) -> Self {
        MatchCondition::AllTags(tags.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, facts: &ScreenFacts) -> bool {
        match self {
            MatchCondition::AnyTag(tags) => tags.iter().any(|t| facts.tags.contains(t)),
            MatchCondition::AllTags(tags) => tags.iter().all(|t| facts.tags.contains(t)),
            MatchCondition::Extra { key, value } => facts.extras.get(key) == Some(value),
            MatchCondition::And(all) => all.iter().all(|c| c.matches(facts)),
            MatchCondition::Or(any) => any.iter().any(|c| c.matches(facts)),
            MatchCondition::Not(inner) => !inner.matches(facts),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowStep {
    pub say: String,
    pub condition: Option<MatchCondition>,
    pub timeout: Option<Duration>,
    /// Spoken on timeout instead of `say`.
    pub timeout_say: Option<String>,
}

impl FlowStep {
    pub fn say(text: impl Into<String>) -> Self {
        FlowStep {
            say: text.into(),
            condition: None,
            timeout: None,
            timeout_say: None,
        }
    }

    pub fn until(mut self, condition: MatchCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn timeout(mut self, timeout: Duration, phrase: Option<&str>) -> Self {
        self.timeout = Some(timeout);
        self.timeout_say = phrase.map(str::to_string);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuidedFlow {
    pub name: String,
    pub steps: Vec<FlowStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    Speaking { step: usize },
    WaitingMatch { step: usize },
    Completed,
    Cancelled,
}

impl FlowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowState::Completed | FlowState::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    Start,
    SpeechFinished,
    Screen(ScreenFacts),
    Timeout,
    Cancel,
    ForceAdvance,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowCommand {
    Speak(String),
    ArmTimer(Duration),
    CancelTimer,
    Finished(FlowOutcome),
}

pub struct GuidedMachine {
    flow: GuidedFlow,
    state: FlowState,
    facts: ScreenFacts,
}

impl GuidedMachine {
    pub fn new(flow: GuidedFlow) -> Self {
        Self {
            flow,
            state: FlowState::Idle,
            facts: ScreenFacts::default(),
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn name(&self) -> &str {
        &self.flow.name
    }

    pub fn handle(&mut self, event: FlowEvent) -> Vec<FlowCommand> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        match (self.state, event) {
            (_, FlowEvent::Cancel) => {
                self.state = FlowState::Cancelled;
                vec![
                    FlowCommand::CancelTimer,
                    FlowCommand::Finished(FlowOutcome::Cancelled),
                ]
            }
            (_, FlowEvent::Screen(facts)) => {
                self.facts = facts;
                match self.state {
                    FlowState::WaitingMatch { step } if self.step_matches(step) => {
                        let mut commands = vec![FlowCommand::CancelTimer];
                        commands.extend(self.enter(step + 1));
                        commands
                    }
                    _ => Vec::new(),
                }
            }
            (FlowState::Idle, FlowEvent::Start) => self.enter(0),
            (FlowState::Speaking { step }, FlowEvent::SpeechFinished) => {
                let current = &self.flow.steps[step];
                if current.condition.is_none() {
                    return self.enter(step + 1);
                }
                // Facts seen while the phrase was playing count.
                if self.step_matches(step) {
                    return self.enter(step + 1);
                }
                self.state = FlowState::WaitingMatch { step };
                current
                    .timeout
                    .map(FlowCommand::ArmTimer)
                    .into_iter()
                    .collect()
            }
            (FlowState::WaitingMatch { step }, FlowEvent::Timeout) => {
                let current = &self.flow.steps[step];
                debug!(flow = %self.flow.name, step, "no match before timeout, repeating");
                let phrase = current.timeout_say.as_ref().unwrap_or(&current.say).clone();
                let mut commands = vec![FlowCommand::Speak(phrase)];
                commands.extend(current.timeout.map(FlowCommand::ArmTimer));
                commands
            }
            (
                FlowState::Speaking { step } | FlowState::WaitingMatch { step },
                FlowEvent::ForceAdvance,
            ) => {
                let mut commands = vec![FlowCommand::CancelTimer];
                commands.extend(self.enter(step + 1));
                commands
            }
            (state, event) => {
                debug!(flow = %self.flow.name, ?state, ?event, "event ignored");
                Vec::new()
            }
        }
    }

    fn step_matches(&self, step: usize) -> bool {
        self.flow.steps[step]
            .condition
            .as_ref()
            .is_some_and(|c| c.matches(&self.facts))
    }

    fn enter(&mut self, step: usize) -> Vec<FlowCommand> {
        match self.flow.steps.get(step) {
            Some(next) => {
                self.state = FlowState::Speaking { step };
                vec![FlowCommand::Speak(next.say.clone())]
            }
            None => {
                self.state = FlowState::Completed;
                vec![FlowCommand::Finished(FlowOutcome::Completed)]
            }
        }
    }
}

#[derive(Debug)]
enum RunnerInput {
    SpeechDone(UtteranceId),
    Screen(ScreenFacts),
    Cancel,
    ForceAdvance,
}

/// Feeds a running flow. Dropping every handle cancels the flow.
#[derive(Debug, Clone)]
pub struct GuidedHandle {
    tx: mpsc::UnboundedSender<RunnerInput>,
}

impl GuidedHandle {
    pub fn speech_done(&self, id: UtteranceId) {
        let _ = self.tx.send(RunnerInput::SpeechDone(id));
    }

    pub fn screen(&self, facts: ScreenFacts) {
        let _ = self.tx.send(RunnerInput::Screen(facts));
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(RunnerInput::Cancel);
    }

    pub fn force_advance(&self) {
        let _ = self.tx.send(RunnerInput::ForceAdvance);
    }
}

pub struct GuidedRunner {
    machine: GuidedMachine,
    speaker: Arc<dyn Speaker>,
    bus: EventBus,
    inbox: mpsc::UnboundedReceiver<RunnerInput>,
    timer: TimerSlot,
    timer_tx: mpsc::UnboundedSender<TimerToken>,
    timer_rx: mpsc::UnboundedReceiver<TimerToken>,
    ids: UtteranceIds,
    speaking: Option<UtteranceId>,
}

impl GuidedRunner {
    pub fn new(flow: GuidedFlow, speaker: Arc<dyn Speaker>, bus: EventBus) -> (Self, GuidedHandle) {
        let (tx, inbox) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let runner = Self {
            machine: GuidedMachine::new(flow),
            speaker,
            bus,
            inbox,
            timer: TimerSlot::new(TimerKind::GuidedTimeout),
            timer_tx,
            timer_rx,
            ids: UtteranceIds::default(),
            speaking: None,
        };
        (runner, GuidedHandle { tx })
    }

    pub fn spawn(
        flow: GuidedFlow,
        speaker: Arc<dyn Speaker>,
        bus: EventBus,
    ) -> (GuidedHandle, JoinHandle<FlowOutcome>) {
        let (runner, handle) = Self::new(flow, speaker, bus);
        (handle, tokio::spawn(runner.run()))
    }

    pub async fn run(mut self) -> FlowOutcome {
        info!(flow = %self.machine.name(), "guided flow started");
        if let Some(outcome) = self.apply(FlowEvent::Start) {
            return outcome;
        }
        loop {
            let event = tokio::select! {
                input = self.inbox.recv() => match input {
                    Some(RunnerInput::SpeechDone(id)) if Some(id) == self.speaking => {
                        self.speaking = None;
                        FlowEvent::SpeechFinished
                    }
                    Some(RunnerInput::SpeechDone(id)) => {
                        debug!(%id, "stale speech completion for guided flow");
                        continue;
                    }
                    Some(RunnerInput::Screen(facts)) => FlowEvent::Screen(facts),
                    Some(RunnerInput::ForceAdvance) => FlowEvent::ForceAdvance,
                    Some(RunnerInput::Cancel) | None => FlowEvent::Cancel,
                },
                Some(token) = self.timer_rx.recv() => {
                    if !self.timer.accept(token) {
                        continue;
                    }
                    FlowEvent::Timeout
                }
            };
            if let Some(outcome) = self.apply(event) {
                return outcome;
            }
        }
    }

    fn apply(&mut self, event: FlowEvent) -> Option<FlowOutcome> {
        for command in self.machine.handle(event) {
            match command {
                FlowCommand::Speak(text) => {
                    let id = self.ids.next_id();
                    self.speaking = Some(id);
                    self.speaker.speak(id, &text, SpeechPriority::Flush);
                    self.bus.publish(BusEvent::Spoke { text });
                }
                FlowCommand::ArmTimer(delay) => {
                    self.timer.arm(delay, &self.timer_tx);
                }
                FlowCommand::CancelTimer => self.timer.cancel(),
                FlowCommand::Finished(outcome) => {
                    info!(flow = %self.machine.name(), ?outcome, "guided flow finished");
                    if outcome == FlowOutcome::Cancelled && self.speaking.is_some() {
                        self.speaker.stop();
                    }
                    self.bus.publish(BusEvent::FlowFinished {
                        flow: self.machine.name().to_string(),
                        outcome,
                    });
                    return Some(outcome);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screen::fixtures::{node, tree};
    use std::sync::Mutex;

    fn wifi_flow() -> GuidedFlow {
        GuidedFlow {
            name: "wifi".to_string(),
            steps: vec![
                FlowStep::say("Let's turn on Wi-Fi."),
                FlowStep::say("Open Settings.")
                    .until(MatchCondition::any_tag(["settings"]))
                    .timeout(Duration::from_secs(10), Some("Tap the gear icon.")),
                FlowStep::say("Now tap Wi-Fi.").until(MatchCondition::And(vec![
                    MatchCondition::all_tags(["wi-fi", "use wi-fi"]),
                    MatchCondition::Not(Box::new(MatchCondition::any_tag(["airplane mode"]))),
                ])),
            ],
        }
    }

    #[test]
    fn steps_without_condition_advance_on_speech_end() {
        let mut machine = GuidedMachine::new(wifi_flow());
        assert_eq!(
            machine.handle(FlowEvent::Start),
            vec![FlowCommand::Speak("Let's turn on Wi-Fi.".to_string())]
        );
        assert_eq!(
            machine.handle(FlowEvent::SpeechFinished),
            vec![FlowCommand::Speak("Open Settings.".to_string())]
        );
        assert_eq!(machine.state(), FlowState::Speaking { step: 1 });
    }

    #[test]
    fn timeout_repeats_until_matched() {
        let mut machine = GuidedMachine::new(wifi_flow());
        machine.handle(FlowEvent::Start);
        machine.handle(FlowEvent::SpeechFinished);
        assert_eq!(
            machine.handle(FlowEvent::SpeechFinished),
            vec![FlowCommand::ArmTimer(Duration::from_secs(10))]
        );
        assert_eq!(machine.state(), FlowState::WaitingMatch { step: 1 });

        for _ in 0..3 {
            assert_eq!(
                machine.handle(FlowEvent::Timeout),
                vec![
                    FlowCommand::Speak("Tap the gear icon.".to_string()),
                    FlowCommand::ArmTimer(Duration::from_secs(10)),
                ]
            );
        }

        assert!(machine
            .handle(FlowEvent::Screen(ScreenFacts::with_tags(["home"])))
            .is_empty());
        assert_eq!(
            machine.handle(FlowEvent::Screen(ScreenFacts::with_tags(["settings"]))),
            vec![
                FlowCommand::CancelTimer,
                FlowCommand::Speak("Now tap Wi-Fi.".to_string()),
            ]
        );
    }

    #[test]
    fn composite_conditions() {
        let condition = wifi_flow().steps[2].condition.clone().unwrap();
        assert!(condition.matches(&ScreenFacts::with_tags(["wi-fi", "use wi-fi"])));
        assert!(!condition.matches(&ScreenFacts::with_tags(["wi-fi"])));
        assert!(!condition.matches(&ScreenFacts::with_tags([
            "wi-fi",
            "use wi-fi",
            "airplane mode"
        ])));
        let extra = MatchCondition::Or(vec![
            MatchCondition::Extra {
                key: "focused".to_string(),
                value: "search".to_string(),
            },
            MatchCondition::any_tag(["results"]),
        ]);
        assert!(extra.matches(&ScreenFacts::default().with_extra("focused", "search")));
        assert!(!extra.matches(&ScreenFacts::default()));
    }

    #[test]
    fn facts_seen_while_speaking_count() {
        let mut machine = GuidedMachine::new(wifi_flow());
        machine.handle(FlowEvent::Start);
        machine.handle(FlowEvent::SpeechFinished);
        machine.handle(FlowEvent::Screen(ScreenFacts::with_tags(["settings"])));
        assert_eq!(
            machine.handle(FlowEvent::SpeechFinished),
            vec![FlowCommand::Speak("Now tap Wi-Fi.".to_string())]
        );
    }

    #[test]
    fn completes_after_last_step_and_ignores_later_events() {
        let mut machine = GuidedMachine::new(wifi_flow());
        machine.handle(FlowEvent::Start);
        machine.handle(FlowEvent::ForceAdvance);
        machine.handle(FlowEvent::ForceAdvance);
        assert_eq!(
            machine.handle(FlowEvent::ForceAdvance),
            vec![
                FlowCommand::CancelTimer,
                FlowCommand::Finished(FlowOutcome::Completed)
            ]
        );
        assert_eq!(machine.state(), FlowState::Completed);
        assert!(machine.handle(FlowEvent::Cancel).is_empty());
    }

    #[test]
    fn cancel_from_any_live_state() {
        let waiting = vec![
            FlowEvent::Start,
            FlowEvent::SpeechFinished,
            FlowEvent::SpeechFinished,
        ];
        for events in [vec![], vec![FlowEvent::Start], waiting] {
            let mut machine = GuidedMachine::new(wifi_flow());
            for event in events {
                machine.handle(event);
            }
            assert_eq!(
                machine.handle(FlowEvent::Cancel),
                vec![
                    FlowCommand::CancelTimer,
                    FlowCommand::Finished(FlowOutcome::Cancelled)
                ]
            );
            assert_eq!(machine.state(), FlowState::Cancelled);
        }
    }

    #[test]
    fn empty_flow_completes_on_start() {
        let mut machine = GuidedMachine::new(GuidedFlow {
            name: "empty".to_string(),
            steps: vec![],
        });
        assert_eq!(
            machine.handle(FlowEvent::Start),
            vec![FlowCommand::Finished(FlowOutcome::Completed)]
        );
    }

    #[test]
    fn facts_from_tree() {
        let mut search = node("Search");
        search.editable = true;
        search.focused = true;
        search.view_id = Some("com.example:id/search".to_string());
        let facts = ScreenFacts::from_tree(Some(&tree(vec![node("Wi-Fi"), search])));
        assert!(facts.tags.contains("wi-fi"));
        assert!(facts.tags.contains("com.example.launcher"));
        assert_eq!(facts.extras["package"], "com.example.launcher");
        assert_eq!(facts.extras["focused"], "com.example:id/search");
        assert_eq!(ScreenFacts::from_tree(None), ScreenFacts::default());
    }

    #[derive(Default)]
    struct RecordingSpeaker {
        said: Mutex<Vec<(UtteranceId, String)>>,
    }

    impl RecordingSpeaker {
        fn last(&self) -> (UtteranceId, String) {
            self.said.lock().unwrap().last().cloned().unwrap()
        }

        fn count(&self) -> usize {
            self.said.lock().unwrap().len()
        }
    }

    impl Speaker for RecordingSpeaker {
        fn speak(&self, id: UtteranceId, text: &str, _priority: SpeechPriority) {
            self.said.lock().unwrap().push((id, text.to_string()));
        }

        fn stop(&self) {}
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runner_drives_flow_to_completion() {
        let speaker = Arc::new(RecordingSpeaker::default());
        let bus = EventBus::default();
        let mut sub = bus.subscribe();
        let (handle, task) = GuidedRunner::spawn(wifi_flow(), speaker.clone(), bus);
        settle().await;
        assert_eq!(speaker.last().1, "Let's turn on Wi-Fi.");

        // A completion for an older utterance is ignored.
        handle.speech_done(UtteranceId(99));
        settle().await;
        assert_eq!(speaker.count(), 1);

        handle.speech_done(speaker.last().0);
        settle().await;
        assert_eq!(speaker.last().1, "Open Settings.");
        handle.speech_done(speaker.last().0);
        settle().await;

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(speaker.last().1, "Tap the gear icon.");

        handle.screen(ScreenFacts::with_tags(["settings"]));
        settle().await;
        assert_eq!(speaker.last().1, "Now tap Wi-Fi.");
        handle.screen(ScreenFacts::with_tags(["wi-fi", "use wi-fi"]));
        handle.speech_done(speaker.last().0);

        assert_eq!(task.await.unwrap(), FlowOutcome::Completed);
        let finished = sub
            .drain()
            .into_iter()
            .find(|e| matches!(e, BusEvent::FlowFinished { .. }));
        assert_eq!(
            finished,
            Some(BusEvent::FlowFinished {
                flow: "wifi".to_string(),
                outcome: FlowOutcome::Completed
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handles_cancels() {
        let speaker = Arc::new(RecordingSpeaker::default());
        let (handle, task) = GuidedRunner::spawn(wifi_flow(), speaker, EventBus::default());
        drop(handle);
        assert_eq!(task.await.unwrap(), FlowOutcome::Cancelled);
    }
}
