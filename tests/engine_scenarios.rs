use async_trait::async_trait;
use screen_guide::bus::{BusEvent, BusSubscription, EventBus};
use screen_guide::config::EngineTimings;
use screen_guide::conversation::phrases;
use screen_guide::engine::{Collaborators, CommandMessage, Engine, EngineHandle};
use screen_guide::error::{ExecError, PlannerError};
use screen_guide::executor::Feedback;
use screen_guide::planner::{Planner, PlannerRequest, PlannerResponse};
use screen_guide::prefs::InMemoryPreferences;
use screen_guide::screen::{
    Bounds, GlobalAction, LaunchableApp, NodePath, ScreenHost, ScreenNode, ScreenTree,
    SettingsPage,
};
use screen_guide::speech::{Listener, Speaker, SpeechPriority, UtteranceId};
use screen_guide::status::ClockStatus;
use screen_guide::types::{Action, FOLLOW_UP_SENTINEL, ScrollDirection, Selector, TaskState};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn node(text: &str) -> ScreenNode {
    ScreenNode {
        text: Some(text.to_string()),
        class_name: "android.widget.TextView".to_string(),
        bounds: Bounds {
            left: 0,
            top: 0,
            right: 200,
            bottom: 48,
        },
        visible: true,
        clickable: true,
        ..Default::default()
    }
}

fn screen(texts: &[&str]) -> ScreenTree {
    ScreenTree {
        package: "com.example.launcher".to_string(),
        root: ScreenNode {
            class_name: "android.widget.FrameLayout".to_string(),
            visible: true,
            children: vec![ScreenNode {
                class_name: "androidx.recyclerview.widget.RecyclerView".to_string(),
                visible: true,
                scrollable: true,
                children: texts.iter().map(|t| node(t)).collect(),
                ..Default::default()
            }],
            ..Default::default()
        },
    }
}

#[derive(Default)]
struct FakeHost {
    tree: Mutex<Option<ScreenTree>>,
    ops: Mutex<Vec<String>>,
    reads: Mutex<usize>,
}

impl FakeHost {
    fn showing(texts: &[&str]) -> Arc<Self> {
        let host = Self::default();
        *host.tree.lock().unwrap() = Some(screen(texts));
        Arc::new(host)
    }

    fn show(&self, texts: &[&str]) {
        *self.tree.lock().unwrap() = Some(screen(texts));
    }

    fn reads(&self) -> usize {
        *self.reads.lock().unwrap()
    }

    fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    fn record(&self, op: String) -> Result<(), ExecError> {
        self.ops.lock().unwrap().push(op);
        Ok(())
    }
}

impl ScreenHost for FakeHost {
    fn root(&self) -> Option<ScreenTree> {
        *self.reads.lock().unwrap() += 1;
        self.tree.lock().unwrap().clone()
    }

    fn click(&self, path: &NodePath) -> Result<(), ExecError> {
        self.record(format!("click {path}"))
    }

    fn scroll(&self, path: &NodePath, forward: bool) -> Result<(), ExecError> {
        self.record(format!("scroll {path} forward={forward}"))
    }

    fn set_text(&self, path: &NodePath, text: &str) -> Result<(), ExecError> {
        self.record(format!("set_text {path} {text}"))
    }

    fn global(&self, action: GlobalAction) -> Result<(), ExecError> {
        self.record(format!("global {action:?}"))
    }

    fn launchable_apps(&self) -> Vec<LaunchableApp> {
        vec![LaunchableApp {
            label: "Maps".to_string(),
            id: "com.example.maps".to_string(),
        }]
    }

    fn launch(&self, app: &LaunchableApp) -> Result<(), ExecError> {
        self.record(format!("launch {}", app.id))
    }

    fn open_settings(&self, page: SettingsPage) -> Result<(), ExecError> {
        self.record(format!("settings {page:?}"))
    }
}

#[derive(Default)]
struct FakeVoice {
    said: Mutex<Vec<(UtteranceId, String)>>,
    listens: Mutex<u32>,
}

impl FakeVoice {
    fn said(&self) -> Vec<String> {
        self.said.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }

    fn last(&self) -> String {
        self.said().last().cloned().unwrap_or_default()
    }

    /// Id of the most recent utterance with this text.
    fn id_of(&self, text: &str) -> UtteranceId {
        self.said
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(_, t)| t == text)
            .map(|(id, _)| *id)
            .expect("utterance was spoken")
    }
}

impl Speaker for FakeVoice {
    fn speak(&self, id: UtteranceId, text: &str, _priority: SpeechPriority) {
        self.said.lock().unwrap().push((id, text.to_string()));
    }

    fn stop(&self) {}
}

impl Listener for FakeVoice {
    fn start_listening(&self) {
        *self.listens.lock().unwrap() += 1;
    }

    fn cancel(&self) {}
}

/// Replies from a script, then silence.
#[derive(Default)]
struct ScriptedPlanner {
    script: Mutex<VecDeque<PlannerResponse>>,
    requests: Mutex<Vec<PlannerRequest>>,
}

impl ScriptedPlanner {
    fn reply(&self, text: &str, actions: Vec<Action>) {
        self.script.lock().unwrap().push_back(PlannerResponse {
            reply_text: Some(text.to_string()),
            actions,
        });
    }

    /// Actions with nothing to say.
    fn act(&self, actions: Vec<Action>) {
        self.script.lock().unwrap().push_back(PlannerResponse {
            reply_text: None,
            actions,
        });
    }

    fn requests(&self) -> Vec<PlannerRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, request: PlannerRequest) -> Result<PlannerResponse, PlannerError> {
        self.requests.lock().unwrap().push(request);
        Ok(self.script.lock().unwrap().pop_front().unwrap_or_default())
    }
}

struct Harness {
    host: Arc<FakeHost>,
    voice: Arc<FakeVoice>,
    planner: Arc<ScriptedPlanner>,
    engine: EngineHandle,
    events: BusSubscription,
}

impl Harness {
    fn start(host: Arc<FakeHost>) -> Self {
        let voice = Arc::new(FakeVoice::default());
        let planner = Arc::new(ScriptedPlanner::default());
        let bus = EventBus::default();
        let events = bus.subscribe();
        let parts = Collaborators {
            host: host.clone(),
            speaker: voice.clone(),
            listener: voice.clone(),
            planner: planner.clone(),
            status: Arc::new(ClockStatus {
                locale: "en-US".to_string(),
            }),
            prefs: Arc::new(InMemoryPreferences::default()),
        };
        let (engine, _task) = Engine::spawn(EngineTimings::default(), parts, bus);
        Self {
            host,
            voice,
            planner,
            engine,
            events,
        }
    }

    async fn finish_speaking(&self, text: &str) {
        self.engine.speech_done(self.voice.id_of(text));
        settle().await;
    }

    /// A screen change followed by the debounce delay.
    async fn screen_changes_to(&self, texts: &[&str]) {
        self.host.show(texts);
        self.engine.screen_mutated();
        settle().await;
        tokio::time::advance(Duration::from_millis(600)).await;
        settle().await;
    }

    fn last_task(&mut self) -> Option<TaskState> {
        self.events
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                BusEvent::TaskChanged { task } => Some(task),
                _ => None,
            })
            .last()
    }
}

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn scroll_down_runs_locally_and_forces_a_capture() {
    let mut h = Harness::start(FakeHost::showing(&["Phone", "Messages"]));

    h.engine.recognized("scroll down");
    settle().await;

    assert_eq!(h.host.ops(), vec!["scroll /0 forward=true".to_string()]);
    assert!(h.planner.requests().is_empty());
    let events = h.events.drain();
    assert!(events.contains(&BusEvent::ActionRequested {
        action: Action::Scroll {
            direction: ScrollDirection::Down
        }
    }));

    let reads = h.host.reads();
    tokio::time::advance(Duration::from_secs(2)).await;
    settle().await;
    assert_eq!(h.host.reads(), reads + 1);
    assert!(h.planner.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn silent_planner_speaks_fallback_and_frees_the_turn() {
    let mut h = Harness::start(FakeHost::showing(&["Phone"]));

    h.engine.recognized("what is this button");
    settle().await;

    assert_eq!(h.planner.requests().len(), 1);
    assert_eq!(h.voice.last(), phrases::PLANNER_SILENT);
    assert!(h.events.drain().contains(&BusEvent::TurnReady));

    h.engine.recognized("and this one");
    settle().await;
    assert_eq!(h.planner.requests().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn open_window_forwards_screen_change_as_follow_up() {
    let h = Harness::start(FakeHost::showing(&["Phone", "Messages"]));
    h.planner.reply(
        "Tap Phone.",
        vec![Action::SetGoal {
            value: "call mom".to_string(),
        }],
    );

    h.engine.submit_command(CommandMessage {
        text: "I want to call my mom".to_string(),
        screen_context: Some("package: com.example.launcher\nPhone\n".to_string()),
    });
    settle().await;
    let requests = h.planner.requests();
    let first = &requests[0];
    assert_eq!(first.screen_context, "package: com.example.launcher\nPhone\n");
    assert_eq!(first.task_state, TaskState::default());

    h.finish_speaking("Tap Phone.").await;
    h.screen_changes_to(&["Contacts", "Keypad"]).await;

    let requests = h.planner.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].user_text, FOLLOW_UP_SENTINEL);
    assert_eq!(requests[1].session_id, requests[0].session_id);
    assert_eq!(requests[1].task_state.goal, "call mom");
    assert_eq!(requests[1].task_state.step, 1);
    assert!(requests[1].screen_context.contains("Keypad"));
}

#[tokio::test(start_paused = true)]
async fn screen_change_after_expiry_is_ignored() {
    let h = Harness::start(FakeHost::showing(&["Phone"]));
    h.planner.reply("Tap Phone.", vec![]);

    h.engine.recognized("how do I call someone");
    settle().await;
    h.finish_speaking("Tap Phone.").await;

    tokio::time::advance(Duration::from_secs(61)).await;
    settle().await;
    h.screen_changes_to(&["Contacts"]).await;

    assert_eq!(h.planner.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn background_churn_without_window_is_ignored() {
    let h = Harness::start(FakeHost::showing(&["Phone"]));
    h.screen_changes_to(&["Clock 10:01"]).await;
    h.screen_changes_to(&["Clock 10:02"]).await;
    assert!(h.planner.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn runaway_task_trips_the_fuse() {
    let mut h = Harness::start(FakeHost::showing(&["Phone"]));
    h.planner.reply(
        "Open Phone.",
        vec![Action::SetGoal {
            value: "call mom".to_string(),
        }],
    );
    for _ in 0..5 {
        h.planner.reply("Keep going.", vec![]);
    }

    h.engine.recognized("help me call mom");
    settle().await;
    h.finish_speaking("Open Phone.").await;

    for step in 1..=5u32 {
        let label = format!("Screen {step}");
        h.screen_changes_to(&["Phone", label.as_str()]).await;
        let requests = h.planner.requests();
        assert_eq!(requests.len() as u32, 1 + step);
        assert_eq!(requests.last().unwrap().task_state.step, step);
        h.finish_speaking("Keep going.").await;
    }

    h.screen_changes_to(&["Phone", "Screen 6"]).await;
    assert_eq!(h.planner.requests().len(), 6);
    assert_eq!(h.voice.last(), phrases::TASK_ABANDONED);
    assert_eq!(h.last_task(), Some(TaskState::default()));
    assert!(h.planner.requests().iter().all(|r| r.task_state.step <= 5));
}

#[tokio::test(start_paused = true)]
async fn repeated_misses_on_one_selector_give_up_once() {
    let h = Harness::start(FakeHost::showing(&["Phone", "Contacts"]));
    let ghost = || Action::Click {
        selector: Selector::text("Ghost"),
    };
    h.planner.reply(
        "Tap Ghost.",
        vec![
            Action::SetGoal {
                value: "find the ghost".to_string(),
            },
            ghost(),
        ],
    );
    h.planner.reply("Tap Ghost.", vec![ghost()]);
    h.planner.reply("Tap Ghost.", vec![ghost()]);

    h.engine.recognized("where is the ghost");
    settle().await;
    h.finish_speaking("Tap Ghost.").await;
    h.screen_changes_to(&["Phone", "Contacts", "Recents"]).await;
    h.finish_speaking("Tap Ghost.").await;
    h.screen_changes_to(&["Phone", "Favorites"]).await;

    assert_eq!(h.planner.requests().len(), 3);
    let not_found = Feedback::NotFound {
        target: "Ghost".to_string(),
    }
    .phrase();
    let give_up = Feedback::GiveUp.phrase();
    let said = h.voice.said();
    assert_eq!(said.iter().filter(|t| **t == not_found).count(), 2);
    assert_eq!(said.iter().filter(|t| **t == give_up).count(), 1);
    assert!(h.host.ops().is_empty());
}

#[tokio::test(start_paused = true)]
async fn launch_with_trailing_request_seeds_the_task() {
    let mut h = Harness::start(FakeHost::showing(&["Phone"]));

    h.engine.recognized("open maps and find a pharmacy");
    settle().await;

    assert_eq!(h.host.ops(), vec!["launch com.example.maps".to_string()]);
    assert!(h.planner.requests().is_empty());
    let task = h.last_task().expect("task published");
    assert_eq!(task.goal, "find a pharmacy");
    assert_eq!(task.step, 0);

    h.finish_speaking("Opening Maps.").await;
    h.screen_changes_to(&["Search here"]).await;
    let requests = h.planner.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].user_text, FOLLOW_UP_SENTINEL);
    assert_eq!(requests[0].task_state.goal, "find a pharmacy");
}

#[tokio::test(start_paused = true)]
async fn button_press_greets_and_listens() {
    let h = Harness::start(FakeHost::showing(&["Phone"]));

    h.engine.submit_command(CommandMessage::default());
    settle().await;
    assert_eq!(h.voice.last(), "How can I help?");
    assert_eq!(*h.voice.listens.lock().unwrap(), 0);

    h.finish_speaking("How can I help?").await;
    assert_eq!(*h.voice.listens.lock().unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn follow_up_sentinel_over_ipc_calls_planner() {
    let h = Harness::start(FakeHost::showing(&["Phone"]));

    h.engine.submit_command(CommandMessage {
        text: FOLLOW_UP_SENTINEL.to_string(),
        screen_context: None,
    });
    settle().await;

    let requests = h.planner.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].user_text, FOLLOW_UP_SENTINEL);
    assert!(requests[0].screen_context.contains("Phone"));
}

#[tokio::test(start_paused = true)]
async fn click_during_long_instruction_is_captured_once_speech_ends() {
    let h = Harness::start(FakeHost::showing(&["Phone", "Contacts"]));
    h.planner.reply(
        "Tap Phone, then wait for the keypad to show up on the screen.",
        vec![
            Action::SetGoal {
                value: "call mom".to_string(),
            },
            Action::Click {
                selector: Selector::text("Phone"),
            },
        ],
    );

    h.engine.recognized("I want to call my mom");
    settle().await;
    assert_eq!(h.host.ops(), vec!["click /0/0".to_string()]);

    // The click lands while the instruction is still playing.
    h.host.show(&["Keypad", "Recents"]);
    h.engine.screen_mutated();
    settle().await;
    tokio::time::advance(Duration::from_millis(600)).await;
    settle().await;
    tokio::time::advance(Duration::from_secs(2)).await;
    settle().await;
    assert_eq!(h.planner.requests().len(), 1);

    h.finish_speaking("Tap Phone, then wait for the keypad to show up on the screen.")
        .await;
    tokio::time::advance(Duration::from_millis(2100)).await;
    settle().await;

    let requests = h.planner.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].user_text, FOLLOW_UP_SENTINEL);
    assert_eq!(requests[1].task_state.goal, "call mom");
    assert!(requests[1].screen_context.contains("Keypad"));
}

#[tokio::test(start_paused = true)]
async fn failed_click_does_not_resend_an_unchanged_screen() {
    let h = Harness::start(FakeHost::showing(&["Phone"]));
    h.planner.reply(
        "Tap Phone.",
        vec![Action::SetGoal {
            value: "call mom".to_string(),
        }],
    );
    h.planner.act(vec![Action::Click {
        selector: Selector::text("Ghost"),
    }]);

    h.engine.recognized("help me call mom");
    settle().await;
    h.finish_speaking("Tap Phone.").await;
    h.screen_changes_to(&["Contacts"]).await;
    assert_eq!(h.planner.requests().len(), 2);
    assert!(h.host.ops().is_empty());

    // Same screen again: the missed click changed nothing, so nothing is resent.
    h.screen_changes_to(&["Contacts"]).await;
    tokio::time::advance(Duration::from_secs(2)).await;
    settle().await;
    assert_eq!(h.planner.requests().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn new_utterance_cancels_pending_capture() {
    let h = Harness::start(FakeHost::showing(&["Phone"]));

    h.engine.screen_mutated();
    settle().await;
    h.engine.recognized("stop");
    settle().await;
    assert_eq!(h.voice.last(), phrases::TASK_STOPPED);

    let reads = h.host.reads();
    tokio::time::advance(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(h.host.reads(), reads);
}
