use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::bus::{BusEvent, EventBus};
use crate::error::ExecError;
use crate::screen::{
    GlobalAction, LaunchableApp, NodePath, ScreenHost, ScreenNode, ScreenTree, SettingsPage,
};
use crate::selector;
use crate::types::{Action, ScrollDirection, Selector};

/// Spoken feedback the executor asks the conversation layer to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feedback {
    NotFound { target: String },
    GiveUp,
    NoScrollable,
    NoFocusedInput,
    NoActiveWindow,
    HostFailed,
}

impl Feedback {
    pub fn phrase(&self) -> String {
        match self {
            Feedback::NotFound { target } => format!("I don't see {target} on the screen yet."),
            Feedback::GiveUp => {
                "I still can't find it. Please tell me again in other words.".to_string()
            }
            Feedback::NoScrollable => "There is nothing to scroll here.".to_string(),
            Feedback::NoFocusedInput => "Please tap the text field first.".to_string(),
            Feedback::NoActiveWindow => "I can't see the screen right now.".to_string(),
            Feedback::HostFailed => "That didn't work on this screen.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strike {
    Warn(u32),
    GiveUp,
}

/// Consecutive misses on one selector key. A different key starts over.
#[derive(Debug)]
pub struct StrikeCounter {
    key: Option<String>,
    count: u32,
    limit: u32,
}

impl StrikeCounter {
    pub fn new(limit: u32) -> Self {
        Self {
            key: None,
            count: 0,
            limit: limit.max(1),
        }
    }

    pub fn record_miss(&mut self, key: &str) -> Strike {
        if self.key.as_deref() != Some(key) {
            self.key = Some(key.to_string());
            self.count = 0;
        }
        self.count += 1;
        if self.count >= self.limit {
            self.reset();
            return Strike::GiveUp;
        }
        Strike::Warn(self.count)
    }

    pub fn reset(&mut self) {
        self.key = None;
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Outcome of one executed action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecReport {
    pub result: Result<(), ExecError>,
    pub feedback: Option<Feedback>,
}

impl ExecReport {
    fn ok() -> Self {
        Self {
            result: Ok(()),
            feedback: None,
        }
    }

    fn failed(error: ExecError, feedback: Feedback) -> Self {
        Self {
            result: Err(error),
            feedback: Some(feedback),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Resolves selectors against the live tree and performs actions through the host.
pub struct ActionExecutor {
    host: Arc<dyn ScreenHost>,
    bus: EventBus,
    strikes: StrikeCounter,
    last_failed: bool,
}

impl ActionExecutor {
    pub fn new(host: Arc<dyn ScreenHost>, bus: EventBus, strike_limit: u32) -> Self {
        Self {
            host,
            bus,
            strikes: StrikeCounter::new(strike_limit),
            last_failed: false,
        }
    }

    pub fn execute(&mut self, action: &Action) -> ExecReport {
        debug!(?action, "executing action");
        let report = match action {
            Action::Click { selector } => self.click(selector),
            Action::Scroll { direction } => self.scroll(*direction),
            Action::Highlight { selector } => self.highlight(selector),
            Action::InputText { value } => self.input_text(value),
            Action::Back => self.global(GlobalAction::Back),
            Action::Home => self.global(GlobalAction::Home),
            Action::SetGoal { .. } | Action::StopTask => {
                warn!(?action, "task action reached the executor, ignored");
                return ExecReport::ok();
            }
        };
        if action.changes_screen() {
            self.bus.publish(BusEvent::ActionRequested {
                action: action.clone(),
            });
        }
        self.finish(report)
    }

    pub fn launch(&mut self, app: &LaunchableApp) -> ExecReport {
        info!(app = %app.label, "launching app");
        let report = match self.host.launch(app) {
            Ok(()) => ExecReport::ok(),
            Err(e) => ExecReport::failed(e, Feedback::HostFailed),
        };
        self.finish(report)
    }

    pub fn open_settings(&mut self, page: SettingsPage) -> ExecReport {
        info!(?page, "opening settings");
        let report = match self.host.open_settings(page) {
            Ok(()) => ExecReport::ok(),
            Err(e) => ExecReport::failed(e, Feedback::HostFailed),
        };
        self.finish(report)
    }

    /// Whether the most recent action failed. Read by the forced-capture path.
    pub fn last_action_failed(&self) -> bool {
        self.last_failed
    }

    pub fn reset_strikes(&mut self) {
        self.strikes.reset();
    }

    pub fn strike_count(&self) -> u32 {
        self.strikes.count()
    }

    fn finish(&mut self, report: ExecReport) -> ExecReport {
        self.last_failed = report.result.is_err();
        if let Err(e) = &report.result {
            warn!(error = %e, "action failed");
        }
        report
    }

    fn tree(&self) -> Result<ScreenTree, ExecReport> {
        self.host
            .root()
            .ok_or_else(|| ExecReport::failed(ExecError::NoActiveWindow, Feedback::NoActiveWindow))
    }

    fn click(&mut self, selector: &Selector) -> ExecReport {
        let tree = match self.tree() {
            Ok(tree) => tree,
            Err(report) => return report,
        };
        let Some(hit) = selector::resolve(&tree, selector) else {
            let key = selector.key();
            let feedback = match self.strikes.record_miss(&key) {
                Strike::GiveUp => {
                    info!(selector = %key, "giving up on selector");
                    Feedback::GiveUp
                }
                Strike::Warn(count) => {
                    debug!(selector = %key, count, "selector not found");
                    Feedback::NotFound {
                        target: selector.value.trim().to_string(),
                    }
                }
            };
            return ExecReport::failed(ExecError::ElementNotFound(selector.clone()), feedback);
        };
        self.strikes.reset();
        let path = clickable_ancestor(&tree, hit.path);
        debug!(%path, mode = ?hit.mode, "clicking");
        self.perform(self.host.click(&path))
    }

    fn highlight(&mut self, selector: &Selector) -> ExecReport {
        let tree = match self.tree() {
            Ok(tree) => tree,
            Err(report) => return report,
        };
        match selector::resolve(&tree, selector) {
            Some(hit) => {
                self.strikes.reset();
                self.bus.publish(BusEvent::HighlightRequested {
                    selector: selector.clone(),
                    bounds: hit.node.bounds,
                });
                ExecReport::ok()
            }
            None => ExecReport::failed(
                ExecError::ElementNotFound(selector.clone()),
                Feedback::NotFound {
                    target: selector.value.trim().to_string(),
                },
            ),
        }
    }

    fn scroll(&mut self, direction: ScrollDirection) -> ExecReport {
        let tree = match self.tree() {
            Ok(tree) => tree,
            Err(report) => return report,
        };
        let Some(path) = scroll_target(&tree, direction) else {
            return ExecReport::failed(ExecError::NoScrollableTarget, Feedback::NoScrollable);
        };
        self.strikes.reset();
        debug!(%path, ?direction, "scrolling");
        self.perform(self.host.scroll(&path, direction.is_forward()))
    }

    fn input_text(&mut self, text: &str) -> ExecReport {
        let tree = match self.tree() {
            Ok(tree) => tree,
            Err(report) => return report,
        };
        let Some((path, _)) = tree.focused_input() else {
            return ExecReport::failed(ExecError::NoFocusedInput, Feedback::NoFocusedInput);
        };
        self.strikes.reset();
        self.perform(self.host.set_text(&path, text))
    }

    fn global(&mut self, action: GlobalAction) -> ExecReport {
        self.perform(self.host.global(action))
    }

    fn perform(&self, result: Result<(), ExecError>) -> ExecReport {
        match result {
            Ok(()) => ExecReport::ok(),
            Err(e) => ExecReport::failed(e, Feedback::HostFailed),
        }
    }
}

/// Labels are often plain text inside a clickable row; click the row.
fn clickable_ancestor(tree: &ScreenTree, path: NodePath) -> NodePath {
    let mut cursor = Some(path.clone());
    while let Some(candidate) = cursor {
        if tree.node(&candidate).is_some_and(|n| n.clickable) {
            return candidate;
        }
        cursor = candidate.parent();
    }
    path
}

fn is_list_like(node: &ScreenNode) -> bool {
    let class = node.class_name.to_lowercase();
    !class.contains("pager")
        && ["list", "recycler", "scroll"]
            .iter()
            .any(|hint| class.contains(hint))
}

/// Vertical scrolls prefer list-like containers; otherwise any scrollable node.
fn scroll_target(tree: &ScreenTree, direction: ScrollDirection) -> Option<NodePath> {
    let scrollables: Vec<_> = tree
        .visible_nodes_bfs()
        .into_iter()
        .filter(|(_, node)| node.scrollable)
        .collect();
    if direction.is_vertical() {
        if let Some((path, _)) = scrollables.iter().find(|(_, node)| is_list_like(node)) {
            return Some(path.clone());
        }
    }
    scrollables.into_iter().next().map(|(path, _)| path)
}
