use anyhow::{Context, Result};
use screen_guide::bus::EventBus;
use screen_guide::guided::{
    FlowOutcome, FlowStep, GuidedFlow, GuidedHandle, GuidedRunner, MatchCondition, ScreenFacts,
};
use screen_guide::prefs::Preferences;
use screen_guide::screen::ScreenHost;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::hands::BrowserSession;
use crate::voice::ConsoleSpeaker;

const FACTS_POLL: Duration = Duration::from_secs(1);
const STEP_TIMEOUT: Duration = Duration::from_secs(20);

/// Leave the start page through any link, then come back to it.
pub fn shortcut_tour(home: &str) -> GuidedFlow {
    let at_home = MatchCondition::Extra {
        key: "package".to_string(),
        value: home.to_string(),
    };
    GuidedFlow {
        name: "shortcut_tour".to_string(),
        steps: vec![
            FlowStep::say("Let's practice opening a page. Your shortcuts are the links on this page."),
            FlowStep::say("Click any link now.")
                .until(MatchCondition::Not(Box::new(at_home.clone())))
                .timeout(STEP_TIMEOUT, Some("Click one of the links on the page.")),
            FlowStep::say("Now go back to where we started.")
                .until(at_home)
                .timeout(STEP_TIMEOUT, Some("Use the back arrow at the top of the browser.")),
            FlowStep::say("Well done. That is the whole tour."),
        ],
    }
}

/// At most one running tour, fed from the browser tab.
pub struct Tours {
    session: Arc<BrowserSession>,
    bus: EventBus,
    prefs: Arc<dyn Preferences>,
    current: Mutex<Option<GuidedHandle>>,
}

impl Tours {
    pub fn new(session: Arc<BrowserSession>, bus: EventBus, prefs: Arc<dyn Preferences>) -> Self {
        Self {
            session,
            bus,
            prefs,
            current: Mutex::new(None),
        }
    }

    /// Starts the tour from the page shown now, cancelling one already running.
    pub async fn start(&self) -> Result<()> {
        let session = self.session.clone();
        let home = tokio::task::spawn_blocking(move || session.root())
            .await
            .context("screen capture panicked")?
            .map(|tree| tree.package)
            .context("no page to start the tour from")?;

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let speaker = Arc::new(ConsoleSpeaker::new(done_tx, self.prefs.clone()));
        let (flow, outcome) =
            GuidedRunner::spawn(shortcut_tour(&home), speaker, self.bus.clone());
        if let Some(previous) = self.replace(Some(flow.clone())) {
            previous.cancel();
        }

        let completions = flow.clone();
        tokio::spawn(async move {
            while let Some(id) = done_rx.recv().await {
                completions.speech_done(id);
            }
        });
        tokio::spawn(feed_facts(self.session.clone(), flow, outcome));
        info!(%home, "tour started");
        Ok(())
    }

    /// False when no tour was running.
    pub fn cancel(&self) -> bool {
        match self.replace(None) {
            Some(flow) => {
                flow.cancel();
                true
            }
            None => false,
        }
    }

    fn replace(&self, next: Option<GuidedHandle>) -> Option<GuidedHandle> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, next)
    }
}

async fn feed_facts(
    session: Arc<BrowserSession>,
    flow: GuidedHandle,
    mut outcome: JoinHandle<FlowOutcome>,
) {
    let mut tick = tokio::time::interval(FACTS_POLL);
    loop {
        tokio::select! {
            finished = &mut outcome => {
                match finished {
                    Ok(outcome) => info!(?outcome, "tour ended"),
                    Err(e) => warn!(error = %e, "tour task failed"),
                }
                return;
            }
            _ = tick.tick() => {
                let session = session.clone();
                match tokio::task::spawn_blocking(move || session.root()).await {
                    Ok(Some(tree)) => flow.screen(ScreenFacts::from_tree(Some(&tree))),
                    // No facts rather than empty ones: an empty page is not "away from home".
                    Ok(None) => debug!("no page for the tour to look at"),
                    Err(e) => warn!(error = %e, "tour capture panicked"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use screen_guide::guided::{FlowCommand, FlowEvent, FlowState, GuidedMachine};

    const HOME: &str = "localhost:8080";

    fn at(package: &str) -> FlowEvent {
        FlowEvent::Screen(ScreenFacts::default().with_extra("package", package))
    }

    fn speak(text: &str) -> FlowCommand {
        FlowCommand::Speak(text.to_string())
    }

    #[test]
    fn tour_waits_to_leave_home_then_to_return() {
        let mut machine = GuidedMachine::new(shortcut_tour(HOME));
        machine.handle(FlowEvent::Start);
        machine.handle(at(HOME));
        assert_eq!(
            machine.handle(FlowEvent::SpeechFinished),
            vec![speak("Click any link now.")]
        );
        assert_eq!(
            machine.handle(FlowEvent::SpeechFinished),
            vec![FlowCommand::ArmTimer(STEP_TIMEOUT)]
        );
        assert_eq!(machine.state(), FlowState::WaitingMatch { step: 1 });

        assert!(machine.handle(at(HOME)).is_empty());
        assert_eq!(
            machine.handle(at("en.wikipedia.org")),
            vec![
                FlowCommand::CancelTimer,
                speak("Now go back to where we started.")
            ]
        );
        assert_eq!(
            machine.handle(FlowEvent::SpeechFinished),
            vec![FlowCommand::ArmTimer(STEP_TIMEOUT)]
        );
        assert_eq!(
            machine.handle(at(HOME)),
            vec![
                FlowCommand::CancelTimer,
                speak("Well done. That is the whole tour.")
            ]
        );
        assert_eq!(
            machine.handle(FlowEvent::SpeechFinished),
            vec![FlowCommand::Finished(FlowOutcome::Completed)]
        );
    }

    #[test]
    fn timeout_on_leaving_home_repeats_the_hint() {
        let mut machine = GuidedMachine::new(shortcut_tour(HOME));
        machine.handle(FlowEvent::Start);
        machine.handle(at(HOME));
        machine.handle(FlowEvent::SpeechFinished);
        machine.handle(FlowEvent::SpeechFinished);
        assert_eq!(
            machine.handle(FlowEvent::Timeout),
            vec![
                speak("Click one of the links on the page."),
                FlowCommand::ArmTimer(STEP_TIMEOUT)
            ]
        );
    }
}
