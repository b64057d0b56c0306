use screen_guide::prefs::Preferences;
use screen_guide::speech::{Listener, Speaker, SpeechPriority, UtteranceId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Milliseconds per character at speech rate 1.0.
const MS_PER_CHAR: f32 = 55.0;

/// Speaks into the log and reports completion after a reading-time delay.
pub struct ConsoleSpeaker {
    done: mpsc::UnboundedSender<UtteranceId>,
    prefs: Arc<dyn Preferences>,
}

impl ConsoleSpeaker {
    pub fn new(done: mpsc::UnboundedSender<UtteranceId>, prefs: Arc<dyn Preferences>) -> Self {
        Self { done, prefs }
    }
}

impl Speaker for ConsoleSpeaker {
    fn speak(&self, id: UtteranceId, text: &str, priority: SpeechPriority) {
        let language = self.prefs.language();
        info!(%id, lang = language.code(), ?priority, "🔊 {text}");
        let rate = self.prefs.speech_rate().max(0.1);
        let millis = (text.chars().count() as f32 * MS_PER_CHAR / rate) as u64;
        let done = self.done.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            let _ = done.send(id);
        });
    }

    fn stop(&self) {
        info!("🔇 speech stopped");
    }
}

/// The browser host has no microphone: the next text typed into the page is the answer.
pub struct PageListener;

impl Listener for PageListener {
    fn start_listening(&self) {
        info!("🎙️ listening, type the answer into the page");
    }

    fn cancel(&self) {
        info!("listening cancelled");
    }
}
