//! Local command grammar: utterances handled on-device without the planner.

use crate::prefs::{Language, SpeedChange};
use crate::screen::SettingsPage;
use crate::types::{HYPOTHESIS_DELIMITER, ScrollDirection};

#[derive(Debug, Clone, PartialEq)]
pub enum LocalCommand {
    Unknown,
    Stop,
    Back,
    Home,
    Scroll(ScrollDirection),
    LaunchApp(String),
    OpenSettings(SettingsPage),
    /// The assistant's own settings menu.
    AssistantSettings,
    ChangeName(Option<String>),
    ChangeLanguage(Option<Language>),
    ChangeSpeed(Option<SpeedChange>),
}

impl LocalCommand {
    pub fn is_known(&self) -> bool {
        !matches!(self, LocalCommand::Unknown)
    }
}

/// Ranked hypotheses from one recognition result, trimmed, blanks dropped.
pub fn split_hypotheses(text: &str) -> Vec<String> {
    text.split(HYPOTHESIS_DELIMITER)
        .map(str::trim)
        .filter(|h| !normalize(h).is_empty())
        .map(str::to_string)
        .collect()
}

/// Lower case, punctuation stripped, whitespace collapsed.
pub fn normalize(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '\'' || c == '-' {
                c
            } else {
                ' '
            }
        })
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

const STOP_PHRASES: &[&str] = &["stop", "cancel", "never mind", "nevermind", "stop task"];
const LAUNCH_VERBS: &[&str] = &["open", "launch", "start", "run"];
const NAME_PREFIXES: &[&str] = &["call me", "my name is", "change my name to", "rename me to"];

pub fn parse(text: &str) -> LocalCommand {
    let text = normalize(text);
    if text.is_empty() {
        return LocalCommand::Unknown;
    }
    if STOP_PHRASES.contains(&text.as_str()) {
        return LocalCommand::Stop;
    }
    if matches!(text.as_str(), "back" | "go back") {
        return LocalCommand::Back;
    }
    if matches!(text.as_str(), "home" | "go home" | "home screen" | "go to home screen") {
        return LocalCommand::Home;
    }
    if let Some(direction) = parse_scroll(&text) {
        return LocalCommand::Scroll(direction);
    }
    if let Some(name) = strip_any_prefix(&text, NAME_PREFIXES) {
        return LocalCommand::ChangeName(Some(name.to_string()));
    }
    if has_words(&text, &["change", "name"]) || text == "rename me" {
        return LocalCommand::ChangeName(None);
    }
    if text.contains("language") || text.starts_with("speak ") || text.starts_with("switch to ") {
        if let Some(language) = detect_language(&text) {
            return LocalCommand::ChangeLanguage(Some(language));
        }
        if text.contains("language") {
            return LocalCommand::ChangeLanguage(None);
        }
    }
    if let Some(change) = detect_speed(&text) {
        if is_about_speech(&text) {
            return LocalCommand::ChangeSpeed(Some(change));
        }
    }
    if (text.contains("speed") || text.contains("rate")) && is_about_speech(&text) {
        return LocalCommand::ChangeSpeed(None);
    }
    if matches!(
        text.as_str(),
        "settings" | "assistant settings" | "your settings" | "preferences" | "change settings"
    ) {
        return LocalCommand::AssistantSettings;
    }
    if let Some(page) = settings_page(&text) {
        return LocalCommand::OpenSettings(page);
    }
    if let Some(app) = strip_any_prefix(&text, LAUNCH_VERBS) {
        let app = app.strip_prefix("the ").unwrap_or(app);
        let app = app.strip_suffix(" app").unwrap_or(app);
        if !app.is_empty() {
            return LocalCommand::LaunchApp(app.to_string());
        }
    }
    LocalCommand::Unknown
}

fn parse_scroll(text: &str) -> Option<ScrollDirection> {
    let verb = ["scroll", "swipe", "page"]
        .iter()
        .any(|v| text == *v || text.starts_with(&format!("{v} ")));
    if !verb {
        return None;
    }
    let words: Vec<&str> = text.split(' ').collect();
    let direction = if words.contains(&"up") {
        ScrollDirection::Up
    } else if words.contains(&"left") {
        ScrollDirection::Left
    } else if words.contains(&"right") {
        ScrollDirection::Right
    } else {
        ScrollDirection::Down
    };
    Some(direction)
}

/// Explicit system-settings shortcuts ("wifi settings", "open bluetooth", ...).
fn settings_page(text: &str) -> Option<SettingsPage> {
    let page = if text.contains("wifi") || text.contains("wi-fi") {
        SettingsPage::Wifi
    } else if text.contains("bluetooth") {
        SettingsPage::Bluetooth
    } else if text.contains("brightness") || text.contains("display") {
        SettingsPage::Display
    } else if text.contains("volume") || text.contains("sound") || text.contains("ringtone") {
        SettingsPage::Sound
    } else if text == "open settings" || text == "phone settings" || text == "system settings" {
        return Some(SettingsPage::Main);
    } else {
        return None;
    };
    let intent = ["settings", "open", "turn", "change", "enable", "disable", "switch"]
        .iter()
        .any(|w| text.split(' ').any(|t| t == *w));
    intent.then_some(page)
}

/// Language named anywhere in the text.
pub fn detect_language(text: &str) -> Option<Language> {
    let text = normalize(text);
    let words: Vec<&str> = text.split(' ').collect();
    Language::ALL
        .into_iter()
        .find(|lang| lang.spoken_names().iter().any(|name| words.contains(name)))
}

/// Explicit faster/slower wording.
pub fn detect_speed(text: &str) -> Option<SpeedChange> {
    let text = normalize(text);
    const FASTER: &[&str] = &["faster", "quicker", "speed up", "more quickly"];
    const SLOWER: &[&str] = &["slower", "slow down", "more slowly"];
    if SLOWER.iter().any(|p| text.contains(p)) {
        Some(SpeedChange::Slower)
    } else if FASTER.iter().any(|p| text.contains(p)) {
        Some(SpeedChange::Faster)
    } else {
        None
    }
}

/// Name given in a reply to "what should I call you".
pub fn extract_name(text: &str) -> Option<String> {
    let text = normalize(text);
    let name = strip_any_prefix(&text, NAME_PREFIXES).unwrap_or(&text);
    let name = name.strip_prefix("it's ").unwrap_or(name);
    let name = name.trim();
    if name.is_empty() || name.split(' ').count() > 3 {
        return None;
    }
    Some(
        name.split(' ')
            .map(capitalize)
            .collect::<Vec<_>>()
            .join(" "),
    )
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn is_about_speech(text: &str) -> bool {
    ["speak", "talk", "speech", "voice", "say", "read"]
        .iter()
        .any(|w| text.contains(w))
}

fn has_words(text: &str, words: &[&str]) -> bool {
    let tokens: Vec<&str> = text.split(' ').collect();
    words.iter().all(|w| tokens.contains(w))
}

fn strip_any_prefix<'a>(text: &'a str, prefixes: &[&str]) -> Option<&'a str> {
    prefixes.iter().find_map(|p| {
        text.strip_prefix(p)
            .and_then(|rest| rest.strip_prefix(' '))
            .map(str::trim)
            .filter(|rest| !rest.is_empty())
    })
}
