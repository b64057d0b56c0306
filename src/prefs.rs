use serde::{Deserialize, Serialize};
use std::sync::Mutex;

pub const MIN_SPEECH_RATE: f32 = 0.5;
pub const MAX_SPEECH_RATE: f32 = 2.0;
pub const SPEECH_RATE_STEP: f32 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Language {
    English,
    Spanish,
    German,
    French,
    Italian,
    Portuguese,
    Russian,
    Ukrainian,
}

impl Language {
    pub const ALL: [Language; 8] = [
        Language::English,
        Language::Spanish,
        Language::German,
        Language::French,
        Language::Italian,
        Language::Portuguese,
        Language::Russian,
        Language::Ukrainian,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Language::English => "en",
            Language::Spanish => "es",
            Language::German => "de",
            Language::French => "fr",
            Language::Italian => "it",
            Language::Portuguese => "pt",
            Language::Russian => "ru",
            Language::Ukrainian => "uk",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Language::English => "English",
            Language::Spanish => "Spanish",
            Language::German => "German",
            Language::French => "French",
            Language::Italian => "Italian",
            Language::Portuguese => "Portuguese",
            Language::Russian => "Russian",
            Language::Ukrainian => "Ukrainian",
        }
    }

    /// English and native names, lower case.
    pub fn spoken_names(self) -> &'static [&'static str] {
        match self {
            Language::English => &["english"],
            Language::Spanish => &["spanish", "español", "espanol"],
            Language::German => &["german", "deutsch"],
            Language::French => &["french", "français", "francais"],
            Language::Italian => &["italian", "italiano"],
            Language::Portuguese => &["portuguese", "português", "portugues"],
            Language::Russian => &["russian", "русский"],
            Language::Ukrainian => &["ukrainian", "українська"],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedChange {
    Faster,
    Slower,
}

impl SpeedChange {
    /// New rate after one step, clamped to the supported range.
    pub fn apply(self, rate: f32) -> f32 {
        let next = match self {
            SpeedChange::Faster => rate + SPEECH_RATE_STEP,
            SpeedChange::Slower => rate - SPEECH_RATE_STEP,
        };
        next.clamp(MIN_SPEECH_RATE, MAX_SPEECH_RATE)
    }
}

/// User preferences that outlive a session. Storage is the host's concern.
pub trait Preferences: Send + Sync {
    fn user_name(&self) -> Option<String>;
    fn set_user_name(&self, name: &str);
    fn language(&self) -> Language;
    fn set_language(&self, language: Language);
    fn speech_rate(&self) -> f32;
    fn set_speech_rate(&self, rate: f32);
}

#[derive(Debug)]
struct PrefValues {
    user_name: Option<String>,
    language: Language,
    speech_rate: f32,
}

/// Process-lifetime preferences.
#[derive(Debug)]
pub struct InMemoryPreferences {
    values: Mutex<PrefValues>,
}

impl Default for InMemoryPreferences {
    fn default() -> Self {
        Self {
            values: Mutex::new(PrefValues {
                user_name: None,
                language: Language::English,
                speech_rate: 1.0,
            }),
        }
    }
}

impl InMemoryPreferences {
    fn with<R>(&self, f: impl FnOnce(&mut PrefValues) -> R) -> R {
        let mut values = self
            .values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut values)
    }
}

impl Preferences for InMemoryPreferences {
    fn user_name(&self) -> Option<String> {
        self.with(|v| v.user_name.clone())
    }

    fn set_user_name(&self, name: &str) {
        self.with(|v| v.user_name = Some(name.to_string()));
    }

    fn language(&self) -> Language {
        self.with(|v| v.language)
    }

    fn set_language(&self, language: Language) {
        self.with(|v| v.language = language);
    }

    fn speech_rate(&self) -> f32 {
        self.with(|v| v.speech_rate)
    }

    fn set_speech_rate(&self, rate: f32) {
        self.with(|v| v.speech_rate = rate.clamp(MIN_SPEECH_RATE, MAX_SPEECH_RATE));
    }
}
