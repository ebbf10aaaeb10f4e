//! Auto-answer schemes and assistant profiles.
//!
//! Both are read-only configuration consumed through the
//! [`SchemeResolver`] and [`AssistantResolver`] seams. [`StaticDirectory`]
//! serves them from the loaded config file.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What the handler does once a call is answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerMode {
    /// Live turn-taking with the assistant.
    #[default]
    Conversation,
    /// Voicemail capture: optional prompt, then record until hangup.
    Message,
}

/// Rule deciding whether a called number is answered by the assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoAnswerScheme {
    pub id: String,
    /// Called-party identifier (Request-URI / To user part).
    pub called_number: String,
    pub enabled: bool,
    /// Operational switch, e.g. toggled by business hours.
    pub active: bool,
    /// When set, `auto_answer` must also be set for the scheme to match.
    pub require_auto_answer: bool,
    pub auto_answer: bool,
    /// Ring time before answering.
    pub answer_delay_ms: u64,
    pub assistant_id: Option<String>,
    pub mode: HandlerMode,
    /// Record conversation-mode calls. Message mode always records.
    pub record: bool,
    /// Spoken before recording in message mode.
    pub voicemail_prompt: Option<String>,
}

impl Default for AutoAnswerScheme {
    fn default() -> Self {
        Self {
            id: String::new(),
            called_number: String::new(),
            enabled: true,
            active: true,
            require_auto_answer: false,
            auto_answer: true,
            answer_delay_ms: 0,
            assistant_id: None,
            mode: HandlerMode::default(),
            record: true,
            voicemail_prompt: None,
        }
    }
}

impl AutoAnswerScheme {
    /// Whether calls to this scheme are answered by the assistant.
    pub fn triggers_auto_answer(&self) -> bool {
        self.enabled
            && self.active
            && self.assistant_id.is_some()
            && (!self.require_auto_answer || self.auto_answer)
    }
}

/// Assistant persona used for a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantProfile {
    pub id: String,
    pub name: String,
    /// Language of the conversation, e.g. `en`.
    pub language: String,
    /// Initial synthesis voice; the registry default for `language` when unset.
    pub voice_id: Option<String>,
    pub temperature: f32,
    pub system_prompt: String,
    /// Reply token budget.
    pub max_tokens: u32,
    /// Spoken when the call starts in conversation mode.
    pub greeting: Option<String>,
}

impl Default for AssistantProfile {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            language: "en".to_owned(),
            voice_id: None,
            temperature: 0.7,
            system_prompt: "You are a helpful voice assistant on a phone call. \
                            Keep replies short and conversational."
                .to_owned(),
            max_tokens: 256,
            greeting: None,
        }
    }
}

/// Looks up the scheme for a called number.
pub trait SchemeResolver: Send + Sync {
    fn scheme_for(&self, called_number: &str) -> Option<AutoAnswerScheme>;
}

/// Looks up assistant profiles by id.
pub trait AssistantResolver: Send + Sync {
    fn assistant(&self, id: &str) -> Option<AssistantProfile>;
}

/// The first scheme for `called_number` that triggers auto-answer.
pub fn match_scheme(resolver: &dyn SchemeResolver, called_number: &str) -> Option<AutoAnswerScheme> {
    resolver
        .scheme_for(called_number)
        .filter(AutoAnswerScheme::triggers_auto_answer)
}

/// In-memory directory built from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    schemes: HashMap<String, Vec<AutoAnswerScheme>>,
    assistants: HashMap<String, AssistantProfile>,
}

impl StaticDirectory {
    pub fn new(schemes: Vec<AutoAnswerScheme>, assistants: Vec<AssistantProfile>) -> Self {
        let mut by_number: HashMap<String, Vec<AutoAnswerScheme>> = HashMap::new();
        for scheme in schemes {
            by_number
                .entry(scheme.called_number.clone())
                .or_default()
                .push(scheme);
        }
        Self {
            schemes: by_number,
            assistants: assistants.into_iter().map(|a| (a.id.clone(), a)).collect(),
        }
    }
}

impl SchemeResolver for StaticDirectory {
    /// Prefers a scheme that triggers auto-answer when several share a number.
    fn scheme_for(&self, called_number: &str) -> Option<AutoAnswerScheme> {
        let candidates = self.schemes.get(called_number)?;
        candidates
            .iter()
            .find(|s| s.triggers_auto_answer())
            .or_else(|| candidates.first())
            .cloned()
    }
}

impl AssistantResolver for StaticDirectory {
    fn assistant(&self, id: &str) -> Option<AssistantProfile> {
        self.assistants.get(id).cloned()
    }
}
