use super::{VoiceProfile, VoiceRegistry};
use std::sync::Arc;

/// Tracks the active voice for one call and proposes switches.
#[derive(Debug, Clone)]
pub struct SpeakerSelector {
    registry: Arc<VoiceRegistry>,
    active: String,
}

impl SpeakerSelector {
    pub fn new(registry: Arc<VoiceRegistry>, initial_voice: impl Into<String>) -> Self {
        Self {
            registry,
            active: initial_voice.into(),
        }
    }

    pub fn active_id(&self) -> &str {
        &self.active
    }

    pub fn active_profile(&self) -> Option<&VoiceProfile> {
        self.registry.get(&self.active)
    }

    /// Returns the new profile when `transcript` names a voice other than
    /// the active one, and makes it active.
    pub fn select(&mut self, transcript: &str) -> Option<VoiceProfile> {
        let candidate = self.registry.find_by_keywords(transcript)?;
        if candidate.id == self.active {
            return None;
        }
        self.active = candidate.id.clone();
        Some(candidate.clone())
    }
}
