//! Synthesis voice registry.
//!
//! Profiles are loaded once at startup, either from the built-in table or a
//! TOML file, and indexed by id, language, dialect and keyword.

mod selector;

pub use selector::SpeakerSelector;

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Speaker gender.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    #[default]
    Female,
    Male,
    Neutral,
}

/// Speaker age group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeGroup {
    Child,
    Young,
    #[default]
    Adult,
    Senior,
}

/// A synthesis voice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceProfile {
    /// Provider voice id, passed through to the synthesizer.
    pub id: String,
    pub name: String,
    /// BCP-47 primary language subtag, e.g. `en`, `zh`.
    pub language: String,
    /// Regional or dialect tag, e.g. `us`, `sichuan`.
    #[serde(default)]
    pub dialect: Option<String>,
    #[serde(default)]
    pub gender: Gender,
    #[serde(default)]
    pub age: AgeGroup,
    /// Cues that select this voice when spoken by the caller.
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct VoiceFile {
    #[serde(default)]
    voices: Vec<VoiceProfile>,
}

/// Read-only voice registry.
#[derive(Debug, Clone)]
pub struct VoiceRegistry {
    profiles: Vec<VoiceProfile>,
    by_id: HashMap<String, usize>,
    by_language: HashMap<String, Vec<usize>>,
    by_dialect: HashMap<String, Vec<usize>>,
    by_keyword: HashMap<String, Vec<usize>>,
    /// Distinct lower-cased keywords in profile order.
    keyword_order: Vec<String>,
}

impl VoiceRegistry {
    /// Build a registry and its indexes.
    ///
    /// # Errors
    ///
    /// Returns a config error for empty or duplicate ids.
    pub fn new(profiles: Vec<VoiceProfile>) -> Result<Self> {
        let mut by_id = HashMap::new();
        let mut by_language: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_dialect: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_keyword: HashMap<String, Vec<usize>> = HashMap::new();
        let mut keyword_order = Vec::new();

        for (idx, profile) in profiles.iter().enumerate() {
            if profile.id.is_empty() {
                return Err(BridgeError::Config("voice profile with empty id".into()));
            }
            if by_id.insert(profile.id.clone(), idx).is_some() {
                return Err(BridgeError::Config(format!(
                    "duplicate voice id {}",
                    profile.id
                )));
            }
            by_language
                .entry(profile.language.to_lowercase())
                .or_default()
                .push(idx);
            if let Some(dialect) = &profile.dialect {
                by_dialect.entry(dialect.to_lowercase()).or_default().push(idx);
            }
            for keyword in &profile.keywords {
                let key = keyword.trim().to_lowercase();
                if key.is_empty() {
                    continue;
                }
                let entry = by_keyword.entry(key.clone()).or_default();
                if entry.is_empty() {
                    keyword_order.push(key);
                }
                entry.push(idx);
            }
        }

        Ok(Self {
            profiles,
            by_id,
            by_language,
            by_dialect,
            by_keyword,
            keyword_order,
        })
    }

    /// Load `[[voices]]` entries from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or indexed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: VoiceFile =
            toml::from_str(&content).map_err(|e| BridgeError::Config(e.to_string()))?;
        Self::new(file.voices)
    }

    /// Built-in profiles for the bundled synthesizer voices.
    pub fn builtin() -> Self {
        let profiles = vec![
            profile("en-us-female", "Ava", "en", Some("us"), Gender::Female, AgeGroup::Adult,
                &["english", "american accent"]),
            profile("en-gb-male", "Oliver", "en", Some("gb"), Gender::Male, AgeGroup::Adult,
                &["british", "uk accent"]),
            profile("en-us-child", "Milo", "en", Some("us"), Gender::Neutral, AgeGroup::Child,
                &["child voice", "kid voice"]),
            profile("zh-cn-female", "Xiaoxiao", "zh", Some("mandarin"), Gender::Female,
                AgeGroup::Adult, &["mandarin", "chinese", "普通话", "国语", "中文"]),
            profile("zh-sichuan-female", "Xiaobei", "zh", Some("sichuan"), Gender::Female,
                AgeGroup::Young, &["sichuan", "四川话", "四川", "川话"]),
            profile("zh-yue-male", "Wanlung", "zh", Some("cantonese"), Gender::Male,
                AgeGroup::Adult, &["cantonese", "粤语", "广东话"]),
            profile("es-es-female", "Elvira", "es", Some("es"), Gender::Female, AgeGroup::Adult,
                &["spanish", "español"]),
        ];
        match Self::new(profiles) {
            Ok(registry) => registry,
            // The built-in table has unique, non-empty ids.
            Err(_) => Self::empty(),
        }
    }

    fn empty() -> Self {
        Self {
            profiles: Vec::new(),
            by_id: HashMap::new(),
            by_language: HashMap::new(),
            by_dialect: HashMap::new(),
            by_keyword: HashMap::new(),
            keyword_order: Vec::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&VoiceProfile> {
        self.by_id.get(id).map(|&i| &self.profiles[i])
    }

    pub fn by_language(&self, language: &str) -> Vec<&VoiceProfile> {
        self.lookup(&self.by_language, language)
    }

    pub fn by_dialect(&self, dialect: &str) -> Vec<&VoiceProfile> {
        self.lookup(&self.by_dialect, dialect)
    }

    /// First profile whose keyword occurs in `text`, ignoring case.
    ///
    /// Keywords are checked in registry order, each with one substring
    /// search; the matching profile comes from the keyword index.
    pub fn find_by_keywords(&self, text: &str) -> Option<&VoiceProfile> {
        let lower = text.to_lowercase();
        self.keyword_order
            .iter()
            .find(|kw| lower.contains(kw.as_str()))
            .and_then(|kw| self.by_keyword.get(kw))
            .and_then(|idxs| idxs.first())
            .map(|&i| &self.profiles[i])
    }

    /// Id of the first profile for `language`, falling back to the first profile.
    pub fn default_voice_for(&self, language: &str) -> Option<&VoiceProfile> {
        self.by_language(language)
            .into_iter()
            .next()
            .or_else(|| self.profiles.first())
    }

    pub fn iter(&self) -> impl Iterator<Item = &VoiceProfile> {
        self.profiles.iter()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    fn lookup(&self, index: &HashMap<String, Vec<usize>>, key: &str) -> Vec<&VoiceProfile> {
        index
            .get(&key.to_lowercase())
            .map(|idxs| idxs.iter().map(|&i| &self.profiles[i]).collect())
            .unwrap_or_default()
    }
}

fn profile(
    id: &str,
    name: &str,
    language: &str,
    dialect: Option<&str>,
    gender: Gender,
    age: AgeGroup,
    keywords: &[&str],
) -> VoiceProfile {
    VoiceProfile {
        id: id.to_owned(),
        name: name.to_owned(),
        language: language.to_owned(),
        dialect: dialect.map(str::to_owned),
        gender,
        age,
        keywords: keywords.iter().map(|k| (*k).to_owned()).collect(),
    }
}
