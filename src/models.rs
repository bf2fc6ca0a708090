use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Position of a text unit: `(project, volume, number)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitKey {
    pub project: String,
    pub volume: String,
    pub number: i64,
}

impl UnitKey {
    pub fn new(project: impl Into<String>, volume: impl Into<String>, number: i64) -> Self {
        Self {
            project: project.into(),
            volume: volume.into(),
            number,
        }
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.project, self.volume, self.number)
    }
}

/// One extracted source string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextUnit {
    pub key: UnitKey,
    pub source_text: String,
    /// Non-whitespace characters of `source_text`
    pub letters: i64,
    pub has_translate: bool,
    pub translate_approved: bool,
    /// Best video references attached by the reference resolver
    pub references: Vec<ScoredReference>,
}

impl TextUnit {
    /// Create a fresh, untranslated unit as produced at extraction time
    pub fn new(key: UnitKey, source_text: impl Into<String>) -> Self {
        let source_text = source_text.into();
        Self {
            key,
            letters: count_letters(&source_text),
            source_text,
            has_translate: false,
            translate_approved: false,
            references: Vec::new(),
        }
    }
}

/// A word flagged by the spellcheck provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpellIssue {
    pub word: String,
    /// Character offset of `word` inside the checked text
    pub position: usize,
    pub suggestions: Vec<String>,
}

/// One immutable snapshot of translated text for a position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationRevision {
    pub id: i64,
    pub key: UnitKey,
    pub text: String,
    pub author: String,
    pub editor: String,
    pub created_at: DateTime<Utc>,
    /// Revision that superseded this one; `None` on the chain tail
    pub next_id: Option<i64>,
    /// First revision of the chain; `None` on the first revision itself
    pub first_id: Option<i64>,
    pub deleted: bool,
    /// Text differs from the unit's source
    pub is_translate: bool,
    pub letters: i64,
    pub spell_issues: Vec<SpellIssue>,
}

impl TranslationRevision {
    /// Live head: unsuperseded and not deleted
    pub fn is_live_head(&self) -> bool {
        self.next_id.is_none() && !self.deleted
    }

    /// Id of the first revision of the chain this revision belongs to
    pub fn chain_root(&self) -> i64 {
        self.first_id.unwrap_or(self.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAggregate {
    pub project: String,
    pub volume: String,
    pub letters: i64,
    pub texts: i64,
    pub translated_letters: i64,
    pub translated_texts: i64,
    pub approved_letters: i64,
    pub approved_texts: i64,
    pub last_submit: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectAggregate {
    pub project: String,
    pub letters: i64,
    pub texts: i64,
    pub translated_letters: i64,
    pub translated_texts: i64,
    pub approved_letters: i64,
    pub approved_texts: i64,
    pub last_submit: Option<DateTime<Utc>>,
}

impl ProjectAggregate {
    /// Sum volume aggregates into a project total
    pub fn from_volumes<'a>(
        project: &str,
        volumes: impl IntoIterator<Item = &'a VolumeAggregate>,
        last_submit: Option<DateTime<Utc>>,
    ) -> Self {
        volumes.into_iter().fold(
            ProjectAggregate {
                project: project.to_string(),
                last_submit,
                ..Default::default()
            },
            |mut acc, v| {
                acc.letters += v.letters;
                acc.texts += v.texts;
                acc.translated_letters += v.translated_letters;
                acc.translated_texts += v.translated_texts;
                acc.approved_letters += v.approved_letters;
                acc.approved_texts += v.approved_texts;
                acc
            },
        )
    }
}

/// A video frame backing a text unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredReference {
    pub video_id: String,
    pub frame: i64,
    pub score: f64,
}

/// OCR text read from a video frame, waiting to be matched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoTextCandidate {
    pub video_id: String,
    pub frame: i64,
    pub text: String,
}

/// A stored candidate with its pending-set id and owning project
#[derive(Debug, Clone, PartialEq)]
pub struct PendingVideoText {
    pub id: i64,
    pub project: String,
    pub candidate: VideoTextCandidate,
}

/// Count letters the way aggregates do: every non-whitespace character
pub fn count_letters(text: &str) -> i64 {
    text.chars().filter(|c| !c.is_whitespace()).count() as i64
}

static GROUP_REGEX: OnceLock<Regex> = OnceLock::new();

/// Source-resource group of a volume name.
///
/// Variant volumes share a leading numeric id (`"0012_main"`, `"0012_alt"`);
/// names without one form a group of their own.
pub fn volume_group(volume: &str) -> &str {
    let re = GROUP_REGEX.get_or_init(|| Regex::new(r"^\d+").expect("valid group regex"));
    match re.find(volume) {
        Some(m) => m.as_str(),
        None => volume,
    }
}
