//! Canonical safety categories
//!
//! Every stored decision uses this closed set. Classifier output arrives keyed
//! by an external vocabulary (`harassment/threatening`, `self-harm/intent`, ...)
//! and is translated here; a key with no mapping is an error, never dropped.

use crate::error::ModerationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Per-category probabilities, iterated in canonical order.
pub type CategoryScores = BTreeMap<Category, f64>;

/// Per-category violation flags.
pub type CategoryFlags = BTreeMap<Category, bool>;

/// Declaration order is the canonical order: it drives `Ord`, the ordering of
/// score maps, and therefore the tie-break in top-category selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Harassment,
    HarassmentThreatening,
    Sexual,
    Hate,
    HateThreatening,
    Illicit,
    IllicitViolent,
    SelfHarm,
    SelfHarmIntent,
    SelfHarmInstructions,
    SexualMinors,
    Violence,
    ViolenceGraphic,
}

/// Raw classifier key → canonical category.
const RAW_KEYS: &[(&str, Category)] = &[
    ("harassment", Category::Harassment),
    ("harassment/threatening", Category::HarassmentThreatening),
    ("sexual", Category::Sexual),
    ("hate", Category::Hate),
    ("hate/threatening", Category::HateThreatening),
    ("illicit", Category::Illicit),
    ("illicit/violent", Category::IllicitViolent),
    ("self-harm", Category::SelfHarm),
    ("self-harm/intent", Category::SelfHarmIntent),
    ("self-harm/instructions", Category::SelfHarmInstructions),
    ("sexual/minors", Category::SexualMinors),
    ("violence", Category::Violence),
    ("violence/graphic", Category::ViolenceGraphic),
];

impl Category {
    pub const ALL: [Category; 13] = [
        Category::Harassment,
        Category::HarassmentThreatening,
        Category::Sexual,
        Category::Hate,
        Category::HateThreatening,
        Category::Illicit,
        Category::IllicitViolent,
        Category::SelfHarm,
        Category::SelfHarmIntent,
        Category::SelfHarmInstructions,
        Category::SexualMinors,
        Category::Violence,
        Category::ViolenceGraphic,
    ];

    /// Category reported when nothing scores above zero.
    pub const SENTINEL: Category = Category::Harassment;

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Harassment => "harassment",
            Category::HarassmentThreatening => "harassment_threatening",
            Category::Sexual => "sexual",
            Category::Hate => "hate",
            Category::HateThreatening => "hate_threatening",
            Category::Illicit => "illicit",
            Category::IllicitViolent => "illicit_violent",
            Category::SelfHarm => "self_harm",
            Category::SelfHarmIntent => "self_harm_intent",
            Category::SelfHarmInstructions => "self_harm_instructions",
            Category::SexualMinors => "sexual_minors",
            Category::Violence => "violence",
            Category::ViolenceGraphic => "violence_graphic",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = ModerationError;

    /// Parses a canonical key only. Use [`translate`] for classifier keys.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ModerationError::UnknownCategory(s.to_string()))
    }
}

/// Translate an external category key into the canonical taxonomy.
///
/// Accepts both the classifier's raw vocabulary and the canonical keys.
pub fn translate(raw_key: &str) -> Result<Category, ModerationError> {
    if let Some((_, category)) = RAW_KEYS.iter().find(|(key, _)| *key == raw_key) {
        return Ok(*category);
    }
    raw_key.parse()
}
