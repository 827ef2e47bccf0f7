//! Decision Engine Component
//!
//! Turns classifier scores into a tri-state decision using the block and
//! review thresholds, and maps reviewer verdicts onto the same decision type.

use crate::comment::CommentStatus;
use crate::taxonomy::{Category, CategoryScores};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecisionConfig {
    pub block_threshold: f64,
    pub review_threshold: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Allow,
    Review,
    Block,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "ALLOW",
            Decision::Review => "REVIEW",
            Decision::Block => "BLOCK",
        }
    }

    /// Comment visibility implied by this decision, `None` for REVIEW.
    pub fn visibility(&self) -> Option<(CommentStatus, bool)> {
        match self {
            Decision::Allow => Some((CommentStatus::Approved, false)),
            Decision::Block => Some((CommentStatus::Blocked, true)),
            Decision::Review => None,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ALLOW" => Some(Decision::Allow),
            "REVIEW" => Some(Decision::Review),
            "BLOCK" => Some(Decision::Block),
            _ => None,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The reviewer can only allow or block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictDecision {
    Allow,
    Block,
}

impl From<VerdictDecision> for Decision {
    fn from(decision: VerdictDecision) -> Self {
        match decision {
            VerdictDecision::Allow => Decision::Allow,
            VerdictDecision::Block => Decision::Block,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierDecision {
    pub decision: Decision,
    pub max_score: f64,
    pub top_category: Category,
}

impl ClassifierDecision {
    pub fn summary(&self, config: &DecisionConfig) -> String {
        let threshold_info = match self.decision {
            Decision::Block => format!(
                "score {:.3} >= block threshold {}",
                self.max_score, config.block_threshold
            ),
            Decision::Review => format!(
                "score {:.3} >= review threshold {}",
                self.max_score, config.review_threshold
            ),
            Decision::Allow => format!(
                "score {:.3} < review threshold {}",
                self.max_score, config.review_threshold
            ),
        };
        format!("{}: {} (top category {})", self.decision, threshold_info, self.top_category)
    }
}

pub struct DecisionEngine {
    config: DecisionConfig,
}

impl DecisionEngine {
    pub fn new(config: DecisionConfig) -> Self {
        Self { config }
    }

    /// Classify a score map against the configured thresholds
    pub fn classify(&self, scores: &CategoryScores) -> ClassifierDecision {
        let max_score = max_score(scores);
        let should_block = max_score >= self.config.block_threshold;
        let needs_review = !should_block && max_score >= self.config.review_threshold;

        let decision = if should_block {
            Decision::Block
        } else if needs_review {
            Decision::Review
        } else {
            Decision::Allow
        };

        ClassifierDecision {
            decision,
            max_score,
            top_category: top_category(scores),
        }
    }

    pub fn get_config(&self) -> &DecisionConfig {
        &self.config
    }
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            block_threshold: 0.8,
            review_threshold: 0.3,
        }
    }
}

impl Default for DecisionEngine {
    fn default() -> Self {
        Self::new(DecisionConfig::default())
    }
}

/// Highest score in the map, 0 when empty.
pub fn max_score(scores: &CategoryScores) -> f64 {
    scores.values().fold(0.0, |max, score| max.max(*score))
}

/// Category with the strictly greatest score.
///
/// The scan starts from the sentinel at -1, so an empty or all-zero map yields
/// the sentinel. Maps iterate in canonical order, so on a tie the category
/// declared first wins.
pub fn top_category(scores: &CategoryScores) -> Category {
    let mut top = Category::SENTINEL;
    let mut max = -1.0;
    for (category, score) in scores {
        if *score > max {
            max = *score;
            top = *category;
        }
    }
    top
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(entries: &[(Category, f64)]) -> CategoryScores {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_decision_thresholds() {
        let engine = DecisionEngine::default();

        let blocked = engine.classify(&scores(&[(Category::HarassmentThreatening, 0.91)]));
        assert_eq!(blocked.decision, Decision::Block);
        assert_eq!(blocked.top_category, Category::HarassmentThreatening);

        let review = engine.classify(&scores(&[(Category::Violence, 0.5)]));
        assert_eq!(review.decision, Decision::Review);

        let allowed = engine.classify(&scores(&[(Category::Violence, 0.25)]));
        assert_eq!(allowed.decision, Decision::Allow);
    }

    #[test]
    fn test_thresholds_are_inclusive() {
        let engine = DecisionEngine::default();
        assert_eq!(
            engine.classify(&scores(&[(Category::Hate, 0.8)])).decision,
            Decision::Block
        );
        assert_eq!(
            engine.classify(&scores(&[(Category::Hate, 0.3)])).decision,
            Decision::Review
        );
        assert_eq!(
            engine.classify(&scores(&[(Category::Hate, 0.299)])).decision,
            Decision::Allow
        );
    }

    #[test]
    fn test_all_zero_scores_resolve_to_sentinel() {
        let engine = DecisionEngine::default();
        let zeros: CategoryScores = Category::ALL.iter().map(|c| (*c, 0.0)).collect();
        let result = engine.classify(&zeros);
        assert_eq!(result.decision, Decision::Allow);
        assert_eq!(result.top_category, Category::Harassment);
        assert_eq!(result.max_score, 0.0);

        let empty = engine.classify(&CategoryScores::new());
        assert_eq!(empty.top_category, Category::Harassment);
        assert_eq!(empty.max_score, 0.0);
        assert_eq!(empty.decision, Decision::Allow);
    }

    #[test]
    fn test_ties_go_to_canonical_order() {
        let tied = scores(&[
            (Category::ViolenceGraphic, 0.4),
            (Category::Hate, 0.4),
            (Category::Sexual, 0.1),
        ]);
        assert_eq!(top_category(&tied), Category::Hate);
    }

    #[test]
    fn test_review_equal_to_block_threshold() {
        let engine = DecisionEngine::new(DecisionConfig {
            block_threshold: 0.5,
            review_threshold: 0.5,
        });
        assert_eq!(
            engine.classify(&scores(&[(Category::Illicit, 0.5)])).decision,
            Decision::Block
        );
        assert_eq!(
            engine.classify(&scores(&[(Category::Illicit, 0.49)])).decision,
            Decision::Allow
        );
    }

    #[test]
    fn test_verdict_and_visibility_mapping() {
        assert_eq!(Decision::from(VerdictDecision::Allow), Decision::Allow);
        assert_eq!(Decision::from(VerdictDecision::Block), Decision::Block);
        assert_eq!(
            Decision::Allow.visibility(),
            Some((CommentStatus::Approved, false))
        );
        assert_eq!(
            Decision::Block.visibility(),
            Some((CommentStatus::Blocked, true))
        );
        assert_eq!(Decision::Review.visibility(), None);
        assert_eq!(Decision::parse("REVIEW"), Some(Decision::Review));
        assert_eq!(Decision::parse("maybe"), None);
    }

    #[test]
    fn test_summary_mentions_threshold() {
        let engine = DecisionEngine::default();
        let result = engine.classify(&scores(&[(Category::Sexual, 0.95)]));
        let summary = result.summary(engine.get_config());
        assert!(summary.starts_with("BLOCK"));
        assert!(summary.contains("block threshold 0.8"));
        assert!(summary.contains("sexual"));
    }
}
