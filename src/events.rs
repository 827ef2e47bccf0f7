//! Moderation event store
//!
//! Append-only audit trail. Every stage execution that reaches a decision
//! writes one self-contained record; records are never updated or deleted.

use crate::components::decision_engine::{ClassifierDecision, Decision};
use crate::components::verdict::Verdict;
use crate::db;
use crate::error::{ModerationError, Result};
use crate::taxonomy::{Category, CategoryFlags, CategoryScores};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Classifier,
    Reviewer,
}

impl Stage {
    pub fn number(&self) -> u8 {
        match self {
            Stage::Classifier => 1,
            Stage::Reviewer => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Classifier => "classifier",
            Stage::Reviewer => "reviewer",
        }
    }
}

/// Stage-specific part of an event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum EventDetail {
    Classifier {
        scores: CategoryScores,
        max_score: f64,
    },
    Reviewer {
        reason: String,
        evidence: String,
    },
}

impl EventDetail {
    pub fn stage(&self) -> Stage {
        match self {
            EventDetail::Classifier { .. } => Stage::Classifier,
            EventDetail::Reviewer { .. } => Stage::Reviewer,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub comment_id: String,
    pub model: String,
    pub decision: Decision,
    pub top_category: Category,
    pub categories: CategoryFlags,
    pub detail: EventDetail,
}

impl NewEvent {
    pub fn classifier(
        comment_id: &str,
        model: &str,
        outcome: &ClassifierDecision,
        categories: CategoryFlags,
        scores: CategoryScores,
    ) -> Self {
        Self {
            comment_id: comment_id.to_string(),
            model: model.to_string(),
            decision: outcome.decision,
            top_category: outcome.top_category,
            categories,
            detail: EventDetail::Classifier {
                scores,
                max_score: outcome.max_score,
            },
        }
    }

    pub fn reviewer(comment_id: &str, model: &str, verdict: &Verdict) -> Self {
        Self {
            comment_id: comment_id.to_string(),
            model: model.to_string(),
            decision: verdict.decision.into(),
            top_category: verdict.top_category,
            categories: verdict.categories.clone(),
            detail: EventDetail::Reviewer {
                reason: verdict.reason.clone(),
                evidence: verdict.evidence.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModerationEvent {
    pub id: i64,
    pub comment_id: String,
    pub model: String,
    pub decision: Decision,
    pub top_category: Category,
    pub categories: CategoryFlags,
    #[serde(flatten)]
    pub detail: EventDetail,
    pub created_at: DateTime<Utc>,
}

impl ModerationEvent {
    pub fn stage(&self) -> Stage {
        self.detail.stage()
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, event: NewEvent) -> Result<ModerationEvent>;

    /// All events for a comment, oldest first
    async fn list_for_comment(&self, comment_id: &str) -> Result<Vec<ModerationEvent>>;
}

pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

impl SqliteEventStore {
    pub fn open(path: &str) -> Result<Self> {
        Self::from_connection(db::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(db::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS moderation_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                comment_id TEXT NOT NULL,
                stage INTEGER NOT NULL,
                model TEXT NOT NULL,
                decision TEXT NOT NULL,
                top_category TEXT NOT NULL,
                categories_json TEXT NOT NULL,
                scores_json TEXT,
                max_score REAL,
                reason TEXT,
                evidence TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_moderation_events_comment
                ON moderation_events (comment_id, created_at);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn event_from_row(row: &Row<'_>) -> rusqlite::Result<ModerationEvent> {
        let stage: u8 = row.get(2)?;
        let decision: String = row.get(4)?;
        let top_category: String = row.get(5)?;
        let categories_json: String = row.get(6)?;
        let created_at: String = row.get(11)?;

        let detail = if stage == Stage::Classifier.number() {
            let scores_json: Option<String> = row.get(7)?;
            let scores = match scores_json {
                Some(json) => scores_from_json(&json).map_err(|e| conversion(7, e))?,
                None => CategoryScores::new(),
            };
            EventDetail::Classifier {
                scores,
                max_score: row.get::<_, Option<f64>>(8)?.unwrap_or(0.0),
            }
        } else {
            EventDetail::Reviewer {
                reason: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
                evidence: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
            }
        };

        Ok(ModerationEvent {
            id: row.get(0)?,
            comment_id: row.get(1)?,
            model: row.get(3)?,
            decision: Decision::parse(&decision).ok_or_else(|| {
                conversion(4, ModerationError::Config(format!("bad decision {decision}")))
            })?,
            top_category: top_category.parse().map_err(|e| conversion(5, e))?,
            categories: flags_from_json(&categories_json).map_err(|e| conversion(6, e))?,
            detail,
            created_at: db::parse_timestamp(&created_at).ok_or_else(|| {
                conversion(11, ModerationError::Config(format!("bad timestamp {created_at}")))
            })?,
        })
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn append(&self, event: NewEvent) -> Result<ModerationEvent> {
        let created_at = Utc::now();
        let categories_json = flags_to_json(&event.categories)?;
        let (scores_json, max_score, reason, evidence) = match &event.detail {
            EventDetail::Classifier { scores, max_score } => {
                (Some(scores_to_json(scores)?), Some(*max_score), None, None)
            }
            EventDetail::Reviewer { reason, evidence } => {
                (None, None, Some(reason.as_str()), Some(evidence.as_str()))
            }
        };

        let conn = db::lock(&self.conn);
        conn.execute(
            "INSERT INTO moderation_events
             (comment_id, stage, model, decision, top_category, categories_json,
              scores_json, max_score, reason, evidence, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                event.comment_id,
                event.detail.stage().number(),
                event.model,
                event.decision.as_str(),
                event.top_category.as_str(),
                categories_json,
                scores_json,
                max_score,
                reason,
                evidence,
                db::timestamp(created_at),
            ],
        )?;
        let id = conn.last_insert_rowid();

        Ok(ModerationEvent {
            id,
            comment_id: event.comment_id,
            model: event.model,
            decision: event.decision,
            top_category: event.top_category,
            categories: event.categories,
            detail: event.detail,
            created_at,
        })
    }

    async fn list_for_comment(&self, comment_id: &str) -> Result<Vec<ModerationEvent>> {
        let conn = db::lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT id, comment_id, stage, model, decision, top_category, categories_json,
                    scores_json, max_score, reason, evidence, created_at
             FROM moderation_events
             WHERE comment_id = ?1
             ORDER BY created_at ASC, id ASC",
        )?;
        let events = stmt
            .query_map(params![comment_id], Self::event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }
}

fn conversion(column: usize, err: ModerationError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

fn flags_to_json(flags: &CategoryFlags) -> Result<String> {
    let keyed: BTreeMap<&str, bool> = flags.iter().map(|(c, v)| (c.as_str(), *v)).collect();
    Ok(serde_json::to_string(&keyed)?)
}

fn scores_to_json(scores: &CategoryScores) -> Result<String> {
    let keyed: BTreeMap<&str, f64> = scores.iter().map(|(c, v)| (c.as_str(), *v)).collect();
    Ok(serde_json::to_string(&keyed)?)
}

fn flags_from_json(json: &str) -> Result<CategoryFlags> {
    let keyed: BTreeMap<String, bool> = serde_json::from_str(json)?;
    keyed
        .into_iter()
        .map(|(key, value)| Ok((key.parse::<Category>()?, value)))
        .collect()
}

fn scores_from_json(json: &str) -> Result<CategoryScores> {
    let keyed: BTreeMap<String, f64> = serde_json::from_str(json)?;
    keyed
        .into_iter()
        .map(|(key, value)| Ok((key.parse::<Category>()?, value)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::decision_engine::VerdictDecision;

    fn classifier_event(comment_id: &str, score: f64, decision: Decision) -> NewEvent {
        let outcome = ClassifierDecision {
            decision,
            max_score: score,
            top_category: Category::Violence,
        };
        let scores: CategoryScores = [(Category::Violence, score), (Category::Hate, 0.01)]
            .into_iter()
            .collect();
        let flags: CategoryFlags = [(Category::Violence, score > 0.5), (Category::Hate, false)]
            .into_iter()
            .collect();
        NewEvent::classifier(comment_id, "omni-moderation-latest", &outcome, flags, scores)
    }

    #[tokio::test]
    async fn test_append_and_list_in_order() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        store
            .append(classifier_event("c1", 0.5, Decision::Review))
            .await
            .unwrap();
        store
            .append(classifier_event("c2", 0.1, Decision::Allow))
            .await
            .unwrap();

        let verdict = Verdict {
            decision: VerdictDecision::Allow,
            reason: "gaming slang".to_string(),
            evidence: "\"destroying me\"".to_string(),
            top_category: Category::Violence,
            categories: CategoryFlags::new(),
        };
        store
            .append(NewEvent::reviewer("c1", "gpt-5-mini", &verdict))
            .await
            .unwrap();

        let events = store.list_for_comment("c1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].stage(), Stage::Classifier);
        assert_eq!(events[0].decision, Decision::Review);
        assert_eq!(events[1].stage(), Stage::Reviewer);
        assert_eq!(events[1].decision, Decision::Allow);
        assert!(events[0].id < events[1].id);
    }

    #[tokio::test]
    async fn test_round_trips_stage_detail() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        let written = store
            .append(classifier_event("c1", 0.91, Decision::Block))
            .await
            .unwrap();

        let read = store.list_for_comment("c1").await.unwrap().remove(0);
        assert_eq!(read.id, written.id);
        assert_eq!(read.detail, written.detail);
        assert_eq!(read.categories, written.categories);
        assert_eq!(read.top_category, Category::Violence);
        match read.detail {
            EventDetail::Classifier { max_score, scores } => {
                assert_eq!(max_score, 0.91);
                assert_eq!(scores.get(&Category::Hate), Some(&0.01));
            }
            other => panic!("unexpected detail {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reviewer_events_carry_no_scores() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        let verdict = Verdict {
            decision: VerdictDecision::Block,
            reason: "targeted threat".to_string(),
            evidence: "I will find you".to_string(),
            top_category: Category::HarassmentThreatening,
            categories: [(Category::HarassmentThreatening, true)].into_iter().collect(),
        };
        store
            .append(NewEvent::reviewer("c9", "gpt-5-mini", &verdict))
            .await
            .unwrap();

        let conn = db::lock(&store.conn);
        let (scores, max): (Option<String>, Option<f64>) = conn
            .query_row(
                "SELECT scores_json, max_score FROM moderation_events WHERE comment_id = 'c9'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert!(scores.is_none());
        assert!(max.is_none());
    }

    #[test]
    fn test_serialized_event_uses_canonical_keys() {
        let event = ModerationEvent {
            id: 1,
            comment_id: "c1".to_string(),
            model: "omni-moderation-latest".to_string(),
            decision: Decision::Block,
            top_category: Category::HarassmentThreatening,
            categories: [(Category::HarassmentThreatening, true)].into_iter().collect(),
            detail: EventDetail::Classifier {
                scores: [(Category::HarassmentThreatening, 0.91)].into_iter().collect(),
                max_score: 0.91,
            },
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["decision"], "BLOCK");
        assert_eq!(json["stage"], "classifier");
        assert_eq!(json["top_category"], "harassment_threatening");
        assert_eq!(json["scores"]["harassment_threatening"], 0.91);
    }
}
