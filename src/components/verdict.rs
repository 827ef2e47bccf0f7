//! Reviewer verdict contract
//!
//! The JSON schema sent to the generative reviewer and the local validation of
//! whatever comes back. Schema enforcement on the remote side is not trusted:
//! every field is re-checked here before a verdict can drive a decision.

use crate::components::decision_engine::VerdictDecision;
use crate::taxonomy::{Category, CategoryFlags};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

pub const MAX_REASON_CHARS: usize = 2550;
pub const MAX_EVIDENCE_CHARS: usize = 1000;
pub const SCHEMA_NAME: &str = "moderation_verdict";

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub decision: VerdictDecision,
    pub reason: String,
    pub evidence: String,
    pub top_category: Category,
    pub categories: CategoryFlags,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum VerdictError {
    #[error("response is not valid verdict JSON: {0}")]
    InvalidJson(String),
    #[error("decision must be ALLOW or BLOCK, got {0:?}")]
    InvalidDecision(String),
    #[error("reason is {0} characters, limit is {MAX_REASON_CHARS}")]
    ReasonTooLong(usize),
    #[error("evidence is {0} characters, limit is {MAX_EVIDENCE_CHARS}")]
    EvidenceTooLong(usize),
    #[error("unknown category {0:?}")]
    UnknownCategory(String),
    #[error("category {0:?} is not a boolean")]
    NonBooleanFlag(String),
}

#[derive(Deserialize)]
struct RawVerdict {
    decision: String,
    reason: String,
    evidence: String,
    top_category: String,
    categories_json: BTreeMap<String, Value>,
}

/// Validate a reviewer response against the verdict contract.
pub fn parse_verdict(text: &str) -> Result<Verdict, VerdictError> {
    let raw: RawVerdict =
        serde_json::from_str(text).map_err(|e| VerdictError::InvalidJson(e.to_string()))?;

    let decision = match raw.decision.as_str() {
        "ALLOW" => VerdictDecision::Allow,
        "BLOCK" => VerdictDecision::Block,
        _ => return Err(VerdictError::InvalidDecision(raw.decision)),
    };

    let reason_len = raw.reason.chars().count();
    if reason_len > MAX_REASON_CHARS {
        return Err(VerdictError::ReasonTooLong(reason_len));
    }
    let evidence_len = raw.evidence.chars().count();
    if evidence_len > MAX_EVIDENCE_CHARS {
        return Err(VerdictError::EvidenceTooLong(evidence_len));
    }

    let top_category = raw
        .top_category
        .parse::<Category>()
        .map_err(|_| VerdictError::UnknownCategory(raw.top_category.clone()))?;

    let mut categories = CategoryFlags::new();
    for (key, value) in raw.categories_json {
        let category = key
            .parse::<Category>()
            .map_err(|_| VerdictError::UnknownCategory(key.clone()))?;
        let flag = value.as_bool().ok_or(VerdictError::NonBooleanFlag(key))?;
        categories.insert(category, flag);
    }

    Ok(Verdict {
        decision,
        reason: raw.reason,
        evidence: raw.evidence,
        top_category,
        categories,
    })
}

/// Strict JSON schema for the reviewer's structured output.
pub fn verdict_schema() -> Value {
    let category_keys: Vec<&str> = Category::ALL.iter().map(|c| c.as_str()).collect();
    let flag_properties: Map<String, Value> = category_keys
        .iter()
        .map(|key| (key.to_string(), json!({ "type": "boolean" })))
        .collect();

    json!({
        "type": "object",
        "properties": {
            "decision": { "type": "string", "enum": ["ALLOW", "BLOCK"] },
            "reason": { "type": "string", "maxLength": MAX_REASON_CHARS },
            "evidence": { "type": "string", "maxLength": MAX_EVIDENCE_CHARS },
            "top_category": { "type": "string", "enum": category_keys },
            "categories_json": {
                "type": "object",
                "properties": flag_properties,
                "required": category_keys,
                "additionalProperties": false
            }
        },
        "required": ["decision", "reason", "evidence", "top_category", "categories_json"],
        "additionalProperties": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(decision: &str, reason: &str, top: &str) -> String {
        json!({
            "decision": decision,
            "reason": reason,
            "evidence": "\"this boss is destroying me\"",
            "top_category": top,
            "categories_json": { "violence": false, "harassment": false }
        })
        .to_string()
    }

    #[test]
    fn test_parses_allow_verdict() {
        let verdict = parse_verdict(&response("ALLOW", "gaming slang", "violence")).unwrap();
        assert_eq!(verdict.decision, VerdictDecision::Allow);
        assert_eq!(verdict.reason, "gaming slang");
        assert_eq!(verdict.top_category, Category::Violence);
        assert_eq!(verdict.categories.get(&Category::Violence), Some(&false));
    }

    #[test]
    fn test_rejects_review_decision() {
        assert_eq!(
            parse_verdict(&response("REVIEW", "unsure", "violence")),
            Err(VerdictError::InvalidDecision("REVIEW".to_string()))
        );
    }

    #[test]
    fn test_rejects_unknown_categories() {
        assert!(matches!(
            parse_verdict(&response("BLOCK", "spam", "spam")),
            Err(VerdictError::UnknownCategory(_))
        ));

        let bad_key = json!({
            "decision": "BLOCK",
            "reason": "r",
            "evidence": "e",
            "top_category": "hate",
            "categories_json": { "hate/threatening": true }
        });
        assert_eq!(
            parse_verdict(&bad_key.to_string()),
            Err(VerdictError::UnknownCategory("hate/threatening".to_string()))
        );
    }

    #[test]
    fn test_enforces_length_limits_in_characters() {
        // Multi-byte characters count once each
        let at_limit = "評".repeat(MAX_REASON_CHARS);
        assert!(parse_verdict(&response("ALLOW", &at_limit, "hate")).is_ok());

        let too_long = "x".repeat(MAX_REASON_CHARS + 1);
        assert_eq!(
            parse_verdict(&response("ALLOW", &too_long, "hate")),
            Err(VerdictError::ReasonTooLong(MAX_REASON_CHARS + 1))
        );

        let long_evidence = json!({
            "decision": "BLOCK",
            "reason": "r",
            "evidence": "e".repeat(MAX_EVIDENCE_CHARS + 5),
            "top_category": "hate",
            "categories_json": {}
        });
        assert_eq!(
            parse_verdict(&long_evidence.to_string()),
            Err(VerdictError::EvidenceTooLong(MAX_EVIDENCE_CHARS + 5))
        );
    }

    #[test]
    fn test_rejects_missing_fields_and_garbage() {
        assert!(matches!(
            parse_verdict(r#"{"decision":"ALLOW"}"#),
            Err(VerdictError::InvalidJson(_))
        ));
        assert!(matches!(
            parse_verdict("I cannot help with that."),
            Err(VerdictError::InvalidJson(_))
        ));

        let non_bool = json!({
            "decision": "ALLOW",
            "reason": "r",
            "evidence": "e",
            "top_category": "hate",
            "categories_json": { "hate": "no" }
        });
        assert_eq!(
            parse_verdict(&non_bool.to_string()),
            Err(VerdictError::NonBooleanFlag("hate".to_string()))
        );
    }

    #[test]
    fn test_schema_lists_full_taxonomy() {
        let schema = verdict_schema();
        let categories = schema["properties"]["top_category"]["enum"].as_array().unwrap();
        assert_eq!(categories.len(), Category::ALL.len());
        assert_eq!(
            schema["properties"]["categories_json"]["required"]
                .as_array()
                .unwrap()
                .len(),
            Category::ALL.len()
        );
        assert_eq!(schema["properties"]["reason"]["maxLength"], MAX_REASON_CHARS);
        assert_eq!(schema["additionalProperties"], false);
    }
}
