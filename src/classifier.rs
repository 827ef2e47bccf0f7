//! Fast-path classifier collaborator
//!
//! Calls an OpenAI-compatible `/moderations` endpoint and translates the raw
//! category vocabulary into canonical categories.

use crate::config::{env_secret, ClassifierConfig};
use crate::error::{ModerationError, Result};
use crate::taxonomy::{translate, CategoryFlags, CategoryScores};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Translated classifier result for a single input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassifierOutput {
    pub scores: CategoryScores,
    pub flags: CategoryFlags,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, model: &str, text: &str) -> Result<ClassifierOutput>;
}

/// Translate raw classifier keys. Any key outside the taxonomy fails the
/// whole result.
pub fn translate_output(
    raw_scores: HashMap<String, f64>,
    raw_flags: HashMap<String, bool>,
) -> Result<ClassifierOutput> {
    let mut output = ClassifierOutput::default();
    for (key, score) in raw_scores {
        output.scores.insert(translate(&key)?, score);
    }
    for (key, flag) in raw_flags {
        output.flags.insert(translate(&key)?, flag);
    }
    Ok(output)
}

pub struct OpenAiModerationClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ModerationRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct ModerationResponse {
    results: Vec<ModerationResult>,
}

#[derive(Deserialize)]
struct ModerationResult {
    #[serde(default)]
    categories: HashMap<String, bool>,
    category_scores: HashMap<String, f64>,
}

impl OpenAiModerationClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    pub fn from_config(config: &ClassifierConfig) -> Result<Self> {
        let api_key = env_secret(&config.api_key_env);
        if api_key.is_none() {
            log::warn!(
                "{} is not set, classifier requests will be unauthenticated",
                config.api_key_env
            );
        }
        Self::new(
            &config.base_url,
            api_key,
            Duration::from_secs(config.timeout_seconds),
        )
    }
}

#[async_trait]
impl Classifier for OpenAiModerationClient {
    async fn classify(&self, model: &str, text: &str) -> Result<ClassifierOutput> {
        let url = format!("{}/moderations", self.base_url);
        let mut request = self
            .client
            .post(&url)
            .json(&ModerationRequest { model, input: text });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModerationError::Collaborator {
                service: "classifier",
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ModerationResponse = response.json().await?;
        let result = parsed
            .results
            .into_iter()
            .next()
            .ok_or_else(|| ModerationError::Collaborator {
                service: "classifier",
                status: status.as_u16(),
                body: "response contained no results".to_string(),
            })?;

        translate_output(result.category_scores, result.categories)
    }
}
