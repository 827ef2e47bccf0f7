//! Generative reviewer collaborator
//!
//! Sends the thread context to an OpenAI-compatible `/responses` endpoint with
//! a strict JSON-schema output format. The client only transports text; the
//! verdict is validated by the caller.

use crate::components::verdict::SCHEMA_NAME;
use crate::config::{env_secret, ReviewerConfig};
use crate::error::{ModerationError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub struct ReviewRequest<'a> {
    pub model: &'a str,
    pub system_prompt: &'a str,
    pub user_content: &'a str,
    pub output_schema: &'a Value,
    pub effort: &'a str,
}

#[async_trait]
pub trait Reviewer: Send + Sync {
    /// Structured output text, or `None` when the model refused or produced
    /// nothing usable.
    async fn review(&self, request: &ReviewRequest<'_>) -> Result<Option<String>>;
}

pub struct OpenAiResponsesClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct InputMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    input: Vec<InputMessage<'a>>,
    text: TextOptions<'a>,
    reasoning: ReasoningOptions<'a>,
}

#[derive(Serialize)]
struct TextOptions<'a> {
    format: JsonSchemaFormat<'a>,
}

#[derive(Serialize)]
struct JsonSchemaFormat<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    name: &'static str,
    schema: &'a Value,
    strict: bool,
}

#[derive(Serialize)]
struct ReasoningOptions<'a> {
    effort: &'a str,
}

#[derive(Deserialize, Default)]
struct ResponsesResponse {
    #[serde(default)]
    output_text: Option<String>,
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Deserialize)]
struct OutputItem {
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Deserialize)]
struct ContentPart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

fn extract_output_text(response: ResponsesResponse) -> Option<String> {
    if let Some(text) = response.output_text.filter(|t| !t.trim().is_empty()) {
        return Some(text);
    }
    for part in response.output.into_iter().flat_map(|item| item.content) {
        match part.kind.as_str() {
            "output_text" => {
                if let Some(text) = part.text.filter(|t| !t.trim().is_empty()) {
                    return Some(text);
                }
            }
            "refusal" => {
                log::warn!(
                    "Reviewer refused: {}",
                    part.refusal.unwrap_or_default()
                );
                return None;
            }
            _ => {}
        }
    }
    None
}

impl OpenAiResponsesClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    pub fn from_config(config: &ReviewerConfig) -> Result<Self> {
        let api_key = env_secret(&config.api_key_env);
        if api_key.is_none() {
            log::warn!(
                "{} is not set, reviewer requests will be unauthenticated",
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
impl Reviewer for OpenAiResponsesClient {
    async fn review(&self, request: &ReviewRequest<'_>) -> Result<Option<String>> {
        let url = format!("{}/responses", self.base_url);
        let body = ResponsesRequest {
            model: request.model,
            input: vec![
                InputMessage {
                    role: "system",
                    content: request.system_prompt,
                },
                InputMessage {
                    role: "user",
                    content: request.user_content,
                },
            ],
            text: TextOptions {
                format: JsonSchemaFormat {
                    kind: "json_schema",
                    name: SCHEMA_NAME,
                    schema: request.output_schema,
                    strict: true,
                },
            },
            reasoning: ReasoningOptions {
                effort: request.effort,
            },
        };

        let mut http = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }

        let response = http.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModerationError::Collaborator {
                service: "reviewer",
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ResponsesResponse = response.json().await?;
        Ok(extract_output_text(parsed))
    }
}
