use crate::config::{env_secret, NotifierConfig, NotifierKind};
use crate::taxonomy::Category;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// Delivers system messages to comment authors.
///
/// Delivery is best effort: callers log a failure and carry on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, target_user_id: &str, title: &str, body: &str)
        -> Result<(), NotifyError>;
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Endpoint rejected notification with HTTP {0}")]
    Rejected(u16),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Generic block message used by the classifier stage and as the reviewer
/// fallback.
pub fn generic_block_message(top_category: Category, evidence: Option<&str>) -> String {
    let mut body = format!(
        "Your comment was blocked for violating the content safety rules ({top_category})."
    );
    if let Some(evidence) = evidence.map(str::trim).filter(|e| !e.is_empty()) {
        body.push_str(&format!(" Evidence: {evidence}"));
    }
    body
}

/// Message for a reviewer block: the model's reason, with evidence appended.
pub fn reviewer_block_message(reason: &str, evidence: &str, top_category: Category) -> String {
    let reason = reason.trim();
    if reason.is_empty() {
        return generic_block_message(top_category, Some(evidence));
    }
    let evidence = evidence.trim();
    if evidence.is_empty() {
        reason.to_string()
    } else {
        format!("{reason} (evidence: {evidence})")
    }
}

/// Writes notifications to the log instead of delivering them.
#[derive(Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        target_user_id: &str,
        title: &str,
        body: &str,
    ) -> Result<(), NotifyError> {
        log::info!("Notification for user {target_user_id}: [{title}] {body}");
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SystemMessage<'a> {
    target_user: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    title: &'a str,
    content: &'a str,
}

/// Posts system messages to the host application's message endpoint.
pub struct WebhookNotifier {
    url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: &str, auth_token: Option<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::ConfigError(e.to_string()))?;
        Ok(Self {
            url: url.to_string(),
            auth_token,
            client,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(
        &self,
        target_user_id: &str,
        title: &str,
        body: &str,
    ) -> Result<(), NotifyError> {
        let message = SystemMessage {
            target_user: target_user_id,
            kind: "system",
            title,
            content: body,
        };
        let mut request = self.client.post(&self.url).json(&message);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| NotifyError::NetworkError(e.to_string()))?;
        if !response.status().is_success() {
            return Err(NotifyError::Rejected(response.status().as_u16()));
        }
        log::debug!("Delivered notification to user {target_user_id}");
        Ok(())
    }
}

pub fn from_config(config: &NotifierConfig) -> Result<Box<dyn Notifier>, NotifyError> {
    match config.kind {
        NotifierKind::Log => Ok(Box::new(LogNotifier)),
        NotifierKind::Webhook => {
            let url = config.url.as_deref().ok_or_else(|| {
                NotifyError::ConfigError("webhook notifier requires a url".to_string())
            })?;
            let auth_token = config.auth_token_env.as_deref().and_then(env_secret);
            Ok(Box::new(WebhookNotifier::new(
                url,
                auth_token,
                Duration::from_secs(config.timeout_seconds),
            )?))
        }
    }
}
