use crate::components::DecisionConfig;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database holding comments, moderation events and the job queue
    pub database_path: String,
    pub thresholds: DecisionConfig,
    pub classifier: ClassifierConfig,
    pub reviewer: ReviewerConfig,
    pub queue: QueueConfig,
    pub notifier: NotifierConfig,
    pub statistics: Option<StatisticsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub base_url: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub model: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewerConfig {
    pub base_url: String,
    pub api_key_env: String,
    pub model: String,
    /// "low", "medium" or "high"
    pub reasoning_effort: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub retain_completed_seconds: u64,
    pub retain_failed_seconds: u64,
    /// A `running` row older than this is treated as abandoned by a crashed worker
    pub lease_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifierKind {
    Log,
    Webhook,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    #[serde(rename = "type")]
    pub kind: NotifierKind,
    /// System-message endpoint, required for `webhook`
    pub url: Option<String>,
    pub auth_token_env: Option<String>,
    pub title: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsConfig {
    pub enabled: bool,
    pub database_path: String,
    pub flush_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "/var/lib/comment-moderator/moderation.db".to_string(),
            thresholds: DecisionConfig::default(),
            classifier: ClassifierConfig::default(),
            reviewer: ReviewerConfig::default(),
            queue: QueueConfig::default(),
            notifier: NotifierConfig::default(),
            statistics: Some(StatisticsConfig {
                enabled: true,
                database_path: "/var/lib/comment-moderator/stats.db".to_string(),
                flush_interval_seconds: Some(60),
            }),
            logging: Some(LoggingConfig {
                level: "info".to_string(),
            }),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            model: "omni-moderation-latest".to_string(),
            timeout_seconds: 30,
        }
    }
}

impl Default for ReviewerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            model: "gpt-5-mini".to_string(),
            reasoning_effort: "medium".to_string(),
            timeout_seconds: 120,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_ms: 500,
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 300_000,
            retain_completed_seconds: 3_600,
            retain_failed_seconds: 86_400,
            lease_seconds: 600,
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            kind: NotifierKind::Log,
            url: None,
            auth_token_env: None,
            title: "Comment moderation failed".to_string(),
            timeout_seconds: 10,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check deployment invariants before any worker starts
    pub fn validate(&self) -> anyhow::Result<()> {
        let t = &self.thresholds;
        for (name, value) in [("block", t.block_threshold), ("review", t.review_threshold)] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{name} threshold {value} must be between 0 and 1");
            }
        }
        if t.review_threshold > t.block_threshold {
            anyhow::bail!(
                "review threshold {} must not exceed block threshold {}",
                t.review_threshold,
                t.block_threshold
            );
        }

        Url::parse(&self.classifier.base_url)
            .map_err(|e| anyhow::anyhow!("invalid classifier base_url: {e}"))?;
        Url::parse(&self.reviewer.base_url)
            .map_err(|e| anyhow::anyhow!("invalid reviewer base_url: {e}"))?;
        if !matches!(
            self.reviewer.reasoning_effort.as_str(),
            "minimal" | "low" | "medium" | "high"
        ) {
            anyhow::bail!(
                "reasoning_effort must be one of minimal, low, medium, high; got {}",
                self.reviewer.reasoning_effort
            );
        }

        if self.queue.workers == 0 {
            anyhow::bail!("queue.workers must be at least 1");
        }
        if self.queue.max_attempts == 0 {
            anyhow::bail!("queue.max_attempts must be at least 1");
        }
        if self.queue.backoff_base_ms > self.queue.backoff_max_ms {
            anyhow::bail!("queue.backoff_base_ms must not exceed queue.backoff_max_ms");
        }
        let longest_job = self
            .classifier
            .timeout_seconds
            .max(self.reviewer.timeout_seconds)
            + self.notifier.timeout_seconds;
        if self.queue.lease_seconds <= longest_job {
            anyhow::bail!(
                "queue.lease_seconds ({}) must exceed the longest collaborator timeout chain ({}s)",
                self.queue.lease_seconds,
                longest_job
            );
        }

        if self.notifier.kind == NotifierKind::Webhook {
            let url = self
                .notifier
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("notifier.url is required for webhook notifier"))?;
            Url::parse(url).map_err(|e| anyhow::anyhow!("invalid notifier url: {e}"))?;
        }
        Ok(())
    }
}

/// Read an API key from the environment; an empty value counts as unset.
pub fn env_secret(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_default_config_round_trips_through_yaml() {
        let yaml = serde_yaml::to_string(&Config::default()).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.thresholds, DecisionConfig::default());
        assert_eq!(parsed.classifier.model, "omni-moderation-latest");
        assert_eq!(parsed.notifier.kind, NotifierKind::Log);
        assert_eq!(parsed.queue.max_attempts, 5);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
database_path: "/tmp/moderation.db"
thresholds:
  block_threshold: 0.9
  review_threshold: 0.4
queue:
  workers: 2
notifier:
  type: webhook
  url: "http://localhost:3000/api/system-messages"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.thresholds.block_threshold, 0.9);
        assert_eq!(config.queue.workers, 2);
        assert_eq!(config.queue.poll_interval_ms, 500);
        assert_eq!(config.notifier.kind, NotifierKind::Webhook);
        assert_eq!(config.notifier.title, "Comment moderation failed");
        assert_eq!(config.reviewer.reasoning_effort, "medium");
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let mut config = Config::default();
        config.thresholds = DecisionConfig {
            block_threshold: 0.3,
            review_threshold: 0.8,
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("must not exceed"));
    }

    #[test]
    fn test_rejects_out_of_range_threshold() {
        let mut config = Config::default();
        config.thresholds.block_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_webhook_requires_url() {
        let mut config = Config::default();
        config.notifier.kind = NotifierKind::Webhook;
        assert!(config.validate().is_err());
        config.notifier.url = Some("not a url".to_string());
        assert!(config.validate().is_err());
        config.notifier.url = Some("https://example.com/messages".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn test_reasoning_effort_values() {
        let mut config = Config::default();
        for effort in ["minimal", "low", "medium", "high"] {
            config.reviewer.reasoning_effort = effort.to_string();
            config.validate().unwrap();
        }
        config.reviewer.reasoning_effort = "extreme".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lease_must_outlast_collaborator_timeouts() {
        let mut config = Config::default();
        config.queue.lease_seconds = config.reviewer.timeout_seconds;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("moderator.yaml");
        let path = path.to_str().unwrap();
        let mut config = Config::default();
        config.queue.workers = 7;
        config.to_file(path).unwrap();
        let loaded = Config::from_file(path).unwrap();
        assert_eq!(loaded.queue.workers, 7);
    }
}
