/// Errors raised by the moderation pipeline and its collaborators.
///
/// A job handler that returns one of these is reported to the queue as a
/// failed attempt and retried according to the queue's backoff policy.
#[derive(Debug, thiserror::Error)]
pub enum ModerationError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{service} returned HTTP {status}: {body}")]
    Collaborator {
        service: &'static str,
        status: u16,
        body: String,
    },
    #[error("Unknown moderation category: {0}")]
    UnknownCategory(String),
    #[error("Unknown job type: {0}")]
    UnknownJobType(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ModerationError>;
