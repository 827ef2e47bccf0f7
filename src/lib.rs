pub mod classifier;
pub mod comment;
pub mod components;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod normalization;
pub mod notifier;
pub mod queue;
pub mod reviewer;
pub mod statistics;
pub mod taxonomy;
pub mod workers;

#[cfg(test)]
mod stub_server;

pub use config::Config;
pub use dispatcher::Dispatcher;
pub use error::{ModerationError, Result};
pub use queue::{Job, SqliteJobQueue};
pub use statistics::{StatEvent, StatisticsCollector};
pub use taxonomy::Category;
pub use workers::{JobHandler, JobOutcome};
