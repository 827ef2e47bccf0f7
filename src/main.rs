use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use comment_moderator::classifier::OpenAiModerationClient;
use comment_moderator::comment::SqliteCommentStore;
use comment_moderator::components::DecisionEngine;
use comment_moderator::events::{EventStore, SqliteEventStore};
use comment_moderator::notifier::{self, Notifier};
use comment_moderator::queue::{JobQueue, RetryPolicy};
use comment_moderator::reviewer::OpenAiResponsesClient;
use comment_moderator::workers::classifier_worker::classify_markup;
use comment_moderator::workers::{Collaborators, PipelineSettings};
use comment_moderator::{Config, Dispatcher, Job, JobHandler, SqliteJobQueue, StatisticsCollector};
use log::LevelFilter;
use std::process;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;

const DEFAULT_CONFIG_PATH: &str = "/etc/comment-moderator.yaml";

#[tokio::main]
async fn main() {
    let matches = Command::new("comment-moderator")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Two-stage comment moderation workers")
        .long_about(
            "Moderates newly posted comments in two stages:\n\
             • a fast-path classifier approves, blocks or escalates every comment\n\
             • a contextual reviewer settles the escalated ones using the thread context",
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("enqueue")
                .long("enqueue")
                .value_name("COMMENT_ID")
                .help("Queue a comment for classification")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("enqueue-review")
                .long("enqueue-review")
                .value_name("COMMENT_ID")
                .help("Queue a comment for contextual review")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("events")
                .long("events")
                .value_name("COMMENT_ID")
                .help("Print the moderation audit trail of a comment")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("unresolved")
                .long("unresolved")
                .help("List jobs that ended without a decision or were dead-lettered")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stats")
                .long("stats")
                .help("Show moderation statistics")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stats-reset")
                .long("stats-reset")
                .help("Reset all statistics")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-comment")
                .long("test-comment")
                .value_name("TEXT")
                .help("Classify a comment and print the decision without writing anything")
                .action(ArgAction::Set),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");
    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_PATH);

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        init_logging(None, verbose);
        generate_default_config(generate_path);
        return;
    }

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };
    init_logging(config.logging.as_ref().map(|l| l.level.as_str()), verbose);

    if matches.get_flag("test-config") {
        test_config(&config);
        return;
    }

    if let Err(e) = config.validate() {
        eprintln!("❌ Invalid configuration: {e}");
        process::exit(1);
    }

    let result = if matches.get_flag("stats") || matches.get_flag("stats-reset") {
        show_stats(&config, matches.get_flag("stats-reset"))
    } else if let Some(comment_id) = matches.get_one::<String>("enqueue") {
        enqueue(&config, Job::classify(comment_id)).await
    } else if let Some(comment_id) = matches.get_one::<String>("enqueue-review") {
        enqueue(&config, Job::review(comment_id)).await
    } else if let Some(comment_id) = matches.get_one::<String>("events") {
        print_events(&config, comment_id).await
    } else if matches.get_flag("unresolved") {
        list_unresolved(&config)
    } else if let Some(text) = matches.get_one::<String>("test-comment") {
        test_comment(&config, text).await
    } else {
        run_service(config).await
    };

    if let Err(e) = result {
        log::error!("{e:#}");
        eprintln!("❌ {e:#}");
        process::exit(1);
    }
}

fn init_logging(level: Option<&str>, verbose: bool) {
    let log_level = if verbose {
        LevelFilter::Debug
    } else {
        level
            .and_then(|l| LevelFilter::from_str(l).ok())
            .unwrap_or(LevelFilter::Info)
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path).with_context(|| format!("Failed to read {path}"))
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn test_config(config: &Config) {
    println!("🔍 Testing configuration...");
    println!();
    println!("Database: {}", config.database_path);
    println!(
        "Thresholds: block >= {}, review >= {}",
        config.thresholds.block_threshold, config.thresholds.review_threshold
    );
    println!(
        "Classifier: {} via {}",
        config.classifier.model, config.classifier.base_url
    );
    println!(
        "Reviewer: {} via {} (effort {})",
        config.reviewer.model, config.reviewer.base_url, config.reviewer.reasoning_effort
    );
    println!(
        "Queue: {} workers, {} attempts max",
        config.queue.workers, config.queue.max_attempts
    );
    println!("Notifier: {:?}", config.notifier.kind);

    for var in [&config.classifier.api_key_env, &config.reviewer.api_key_env] {
        if comment_moderator::config::env_secret(var).is_none() {
            println!("⚠️  {var} is not set");
        }
    }

    match config.validate() {
        Ok(()) => println!("✅ Configuration is valid"),
        Err(e) => {
            println!("❌ Configuration validation failed:");
            println!("Error: {e}");
            process::exit(1);
        }
    }
}

fn open_queue(config: &Config) -> anyhow::Result<SqliteJobQueue> {
    SqliteJobQueue::open(
        &config.database_path,
        RetryPolicy::from_config(&config.queue),
    )
    .with_context(|| format!("Failed to open job queue at {}", config.database_path))
}

async fn enqueue(config: &Config, job: Job) -> anyhow::Result<()> {
    let queue = open_queue(config)?;
    let id = queue.enqueue(&job).await?;
    println!("✅ Queued {job} as job {id}");
    Ok(())
}

async fn print_events(config: &Config, comment_id: &str) -> anyhow::Result<()> {
    let store = SqliteEventStore::open(&config.database_path)?;
    let events = store.list_for_comment(comment_id).await?;
    if events.is_empty() {
        println!("📭 No moderation events for comment {comment_id}");
        return Ok(());
    }
    for event in &events {
        println!("{}", serde_json::to_string_pretty(event)?);
    }
    Ok(())
}

fn list_unresolved(config: &Config) -> anyhow::Result<()> {
    let queue = open_queue(config)?;
    let jobs = queue.list_stuck()?;
    if jobs.is_empty() {
        println!("✅ No unresolved or failed jobs");
        return Ok(());
    }

    println!("📋 Jobs needing attention ({} total):", jobs.len());
    println!("═══════════════════════════════════════");
    for job in &jobs {
        let comment = Job::from_parts(&job.job_type, &job.payload)
            .map(|j| j.comment_id().to_string())
            .unwrap_or_else(|_| job.payload.clone());
        println!(
            "  #{:<6} {:<10} {:<15} comment {:<24} attempts {}",
            job.id, job.state.as_str(), job.job_type, comment, job.attempts
        );
        if let Some(error) = &job.last_error {
            println!("          {}", truncate_string(error, 100));
        }
    }
    println!();
    println!("💡 Re-run a review with --enqueue-review COMMENT_ID");
    Ok(())
}

fn show_stats(config: &Config, reset: bool) -> anyhow::Result<()> {
    let stats_config = match config.statistics.as_ref() {
        Some(stats) if stats.enabled => stats,
        _ => anyhow::bail!("Statistics are not enabled in configuration"),
    };
    let collector = StatisticsCollector::new(stats_config.database_path.clone(), 60)
        .context("Failed to access statistics database")?;

    if reset {
        collector.reset_stats()?;
        println!("✅ Statistics reset successfully");
        return Ok(());
    }

    let (global_stats, outcome_stats) = collector.get_stats()?;
    println!("📊 Comment Moderation Statistics");
    println!("═══════════════════════════════════════");
    println!();
    println!("📈 Global Statistics:");
    println!("  Total Jobs Processed: {}", global_stats.total_jobs);
    if global_stats.total_jobs > 0 {
        let pct = |n: u64| (n as f64 / global_stats.total_jobs as f64) * 100.0;
        println!(
            "  ├─ Allowed: {} ({:.1}%)",
            global_stats.total_allows,
            pct(global_stats.total_allows)
        );
        println!(
            "  ├─ Blocked: {} ({:.1}%)",
            global_stats.total_blocks,
            pct(global_stats.total_blocks)
        );
        println!(
            "  ├─ Escalated: {} ({:.1}%)",
            global_stats.total_reviews,
            pct(global_stats.total_reviews)
        );
        println!(
            "  └─ Failed attempts: {} ({:.1}%)",
            global_stats.total_failures,
            pct(global_stats.total_failures)
        );
    }
    println!();
    println!(
        "  Started: {}",
        global_stats.start_time.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "  Last Updated: {}",
        global_stats.last_updated.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!();

    if outcome_stats.is_empty() {
        println!("📭 No jobs recorded yet");
    } else {
        println!("🎯 Outcomes by stage:");
        println!("┌────────────┬───────────────┬─────────┬──────────┐");
        println!("│ Stage      │ Outcome       │   Count │ Avg (ms) │");
        println!("├────────────┼───────────────┼─────────┼──────────┤");
        for stats in &outcome_stats {
            let avg = stats.total_processing_time_ms / stats.count.max(1);
            println!(
                "│ {:<10} │ {:<13} │ {:>7} │ {:>8} │",
                stats.stage, stats.outcome, stats.count, avg
            );
        }
        println!("└────────────┴───────────────┴─────────┴──────────┘");
    }

    let queue = open_queue(config)?;
    let counts = queue.state_counts()?;
    if !counts.is_empty() {
        println!();
        println!("📦 Queue:");
        for (state, count) in counts {
            println!("  {:<11} {}", state.as_str(), count);
        }
    }
    Ok(())
}

async fn test_comment(config: &Config, text: &str) -> anyhow::Result<()> {
    let client = OpenAiModerationClient::from_config(&config.classifier)?;
    let engine = DecisionEngine::new(config.thresholds);

    println!("🧪 Classifying with {}", config.classifier.model);
    println!();
    let (output, outcome) = classify_markup(&client, &engine, &config.classifier.model, text).await?;

    for (category, score) in &output.scores {
        let flagged = output.flags.get(category).copied().unwrap_or(false);
        println!(
            "  {:<24} {:.4}{}",
            category.as_str(),
            score,
            if flagged { "  ⚠️ flagged" } else { "" }
        );
    }
    println!();
    println!("Decision: {}", outcome.summary(engine.get_config()));
    Ok(())
}

async fn run_service(config: Config) -> anyhow::Result<()> {
    log::info!("Starting comment moderator...");

    let queue = Arc::new(open_queue(&config)?);
    let comments = Arc::new(SqliteCommentStore::open(&config.database_path)?);
    let events = Arc::new(SqliteEventStore::open(&config.database_path)?);
    let notifier: Arc<dyn Notifier> = Arc::from(notifier::from_config(&config.notifier)?);

    let collaborators = Collaborators {
        comments,
        events,
        classifier: Arc::new(OpenAiModerationClient::from_config(&config.classifier)?),
        reviewer: Arc::new(OpenAiResponsesClient::from_config(&config.reviewer)?),
        notifier,
        queue: queue.clone(),
    };
    let handler = Arc::new(JobHandler::new(
        collaborators,
        DecisionEngine::new(config.thresholds),
        PipelineSettings::from_config(&config),
    ));

    let stats = match &config.statistics {
        Some(stats) if stats.enabled => Some(StatisticsCollector::new(
            stats.database_path.clone(),
            stats.flush_interval_seconds.unwrap_or(60),
        )?),
        _ => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal, finishing in-flight jobs...");
        let _ = shutdown_tx.send(true);
    })
    .context("Error setting signal handler")?;

    Dispatcher::new(queue, handler, stats, config.queue.clone())
        .run(shutdown_rx)
        .await?;
    Ok(())
}

fn truncate_string(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
