//! tracklane - command-line tracking client
//!
//! Queues customer updates and events in the local database and flushes
//! them to the tracking API.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/tracklane/data.db (~/.local/share/tracklane/data.db)
//! - Config: $XDG_CONFIG_HOME/tracklane/config.toml (~/.config/tracklane/config.toml)
//! - Logs: $XDG_STATE_HOME/tracklane/ (~/.local/state/tracklane/)

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracklane_core::{Config, CustomerIds, Database, FlushResult, Properties, Tracker};

#[derive(Parser)]
#[command(name = "tracklane")]
#[command(about = "Queue and deliver customer updates and events")]
#[command(version)]
struct Args {
    /// Write logs to the state directory
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Identify the current customer and update their properties
    Identify {
        /// Customer identifier, e.g. registered=jane@example.com
        #[arg(long = "id", value_parser = parse_id)]
        ids: Vec<(String, String)>,

        /// Customer property; values are parsed as JSON, falling back to strings
        #[arg(long = "prop", value_parser = parse_property)]
        props: Vec<(String, Value)>,
    },

    /// Track an event
    Track {
        /// Event type, e.g. purchase
        event_type: String,

        /// Event property; values are parsed as JSON, falling back to strings
        #[arg(long = "prop", value_parser = parse_property)]
        props: Vec<(String, Value)>,

        /// UNIX timestamp in seconds (default: now)
        #[arg(long)]
        timestamp: Option<f64>,
    },

    /// Track a click on a campaign link
    Click {
        /// Campaign URL
        url: String,

        #[arg(long = "prop", value_parser = parse_property)]
        props: Vec<(String, Value)>,
    },

    /// Register or remove the push notification token
    PushToken {
        /// Token; omit to unregister
        token: Option<String>,

        /// Notifications are authorized
        #[arg(long)]
        authorized: bool,
    },

    /// Deliver all pending records now
    Flush,

    /// Show configuration and pending records
    Status,

    /// Forget the current customer and drop pending records
    Anonymize,
}

/// Returns $HOME, or the current directory when unset
fn home_dir() -> std::path::PathBuf {
    std::env::var("HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("."))
}

/// Sets XDG environment variables to ensure the core library uses XDG paths
fn ensure_xdg_env() {
    let home = home_dir();

    if std::env::var("XDG_DATA_HOME").is_err() {
        std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
    }

    if std::env::var("XDG_STATE_HOME").is_err() {
        std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
    }

    if std::env::var("XDG_CONFIG_HOME").is_err() {
        std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
    }
}

fn parse_id(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got {:?}", raw)),
    }
}

fn parse_property(raw: &str) -> std::result::Result<(String, Value), String> {
    let (key, value) = parse_id(raw)?;
    let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
    Ok((key, value))
}

fn properties(props: Vec<(String, Value)>) -> Properties {
    props.into_iter().collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    ensure_xdg_env();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Keep the guard alive until exit so buffered logs are written
    let _log_guard = if args.verbose {
        Some(
            tracklane_core::logging::init(&config.logging)
                .context("failed to initialize logging")?,
        )
    } else {
        None
    };

    tracing::info!("tracklane starting");

    match args.command {
        Command::Status => cmd_status(&config),
        command => {
            let tracker = Tracker::configure(config).context("failed to configure tracker")?;
            run(&tracker, command).await
        }
    }
}

async fn run(tracker: &Tracker, command: Command) -> Result<()> {
    match command {
        Command::Identify { ids, props } => {
            let ids: CustomerIds = ids.into_iter().collect();
            let id = tracker
                .identify_customer(ids, properties(props))
                .context("failed to queue customer update")?;
            println!("Queued customer update {}", id);
        }
        Command::Track {
            event_type,
            props,
            timestamp,
        } => {
            let ids = tracker
                .track_event(&event_type, properties(props), timestamp)
                .context("failed to queue event")?;
            println!("Queued {} event into {} project(s)", event_type, ids.len());
        }
        Command::Click { url, props } => {
            tracker
                .track_campaign_click(&url, properties(props), None)
                .context("failed to queue campaign click")?;
            println!("Queued campaign click");
        }
        Command::PushToken { token, authorized } => {
            let id = tracker
                .track_push_token(token, authorized)
                .context("failed to queue push token")?;
            println!("Queued push token update {}", id);
        }
        Command::Flush => cmd_flush(tracker).await?,
        Command::Anonymize => {
            let cookie = tracker.anonymize().context("failed to anonymize customer")?;
            println!("Customer anonymized, new cookie {}", cookie);
        }
        Command::Status => cmd_status(tracker.config())?,
    }
    Ok(())
}

async fn cmd_flush(tracker: &Tracker) -> Result<()> {
    match tracker.flush().await {
        FlushResult::Success(count) => {
            let remaining =
                tracker.store().count_customer_updates()? + tracker.store().count_events()?;
            println!("Flushed {} record(s), {} still pending", count, remaining);
        }
        FlushResult::AlreadyInProgress => println!("A flush is already in progress"),
        FlushResult::NoConnection => {
            println!(
                "No connection to {}, records kept for later",
                tracker.config().project.base_url
            );
        }
        FlushResult::Error(e) => bail!("flush failed: {}", e),
    }
    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("tracklane status");
    println!("================");
    println!();
    println!("Config:          {}", Config::config_path().display());
    println!(
        "Project token:   {}",
        config
            .project
            .project_token
            .as_deref()
            .unwrap_or("(not set)")
    );
    println!("Base URL:        {}", config.project.base_url);
    println!("Flushing mode:   {}", config.flushing.flushing_mode());
    println!("Max retries:     {}", config.flushing.max_retries);

    if let Err(e) = config.validate() {
        println!();
        println!("Configuration is not valid: {}", e);
    }

    let db_path = Config::database_path();
    println!();
    println!("Database:        {}", db_path.display());
    if !db_path.exists() {
        println!("No records have been queued yet.");
        return Ok(());
    }

    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;

    println!(
        "Customer updates: {}",
        db.count_customer_updates()
            .context("failed to count customer updates")?
    );
    println!(
        "Events:           {}",
        db.count_events().context("failed to count events")?
    );

    let ids = db.customer_ids().context("failed to read customer ids")?;
    if !ids.is_empty() {
        println!();
        println!("Customer ids:");
        for (key, value) in &ids {
            println!("  {:<15} {}", key, value);
        }
    }

    Ok(())
}
