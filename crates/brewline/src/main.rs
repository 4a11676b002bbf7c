//! brewline CLI
//!
//! Thin wrapper over `brewline-core`: runs the firehose consumer and answers
//! queries against the local index. Query commands print JSON on stdout;
//! logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use brewline_core::backfill::{BackfillCoordinator, HttpRecordSource};
use brewline_core::config::{Config, LogFormat};
use brewline_core::consumer::FirehoseConsumer;
use brewline_core::feed::{FeedQuery, FeedSort};
use brewline_core::logging::{Verbosity, init_logging};
use brewline_core::{FeedIndex, RecordType};

#[derive(Parser)]
#[command(name = "brewline")]
#[command(version, about = "Firehose replica and feed index for brewing records", long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true, env = "BREWLINE_CONFIG")]
    config: Option<PathBuf>,

    /// Index database path, overriding storage.db_path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Log more (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Log output format (pretty or json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume the firehose until interrupted
    Run {
        /// Firehose endpoint, repeatable; replaces stream.endpoints
        #[arg(long = "endpoint")]
        endpoints: Vec<String>,

        /// Do not backfill newly seen actors
        #[arg(long)]
        no_backfill: bool,

        /// Seconds between progress log lines (0 disables)
        #[arg(long, default_value_t = 60)]
        stats_interval: u64,
    },

    /// Print index counts
    Stats,

    /// Print a page of the community feed
    Feed {
        /// Only this record type (nsid or short name, e.g. `brew`)
        #[arg(long = "type")]
        record_type: Option<RecordType>,

        /// Only records by this actor
        #[arg(long)]
        actor: Option<String>,

        /// Ordering: recent or popular
        #[arg(long, default_value_t = FeedSort::Recent)]
        sort: FeedSort,

        /// Page size (defaults to feed.default_limit)
        #[arg(long)]
        limit: Option<usize>,

        /// Cursor from a previous page
        #[arg(long)]
        cursor: Option<String>,
    },

    /// Print one record by resource identifier
    Record {
        /// at://<actor>/<record type>/<key>
        uri: String,
    },

    /// Print the comment thread under a record
    Comments {
        /// Subject resource identifier
        uri: String,

        /// Actor whose likes are flagged in the output
        #[arg(long)]
        viewer: Option<String>,

        /// Maximum comments returned
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// Print notifications for an actor
    Notifications {
        /// Recipient actor identifier
        actor: String,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        cursor: Option<String>,

        /// Mark everything read after listing
        #[arg(long)]
        mark_read: bool,
    },

    /// Fetch an actor's history from their origin store
    Backfill {
        /// Actor identifier (did:plc:... or did:web:...)
        actor: String,
    },

    /// Configuration helpers
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Print the default config file location
    Path,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    }
}

fn report(err: &anyhow::Error) {
    eprintln!("Error: {err:#}");
    if let Some(remediation) = err
        .downcast_ref::<brewline_core::Error>()
        .and_then(brewline_core::Error::remediation)
    {
        eprintln!();
        eprint!("{}", remediation.render_plain());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.storage.db_path = db.to_string_lossy().into_owned();
    }
    if let Some(format) = cli.log_format {
        config.general.log_format = format;
    }

    let long_running = matches!(cli.command, Commands::Run { .. });
    if let Err(err) = init_logging(&config, Verbosity::from_flags(cli.verbose, long_running)) {
        eprintln!("warning: logging disabled: {err}");
    }

    match cli.command {
        Commands::Run {
            endpoints,
            no_backfill,
            stats_interval,
        } => {
            if !endpoints.is_empty() {
                config.stream.endpoints = endpoints;
            }
            if no_backfill {
                config.backfill.enabled = false;
            }
            config.validate()?;
            run_consumer(&config, stats_interval).await
        }
        Commands::Stats => {
            let index = FeedIndex::open(&config)?;
            print_json(&index.stats().await?)
        }
        Commands::Feed {
            record_type,
            actor,
            sort,
            limit,
            cursor,
        } => {
            let index = FeedIndex::open(&config)?;
            let query = FeedQuery {
                record_type,
                actor_id: actor,
                sort,
                cursor,
                limit: limit.unwrap_or(config.feed.default_limit),
            };
            print_json(&index.feed_with_query(query).await?)
        }
        Commands::Record { uri } => {
            let index = FeedIndex::open(&config)?;
            let record = index
                .record(&uri)
                .await?
                .with_context(|| format!("no indexed record at {uri}"))?;
            print_json(&record)
        }
        Commands::Comments { uri, viewer, limit } => {
            let index = FeedIndex::open(&config)?;
            print_json(&index.threaded_comments(&uri, limit, viewer.as_deref()).await?)
        }
        Commands::Notifications {
            actor,
            limit,
            cursor,
            mark_read,
        } => {
            let index = FeedIndex::open(&config)?;
            let page = index
                .notifications(
                    &actor,
                    limit.unwrap_or(config.feed.default_limit),
                    cursor.as_deref(),
                )
                .await?;
            if mark_read {
                index.mark_all_read(&actor).await?;
            }
            print_json(&page)
        }
        Commands::Backfill { actor } => {
            let index = FeedIndex::open(&config)?;
            let source = Arc::new(HttpRecordSource::new(&config.backfill)?);
            let coordinator = BackfillCoordinator::new(
                Arc::clone(index.store()),
                source,
                config.stream.wanted_record_types()?,
                config.backfill.max_concurrent,
            )?;
            let index = index.with_backfill(coordinator);
            print_json(&index.backfill_user(&actor).await?)
        }
        Commands::Config(ConfigCommands::Show) => {
            let text = toml::to_string_pretty(&config).context("serializing config")?;
            print!("{text}");
            Ok(())
        }
        Commands::Config(ConfigCommands::Path) => {
            let path = cli
                .config
                .or_else(Config::default_path)
                .context("no config directory on this platform")?;
            println!("{}", path.display());
            Ok(())
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    Ok(config)
}

async fn run_consumer(config: &Config, stats_interval: u64) -> Result<()> {
    let index = FeedIndex::open(config)?;
    let consumer = FirehoseConsumer::new(config, Arc::clone(index.store()))?;
    consumer.start()?;

    let mut ticker = (stats_interval > 0).then(|| {
        let period = Duration::from_secs(stats_interval);
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    });

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(error = %err, "could not listen for ctrl-c, stopping");
                }
                break;
            }
            () = tick(ticker.as_mut()) => {
                let stats = consumer.stats();
                info!(
                    state = %stats.connector.state,
                    messages = stats.connector.messages,
                    applied = stats.router.applied,
                    failed = stats.router.failed,
                    cursor = ?stats.applied_cursor,
                    "firehose progress"
                );
            }
        }
    }

    info!("shutting down");
    consumer.stop().await?;
    print_json(&consumer.stats())
}

async fn tick(ticker: Option<&mut tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("serializing output")?;
    println!("{text}");
    Ok(())
}
