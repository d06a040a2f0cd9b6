//! genqueue CLI
//!
//! Single binary for all genqueue operations:
//! - Backend status and a live queue view
//! - Submitting, following and cancelling generation jobs
//! - Listing, rating, deleting and downloading results
//! - Managing the client configuration

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use genqueue::commands::{self, EventLog, ResultsArgs};
use genqueue::session::{self, Echo};
use gq_orchestrator::OrchestratorBinding;
use gq_protocol::GenerationRequest;

#[derive(Parser)]
#[command(name = "genqueue")]
#[command(author, version, about = "Image generation queue client")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Backend base URL (overrides config and GENQUEUE_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show backend status and health
    Status,

    /// Follow the queue live until Ctrl-C
    Watch,

    /// Submit a generation job
    Generate {
        /// Text prompt
        #[arg(short, long)]
        prompt: String,
        /// Negative prompt
        #[arg(short, long)]
        negative: Option<String>,
        /// Image width in pixels
        #[arg(long)]
        width: Option<u32>,
        /// Image height in pixels
        #[arg(long)]
        height: Option<u32>,
        /// Number of denoising steps
        #[arg(long)]
        steps: Option<u32>,
        /// Classifier-free guidance scale
        #[arg(long)]
        cfg_scale: Option<f64>,
        /// RNG seed
        #[arg(long, allow_negative_numbers = true)]
        seed: Option<i64>,
        /// Model identifier
        #[arg(short, long)]
        model: Option<String>,
        /// Print the job id and exit instead of following the job
        #[arg(long)]
        no_wait: bool,
        /// Give up waiting after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// List active jobs
    Jobs,

    /// Cancel jobs
    Cancel {
        /// Job identifier(s), local or backend
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Cancel every active job
    Clear,

    /// List recent results
    Results {
        /// Number of results to show (defaults to history_limit)
        #[arg(short, long)]
        limit: Option<usize>,
        /// Only results whose prompt matches
        #[arg(short, long)]
        search: Option<String>,
        /// Only favorites
        #[arg(short, long)]
        favorites: bool,
        /// Show parameters and image URLs
        #[arg(long)]
        long: bool,
    },

    /// Delete results
    Delete {
        /// Result identifier(s)
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Rate a result from 1 to 5
    Rate {
        /// Result identifier
        id: String,
        /// Rating
        #[arg(value_parser = clap::value_parser!(u8).range(1..=5))]
        rating: u8,
    },

    /// Mark a result as favorite
    Favorite {
        /// Result identifier
        id: String,
        /// Remove the favorite mark instead
        #[arg(long)]
        unset: bool,
    },

    /// Download a result image
    Download {
        /// Result identifier
        id: String,
        /// Output file or directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get specific config value
    Get { key: String },
    /// Set config value (durations in milliseconds)
    Set { key: String, value: String },
    /// Show config file path
    Path,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity; notifications are already echoed,
    // so the orchestrator only logs errors by default
    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn,gq_orchestrator=error",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let globals = Globals {
        config_path: cli.config,
        base_url: cli.base_url,
        quiet: cli.quiet,
    };
    run(cli.command.unwrap_or(Commands::Status), &globals).await
}

/// Global flags every command sees
struct Globals {
    config_path: Option<PathBuf>,
    base_url: Option<String>,
    quiet: bool,
}

impl Globals {
    /// Resolve the configuration and attach to a freshly initialized
    /// orchestrator; `history_limit` defaults to the configured one
    async fn open(
        &self,
        history_limit: Option<usize>,
        echo: &Echo,
    ) -> Result<OrchestratorBinding> {
        let config =
            session::load_client_config(self.config_path.as_deref(), self.base_url.as_deref())?;
        tracing::debug!(?config, "Resolved configuration");
        let history_limit = history_limit.unwrap_or(config.history_limit);
        session::open(config, history_limit, echo).await
    }
}

async fn run(command: Commands, globals: &Globals) -> Result<()> {
    let quiet = globals.quiet;
    let echo = Echo::new(quiet);

    match command {
        Commands::Status => {
            let binding = globals.open(None, &echo).await?;
            commands::status_command(&binding).await?;
        }

        Commands::Watch => {
            let events = EventLog::default();
            let echo = Echo::with_log(events.clone());
            let binding = globals.open(None, &echo).await?;
            commands::watch_command(&binding, &events).await?;
        }

        Commands::Generate {
            prompt,
            negative,
            width,
            height,
            steps,
            cfg_scale,
            seed,
            model,
            no_wait,
            timeout,
        } => {
            let request = GenerationRequest {
                negative_prompt: negative,
                width,
                height,
                steps,
                cfg_scale,
                seed,
                model,
                ..GenerationRequest::new(prompt)
            };
            let binding = globals.open(None, &echo).await?;
            commands::generate_command(
                &binding,
                &echo,
                request,
                !no_wait,
                timeout.map(Duration::from_secs),
                quiet,
            )
            .await?;
        }

        Commands::Jobs => {
            let binding = globals.open(None, &echo).await?;
            commands::jobs_command(&binding)?;
        }

        Commands::Cancel { ids } => {
            let binding = globals.open(None, &echo).await?;
            commands::cancel_command(&binding, &ids).await?;
        }

        Commands::Clear => {
            let binding = globals.open(None, &echo).await?;
            commands::clear_command(&binding).await?;
        }

        Commands::Results {
            limit,
            search,
            favorites,
            long,
        } => {
            let binding = globals.open(limit, &echo).await?;
            let args = ResultsArgs {
                limit: binding.snapshot().history_limit,
                search,
                favorites,
                long,
            };
            commands::results_command(&binding, &args).await?;
        }

        Commands::Delete { ids } => {
            let binding = globals.open(None, &echo).await?;
            commands::delete_command(&binding, &ids).await?;
        }

        Commands::Rate { id, rating } => {
            let binding = globals.open(None, &echo).await?;
            commands::rate_command(&binding, &id, rating).await?;
        }

        Commands::Favorite { id, unset } => {
            let binding = globals.open(None, &echo).await?;
            commands::favorite_command(&binding, &id, !unset).await?;
        }

        Commands::Download { id, output } => {
            let binding = globals.open(None, &echo).await?;
            commands::download_command(&binding, &id, output.as_deref()).await?;
        }

        // Config commands work without a reachable backend
        Commands::Config { action } => {
            let path = globals.config_path.as_deref();
            match action {
                ConfigAction::Show => commands::config_show(path)?,
                ConfigAction::Get { key } => commands::config_get(path, &key)?,
                ConfigAction::Set { key, value } => commands::config_set(path, &key, &value)?,
                ConfigAction::Path => commands::config_path(path)?,
                ConfigAction::Init { force } => commands::config_init(path, force)?,
            }
        }
    }

    Ok(())
}
