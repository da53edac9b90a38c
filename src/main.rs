use clap::{Parser, Subcommand};
use lifelog_search::Result;
use lifelog_search::commands::{SyncOptions, run_repl, run_sync, search_once, show_status};
use lifelog_search::config::{resolve_config_dir, run_interactive_config, show_config};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lifelog")]
#[command(about = "Incremental semantic indexing and search over a screen activity log")]
#[command(version)]
struct Cli {
    /// Directory holding config.toml, the activity log and the vector index
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure Ollama connection and sync settings
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Embed new activity log records into the vector index
    Sync {
        /// Run a single sync cycle and exit
        #[arg(long)]
        once: bool,
        /// Seconds between sync cycles
        #[arg(long)]
        interval: Option<u64>,
        /// Records embedded per request
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Search the indexed activity log
    Search {
        /// Free-text query
        query: String,
        /// Number of results to show
        #[arg(short = 'n', long)]
        results: Option<usize>,
    },
    /// Interactive search prompt
    Repl {
        /// Number of results to show per query
        #[arg(short = 'n', long)]
        results: Option<usize>,
    },
    /// Show status of the activity log, vector index and sync process
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_dir = resolve_config_dir(cli.config_dir)
        .map_err(|e| lifelog_search::LifelogError::Config(e.to_string()))?;

    match cli.command {
        Commands::Config { show } => {
            if show {
                show_config(&config_dir)?;
            } else {
                run_interactive_config(&config_dir)?;
            }
        }
        Commands::Sync {
            once,
            interval,
            batch_size,
        } => {
            let options = SyncOptions {
                once,
                interval_seconds: interval,
                batch_size,
            };
            run_sync(&config_dir, options).await?;
        }
        Commands::Search { query, results } => {
            search_once(&config_dir, &query, results).await?;
        }
        Commands::Repl { results } => {
            run_repl(&config_dir, results).await?;
        }
        Commands::Status => {
            show_status(&config_dir).await?;
        }
    }

    Ok(())
}
