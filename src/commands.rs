use anyhow::{Context, Result};
use console::style;
use dialoguer::Input;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::LifelogError;
use crate::config::Config;
use crate::database::lancedb::VectorStore;
use crate::database::sqlite::Database;
use crate::embeddings::OllamaClient;
use crate::indexer::{SyncEngine, SyncLock, SyncStats, current_watermark};
use crate::search::{QueryEngine, QueryResult, format_result};

/// A lock whose heartbeat is this many intervals old belongs to a dead process
const LOCK_STALE_INTERVALS: u32 = 3;

/// Overrides for a `sync` invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Run a single cycle and exit
    pub once: bool,
    pub interval_seconds: Option<u64>,
    pub batch_size: Option<usize>,
}

/// Keep the vector index in sync with the activity log until interrupted
#[inline]
pub async fn run_sync(config_dir: &Path, options: SyncOptions) -> Result<()> {
    let mut config = Config::load(config_dir)?;
    if let Some(seconds) = options.interval_seconds {
        config.sync.set_interval_seconds(seconds)?;
    }
    if let Some(batch_size) = options.batch_size {
        config.sync.set_batch_size(batch_size)?;
    }
    let period = Duration::from_secs(config.sync.interval_seconds);

    let database = Database::new(config.log_database_path())
        .await
        .context("Failed to open the activity log database")?;
    let store = VectorStore::new(&config)
        .await
        .context("Failed to open the vector index")?;
    let client = OllamaClient::new(&config.ollama).context("Failed to create Ollama client")?;

    if let Err(e) = client.health_check() {
        warn!(
            "Ollama is not ready ({:#}); sync cycles will fail until it is reachable",
            e
        );
    }

    let lock = SyncLock::acquire(config.sync_lock_path(), period * LOCK_STALE_INTERVALS).await?;

    let mut engine = SyncEngine::new(
        database,
        Arc::new(client),
        store,
        config.sync.batch_size,
    );

    if options.once {
        let stats = engine.sync_once().await?;
        print_sync_stats(&stats);
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping after the current cycle");
            ctrl_c_token.cancel();
        }
    });

    println!(
        "🔄 Syncing every {}s (batch size {}). Press Ctrl+C to stop.",
        config.sync.interval_seconds, config.sync.batch_size
    );
    engine.run(period, cancel, Some(&lock)).await?;
    println!("Sync stopped.");

    Ok(())
}

fn print_sync_stats(stats: &SyncStats) {
    if stats.fetched == 0 {
        println!(
            "✅ Index is up to date (watermark {})",
            describe_watermark(stats.watermark_before)
        );
        return;
    }

    println!(
        "✅ Committed {}/{} new records in {} batches",
        stats.committed, stats.fetched, stats.batches
    );
    println!(
        "   Watermark: {} -> {}",
        describe_watermark(stats.watermark_before),
        describe_watermark(stats.watermark_after)
    );
    if let Some(reason) = &stats.aborted {
        println!("   ⚠️  Stopped early: {}", reason);
        println!("   {} records will be retried on the next run", stats.pending());
    }
}

fn describe_watermark(watermark: Option<i64>) -> String {
    watermark.map_or_else(|| "none".to_string(), |id| id.to_string())
}

async fn open_query_engine(config: &Config) -> Result<QueryEngine<OllamaClient, VectorStore>> {
    let store = VectorStore::new(config)
        .await
        .context("Failed to open the vector index")?;
    let client = OllamaClient::new(&config.ollama).context("Failed to create Ollama client")?;
    Ok(QueryEngine::new(Arc::new(client), store))
}

/// Run a single query and print the results
#[inline]
pub async fn search_once(config_dir: &Path, query: &str, results: Option<usize>) -> Result<()> {
    let config = Config::load(config_dir)?;
    let k = results.unwrap_or(config.search.default_results);
    let engine = open_query_engine(&config).await?;

    match engine.search(query, k).await {
        Ok(results) => print_results(query, &results),
        Err(e) => {
            report_search_error(&e);
            return Err(e.into());
        }
    }

    Ok(())
}

/// Interactive search loop; `q` quits
#[inline]
pub async fn run_repl(config_dir: &Path, results: Option<usize>) -> Result<()> {
    let config = Config::load(config_dir)?;
    let k = results.unwrap_or(config.search.default_results);
    let engine = open_query_engine(&config).await?;

    println!("{}", style("--- LifeLog Search ---").bold().cyan());

    loop {
        println!();
        let query: String = match Input::new()
            .with_prompt("Enter a search query (q to quit)")
            .allow_empty(true)
            .interact_text()
        {
            Ok(query) => query,
            Err(e) => {
                // closed stdin ends the session like `q`
                info!("Input closed: {}", e);
                break;
            }
        };

        let query = query.trim();
        if is_quit_command(query) {
            break;
        }
        if query.is_empty() {
            continue;
        }

        match engine.search(query, k).await {
            Ok(results) => print_results(query, &results),
            Err(e) => report_search_error(&e),
        }
    }

    Ok(())
}

fn is_quit_command(input: &str) -> bool {
    input.eq_ignore_ascii_case("q")
}

fn print_results(query: &str, results: &[QueryResult]) {
    println!("🧠 Searching for '{}'", query);

    if results.is_empty() {
        println!("No results found.");
        return;
    }

    for (i, result) in results.iter().enumerate() {
        println!();
        println!("{}", format_result(i + 1, result));
    }
}

fn report_search_error(error: &LifelogError) {
    eprintln!("{} {}", style("Error:").red().bold(), error);
    match error {
        LifelogError::IndexNotFound(_) => {
            eprintln!("No data has been indexed yet. Run 'lifelog sync' first.");
        }
        LifelogError::Embedding(_) | LifelogError::Network(_) => {
            eprintln!("Make sure Ollama is running and the embedding model is available.");
        }
        _ => {
            eprintln!("Data may be missing or the vector index might not exist yet.");
        }
    }
}

/// Show a status report covering the log, the index and Ollama
#[inline]
pub async fn show_status(config_dir: &Path) -> Result<()> {
    let config = Config::load(config_dir)?;

    println!("📊 LifeLog Search Status Report");
    println!("{}", "=".repeat(50));
    println!();

    println!("🗄️  Activity Log:");
    let database = match Database::open_existing(config.log_database_path()).await {
        Ok(db) => {
            println!("   ✅ SQLite: {}", config.log_database_path().display());
            Some(db)
        }
        Err(e) => {
            println!("   ❌ SQLite: Failed to open - {:#}", e);
            None
        }
    };

    let log_count = match &database {
        Some(database) => match database.count_logs().await {
            Ok(count) => {
                println!("   📋 Records: {}", count);
                Some(count)
            }
            Err(e) => {
                println!("   ⚠️  Records: Unknown - {:#}", e);
                None
            }
        },
        None => None,
    };

    println!("🔍 Vector Index:");
    let watermark = match VectorStore::new(&config).await {
        Ok(store) => {
            println!("   ✅ LanceDB: {}", store.path().display());
            match store.vector_dimension() {
                Some(dim) => println!("   🔢 Dimensions: {}", dim),
                None => println!("   💤 Not created yet"),
            }
            match store.count_documents().await {
                Ok(count) => println!("   📋 Documents: {}", count),
                Err(e) => println!("   ⚠️  Documents: Unknown - {}", e),
            }
            match current_watermark(&store).await {
                Ok(watermark) => {
                    println!("   🔖 Watermark: {}", describe_watermark(watermark));
                    Some(watermark)
                }
                Err(e) => {
                    println!("   ⚠️  Watermark: Unknown - {}", e);
                    None
                }
            }
        }
        Err(e) => {
            println!("   ❌ LanceDB: Failed to open - {}", e);
            None
        }
    };

    if let (Some(database), Some(watermark)) = (&database, watermark) {
        match database.count_logs_after(watermark).await {
            Ok(0) => println!("   ✅ Backlog: none"),
            Ok(backlog) => println!("   ⏳ Backlog: {} records waiting to be indexed", backlog),
            Err(e) => println!("   ⚠️  Backlog: Unknown - {:#}", e),
        }
    } else if log_count.is_some() {
        println!("   ⚠️  Backlog: Unknown");
    }

    println!("🔄 Sync Process:");
    let stale_after = Duration::from_secs(config.sync.interval_seconds) * LOCK_STALE_INTERVALS;
    match SyncLock::is_held(config.sync_lock_path(), stale_after).await {
        Ok(true) => println!("   🔄 Running"),
        Ok(false) => println!("   💤 Not running"),
        Err(e) => println!("   ⚠️  Unknown - {:#}", e),
    }

    println!("🤖 Ollama Status:");
    match OllamaClient::new(&config.ollama) {
        Ok(client) => match client.health_check() {
            Ok(()) => {
                println!(
                    "   ✅ Ollama: Connected ({}:{})",
                    config.ollama.host, config.ollama.port
                );
                println!("   📋 Model: {}", client.model());
            }
            Err(e) => println!("   ⚠️  Ollama: Unhealthy - {:#}", e),
        },
        Err(e) => println!("   ❌ Ollama: Failed to create client - {:#}", e),
    }

    Ok(())
}
