//! ReportDeck CLI: load datasets, compute metrics, and manage the cache.
//!
//! Commands:
//! - `load`: resolve dataset keys through cache, extraction and fallback
//! - `compute`: load a metric's inputs and compute it
//! - `cache status`: report tier sizes and hit/miss counters
//! - `cache invalidate`: drop one key from both tiers

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use reportdeck_core::CsvDocumentSource;
use reportdeck_runner::{
    DeckConfig, LoadOptions, LoadResult, MetricResult, MetricStatus, MetricValue, ReportDeck,
};

#[derive(Parser)]
#[command(
    name = "reportdeck",
    about = "ReportDeck CLI: cached, fault-tolerant dataset loading for report views"
)]
struct Cli {
    /// Path to a TOML config file. Environment variables override it.
    #[arg(long, global = true, env = "REPORTDECK_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the source documents (CSV).
    #[arg(long, global = true, default_value = "documents")]
    documents: PathBuf,

    /// Print machine-readable JSON instead of a table.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve dataset keys.
    Load {
        /// Dataset keys (e.g., sector_2025 firm_size).
        #[arg(required = true)]
        keys: Vec<String>,

        /// Skip cache reads and extract again.
        #[arg(long, default_value_t = false)]
        force: bool,

        /// Batch deadline in milliseconds. Defaults to the configured value.
        #[arg(long)]
        deadline_ms: Option<u64>,
    },
    /// Load the inputs of a catalogued metric and compute it.
    Compute {
        /// Metric name (e.g., adoptionDelta).
        metric: String,
    },
    /// Cache management commands.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Report tier sizes and counters.
    Status,
    /// Remove a key from memory and disk.
    Invalidate {
        key: String,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = load_config(cli.config.as_ref())?;
    let source = Arc::new(CsvDocumentSource::new(&cli.documents));
    let deck = ReportDeck::open(&config, source).context("failed to open report deck")?;

    let outcome = match cli.command {
        Commands::Load {
            keys,
            force,
            deadline_ms,
        } => {
            let options = LoadOptions {
                force_refresh: force,
                deadline: deadline_ms.map(Duration::from_millis),
            };
            let result = deck.load_with(&keys, &options);
            print_load(&result, cli.json);
            Ok(())
        }
        Commands::Compute { metric } => {
            let (loaded, result) = deck.load_and_compute(&metric);
            if !cli.json {
                print_load(&loaded, false);
            }
            print_metric(&result, cli.json);
            Ok(())
        }
        Commands::Cache { action } => match action {
            CacheAction::Status => {
                print_cache_status(&deck, cli.json);
                Ok(())
            }
            CacheAction::Invalidate { key } => deck
                .invalidate(&key)
                .map(|removed| {
                    if cli.json {
                        println!("{}", json!({ "key": key, "removed": removed }));
                    } else if removed {
                        println!("Invalidated: {key}");
                    } else {
                        println!("Not cached: {key}");
                    }
                })
                .with_context(|| format!("failed to invalidate '{key}'")),
        },
    };

    // Queued disk writes land before exit.
    deck.shutdown();
    outcome
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("reportdeck_core=info,reportdeck_runner=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<DeckConfig> {
    let mut config = match path {
        Some(path) => DeckConfig::from_file(path)
            .with_context(|| format!("failed to read config {}", path.display()))?,
        None => DeckConfig::default(),
    };
    config.apply_env_overrides()?;
    debug!(?config, "configuration resolved");
    Ok(config)
}

fn print_load(result: &LoadResult, as_json: bool) {
    if as_json {
        let keys: serde_json::Map<String, serde_json::Value> = result
            .iter()
            .map(|(key, outcome)| {
                let view = json!({
                    "status": outcome.status.label(),
                    "reason": outcome.status.reason(),
                    "rows": outcome.dataset.as_ref().map(|d| d.len()),
                    "fresh_at": outcome.dataset.as_ref().map(|d| d.fresh_at().to_rfc3339()),
                });
                (key.to_string(), view)
            })
            .collect();
        let report = json!({
            "elapsed_ms": result.elapsed().as_millis() as u64,
            "counts": result.counts(),
            "keys": keys,
        });
        println!("{report}");
        return;
    }

    println!();
    println!("{:<24} {:<12} {:>6}  Reason", "Key", "Status", "Rows");
    println!("{}", "-".repeat(60));
    for (key, outcome) in result.iter() {
        let rows = outcome
            .dataset
            .as_ref()
            .map(|d| d.len().to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<24} {:<12} {:>6}  {}",
            key,
            outcome.status.label(),
            rows,
            outcome.status.reason().unwrap_or("")
        );
    }
    println!();
    println!(
        "{} key(s) in {} ms",
        result.len(),
        result.elapsed().as_millis()
    );
}

fn print_metric(result: &MetricResult, as_json: bool) {
    if as_json {
        println!("{}", json!(result));
        return;
    }

    println!();
    println!("=== {} ===", result.name);
    let status = match result.status {
        MetricStatus::Ok => "ok",
        MetricStatus::Fallback => "fallback",
        MetricStatus::Error => "error",
    };
    println!("Status:  {status}");
    match &result.value {
        Some(MetricValue::Scalar(v)) => println!("Value:   {v:.4}"),
        Some(MetricValue::Series(vs)) => {
            let shown: Vec<String> = vs.iter().map(|v| format!("{v:.4}")).collect();
            println!("Value:   [{}]", shown.join(", "));
        }
        None => println!("Value:   (none)"),
    }
    if let Some(reason) = &result.reason {
        println!("Reason:  {reason}");
    }
}

fn print_cache_status(deck: &ReportDeck, as_json: bool) {
    let status = deck.cache_status();
    if as_json {
        println!("{}", json!(status));
        return;
    }

    println!("Cache: {}", status.disk_dir);
    println!(
        "Memory: {}/{} entries, TTL {}s",
        status.memory_entries, status.memory_capacity, status.memory_ttl_secs
    );
    println!(
        "Disk:   {} entries, {} of {}",
        status.disk_entries,
        format_size(status.disk_bytes),
        format_size(status.disk_max_bytes)
    );
    let s = status.stats;
    println!();
    println!(
        "Hits: {} memory, {} disk   Misses: {}   Expired: {}",
        s.memory_hits, s.disk_hits, s.misses, s.expirations
    );
    println!(
        "Evictions: {} memory, {} disk   Write failures: {}",
        s.memory_evictions, s.disk_evictions, s.write_failures
    );
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
