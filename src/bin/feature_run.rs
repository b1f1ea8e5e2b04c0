//! Feature Pipeline CLI
//!
//! Operator entrypoint for daily and backfill runs, freezes, exports and
//! estimation over published snapshots.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin feature_run -- run --start 2024-03-01 --end 2024-03-07
//! cargo run --release --bin feature_run -- --config prod.toml run --start 2024-03-08 --end 2024-03-08 --frozen
//! cargo run --release --bin feature_run -- run --start 2024-03-08 --end 2024-03-08 --fail-on-warnings
//! cargo run --release --bin feature_run -- freeze --pool univ3_weth_usdc_5 --date 2024-03-01
//! cargo run --release --bin feature_run -- export --pool univ3_weth_usdc_5 --start 2024-03-01 --end 2024-03-07
//! cargo run --release --bin feature_run -- estimate --pool univ3_weth_usdc_5 --start 2024-03-01 --end 2024-03-01 --smooth
//! cargo run --release --bin feature_run -- basis --start 2024-03-01 --end 2024-03-07
//! ```
//!
//! # Exit Codes
//!
//! - 0: run succeeded (with or without warnings)
//! - 1: run failed, including any warning under `--fail-on-warnings`
//! - 2: configuration or storage error before the run started

use anyhow::{Context, Result};
use basisband_backend::estimator::estimate_pool;
use basisband_backend::pipeline::basis::{basis_pair, basis_spread_view};
use basisband_backend::pipeline::clock::{date_range, datetime_to_nanos, day_bounds};
use basisband_backend::pipeline::config::{OutputMode, PipelineConfig, SourceMode, CONFIG_PATH_ENV};
use basisband_backend::pipeline::events::SourceDomain;
use basisband_backend::pipeline::export::{export_snapshots, ExportRequest, ExportView};
use basisband_backend::pipeline::fingerprint::config_fingerprint;
use basisband_backend::pipeline::revision::RevisionManager;
use basisband_backend::pipeline::runner::PipelineRunner;
use basisband_backend::pipeline::sources::{build_source, LandedJsonSource, SourceAdapter, SyntheticSource};
use basisband_backend::pipeline::store::{RunStatus, SnapshotStore};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "feature_run")]
#[command(about = "Basis-band feature pipeline: run, freeze, export, estimate, basis")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = CONFIG_PATH_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Process a window of UTC dates (plus the trailing reprocess window)
    Run {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        /// Publish frozen partitions instead of provisional ones
        #[arg(long)]
        frozen: bool,
        /// Read previously landed raw files instead of the configured source
        #[arg(long)]
        landed: bool,
        /// Fail the run, publishing nothing further, on any validation warning
        #[arg(long)]
        fail_on_warnings: bool,
        /// Write the run report here as well as to the store
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Freeze the current provisional version of a partition
    Freeze {
        #[arg(long)]
        pool: String,
        #[arg(long)]
        date: NaiveDate,
    },

    /// Export current snapshots of a pool to JSON with metadata
    Export {
        #[arg(long)]
        pool: String,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        /// Export the forward-filled robustness view
        #[arg(long)]
        robust: bool,
        /// Output directory (defaults to export_dir)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Run the latent state filter over published rows
    Estimate {
        #[arg(long)]
        pool: String,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        /// Also run the RTS smoother
        #[arg(long)]
        smooth: bool,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Per-minute wedge spread between the widest and narrowest fee tier pools
    Basis {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Land synthetic raw events under raw_dir for later landed-mode runs
    Land {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
    },

    /// Show current partitions and store counts
    Status,
}

fn load_config(path: Option<&PathBuf>) -> Result<PipelineConfig> {
    match path {
        Some(p) => PipelineConfig::load(p).with_context(|| format!("loading config {}", p.display())),
        None => Ok(PipelineConfig::from_env()),
    }
}

fn open_store(config: &PipelineConfig) -> Result<SnapshotStore> {
    SnapshotStore::new(&config.store_path)
        .with_context(|| format!("opening store {}", config.store_path.display()))
}

fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("feature_run=info,basisband_backend=info")),
        )
        .init();

    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {:#}", e);
            std::process::exit(2);
        }
    }
}

fn dispatch(cli: Cli) -> Result<i32> {
    let mut config = load_config(cli.config.as_ref())?;
    match cli.command {
        Commands::Run { start, end, frozen, landed, fail_on_warnings, report } => {
            if frozen {
                config.output_mode = OutputMode::Frozen;
            }
            if landed {
                config.source_mode = SourceMode::Landed;
            }
            if fail_on_warnings {
                config.validation.fail_on_warnings = true;
            }
            run(config, start, end, report)
        }
        Commands::Freeze { pool, date } => {
            let manager = RevisionManager::new(open_store(&config)?);
            let now = datetime_to_nanos(&Utc::now());
            let info = manager.freeze("manual-freeze", &pool, date, now)?;
            println!("frozen {}/{} as version {}", pool, date, info.version);
            Ok(0)
        }
        Commands::Export { pool, start, end, robust, out } => {
            let store = open_store(&config)?;
            let fingerprint = config_fingerprint(&config)?;
            let req = ExportRequest {
                pool_key: &pool,
                first: start,
                last: end,
                view: if robust { ExportView::Robustness } else { ExportView::Primary },
                robustness: &config.robustness,
                config_fingerprint: &fingerprint,
            };
            let dir = out.unwrap_or_else(|| config.export_dir.clone());
            let meta = export_snapshots(&store, &req, &dir)?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
            Ok(0)
        }
        Commands::Estimate { pool, start, end, smooth, output } => {
            let store = open_store(&config)?;
            let rows = store.history_rows(&pool, start, end)?;
            if rows.is_empty() {
                anyhow::bail!("no published rows for {} in {}..={}", pool, start, end);
            }
            let estimate = estimate_pool(&pool, &rows, &config.filter, smooth);
            let json = serde_json::to_string_pretty(&estimate)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
                    info!(path = %path.display(), minutes = estimate.filtered.len(), "estimate written");
                }
                None => println!("{}", json),
            }
            Ok(0)
        }
        Commands::Basis { start, end, output } => {
            let store = open_store(&config)?;
            let (narrow, wide) = basis_pair(&config)
                .context("basis spread needs two fee tiers quoting the same CEX symbol")?;
            let rows = basis_spread_view(&store, narrow, wide, start, end)?;
            let json = serde_json::to_string_pretty(&rows)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
                    info!(path = %path.display(), minutes = rows.len(), "basis spread written");
                }
                None => println!("{}", json),
            }
            Ok(0)
        }
        Commands::Land { start, end } => {
            let synthetic = SyntheticSource::new(config.synthetic_seed, config.pools.clone());
            let landed = LandedJsonSource::new(&config.raw_dir);
            let mut total = 0;
            for date in date_range(start, end) {
                let (from, to) = day_bounds(date);
                for domain in SourceDomain::ALL {
                    total += landed.land(&synthetic.fetch(domain, from, to)?)?;
                }
            }
            println!("landed {} events under {}", total, config.raw_dir.display());
            Ok(0)
        }
        Commands::Status => {
            let store = open_store(&config)?;
            for p in store.current_partitions()? {
                println!(
                    "{:<24} {}  v{:<3} {:<11} rows={} hash={}",
                    p.pool_key,
                    p.partition_date,
                    p.version,
                    p.status.as_str(),
                    p.row_count,
                    &p.content_hash[..12.min(p.content_hash.len())]
                );
            }
            println!("{:?}", store.stats()?);
            Ok(0)
        }
    }
}

fn run(config: PipelineConfig, start: NaiveDate, end: NaiveDate, report_path: Option<PathBuf>) -> Result<i32> {
    let source: Arc<dyn SourceAdapter> = build_source(&config, None)?;
    let manager = Arc::new(RevisionManager::new(open_store(&config)?));
    let runner = PipelineRunner::new(config, source, manager);

    let report = runner.run(start, end)?;
    if let Some(path) = report_path {
        std::fs::write(&path, report.to_json()?).with_context(|| format!("writing {}", path.display()))?;
    }

    println!(
        "run {} {}: {} rows, {} published, {} unchanged, {} revisions",
        report.run_id,
        report.status.as_str(),
        report.rows_emitted,
        report.partitions_published,
        report.partitions_unchanged,
        report.revision_count
    );
    for (issue, n) in &report.issues {
        warn!(issue = %issue, count = n, "run issue");
    }
    Ok(if report.status == RunStatus::Failed { 1 } else { 0 })
}
