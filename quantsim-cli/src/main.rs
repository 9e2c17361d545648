//! QuantSim CLI: download, validate and inspect daily OHLCV data.
//!
//! Commands:
//! - `download`: fetch from Alpha Vantage, validate, and persist to SQLite
//! - `validate`: audit a CSV file or stored bars without fetching
//! - `seed`: validate a CSV file and store its bars (benchmark indices)
//! - `breaker`: show per-ticker circuit breaker state
//! - `bars`: print stored bars for a ticker

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use quantsim_core::data::validator::issue_date;
use quantsim_core::data::{
    bars_to_frame, load_csv_bars, AlphaVantageFetcher, DataValidator, IngestOutcome,
    IngestionController, ReqwestTransport, SeriesImporter, ThreadSleeper,
};
use quantsim_core::domain::{date_to_timestamp, PriceBar};
use quantsim_core::storage::{SqliteStorage, Storage, StorageError};
use quantsim_core::{Clock, QuantsimConfig, SystemClock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_CONFIG: &str = "quantsim.toml";

#[derive(Parser)]
#[command(
    name = "quantsim",
    about = "QuantSim: resilient daily OHLCV ingestion and data-quality audit"
)]
struct Cli {
    /// Path to a TOML config file. Defaults to ./quantsim.toml when present.
    #[arg(long, global = true, env = "QUANTSIM_CONFIG")]
    config: Option<PathBuf>,

    /// Debug-level logging (ignored when RUST_LOG is set).
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download daily bars, validate them, and store them.
    Download {
        /// Tickers to download (e.g., IBM MSFT). Processed one at a time.
        #[arg(required = true)]
        tickers: Vec<String>,

        /// Start date (YYYY-MM-DD). Defaults to one year ago.
        #[arg(long)]
        start: Option<String>,

        /// End date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        end: Option<String>,
    },
    /// Audit a series for gaps, outliers and stale prices without fetching.
    Validate {
        /// Ticker the issues are recorded under.
        ticker: String,

        /// CSV file with date/timestamp, open, high, low, close, volume columns.
        /// Without it, stored bars are audited.
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Start date for stored bars (YYYY-MM-DD).
        #[arg(long)]
        start: Option<String>,

        /// End date for stored bars (YYYY-MM-DD).
        #[arg(long)]
        end: Option<String>,

        /// Print the report as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Validate bars from a CSV file and store them under a ticker.
    Seed {
        /// Ticker the bars are stored under (e.g., NIFTY50).
        ticker: String,

        /// CSV file with date/timestamp, open, high, low, close, volume columns.
        csv: PathBuf,
    },
    /// Show circuit breaker state for tickers.
    Breaker {
        #[arg(required = true)]
        tickers: Vec<String>,
    },
    /// Print stored bars for a ticker.
    Bars {
        ticker: String,

        #[arg(long)]
        start: Option<String>,

        #[arg(long)]
        end: Option<String>,
    },
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(cli.config.as_deref())?;
    debug!(db = %config.database_path.display(), "config loaded");

    match cli.command {
        Commands::Download {
            tickers,
            start,
            end,
        } => run_download(&config, &tickers, start, end),
        Commands::Validate {
            ticker,
            csv,
            start,
            end,
            json,
        } => run_validate(&config, &ticker, csv.as_deref(), start, end, json),
        Commands::Seed { ticker, csv } => run_seed(&config, &ticker, &csv),
        Commands::Breaker { tickers } => run_breaker(&config, &tickers),
        Commands::Bars { ticker, start, end } => run_bars(&config, &ticker, start, end),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "quantsim_core=debug,quantsim_cli=debug"
    } else {
        "quantsim_core=info,quantsim_cli=info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: Option<&Path>) -> Result<QuantsimConfig> {
    let config = match path {
        Some(path) => QuantsimConfig::from_file(path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => {
            QuantsimConfig::from_file(Path::new(DEFAULT_CONFIG))?
        }
        None => QuantsimConfig::from_env()?,
    };
    Ok(config)
}

fn parse_date(raw: Option<String>, default: NaiveDate) -> Result<NaiveDate> {
    raw.as_deref()
        .map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .transpose()
        .context("dates must be YYYY-MM-DD")
        .map(|d| d.unwrap_or(default))
}

fn open_storage(config: &QuantsimConfig) -> Result<Arc<SqliteStorage>> {
    let storage = SqliteStorage::open(&config.database_path).with_context(|| {
        format!("open database {}", config.database_path.display())
    })?;
    Ok(Arc::new(storage))
}

fn controller(
    config: &QuantsimConfig,
    storage: Arc<SqliteStorage>,
    clock: Arc<dyn Clock>,
) -> Result<IngestionController> {
    let transport = ReqwestTransport::new(
        Duration::from_secs(config.api.connect_timeout_secs),
        Duration::from_secs(config.api.timeout_secs),
    )?;
    let fetcher = AlphaVantageFetcher::new(
        config,
        Arc::new(transport),
        Arc::new(ThreadSleeper),
        clock.clone(),
    )?;
    Ok(IngestionController::new(config, storage, Arc::new(fetcher), clock))
}

fn run_download(
    config: &QuantsimConfig,
    tickers: &[String],
    start: Option<String>,
    end: Option<String>,
) -> Result<()> {
    let today = chrono::Utc::now().date_naive();
    let start_date = parse_date(start, today - chrono::Duration::days(365))?;
    let end_date = parse_date(end, today)?;

    let storage = open_storage(config)?;
    let controller = controller(config, storage, Arc::new(SystemClock))?;

    let mut not_completed = 0usize;
    for (i, ticker) in tickers.iter().enumerate() {
        println!("[{}/{}] {ticker}", i + 1, tickers.len());
        match controller.download(ticker, start_date, end_date)? {
            IngestOutcome::Completed(report) => {
                println!(
                    "  OK: {} bars ({} new) in {} attempt(s), {} issue(s), quality {:.2}",
                    report.bars,
                    report.inserted,
                    report.attempts,
                    report.quality.total(),
                    report.quality_score
                );
            }
            IngestOutcome::Skipped(reason) => {
                println!("  SKIPPED: {reason}");
                not_completed += 1;
            }
            IngestOutcome::Failed(err) => {
                println!("  FAILED: {err}");
                not_completed += 1;
            }
        }
    }

    info!(total = tickers.len(), not_completed, "download batch finished");
    if not_completed > 0 {
        eprintln!("\n{not_completed}/{} ticker(s) did not complete", tickers.len());
        std::process::exit(1);
    }
    Ok(())
}

fn run_validate(
    config: &QuantsimConfig,
    ticker: &str,
    csv: Option<&Path>,
    start: Option<String>,
    end: Option<String>,
    json: bool,
) -> Result<()> {
    let storage = open_storage(config)?;
    let bars: Vec<PriceBar> = match csv {
        Some(path) => load_csv_bars(path, ticker)?,
        None => stored_bars(storage.as_ref(), ticker, start, end)?,
    };
    if bars.is_empty() {
        bail!("no bars to validate for '{ticker}'");
    }

    let summary = DataValidator::new(storage).validate(
        ticker,
        &bars,
        &config.validation.price_fields,
    )?;
    let score = summary.report.quality_score()?;

    if json {
        let value = serde_json::json!({
            "ticker": summary.ticker,
            "bars": summary.bars,
            "report": summary.report,
            "quality_score": score,
            "issues": summary.issues,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("{ticker}: {} bars", summary.bars);
    println!("  gaps:     {}", summary.report.gap_count);
    println!("  outliers: {}", summary.report.outlier_count);
    println!("  stale:    {}", summary.report.stale_count);
    println!("  quality:  {score:.2}");
    for issue in &summary.issues {
        let date = issue_date(issue)
            .map(|d| d.to_string())
            .unwrap_or_else(|| issue.date.to_string());
        println!("  {date} {:<12} {}", issue.issue_type.as_str(), issue.description);
    }
    Ok(())
}

fn run_seed(config: &QuantsimConfig, ticker: &str, csv: &Path) -> Result<()> {
    let bars = load_csv_bars(csv, ticker).with_context(|| format!("load {}", csv.display()))?;
    if bars.is_empty() {
        bail!("{} has no rows", csv.display());
    }

    let storage = open_storage(config)?;
    let report = SeriesImporter::new(config, storage).import(ticker, &bars)?;
    println!(
        "{ticker}: {} bars ({} new), {} issue(s), quality {:.2}",
        report.bars,
        report.inserted,
        report.quality.total(),
        report.quality_score
    );
    Ok(())
}

fn run_breaker(config: &QuantsimConfig, tickers: &[String]) -> Result<()> {
    let storage = open_storage(config)?;
    for ticker in tickers {
        match storage.get_circuit_state(ticker) {
            Ok(record) => {
                let last = record
                    .last_failure_time
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{ticker}: {} (failures: {}, last failure: {last})",
                    record.state, record.failure_count
                );
            }
            Err(StorageError::NotFound { .. }) => println!("{ticker}: no record (closed)"),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn run_bars(
    config: &QuantsimConfig,
    ticker: &str,
    start: Option<String>,
    end: Option<String>,
) -> Result<()> {
    let storage = open_storage(config)?;
    let bars = stored_bars(storage.as_ref(), ticker, start, end)?;
    if bars.is_empty() {
        println!("No stored bars for {ticker}");
        return Ok(());
    }
    println!("{}", bars_to_frame(&bars)?);
    Ok(())
}

fn stored_bars(
    storage: &dyn Storage,
    ticker: &str,
    start: Option<String>,
    end: Option<String>,
) -> Result<Vec<PriceBar>> {
    let start_ts = match start {
        Some(_) => date_to_timestamp(parse_date(start, NaiveDate::MIN)?),
        None => i64::MIN,
    };
    let end_ts = match end {
        Some(_) => date_to_timestamp(parse_date(end, NaiveDate::MAX)?),
        None => i64::MAX,
    };
    Ok(storage.get_historical_bars(ticker, start_ts, end_ts)?)
}
