//! nsecache CLI: cached NSE daily bars and target/stop-loss backtests.
//!
//! Commands:
//! - `backtest` — scan one symbol's forward window from an entry date
//! - `batch` — run every row of a `date,symbol[,price,type]` CSV
//! - `fetch` — resolve a date window through the cache, print or export it
//! - `cache status` — report cached symbols, date ranges and sizes
//! - `state show|reset` — inspect or clear per-symbol done/error markers
//! - `weekday` — print the weekday of a dd-mm-yyyy date

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use nsecache_core::data::{
    write_bars_csv, CsvProvider, DataProvider, NseProvider, ParquetCache, RangeReconciler,
    SystemClock,
};
use nsecache_core::domain::{format_cli_date, parse_cli_date, weekday_name};
use nsecache_runner::{
    run_backtest, run_batch, BacktestRequest, Direction, ResultsWriter, RunContext, RunOutcome,
    RunnerConfig, ScanReport, SentinelStore, SourceKind,
};

const DEFAULT_CONFIG_FILE: &str = "nsecache.toml";

#[derive(Parser)]
#[command(
    name = "nsecache",
    about = "nsecache: NSE daily bar cache and target/stop-loss backtests"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every command. Flags override the config file.
#[derive(Args)]
struct GlobalArgs {
    /// Path to a TOML config file. Defaults to ./nsecache.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Bar cache directory.
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Directory for sentinel files and the results CSV.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Provider used to fill cache gaps: nse or csv.
    #[arg(long, global = true)]
    source: Option<String>,

    /// Directory of {SYMBOL}.csv exports (with --source csv).
    #[arg(long, global = true)]
    csv_dir: Option<PathBuf>,

    /// Offline mode: serve from the cache only.
    #[arg(long, global = true, default_value_t = false)]
    offline: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Backtest one symbol from an entry date.
    Backtest {
        /// Symbol (e.g., SBIN, TV18BRDCST).
        #[arg(long)]
        symbol: String,

        /// Entry date (dd-mm-yyyy).
        #[arg(long)]
        date: String,

        /// Entry price. 0 uses the first close in the window.
        #[arg(long, default_value_t = 0.0)]
        price: f64,

        /// Trade side: buy or sell.
        #[arg(long = "type", default_value = "buy")]
        direction: String,
    },
    /// Backtest every row of a CSV file.
    Batch {
        /// CSV with date and symbol columns (price and type optional).
        #[arg(long, default_value = "data/backtest_data.csv")]
        file: PathBuf,

        /// Trade side for rows without a type column.
        #[arg(long = "type", default_value = "buy")]
        direction: String,
    },
    /// Resolve bars for a date window through the cache.
    Fetch {
        #[arg(long)]
        symbol: String,

        /// Start date (dd-mm-yyyy).
        #[arg(long)]
        start: String,

        /// End date (dd-mm-yyyy).
        #[arg(long)]
        end: String,

        /// Write the bars to this CSV instead of printing them.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Cache management commands.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Per-symbol done/error markers.
    State {
        #[command(subcommand)]
        action: StateAction,
    },
    /// Print the weekday of a date.
    Weekday {
        /// Date (dd-mm-yyyy).
        date: String,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Report cached symbols, date ranges and sizes.
    Status,
}

#[derive(Subcommand)]
enum StateAction {
    /// Show the state of one symbol, or of every marked symbol.
    Show {
        #[arg(long)]
        symbol: Option<String>,
    },
    /// Clear a symbol's markers so it runs again.
    Reset {
        #[arg(long)]
        symbol: String,
    },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.global)?;

    match cli.command {
        Commands::Backtest {
            symbol,
            date,
            price,
            direction,
        } => run_backtest_cmd(&config, cli.global.offline, &symbol, &date, price, &direction),
        Commands::Batch { file, direction } => {
            run_batch_cmd(&config, cli.global.offline, &file, &direction)
        }
        Commands::Fetch {
            symbol,
            start,
            end,
            out,
        } => run_fetch(&config, cli.global.offline, &symbol, &start, &end, out.as_deref()),
        Commands::Cache { action } => match action {
            CacheAction::Status => run_cache_status(&config.cache_dir),
        },
        Commands::State { action } => match action {
            StateAction::Show { symbol } => run_state_show(&config, symbol.as_deref()),
            StateAction::Reset { symbol } => run_state_reset(&config, &symbol),
        },
        Commands::Weekday { date } => {
            let date = parse_cli_date(&date)?;
            println!("{}", weekday_name(date));
            Ok(())
        }
    }
}

/// Config file (explicit, or ./nsecache.toml if present), then flag overrides.
fn load_config(args: &GlobalArgs) -> Result<RunnerConfig> {
    let mut config = match &args.config {
        Some(path) => RunnerConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
            RunnerConfig::from_file(Path::new(DEFAULT_CONFIG_FILE))
                .with_context(|| format!("loading config {DEFAULT_CONFIG_FILE}"))?
        }
        None => RunnerConfig::default(),
    };

    if let Some(dir) = &args.cache_dir {
        config.cache_dir = dir.clone();
    }
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(source) = &args.source {
        config.source = source.parse()?;
    }
    if let Some(dir) = &args.csv_dir {
        config.csv_dir = dir.clone();
    }
    Ok(config)
}

fn build_provider(config: &RunnerConfig, offline: bool) -> Result<Option<Box<dyn DataProvider>>> {
    if offline {
        info!("offline mode: serving from cache only");
        return Ok(None);
    }
    let provider: Box<dyn DataProvider> = match config.source {
        SourceKind::Nse => Box::new(NseProvider::new()?),
        SourceKind::Csv => Box::new(CsvProvider::new(&config.csv_dir)),
    };
    Ok(Some(provider))
}

fn parse_direction(s: &str) -> Result<Direction> {
    s.parse::<Direction>().map_err(anyhow::Error::msg)
}

fn run_backtest_cmd(
    config: &RunnerConfig,
    offline: bool,
    symbol: &str,
    date: &str,
    price: f64,
    direction: &str,
) -> Result<()> {
    let request = BacktestRequest {
        symbol: symbol.trim().to_ascii_uppercase(),
        date: parse_cli_date(date)?,
        reference_price: price,
        direction: parse_direction(direction)?,
    };

    let cache = ParquetCache::new(&config.cache_dir);
    cache.initialize()?;
    let provider = build_provider(config, offline)?;
    let clock = SystemClock;
    let reconciler = RangeReconciler::new(&cache, provider.as_deref(), &clock);
    let state = SentinelStore::new(&config.data_dir);
    let results = ResultsWriter::new(config.results_path());
    let ctx = RunContext {
        reconciler: &reconciler,
        state: &state,
        results: &results,
        thresholds: config.thresholds,
        lookahead_weeks: config.lookahead_weeks,
    };

    match run_backtest(&request, &ctx)? {
        RunOutcome::Completed(report) => {
            print_summary(&request, &report);
            println!("Result appended to: {}", results.path().display());
        }
        RunOutcome::Skipped(status) => {
            println!(
                "Skipped {}: {status} (use `nsecache state reset --symbol {}` to rerun)",
                request.symbol, request.symbol
            );
        }
    }
    Ok(())
}

fn run_batch_cmd(config: &RunnerConfig, offline: bool, file: &Path, direction: &str) -> Result<()> {
    let direction = parse_direction(direction)?;

    let cache = ParquetCache::new(&config.cache_dir);
    cache.initialize()?;
    let provider = build_provider(config, offline)?;
    let clock = SystemClock;
    let reconciler = RangeReconciler::new(&cache, provider.as_deref(), &clock);
    let state = SentinelStore::new(&config.data_dir);
    let results = ResultsWriter::new(config.results_path());
    let ctx = RunContext {
        reconciler: &reconciler,
        state: &state,
        results: &results,
        thresholds: config.thresholds,
        lookahead_weeks: config.lookahead_weeks,
    };

    let summary = run_batch(file, direction, &ctx)?;

    println!();
    println!("=== Batch ===");
    println!("Rows:           {}", summary.total);
    println!("Completed:      {}", summary.completed);
    println!("Skipped:        {}", summary.skipped);
    println!("Failed:         {}", summary.failed);
    for (row, err) in &summary.errors {
        eprintln!("Error for {row}: {err}");
    }
    println!("Results:        {}", results.path().display());

    if !summary.all_succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

fn run_fetch(
    config: &RunnerConfig,
    offline: bool,
    symbol: &str,
    start: &str,
    end: &str,
    out: Option<&Path>,
) -> Result<()> {
    let symbol = symbol.trim().to_ascii_uppercase();
    let start = parse_cli_date(start)?;
    let end = parse_cli_date(end)?;

    let cache = ParquetCache::new(&config.cache_dir);
    cache.initialize()?;
    let provider = build_provider(config, offline)?;
    let clock = SystemClock;
    let reconciler = RangeReconciler::new(&cache, provider.as_deref(), &clock);
    let bars = reconciler.resolve(&symbol, start, end)?;

    if let Some(path) = out {
        write_bars_csv(path, &bars)?;
        println!("Wrote {} bars to {}", bars.len(), path.display());
        return Ok(());
    }

    if bars.is_empty() {
        println!("No bars for {symbol} between {} and {}", format_cli_date(start), format_cli_date(end));
        return Ok(());
    }
    println!(
        "{:<12} {:>10} {:>10} {:>10} {:>10} {:>14}",
        "Date", "Open", "High", "Low", "Close", "Volume"
    );
    println!("{}", "-".repeat(71));
    for b in &bars {
        println!(
            "{:<12} {:>10.2} {:>10.2} {:>10.2} {:>10.2} {:>14}",
            format_cli_date(b.date),
            b.open,
            b.high,
            b.low,
            b.close,
            b.volume
        );
    }
    println!("{} bars", bars.len());
    Ok(())
}

fn run_cache_status(cache_dir: &Path) -> Result<()> {
    if !cache_dir.exists() {
        println!("Cache directory does not exist: {}", cache_dir.display());
        return Ok(());
    }

    let cache = ParquetCache::new(cache_dir);
    let symbols = cache.symbols()?;
    if symbols.is_empty() {
        println!("Cache is empty: {}", cache_dir.display());
        return Ok(());
    }

    let mut total_size: u64 = 0;
    let mut rows: Vec<(String, String, String, u64)> = Vec::new();
    for symbol in &symbols {
        let (date_range, bar_count) = match cache.get_meta(symbol) {
            Some(meta) => (
                format!(
                    "{} to {}",
                    format_cli_date(meta.start_date),
                    format_cli_date(meta.end_date)
                ),
                meta.bar_count,
            ),
            None => ("(no meta)".into(), 0),
        };
        let size = dir_size(&cache_dir.join(format!("symbol={symbol}")));
        total_size += size;
        rows.push((symbol.clone(), date_range, format!("{bar_count} bars"), size));
    }

    println!("Cache: {}", cache_dir.display());
    println!("Symbols: {}", symbols.len());
    println!("Total size: {}", format_size(total_size));
    println!();
    println!("{:<12} {:<26} {:<12} {:>10}", "Symbol", "Date Range", "Bars", "Size");
    println!("{}", "-".repeat(63));
    for (sym, range, bars, size) in &rows {
        println!("{:<12} {:<26} {:<12} {:>10}", sym, range, bars, format_size(*size));
    }

    Ok(())
}

fn run_state_show(config: &RunnerConfig, symbol: Option<&str>) -> Result<()> {
    let store = SentinelStore::new(&config.data_dir);
    if let Some(symbol) = symbol {
        let symbol = symbol.trim().to_ascii_uppercase();
        println!("{symbol}: {}", store.status(&symbol)?);
        return Ok(());
    }

    let listed = store.list()?;
    if listed.is_empty() {
        println!("No symbols marked in {}", store.dir().display());
        return Ok(());
    }
    for (symbol, status) in &listed {
        println!("{symbol:<12} {status}");
    }
    Ok(())
}

fn run_state_reset(config: &RunnerConfig, symbol: &str) -> Result<()> {
    let store = SentinelStore::new(&config.data_dir);
    let symbol = symbol.trim().to_ascii_uppercase();
    if store.reset(&symbol)? {
        println!("Reset: {symbol}");
    } else {
        println!("{symbol} had no markers");
    }
    Ok(())
}

fn dir_size(path: &Path) -> u64 {
    let mut size = 0u64;
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            if let Ok(meta) = entry.metadata() {
                size += meta.len();
            }
        }
    }
    size
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

fn print_summary(request: &BacktestRequest, report: &ScanReport) {
    let levels = &report.levels;
    println!();
    println!("=== Backtest Result ===");
    println!("Symbol:         {}", request.symbol);
    println!("Date:           {}", format_cli_date(request.date));
    println!("Type:           {}", report.direction);
    println!("Price:          {:.2}", levels.price);
    println!("Stop-loss:      {:.2}", levels.stop_loss);
    println!();
    println!(
        "Near target:    {:.2}  {} ({} bars)",
        levels.near_target, report.near.outcome, report.near.bars_taken
    );
    println!(
        "Far target:     {:.2}  {} ({} bars)",
        levels.far_target, report.far.outcome, report.far.bars_taken
    );
    println!("Max adverse:    {:.2}%", report.max_adverse_pct);
    println!("Extreme 3M:     {:.2}", report.extreme_3m);
    println!("Extreme 6M:     {:.2}", report.extreme_6m);
    println!();
}
