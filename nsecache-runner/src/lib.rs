//! nsecache runner: backtests over cached NSE bars.
//!
//! This crate builds on `nsecache-core` to provide:
//! - Forward scanner for near/far profit targets and a stop-loss
//! - Sentinel-file state so finished or failed symbols are not rerun
//! - Append-only results CSV
//! - Single-run and batch orchestration
//! - TOML configuration

pub mod batch;
pub mod config;
pub mod results;
pub mod runner;
pub mod scanner;
pub mod state;

pub use batch::{run_batch, BatchError, BatchSummary};
pub use config::{ConfigError, RunnerConfig, SourceKind};
pub use results::{ResultsError, ResultsWriter, RESULTS_HEADER};
pub use runner::{run_backtest, BacktestRequest, RunContext, RunError, RunOutcome};
pub use scanner::{
    scan, Direction, ScanReport, TargetOutcome, TargetResult, Thresholds, TradeLevels,
};
pub use state::{SentinelStore, SymbolStatus};
