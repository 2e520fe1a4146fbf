//! Batch driver: run every request listed in a CSV file.
//!
//! The file needs `date` (dd-mm-yyyy) and `symbol` columns; `price` and
//! `type` are optional and default to 0 (first close) and the caller's
//! direction. Rows fail independently: a bad row or a failed run is logged
//! and counted, and the batch moves on.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

use nsecache_core::domain::parse_cli_date;

use crate::runner::{run_backtest, BacktestRequest, RunContext, RunOutcome};
use crate::scanner::Direction;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("failed to read batch file {path}: {source}")]
    Read { path: String, source: csv::Error },
}

#[derive(Debug, Deserialize)]
struct BatchRow {
    #[serde(alias = "Date")]
    date: String,
    #[serde(alias = "Symbol")]
    symbol: String,
    #[serde(default, alias = "Price")]
    price: Option<f64>,
    #[serde(default, rename = "type", alias = "Type")]
    direction: Option<String>,
}

impl BatchRow {
    fn into_request(self, default_direction: Direction) -> Result<BacktestRequest, String> {
        let date = parse_cli_date(&self.date).map_err(|e| e.to_string())?;
        let direction = match self.direction.as_deref().map(str::trim) {
            None | Some("") => default_direction,
            Some(s) => s.parse()?,
        };
        let symbol = self.symbol.trim().to_ascii_uppercase();
        if symbol.is_empty() {
            return Err("empty symbol".into());
        }
        let request = BacktestRequest {
            symbol,
            date,
            reference_price: self.price.unwrap_or(0.0),
            direction,
        };
        request.validate().map_err(|e| e.to_string())?;
        Ok(request)
    }
}

/// Summary of a batch run.
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub total: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    /// `(row label, error)` for every failed row.
    pub errors: Vec<(String, String)>,
}

impl BatchSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    fn fail(&mut self, label: String, reason: String) {
        warn!(row = %label, error = %reason, "batch row failed");
        self.failed += 1;
        self.errors.push((label, reason));
    }
}

/// Read the requests in `path` and run them one after another.
///
/// Only an unreadable file is an error; everything row-level ends up in
/// the returned summary.
pub fn run_batch(
    path: &Path,
    default_direction: Direction,
    ctx: &RunContext<'_>,
) -> Result<BatchSummary, BatchError> {
    let read_err = |source| BatchError::Read {
        path: path.display().to_string(),
        source,
    };
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(read_err)?;

    let mut summary = BatchSummary::default();
    for (i, rec) in rdr.deserialize::<BatchRow>().enumerate() {
        summary.total += 1;
        let line = i + 2;

        let request = match rec {
            Ok(row) => row.into_request(default_direction),
            Err(e) => Err(e.to_string()),
        };
        let request = match request {
            Ok(request) => request,
            Err(reason) => {
                summary.fail(format!("line {line}"), reason);
                continue;
            }
        };

        let label = format!("{} {}", request.symbol, request.date);
        match run_backtest(&request, ctx) {
            Ok(RunOutcome::Completed(_)) => summary.completed += 1,
            Ok(RunOutcome::Skipped(_)) => summary.skipped += 1,
            Err(e) => summary.fail(label, e.to_string()),
        }
    }

    info!(
        total = summary.total,
        completed = summary.completed,
        skipped = summary.skipped,
        failed = summary.failed,
        "batch finished"
    );
    Ok(summary)
}
