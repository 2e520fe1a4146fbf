//! Data provider trait and structured error types.
//!
//! The DataProvider trait abstracts over data sources (NSE archive API, CSV
//! exports) so the reconciler can be driven by a fake in tests.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Bar;

/// Structured error types for data operations.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("data source unavailable (HTTP {status}): {detail}")]
    SourceUnavailable { status: u16, detail: String },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("cache error: {0}")]
    CacheError(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("parquet I/O error: {0}")]
    ParquetError(String),

    #[error("invalid date {0}")]
    InvalidDate(String),
}

/// Result of a successful data fetch for a single symbol.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub symbol: String,
    pub bars: Vec<Bar>,
    pub source: DataSource,
}

/// Where the data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    NseArchive,
    CsvImport,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::NseArchive => "nse_archive",
            DataSource::CsvImport => "csv_import",
        }
    }
}

/// Trait for data providers (NSE archive, CSV import, etc).
///
/// Providers don't know about the cache; the reconciler sits above this trait.
/// Calls block until the source answers and failures are returned as-is.
pub trait DataProvider {
    /// Human-readable name of this provider.
    fn name(&self) -> &str;

    /// Fetch daily bars for a symbol over `[start, end]`.
    fn fetch(&self, symbol: &str, start: NaiveDate, end: NaiveDate)
        -> Result<FetchResult, DataError>;
}
