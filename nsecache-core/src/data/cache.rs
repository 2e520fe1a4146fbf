//! Parquet bar cache with Hive-style partitioning.
//!
//! Layout: `{cache_dir}/symbol={SYMBOL}/{year}.parquet`
//!
//! Features:
//! - Range queries that only touch the year partitions overlapping the range
//! - Upsert keyed on (symbol, date): a re-fetched day replaces the cached row
//! - Atomic writes (write to .tmp, rename into place)
//! - Quarantine for corrupt files ({filename}.quarantined)
//! - Metadata sidecar per symbol (hash, date range, source)

use super::provider::{DataError, DataSource};
use crate::domain::Bar;
use chrono::{Datelike, NaiveDate};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Metadata sidecar for a cached symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMeta {
    pub symbol: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub bar_count: usize,
    pub data_hash: String,
    pub source: String,
    pub cached_at: chrono::NaiveDateTime,
}

/// Row counts produced by an upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    /// Days that were not cached before.
    pub inserted: usize,
    /// Days whose cached row was replaced.
    pub replaced: usize,
}

/// The Parquet cache.
///
/// Constructed explicitly and handed to whoever needs it; nothing about the
/// store is global, so tests can point separate handles at separate temp dirs.
pub struct ParquetCache {
    cache_dir: PathBuf,
}

impl ParquetCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    /// Root directory of the cache.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Make sure the cache directory exists. Safe to call any number of times.
    pub fn initialize(&self) -> Result<(), DataError> {
        if self.cache_dir.is_dir() {
            return Ok(());
        }
        info!(dir = %self.cache_dir.display(), "creating bar cache directory");
        fs::create_dir_all(&self.cache_dir).map_err(|e| {
            DataError::CacheError(format!(
                "failed to create cache dir {}: {e}",
                self.cache_dir.display()
            ))
        })
    }

    /// Directory for a specific symbol: `{cache_dir}/symbol={SYMBOL}/`
    fn symbol_dir(&self, symbol: &str) -> PathBuf {
        self.cache_dir.join(format!("symbol={symbol}"))
    }

    /// Path to the Parquet file for a symbol+year: `{cache_dir}/symbol={SYMBOL}/{year}.parquet`
    fn year_path(&self, symbol: &str, year: i32) -> PathBuf {
        self.symbol_dir(symbol).join(format!("{year}.parquet"))
    }

    /// Path to the metadata sidecar for a symbol.
    fn meta_path(&self, symbol: &str) -> PathBuf {
        self.symbol_dir(symbol).join("meta.json")
    }

    /// All cached bars for `symbol` dated within `[start, end]`, ascending.
    ///
    /// An uncached symbol or an inverted range yields an empty vector.
    pub fn query(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>, DataError> {
        if end < start {
            return Ok(Vec::new());
        }

        let mut bars = Vec::new();
        for year in start.year()..=end.year() {
            let path = self.year_path(symbol, year);
            bars.extend(
                self.load_partition(&path)?
                    .into_iter()
                    .filter(|b| b.within(start, end)),
            );
        }
        bars.sort_by_key(|b| b.date);
        debug!(symbol, %start, %end, rows = bars.len(), "cache query");
        Ok(bars)
    }

    /// Load every cached bar for a symbol, sorted by date ascending.
    pub fn load(&self, symbol: &str) -> Result<Vec<Bar>, DataError> {
        let sym_dir = self.symbol_dir(symbol);
        if !sym_dir.exists() {
            return Ok(Vec::new());
        }

        let entries =
            fs::read_dir(&sym_dir).map_err(|e| DataError::CacheError(format!("read dir: {e}")))?;

        let mut all_bars = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| DataError::CacheError(format!("dir entry: {e}")))?;
            let path = entry.path();

            // Skip non-parquet files (meta.json, .quarantined, etc)
            if path.extension().and_then(|e| e.to_str()) != Some("parquet") {
                continue;
            }
            all_bars.extend(self.load_partition(&path)?);
        }

        all_bars.sort_by_key(|b| b.date);
        Ok(all_bars)
    }

    /// Merge bars into the cache.
    ///
    /// Rows are grouped by (symbol, year) and merged with the existing
    /// partition keyed by date. An incoming row replaces a cached row for the
    /// same day, so a symbol never holds two bars for one date.
    pub fn upsert(&self, bars: &[Bar], source: DataSource) -> Result<UpsertStats, DataError> {
        if bars.is_empty() {
            return Ok(UpsertStats::default());
        }
        self.initialize()?;

        let mut by_partition: BTreeMap<(&str, i32), Vec<&Bar>> = BTreeMap::new();
        for bar in bars {
            by_partition
                .entry((bar.symbol.as_str(), bar.date.year()))
                .or_default()
                .push(bar);
        }

        let mut stats = UpsertStats::default();
        let mut touched: BTreeSet<&str> = BTreeSet::new();

        for ((symbol, year), incoming) in by_partition {
            let sym_dir = self.symbol_dir(symbol);
            fs::create_dir_all(&sym_dir)
                .map_err(|e| DataError::CacheError(format!("failed to create dir: {e}")))?;

            let path = self.year_path(symbol, year);
            let mut merged: BTreeMap<NaiveDate, Bar> = self
                .load_partition(&path)?
                .into_iter()
                .map(|b| (b.date, b))
                .collect();

            for bar in incoming {
                match merged.insert(bar.date, bar.clone()) {
                    Some(_) => stats.replaced += 1,
                    None => stats.inserted += 1,
                }
            }

            let rows: Vec<&Bar> = merged.values().collect();
            let df = bars_to_dataframe(&rows)?;
            let tmp_path = path.with_extension("parquet.tmp");
            write_parquet(&df, &tmp_path)?;

            // Atomic rename
            fs::rename(&tmp_path, &path).map_err(|e| {
                let _ = fs::remove_file(&tmp_path);
                DataError::CacheError(format!("atomic rename failed: {e}"))
            })?;
            touched.insert(symbol);
        }

        for symbol in touched {
            self.refresh_meta(symbol, source)?;
        }

        debug!(
            inserted = stats.inserted,
            replaced = stats.replaced,
            "cache upsert"
        );
        Ok(stats)
    }

    /// Rewrite the metadata sidecar from the symbol's partitions.
    fn refresh_meta(&self, symbol: &str, source: DataSource) -> Result<(), DataError> {
        let bars = self.load(symbol)?;
        let (Some(first), Some(last)) = (bars.first(), bars.last()) else {
            return Ok(());
        };

        let meta = CacheMeta {
            symbol: symbol.to_string(),
            start_date: first.date,
            end_date: last.date,
            bar_count: bars.len(),
            data_hash: blake3::hash(
                &serde_json::to_vec(&bars)
                    .map_err(|e| DataError::CacheError(format!("hash serialization: {e}")))?,
            )
            .to_hex()
            .to_string(),
            source: source.as_str().to_string(),
            cached_at: chrono::Local::now().naive_local(),
        };
        let meta_json = serde_json::to_string_pretty(&meta)
            .map_err(|e| DataError::CacheError(format!("meta serialization: {e}")))?;
        fs::write(self.meta_path(symbol), meta_json)
            .map_err(|e| DataError::CacheError(format!("meta write: {e}")))?;
        Ok(())
    }

    /// Read one partition. Missing files are empty; corrupt files are quarantined.
    fn load_partition(&self, path: &Path) -> Result<Vec<Bar>, DataError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        match load_and_validate_parquet(path) {
            Ok(bars) => Ok(bars),
            Err(e) => {
                let quarantine = path.with_extension("parquet.quarantined");
                warn!(
                    file = %path.display(),
                    error = %e,
                    "quarantining corrupt cache file"
                );
                let _ = fs::rename(path, &quarantine);
                Ok(Vec::new())
            }
        }
    }

    /// Check if a symbol has cached data and return its metadata.
    pub fn get_meta(&self, symbol: &str) -> Option<CacheMeta> {
        let content = fs::read_to_string(self.meta_path(symbol)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Symbols that have a partition directory in the cache, sorted.
    pub fn symbols(&self) -> Result<Vec<String>, DataError> {
        if !self.cache_dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.cache_dir)
            .map_err(|e| DataError::CacheError(format!("read dir: {e}")))?;

        let mut symbols = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| DataError::CacheError(format!("dir entry: {e}")))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(symbol) = name.strip_prefix("symbol=") {
                symbols.push(symbol.to_string());
            }
        }
        symbols.sort();
        Ok(symbols)
    }

    /// Check which symbols have cached data, and their date ranges.
    pub fn status(&self, symbols: &[&str]) -> Vec<CacheStatus> {
        symbols
            .iter()
            .map(|sym| {
                let meta = self.get_meta(sym);
                CacheStatus {
                    symbol: sym.to_string(),
                    cached: meta.is_some(),
                    start_date: meta.as_ref().map(|m| m.start_date),
                    end_date: meta.as_ref().map(|m| m.end_date),
                    bar_count: meta.as_ref().map(|m| m.bar_count),
                }
            })
            .collect()
    }
}

/// Cache status for a single symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStatus {
    pub symbol: String,
    pub cached: bool,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub bar_count: Option<usize>,
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

const COLUMNS: [&str; 15] = [
    "date",
    "symbol",
    "series",
    "prev_close",
    "open",
    "high",
    "low",
    "last",
    "close",
    "vwap",
    "volume",
    "turnover",
    "trades",
    "deliverable_volume",
    "deliverable_pct",
];

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

fn f64_column(name: &str, bars: &[&Bar], get: impl Fn(&Bar) -> f64) -> Column {
    let values: Vec<f64> = bars.iter().map(|b| get(b)).collect();
    Column::new(name.into(), values)
}

fn u64_column(name: &str, bars: &[&Bar], get: impl Fn(&Bar) -> u64) -> Column {
    let values: Vec<u64> = bars.iter().map(|b| get(b)).collect();
    Column::new(name.into(), values)
}

/// Convert bars to a Polars DataFrame.
fn bars_to_dataframe(bars: &[&Bar]) -> Result<DataFrame, DataError> {
    let epoch = epoch();
    let dates: Vec<i32> = bars
        .iter()
        .map(|b| (b.date - epoch).num_days() as i32)
        .collect();
    let symbols: Vec<String> = bars.iter().map(|b| b.symbol.clone()).collect();
    let series: Vec<String> = bars.iter().map(|b| b.series.clone()).collect();

    DataFrame::new(vec![
        Column::new("date".into(), dates)
            .cast(&DataType::Date)
            .map_err(|e| DataError::ParquetError(format!("date cast: {e}")))?,
        Column::new("symbol".into(), symbols),
        Column::new("series".into(), series),
        f64_column("prev_close", bars, |b| b.prev_close),
        f64_column("open", bars, |b| b.open),
        f64_column("high", bars, |b| b.high),
        f64_column("low", bars, |b| b.low),
        f64_column("last", bars, |b| b.last),
        f64_column("close", bars, |b| b.close),
        f64_column("vwap", bars, |b| b.vwap),
        u64_column("volume", bars, |b| b.volume),
        f64_column("turnover", bars, |b| b.turnover),
        u64_column("trades", bars, |b| b.trades),
        u64_column("deliverable_volume", bars, |b| b.deliverable_volume),
        f64_column("deliverable_pct", bars, |b| b.deliverable_pct),
    ])
    .map_err(|e| DataError::ParquetError(format!("dataframe creation: {e}")))
}

/// Write a DataFrame to a Parquet file.
fn write_parquet(df: &DataFrame, path: &Path) -> Result<(), DataError> {
    let file =
        fs::File::create(path).map_err(|e| DataError::ParquetError(format!("create file: {e}")))?;
    ParquetWriter::new(file)
        .finish(&mut df.clone())
        .map_err(|e| DataError::ParquetError(format!("write parquet: {e}")))?;
    Ok(())
}

/// Load a Parquet file and validate its integrity.
fn load_and_validate_parquet(path: &Path) -> Result<Vec<Bar>, DataError> {
    let file = fs::File::open(path).map_err(|e| DataError::ParquetError(format!("open: {e}")))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| DataError::ParquetError(format!("read: {e}")))?;

    if df.height() == 0 {
        return Err(DataError::ValidationError("empty parquet file".into()));
    }

    for col_name in &COLUMNS {
        if df.column(col_name).is_err() {
            return Err(DataError::ValidationError(format!(
                "missing column '{col_name}'"
            )));
        }
    }

    dataframe_to_bars(&df)
}

fn f64_values<'a>(df: &'a DataFrame, name: &str) -> Result<&'a Float64Chunked, DataError> {
    df.column(name)
        .and_then(|c| c.f64())
        .map_err(|e| DataError::ParquetError(format!("{name} column: {e}")))
}

fn u64_values<'a>(df: &'a DataFrame, name: &str) -> Result<&'a UInt64Chunked, DataError> {
    df.column(name)
        .and_then(|c| c.u64())
        .map_err(|e| DataError::ParquetError(format!("{name} column: {e}")))
}

fn str_values<'a>(df: &'a DataFrame, name: &str) -> Result<&'a StringChunked, DataError> {
    df.column(name)
        .and_then(|c| c.str())
        .map_err(|e| DataError::ParquetError(format!("{name} column: {e}")))
}

/// Convert a DataFrame back to bars.
fn dataframe_to_bars(df: &DataFrame) -> Result<Vec<Bar>, DataError> {
    let date_ca = df
        .column("date")
        .and_then(|c| c.date())
        .map_err(|e| DataError::ParquetError(format!("date column type: {e}")))?;
    let symbol_ca = str_values(df, "symbol")?;
    let series_ca = str_values(df, "series")?;
    let prev_close_ca = f64_values(df, "prev_close")?;
    let open_ca = f64_values(df, "open")?;
    let high_ca = f64_values(df, "high")?;
    let low_ca = f64_values(df, "low")?;
    let last_ca = f64_values(df, "last")?;
    let close_ca = f64_values(df, "close")?;
    let vwap_ca = f64_values(df, "vwap")?;
    let volume_ca = u64_values(df, "volume")?;
    let turnover_ca = f64_values(df, "turnover")?;
    let trades_ca = u64_values(df, "trades")?;
    let deliv_vol_ca = u64_values(df, "deliverable_volume")?;
    let deliv_pct_ca = f64_values(df, "deliverable_pct")?;

    let epoch = epoch();
    let n = df.height();
    let mut bars = Vec::with_capacity(n);

    for i in 0..n {
        let date_days = date_ca
            .get(i)
            .ok_or_else(|| DataError::ParquetError(format!("null date at row {i}")))?;
        let symbol = symbol_ca
            .get(i)
            .ok_or_else(|| DataError::ParquetError(format!("null symbol at row {i}")))?;

        bars.push(Bar {
            date: epoch + chrono::Duration::days(date_days as i64),
            symbol: symbol.to_string(),
            series: series_ca.get(i).unwrap_or_default().to_string(),
            prev_close: prev_close_ca.get(i).unwrap_or(f64::NAN),
            open: open_ca.get(i).unwrap_or(f64::NAN),
            high: high_ca.get(i).unwrap_or(f64::NAN),
            low: low_ca.get(i).unwrap_or(f64::NAN),
            last: last_ca.get(i).unwrap_or(f64::NAN),
            close: close_ca.get(i).unwrap_or(f64::NAN),
            vwap: vwap_ca.get(i).unwrap_or(f64::NAN),
            volume: volume_ca.get(i).unwrap_or(0),
            turnover: turnover_ca.get(i).unwrap_or(f64::NAN),
            trades: trades_ca.get(i).unwrap_or(0),
            deliverable_volume: deliv_vol_ca.get(i).unwrap_or(0),
            deliverable_pct: deliv_pct_ca.get(i).unwrap_or(f64::NAN),
        });
    }

    Ok(bars)
}
