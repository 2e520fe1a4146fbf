//! CSV import provider.
//!
//! Reads per-symbol exports (`{dir}/{SYMBOL}.csv`) in the classic archive
//! layout: `Date,Symbol,Series,Prev Close,Open,High,Low,Last,Close,VWAP,
//! Volume,Turnover,Trades,Deliverable Volume,%Deliverble`. Useful offline and
//! as a fallback when the exchange API is unreachable.

use super::provider::{DataError, DataProvider, DataSource, FetchResult};
use crate::domain::Bar;
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(rename = "Date")]
    date: NaiveDate,
    #[serde(rename = "Symbol")]
    symbol: String,
    #[serde(rename = "Series", default)]
    series: String,
    #[serde(rename = "Prev Close", default)]
    prev_close: Option<f64>,
    #[serde(rename = "Open", default)]
    open: Option<f64>,
    #[serde(rename = "High", default)]
    high: Option<f64>,
    #[serde(rename = "Low", default)]
    low: Option<f64>,
    #[serde(rename = "Last", default)]
    last: Option<f64>,
    #[serde(rename = "Close", default)]
    close: Option<f64>,
    #[serde(rename = "VWAP", default)]
    vwap: Option<f64>,
    #[serde(rename = "Volume", default)]
    volume: Option<f64>,
    #[serde(rename = "Turnover", default)]
    turnover: Option<f64>,
    #[serde(rename = "Trades", default)]
    trades: Option<f64>,
    #[serde(rename = "Deliverable Volume", default)]
    deliverable_volume: Option<f64>,
    #[serde(rename = "%Deliverble", alias = "%Deliverable", default)]
    deliverable_pct: Option<f64>,
}

impl From<CsvRow> for Bar {
    fn from(row: CsvRow) -> Self {
        let count = |v: Option<f64>| v.filter(|x| *x >= 0.0).map(|x| x.round() as u64).unwrap_or(0);
        Bar {
            date: row.date,
            symbol: row.symbol,
            series: row.series,
            prev_close: row.prev_close.unwrap_or(f64::NAN),
            open: row.open.unwrap_or(f64::NAN),
            high: row.high.unwrap_or(f64::NAN),
            low: row.low.unwrap_or(f64::NAN),
            last: row.last.unwrap_or(f64::NAN),
            close: row.close.unwrap_or(f64::NAN),
            vwap: row.vwap.unwrap_or(f64::NAN),
            volume: count(row.volume),
            turnover: row.turnover.unwrap_or(f64::NAN),
            trades: count(row.trades),
            deliverable_volume: count(row.deliverable_volume),
            deliverable_pct: row.deliverable_pct.unwrap_or(f64::NAN),
        }
    }
}

/// Reads bars from a directory of per-symbol CSV files.
pub struct CsvProvider {
    dir: PathBuf,
}

impl CsvProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn symbol_path(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("{symbol}.csv"))
    }
}

/// Parse every row of an archive-layout CSV file.
pub fn read_bars_csv(path: &Path) -> Result<Vec<Bar>, DataError> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| DataError::ValidationError(format!("open {}: {e}", path.display())))?;

    let mut bars = Vec::new();
    for (i, rec) in rdr.deserialize::<CsvRow>().enumerate() {
        let row = rec.map_err(|e| {
            DataError::ValidationError(format!("{} row {}: {e}", path.display(), i + 1))
        })?;
        bars.push(Bar::from(row));
    }
    bars.sort_by_key(|b| b.date);
    Ok(bars)
}

/// Write bars in the same archive layout [`read_bars_csv`] accepts.
pub fn write_bars_csv(path: &Path, bars: &[Bar]) -> Result<(), DataError> {
    let to_err = |e: csv::Error| DataError::ValidationError(format!("write {}: {e}", path.display()));
    let mut wtr = csv::Writer::from_path(path).map_err(to_err)?;
    wtr.write_record([
        "Date",
        "Symbol",
        "Series",
        "Prev Close",
        "Open",
        "High",
        "Low",
        "Last",
        "Close",
        "VWAP",
        "Volume",
        "Turnover",
        "Trades",
        "Deliverable Volume",
        "%Deliverble",
    ])
    .map_err(to_err)?;

    let num = |v: f64| if v.is_nan() { String::new() } else { v.to_string() };
    for b in bars {
        wtr.write_record(&[
            b.date.format("%Y-%m-%d").to_string(),
            b.symbol.clone(),
            b.series.clone(),
            num(b.prev_close),
            num(b.open),
            num(b.high),
            num(b.low),
            num(b.last),
            num(b.close),
            num(b.vwap),
            b.volume.to_string(),
            num(b.turnover),
            b.trades.to_string(),
            b.deliverable_volume.to_string(),
            num(b.deliverable_pct),
        ])
        .map_err(to_err)?;
    }
    wtr.flush()
        .map_err(|e| DataError::ValidationError(format!("flush {}: {e}", path.display())))?;
    Ok(())
}

impl DataProvider for CsvProvider {
    fn name(&self) -> &str {
        "csv_import"
    }

    fn fetch(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<FetchResult, DataError> {
        let path = self.symbol_path(symbol);
        if !path.is_file() {
            return Err(DataError::SymbolNotFound {
                symbol: symbol.to_string(),
            });
        }

        let bars: Vec<Bar> = read_bars_csv(&path)?
            .into_iter()
            .filter(|b| b.within(start, end))
            .collect();
        debug!(symbol, file = %path.display(), rows = bars.len(), "read CSV export");

        Ok(FetchResult {
            symbol: symbol.to_string(),
            bars,
            source: DataSource::CsvImport,
        })
    }
}
