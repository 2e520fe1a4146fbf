//! Append-only CSV of completed backtests.

use chrono::NaiveDate;
use nsecache_core::domain::format_cli_date;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::scanner::ScanReport;

/// Column names written when the results file is created.
pub const RESULTS_HEADER: [&str; 15] = [
    "Date",
    "Symbol",
    "Marketcapname",
    "Sector",
    "Price",
    "Stoploss",
    "Near Target",
    "Max Adverse %",
    "Near Result",
    "Bars To Near",
    "Far Target",
    "Bars To Far",
    "Far Result",
    "Extreme 3M",
    "Extreme 6M",
];

/// Placeholder for the market-cap and sector columns.
const UNKNOWN: &str = "---";

#[derive(Debug, Error)]
pub enum ResultsError {
    #[error("results file I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("results CSV: {0}")]
    Csv(#[from] csv::Error),
}

/// Appends one row per completed run.
pub struct ResultsWriter {
    path: PathBuf,
}

impl ResultsWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(
        &self,
        date: NaiveDate,
        symbol: &str,
        report: &ScanReport,
    ) -> Result<(), ResultsError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let needs_header = fs::metadata(&self.path).map(|m| m.len() == 0).unwrap_or(true);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        if needs_header {
            wtr.write_record(RESULTS_HEADER)?;
        }
        wtr.write_record(row(date, symbol, report))?;
        wtr.flush()?;
        Ok(())
    }
}

fn row(date: NaiveDate, symbol: &str, report: &ScanReport) -> [String; 15] {
    let px = |v: f64| format!("{v:.2}");
    let levels = &report.levels;
    [
        format_cli_date(date),
        symbol.to_string(),
        UNKNOWN.to_string(),
        UNKNOWN.to_string(),
        px(levels.price),
        px(levels.stop_loss),
        px(levels.near_target),
        px(report.max_adverse_pct),
        report.near.outcome.to_string(),
        report.near.bars_taken.to_string(),
        px(levels.far_target),
        report.far.bars_taken.to_string(),
        report.far.outcome.to_string(),
        px(report.extreme_3m),
        px(report.extreme_6m),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{scan, Direction, Thresholds};
    use tempfile::TempDir;

    fn report() -> ScanReport {
        scan(&[], 392.15, Direction::Buy, &Thresholds::default())
    }

    fn read_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn header_written_once() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out").join("backtest_results.csv");
        let writer = ResultsWriter::new(&path);
        let date = NaiveDate::from_ymd_opt(2021, 3, 1).unwrap();

        writer.append(date, "SBIN", &report()).unwrap();
        writer.append(date, "ABC", &report()).unwrap();

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Date,Symbol,Marketcapname"));
        assert!(lines[1].starts_with("01-03-2021,SBIN,---,---,392.15,"));
        assert!(lines[2].starts_with("01-03-2021,ABC,"));
    }

    #[test]
    fn row_carries_levels_and_outcomes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("results.csv");
        ResultsWriter::new(&path)
            .append(
                NaiveDate::from_ymd_opt(2021, 3, 1).unwrap(),
                "SBIN",
                &scan(&[], 100.0, Direction::Buy, &Thresholds::default()),
            )
            .unwrap();

        let mut rdr = csv::Reader::from_path(&path).unwrap();
        let rec = rdr.records().next().unwrap().unwrap();
        assert_eq!(rec.len(), RESULTS_HEADER.len());
        assert_eq!(&rec[4], "100.00");
        assert_eq!(&rec[5], "95.00");
        assert_eq!(&rec[6], "103.00");
        assert_eq!(&rec[8], "Not Hit");
        assert_eq!(&rec[9], "0");
        assert_eq!(&rec[10], "105.00");
        assert_eq!(&rec[12], "Not Hit");
    }

    #[test]
    fn existing_file_gets_no_second_header() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("results.csv");
        fs::write(&path, "Date,Symbol\n").unwrap();

        ResultsWriter::new(&path)
            .append(NaiveDate::from_ymd_opt(2021, 3, 1).unwrap(), "SBIN", &report())
            .unwrap();
        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "Date,Symbol");
    }
}
