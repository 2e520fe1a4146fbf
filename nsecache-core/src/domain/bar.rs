//! Bar — one trading day of exchange data for one symbol.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Daily bar for a single symbol on a single day.
///
/// Mirrors the exchange's "price, volume and deliverable position" archive:
/// besides OHLC it carries the previous close, last traded price, VWAP,
/// turnover and the delivery statistics. Missing prices are stored as NaN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub symbol: String,
    pub series: String,
    pub prev_close: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub last: f64,
    pub close: f64,
    pub vwap: f64,
    pub volume: u64,
    pub turnover: f64,
    pub trades: u64,
    pub deliverable_volume: u64,
    pub deliverable_pct: f64,
}

impl Bar {
    /// Returns true if any of the OHLC fields is NaN.
    pub fn is_void(&self) -> bool {
        self.open.is_nan() || self.high.is_nan() || self.low.is_nan() || self.close.is_nan()
    }

    /// Basic sanity check: high >= low, high/low bracket open and close, positive prices.
    pub fn is_sane(&self) -> bool {
        if self.is_void() {
            return false;
        }
        self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.open > 0.0
            && self.close > 0.0
    }

    /// True when `date` lies in `[start, end]`.
    pub fn within(&self, start: NaiveDate, end: NaiveDate) -> bool {
        self.date >= start && self.date <= end
    }
}

#[cfg(test)]
pub(crate) fn sample_bar(symbol: &str, date: NaiveDate, close: f64) -> Bar {
    Bar {
        date,
        symbol: symbol.to_string(),
        series: "EQ".to_string(),
        prev_close: close,
        open: close,
        high: close + 1.0,
        low: close - 1.0,
        last: close,
        close,
        vwap: close,
        volume: 10_000,
        turnover: close * 10_000.0,
        trades: 500,
        deliverable_volume: 4_000,
        deliverable_pct: 0.4,
    }
}
