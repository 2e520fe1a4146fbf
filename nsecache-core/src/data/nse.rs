//! NSE historical archive provider.
//!
//! Fetches daily "price, volume and deliverable position" rows from the
//! exchange's security archive JSON API. The site hands out session cookies on
//! the landing page and rejects API calls without them, so the client keeps a
//! cookie store and primes it once before the first request.
//!
//! Failures are returned to the caller as-is; there is no retry here.

use super::provider::{DataError, DataProvider, DataSource, FetchResult};
use crate::domain::Bar;
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Deserializer};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

const BASE_URL: &str = "https://www.nseindia.com";
const ARCHIVE_PATH: &str = "/api/historical/securityArchives";

/// The archive endpoint refuses ranges longer than a year.
const MAX_DAYS_PER_REQUEST: i64 = 365;

#[derive(Debug, Deserialize)]
struct ArchiveResponse {
    #[serde(default)]
    data: Vec<ArchiveRow>,
}

#[derive(Debug, Deserialize)]
struct ArchiveRow {
    #[serde(rename = "CH_SYMBOL")]
    symbol: String,
    #[serde(rename = "CH_SERIES", default)]
    series: String,
    #[serde(rename = "CH_TIMESTAMP")]
    timestamp: String,
    #[serde(rename = "CH_PREVIOUS_CLS_PRICE", default, deserialize_with = "lenient_f64")]
    prev_close: Option<f64>,
    #[serde(rename = "CH_OPENING_PRICE", default, deserialize_with = "lenient_f64")]
    open: Option<f64>,
    #[serde(rename = "CH_TRADE_HIGH_PRICE", default, deserialize_with = "lenient_f64")]
    high: Option<f64>,
    #[serde(rename = "CH_TRADE_LOW_PRICE", default, deserialize_with = "lenient_f64")]
    low: Option<f64>,
    #[serde(rename = "CH_LAST_TRADED_PRICE", default, deserialize_with = "lenient_f64")]
    last: Option<f64>,
    #[serde(rename = "CH_CLOSING_PRICE", default, deserialize_with = "lenient_f64")]
    close: Option<f64>,
    #[serde(rename = "VWAP", default, deserialize_with = "lenient_f64")]
    vwap: Option<f64>,
    #[serde(rename = "CH_TOT_TRADED_QTY", default, deserialize_with = "lenient_f64")]
    volume: Option<f64>,
    #[serde(rename = "CH_TOT_TRADED_VAL", default, deserialize_with = "lenient_f64")]
    turnover: Option<f64>,
    #[serde(rename = "CH_TOTAL_TRADES", default, deserialize_with = "lenient_f64")]
    trades: Option<f64>,
    #[serde(rename = "COP_DELIV_QTY", default, deserialize_with = "lenient_f64")]
    deliverable_volume: Option<f64>,
    #[serde(rename = "COP_DELIV_PERC", default, deserialize_with = "lenient_f64")]
    deliverable_pct: Option<f64>,
}

/// Numbers arrive as JSON numbers, numeric strings ("1,234.5"), "-" or null.
fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Num {
        F(f64),
        S(String),
    }
    Ok(match Option::<Num>::deserialize(deserializer)? {
        Some(Num::F(v)) => Some(v),
        Some(Num::S(s)) => s.trim().replace(',', "").parse::<f64>().ok(),
        None => None,
    })
}

fn count(v: Option<f64>) -> u64 {
    v.filter(|x| x.is_finite() && *x >= 0.0)
        .map(|x| x.round() as u64)
        .unwrap_or(0)
}

fn parse_row_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%d-%b-%Y"))
        .ok()
}

/// NSE archive data provider.
pub struct NseProvider {
    client: reqwest::blocking::Client,
    base_url: String,
    primed: OnceLock<()>,
}

impl NseProvider {
    pub fn new() -> Result<Self, DataError> {
        Self::with_base_url(BASE_URL)
    }

    /// Point the provider at a different host (mirrors, local stubs).
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, DataError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .cookie_store(true)
            .user_agent("Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36")
            .build()
            .map_err(|e| DataError::NetworkUnreachable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            primed: OnceLock::new(),
        })
    }

    /// Build the archive API URL for a symbol and date range.
    fn archive_url(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<reqwest::Url, DataError> {
        reqwest::Url::parse_with_params(
            &format!("{}{ARCHIVE_PATH}", self.base_url),
            &[
                ("from", start.format("%d-%m-%Y").to_string()),
                ("to", end.format("%d-%m-%Y").to_string()),
                ("symbol", symbol.to_string()),
                ("dataType", "priceVolumeDeliverable".to_string()),
                ("series", "EQ".to_string()),
            ],
        )
        .map_err(|e| DataError::ValidationError(format!("bad archive URL: {e}")))
    }

    /// Visit the landing page once so the cookie store holds a session.
    fn prime_session(&self) {
        self.primed.get_or_init(|| {
            debug!(base = %self.base_url, "priming NSE session cookies");
            if let Err(e) = self.client.get(&self.base_url).send() {
                warn!(error = %e, "could not prime NSE session");
            }
        });
    }

    /// One HTTP round trip for a range of at most a year.
    fn fetch_chunk(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>, DataError> {
        let url = self.archive_url(symbol, start, end)?;
        debug!(%url, "requesting archive chunk");

        let resp = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .map_err(|e| DataError::NetworkUnreachable(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(DataError::SymbolNotFound {
                symbol: symbol.to_string(),
            });
        }
        if !status.is_success() {
            let detail = resp.text().unwrap_or_default();
            return Err(DataError::SourceUnavailable {
                status: status.as_u16(),
                detail: detail.chars().take(200).collect(),
            });
        }

        let body: ArchiveResponse = resp.json().map_err(|e| {
            DataError::ResponseFormatChanged(format!("failed to parse response for {symbol}: {e}"))
        })?;
        parse_archive(body)
    }
}

/// Split `[start, end]` into consecutive inclusive ranges of at most a year.
fn chunk_ranges(start: NaiveDate, end: NaiveDate) -> Vec<(NaiveDate, NaiveDate)> {
    let mut ranges = Vec::new();
    let mut cur = start;
    while cur <= end {
        let chunk_end = (cur + Duration::days(MAX_DAYS_PER_REQUEST - 1)).min(end);
        ranges.push((cur, chunk_end));
        cur = chunk_end + Duration::days(1);
    }
    ranges
}

/// A range with no rows at all means the exchange does not know the symbol.
fn non_empty(symbol: &str, bars: Vec<Bar>) -> Result<Vec<Bar>, DataError> {
    if bars.is_empty() {
        return Err(DataError::SymbolNotFound {
            symbol: symbol.to_string(),
        });
    }
    Ok(bars)
}

/// Convert archive rows into bars, sorted by date.
fn parse_archive(resp: ArchiveResponse) -> Result<Vec<Bar>, DataError> {
    let mut bars = Vec::with_capacity(resp.data.len());
    for row in resp.data {
        let date = parse_row_date(&row.timestamp).ok_or_else(|| {
            DataError::ResponseFormatChanged(format!("invalid timestamp: {}", row.timestamp))
        })?;

        bars.push(Bar {
            date,
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
        });
    }
    bars.sort_by_key(|b| b.date);
    Ok(bars)
}

impl DataProvider for NseProvider {
    fn name(&self) -> &str {
        "nse_archive"
    }

    fn fetch(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<FetchResult, DataError> {
        self.prime_session();

        let mut bars = Vec::new();
        for (from, to) in chunk_ranges(start, end) {
            bars.extend(self.fetch_chunk(symbol, from, to)?);
        }
        let bars = non_empty(symbol, bars)?;

        info!(symbol, %start, %end, rows = bars.len(), "fetched from NSE archive");
        Ok(FetchResult {
            symbol: symbol.to_string(),
            bars,
            source: DataSource::NseArchive,
        })
    }
}
