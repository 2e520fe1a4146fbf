//! Single backtest run: state check, window resolution, scan, record.

use chrono::{Duration, NaiveDate};
use thiserror::Error;
use tracing::{error, info, warn};

use nsecache_core::data::{DataError, RangeReconciler};

use crate::results::{ResultsError, ResultsWriter};
use crate::scanner::{scan, Direction, ScanReport, Thresholds};
use crate::state::{SentinelStore, SymbolStatus};

/// Errors from a single run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("data error: {0}")]
    Data(#[from] DataError),
    #[error("no reference price for '{symbol}': no bars in the window")]
    NoReferencePrice { symbol: String },
    #[error("invalid reference price {price} for '{symbol}': must be 0 (first close) or positive")]
    InvalidPrice { symbol: String, price: f64 },
    #[error("window of {weeks} weeks from {start} is out of calendar range")]
    WindowOutOfRange { start: NaiveDate, weeks: i64 },
    #[error("state store error: {0}")]
    State(#[from] std::io::Error),
    #[error("results error: {0}")]
    Results(#[from] ResultsError),
}

/// One backtest to run.
#[derive(Debug, Clone, PartialEq)]
pub struct BacktestRequest {
    pub symbol: String,
    /// Entry date; the scanned window starts here.
    pub date: NaiveDate,
    /// Entry price. Zero means "use the first bar's close".
    pub reference_price: f64,
    pub direction: Direction,
}

impl BacktestRequest {
    /// Reject prices that are neither the 0 sentinel nor a real positive price.
    pub fn validate(&self) -> Result<(), RunError> {
        let price = self.reference_price;
        if !price.is_finite() || price < 0.0 {
            return Err(RunError::InvalidPrice {
                symbol: self.symbol.clone(),
                price,
            });
        }
        Ok(())
    }
}

/// Everything a run needs besides the request itself.
pub struct RunContext<'a> {
    pub reconciler: &'a RangeReconciler<'a>,
    pub state: &'a SentinelStore,
    pub results: &'a ResultsWriter,
    pub thresholds: Thresholds,
    pub lookahead_weeks: i64,
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(ScanReport),
    /// Already done or errored; nothing was fetched or written.
    Skipped(SymbolStatus),
}

/// Run one backtest and record its outcome.
///
/// Fetch failures and missing data mark the symbol errored before the
/// error is returned, so a batch will not retry it.
pub fn run_backtest(request: &BacktestRequest, ctx: &RunContext<'_>) -> Result<RunOutcome, RunError> {
    let symbol = request.symbol.as_str();
    request.validate()?;

    let status = ctx.state.status(symbol)?;
    if status.is_settled() {
        info!(symbol, %status, "skipping symbol");
        return Ok(RunOutcome::Skipped(status));
    }

    let start = request.date;
    let end = Duration::try_weeks(ctx.lookahead_weeks)
        .and_then(|span| start.checked_add_signed(span))
        .ok_or(RunError::WindowOutOfRange {
            start,
            weeks: ctx.lookahead_weeks,
        })?;
    let bars = match ctx.reconciler.resolve(symbol, start, end) {
        Ok(bars) => bars,
        Err(e) => {
            error!(symbol, error = %e, "failed to load bars");
            ctx.state.mark_errored(symbol, &e.to_string())?;
            return Err(RunError::Data(e));
        }
    };

    let price = if request.reference_price > 0.0 {
        request.reference_price
    } else {
        match bars.first() {
            Some(first) => {
                info!(symbol, price = first.close, "using first close as reference price");
                first.close
            }
            None => {
                warn!(symbol, %start, %end, "no bars in window");
                let err = RunError::NoReferencePrice {
                    symbol: symbol.to_string(),
                };
                ctx.state.mark_errored(symbol, &err.to_string())?;
                return Err(err);
            }
        }
    };

    info!(
        symbol,
        price,
        date = %start,
        direction = %request.direction,
        bars = bars.len(),
        "starting backtest"
    );
    let report = scan(&bars, price, request.direction, &ctx.thresholds);
    info!(
        symbol,
        near = %report.near.outcome,
        near_bars = report.near.bars_taken,
        far = %report.far.outcome,
        far_bars = report.far.bars_taken,
        max_adverse_pct = report.max_adverse_pct,
        "backtest complete"
    );

    ctx.results.append(request.date, symbol, &report)?;
    ctx.state.mark_done(symbol)?;
    Ok(RunOutcome::Completed(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::TargetOutcome;
    use nsecache_core::data::{
        DataProvider, DataSource, FetchResult, FixedClock, ParquetCache,
    };
    use nsecache_core::domain::{is_weekend, Bar};
    use tempfile::TempDir;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    /// Weekday bars closing at 100 and rising 1 per day from 2021-03-01.
    struct RampProvider;

    impl DataProvider for RampProvider {
        fn name(&self) -> &str {
            "ramp"
        }

        fn fetch(
            &self,
            symbol: &str,
            start: NaiveDate,
            end: NaiveDate,
        ) -> Result<FetchResult, DataError> {
            let bars = start
                .iter_days()
                .take_while(|day| *day <= end)
                .filter(|day| !is_weekend(*day) && *day >= d(2021, 3, 1))
                .map(|date| {
                    let close = 100.0 + (date - d(2021, 3, 1)).num_days() as f64;
                    Bar {
                        date,
                        symbol: symbol.to_string(),
                        series: "EQ".into(),
                        prev_close: close - 1.0,
                        open: close - 0.5,
                        high: close + 0.5,
                        low: close - 0.5,
                        last: close,
                        close,
                        vwap: close,
                        volume: 1_000,
                        turnover: close * 1_000.0,
                        trades: 10,
                        deliverable_volume: 400,
                        deliverable_pct: 0.4,
                    }
                })
                .collect();
            Ok(FetchResult {
                symbol: symbol.to_string(),
                bars,
                source: DataSource::CsvImport,
            })
        }
    }

    struct DownProvider;

    impl DataProvider for DownProvider {
        fn name(&self) -> &str {
            "down"
        }

        fn fetch(&self, _: &str, _: NaiveDate, _: NaiveDate) -> Result<FetchResult, DataError> {
            Err(DataError::NetworkUnreachable("no route to host".into()))
        }
    }

    struct Fixture {
        _tmp: TempDir,
        cache: ParquetCache,
        state: SentinelStore,
        results: ResultsWriter,
        clock: FixedClock,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        Fixture {
            cache: ParquetCache::new(tmp.path().join("cache")),
            state: SentinelStore::new(tmp.path().join("data")),
            results: ResultsWriter::new(tmp.path().join("data/backtest_results.csv")),
            clock: FixedClock(d(2022, 1, 3)),
            _tmp: tmp,
        }
    }

    fn request(symbol: &str, price: f64) -> BacktestRequest {
        BacktestRequest {
            symbol: symbol.into(),
            date: d(2021, 3, 1),
            reference_price: price,
            direction: Direction::Buy,
        }
    }

    fn run(fx: &Fixture, provider: &dyn DataProvider, req: &BacktestRequest) -> Result<RunOutcome, RunError> {
        let reconciler = RangeReconciler::new(&fx.cache, Some(provider), &fx.clock);
        let ctx = RunContext {
            reconciler: &reconciler,
            state: &fx.state,
            results: &fx.results,
            thresholds: Thresholds::default(),
            lookahead_weeks: 30,
        };
        run_backtest(req, &ctx)
    }

    #[test]
    fn completed_run_records_and_marks_done() {
        let fx = fixture();
        let outcome = run(&fx, &RampProvider, &request("SBIN", 0.0)).unwrap();

        let RunOutcome::Completed(report) = outcome else {
            panic!("expected a completed run");
        };
        // First close is 100; the ramp clears 103 with its low on day 4 (2021-03-05).
        assert_eq!(report.levels.price, 100.0);
        assert_eq!(report.near.outcome, TargetOutcome::TargetHit);
        assert_eq!(report.near.bars_taken, 4);
        assert_eq!(fx.state.status("SBIN").unwrap(), SymbolStatus::Done);
        assert!(fx.results.path().is_file());
    }

    #[test]
    fn settled_symbol_is_skipped() {
        let fx = fixture();
        fx.state.mark_done("SBIN").unwrap();

        let outcome = run(&fx, &DownProvider, &request("SBIN", 100.0)).unwrap();
        assert_eq!(outcome, RunOutcome::Skipped(SymbolStatus::Done));
        assert!(!fx.results.path().exists());
    }

    #[test]
    fn fetch_failure_marks_errored() {
        let fx = fixture();
        let err = run(&fx, &DownProvider, &request("SBIN", 100.0)).unwrap_err();

        assert!(matches!(err, RunError::Data(DataError::NetworkUnreachable(_))));
        assert!(matches!(
            fx.state.status("SBIN").unwrap(),
            SymbolStatus::Errored(reason) if reason.contains("no route to host")
        ));
        // A second attempt is skipped rather than refetched.
        assert!(matches!(
            run(&fx, &DownProvider, &request("SBIN", 100.0)).unwrap(),
            RunOutcome::Skipped(SymbolStatus::Errored(_))
        ));
    }

    #[test]
    fn negative_or_non_finite_price_is_rejected_before_any_work() {
        let fx = fixture();
        for price in [-1.0, f64::NAN, f64::INFINITY] {
            let err = run(&fx, &DownProvider, &request("SBIN", price)).unwrap_err();
            assert!(matches!(err, RunError::InvalidPrice { .. }));
        }
        // Nothing was fetched, so nothing was marked.
        assert_eq!(fx.state.status("SBIN").unwrap(), SymbolStatus::Pending);
    }

    #[test]
    fn oversized_lookahead_is_an_error_not_a_panic() {
        let fx = fixture();
        let reconciler = RangeReconciler::new(&fx.cache, Some(&RampProvider), &fx.clock);
        let ctx = RunContext {
            reconciler: &reconciler,
            state: &fx.state,
            results: &fx.results,
            thresholds: Thresholds::default(),
            lookahead_weeks: 100_000_000,
        };

        let err = run_backtest(&request("SBIN", 100.0), &ctx).unwrap_err();
        assert!(matches!(err, RunError::WindowOutOfRange { weeks: 100_000_000, .. }));
        assert_eq!(fx.state.status("SBIN").unwrap(), SymbolStatus::Pending);
    }

    #[test]
    fn empty_window_without_price_is_no_reference_price() {
        let fx = fixture();
        let mut req = request("SBIN", 0.0);
        req.date = d(2020, 1, 1);
        // The ramp starts in March 2021, so the 30-week window from 2020-01-01 is empty.
        let err = run(&fx, &RampProvider, &req).unwrap_err();

        assert!(matches!(err, RunError::NoReferencePrice { .. }));
        assert!(fx.state.status("SBIN").unwrap().is_settled());
    }
}
