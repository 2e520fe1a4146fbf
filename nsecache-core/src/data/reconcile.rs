//! Range reconciliation: serve a date window from the cache, topping the
//! cache up from a provider when its coverage is short.
//!
//! The decision is made on a probe window one week wider than the request on
//! both sides, so a request that starts or ends on a holiday or weekend is not
//! mistaken for a coverage gap. When a fetch is needed the provider is asked
//! for a generous slice (at least 30 weeks, never past today, starting two
//! weeks before the gap) and the result is merged into the cache before the
//! probe window is read again.

use super::cache::ParquetCache;
use super::provider::{DataError, DataProvider};
use crate::domain::{is_weekend, Bar};
use chrono::{Duration, NaiveDate};
use tracing::{debug, info, warn};

/// Days added to each side of a request to form the probe window.
pub const PROBE_MARGIN_DAYS: i64 = 7;
/// Minimum span of a single provider request.
pub const FETCH_SPAN_WEEKS: i64 = 30;
/// Extra history requested before the computed fetch start.
pub const JOIN_MARGIN_WEEKS: i64 = 2;

/// Source of "today". Injected so weekend and cap behavior is testable.
pub trait Clock {
    fn today(&self) -> NaiveDate;
}

/// Local calendar date of the machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        chrono::Local::now().date_naive()
    }
}

/// A clock stuck on one date.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}

/// A caller's request: one symbol over `[start, end]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestWindow {
    pub symbol: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl RequestWindow {
    pub fn new(symbol: impl Into<String>, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            symbol: symbol.into(),
            start,
            end,
        }
    }

    /// An inverted window resolves to nothing.
    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// `[start - 7d, end + 7d]`
    pub fn probe(&self) -> (NaiveDate, NaiveDate) {
        let margin = Duration::days(PROBE_MARGIN_DAYS);
        (self.start - margin, self.end + margin)
    }
}

/// What the reconciler decided to do about a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPlan {
    /// Cache coverage is adequate.
    Covered,
    /// Ask the provider for `[request_start, request_end]`.
    ///
    /// `fetch_from` is the first day the cache is missing; `request_start`
    /// is that day moved back by the join margin.
    Fetch {
        fetch_from: NaiveDate,
        request_start: NaiveDate,
        request_end: NaiveDate,
    },
    /// The gap starts today and today is a weekend: nothing new can exist.
    WeekendSkip,
    /// The gap lies entirely in the future.
    NothingFetchable,
}

/// Decide whether `cached` (the probe window's contents) covers `[start, end]`.
pub fn plan_fetch(cached: &[Bar], start: NaiveDate, end: NaiveDate, today: NaiveDate) -> FetchPlan {
    let earliest = cached.iter().map(|b| b.date).min();
    let latest = cached.iter().map(|b| b.date).max();

    let fetch_from = match (earliest, latest) {
        (Some(earliest), Some(latest)) => {
            let mut from = None;
            if latest < end {
                from = Some(latest + Duration::days(1));
            }
            // A short head re-fetches from the probe start rather than only the
            // missing days; checked second so it wins over the tail.
            if earliest > start {
                from = Some(start - Duration::days(PROBE_MARGIN_DAYS));
            }
            from
        }
        _ => Some(start),
    };

    let Some(fetch_from) = fetch_from else {
        return FetchPlan::Covered;
    };

    let mut fetch_to = fetch_from + Duration::weeks(FETCH_SPAN_WEEKS);
    if end > fetch_to {
        fetch_to = end;
    }
    if fetch_to > today {
        fetch_to = today;
    }

    if fetch_from == today && is_weekend(today) {
        return FetchPlan::WeekendSkip;
    }

    let request_start = fetch_from - Duration::weeks(JOIN_MARGIN_WEEKS);
    if request_start > fetch_to {
        return FetchPlan::NothingFetchable;
    }

    FetchPlan::Fetch {
        fetch_from,
        request_start,
        request_end: fetch_to,
    }
}

/// Keep bars dated within `[start, end]`, ascending.
pub fn prune(mut bars: Vec<Bar>, start: NaiveDate, end: NaiveDate) -> Vec<Bar> {
    bars.retain(|b| b.within(start, end));
    bars.sort_by_key(|b| b.date);
    bars
}

/// Serves date windows from the cache, fetching what is missing.
///
/// `provider` is optional: without one the reconciler works offline and
/// returns whatever the cache holds.
pub struct RangeReconciler<'a> {
    cache: &'a ParquetCache,
    provider: Option<&'a dyn DataProvider>,
    clock: &'a dyn Clock,
}

impl<'a> RangeReconciler<'a> {
    pub fn new(
        cache: &'a ParquetCache,
        provider: Option<&'a dyn DataProvider>,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            cache,
            provider,
            clock,
        }
    }

    /// Bars for `symbol` in `[start, end]`, ascending, topping up the cache first if needed.
    pub fn resolve(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>, DataError> {
        self.resolve_window(&RequestWindow::new(symbol, start, end))
    }

    pub fn resolve_window(&self, window: &RequestWindow) -> Result<Vec<Bar>, DataError> {
        let RequestWindow { symbol, start, end } = window;
        if window.is_empty() {
            debug!(%symbol, %start, %end, "end before start; nothing to resolve");
            return Ok(Vec::new());
        }

        let (probe_start, probe_end) = window.probe();
        let mut cached = self.cache.query(symbol, probe_start, probe_end)?;

        match plan_fetch(&cached, *start, *end, self.clock.today()) {
            FetchPlan::Covered => {
                debug!(%symbol, %start, %end, "served from cache");
            }
            FetchPlan::WeekendSkip => {
                info!(%symbol, "cache ends before today and today is a weekend; not fetching");
            }
            FetchPlan::NothingFetchable => {
                debug!(%symbol, %start, %end, "missing range is in the future; not fetching");
            }
            FetchPlan::Fetch {
                fetch_from,
                request_start,
                request_end,
            } => match self.provider {
                None => {
                    warn!(%symbol, %fetch_from, "cache incomplete and running offline");
                }
                Some(provider) => {
                    info!(
                        %symbol,
                        provider = provider.name(),
                        from = %request_start,
                        to = %request_end,
                        "fetching missing bars"
                    );
                    let fetched = provider.fetch(symbol, request_start, request_end)?;
                    // Cache under the requested key so the re-query below finds the rows.
                    let mut bars = fetched.bars;
                    for bar in bars.iter_mut().filter(|b| b.symbol != *symbol) {
                        bar.symbol.clone_from(symbol);
                    }
                    let stats = self.cache.upsert(&bars, fetched.source)?;
                    info!(
                        %symbol,
                        inserted = stats.inserted,
                        replaced = stats.replaced,
                        "cache updated"
                    );
                    cached = self.cache.query(symbol, probe_start, probe_end)?;
                }
            },
        }

        Ok(prune(cached, *start, *end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::provider::{DataSource, FetchResult};
    use crate::domain::bar::sample_bar;
    use proptest::prelude::*;
    use std::cell::RefCell;
    use tempfile::TempDir;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn weekday_bars(symbol: &str, start: NaiveDate, end: NaiveDate) -> Vec<Bar> {
        start
            .iter_days()
            .take_while(|day| *day <= end)
            .filter(|day| !is_weekend(*day))
            .map(|day| sample_bar(symbol, day, 100.0))
            .collect()
    }

    /// Serves weekday bars for any range and records every call.
    #[derive(Default)]
    struct RecordingProvider {
        calls: RefCell<Vec<(String, NaiveDate, NaiveDate)>>,
        fail: bool,
    }

    impl RecordingProvider {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<(String, NaiveDate, NaiveDate)> {
            self.calls.borrow().clone()
        }
    }

    impl DataProvider for RecordingProvider {
        fn name(&self) -> &str {
            "recording"
        }

        fn fetch(
            &self,
            symbol: &str,
            start: NaiveDate,
            end: NaiveDate,
        ) -> Result<FetchResult, DataError> {
            self.calls.borrow_mut().push((symbol.to_string(), start, end));
            if self.fail {
                return Err(DataError::NetworkUnreachable("connection refused".into()));
            }
            Ok(FetchResult {
                symbol: symbol.to_string(),
                bars: weekday_bars(symbol, start, end),
                source: DataSource::CsvImport,
            })
        }
    }

    #[test]
    fn inverted_window_is_empty_without_fetch() {
        let tmp = TempDir::new().unwrap();
        let cache = ParquetCache::new(tmp.path());
        let provider = RecordingProvider::default();
        let clock = FixedClock(d(2022, 1, 3));
        let rec = RangeReconciler::new(&cache, Some(&provider), &clock);

        let bars = rec.resolve("ABC", d(2021, 3, 10), d(2021, 3, 1)).unwrap();
        assert!(bars.is_empty());
        assert!(provider.calls().is_empty());
    }

    #[test]
    fn covered_probe_is_served_from_cache() {
        let tmp = TempDir::new().unwrap();
        let cache = ParquetCache::new(tmp.path());
        cache
            .upsert(
                &weekday_bars("ABC", d(2021, 2, 15), d(2021, 3, 31)),
                DataSource::CsvImport,
            )
            .unwrap();
        let provider = RecordingProvider::default();
        let clock = FixedClock(d(2022, 1, 3));
        let rec = RangeReconciler::new(&cache, Some(&provider), &clock);

        let bars = rec.resolve("ABC", d(2021, 3, 1), d(2021, 3, 10)).unwrap();
        assert!(provider.calls().is_empty());
        assert_eq!(
            bars,
            cache.query("ABC", d(2021, 3, 1), d(2021, 3, 10)).unwrap()
        );
        assert_eq!(bars.len(), 8);
    }

    #[test]
    fn empty_cache_fetches_thirty_weeks_with_join_margin() {
        let tmp = TempDir::new().unwrap();
        let cache = ParquetCache::new(tmp.path());
        let provider = RecordingProvider::default();
        let clock = FixedClock(d(2022, 1, 3));
        let rec = RangeReconciler::new(&cache, Some(&provider), &clock);

        let bars = rec.resolve("ABC", d(2021, 3, 1), d(2021, 3, 10)).unwrap();

        assert_eq!(
            provider.calls(),
            vec![("ABC".to_string(), d(2021, 2, 15), d(2021, 9, 27))]
        );
        assert_eq!(bars.first().unwrap().date, d(2021, 3, 1));
        assert_eq!(bars.last().unwrap().date, d(2021, 3, 10));
        assert_eq!(bars.len(), 8);
    }

    #[test]
    fn fetch_end_is_capped_at_today() {
        let tmp = TempDir::new().unwrap();
        let cache = ParquetCache::new(tmp.path());
        let provider = RecordingProvider::default();
        let clock = FixedClock(d(2021, 4, 1));
        let rec = RangeReconciler::new(&cache, Some(&provider), &clock);

        rec.resolve("ABC", d(2021, 3, 1), d(2021, 3, 10)).unwrap();
        assert_eq!(provider.calls()[0].2, d(2021, 4, 1));
    }

    #[test]
    fn repeated_request_does_not_refetch() {
        let tmp = TempDir::new().unwrap();
        let cache = ParquetCache::new(tmp.path());
        let provider = RecordingProvider::default();
        let clock = FixedClock(d(2022, 1, 3));
        let rec = RangeReconciler::new(&cache, Some(&provider), &clock);

        let first = rec.resolve("ABC", d(2021, 3, 1), d(2021, 3, 10)).unwrap();
        let second = rec.resolve("ABC", d(2021, 3, 1), d(2021, 3, 10)).unwrap();

        assert_eq!(provider.calls().len(), 1);
        assert_eq!(first, second);
    }

    #[test]
    fn missing_tail_fetches_from_day_after_latest() {
        let cached = weekday_bars("ABC", d(2021, 2, 15), d(2021, 3, 5));
        let plan = plan_fetch(&cached, d(2021, 3, 1), d(2021, 3, 10), d(2022, 1, 3));
        assert_eq!(
            plan,
            FetchPlan::Fetch {
                fetch_from: d(2021, 3, 6),
                request_start: d(2021, 2, 20),
                request_end: d(2021, 10, 2),
            }
        );
    }

    #[test]
    fn missing_head_refetches_from_probe_start() {
        let cached = weekday_bars("ABC", d(2021, 3, 3), d(2021, 3, 17));
        let plan = plan_fetch(&cached, d(2021, 3, 1), d(2021, 3, 10), d(2022, 1, 3));
        assert_eq!(
            plan,
            FetchPlan::Fetch {
                fetch_from: d(2021, 2, 22),
                request_start: d(2021, 2, 8),
                request_end: d(2021, 9, 20),
            }
        );
    }

    #[test]
    fn head_wins_when_both_ends_are_missing() {
        let cached = weekday_bars("ABC", d(2021, 3, 3), d(2021, 3, 5));
        let plan = plan_fetch(&cached, d(2021, 3, 1), d(2021, 3, 10), d(2022, 1, 3));
        match plan {
            FetchPlan::Fetch { fetch_from, .. } => assert_eq!(fetch_from, d(2021, 2, 22)),
            other => panic!("expected a fetch, got {other:?}"),
        }
    }

    #[test]
    fn long_window_widens_fetch_to_end() {
        let plan = plan_fetch(&[], d(2020, 1, 1), d(2021, 6, 30), d(2022, 1, 3));
        match plan {
            FetchPlan::Fetch { request_end, .. } => assert_eq!(request_end, d(2021, 6, 30)),
            other => panic!("expected a fetch, got {other:?}"),
        }
    }

    #[test]
    fn weekend_short_circuit_returns_partial_cache() {
        let tmp = TempDir::new().unwrap();
        let cache = ParquetCache::new(tmp.path());
        cache
            .upsert(
                &weekday_bars("ABC", d(2021, 2, 15), d(2021, 3, 5)),
                DataSource::CsvImport,
            )
            .unwrap();
        let provider = RecordingProvider::default();
        // Saturday, the day after the last cached bar.
        let clock = FixedClock(d(2021, 3, 6));
        let rec = RangeReconciler::new(&cache, Some(&provider), &clock);

        let bars = rec.resolve("ABC", d(2021, 3, 1), d(2021, 3, 10)).unwrap();
        assert!(provider.calls().is_empty());
        assert_eq!(bars.len(), 5);
        assert_eq!(bars.last().unwrap().date, d(2021, 3, 5));
    }

    #[test]
    fn future_window_is_not_fetched() {
        let plan = plan_fetch(&[], d(2021, 6, 1), d(2021, 6, 30), d(2021, 5, 1));
        assert_eq!(plan, FetchPlan::NothingFetchable);
    }

    #[test]
    fn provider_failure_propagates_and_leaves_cache_alone() {
        let tmp = TempDir::new().unwrap();
        let cache = ParquetCache::new(tmp.path());
        let provider = RecordingProvider::failing();
        let clock = FixedClock(d(2022, 1, 3));
        let rec = RangeReconciler::new(&cache, Some(&provider), &clock);

        let result = rec.resolve("ABC", d(2021, 3, 1), d(2021, 3, 10));
        assert!(matches!(result, Err(DataError::NetworkUnreachable(_))));
        assert!(cache.load("ABC").unwrap().is_empty());
    }

    /// Answers with exchange-style uppercase symbols whatever was asked.
    struct UppercasingProvider(RecordingProvider);

    impl DataProvider for UppercasingProvider {
        fn name(&self) -> &str {
            "uppercasing"
        }

        fn fetch(
            &self,
            symbol: &str,
            start: NaiveDate,
            end: NaiveDate,
        ) -> Result<FetchResult, DataError> {
            self.0.fetch(&symbol.to_ascii_uppercase(), start, end)
        }
    }

    #[test]
    fn bars_are_cached_under_requested_symbol() {
        let tmp = TempDir::new().unwrap();
        let cache = ParquetCache::new(tmp.path());
        let provider = UppercasingProvider(RecordingProvider::default());
        let clock = FixedClock(d(2022, 1, 3));
        let rec = RangeReconciler::new(&cache, Some(&provider), &clock);

        let first = rec.resolve("sbin", d(2021, 3, 1), d(2021, 3, 10)).unwrap();
        let second = rec.resolve("sbin", d(2021, 3, 1), d(2021, 3, 10)).unwrap();

        assert_eq!(first.len(), 8);
        assert_eq!(first, second);
        assert!(first.iter().all(|b| b.symbol == "sbin"));
        assert_eq!(provider.0.calls().len(), 1);
    }

    #[test]
    fn offline_serves_what_is_cached() {
        let tmp = TempDir::new().unwrap();
        let cache = ParquetCache::new(tmp.path());
        cache
            .upsert(
                &weekday_bars("ABC", d(2021, 3, 1), d(2021, 3, 4)),
                DataSource::CsvImport,
            )
            .unwrap();
        let clock = FixedClock(d(2022, 1, 3));
        let rec = RangeReconciler::new(&cache, None, &clock);

        let bars = rec.resolve("ABC", d(2021, 3, 1), d(2021, 3, 10)).unwrap();
        assert_eq!(bars.len(), 4);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn resolved_bars_stay_inside_window(
            cached_from in 0i64..120,
            cached_len in 0i64..60,
            start_off in 0i64..150,
            len in 0i64..40,
        ) {
            let base = d(2021, 1, 1);
            let tmp = TempDir::new().unwrap();
            let cache = ParquetCache::new(tmp.path());
            let seed = weekday_bars(
                "ABC",
                base + Duration::days(cached_from),
                base + Duration::days(cached_from + cached_len),
            );
            cache.upsert(&seed, DataSource::CsvImport).unwrap();

            let provider = RecordingProvider::default();
            let clock = FixedClock(d(2022, 1, 3));
            let rec = RangeReconciler::new(&cache, Some(&provider), &clock);

            let start = base + Duration::days(start_off);
            let end = start + Duration::days(len);
            let bars = rec.resolve("ABC", start, end).unwrap();

            prop_assert!(bars.iter().all(|b| b.within(start, end)));
            prop_assert!(bars.windows(2).all(|w| w[0].date < w[1].date));
        }
    }
}
