//! nsecache core: daily bar types, the on-disk Parquet cache, data providers,
//! and the range reconciler that keeps the cache topped up.
//!
//! - Domain types (bars, `dd-mm-yyyy` calendar helpers)
//! - Parquet cache partitioned by symbol and year, upserted on (symbol, date)
//! - Providers behind the `DataProvider` trait (NSE archive API, CSV exports)
//! - Range reconciliation with a one-week probe margin and an injectable clock

pub mod data;
pub mod domain;
