//! Data providers, the Parquet bar cache, and range reconciliation

pub mod cache;
pub mod csv_import;
pub mod nse;
pub mod provider;
pub mod reconcile;

pub use cache::{CacheMeta, CacheStatus, ParquetCache, UpsertStats};
pub use csv_import::{read_bars_csv, write_bars_csv, CsvProvider};
pub use nse::NseProvider;
pub use provider::{DataError, DataProvider, DataSource, FetchResult};
pub use reconcile::{
    plan_fetch, prune, Clock, FetchPlan, FixedClock, RangeReconciler, RequestWindow, SystemClock,
};
