//! Domain types for nsecache

pub mod bar;
pub mod dates;

pub use bar::Bar;
pub use dates::{format_cli_date, is_weekend, parse_cli_date, weekday_name, CLI_DATE_FORMAT};
