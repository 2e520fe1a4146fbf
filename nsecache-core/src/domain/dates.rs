//! Calendar helpers for the `dd-mm-yyyy` dates used on the command line.

use chrono::{Datelike, NaiveDate, Weekday};

use crate::data::provider::DataError;

/// Date format accepted on the command line and written to result files.
pub const CLI_DATE_FORMAT: &str = "%d-%m-%Y";

/// Parse a `dd-mm-yyyy` date. Single-digit day and month are accepted.
pub fn parse_cli_date(s: &str) -> Result<NaiveDate, DataError> {
    NaiveDate::parse_from_str(s.trim(), CLI_DATE_FORMAT)
        .map_err(|e| DataError::InvalidDate(format!("'{s}' (expected dd-mm-yyyy): {e}")))
}

/// Render a date as `dd-mm-yyyy`.
pub fn format_cli_date(date: NaiveDate) -> String {
    date.format(CLI_DATE_FORMAT).to_string()
}

/// Saturday or Sunday.
pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Full English weekday name, e.g. "Monday".
pub fn weekday_name(date: NaiveDate) -> &'static str {
    match date.weekday() {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}
