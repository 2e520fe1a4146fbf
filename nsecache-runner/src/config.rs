//! Runner configuration, loaded from an optional `nsecache.toml`.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration. Command-line flags are applied on top by the binary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::scanner::Thresholds;

/// Upper bound for `lookahead_weeks` (ten years).
pub const MAX_LOOKAHEAD_WEEKS: i64 = 520;

/// Errors from loading or validating a config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which provider fills cache gaps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// NSE historical archive API.
    #[default]
    Nse,
    /// Per-symbol CSV exports in `csv_dir`.
    Csv,
}

impl FromStr for SourceKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nse" => Ok(SourceKind::Nse),
            "csv" => Ok(SourceKind::Csv),
            other => Err(ConfigError::Invalid(format!(
                "unknown source '{other}' (expected nse or csv)"
            ))),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Nse => write!(f, "nse"),
            SourceKind::Csv => write!(f, "csv"),
        }
    }
}

/// Top-level runner configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Root of the Parquet bar cache.
    pub cache_dir: PathBuf,
    /// Directory for sentinel files and, by default, the results file.
    pub data_dir: PathBuf,
    /// Results CSV. Defaults to `{data_dir}/backtest_results.csv`.
    pub results_file: Option<PathBuf>,
    /// Length of the forward window scanned after the entry date.
    pub lookahead_weeks: i64,
    pub thresholds: Thresholds,
    pub source: SourceKind,
    /// Directory of `{SYMBOL}.csv` exports when `source = "csv"`.
    pub csv_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(".nsecache"),
            data_dir: PathBuf::from("data"),
            results_file: None,
            lookahead_weeks: 30,
            thresholds: Thresholds::default(),
            source: SourceKind::Nse,
            csv_dir: PathBuf::from("data/csv"),
        }
    }
}

impl RunnerConfig {
    /// Load and validate a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: RunnerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_LOOKAHEAD_WEEKS).contains(&self.lookahead_weeks) {
            return Err(ConfigError::Invalid(format!(
                "lookahead_weeks must be in 1..={MAX_LOOKAHEAD_WEEKS}, got {}",
                self.lookahead_weeks
            )));
        }
        let t = &self.thresholds;
        for (name, value) in [
            ("near_pct", t.near_pct),
            ("far_pct", t.far_pct),
            ("stop_loss_pct", t.stop_loss_pct),
        ] {
            if !(value > 0.0 && value < 100.0) {
                return Err(ConfigError::Invalid(format!(
                    "thresholds.{name} must be in (0, 100), got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Where completed runs are appended.
    pub fn results_path(&self) -> PathBuf {
        self.results_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("backtest_results.csv"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_is_all_defaults() {
        let config = RunnerConfig::from_toml("").unwrap();
        assert_eq!(config, RunnerConfig::default());
        assert_eq!(config.lookahead_weeks, 30);
        assert_eq!(
            config.results_path(),
            PathBuf::from("data").join("backtest_results.csv")
        );
    }

    #[test]
    fn partial_toml_overrides_named_fields() {
        let config = RunnerConfig::from_toml(
            r#"
cache_dir = "/var/cache/nse"
source = "csv"
csv_dir = "exports"
results_file = "out/results.csv"

[thresholds]
near_pct = 15.0
far_pct = 20.0
"#,
        )
        .unwrap();

        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/nse"));
        assert_eq!(config.source, SourceKind::Csv);
        assert_eq!(config.thresholds.near_pct, 15.0);
        assert_eq!(config.thresholds.far_pct, 20.0);
        assert_eq!(config.thresholds.stop_loss_pct, 5.0);
        assert_eq!(config.results_path(), PathBuf::from("out/results.csv"));
    }

    #[test]
    fn rejects_non_positive_lookahead() {
        assert!(matches!(
            RunnerConfig::from_toml("lookahead_weeks = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_oversized_lookahead() {
        assert!(matches!(
            RunnerConfig::from_toml("lookahead_weeks = 100000000"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(RunnerConfig::from_toml("lookahead_weeks = 520").is_ok());
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        assert!(matches!(
            RunnerConfig::from_toml("[thresholds]\nstop_loss_pct = 120.0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_unknown_source() {
        assert!(matches!(
            RunnerConfig::from_toml("source = \"yahoo\""),
            Err(ConfigError::Parse(_))
        ));
        assert!("yahoo".parse::<SourceKind>().is_err());
        assert_eq!("CSV".parse::<SourceKind>().unwrap(), SourceKind::Csv);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = RunnerConfig::from_file(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
