//! Per-symbol processing state, persisted as sentinel files.
//!
//! `.{SYMBOL}.done` marks a symbol whose backtest completed; `.{SYMBOL}.err`
//! marks one that failed and holds the failure reason. Either file makes the
//! runner skip the symbol until it is reset.

use serde::Serialize;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

const DONE_SUFFIX: &str = ".done";
const ERR_SUFFIX: &str = ".err";

/// Processing state of one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SymbolStatus {
    Pending,
    Done,
    Errored(String),
}

impl SymbolStatus {
    /// Done and errored symbols are not run again.
    pub fn is_settled(&self) -> bool {
        !matches!(self, SymbolStatus::Pending)
    }
}

impl fmt::Display for SymbolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymbolStatus::Pending => write!(f, "pending"),
            SymbolStatus::Done => write!(f, "done"),
            SymbolStatus::Errored(reason) if reason.is_empty() => write!(f, "errored"),
            SymbolStatus::Errored(reason) => write!(f, "errored ({reason})"),
        }
    }
}

/// Sentinel-file store rooted at the data directory.
pub struct SentinelStore {
    dir: PathBuf,
}

impl SentinelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn done_path(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!(".{symbol}{DONE_SUFFIX}"))
    }

    fn err_path(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!(".{symbol}{ERR_SUFFIX}"))
    }

    pub fn status(&self, symbol: &str) -> io::Result<SymbolStatus> {
        if self.done_path(symbol).is_file() {
            return Ok(SymbolStatus::Done);
        }
        let err_path = self.err_path(symbol);
        if err_path.is_file() {
            let reason = fs::read_to_string(&err_path)?;
            return Ok(SymbolStatus::Errored(reason.trim().to_string()));
        }
        Ok(SymbolStatus::Pending)
    }

    pub fn mark_done(&self, symbol: &str) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.done_path(symbol), b"")?;
        remove_if_exists(&self.err_path(symbol))?;
        debug!(symbol, "marked done");
        Ok(())
    }

    pub fn mark_errored(&self, symbol: &str, reason: &str) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.err_path(symbol), reason)?;
        debug!(symbol, reason, "marked errored");
        Ok(())
    }

    /// Drop both markers. Returns true if anything was removed.
    pub fn reset(&self, symbol: &str) -> io::Result<bool> {
        let done = remove_if_exists(&self.done_path(symbol))?;
        let err = remove_if_exists(&self.err_path(symbol))?;
        Ok(done || err)
    }

    /// Every symbol with a marker, sorted by symbol.
    pub fn list(&self) -> io::Result<Vec<(String, SymbolStatus)>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut symbols = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            let Some(rest) = name.strip_prefix('.') else {
                continue;
            };
            let symbol = rest
                .strip_suffix(DONE_SUFFIX)
                .or_else(|| rest.strip_suffix(ERR_SUFFIX));
            if let Some(symbol) = symbol.filter(|s| !s.is_empty()) {
                symbols.push(symbol.to_string());
            }
        }
        symbols.sort();
        symbols.dedup();

        symbols
            .into_iter()
            .map(|symbol| {
                let status = self.status(&symbol)?;
                Ok((symbol, status))
            })
            .collect()
    }
}

fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
