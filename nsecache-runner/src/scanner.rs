//! Forward scan of a price window against profit targets and a stop-loss.
//!
//! Given the bars following an entry (offset 0 is the entry day itself) and a
//! reference price, the scanner tracks two independent profit targets ("near"
//! and "far"), a stop-loss that is live until the near target is reached, the
//! worst excursion against the position, and the best price reached over the
//! first ~3 months and the whole window.

use nsecache_core::domain::Bar;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Offsets below this count towards the 3-month extreme.
pub const THREE_MONTH_BARS: usize = 90;

/// Side of the simulated trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Buy,
    Sell,
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Ok(Direction::Buy),
            "sell" => Ok(Direction::Sell),
            other => Err(format!("unknown trade type '{other}' (expected buy or sell)")),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Buy => write!(f, "buy"),
            Direction::Sell => write!(f, "sell"),
        }
    }
}

/// Target and stop distances, in percent of the reference price.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub near_pct: f64,
    pub far_pct: f64,
    pub stop_loss_pct: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            near_pct: 3.0,
            far_pct: 5.0,
            stop_loss_pct: 5.0,
        }
    }
}

/// Absolute price levels for one trade.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradeLevels {
    pub price: f64,
    pub near_target: f64,
    pub far_target: f64,
    pub stop_loss: f64,
}

impl TradeLevels {
    pub fn new(price: f64, direction: Direction, thresholds: &Thresholds) -> Self {
        let up = |pct: f64| price * (1.0 + pct / 100.0);
        let down = |pct: f64| price * (1.0 - pct / 100.0);
        match direction {
            Direction::Buy => Self {
                price,
                near_target: up(thresholds.near_pct),
                far_target: up(thresholds.far_pct),
                stop_loss: down(thresholds.stop_loss_pct),
            },
            Direction::Sell => Self {
                price,
                near_target: down(thresholds.near_pct),
                far_target: down(thresholds.far_pct),
                stop_loss: up(thresholds.stop_loss_pct),
            },
        }
    }
}

/// How a target ended up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetOutcome {
    #[default]
    NotHit,
    TargetHit,
    StopLossHit,
}

impl fmt::Display for TargetOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetOutcome::NotHit => write!(f, "Not Hit"),
            TargetOutcome::TargetHit => write!(f, "Target Hit"),
            TargetOutcome::StopLossHit => write!(f, "SL hit"),
        }
    }
}

/// Evaluation of one target. `bars_taken` is 0 unless the target was hit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetResult {
    pub outcome: TargetOutcome,
    pub bars_taken: usize,
}

impl TargetResult {
    pub fn is_hit(&self) -> bool {
        self.outcome == TargetOutcome::TargetHit
    }

    fn try_hit(&mut self, reached: bool, offset: usize) {
        if self.outcome == TargetOutcome::NotHit && reached {
            self.outcome = TargetOutcome::TargetHit;
            self.bars_taken = offset;
        }
    }

    fn stop_out(&mut self) {
        if self.outcome != TargetOutcome::TargetHit {
            self.outcome = TargetOutcome::StopLossHit;
        }
    }
}

/// Everything one scan produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub direction: Direction,
    pub levels: TradeLevels,
    pub near: TargetResult,
    pub far: TargetResult,
    pub stop_loss_hit: bool,
    /// `(price - worst) / price * 100`
    pub max_adverse_pct: f64,
    /// Best price over offsets `1..90` (highest high for buys, lowest low for sells).
    pub extreme_3m: f64,
    /// Best price over the whole window.
    pub extreme_6m: f64,
}

/// Scan `bars` for a trade entered at `price` on `bars[0]`.
pub fn scan(bars: &[Bar], price: f64, direction: Direction, thresholds: &Thresholds) -> ScanReport {
    let levels = TradeLevels::new(price, direction, thresholds);

    let mut near = TargetResult::default();
    let mut far = TargetResult::default();
    let mut stop_loss_hit = false;

    let mut worst = price;
    let (mut extreme_3m, mut extreme_6m) = match direction {
        Direction::Buy => (0.0_f64, 0.0_f64),
        Direction::Sell => (price, price),
    };

    for (offset, bar) in bars.iter().enumerate().skip(1) {
        match direction {
            Direction::Buy => {
                if !near.is_hit() {
                    worst = worst.min(bar.low);
                }
                extreme_6m = extreme_6m.max(bar.high);
                if offset < THREE_MONTH_BARS {
                    extreme_3m = extreme_3m.max(bar.high);
                }
            }
            Direction::Sell => {
                worst = worst.max(bar.high);
                extreme_6m = extreme_6m.min(bar.low);
                if offset < THREE_MONTH_BARS {
                    extreme_3m = extreme_3m.min(bar.low);
                }
            }
        }

        if stop_loss_hit {
            continue;
        }

        let stopped = match direction {
            Direction::Buy => bar.close < levels.stop_loss,
            Direction::Sell => bar.close > levels.stop_loss,
        };
        if !near.is_hit() && stopped {
            stop_loss_hit = true;
            near.stop_out();
            far.stop_out();
            continue;
        }

        let reached = |target: f64| match direction {
            Direction::Buy => bar.low > target,
            Direction::Sell => bar.high < target,
        };
        near.try_hit(reached(levels.near_target), offset);
        far.try_hit(reached(levels.far_target), offset);
    }

    ScanReport {
        direction,
        levels,
        near,
        far,
        stop_loss_hit,
        max_adverse_pct: (price - worst) / price * 100.0,
        extreme_3m,
        extreme_6m,
    }
}
