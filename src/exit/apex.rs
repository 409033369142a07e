// =============================================================================
// Apex Tracker — running-maximum / drawdown sell rule for one position
// =============================================================================
//
// State machine (per open position):
//
//   Rising   --price <  apex-->  Dropping (drop_start = sample time)
//   Dropping --price >= apex-->  Rising   (new apex, drop_start cleared)
//   Dropping --drop >= threshold-->  Sold (emit SellSignal once)
//   Sold     -- terminal, further samples are ignored
//
// The drop is timed from the apex timestamp, i.e. the last sample that was
// at or above the apex. `drop_start_timestamp` records the first sample
// observed below it.
//
// All comparisons are done on `Decimal` at the feed's native precision; the
// profit percentage is only rounded when rendered for humans.
// =============================================================================

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::position_engine::Position;

// =============================================================================
// Apex record
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApexStatus {
    Rising,
    Dropping,
    Sold,
}

impl std::fmt::Display for ApexStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rising => write!(f, "rising"),
            Self::Dropping => write!(f, "dropping"),
            Self::Sold => write!(f, "sold"),
        }
    }
}

impl std::str::FromStr for ApexStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rising" => Ok(Self::Rising),
            "dropping" => Ok(Self::Dropping),
            "sold" => Ok(Self::Sold),
            other => Err(format!("unknown apex status '{other}'")),
        }
    }
}

/// Live apex state for one open position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApexRecord {
    pub symbol: String,
    pub apex_price: Decimal,
    pub apex_timestamp: DateTime<Utc>,
    pub drop_start_timestamp: Option<DateTime<Utc>>,
    pub status: ApexStatus,
    /// Timestamp of the newest accepted sample; guards against replays and
    /// out-of-order feeds across restarts.
    pub last_sample_at: DateTime<Utc>,
}

impl ApexRecord {
    fn seed(symbol: &str, price: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            apex_price: price,
            apex_timestamp: timestamp,
            drop_start_timestamp: None,
            status: ApexStatus::Rising,
            last_sample_at: timestamp,
        }
    }

    /// How long the price has been below the apex as of `now`.
    pub fn drop_elapsed(&self, now: DateTime<Utc>) -> Duration {
        if self.status != ApexStatus::Dropping {
            return Duration::ZERO;
        }
        (now - self.apex_timestamp).to_std().unwrap_or_default()
    }
}

// =============================================================================
// Sell signal
// =============================================================================

/// Emitted exactly once when a drawdown outlasts the configured threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellSignal {
    pub symbol: String,
    pub amount: Decimal,
    pub entry_price: Decimal,
    pub apex_price: Decimal,
    pub apex_timestamp: DateTime<Utc>,
    pub sell_price: Decimal,
    pub holding_time: Duration,
    pub profit_percentage: Decimal,
    pub triggered_at: DateTime<Utc>,
}

impl SellSignal {
    /// Profit percentage rendered to two decimals, e.g. `+8.00%`.
    pub fn profit_display(&self) -> String {
        format_profit(self.profit_percentage)
    }
}

/// `(sell - entry) / entry * 100`, unrounded. Zero when entry is not positive.
pub fn profit_percentage(entry_price: Decimal, sell_price: Decimal) -> Decimal {
    if entry_price <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (sell_price - entry_price) / entry_price * Decimal::ONE_HUNDRED
}

pub fn format_profit(pct: Decimal) -> String {
    let rounded = pct.round_dp(2);
    if rounded.is_sign_negative() && !rounded.is_zero() {
        format!("{rounded:.2}%")
    } else {
        format!("+{:.2}%", rounded.abs())
    }
}

// =============================================================================
// Sample rejection
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleRejection {
    SymbolMismatch {
        expected: String,
        got: String,
    },
    NonPositivePrice(Decimal),
    OutOfOrder {
        last: DateTime<Utc>,
        got: DateTime<Utc>,
    },
}

impl std::fmt::Display for SampleRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SymbolMismatch { expected, got } => {
                write!(f, "sample for {got} fed to tracker for {expected}")
            }
            Self::NonPositivePrice(p) => write!(f, "non-positive price {p}"),
            Self::OutOfOrder { last, got } => write!(
                f,
                "out-of-order sample at {} (last accepted {})",
                got.to_rfc3339(),
                last.to_rfc3339()
            ),
        }
    }
}

impl std::error::Error for SampleRejection {}

// =============================================================================
// Tracker
// =============================================================================

/// Per-position apex/drawdown state machine.
#[derive(Debug, Clone)]
pub struct ApexTracker {
    symbol: String,
    entry_price: Decimal,
    entry_time: DateTime<Utc>,
    amount: Decimal,
    drop_threshold: Duration,
    record: Option<ApexRecord>,
}

impl ApexTracker {
    /// Start tracking `position`. A stored record (from a previous run) is
    /// resumed as-is; a missing one means the first sample seeds the apex.
    pub fn new(position: &Position, drop_threshold: Duration, record: Option<ApexRecord>) -> Self {
        let record = record.filter(|r| r.symbol == position.symbol);
        Self {
            symbol: position.symbol.clone(),
            entry_price: position.entry_price,
            entry_time: position.entry_time,
            amount: position.amount,
            drop_threshold,
            record,
        }
    }

    pub fn record(&self) -> Option<&ApexRecord> {
        self.record.as_ref()
    }

    pub fn is_sold(&self) -> bool {
        matches!(self.record.as_ref().map(|r| r.status), Some(ApexStatus::Sold))
    }

    /// Feed one sample. Returns `Ok(Some(signal))` on the single transition
    /// into `Sold`; rejected samples leave the state untouched.
    pub fn on_price_sample(
        &mut self,
        symbol: &str,
        price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<SellSignal>, SampleRejection> {
        if symbol != self.symbol {
            return Err(SampleRejection::SymbolMismatch {
                expected: self.symbol.clone(),
                got: symbol.to_string(),
            });
        }
        if price <= Decimal::ZERO {
            return Err(SampleRejection::NonPositivePrice(price));
        }

        let record = match self.record.as_mut() {
            Some(r) => r,
            None => {
                debug!(symbol, price = %price, "first sample seeds apex");
                self.record = Some(ApexRecord::seed(symbol, price, timestamp));
                return Ok(None);
            }
        };

        if timestamp < record.last_sample_at {
            return Err(SampleRejection::OutOfOrder {
                last: record.last_sample_at,
                got: timestamp,
            });
        }

        if record.status == ApexStatus::Sold {
            debug!(symbol, "sample after sell ignored");
            return Ok(None);
        }

        record.last_sample_at = timestamp;

        if price >= record.apex_price {
            if record.status == ApexStatus::Dropping {
                info!(
                    symbol,
                    old_apex = %record.apex_price,
                    new_apex = %price,
                    "price recovered to new apex"
                );
            }
            record.apex_price = price;
            record.apex_timestamp = timestamp;
            record.drop_start_timestamp = None;
            record.status = ApexStatus::Rising;
            return Ok(None);
        }

        if record.status == ApexStatus::Rising {
            record.status = ApexStatus::Dropping;
            record.drop_start_timestamp = Some(timestamp);
            info!(
                symbol,
                apex = %record.apex_price,
                price = %price,
                "price dropped below apex"
            );
        }

        let elapsed = record.drop_elapsed(timestamp);
        if elapsed < self.drop_threshold {
            debug!(
                symbol,
                price = %price,
                apex = %record.apex_price,
                elapsed_ms = elapsed.as_millis() as u64,
                "still below apex"
            );
            return Ok(None);
        }

        record.status = ApexStatus::Sold;

        let signal = SellSignal {
            symbol: self.symbol.clone(),
            amount: self.amount,
            entry_price: self.entry_price,
            apex_price: record.apex_price,
            apex_timestamp: record.apex_timestamp,
            sell_price: price,
            holding_time: (timestamp - self.entry_time).to_std().unwrap_or_default(),
            profit_percentage: profit_percentage(self.entry_price, price),
            triggered_at: timestamp,
        };

        if signal.profit_percentage.is_sign_negative() {
            warn!(
                symbol,
                apex = %signal.apex_price,
                sell_price = %signal.sell_price,
                profit = %signal.profit_display(),
                "drawdown threshold reached — selling at a loss"
            );
        } else {
            info!(
                symbol,
                apex = %signal.apex_price,
                sell_price = %signal.sell_price,
                profit = %signal.profit_display(),
                "drawdown threshold reached — sell signal"
            );
        }

        Ok(Some(signal))
    }
}

// =============================================================================
// Tests
// =============================================================================
