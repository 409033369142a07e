// =============================================================================
// Position Engine — held positions and the closed-trade journal
// =============================================================================
//
// Life-cycle:
//   Open  ->  (sold by monitor or manual sell)  ->  ClosedTrade
//   Open  ->  SellFailed (exchange rejected the sell; manual intervention)
//
// At most one open position per symbol: the monitor registry relies on this
// to keep a single writer per symbol.
//
// Thread-safety: all mutable state is behind `parking_lot::RwLock`.
// =============================================================================

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::exit::apex::{format_profit, profit_percentage};

/// Maximum number of closed trades kept in memory for the API.
const MAX_JOURNAL_LEN: usize = 200;

// ---------------------------------------------------------------------------
// Position model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    /// The exit sell was rejected; never retried automatically.
    SellFailed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::SellFailed => write!(f, "SellFailed"),
        }
    }
}

impl std::str::FromStr for PositionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Open" => Ok(Self::Open),
            "SellFailed" => Ok(Self::SellFailed),
            other => Err(format!("unknown position status '{other}'")),
        }
    }
}

/// A held position. Created on buy, destroyed on sell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    /// Base-asset quantity held.
    pub amount: Decimal,
    pub quote_currency: String,
    /// Exchange order id of the buy (or simulated id in demo mode).
    pub order_id: String,
    pub status: PositionStatus,
}

/// Journal entry written when a position is sold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub symbol: String,
    pub entry_price: Decimal,
    pub sell_price: Decimal,
    pub amount: Decimal,
    /// Apex at the time of sale; `None` for manual sells before any sample.
    pub apex_price: Option<Decimal>,
    pub entry_time: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub profit_percentage: Decimal,
    pub reason: String,
    pub order_id: String,
}

// ---------------------------------------------------------------------------
// Position Manager
// ---------------------------------------------------------------------------

pub struct PositionManager {
    open: RwLock<HashMap<String, Position>>,
    /// Symbols with a buy in flight. Lock order: `open` before `pending`.
    pending: RwLock<HashSet<String>>,
    closed: RwLock<Vec<ClosedTrade>>,
}

/// Claim on a symbol while its opening buy is in flight. Dropping it frees
/// the symbol again; once the position is open the `open` map blocks
/// duplicates on its own.
#[must_use]
pub struct SymbolReservation<'a> {
    manager: &'a PositionManager,
    symbol: String,
}

impl Drop for SymbolReservation<'_> {
    fn drop(&mut self) {
        self.manager.pending.write().remove(&self.symbol);
    }
}

impl PositionManager {
    pub fn new() -> Self {
        Self {
            open: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashSet::new()),
            closed: RwLock::new(Vec::new()),
        }
    }

    /// Reserve `symbol` for a buy. Fails if it is held or already reserved.
    pub fn reserve(&self, symbol: &str) -> Result<SymbolReservation<'_>> {
        let open = self.open.read();
        if open.contains_key(symbol) {
            bail!("already holding a position in {symbol}");
        }
        if !self.pending.write().insert(symbol.to_string()) {
            bail!("a buy for {symbol} is already in progress");
        }
        Ok(SymbolReservation {
            manager: self,
            symbol: symbol.to_string(),
        })
    }

    /// Track a freshly bought (or reloaded) position. Fails if the symbol
    /// is already held.
    pub fn open_position(&self, position: Position) -> Result<()> {
        let mut open = self.open.write();
        if open.contains_key(&position.symbol) {
            bail!("already holding a position in {}", position.symbol);
        }

        info!(
            symbol = %position.symbol,
            entry_price = %position.entry_price,
            amount = %position.amount,
            quote = %position.quote_currency,
            order_id = %position.order_id,
            status = %position.status,
            "position opened"
        );

        open.insert(position.symbol.clone(), position);
        Ok(())
    }

    /// Close the position in `symbol` and append it to the journal.
    ///
    /// Returns `None` if no position is held in `symbol`.
    pub fn close_position(
        &self,
        symbol: &str,
        sell_price: Decimal,
        apex_price: Option<Decimal>,
        reason: &str,
        order_id: &str,
        closed_at: DateTime<Utc>,
    ) -> Option<ClosedTrade> {
        let pos = self.open.write().remove(symbol)?;

        let trade = ClosedTrade {
            symbol: pos.symbol,
            entry_price: pos.entry_price,
            sell_price,
            amount: pos.amount,
            apex_price,
            entry_time: pos.entry_time,
            closed_at,
            profit_percentage: profit_percentage(pos.entry_price, sell_price),
            reason: reason.to_string(),
            order_id: order_id.to_string(),
        };

        info!(
            symbol,
            reason,
            sell_price = %sell_price,
            profit = %format_profit(trade.profit_percentage),
            order_id,
            "position closed"
        );

        let mut closed = self.closed.write();
        closed.push(trade.clone());
        if closed.len() > MAX_JOURNAL_LEN {
            let excess = closed.len() - MAX_JOURNAL_LEN;
            closed.drain(..excess);
        }
        Some(trade)
    }

    /// Flag a position whose exit sell failed. Returns the updated position.
    pub fn mark_sell_failed(&self, symbol: &str) -> Option<Position> {
        let mut open = self.open.write();
        let pos = open.get_mut(symbol)?;
        pos.status = PositionStatus::SellFailed;
        error!(
            symbol,
            critical = true,
            "position marked SellFailed — manual intervention required"
        );
        Some(pos.clone())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get_position(&self, symbol: &str) -> Option<Position> {
        self.open.read().get(symbol).cloned()
    }

    /// Snapshot of all held positions, sorted by symbol.
    pub fn get_open_positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.open.read().values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    /// The most recent `count` closed trades (newest first).
    pub fn get_closed_trades(&self, count: usize) -> Vec<ClosedTrade> {
        let closed = self.closed.read();
        closed.iter().rev().take(count).cloned().collect()
    }
}

impl Default for PositionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let open_count = self.open.read().len();
        let closed_count = self.closed.read().len();
        f.debug_struct("PositionManager")
            .field("open_positions", &open_count)
            .field("closed_trades", &closed_count)
            .finish()
    }
}
