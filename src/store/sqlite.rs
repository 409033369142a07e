//! SQLite-backed [`MonitorStore`].
//!
//! Decimals are stored as TEXT so no precision is lost; timestamps are
//! RFC 3339 TEXT. One connection behind a mutex serialises all writes.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use tracing::info;

use super::{MonitorStore, StoreError};
use crate::exit::apex::{ApexRecord, ApexStatus};
use crate::position_engine::{ClosedTrade, Position, PositionStatus};
use crate::types::PriceSample;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS apex_records (
    symbol               TEXT PRIMARY KEY,
    apex_price           TEXT NOT NULL,
    apex_timestamp       TEXT NOT NULL,
    drop_start_timestamp TEXT,
    status               TEXT NOT NULL,
    last_sample_at       TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS apex_archive (
    id                   INTEGER PRIMARY KEY,
    symbol               TEXT NOT NULL,
    apex_price           TEXT NOT NULL,
    apex_timestamp       TEXT NOT NULL,
    drop_start_timestamp TEXT,
    status               TEXT NOT NULL,
    last_sample_at       TEXT NOT NULL,
    archived_at          TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS price_samples (
    id        INTEGER PRIMARY KEY,
    symbol    TEXT NOT NULL,
    price     TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_price_samples_symbol ON price_samples (symbol, timestamp);
CREATE TABLE IF NOT EXISTS positions (
    symbol         TEXT PRIMARY KEY,
    entry_price    TEXT NOT NULL,
    entry_time     TEXT NOT NULL,
    amount         TEXT NOT NULL,
    quote_currency TEXT NOT NULL,
    order_id       TEXT NOT NULL,
    status         TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS closed_trades (
    id                INTEGER PRIMARY KEY,
    symbol            TEXT NOT NULL,
    entry_price       TEXT NOT NULL,
    sell_price        TEXT NOT NULL,
    amount            TEXT NOT NULL,
    apex_price        TEXT,
    entry_time        TEXT NOT NULL,
    closed_at         TEXT NOT NULL,
    profit_percentage TEXT NOT NULL,
    reason            TEXT NOT NULL,
    order_id          TEXT NOT NULL
);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "sqlite store opened");
        Self::with_connection(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Number of stored samples for `symbol`.
    #[cfg(test)]
    pub fn sample_count(&self, symbol: &str) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM price_samples WHERE symbol = ?1",
            params![symbol],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as u64)
    }

    /// Archived apex records for `symbol`, oldest first.
    #[cfg(test)]
    pub fn archived_apex(&self, symbol: &str) -> Result<Vec<ApexRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, apex_price, apex_timestamp, drop_start_timestamp, status, last_sample_at
             FROM apex_archive WHERE symbol = ?1 ORDER BY id",
        )?;
        let raw = stmt
            .query_map(params![symbol], RawApex::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawApex::decode).collect()
    }
}

impl MonitorStore for SqliteStore {
    fn get_apex(&self, symbol: &str) -> Result<Option<ApexRecord>, StoreError> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                "SELECT symbol, apex_price, apex_timestamp, drop_start_timestamp, status, last_sample_at
                 FROM apex_records WHERE symbol = ?1",
                params![symbol],
                RawApex::from_row,
            )
            .optional()?;
        raw.map(RawApex::decode).transpose()
    }

    fn upsert_apex(&self, record: &ApexRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO apex_records
                 (symbol, apex_price, apex_timestamp, drop_start_timestamp, status, last_sample_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(symbol) DO UPDATE SET
                 apex_price = excluded.apex_price,
                 apex_timestamp = excluded.apex_timestamp,
                 drop_start_timestamp = excluded.drop_start_timestamp,
                 status = excluded.status,
                 last_sample_at = excluded.last_sample_at",
            params![
                record.symbol,
                record.apex_price.to_string(),
                record.apex_timestamp.to_rfc3339(),
                record.drop_start_timestamp.map(|t| t.to_rfc3339()),
                record.status.to_string(),
                record.last_sample_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn archive_apex(&self, symbol: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO apex_archive
                 (symbol, apex_price, apex_timestamp, drop_start_timestamp, status, last_sample_at, archived_at)
             SELECT symbol, apex_price, apex_timestamp, drop_start_timestamp, status, last_sample_at, ?2
             FROM apex_records WHERE symbol = ?1",
            params![symbol, Utc::now().to_rfc3339()],
        )?;
        tx.execute("DELETE FROM apex_records WHERE symbol = ?1", params![symbol])?;
        tx.commit()?;
        Ok(())
    }

    fn append_sample(&self, sample: &PriceSample) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO price_samples (symbol, price, timestamp) VALUES (?1, ?2, ?3)",
            params![
                sample.symbol,
                sample.price.to_string(),
                sample.timestamp.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn save_position(&self, position: &Position) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO positions
                 (symbol, entry_price, entry_time, amount, quote_currency, order_id, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                position.symbol,
                position.entry_price.to_string(),
                position.entry_time.to_rfc3339(),
                position.amount.to_string(),
                position.quote_currency,
                position.order_id,
                position.status.to_string(),
            ],
        )?;
        Ok(())
    }

    fn remove_position(&self, symbol: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM positions WHERE symbol = ?1", params![symbol])?;
        Ok(())
    }

    fn load_open_positions(&self) -> Result<Vec<Position>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, entry_price, entry_time, amount, quote_currency, order_id, status
             FROM positions ORDER BY symbol",
        )?;
        let rows = stmt
            .query_map([], RawPosition::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawPosition::decode).collect()
    }

    fn recent_trades(&self, limit: usize) -> Result<Vec<ClosedTrade>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, entry_price, sell_price, amount, apex_price, entry_time, closed_at,
                    profit_percentage, reason, order_id
             FROM closed_trades ORDER BY id DESC LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![limit], RawTrade::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawTrade::decode).collect()
    }

    fn record_trade(&self, trade: &ClosedTrade) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO closed_trades
                 (symbol, entry_price, sell_price, amount, apex_price, entry_time, closed_at,
                  profit_percentage, reason, order_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                trade.symbol,
                trade.entry_price.to_string(),
                trade.sell_price.to_string(),
                trade.amount.to_string(),
                trade.apex_price.map(|p| p.to_string()),
                trade.entry_time.to_rfc3339(),
                trade.closed_at.to_rfc3339(),
                trade.profit_percentage.to_string(),
                trade.reason,
                trade.order_id,
            ],
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

struct RawApex {
    symbol: String,
    apex_price: String,
    apex_timestamp: String,
    drop_start_timestamp: Option<String>,
    status: String,
    last_sample_at: String,
}

impl RawApex {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            symbol: row.get(0)?,
            apex_price: row.get(1)?,
            apex_timestamp: row.get(2)?,
            drop_start_timestamp: row.get(3)?,
            status: row.get(4)?,
            last_sample_at: row.get(5)?,
        })
    }

    fn decode(self) -> Result<ApexRecord, StoreError> {
        Ok(ApexRecord {
            symbol: self.symbol,
            apex_price: decimal(&self.apex_price)?,
            apex_timestamp: timestamp(&self.apex_timestamp)?,
            drop_start_timestamp: self.drop_start_timestamp.as_deref().map(timestamp).transpose()?,
            status: ApexStatus::from_str(&self.status).map_err(StoreError::Corrupt)?,
            last_sample_at: timestamp(&self.last_sample_at)?,
        })
    }
}

struct RawPosition {
    symbol: String,
    entry_price: String,
    entry_time: String,
    amount: String,
    quote_currency: String,
    order_id: String,
    status: String,
}

impl RawPosition {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            symbol: row.get(0)?,
            entry_price: row.get(1)?,
            entry_time: row.get(2)?,
            amount: row.get(3)?,
            quote_currency: row.get(4)?,
            order_id: row.get(5)?,
            status: row.get(6)?,
        })
    }

    fn decode(self) -> Result<Position, StoreError> {
        Ok(Position {
            symbol: self.symbol,
            entry_price: decimal(&self.entry_price)?,
            entry_time: timestamp(&self.entry_time)?,
            amount: decimal(&self.amount)?,
            quote_currency: self.quote_currency,
            order_id: self.order_id,
            status: PositionStatus::from_str(&self.status).map_err(StoreError::Corrupt)?,
        })
    }
}

struct RawTrade {
    symbol: String,
    entry_price: String,
    sell_price: String,
    amount: String,
    apex_price: Option<String>,
    entry_time: String,
    closed_at: String,
    profit_percentage: String,
    reason: String,
    order_id: String,
}

impl RawTrade {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            symbol: row.get(0)?,
            entry_price: row.get(1)?,
            sell_price: row.get(2)?,
            amount: row.get(3)?,
            apex_price: row.get(4)?,
            entry_time: row.get(5)?,
            closed_at: row.get(6)?,
            profit_percentage: row.get(7)?,
            reason: row.get(8)?,
            order_id: row.get(9)?,
        })
    }

    fn decode(self) -> Result<ClosedTrade, StoreError> {
        Ok(ClosedTrade {
            symbol: self.symbol,
            entry_price: decimal(&self.entry_price)?,
            sell_price: decimal(&self.sell_price)?,
            amount: decimal(&self.amount)?,
            apex_price: self.apex_price.as_deref().map(decimal).transpose()?,
            entry_time: timestamp(&self.entry_time)?,
            closed_at: timestamp(&self.closed_at)?,
            profit_percentage: decimal(&self.profit_percentage)?,
            reason: self.reason,
            order_id: self.order_id,
        })
    }
}

fn decimal(s: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(s).map_err(|e| StoreError::Corrupt(format!("decimal '{s}': {e}")))
}

fn timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn record(status: ApexStatus, drop_start: Option<DateTime<Utc>>) -> ApexRecord {
        ApexRecord {
            symbol: "WIFUSDT".to_string(),
            apex_price: dec!(0.000123456789),
            apex_timestamp: at(100),
            drop_start_timestamp: drop_start,
            status,
            last_sample_at: at(103),
        }
    }

    #[test]
    fn apex_upsert_overwrites_and_keeps_precision() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.get_apex("WIFUSDT").unwrap().is_none());

        store.upsert_apex(&record(ApexStatus::Rising, None)).unwrap();
        let dropping = record(ApexStatus::Dropping, Some(at(103)));
        store.upsert_apex(&dropping).unwrap();

        assert_eq!(store.get_apex("WIFUSDT").unwrap(), Some(dropping));
    }

    #[test]
    fn archive_moves_live_record() {
        let store = SqliteStore::open_in_memory().unwrap();
        let sold = record(ApexStatus::Sold, Some(at(103)));
        store.upsert_apex(&sold).unwrap();
        store.archive_apex("WIFUSDT").unwrap();

        assert!(store.get_apex("WIFUSDT").unwrap().is_none());
        assert_eq!(store.archived_apex("WIFUSDT").unwrap(), vec![sold]);
    }

    #[test]
    fn samples_are_appended() {
        let store = SqliteStore::open_in_memory().unwrap();
        for i in 0..3 {
            store
                .append_sample(&PriceSample::new("WIFUSDT", dec!(1.5), at(i)))
                .unwrap();
        }
        assert_eq!(store.sample_count("WIFUSDT").unwrap(), 3);
        assert_eq!(store.sample_count("DOGEUSDT").unwrap(), 0);
    }

    #[test]
    fn positions_survive_reload() {
        let store = SqliteStore::open_in_memory().unwrap();
        let pos = Position {
            symbol: "WIFUSDT".to_string(),
            entry_price: dec!(2.31),
            entry_time: at(50),
            amount: dec!(43.29),
            quote_currency: "USDT".to_string(),
            order_id: "123".to_string(),
            status: PositionStatus::Open,
        };
        store.save_position(&pos).unwrap();

        let mut failed = pos.clone();
        failed.status = PositionStatus::SellFailed;
        store.save_position(&failed).unwrap();
        assert_eq!(store.load_open_positions().unwrap(), vec![failed]);

        store.remove_position("WIFUSDT").unwrap();
        assert!(store.load_open_positions().unwrap().is_empty());
    }

    #[test]
    fn trades_are_journaled_newest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        for (i, reason) in ["apex_drawdown", "manual"].iter().enumerate() {
            store
                .record_trade(&ClosedTrade {
                    symbol: "WIFUSDT".to_string(),
                    entry_price: dec!(100),
                    sell_price: dec!(108),
                    amount: dec!(1),
                    apex_price: if i == 0 { Some(dec!(110)) } else { None },
                    entry_time: at(0),
                    closed_at: at(4 + i as i64),
                    profit_percentage: dec!(8),
                    reason: reason.to_string(),
                    order_id: format!("o{i}"),
                })
                .unwrap();
        }
        let trades = store.recent_trades(10).unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].reason, "manual");
        assert_eq!(trades[1].apex_price, Some(dec!(110)));
    }

    #[test]
    fn corrupt_status_is_reported() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .conn
            .lock()
            .execute(
                "INSERT INTO apex_records VALUES ('X', '1', ?1, NULL, 'peak', ?1)",
                params![at(1).to_rfc3339()],
            )
            .unwrap();
        assert!(matches!(store.get_apex("X"), Err(StoreError::Corrupt(_))));
    }
}
