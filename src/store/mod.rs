// =============================================================================
// Persistence — apex records, price samples, positions and the trade journal
// =============================================================================
//
// The monitor treats storage as best-effort: it retries a failed write once
// and otherwise keeps running in memory. Implementations must serialise
// writes; the registry already guarantees one writer per symbol.
// =============================================================================

pub mod sqlite;

use crate::exit::apex::ApexRecord;
use crate::position_engine::{ClosedTrade, Position};
use crate::types::PriceSample;

pub use sqlite::SqliteStore;

/// Errors returned by store operations.
#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    /// A stored row could not be decoded back into a domain value.
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "sqlite: {e}"),
            StoreError::Corrupt(msg) => write!(f, "corrupt row: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

/// Storage used by the monitor and the API, keyed by symbol.
pub trait MonitorStore: Send + Sync {
    fn get_apex(&self, symbol: &str) -> Result<Option<ApexRecord>, StoreError>;

    fn upsert_apex(&self, record: &ApexRecord) -> Result<(), StoreError>;

    /// Move the live record for `symbol` into the archive.
    fn archive_apex(&self, symbol: &str) -> Result<(), StoreError>;

    fn append_sample(&self, sample: &PriceSample) -> Result<(), StoreError>;

    fn save_position(&self, position: &Position) -> Result<(), StoreError>;

    fn remove_position(&self, symbol: &str) -> Result<(), StoreError>;

    fn load_open_positions(&self) -> Result<Vec<Position>, StoreError>;

    fn record_trade(&self, trade: &ClosedTrade) -> Result<(), StoreError>;

    /// Journal rows, newest first.
    fn recent_trades(&self, limit: usize) -> Result<Vec<ClosedTrade>, StoreError>;
}
