// =============================================================================
// Central Application State — Night Stalker exit engine
// =============================================================================
//
// Ties the subsystems together for the REST API: configuration, the position
// book, the monitor registry, the store and the execution engine. Also hosts
// the two operator commands that span several subsystems (open a position,
// sell a position by hand).
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock for mutable shared collections.
//   - Arc wrappers for subsystems that manage their own interior mutability.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::execution::{ExecutionEngine, OrderExecutor};
use crate::exit::monitor::{persist, MonitorDeps, MonitorExit, MonitorSettings};
use crate::exit::registry::MonitorRegistry;
use crate::market_data::PriceFeed;
use crate::position_engine::{ClosedTrade, Position, PositionManager, PositionStatus};
use crate::runtime_config::RuntimeConfig;
use crate::store::MonitorStore;
use crate::types::normalize_symbol;

/// Journal reason for operator-initiated exits.
pub const MANUAL_SELL_REASON: &str = "manual";

// =============================================================================
// Error Record
// =============================================================================

/// A recorded error event for the API error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Failure of an operator command, classified for the HTTP layer.
#[derive(Debug)]
pub enum CommandError {
    NotFound(String),
    Conflict(String),
    Invalid(String),
    Failed(anyhow::Error),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::NotFound(msg) | CommandError::Conflict(msg) | CommandError::Invalid(msg) => {
                write!(f, "{msg}")
            }
            CommandError::Failed(e) => write!(f, "{e:#}"),
        }
    }
}

impl std::error::Error for CommandError {}

// =============================================================================
// AppState
// =============================================================================

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    /// Incremented on every position open/close or monitor change.
    pub state_version: AtomicU64,

    pub runtime_config: Arc<RwLock<RuntimeConfig>>,

    pub position_manager: Arc<PositionManager>,
    pub registry: Arc<MonitorRegistry>,
    pub store: Arc<dyn MonitorStore>,
    pub feed: Arc<dyn PriceFeed>,
    pub execution: Arc<ExecutionEngine>,

    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    /// Instant when the engine was started. Used for uptime calculations.
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        store: Arc<dyn MonitorStore>,
        feed: Arc<dyn PriceFeed>,
        execution: Arc<ExecutionEngine>,
    ) -> Self {
        let position_manager = Arc::new(PositionManager::new());
        let executor: Arc<dyn OrderExecutor> = execution.clone();
        let registry = MonitorRegistry::new(
            MonitorDeps {
                feed: feed.clone(),
                executor,
                store: store.clone(),
                positions: position_manager.clone(),
            },
            MonitorSettings::from_config(&config),
        );

        Self {
            state_version: AtomicU64::new(1),
            runtime_config: Arc::new(RwLock::new(config)),
            position_manager,
            registry: Arc::new(registry),
            store,
            feed,
            execution,
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version Management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Error Logging ───────────────────────────────────────────────────

    /// Record an error message. The ring buffer is capped at
    /// [`MAX_RECENT_ERRORS`]; oldest entries are evicted first.
    pub fn push_error(&self, msg: String) {
        let record = ErrorRecord {
            message: msg,
            at: Utc::now().to_rfc3339(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);

        self.increment_version();
    }

    // ── Symbols ─────────────────────────────────────────────────────────

    /// Normalise `raw` and append the configured quote currency when the
    /// caller passed a bare base asset ("pepe" -> "PEPEUSDT").
    pub fn resolve_symbol(&self, raw: &str) -> String {
        let symbol = normalize_symbol(raw);
        let quote = self.runtime_config.read().quote_currency.clone();
        if symbol.is_empty() || symbol.ends_with(&quote) {
            symbol
        } else {
            format!("{symbol}{quote}")
        }
    }

    // ── Commands ────────────────────────────────────────────────────────

    /// Buy `quote_amount` worth of `raw_symbol` and start monitoring it.
    pub async fn open_position(
        &self,
        raw_symbol: &str,
        quote_amount: Decimal,
    ) -> Result<Position, CommandError> {
        let symbol = self.resolve_symbol(raw_symbol);
        if symbol.is_empty() {
            return Err(CommandError::Invalid("symbol is required".to_string()));
        }
        if quote_amount <= Decimal::ZERO {
            return Err(CommandError::Invalid(format!(
                "quote_amount must be positive, got {quote_amount}"
            )));
        }
        let _reservation = self
            .position_manager
            .reserve(&symbol)
            .map_err(|e| CommandError::Conflict(e.to_string()))?;

        let fill = self.execution.buy(&symbol, quote_amount).await.map_err(|e| {
            self.push_error(format!("buy {symbol} failed: {e:#}"));
            CommandError::Failed(e)
        })?;

        let position = Position {
            symbol: symbol.clone(),
            entry_price: fill.price,
            entry_time: Utc::now(),
            amount: fill.amount,
            quote_currency: self.runtime_config.read().quote_currency.clone(),
            order_id: fill.order_id,
            status: PositionStatus::Open,
        };

        self.position_manager
            .open_position(position.clone())
            .map_err(|e| CommandError::Conflict(e.to_string()))?;
        persist(&symbol, "save position", || self.store.save_position(&position));

        if let Err(e) = self.registry.start(position.clone()) {
            error!(symbol = %symbol, error = %e, "position bought but monitor failed to start");
            self.push_error(format!("monitor for {symbol} failed to start: {e:#}"));
        }

        self.increment_version();
        Ok(position)
    }

    /// Stop the monitor for `raw_symbol`, then sell the position once.
    ///
    /// If the monitor sold on its own while being stopped, that trade is
    /// returned and no second order is sent.
    pub async fn sell_position(&self, raw_symbol: &str) -> Result<ClosedTrade, CommandError> {
        let symbol = self.resolve_symbol(raw_symbol);

        if let Some(MonitorExit::Sold(trade)) = self.registry.stop(&symbol).await {
            info!(symbol = %symbol, "monitor sold before manual sell ran");
            self.increment_version();
            return Ok(trade);
        }

        let position = self
            .position_manager
            .get_position(&symbol)
            .ok_or_else(|| CommandError::NotFound(format!("no open position in {symbol}")))?;

        let price = match self.feed.current_price(&symbol).await {
            Ok(p) => p,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "manual sell aborted — no price");
                self.push_error(format!("manual sell {symbol}: no price: {e:#}"));
                self.restart_monitor(position);
                return Err(CommandError::Failed(e.context("price unavailable")));
            }
        };

        let outcome = self.execution.sell(&symbol, position.amount, price).await;
        if !outcome.success {
            let reason = outcome.error.unwrap_or_else(|| "unknown".to_string());
            error!(symbol = %symbol, critical = true, error = %reason, "MANUAL SELL FAILED");
            if let Some(flagged) = self.position_manager.mark_sell_failed(&symbol) {
                persist(&symbol, "save position", || self.store.save_position(&flagged));
            }
            self.push_error(format!("manual sell {symbol} failed: {reason}"));
            self.increment_version();
            return Err(CommandError::Failed(anyhow::anyhow!("sell rejected: {reason}")));
        }

        let apex_price = match self.store.get_apex(&symbol) {
            Ok(rec) => rec.map(|r| r.apex_price),
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "apex record unavailable for journal");
                None
            }
        };

        let trade = self
            .position_manager
            .close_position(
                &symbol,
                outcome.sell_price,
                apex_price,
                MANUAL_SELL_REASON,
                &outcome.order_id,
                Utc::now(),
            )
            .ok_or_else(|| CommandError::NotFound(format!("position in {symbol} vanished")))?;

        persist(&symbol, "record trade", || self.store.record_trade(&trade));
        persist(&symbol, "remove position", || self.store.remove_position(&symbol));
        persist(&symbol, "archive apex", || self.store.archive_apex(&symbol));

        self.increment_version();
        Ok(trade)
    }

    fn restart_monitor(&self, position: Position) {
        if position.status != PositionStatus::Open {
            return;
        }
        let symbol = position.symbol.clone();
        if let Err(e) = self.registry.start(position) {
            error!(symbol = %symbol, error = %e, "could not restart monitor");
        }
    }

    /// Closed trades, newest first. Falls back to the in-memory journal
    /// when the store cannot be read.
    pub fn recent_trades(&self, limit: usize) -> Vec<ClosedTrade> {
        match self.store.recent_trades(limit) {
            Ok(trades) => trades,
            Err(e) => {
                warn!(error = %e, "trade journal read failed — serving in-memory copy");
                self.position_manager.get_closed_trades(limit)
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::binance::BinanceClient;
    use crate::exit::monitor::tests::ScriptedFeed;
    use crate::store::SqliteStore;
    use crate::types::AccountMode;

    /// Demo-mode state over an in-memory store. The feed repeats its last
    /// price after the scripted values.
    pub(crate) fn demo_state(script: Vec<Option<Decimal>>) -> Arc<AppState> {
        demo_state_with(Arc::new(ScriptedFeed::new(script)))
    }

    fn demo_state_with(feed: Arc<dyn PriceFeed>) -> Arc<AppState> {
        let execution = Arc::new(ExecutionEngine::new(
            Arc::new(BinanceClient::new("", "").unwrap()),
            feed.clone(),
            AccountMode::Demo,
        ));
        let config = RuntimeConfig {
            drop_threshold_secs: 3600,
            ..RuntimeConfig::default()
        };
        Arc::new(AppState::new(
            config,
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            feed,
            execution,
        ))
    }

    #[test]
    fn resolve_symbol_appends_quote() {
        let state = demo_state(vec![]);
        assert_eq!(state.resolve_symbol(" pepe "), "PEPEUSDT");
        assert_eq!(state.resolve_symbol("pepeusdt"), "PEPEUSDT");
        assert_eq!(state.resolve_symbol(""), "");
    }

    #[test]
    fn error_ring_buffer_is_capped() {
        let state = demo_state(vec![]);
        for i in 0..(MAX_RECENT_ERRORS + 5) {
            state.push_error(format!("e{i}"));
        }
        let errors = state.recent_errors.read();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert_eq!(errors[0].message, "e5");
    }

    #[tokio::test]
    async fn open_then_manual_sell() {
        let state = demo_state(vec![Some(dec!(2)), Some(dec!(2.5))]);

        let position = state.open_position("pepe", dec!(100)).await.unwrap();
        assert_eq!(position.symbol, "PEPEUSDT");
        assert_eq!(position.entry_price, dec!(2));
        assert_eq!(position.amount, dec!(50));
        assert!(state.registry.is_monitoring("PEPEUSDT"));
        assert_eq!(state.store.load_open_positions().unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let trade = state.sell_position("PEPEUSDT").await.unwrap();
        assert_eq!(trade.reason, MANUAL_SELL_REASON);
        assert_eq!(trade.sell_price, dec!(2.5));
        assert_eq!(trade.profit_percentage, dec!(25));

        assert!(!state.registry.is_monitoring("PEPEUSDT"));
        assert!(state.position_manager.get_position("PEPEUSDT").is_none());
        assert!(state.store.load_open_positions().unwrap().is_empty());
        assert_eq!(state.recent_trades(10), vec![trade]);
    }

    /// Feed that answers after a delay and counts how often it was asked.
    struct SlowFeed {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PriceFeed for SlowFeed {
        async fn current_price(&self, _symbol: &str) -> anyhow::Result<Decimal> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(dec!(1))
        }
    }

    #[tokio::test]
    async fn concurrent_opens_buy_once() {
        let feed = Arc::new(SlowFeed {
            calls: AtomicUsize::new(0),
        });
        let state = demo_state_with(feed.clone());

        let (a, b) = tokio::join!(
            state.open_position("PEPE", dec!(100)),
            state.open_position("PEPE", dec!(100)),
        );

        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert!(matches!(a.err().or(b.err()), Some(CommandError::Conflict(_))));
        // The only feed call before the losing request bails is the winning buy.
        assert_eq!(feed.calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(state.position_manager.get_open_positions().len(), 1);

        state.registry.shutdown().await;
    }

    #[tokio::test]
    async fn failed_buy_releases_the_symbol() {
        let state = demo_state(vec![Some(dec!(0)), Some(dec!(3))]);
        assert!(matches!(
            state.open_position("PEPE", dec!(30)).await,
            Err(CommandError::Failed(_))
        ));
        let position = state.open_position("PEPE", dec!(30)).await.unwrap();
        assert_eq!(position.entry_price, dec!(3));
        state.registry.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_open_is_a_conflict() {
        let state = demo_state(vec![Some(dec!(1))]);
        state.open_position("WIFUSDT", dec!(10)).await.unwrap();
        let err = state.open_position("wif", dec!(10)).await.unwrap_err();
        assert!(matches!(err, CommandError::Conflict(_)));
        state.registry.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_open_requests_are_rejected() {
        let state = demo_state(vec![Some(dec!(1))]);
        assert!(matches!(
            state.open_position("WIFUSDT", dec!(0)).await,
            Err(CommandError::Invalid(_))
        ));
        assert!(matches!(
            state.open_position("  ", dec!(5)).await,
            Err(CommandError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn selling_unknown_symbol_is_not_found() {
        let state = demo_state(vec![Some(dec!(1))]);
        assert!(matches!(
            state.sell_position("NOPEUSDT").await,
            Err(CommandError::NotFound(_))
        ));
    }
}
