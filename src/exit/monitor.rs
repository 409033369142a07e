// =============================================================================
// Exit Monitor Loop — per-position apex/drawdown polling task
// =============================================================================
//
// One task per held symbol, spawned by the `MonitorRegistry`:
//   1. Wait for the next tick (or cancellation).
//   2. Pull the current price from the feed; on failure skip the cycle.
//   3. Feed the sample to the `ApexTracker`; rejected samples are logged.
//   4. Persist the sample and the apex record on the blocking pool (retry
//      once, then continue in memory only).
//   5. On a sell signal, call the executor exactly once, close the position
//      and stop.
//
// Cancellation (manual sell, stop, shutdown) ends the loop without a signal.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::execution::{OrderExecutor, SellOutcome};
use crate::exit::apex::{profit_percentage, ApexRecord, ApexTracker, SellSignal};
use crate::market_data::PriceFeed;
use crate::position_engine::{ClosedTrade, Position, PositionManager};
use crate::runtime_config::RuntimeConfig;
use crate::store::{MonitorStore, StoreError};
use crate::types::PriceSample;

/// Journal reason for monitor-triggered exits.
pub const APEX_DRAWDOWN_REASON: &str = "apex_drawdown";

/// Smallest poll period accepted by the ticker.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Latest apex record of a running monitor, readable by the API.
pub type SharedRecord = Arc<RwLock<Option<ApexRecord>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    pub drop_threshold: Duration,
}

impl MonitorSettings {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            drop_threshold: Duration::from_secs(config.drop_threshold_secs),
        }
    }
}

/// Collaborators shared by every monitor task.
#[derive(Clone)]
pub struct MonitorDeps {
    pub feed: Arc<dyn PriceFeed>,
    pub executor: Arc<dyn OrderExecutor>,
    pub store: Arc<dyn MonitorStore>,
    pub positions: Arc<PositionManager>,
}

/// Why a monitor task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorExit {
    Cancelled,
    Sold(ClosedTrade),
    /// The sell was rejected; the position is flagged `SellFailed`.
    SellFailed(SellSignal),
}

/// Run the monitor for `position` until it sells or `cancel` fires.
pub async fn run_position_monitor(
    position: Position,
    mut tracker: ApexTracker,
    deps: MonitorDeps,
    settings: MonitorSettings,
    cancel: CancellationToken,
    shared: SharedRecord,
) -> MonitorExit {
    let symbol = position.symbol.clone();
    *shared.write() = tracker.record().cloned();

    info!(
        symbol = %symbol,
        entry_price = %position.entry_price,
        amount = %position.amount,
        poll_ms = settings.poll_interval.as_millis() as u64,
        threshold_ms = settings.drop_threshold.as_millis() as u64,
        resumed = tracker.record().is_some(),
        "exit monitor started"
    );

    let mut ticker = interval(settings.poll_interval.max(MIN_POLL_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = deps.feed.current_price(&symbol) => res,
        };

        let price = match fetched {
            Ok(p) => p,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "price feed failed — skipping cycle");
                continue;
            }
        };
        let now = Utc::now();

        let signal = match tracker.on_price_sample(&symbol, price, now) {
            Ok(signal) => signal,
            Err(rejection) => {
                warn!(symbol = %symbol, price = %price, reason = %rejection, "sample rejected");
                continue;
            }
        };

        let sample = PriceSample::new(symbol.clone(), price, now);
        let record = tracker.record().cloned();
        persist_tick(deps.store.clone(), sample, record.clone()).await;

        if let Some(rec) = &record {
            debug!(
                symbol = %symbol,
                price = %price,
                apex = %rec.apex_price,
                status = %rec.status,
                "sample evaluated"
            );
        }
        *shared.write() = record;

        if let Some(signal) = signal {
            return execute_exit(&position, signal, &deps).await;
        }
    }

    info!(symbol = %symbol, "exit monitor cancelled");
    MonitorExit::Cancelled
}

/// Sell once, then close and journal the position. Never retries a failed sell.
async fn execute_exit(position: &Position, signal: SellSignal, deps: &MonitorDeps) -> MonitorExit {
    let symbol = signal.symbol.as_str();

    let outcome = deps
        .executor
        .sell(symbol, signal.amount, signal.sell_price)
        .await;

    if !outcome.success {
        error!(
            symbol,
            critical = true,
            apex = %signal.apex_price,
            trigger_price = %signal.sell_price,
            error = outcome.error.as_deref().unwrap_or("unknown"),
            "SELL FAILED after drawdown trigger — manual intervention required"
        );
        if let Some(flagged) = deps.positions.mark_sell_failed(symbol) {
            persist(symbol, "save position", || deps.store.save_position(&flagged));
        }
        return MonitorExit::SellFailed(signal);
    }

    let closed_at = Utc::now();
    let trade = deps
        .positions
        .close_position(
            symbol,
            outcome.sell_price,
            Some(signal.apex_price),
            APEX_DRAWDOWN_REASON,
            &outcome.order_id,
            closed_at,
        )
        .unwrap_or_else(|| {
            warn!(symbol, "sold position was not tracked — journaling from monitor state");
            untracked_trade(position, &signal, &outcome, closed_at)
        });

    info!(
        symbol,
        apex = %signal.apex_price,
        sell_price = %trade.sell_price,
        profit = %signal.profit_display(),
        holding_secs = signal.holding_time.as_secs(),
        order_id = %trade.order_id,
        "position sold by exit monitor"
    );

    persist(symbol, "record trade", || deps.store.record_trade(&trade));
    persist(symbol, "remove position", || deps.store.remove_position(symbol));
    persist(symbol, "archive apex", || deps.store.archive_apex(symbol));

    MonitorExit::Sold(trade)
}

fn untracked_trade(
    position: &Position,
    signal: &SellSignal,
    outcome: &SellOutcome,
    closed_at: chrono::DateTime<Utc>,
) -> ClosedTrade {
    ClosedTrade {
        symbol: position.symbol.clone(),
        entry_price: position.entry_price,
        sell_price: outcome.sell_price,
        amount: position.amount,
        apex_price: Some(signal.apex_price),
        entry_time: position.entry_time,
        closed_at,
        profit_percentage: profit_percentage(position.entry_price, outcome.sell_price),
        reason: APEX_DRAWDOWN_REASON.to_string(),
        order_id: outcome.order_id.clone(),
    }
}

/// Write one evaluated sample and its apex record on the blocking pool.
async fn persist_tick(
    store: Arc<dyn MonitorStore>,
    sample: PriceSample,
    record: Option<ApexRecord>,
) {
    let symbol = sample.symbol.clone();
    let joined = tokio::task::spawn_blocking(move || {
        persist(&sample.symbol, "append sample", || store.append_sample(&sample));
        if let Some(rec) = &record {
            persist(&rec.symbol, "upsert apex", || store.upsert_apex(rec));
        }
    })
    .await;
    if let Err(e) = joined {
        error!(symbol = %symbol, error = %e, "store write task failed");
    }
}

/// Run a store write, retrying once. Returns `false` if both attempts failed;
/// the caller carries on in memory.
pub(crate) fn persist<F>(symbol: &str, what: &str, mut op: F) -> bool
where
    F: FnMut() -> Result<(), StoreError>,
{
    match op() {
        Ok(()) => true,
        Err(first) => {
            warn!(symbol, op = what, error = %first, "store write failed — retrying once");
            match op() {
                Ok(()) => true,
                Err(e) => {
                    error!(
                        symbol,
                        op = what,
                        error = %e,
                        "store write failed twice — continuing in memory only"
                    );
                    false
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::exit::apex::ApexStatus;
    use crate::position_engine::PositionStatus;
    use crate::store::SqliteStore;

    /// Feed that plays a script and then repeats its last price forever.
    pub(crate) struct ScriptedFeed {
        script: Mutex<VecDeque<Option<Decimal>>>,
        last: Mutex<Option<Decimal>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedFeed {
        /// `None` entries are feed failures.
        pub(crate) fn new(script: Vec<Option<Decimal>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(None),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PriceFeed for ScriptedFeed {
        async fn current_price(&self, _symbol: &str) -> Result<Decimal> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().pop_front();
            match next {
                Some(Some(p)) => {
                    *self.last.lock() = Some(p);
                    Ok(p)
                }
                Some(None) => Err(anyhow!("feed timeout")),
                None => (*self.last.lock()).ok_or_else(|| anyhow!("empty script")),
            }
        }
    }

    pub(crate) struct RecordingExecutor {
        pub succeed: bool,
        pub calls: Mutex<Vec<(String, Decimal, Decimal)>>,
    }

    impl RecordingExecutor {
        pub(crate) fn new(succeed: bool) -> Self {
            Self {
                succeed,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl OrderExecutor for RecordingExecutor {
        async fn sell(&self, symbol: &str, amount: Decimal, reference_price: Decimal) -> SellOutcome {
            self.calls
                .lock()
                .push((symbol.to_string(), amount, reference_price));
            if self.succeed {
                SellOutcome {
                    success: true,
                    sell_price: reference_price,
                    order_id: "ord-1".to_string(),
                    error: None,
                }
            } else {
                SellOutcome::failed(reference_price, "insufficient balance")
            }
        }
    }

    /// Store whose writes fail a configurable number of times first.
    struct FlakyStore {
        inner: SqliteStore,
        failures_left: AtomicUsize,
        attempts: AtomicUsize,
        write_threads: Mutex<Vec<std::thread::ThreadId>>,
    }

    impl FlakyStore {
        fn new(failures: usize) -> Self {
            Self {
                inner: SqliteStore::open_in_memory().unwrap(),
                failures_left: AtomicUsize::new(failures),
                attempts: AtomicUsize::new(0),
                write_threads: Mutex::new(Vec::new()),
            }
        }

        fn fail(&self) -> Result<(), StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.write_threads.lock().push(std::thread::current().id());
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Corrupt("disk full".to_string()));
            }
            Ok(())
        }
    }

    impl MonitorStore for FlakyStore {
        fn get_apex(&self, symbol: &str) -> Result<Option<ApexRecord>, StoreError> {
            self.inner.get_apex(symbol)
        }
        fn upsert_apex(&self, record: &ApexRecord) -> Result<(), StoreError> {
            self.fail()?;
            self.inner.upsert_apex(record)
        }
        fn archive_apex(&self, symbol: &str) -> Result<(), StoreError> {
            self.inner.archive_apex(symbol)
        }
        fn append_sample(&self, sample: &PriceSample) -> Result<(), StoreError> {
            self.fail()?;
            self.inner.append_sample(sample)
        }
        fn save_position(&self, position: &Position) -> Result<(), StoreError> {
            self.inner.save_position(position)
        }
        fn remove_position(&self, symbol: &str) -> Result<(), StoreError> {
            self.inner.remove_position(symbol)
        }
        fn load_open_positions(&self) -> Result<Vec<Position>, StoreError> {
            self.inner.load_open_positions()
        }
        fn record_trade(&self, trade: &ClosedTrade) -> Result<(), StoreError> {
            self.inner.record_trade(trade)
        }
        fn recent_trades(&self, limit: usize) -> Result<Vec<ClosedTrade>, StoreError> {
            self.inner.recent_trades(limit)
        }
    }

    pub(crate) fn test_position(symbol: &str) -> Position {
        Position {
            symbol: symbol.to_string(),
            entry_price: dec!(1.00),
            entry_time: Utc::now(),
            amount: dec!(100),
            quote_currency: "USDT".to_string(),
            order_id: "buy-1".to_string(),
            status: PositionStatus::Open,
        }
    }

    pub(crate) fn fast_settings() -> MonitorSettings {
        MonitorSettings {
            poll_interval: Duration::from_millis(5),
            drop_threshold: Duration::from_millis(40),
        }
    }

    fn deps_with(
        feed: Arc<dyn PriceFeed>,
        executor: Arc<dyn OrderExecutor>,
        store: Arc<dyn MonitorStore>,
    ) -> MonitorDeps {
        MonitorDeps {
            feed,
            executor,
            store,
            positions: Arc::new(PositionManager::new()),
        }
    }

    async fn run(position: Position, deps: MonitorDeps, cancel: CancellationToken) -> MonitorExit {
        let settings = fast_settings();
        let tracker = ApexTracker::new(&position, settings.drop_threshold, None);
        let shared: SharedRecord = Arc::new(RwLock::new(None));
        tokio::time::timeout(
            Duration::from_secs(5),
            run_position_monitor(position, tracker, deps, settings, cancel, shared),
        )
        .await
        .expect("monitor did not finish")
    }

    #[tokio::test]
    async fn drawdown_sells_once_and_journals() {
        let feed = Arc::new(ScriptedFeed::new(vec![
            Some(dec!(1.10)),
            Some(dec!(1.25)),
            Some(dec!(1.20)),
        ]));
        let executor = Arc::new(RecordingExecutor::new(true));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let deps = deps_with(feed, executor.clone(), store.clone());
        let position = test_position("BONKUSDT");
        deps.positions.open_position(position.clone()).unwrap();
        store.save_position(&position).unwrap();

        let exit = run(position, deps.clone(), CancellationToken::new()).await;

        let trade = match exit {
            MonitorExit::Sold(trade) => trade,
            other => panic!("expected sale, got {other:?}"),
        };
        assert_eq!(trade.sell_price, dec!(1.20));
        assert_eq!(trade.apex_price, Some(dec!(1.25)));
        assert_eq!(trade.profit_percentage, dec!(20));
        assert_eq!(trade.reason, APEX_DRAWDOWN_REASON);

        let calls = executor.calls.lock().clone();
        assert_eq!(calls, vec![("BONKUSDT".to_string(), dec!(100), dec!(1.20))]);

        assert!(deps.positions.get_position("BONKUSDT").is_none());
        assert!(store.load_open_positions().unwrap().is_empty());
        assert!(store.get_apex("BONKUSDT").unwrap().is_none());
        let archived = store.archived_apex("BONKUSDT").unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].status, ApexStatus::Sold);
        assert_eq!(store.recent_trades(5).unwrap(), vec![trade]);
        assert!(store.sample_count("BONKUSDT").unwrap() >= 3);
    }

    #[tokio::test]
    async fn feed_failures_are_skipped() {
        let feed = Arc::new(ScriptedFeed::new(vec![
            None,
            Some(dec!(2.0)),
            None,
            None,
            Some(dec!(1.5)),
        ]));
        let executor = Arc::new(RecordingExecutor::new(true));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let deps = deps_with(feed.clone(), executor.clone(), store);
        let position = test_position("BONKUSDT");
        deps.positions.open_position(position.clone()).unwrap();

        let exit = run(position, deps, CancellationToken::new()).await;

        assert!(matches!(exit, MonitorExit::Sold(ref t) if t.sell_price == dec!(1.5)));
        assert_eq!(executor.calls.lock().len(), 1);
        assert!(feed.calls.load(Ordering::SeqCst) >= 5);
    }

    #[tokio::test]
    async fn cancellation_stops_without_selling() {
        // Monotonically rising prices never trigger on their own.
        let feed = Arc::new(ScriptedFeed::new(
            (1..1000).map(|i| Some(Decimal::from(i))).collect(),
        ));
        let executor = Arc::new(RecordingExecutor::new(true));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let deps = deps_with(feed, executor.clone(), store);
        let position = test_position("BONKUSDT");
        deps.positions.open_position(position.clone()).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        assert_eq!(run(position, deps.clone(), cancel).await, MonitorExit::Cancelled);
        assert!(executor.calls.lock().is_empty());
        assert!(deps.positions.get_position("BONKUSDT").is_some());
    }

    #[tokio::test]
    async fn failed_sell_is_not_retried() {
        let feed = Arc::new(ScriptedFeed::new(vec![Some(dec!(3)), Some(dec!(2))]));
        let executor = Arc::new(RecordingExecutor::new(false));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let deps = deps_with(feed, executor.clone(), store.clone());
        let position = test_position("BONKUSDT");
        deps.positions.open_position(position.clone()).unwrap();

        let exit = run(position, deps.clone(), CancellationToken::new()).await;

        assert!(matches!(exit, MonitorExit::SellFailed(ref s) if s.sell_price == dec!(2)));
        assert_eq!(executor.calls.lock().len(), 1);
        assert_eq!(
            deps.positions.get_position("BONKUSDT").map(|p| p.status),
            Some(PositionStatus::SellFailed)
        );
        assert_eq!(
            store.load_open_positions().unwrap()[0].status,
            PositionStatus::SellFailed
        );
        let rec = store.get_apex("BONKUSDT").unwrap().unwrap();
        assert_eq!(rec.status, ApexStatus::Sold);
    }

    #[tokio::test]
    async fn store_failures_do_not_stop_the_loop() {
        let feed = Arc::new(ScriptedFeed::new(vec![Some(dec!(5)), Some(dec!(4))]));
        let executor = Arc::new(RecordingExecutor::new(true));
        let store = Arc::new(FlakyStore::new(usize::MAX));
        let deps = deps_with(feed, executor.clone(), store.clone());
        let position = test_position("BONKUSDT");
        deps.positions.open_position(position.clone()).unwrap();

        let exit = run(position, deps, CancellationToken::new()).await;

        assert!(matches!(exit, MonitorExit::Sold(_)));
        assert_eq!(executor.calls.lock().len(), 1);
        // Every failing write is attempted exactly twice.
        assert_eq!(store.attempts.load(Ordering::SeqCst) % 2, 0);
    }

    #[tokio::test]
    async fn tick_writes_run_off_the_runtime_thread() {
        let feed = Arc::new(ScriptedFeed::new(vec![Some(dec!(5)), Some(dec!(4))]));
        let executor = Arc::new(RecordingExecutor::new(true));
        let store = Arc::new(FlakyStore::new(0));
        let deps = deps_with(feed, executor, store.clone());
        let position = test_position("BONKUSDT");
        deps.positions.open_position(position.clone()).unwrap();

        let exit = run(position, deps, CancellationToken::new()).await;

        assert!(matches!(exit, MonitorExit::Sold(_)));
        let runtime_thread = std::thread::current().id();
        let threads = store.write_threads.lock().clone();
        assert!(!threads.is_empty());
        assert!(threads.iter().all(|t| *t != runtime_thread));
    }

    #[test]
    fn persist_retries_once() {
        let attempts = AtomicUsize::new(0);
        let ok = persist("X", "test", || {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(StoreError::Corrupt("transient".to_string()))
            } else {
                Ok(())
            }
        });
        assert!(ok);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        let attempts = AtomicUsize::new(0);
        let ok = persist("X", "test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Corrupt("down".to_string()))
        });
        assert!(!ok);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn resumed_record_is_published_before_first_tick() {
        let position = test_position("BONKUSDT");
        let stored = ApexRecord {
            symbol: "BONKUSDT".to_string(),
            apex_price: dec!(9),
            apex_timestamp: position.entry_time,
            drop_start_timestamp: None,
            status: ApexStatus::Rising,
            last_sample_at: position.entry_time,
        };
        let settings = fast_settings();
        let tracker = ApexTracker::new(&position, settings.drop_threshold, Some(stored.clone()));
        let shared: SharedRecord = Arc::new(RwLock::new(None));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let deps = deps_with(
            Arc::new(ScriptedFeed::new(vec![])),
            Arc::new(RecordingExecutor::new(true)),
            Arc::new(SqliteStore::open_in_memory().unwrap()),
        );
        let exit =
            run_position_monitor(position, tracker, deps, settings, cancel, shared.clone()).await;

        assert_eq!(exit, MonitorExit::Cancelled);
        assert_eq!(shared.read().clone(), Some(stored));
    }
}
