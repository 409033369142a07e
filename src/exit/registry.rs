// =============================================================================
// Monitor Registry — one exit-monitor task per held symbol
// =============================================================================
//
// Every task gets a child of the registry's root `CancellationToken`, so a
// single `shutdown()` stops them all. Starting a second monitor for a symbol
// that is still being watched is refused; finished tasks are reaped lazily.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::exit::apex::{ApexRecord, ApexTracker};
use crate::exit::monitor::{run_position_monitor, MonitorDeps, MonitorExit, MonitorSettings, SharedRecord};
use crate::position_engine::{Position, PositionStatus};

struct MonitorHandle {
    cancel: CancellationToken,
    record: SharedRecord,
    started_at: DateTime<Utc>,
    task: JoinHandle<MonitorExit>,
}

/// Read-only view of one running monitor.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub symbol: String,
    pub started_at: DateTime<Utc>,
    pub running: bool,
    pub record: Option<ApexRecord>,
}

pub struct MonitorRegistry {
    root: CancellationToken,
    deps: MonitorDeps,
    settings: MonitorSettings,
    monitors: Mutex<HashMap<String, MonitorHandle>>,
}

impl MonitorRegistry {
    pub fn new(deps: MonitorDeps, settings: MonitorSettings) -> Self {
        Self {
            root: CancellationToken::new(),
            deps,
            settings,
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn a monitor for `position`, resuming its stored apex record if any.
    ///
    /// Must be called from inside a Tokio runtime.
    pub fn start(&self, position: Position) -> Result<()> {
        if self.root.is_cancelled() {
            bail!("registry is shut down");
        }
        if position.status != PositionStatus::Open {
            bail!(
                "position in {} is {} — not monitoring",
                position.symbol,
                position.status
            );
        }

        let symbol = position.symbol.clone();
        let mut monitors = self.monitors.lock();
        if let Some(existing) = monitors.get(&symbol) {
            if !existing.task.is_finished() {
                bail!("{symbol} is already being monitored");
            }
        }

        let stored = match self.deps.store.get_apex(&symbol) {
            Ok(rec) => rec,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "could not load apex record — starting fresh");
                None
            }
        };
        let tracker = ApexTracker::new(&position, self.settings.drop_threshold, stored);
        if tracker.is_sold() {
            bail!("{symbol} already has a sold apex record");
        }

        let cancel = self.root.child_token();
        let record: SharedRecord = Arc::new(RwLock::new(None));
        let task = tokio::spawn(run_position_monitor(
            position,
            tracker,
            self.deps.clone(),
            self.settings,
            cancel.clone(),
            record.clone(),
        ));

        monitors.insert(
            symbol.clone(),
            MonitorHandle {
                cancel,
                record,
                started_at: Utc::now(),
                task,
            },
        );
        info!(symbol = %symbol, active = monitors.len(), "monitor registered");
        Ok(())
    }

    /// Cancel the monitor for `symbol` and wait for it to finish.
    ///
    /// Returns how the task ended, or `None` if nothing was registered. A
    /// monitor that already sold reports `Sold` here.
    pub async fn stop(&self, symbol: &str) -> Option<MonitorExit> {
        let handle = self.monitors.lock().remove(symbol)?;
        handle.cancel.cancel();
        join(symbol, handle.task).await
    }

    #[cfg(test)]
    pub fn is_monitoring(&self, symbol: &str) -> bool {
        self.monitors
            .lock()
            .get(symbol)
            .map_or(false, |h| !h.task.is_finished())
    }

    /// Current state of every registered monitor, sorted by symbol.
    /// Finished tasks are dropped from the registry as a side effect.
    pub fn snapshot(&self) -> Vec<MonitorSnapshot> {
        let mut monitors = self.monitors.lock();
        monitors.retain(|_, h| !h.task.is_finished());

        let mut out: Vec<MonitorSnapshot> = monitors
            .iter()
            .map(|(symbol, h)| MonitorSnapshot {
                symbol: symbol.clone(),
                started_at: h.started_at,
                running: !h.cancel.is_cancelled(),
                record: h.record.read().clone(),
            })
            .collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }

    /// Restart monitors for every open position in the store.
    ///
    /// Positions that are flagged `SellFailed` are loaded but not monitored.
    /// Returns the number of monitors started.
    pub fn resume_all(&self) -> Result<usize> {
        let positions = self.deps.store.load_open_positions()?;
        let mut started = 0;

        for position in positions {
            let symbol = position.symbol.clone();
            let status = position.status;
            if let Err(e) = self.deps.positions.open_position(position.clone()) {
                warn!(symbol = %symbol, error = %e, "position already tracked");
            }
            if status != PositionStatus::Open {
                warn!(symbol = %symbol, %status, "not resuming monitor — manual intervention required");
                continue;
            }
            match self.start(position) {
                Ok(()) => started += 1,
                Err(e) => warn!(symbol = %symbol, error = %e, "failed to resume monitor"),
            }
        }

        info!(started, "monitors resumed from store");
        Ok(started)
    }

    /// Cancel every monitor and wait for all of them to exit.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let handles: Vec<(String, MonitorHandle)> = self.monitors.lock().drain().collect();
        info!(count = handles.len(), "shutting down exit monitors");
        for (symbol, handle) in handles {
            join(&symbol, handle.task).await;
        }
    }
}

async fn join(symbol: &str, task: JoinHandle<MonitorExit>) -> Option<MonitorExit> {
    match task.await {
        Ok(exit) => Some(exit),
        Err(e) => {
            error!(symbol, error = %e, "monitor task panicked or was aborted");
            None
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
