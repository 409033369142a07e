// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// Environment variables override the file for deployment-specific values
// (bind address, database path); they are applied after load and are not
// written back unless the caller saves.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::AccountMode;

pub const ENV_BIND_ADDR: &str = "NIGHTSTALKER_BIND_ADDR";
pub const ENV_DB_PATH: &str = "NIGHTSTALKER_DB_PATH";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_poll_interval_secs() -> u64 {
    3
}

fn default_drop_threshold_secs() -> u64 {
    30
}

fn default_quote_currency() -> String {
    "USDT".to_string()
}

fn default_database_path() -> String {
    "nightstalker.db".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Night Stalker engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Whether sells hit the exchange or are simulated: Demo or Live.
    #[serde(default)]
    pub account_mode: AccountMode,

    /// Seconds between price polls for each monitored symbol.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// How long the price must stay below the apex before selling.
    #[serde(default = "default_drop_threshold_secs")]
    pub drop_threshold_secs: u64,

    /// Quote currency spent on buys (and appended to bare base symbols).
    #[serde(default = "default_quote_currency")]
    pub quote_currency: String,

    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Listen address of the REST API.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            account_mode: AccountMode::Demo,
            poll_interval_secs: default_poll_interval_secs(),
            drop_threshold_secs: default_drop_threshold_secs(),
            quote_currency: default_quote_currency(),
            database_path: default_database_path(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;
        config.sanitize();

        info!(
            path = %path.display(),
            account_mode = %config.account_mode,
            poll_interval_secs = config.poll_interval_secs,
            drop_threshold_secs = config.drop_threshold_secs,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply `NIGHTSTALKER_BIND_ADDR` / `NIGHTSTALKER_DB_PATH` overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup(ENV_BIND_ADDR).filter(|v| !v.trim().is_empty()) {
            info!(bind_addr = %addr, "bind address overridden from environment");
            self.bind_addr = addr.trim().to_string();
        }
        if let Some(db) = lookup(ENV_DB_PATH).filter(|v| !v.trim().is_empty()) {
            info!(database_path = %db, "database path overridden from environment");
            self.database_path = db.trim().to_string();
        }
    }

    /// Clamp values that would stall the monitors.
    fn sanitize(&mut self) {
        if self.poll_interval_secs == 0 {
            warn!("poll_interval_secs = 0 is not allowed — using 1");
            self.poll_interval_secs = 1;
        }
        if self.quote_currency.trim().is_empty() {
            self.quote_currency = default_quote_currency();
        }
        self.quote_currency = self.quote_currency.trim().to_uppercase();
    }
}
