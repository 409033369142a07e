// =============================================================================
// Shared types used across the Night Stalker exit engine
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Whether sells are sent to the exchange or simulated locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// One price observation for a symbol. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSample {
    pub symbol: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl PriceSample {
    pub fn new(symbol: impl Into<String>, price: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            timestamp,
        }
    }
}

/// Normalise a user- or config-supplied symbol ("btcusdt " -> "BTCUSDT").
pub fn normalize_symbol(raw: &str) -> String {
    raw.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_symbol_trims_and_uppercases() {
        assert_eq!(normalize_symbol("  pepeusdt "), "PEPEUSDT");
        assert_eq!(normalize_symbol("BTCUSDT"), "BTCUSDT");
    }

    #[test]
    fn account_mode_defaults_to_demo() {
        assert_eq!(AccountMode::default(), AccountMode::Demo);
        assert_eq!(AccountMode::Live.to_string(), "Live");
    }
}
