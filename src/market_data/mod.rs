// =============================================================================
// Market Data — pull-based price feed seam
// =============================================================================

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Source of the current price for a symbol, polled by the exit monitor.
///
/// Errors are treated as "skip this cycle" by the caller, never as fatal.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn current_price(&self, symbol: &str) -> Result<Decimal>;
}
