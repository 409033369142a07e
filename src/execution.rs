// =============================================================================
// Execution Engine — routes buys and exit sells to Binance, with full
// demo-mode simulation support
// =============================================================================

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::binance::{BinanceClient, OrderQty, OrderSide};
use crate::market_data::PriceFeed;
use crate::types::AccountMode;

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Outcome of a sell request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellOutcome {
    pub success: bool,
    /// Fill price; the reference price when the exchange did not report one
    /// or the order failed.
    pub sell_price: Decimal,
    pub order_id: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl SellOutcome {
    pub fn failed(reference_price: Decimal, error: impl Into<String>) -> Self {
        Self {
            success: false,
            sell_price: reference_price,
            order_id: String::new(),
            error: Some(error.into()),
        }
    }
}

/// Fill of an opening buy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuyFill {
    pub price: Decimal,
    pub amount: Decimal,
    pub order_id: String,
}

/// The order-execution collaborator of the exit monitor.
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    /// Liquidate `amount` of `symbol`. `reference_price` is the price that
    /// triggered the sell; demo fills use it verbatim.
    async fn sell(&self, symbol: &str, amount: Decimal, reference_price: Decimal) -> SellOutcome;
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ExecutionEngine {
    client: Arc<BinanceClient>,
    feed: Arc<dyn PriceFeed>,
    account_mode: AccountMode,
}

impl ExecutionEngine {
    pub fn new(
        client: Arc<BinanceClient>,
        feed: Arc<dyn PriceFeed>,
        account_mode: AccountMode,
    ) -> Self {
        Self {
            client,
            feed,
            account_mode,
        }
    }

    pub fn account_mode(&self) -> AccountMode {
        self.account_mode
    }

    /// Spend `quote_amount` of quote currency on `symbol` at market.
    ///
    /// In **demo mode** the fill is simulated at the current feed price.
    /// In **live mode** a MARKET BUY with `quoteOrderQty` is sent.
    pub async fn buy(&self, symbol: &str, quote_amount: Decimal) -> Result<BuyFill> {
        if quote_amount <= Decimal::ZERO {
            bail!("quote amount must be positive, got {quote_amount}");
        }

        info!(symbol, quote_amount = %quote_amount, mode = %self.account_mode, "buy requested");

        match self.account_mode {
            AccountMode::Demo => {
                let price = self
                    .feed
                    .current_price(symbol)
                    .await
                    .with_context(|| format!("no price for {symbol}"))?;
                if price <= Decimal::ZERO {
                    bail!("feed returned non-positive price {price} for {symbol}");
                }
                let fill = BuyFill {
                    price,
                    amount: quote_amount / price,
                    order_id: format!("sim-{}", Uuid::new_v4()),
                };
                info!(
                    symbol,
                    price = %fill.price,
                    amount = %fill.amount,
                    order_id = %fill.order_id,
                    "demo buy filled"
                );
                Ok(fill)
            }
            AccountMode::Live => {
                let order = self
                    .client
                    .place_market_order(symbol, OrderSide::Buy, OrderQty::Quote(quote_amount))
                    .await?;
                if order.executed_qty <= Decimal::ZERO {
                    bail!("buy order {} for {symbol} did not execute", order.order_id);
                }
                let price = match order.avg_price {
                    Some(p) => p,
                    None => self.feed.current_price(symbol).await?,
                };
                info!(
                    symbol,
                    price = %price,
                    amount = %order.executed_qty,
                    order_id = %order.order_id,
                    "live buy filled"
                );
                Ok(BuyFill {
                    price,
                    amount: order.executed_qty,
                    order_id: order.order_id,
                })
            }
        }
    }
}

#[async_trait]
impl OrderExecutor for ExecutionEngine {
    async fn sell(&self, symbol: &str, amount: Decimal, reference_price: Decimal) -> SellOutcome {
        if amount <= Decimal::ZERO {
            return SellOutcome::failed(reference_price, format!("nothing to sell ({amount})"));
        }

        match self.account_mode {
            AccountMode::Demo => {
                let outcome = SellOutcome {
                    success: true,
                    sell_price: reference_price,
                    order_id: format!("sim-{}", Uuid::new_v4()),
                    error: None,
                };
                info!(
                    symbol,
                    amount = %amount,
                    price = %outcome.sell_price,
                    order_id = %outcome.order_id,
                    "demo sell filled"
                );
                outcome
            }
            AccountMode::Live => {
                debug!(symbol, amount = %amount, "sending live market sell");
                match self
                    .client
                    .place_market_order(symbol, OrderSide::Sell, OrderQty::Base(amount))
                    .await
                {
                    Ok(fill) => {
                        let sell_price = fill.avg_price.unwrap_or(reference_price);
                        info!(
                            symbol,
                            amount = %fill.executed_qty,
                            price = %sell_price,
                            order_id = %fill.order_id,
                            "live sell filled"
                        );
                        SellOutcome {
                            success: true,
                            sell_price,
                            order_id: fill.order_id,
                            error: None,
                        }
                    }
                    Err(e) => {
                        warn!(symbol, error = %e, "live sell failed");
                        SellOutcome::failed(reference_price, format!("{e:#}"))
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("client", &"<BinanceClient>")
            .field("account_mode", &self.account_mode)
            .finish()
    }
}
