// =============================================================================
// Binance REST API Client — ticker price + HMAC-SHA256 signed market orders
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the bot and Binance servers.
//
// Prices and quantities travel as decimal strings in both directions; they
// are never routed through f64.
// =============================================================================

use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, instrument};

use crate::market_data::PriceFeed;

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

const DEFAULT_BASE_URL: &str = "https://api.binance.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Size of a MARKET order: either base-asset quantity or quote amount to spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderQty {
    Base(Decimal),
    Quote(Decimal),
}

/// Fill summary extracted from a Binance order response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderFill {
    pub order_id: String,
    pub executed_qty: Decimal,
    /// `cummulativeQuoteQty / executedQty`, when both are present and non-zero.
    pub avg_price: Option<Decimal>,
}

/// Binance REST API client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct BinanceClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `BinanceClient`.
    ///
    /// # Arguments
    /// * `api_key` — Binance API key (sent as a header, never in query params).
    /// * `secret`  — Binance secret key used exclusively for HMAC signing.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;

        debug!(base_url = DEFAULT_BASE_URL, "BinanceClient initialised");

        Ok(Self {
            api_key,
            secret,
            base_url: DEFAULT_BASE_URL.to_string(),
            client,
        })
    }

    /// Whether signed endpoints can be used at all.
    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.secret.is_empty()
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    pub fn sign(&self, query: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .context("invalid HMAC key")?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Current UNIX timestamp in milliseconds.
    pub fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> Result<String> {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base)?;
        Ok(format!("{base}&signature={sig}"))
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /api/v3/ticker/price (public — no signature required).
    #[instrument(skip(self), name = "binance::get_ticker_price")]
    pub async fn get_ticker_price(&self, symbol: &str) -> Result<Decimal> {
        let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, symbol);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/ticker/price request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse ticker response")?;

        if !status.is_success() {
            anyhow::bail!(
                "Binance GET /api/v3/ticker/price returned {}: {}",
                status,
                body
            );
        }

        let price = Self::parse_decimal(&body["price"]).context("ticker response missing price")?;
        debug!(symbol, price = %price, "ticker price fetched");
        Ok(price)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /api/v3/order (signed) — submit a MARKET order.
    ///
    /// `OrderQty::Quote` maps to `quoteOrderQty` (spend this much quote
    /// currency), `OrderQty::Base` to `quantity`.
    #[instrument(skip(self), name = "binance::place_market_order")]
    pub async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: OrderQty,
    ) -> Result<OrderFill> {
        let size = match qty {
            OrderQty::Base(q) => format!("quantity={}", q.normalize()),
            OrderQty::Quote(q) => format!("quoteOrderQty={}", q.normalize()),
        };
        let params = format!("symbol={symbol}&side={side}&type=MARKET&{size}&newOrderRespType=FULL");

        let qs = self.signed_query(&params)?;
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        debug!(symbol, %side, "placing market order");

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST /api/v3/order request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse order response")?;

        if !status.is_success() {
            anyhow::bail!(
                "Binance POST /api/v3/order returned {}: {}",
                status,
                body
            );
        }

        let fill = Self::parse_fill(&body)?;
        debug!(symbol, %side, order_id = %fill.order_id, "market order filled");
        Ok(fill)
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    /// Extract order id, executed quantity and average fill price.
    pub fn parse_fill(body: &serde_json::Value) -> Result<OrderFill> {
        let order_id = match &body["orderId"] {
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::String(s) => s.clone(),
            other => anyhow::bail!("order response has no orderId: {other}"),
        };
        let executed_qty = Self::parse_decimal(&body["executedQty"]).unwrap_or(Decimal::ZERO);
        let quote_qty = Self::parse_decimal(&body["cummulativeQuoteQty"]).unwrap_or(Decimal::ZERO);

        let avg_price = if executed_qty > Decimal::ZERO && quote_qty > Decimal::ZERO {
            Some(quote_qty / executed_qty)
        } else {
            None
        };

        Ok(OrderFill {
            order_id,
            executed_qty,
            avg_price,
        })
    }

    /// Parse a JSON value that may be either a string or a number into `Decimal`.
    fn parse_decimal(val: &serde_json::Value) -> Result<Decimal> {
        if let Some(s) = val.as_str() {
            Decimal::from_str(s).with_context(|| format!("failed to parse '{s}' as decimal"))
        } else if val.is_number() {
            let s = val.to_string();
            Decimal::from_str(&s)
                .or_else(|_| Decimal::from_scientific(&s))
                .with_context(|| format!("failed to parse {s} as decimal"))
        } else {
            anyhow::bail!("expected string or number, got: {val}")
        }
    }
}

#[async_trait]
impl PriceFeed for BinanceClient {
    async fn current_price(&self, symbol: &str) -> Result<Decimal> {
        self.get_ticker_price(symbol).await
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn signature_matches_binance_doc_example() {
        // Example from the Binance API documentation (SIGNED endpoint security).
        let client = BinanceClient::new(
            "vmPUZE6mv9SD5VNHk4HlWFsOr6aKE2zvsw0MuIgwCIPy6utIco14y7Ju91duEh8A",
            "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j",
        )
        .unwrap();
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            client.sign(query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn parse_fill_computes_average_price() {
        let body = json!({
            "orderId": 28,
            "executedQty": "10.00000000",
            "cummulativeQuoteQty": "10.80000000",
        });
        let fill = BinanceClient::parse_fill(&body).unwrap();
        assert_eq!(fill.order_id, "28");
        assert_eq!(fill.executed_qty, dec!(10));
        assert_eq!(fill.avg_price, Some(dec!(1.08)));
    }

    #[test]
    fn parse_fill_without_execution_has_no_price() {
        let body = json!({ "orderId": 7, "executedQty": "0.0", "cummulativeQuoteQty": "0.0" });
        let fill = BinanceClient::parse_fill(&body).unwrap();
        assert_eq!(fill.avg_price, None);
        assert!(BinanceClient::parse_fill(&json!({})).is_err());
    }

    #[test]
    fn parse_decimal_accepts_strings_and_numbers() {
        assert_eq!(
            BinanceClient::parse_decimal(&json!("0.00001234")).unwrap(),
            dec!(0.00001234)
        );
        assert_eq!(BinanceClient::parse_decimal(&json!(42)).unwrap(), dec!(42));
        assert!(BinanceClient::parse_decimal(&json!("abc")).is_err());
        assert!(BinanceClient::parse_decimal(&json!(null)).is_err());
    }

    #[test]
    fn credentials_detected() {
        assert!(!BinanceClient::new("", "").unwrap().has_credentials());
        assert!(BinanceClient::new("k", "s").unwrap().has_credentials());
    }
}
