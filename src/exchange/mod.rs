//! Exchange boundary
//!
//! The [`Exchange`] trait is everything the engine needs from the venue. The
//! production implementation is [`BybitRestClient`] (Bybit V5, linear USDT
//! perpetuals); tests substitute in-memory fakes or mocks.
//!
//! Failures are typed: [`ExchangeError::is_transient`] ones are retried on the
//! next tick, the rest (bad credentials, rejected parameters) stop trading
//! until the operator intervenes.

mod rest;
pub mod signing;
mod types;

pub use rest::BybitRestClient;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::types::{Candle, ClosedTrade, ExchangePosition, Side, Symbol, Ticker};

/// Failure taxonomy of the exchange boundary
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// Timeout, connection error or non-2xx HTTP status
    #[error("transport failure: {0}")]
    Transport(String),

    /// Signed call answered with a non-zero result code
    #[error("exchange rejected request ({code}): {message}")]
    Rejected { code: i64, message: String },

    /// Body was not the expected JSON envelope
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Private endpoint called without API key/secret
    #[error("API credentials not configured")]
    MissingCredentials,
}

/// Result codes that only mean "try again later": server timeout, request
/// outside the receive window, rate limit, internal server error
const TRANSIENT_RET_CODES: &[i64] = &[10000, 10002, 10006, 10016];

impl ExchangeError {
    /// True for failures that say nothing about the request itself
    pub fn is_transient(&self) -> bool {
        match self {
            ExchangeError::Transport(_) | ExchangeError::Malformed(_) => true,
            ExchangeError::Rejected { code, .. } => TRANSIENT_RET_CODES.contains(code),
            ExchangeError::MissingCredentials => false,
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        ExchangeError::Transport(e.to_string())
    }
}

/// Market order request. `side` is the position side being opened, or the
/// side being reduced when `reduce_only` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketOrder {
    pub symbol: Symbol,
    pub side: Side,
    pub qty: Decimal,
    pub reduce_only: bool,
}

impl MarketOrder {
    pub fn open(symbol: Symbol, side: Side, qty: Decimal) -> Self {
        Self {
            symbol,
            side,
            qty,
            reduce_only: false,
        }
    }

    /// Reduce-only order flattening the reported position
    pub fn flatten(position: &ExchangePosition) -> Self {
        Self {
            symbol: position.symbol.clone(),
            side: position.side,
            qty: position.size,
            reduce_only: true,
        }
    }

    /// Wire side of the order
    pub fn order_side(&self) -> &'static str {
        if self.reduce_only {
            self.side.closing_order_side()
        } else {
            self.side.order_side()
        }
    }
}

/// Venue operations used by the engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Exchange: Send + Sync {
    /// 24h statistics for every linear instrument
    async fn tickers(&self) -> Result<Vec<Ticker>, ExchangeError>;

    /// Candles oldest-first
    async fn klines(
        &self,
        symbol: &Symbol,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;

    /// USDT wallet balance
    async fn wallet_balance(&self) -> Result<f64, ExchangeError>;

    /// All open positions (non-zero size)
    async fn positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError>;

    /// Open positions for one symbol
    async fn position(&self, symbol: &Symbol) -> Result<Vec<ExchangePosition>, ExchangeError>;

    /// Closed trades, oldest-first; `start_time` in milliseconds
    async fn closed_pnl(
        &self,
        limit: usize,
        start_time: Option<i64>,
    ) -> Result<Vec<ClosedTrade>, ExchangeError>;

    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> Result<(), ExchangeError>;

    /// Submit a market order; returns the exchange order id
    async fn place_market_order(&self, order: &MarketOrder) -> Result<String, ExchangeError>;

    /// Install or replace the position's hard stop-loss
    async fn set_stop_loss(&self, symbol: &Symbol, price: Decimal) -> Result<(), ExchangeError>;

    /// Install a trailing stop that starts trailing at `activation`
    async fn set_trailing_stop(
        &self,
        symbol: &Symbol,
        activation: Decimal,
        distance: Decimal,
    ) -> Result<(), ExchangeError>;

    /// Cancel every resting USDT-settled order
    async fn cancel_all_orders(&self) -> Result<(), ExchangeError>;
}
