//! Core types used throughout PerpBot
//!
//! Defines the instrument, signal, candle and exchange snapshot types shared
//! by the selector, signal engine, execution manager and orchestration loop.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Linear perpetual instrument identifier (e.g. `SOLUSDT`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Symbol(raw.as_ref().trim().to_uppercase())
    }

    /// Resolve an operator-typed fragment (`pepe`, `PEPEUSDT`) to a full symbol
    pub fn from_fragment(fragment: &str) -> Self {
        let upper = fragment.trim().to_uppercase();
        if upper.contains("USDT") {
            Symbol(upper)
        } else {
            Symbol(format!("{upper}USDT"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive substring match used by operator commands
    pub fn matches_fragment(&self, fragment: &str) -> bool {
        self.0.contains(&fragment.trim().to_uppercase())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol::new(s)
    }
}

/// Trading mode an instrument is assigned to by the selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradingMode {
    Scalp,
    Swing,
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingMode::Scalp => write!(f, "SCALP"),
            TradingMode::Swing => write!(f, "SWING"),
        }
    }
}

/// Position side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Order side that opens a position on this side
    pub fn order_side(&self) -> &'static str {
        match self {
            Side::Long => "Buy",
            Side::Short => "Sell",
        }
    }

    /// Order side that reduces a position on this side
    pub fn closing_order_side(&self) -> &'static str {
        match self {
            Side::Long => "Sell",
            Side::Short => "Buy",
        }
    }

    /// Parse the exchange's position side (`Buy` / `Sell`)
    pub fn from_order_side(s: &str) -> Option<Self> {
        match s {
            "Buy" => Some(Side::Long),
            "Sell" => Some(Side::Short),
            _ => None,
        }
    }

    /// +1 for long, -1 for short
    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// Discrete trade signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    Long,
    Short,
    Wait,
}

impl Signal {
    pub fn side(&self) -> Option<Side> {
        match self {
            Signal::Long => Some(Side::Long),
            Signal::Short => Some(Side::Short),
            Signal::Wait => None,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Long => write!(f, "LONG"),
            Signal::Short => write!(f, "SHORT"),
            Signal::Wait => write!(f, "WAIT"),
        }
    }
}

/// Trend label of a reference series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Trend {
    Bull,
    Bear,
    #[default]
    Neutral,
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trend::Bull => write!(f, "BULL"),
            Trend::Bear => write!(f, "BEAR"),
            Trend::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// Candlestick data, oldest-first when held in a slice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    /// Open time in milliseconds
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Volume in base currency
    pub volume: f64,
}

/// Indicator values for the latest closed candle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorBundle {
    /// ADX (14)
    pub adx: f64,
    /// RSI (14, Wilder's smoothing)
    pub rsi: f64,
    /// EMA (200) of closes
    pub ema: f64,
    /// MACD (12, 26, 9) histogram
    pub macd_hist: f64,
    /// ATR (14)
    pub atr: f64,
    /// Volume of the latest candle
    pub volume: f64,
    /// SMA (20) of volume
    pub volume_ma: f64,
    /// Latest close
    pub price: f64,
}

/// Per-instrument evaluation result, replaced wholesale every tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: Symbol,
    pub mode: TradingMode,
    pub indicators: IndicatorBundle,
    pub signal: Signal,
    /// Sizing multiplier from the volume spike check (1.0 or boosted)
    pub volume_multiplier: f64,
    /// Evaluation time in milliseconds
    pub ts: i64,
}

/// Open position as reported by the exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: Symbol,
    pub side: Side,
    pub entry_price: f64,
    /// Contract quantity exactly as reported
    pub size: Decimal,
    /// Creation time in milliseconds
    pub created_at: i64,
    pub unrealised_pnl: f64,
}

/// Realised trade as reported by the exchange closed-P&L feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub order_id: String,
    pub symbol: Symbol,
    pub closed_pnl: f64,
    pub avg_exit_price: f64,
    /// Last update time in milliseconds
    pub updated_at: i64,
}

impl ClosedTrade {
    pub fn is_win(&self) -> bool {
        self.closed_pnl > 0.0
    }
}

/// 24h market statistics for one instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: Symbol,
    pub last_price: f64,
    pub turnover_24h: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub funding_rate: f64,
}

impl Ticker {
    /// 24h high-low range relative to the low, used as a volatility proxy
    pub fn range_volatility(&self) -> f64 {
        if self.low_24h > 0.0 {
            (self.high_24h - self.low_24h) / self.low_24h
        } else {
            0.0
        }
    }
}
