//! Signal Engine
//!
//! Turns an indicator bundle plus the global trend label into a discrete
//! `LONG` / `SHORT` / `WAIT` decision. Evaluation order:
//!
//! 1. Gate: ADX above threshold AND volume above its 20-bar average
//! 2. `LONG`: price > EMA200, MACD histogram > 0, RSI in (50, 70), trend BULL
//! 3. `SHORT`: price < EMA200, MACD histogram < 0, RSI in (30, 50), trend BEAR
//! 4. Otherwise `WAIT`
//!
//! A volume spike changes position size, never the signal.

use std::sync::Arc;
use tracing::debug;

use crate::config::ModeConfig;
use crate::exchange::Exchange;
use crate::indicators;
use crate::types::{Candle, IndicatorBundle, MarketSnapshot, Signal, Symbol, Trend, TradingMode};

/// Candles requested for a full evaluation
pub const EVALUATION_CANDLES: usize = 200;
/// Reference-instrument trend: close vs EMA over this many bars
pub const GLOBAL_TREND_PERIOD: usize = 200;
/// Per-instrument higher-timeframe trend: close vs EMA over this many bars
pub const HTF_TREND_PERIOD: usize = 50;

const VOLUME_SPIKE_RATIO: f64 = 2.0;
const VOLUME_SPIKE_MULTIPLIER: f64 = 1.5;

const LONG_RSI_BAND: (f64, f64) = (50.0, 70.0);
const SHORT_RSI_BAND: (f64, f64) = (30.0, 50.0);

/// Length of one bar in milliseconds for an exchange interval
pub fn interval_ms(interval: &str) -> Option<i64> {
    const MINUTE: i64 = 60_000;
    match interval {
        "D" => Some(1_440 * MINUTE),
        "W" => Some(10_080 * MINUTE),
        minutes => minutes
            .parse::<i64>()
            .ok()
            .filter(|m| *m > 0)
            .map(|m| m * MINUTE),
    }
}

/// Drop the newest bar while it is still forming
///
/// The exchange always includes the open bar. Intervals without a fixed
/// length ("M") treat the newest bar as open.
pub fn closed_candles(mut candles: Vec<Candle>, interval: &str, now: i64) -> Vec<Candle> {
    let forming = match (candles.last(), interval_ms(interval)) {
        (Some(last), Some(len)) => last.open_time + len > now,
        (Some(_), None) => true,
        (None, _) => false,
    };
    if forming {
        candles.pop();
    }
    candles
}

/// Pure decision rule
pub fn decide(b: &IndicatorBundle, trend: Trend, adx_threshold: f64) -> Signal {
    if !(b.adx > adx_threshold && b.volume > b.volume_ma) {
        return Signal::Wait;
    }

    let long = b.price > b.ema
        && b.macd_hist > 0.0
        && b.rsi > LONG_RSI_BAND.0
        && b.rsi < LONG_RSI_BAND.1
        && trend == Trend::Bull;
    if long {
        return Signal::Long;
    }

    let short = b.price < b.ema
        && b.macd_hist < 0.0
        && b.rsi > SHORT_RSI_BAND.0
        && b.rsi < SHORT_RSI_BAND.1
        && trend == Trend::Bear;
    if short {
        return Signal::Short;
    }

    Signal::Wait
}

/// Sizing multiplier from the volume spike check
pub fn volume_multiplier(b: &IndicatorBundle) -> f64 {
    if b.volume > b.volume_ma * VOLUME_SPIKE_RATIO {
        VOLUME_SPIKE_MULTIPLIER
    } else {
        1.0
    }
}

/// Drop signals that fight the higher-timeframe trend
pub fn apply_htf_veto(signal: Signal, htf: Trend) -> Signal {
    match (signal, htf) {
        (Signal::Long, Trend::Bear) | (Signal::Short, Trend::Bull) => Signal::Wait,
        _ => signal,
    }
}

/// Latest close against its EMA; `None` when history is too short
pub fn trend_of(candles: &[Candle], period: usize) -> Option<Trend> {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let ema = indicators::ema(&closes, period)?;
    let last = *closes.last()?;
    Some(if last > ema { Trend::Bull } else { Trend::Bear })
}

/// Fetches candles and evaluates instruments
pub struct SignalEngine {
    exchange: Arc<dyn Exchange>,
    reference_symbol: Symbol,
    trend_interval: String,
}

impl SignalEngine {
    pub fn new(exchange: Arc<dyn Exchange>, reference_symbol: Symbol, trend_interval: &str) -> Self {
        Self {
            exchange,
            reference_symbol,
            trend_interval: trend_interval.to_string(),
        }
    }

    /// Evaluate one instrument; `None` means "no opinion"
    ///
    /// The returned signal is before any higher-timeframe veto; see
    /// [`SignalEngine::higher_timeframe_trend`].
    pub async fn evaluate(
        &self,
        symbol: &Symbol,
        mode: TradingMode,
        mode_config: &ModeConfig,
        trend: Trend,
        adx_threshold: f64,
        now: i64,
    ) -> Option<MarketSnapshot> {
        let candles = match self
            .exchange
            .klines(symbol, &mode_config.interval, EVALUATION_CANDLES + 1)
            .await
        {
            Ok(c) => closed_candles(c, &mode_config.interval, now),
            Err(e) => {
                debug!(symbol = %symbol, error = %e, "kline fetch failed");
                return None;
            }
        };

        let Some(bundle) = indicators::compute(&candles) else {
            debug!(symbol = %symbol, candles = candles.len(), "insufficient history");
            return None;
        };

        let signal = decide(&bundle, trend, adx_threshold);
        let volume_multiplier = volume_multiplier(&bundle);

        Some(MarketSnapshot {
            symbol: symbol.clone(),
            mode,
            indicators: bundle,
            signal,
            volume_multiplier,
            ts: now,
        })
    }

    /// Reference instrument trend; `Neutral` on any failure
    pub async fn global_trend(&self, now: i64) -> Trend {
        self.trend(&self.reference_symbol, GLOBAL_TREND_PERIOD, now)
            .await
    }

    /// Instrument trend on the trend interval; `Neutral` on any failure
    pub async fn higher_timeframe_trend(&self, symbol: &Symbol, now: i64) -> Trend {
        self.trend(symbol, HTF_TREND_PERIOD, now).await
    }

    /// Closed bars only, so one extra row covers the open one
    async fn trend(&self, symbol: &Symbol, period: usize, now: i64) -> Trend {
        match self
            .exchange
            .klines(symbol, &self.trend_interval, period + 1)
            .await
        {
            Ok(candles) => {
                let candles = closed_candles(candles, &self.trend_interval, now);
                trend_of(&candles, period).unwrap_or_default()
            }
            Err(e) => {
                debug!(symbol = %symbol, error = %e, "trend fetch failed");
                Trend::Neutral
            }
        }
    }
}
