//! Technical indicator math
//!
//! Pure functions over oldest-first candle slices. Every function returns
//! `None` when the input is too short to produce a meaningful value, which the
//! signal engine treats as "no opinion".
//!
//! Smoothing conventions:
//! - EMA is seeded with the SMA of the first `period` values
//! - RSI, ATR and ADX use Wilder's smoothing (RMA, alpha = 1/period)

use crate::types::{Candle, IndicatorBundle};

pub const ADX_PERIOD: usize = 14;
pub const RSI_PERIOD: usize = 14;
pub const ATR_PERIOD: usize = 14;
pub const EMA_PERIOD: usize = 200;
pub const VOLUME_MA_PERIOD: usize = 20;
pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;

/// Candles needed for a full indicator bundle
pub const MIN_CANDLES: usize = EMA_PERIOD;

/// Simple moving average of the last `period` values
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// Full EMA series; element `i` corresponds to `values[period - 1 + i]`
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema = values[..period].iter().sum::<f64>() / period as f64;
    let mut out = Vec::with_capacity(values.len() - period + 1);
    out.push(ema);
    for v in &values[period..] {
        ema = (v - ema) * multiplier + ema;
        out.push(ema);
    }
    out
}

/// Latest EMA value
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    ema_series(values, period).last().copied()
}

/// Wilder moving average series, seeded with the SMA of the first `period` values
fn rma_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    let p = period as f64;
    let mut avg = values[..period].iter().sum::<f64>() / p;
    let mut out = Vec::with_capacity(values.len() - period + 1);
    out.push(avg);
    for v in &values[period..] {
        avg = (avg * (p - 1.0) + v) / p;
        out.push(avg);
    }
    out
}

/// RSI with Wilder's smoothing
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if closes.len() < period + 1 {
        return None;
    }
    let changes: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let gains: Vec<f64> = changes.iter().map(|c| c.max(0.0)).collect();
    let losses: Vec<f64> = changes.iter().map(|c| (-c).max(0.0)).collect();

    let avg_gain = *rma_series(&gains, period).last()?;
    let avg_loss = *rma_series(&losses, period).last()?;

    if avg_gain < 1e-12 && avg_loss < 1e-12 {
        return Some(50.0); // No movement = neutral
    }
    if avg_loss < 1e-12 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

fn true_ranges(candles: &[Candle]) -> Vec<f64> {
    candles
        .windows(2)
        .map(|w| {
            let (prev, curr) = (&w[0], &w[1]);
            (curr.high - curr.low)
                .max((curr.high - prev.close).abs())
                .max((curr.low - prev.close).abs())
        })
        .collect()
}

/// Average True Range with Wilder's smoothing
pub fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if candles.len() < period + 1 {
        return None;
    }
    rma_series(&true_ranges(candles), period).last().copied()
}

/// Average Directional Index
///
/// +DM/-DM and TR are Wilder-smoothed into +DI/-DI, DX is derived per bar and
/// ADX is the Wilder average of DX. Needs `2 * period + 1` candles.
pub fn adx(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period * 2 + 1 {
        return None;
    }

    let mut plus_dm = Vec::with_capacity(candles.len() - 1);
    let mut minus_dm = Vec::with_capacity(candles.len() - 1);
    for w in candles.windows(2) {
        let up_move = w[1].high - w[0].high;
        let down_move = w[0].low - w[1].low;
        plus_dm.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dm.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
    }
    let tr = true_ranges(candles);

    let smoothed_plus = rma_series(&plus_dm, period);
    let smoothed_minus = rma_series(&minus_dm, period);
    let smoothed_tr = rma_series(&tr, period);

    let dx: Vec<f64> = smoothed_tr
        .iter()
        .zip(smoothed_plus.iter().zip(smoothed_minus.iter()))
        .map(|(tr, (p, m))| {
            if *tr <= 0.0 {
                return 0.0;
            }
            let plus_di = 100.0 * p / tr;
            let minus_di = 100.0 * m / tr;
            let di_sum = plus_di + minus_di;
            if di_sum > 0.0 {
                100.0 * (plus_di - minus_di).abs() / di_sum
            } else {
                0.0
            }
        })
        .collect();

    rma_series(&dx, period).last().copied()
}

/// MACD histogram (MACD line minus its signal EMA)
pub fn macd_histogram(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Option<f64> {
    if fast >= slow || closes.len() < slow + signal - 1 {
        return None;
    }
    let fast_ema = ema_series(closes, fast);
    let slow_ema = ema_series(closes, slow);
    // Align the fast series to the first bar the slow series covers
    let offset = slow - fast;
    let macd_line: Vec<f64> = slow_ema
        .iter()
        .enumerate()
        .map(|(i, s)| fast_ema[i + offset] - s)
        .collect();
    let signal_line = ema(&macd_line, signal)?;
    Some(macd_line.last()? - signal_line)
}

/// Full indicator bundle for the latest candle
pub fn compute(candles: &[Candle]) -> Option<IndicatorBundle> {
    if candles.len() < MIN_CANDLES {
        return None;
    }
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
    let last = candles.last()?;

    let bundle = IndicatorBundle {
        adx: adx(candles, ADX_PERIOD)?,
        rsi: rsi(&closes, RSI_PERIOD)?,
        ema: ema(&closes, EMA_PERIOD)?,
        macd_hist: macd_histogram(&closes, MACD_FAST, MACD_SLOW, MACD_SIGNAL)?,
        atr: atr(candles, ATR_PERIOD)?,
        volume: last.volume,
        volume_ma: sma(&volumes, VOLUME_MA_PERIOD)?,
        price: last.close,
    };

    let all_finite = [
        bundle.adx,
        bundle.rsi,
        bundle.ema,
        bundle.macd_hist,
        bundle.atr,
        bundle.volume_ma,
        bundle.price,
    ]
    .iter()
    .all(|v| v.is_finite());

    if all_finite {
        Some(bundle)
    } else {
        tracing::debug!("indicator bundle contains non-finite values");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_candle(ts: i64, close: f64) -> Candle {
        Candle {
            open_time: ts,
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1000.0,
        }
    }

    fn series(closes: impl IntoIterator<Item = f64>) -> Vec<Candle> {
        closes
            .into_iter()
            .enumerate()
            .map(|(i, c)| make_candle(i as i64 * 60_000, c))
            .collect()
    }

    #[test]
    fn sma_and_ema_of_constant_series() {
        let values = vec![5.0; 50];
        assert_eq!(sma(&values, 20), Some(5.0));
        assert!((ema(&values, 20).unwrap() - 5.0).abs() < 1e-12);
        assert_eq!(sma(&values, 51), None);
        assert_eq!(ema(&values, 51), None);
    }

    #[test]
    fn ema_tracks_recent_values_more_closely() {
        let mut values = vec![10.0; 30];
        values.extend(vec![20.0; 10]);
        let e = ema(&values, 10).unwrap();
        let s = sma(&values[..30], 10).unwrap();
        assert!(e > s);
        assert!(e < 20.0 + 1e-9);
    }

    #[test]
    fn rsi_extremes() {
        let up: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        assert_eq!(rsi(&up, 14), Some(100.0));

        let down: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect();
        assert!(rsi(&down, 14).unwrap() < 1e-9);

        let flat = vec![100.0; 30];
        assert_eq!(rsi(&flat, 14), Some(50.0));

        assert_eq!(rsi(&up[..14], 14), None);
    }

    #[test]
    fn rsi_is_bounded_on_mixed_series() {
        let closes: Vec<f64> = (0..100)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0 + i as f64 * 0.05)
            .collect();
        let r = rsi(&closes, 14).unwrap();
        assert!(r > 0.0 && r < 100.0);
    }

    #[test]
    fn atr_of_constant_range() {
        // Every bar spans 2.0 and closes mid-range
        let candles = series(vec![100.0; 40]);
        assert!((atr(&candles, 14).unwrap() - 2.0).abs() < 1e-9);
        assert_eq!(atr(&candles[..14], 14), None);
    }

    #[test]
    fn adx_high_in_strong_trend_low_when_choppy() {
        let trending = series((0..120).map(|i| 100.0 + i as f64 * 3.0));
        let strong = adx(&trending, 14).unwrap();
        assert!(strong > 50.0, "trend adx {strong}");

        let choppy = series((0..120).map(|i| if i % 2 == 0 { 100.0 } else { 100.5 }));
        let weak = adx(&choppy, 14).unwrap();
        assert!(weak < strong);
        assert!(weak < 25.0, "chop adx {weak}");

        assert_eq!(adx(&trending[..28], 14), None);
    }

    #[test]
    fn macd_histogram_sign_follows_acceleration() {
        let flat = vec![100.0; 80];
        assert!(macd_histogram(&flat, 12, 26, 9).unwrap().abs() < 1e-9);

        let accelerating: Vec<f64> = (0..80).map(|i| 100.0 + (i * i) as f64 * 0.01).collect();
        assert!(macd_histogram(&accelerating, 12, 26, 9).unwrap() > 0.0);

        let falling: Vec<f64> = (0..80).map(|i| 200.0 - (i * i) as f64 * 0.01).collect();
        assert!(macd_histogram(&falling, 12, 26, 9).unwrap() < 0.0);

        assert_eq!(macd_histogram(&flat[..30], 12, 26, 9), None);
    }

    #[test]
    fn bundle_requires_full_history() {
        let candles = series((0..199).map(|i| 100.0 + i as f64 * 0.1));
        assert!(compute(&candles).is_none());

        let candles = series((0..250).map(|i| 100.0 + i as f64 * 0.1));
        let bundle = compute(&candles).unwrap();
        assert_eq!(bundle.price, candles.last().unwrap().close);
        assert_eq!(bundle.volume, 1000.0);
        assert_eq!(bundle.volume_ma, 1000.0);
        assert!(bundle.price > bundle.ema);
        assert!(bundle.rsi > 50.0);
    }
}
