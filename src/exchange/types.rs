//! Bybit V5 wire types and their conversion into domain types

use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

use crate::types::{Candle, ClosedTrade, ExchangePosition, Side, Symbol, Ticker};

/// Standard response envelope
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope {
    #[serde(rename = "retCode")]
    pub ret_code: i64,
    #[serde(rename = "retMsg", default)]
    pub ret_msg: String,
    #[serde(default)]
    pub result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListResult<T> {
    #[serde(default = "Vec::new")]
    pub list: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TickerDto {
    symbol: String,
    #[serde(rename = "lastPrice", default)]
    last_price: String,
    #[serde(rename = "turnover24h", default)]
    turnover_24h: String,
    #[serde(rename = "highPrice24h", default)]
    high_24h: String,
    #[serde(rename = "lowPrice24h", default)]
    low_24h: String,
    #[serde(rename = "fundingRate", default)]
    funding_rate: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WalletAccountDto {
    #[serde(default)]
    pub coin: Vec<WalletCoinDto>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WalletCoinDto {
    pub coin: String,
    #[serde(rename = "walletBalance", default)]
    pub wallet_balance: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PositionDto {
    symbol: String,
    #[serde(default)]
    side: String,
    #[serde(default)]
    size: String,
    #[serde(rename = "avgPrice", default)]
    avg_price: String,
    #[serde(rename = "unrealisedPnl", default)]
    unrealised_pnl: String,
    #[serde(rename = "createdTime", default)]
    created_time: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ClosedPnlDto {
    #[serde(rename = "orderId")]
    order_id: String,
    symbol: String,
    #[serde(rename = "closedPnl", default)]
    closed_pnl: String,
    #[serde(rename = "avgExitPrice", default)]
    avg_exit_price: String,
    #[serde(rename = "updatedTime", default)]
    updated_time: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OrderCreatedDto {
    #[serde(rename = "orderId", default)]
    pub order_id: String,
}

/// Lenient numeric parse: empty or garbage fields count as zero
fn num(raw: &str) -> f64 {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

fn millis(raw: &str) -> i64 {
    raw.trim().parse::<i64>().unwrap_or(0)
}

impl TickerDto {
    /// USDT-margined perpetuals only; USDC pairs are dropped
    pub fn into_ticker(self) -> Option<Ticker> {
        if !self.symbol.ends_with("USDT") || self.symbol.contains("USDC") {
            return None;
        }
        Some(Ticker {
            symbol: Symbol::new(&self.symbol),
            last_price: num(&self.last_price),
            turnover_24h: num(&self.turnover_24h),
            high_24h: num(&self.high_24h),
            low_24h: num(&self.low_24h),
            funding_rate: num(&self.funding_rate),
        })
    }
}

/// Kline rows arrive newest-first as `[start, open, high, low, close, volume, turnover]`;
/// the newest row is the bar that is still open
pub(crate) fn decode_klines(rows: Vec<Vec<String>>) -> Option<Vec<Candle>> {
    let mut candles = rows
        .into_iter()
        .map(|row| {
            if row.len() < 6 {
                return None;
            }
            Some(Candle {
                open_time: millis(&row[0]),
                open: row[1].parse().ok()?,
                high: row[2].parse().ok()?,
                low: row[3].parse().ok()?,
                close: row[4].parse().ok()?,
                volume: row[5].parse().ok()?,
            })
        })
        .collect::<Option<Vec<_>>>()?;
    candles.reverse();
    Some(candles)
}

impl PositionDto {
    /// `None` for flat or unparseable rows
    pub fn into_position(self) -> Option<ExchangePosition> {
        let size = Decimal::from_str(self.size.trim()).ok()?;
        if size <= Decimal::ZERO {
            return None;
        }
        Some(ExchangePosition {
            symbol: Symbol::new(&self.symbol),
            side: Side::from_order_side(&self.side)?,
            entry_price: num(&self.avg_price),
            size,
            created_at: millis(&self.created_time),
            unrealised_pnl: num(&self.unrealised_pnl),
        })
    }
}

impl ClosedPnlDto {
    pub fn into_closed_trade(self) -> ClosedTrade {
        ClosedTrade {
            order_id: self.order_id,
            symbol: Symbol::new(&self.symbol),
            closed_pnl: num(&self.closed_pnl),
            avg_exit_price: num(&self.avg_exit_price),
            updated_at: millis(&self.updated_time),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn klines_are_reversed_to_oldest_first() {
        let rows = vec![
            vec!["2000", "2", "3", "1", "2.5", "10", "25"],
            vec!["1000", "1", "2", "0.5", "1.5", "8", "12"],
        ]
        .into_iter()
        .map(|r| r.into_iter().map(String::from).collect())
        .collect();
        let candles = decode_klines(rows).unwrap();
        assert_eq!(candles[0].open_time, 1000);
        assert_eq!(candles[1].close, 2.5);
    }

    #[test]
    fn malformed_kline_row_rejects_batch() {
        let rows = vec![vec!["1000".to_string(), "x".to_string()]];
        assert!(decode_klines(rows).is_none());
    }

    #[test]
    fn flat_positions_are_dropped() {
        let raw = r#"{"list":[
            {"symbol":"BTCUSDT","side":"Buy","size":"0.010","avgPrice":"60000","unrealisedPnl":"1.5","createdTime":"1700000000000"},
            {"symbol":"ETHUSDT","side":"","size":"0","avgPrice":"0","unrealisedPnl":"0","createdTime":"0"}
        ]}"#;
        let parsed: ListResult<PositionDto> = serde_json::from_str(raw).unwrap();
        let positions: Vec<_> = parsed
            .list
            .into_iter()
            .filter_map(PositionDto::into_position)
            .collect();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].size, dec!(0.010));
        assert_eq!(positions[0].side, Side::Long);
        assert_eq!(positions[0].created_at, 1_700_000_000_000);
    }

    #[test]
    fn usdc_and_non_usdt_tickers_are_filtered() {
        let raw = r#"{"list":[
            {"symbol":"SOLUSDT","lastPrice":"150","turnover24h":"1000000","highPrice24h":"160","lowPrice24h":"140","fundingRate":"0.0001"},
            {"symbol":"BTCPERP","lastPrice":"60000","turnover24h":"1","highPrice24h":"1","lowPrice24h":"1","fundingRate":""}
        ]}"#;
        let parsed: ListResult<TickerDto> = serde_json::from_str(raw).unwrap();
        let tickers: Vec<_> = parsed
            .list
            .into_iter()
            .filter_map(TickerDto::into_ticker)
            .collect();
        assert_eq!(tickers.len(), 1);
        assert_eq!(tickers[0].symbol.as_str(), "SOLUSDT");
        assert!((tickers[0].funding_rate - 0.0001).abs() < 1e-12);
    }
}
