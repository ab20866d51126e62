//! Instrument Selector
//!
//! Splits the liquid part of the linear universe into a scalp set (most
//! volatile half) and a swing set (the rest). Runs on a multi-hour cadence.

use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::SelectorConfig;
use crate::exchange::Exchange;
use crate::types::{Symbol, Ticker};

/// Current scalp / swing candidate lists
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Universe {
    pub scalp: Vec<Symbol>,
    pub swing: Vec<Symbol>,
}

impl Universe {
    pub fn is_empty(&self) -> bool {
        self.scalp.is_empty() && self.swing.is_empty()
    }

    pub fn is_scalp(&self, symbol: &Symbol) -> bool {
        self.scalp.contains(symbol)
    }
}

/// Pure ranking: funding filter, liquidity top-K, volatility split
pub fn partition(tickers: &[Ticker], max_funding_rate: f64, top_k: usize) -> Universe {
    let mut liquid: Vec<&Ticker> = tickers
        .iter()
        .filter(|t| t.funding_rate.abs() <= max_funding_rate)
        .collect();
    liquid.sort_by(|a, b| {
        b.turnover_24h
            .partial_cmp(&a.turnover_24h)
            .unwrap_or(Ordering::Equal)
    });
    liquid.truncate(top_k);

    liquid.sort_by(|a, b| {
        b.range_volatility()
            .partial_cmp(&a.range_volatility())
            .unwrap_or(Ordering::Equal)
    });

    let scalp_len = liquid.len().div_ceil(2);
    let (scalp, swing) = liquid.split_at(scalp_len);
    Universe {
        scalp: scalp.iter().map(|t| t.symbol.clone()).collect(),
        swing: swing.iter().map(|t| t.symbol.clone()).collect(),
    }
}

pub struct InstrumentSelector {
    exchange: Arc<dyn Exchange>,
    top_k: usize,
    fallback: Universe,
}

impl InstrumentSelector {
    pub fn new(exchange: Arc<dyn Exchange>, config: &SelectorConfig) -> Self {
        Self {
            exchange,
            top_k: config.top_liquidity,
            fallback: Universe {
                scalp: vec![Symbol::new(&config.fallback_scalp)],
                swing: vec![Symbol::new(&config.fallback_swing)],
            },
        }
    }

    /// New candidate lists, or `previous` when the universe cannot be fetched
    ///
    /// Never returns an empty universe: the fallback pair stands in when both
    /// lists would otherwise be empty.
    pub async fn refresh(&self, previous: &Universe, max_funding_rate: f64) -> Universe {
        let next = match self.exchange.tickers().await {
            Ok(tickers) => {
                let universe = partition(&tickers, max_funding_rate, self.top_k);
                info!(
                    universe = tickers.len(),
                    scalp = universe.scalp.len(),
                    swing = universe.swing.len(),
                    "instrument lists refreshed"
                );
                universe
            }
            Err(e) => {
                warn!(error = %e, "ticker fetch failed, keeping previous lists");
                previous.clone()
            }
        };

        if next.is_empty() {
            warn!("no candidates, using fallback pair");
            self.fallback.clone()
        } else {
            next
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ExchangeError, MockExchange};

    fn ticker(symbol: &str, turnover: f64, range: f64, funding: f64) -> Ticker {
        Ticker {
            symbol: Symbol::new(symbol),
            last_price: 100.0,
            turnover_24h: turnover,
            high_24h: 100.0 * (1.0 + range),
            low_24h: 100.0,
            funding_rate: funding,
        }
    }

    fn config() -> SelectorConfig {
        SelectorConfig {
            top_liquidity: 3,
            fallback_scalp: "SOLUSDT".into(),
            fallback_swing: "BTCUSDT".into(),
            mood_url: String::new(),
        }
    }

    fn names(list: &[Symbol]) -> Vec<&str> {
        list.iter().map(|s| s.as_str()).collect()
    }

    #[test]
    fn filters_funding_then_takes_top_liquidity_then_splits_by_volatility() {
        let tickers = vec![
            ticker("AUSDT", 1_000.0, 0.10, 0.0001),
            ticker("BUSDT", 900.0, 0.30, 0.0),
            ticker("CUSDT", 800.0, 0.05, -0.0002),
            ticker("DUSDT", 5_000.0, 0.50, 0.01), // funding too hot
            ticker("EUSDT", 10.0, 0.90, 0.0),     // too illiquid for top 3
        ];
        let u = partition(&tickers, 0.001, 3);
        assert_eq!(names(&u.scalp), vec!["BUSDT", "AUSDT"]);
        assert_eq!(names(&u.swing), vec!["CUSDT"]);
    }

    #[test]
    fn odd_count_puts_extra_in_scalp() {
        let tickers: Vec<_> = (0..5)
            .map(|i| ticker(&format!("S{i}USDT"), 100.0, i as f64 * 0.01, 0.0))
            .collect();
        let u = partition(&tickers, 0.001, 40);
        assert_eq!(u.scalp.len(), 3);
        assert_eq!(u.swing.len(), 2);
        assert_eq!(u.scalp[0].as_str(), "S4USDT");
    }

    #[tokio::test]
    async fn failure_keeps_previous_lists() {
        let mut mock = MockExchange::new();
        mock.expect_tickers()
            .returning(|| Err(ExchangeError::Transport("timeout".into())));
        let selector = InstrumentSelector::new(Arc::new(mock), &config());
        let previous = Universe {
            scalp: vec![Symbol::new("PEPEUSDT")],
            swing: vec![],
        };
        assert_eq!(selector.refresh(&previous, 0.001).await, previous);
    }

    #[tokio::test]
    async fn failure_with_nothing_cached_uses_fallback() {
        let mut mock = MockExchange::new();
        mock.expect_tickers()
            .returning(|| Err(ExchangeError::Transport("timeout".into())));
        let selector = InstrumentSelector::new(Arc::new(mock), &config());
        let u = selector.refresh(&Universe::default(), 0.001).await;
        assert_eq!(names(&u.scalp), vec!["SOLUSDT"]);
        assert_eq!(names(&u.swing), vec!["BTCUSDT"]);
    }
}
