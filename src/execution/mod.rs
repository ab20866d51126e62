//! Execution & Protection Manager
//!
//! Sizes entries, submits market orders and installs exchange-side
//! protection. Protection is only reachable from the confirmed-fill branch,
//! so a rejected entry can never leave orphaned stops behind.

use rust_decimal::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::{ExchangeConfig, ModeConfig};
use crate::exchange::{Exchange, ExchangeError, MarketOrder};
use crate::types::{Side, Symbol};

/// Everything needed to size and protect one entry
#[derive(Debug, Clone)]
pub struct EntryRequest<'a> {
    pub symbol: &'a Symbol,
    pub side: Side,
    pub price: f64,
    pub atr: f64,
    pub mode_config: &'a ModeConfig,
    /// Volume-spike multiplier from the signal engine, ignored unless the
    /// mode has `volume_boost`
    pub size_multiplier: f64,
    pub risk_per_trade: f64,
    pub leverage: u32,
    /// Mood-driven multiplier
    pub sentiment_multiplier: f64,
}

impl EntryRequest<'_> {
    pub fn effective_size_multiplier(&self) -> f64 {
        if self.mode_config.volume_boost {
            self.size_multiplier
        } else {
            1.0
        }
    }
}

/// Confirmed entry
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub order_id: String,
    pub qty: Decimal,
    pub protection: ProtectionPlan,
    /// Both protective legs were accepted
    pub protected: bool,
}

/// Exchange-side protection levels for one position
#[derive(Debug, Clone, PartialEq)]
pub struct ProtectionPlan {
    pub stop_loss: Decimal,
    pub trail_activation: Decimal,
    pub trail_distance: Decimal,
}

impl ProtectionPlan {
    /// Stop-loss at `entry ∓ ATR×sl`, trailing activation at `entry ± ATR×activation`
    pub fn new(side: Side, entry: f64, atr: f64, mode: &ModeConfig) -> Self {
        let sign = side.sign();
        Self {
            stop_loss: round_price(entry - sign * atr * mode.sl_atr),
            trail_activation: round_price(entry + sign * atr * mode.trail_activation_atr),
            trail_distance: round_price(atr * mode.trail_callback_atr),
        }
    }
}

/// Order quantity: `risk × size_mult × sentiment × leverage ÷ price`
///
/// Precision depends on price: above 100 three decimals, above 1 one
/// decimal, otherwise whole units (truncated).
pub fn order_qty(
    risk_per_trade: f64,
    size_multiplier: f64,
    sentiment_multiplier: f64,
    leverage: u32,
    price: f64,
) -> Decimal {
    if price <= 0.0 || !price.is_finite() {
        return Decimal::ZERO;
    }
    let raw = risk_per_trade * size_multiplier * sentiment_multiplier * leverage as f64 / price;
    let Some(qty) = Decimal::from_f64(raw) else {
        return Decimal::ZERO;
    };
    let qty = if price > 100.0 {
        qty.round_dp(3)
    } else if price > 1.0 {
        qty.round_dp(1)
    } else {
        qty.trunc()
    };
    qty.max(Decimal::ZERO).normalize()
}

/// Price precision for protective levels
pub fn round_price(price: f64) -> Decimal {
    let Some(p) = Decimal::from_f64(price) else {
        return Decimal::ZERO;
    };
    let rounded = if price > 1000.0 {
        p.trunc()
    } else if price > 1.0 {
        p.round_dp(2)
    } else if price > 0.01 {
        p.round_dp(4)
    } else {
        p.round_dp(8)
    };
    rounded.normalize()
}

pub struct ExecutionManager {
    exchange: Arc<dyn Exchange>,
    /// Wait after the fill before the first protective leg
    protection_delay: Duration,
    /// Wait between the stop-loss and trailing-stop legs
    leg_delay: Duration,
}

impl ExecutionManager {
    pub fn new(exchange: Arc<dyn Exchange>, protection_delay: Duration, leg_delay: Duration) -> Self {
        Self {
            exchange,
            protection_delay,
            leg_delay,
        }
    }

    pub fn from_config(exchange: Arc<dyn Exchange>, cfg: &ExchangeConfig) -> Self {
        Self::new(
            exchange,
            Duration::from_millis(cfg.protection_delay_ms),
            Duration::from_millis(cfg.protection_leg_delay_ms),
        )
    }

    /// Open and protect a position; `None` when no order was filled
    pub async fn open(&self, req: &EntryRequest<'_>) -> Option<Fill> {
        let qty = order_qty(
            req.risk_per_trade,
            req.effective_size_multiplier(),
            req.sentiment_multiplier,
            req.leverage,
            req.price,
        );
        if qty.is_zero() {
            warn!(symbol = %req.symbol, price = req.price, "quantity rounds to zero, entry skipped");
            return None;
        }

        // Best effort: a failed leverage change does not block the entry
        if let Err(e) = self.exchange.set_leverage(req.symbol, req.leverage).await {
            warn!(symbol = %req.symbol, error = %e, "set leverage failed");
        }

        let order = MarketOrder::open(req.symbol.clone(), req.side, qty);
        let order_id = match self.exchange.place_market_order(&order).await {
            Ok(id) => id,
            Err(e) => {
                warn!(symbol = %req.symbol, side = %req.side, qty = %qty, error = %e, "entry not filled");
                return None;
            }
        };

        info!(
            symbol = %req.symbol,
            side = %req.side,
            qty = %qty,
            price = req.price,
            order_id = %order_id,
            "entry filled"
        );

        let protection = ProtectionPlan::new(req.side, req.price, req.atr, req.mode_config);
        let protected = self.protect(req.symbol, &protection).await;

        Some(Fill {
            order_id,
            qty,
            protection,
            protected,
        })
    }

    /// Stop-loss first, then the trailing stop
    async fn protect(&self, symbol: &Symbol, plan: &ProtectionPlan) -> bool {
        tokio::time::sleep(self.protection_delay).await;

        let sl_ok = if plan.stop_loss > Decimal::ZERO {
            match self.exchange.set_stop_loss(symbol, plan.stop_loss).await {
                Ok(()) => true,
                Err(e) => {
                    error!(symbol = %symbol, stop_loss = %plan.stop_loss, error = %e, "stop-loss not installed");
                    false
                }
            }
        } else {
            error!(symbol = %symbol, stop_loss = %plan.stop_loss, "stop-loss level not positive, skipped");
            false
        };

        tokio::time::sleep(self.leg_delay).await;

        let ts_ok = match self
            .exchange
            .set_trailing_stop(symbol, plan.trail_activation, plan.trail_distance)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!(symbol = %symbol, error = %e, "trailing stop not installed");
                false
            }
        };

        if sl_ok && ts_ok {
            info!(
                symbol = %symbol,
                stop_loss = %plan.stop_loss,
                activation = %plan.trail_activation,
                distance = %plan.trail_distance,
                "position protected"
            );
        }
        sl_ok && ts_ok
    }

    /// Reduce-only close of the reported size; returns orders placed
    pub async fn close(&self, symbol: &Symbol) -> Result<usize, ExchangeError> {
        let positions = self.exchange.position(symbol).await?;
        let mut closed = 0;
        for position in positions.iter().filter(|p| !p.size.is_zero()) {
            self.exchange
                .place_market_order(&MarketOrder::flatten(position))
                .await?;
            info!(symbol = %symbol, size = %position.size, "position closed");
            closed += 1;
        }
        Ok(closed)
    }

    /// Kill switch: cancel resting orders, then flatten everything
    pub async fn kill_all(&self) -> Result<usize, ExchangeError> {
        if let Err(e) = self.exchange.cancel_all_orders().await {
            error!(error = %e, "cancel-all failed, flattening anyway");
        }

        let positions = self.exchange.positions().await?;
        let mut flattened = 0;
        for position in &positions {
            match self
                .exchange
                .place_market_order(&MarketOrder::flatten(position))
                .await
            {
                Ok(_) => flattened += 1,
                Err(e) => error!(symbol = %position.symbol, error = %e, "flatten failed"),
            }
        }
        warn!(flattened, total = positions.len(), "kill switch executed");
        Ok(flattened)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockExchange;
    use crate::types::ExchangePosition;
    use mockall::Sequence;
    use rust_decimal_macros::dec;

    fn manager(mock: MockExchange) -> ExecutionManager {
        ExecutionManager::new(Arc::new(mock), Duration::ZERO, Duration::ZERO)
    }

    fn request<'a>(symbol: &'a Symbol, mode: &'a ModeConfig, price: f64) -> EntryRequest<'a> {
        EntryRequest {
            symbol,
            side: Side::Long,
            price,
            atr: 2.0,
            mode_config: mode,
            size_multiplier: 1.0,
            risk_per_trade: 4.0,
            leverage: 5,
            sentiment_multiplier: 1.0,
        }
    }

    fn position(symbol: &str, side: Side, size: Decimal) -> ExchangePosition {
        ExchangePosition {
            symbol: Symbol::new(symbol),
            side,
            entry_price: 100.0,
            size,
            created_at: 0,
            unrealised_pnl: 0.0,
        }
    }

    // ==================== SIZING ====================

    #[test]
    fn qty_precision_by_price_tier() {
        // 4 * 5 / 150 = 0.1333..
        assert_eq!(order_qty(4.0, 1.0, 1.0, 5, 150.0), dec!(0.133));
        // 4 * 5 / 3 = 6.666..
        assert_eq!(order_qty(4.0, 1.0, 1.0, 5, 3.0), dec!(6.7));
        // 4 * 5 / 0.3 = 66.66.. truncated
        assert_eq!(order_qty(4.0, 1.0, 1.0, 5, 0.3), dec!(66));
    }

    #[test]
    fn qty_applies_all_multipliers() {
        // 4 * 1.5 * 1.25 * 5 / 2 = 18.75 -> 18.8
        assert_eq!(order_qty(4.0, 1.5, 1.25, 5, 2.0), dec!(18.8));
    }

    #[test]
    fn volume_boost_flag_gates_the_spike_multiplier() {
        let symbol = Symbol::new("ETHUSDT");
        let swing = ModeConfig::swing_default();
        let scalp = ModeConfig::scalp_default();
        let swing_req = EntryRequest {
            size_multiplier: 1.5,
            ..request(&symbol, &swing, 100.0)
        };
        let scalp_req = EntryRequest {
            size_multiplier: 1.5,
            ..request(&symbol, &scalp, 100.0)
        };
        assert_eq!(swing_req.effective_size_multiplier(), 1.0);
        assert_eq!(scalp_req.effective_size_multiplier(), 1.5);
    }

    #[test]
    fn qty_zero_for_tiny_notional_or_bad_price() {
        assert!(order_qty(1.0, 1.0, 1.0, 1, 60_000.0).is_zero());
        assert!(order_qty(4.0, 1.0, 1.0, 5, 0.0).is_zero());
    }

    #[test]
    fn price_rounding_tiers() {
        assert_eq!(round_price(64_123.7), dec!(64123));
        assert_eq!(round_price(150.456), dec!(150.46));
        assert_eq!(round_price(0.123456), dec!(0.1235));
        assert_eq!(round_price(0.000012345678), dec!(0.00001235));
    }

    #[test]
    fn protection_levels_mirror_by_side() {
        let scalp = ModeConfig::scalp_default();
        let long = ProtectionPlan::new(Side::Long, 100.0, 2.0, &scalp);
        assert_eq!(long.stop_loss, dec!(94));
        assert_eq!(long.trail_activation, dec!(101));
        assert_eq!(long.trail_distance, dec!(1));

        let swing = ModeConfig::swing_default();
        let short = ProtectionPlan::new(Side::Short, 100.0, 2.0, &swing);
        assert_eq!(short.stop_loss, dec!(110));
        assert_eq!(short.trail_activation, dec!(97));
        assert_eq!(short.trail_distance, dec!(2));
    }

    // ==================== OPEN ====================

    #[tokio::test]
    async fn fill_installs_stop_loss_then_trailing_stop() {
        let mut mock = MockExchange::new();
        let mut seq = Sequence::new();
        mock.expect_set_leverage()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        mock.expect_place_market_order()
            .withf(|o| !o.reduce_only && o.order_side() == "Buy" && o.qty == dec!(0.133))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok("order-1".to_string()));
        mock.expect_set_stop_loss()
            .withf(|_, p| *p == dec!(144))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        mock.expect_set_trailing_stop()
            .withf(|_, a, d| *a == dec!(151) && *d == dec!(1))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        let sym = Symbol::new("SOLUSDT");
        let mode = ModeConfig::scalp_default();
        let fill = manager(mock).open(&request(&sym, &mode, 150.0)).await.unwrap();
        assert_eq!(fill.order_id, "order-1");
        assert!(fill.protected);
    }

    #[tokio::test]
    async fn rejected_entry_places_no_protection() {
        let mut mock = MockExchange::new();
        mock.expect_set_leverage().returning(|_, _| Ok(()));
        mock.expect_place_market_order().times(1).returning(|_| {
            Err(ExchangeError::Rejected {
                code: 110007,
                message: "ab not enough for new order".into(),
            })
        });
        mock.expect_set_stop_loss().never();
        mock.expect_set_trailing_stop().never();

        let sym = Symbol::new("SOLUSDT");
        let mode = ModeConfig::scalp_default();
        assert!(manager(mock).open(&request(&sym, &mode, 150.0)).await.is_none());
    }

    #[tokio::test]
    async fn leverage_failure_does_not_block_entry() {
        let mut mock = MockExchange::new();
        mock.expect_set_leverage()
            .returning(|_, _| Err(ExchangeError::Transport("timeout".into())));
        mock.expect_place_market_order()
            .times(1)
            .returning(|_| Ok("order-2".to_string()));
        mock.expect_set_stop_loss().times(1).returning(|_, _| Ok(()));
        mock.expect_set_trailing_stop()
            .times(1)
            .returning(|_, _, _| Err(ExchangeError::Transport("timeout".into())));

        let sym = Symbol::new("ETHUSDT");
        let mode = ModeConfig::swing_default();
        let fill = manager(mock).open(&request(&sym, &mode, 150.0)).await.unwrap();
        assert!(!fill.protected);
    }

    #[tokio::test]
    async fn zero_quantity_aborts_before_any_call() {
        let mut mock = MockExchange::new();
        mock.expect_set_leverage().never();
        mock.expect_place_market_order().never();

        let sym = Symbol::new("BTCUSDT");
        let mode = ModeConfig::scalp_default();
        let req = EntryRequest {
            risk_per_trade: 1.0,
            leverage: 1,
            ..request(&sym, &mode, 60_000.0)
        };
        assert!(manager(mock).open(&req).await.is_none());
    }

    // ==================== CLOSE & KILL ====================

    #[tokio::test]
    async fn close_flattens_reported_size() {
        let mut mock = MockExchange::new();
        mock.expect_position()
            .returning(|_| Ok(vec![position("PEPEUSDT", Side::Short, dec!(12000))]));
        mock.expect_place_market_order()
            .withf(|o| o.reduce_only && o.order_side() == "Buy" && o.qty == dec!(12000))
            .times(1)
            .returning(|_| Ok("close-1".to_string()));

        let closed = manager(mock).close(&Symbol::new("PEPEUSDT")).await.unwrap();
        assert_eq!(closed, 1);
    }

    #[tokio::test]
    async fn close_without_position_places_nothing() {
        let mut mock = MockExchange::new();
        mock.expect_position().returning(|_| Ok(vec![]));
        mock.expect_place_market_order().never();
        assert_eq!(manager(mock).close(&Symbol::new("XUSDT")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn kill_all_cancels_before_flattening() {
        let mut mock = MockExchange::new();
        let mut seq = Sequence::new();
        mock.expect_cancel_all_orders()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        mock.expect_positions()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| {
                Ok(vec![
                    position("SOLUSDT", Side::Long, dec!(1.5)),
                    position("ETHUSDT", Side::Short, dec!(0.02)),
                ])
            });
        mock.expect_place_market_order()
            .withf(|o| o.reduce_only)
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok("flat".to_string()));

        assert_eq!(manager(mock).kill_all().await.unwrap(), 2);
    }
}
