//! Persisted process-wide risk settings

use serde::{Deserialize, Serialize};

use crate::config::RiskConfig;

/// Hard ceiling for adaptive risk scaling (USDT per trade)
pub const RISK_CEILING: f64 = 10.0;
/// Hard floor for adaptive risk scaling (USDT per trade)
pub const RISK_FLOOR: f64 = 1.0;

/// Operator-tunable risk profile, rewritten to disk after every mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskProfile {
    /// Global stop: no new entries while set
    pub global_halt: bool,
    pub risk_per_trade: f64,
    pub max_open_positions: usize,
    pub leverage: u32,
    pub adx_threshold: f64,
    /// Daily realised P&L floor (zero or negative)
    pub daily_loss_limit: f64,
    pub daily_profit_goal: f64,
    pub max_funding_rate: f64,
    pub stale_position_hours: f64,
    pub auto_scale: bool,
    /// Circuit breaker resume time in milliseconds (0 = not paused)
    pub pause_until: i64,
}

impl From<&RiskConfig> for RiskProfile {
    fn from(cfg: &RiskConfig) -> Self {
        Self {
            // A fresh install waits for /resume
            global_halt: cfg.start_halted.unwrap_or(true),
            risk_per_trade: cfg.risk_per_trade,
            max_open_positions: cfg.max_open_positions,
            leverage: cfg.leverage,
            adx_threshold: cfg.adx_threshold,
            daily_loss_limit: cfg.daily_loss_limit,
            daily_profit_goal: cfg.daily_profit_goal,
            max_funding_rate: cfg.max_funding_rate,
            stale_position_hours: cfg.stale_position_hours,
            auto_scale: cfg.auto_scale,
            pause_until: 0,
        }
    }
}

impl RiskProfile {
    pub fn is_paused(&self, now: i64) -> bool {
        self.pause_until > now
    }

    /// Whole minutes until the breaker pause ends
    pub fn pause_minutes_left(&self, now: i64) -> i64 {
        ((self.pause_until - now) / 60_000).max(0)
    }

    /// Loss limits are stored negative whatever sign the operator typed
    pub fn set_daily_loss_limit(&mut self, value: f64) {
        self.daily_loss_limit = -value.abs();
    }

    /// Apply an explicit startup halt flag; without one the persisted flag stands
    pub fn with_startup_halt(mut self, start_halted: Option<bool>) -> Self {
        if let Some(halted) = start_halted {
            self.global_halt = halted;
        }
        self
    }

    /// Clear the global stop and any breaker pause
    pub fn resume(&mut self) {
        self.global_halt = false;
        self.pause_until = 0;
    }

    /// True when daily P&L sits at or beyond either daily boundary
    pub fn daily_limit_breached(&self, daily_pnl: f64) -> Option<DailyLimit> {
        if daily_pnl <= self.daily_loss_limit {
            Some(DailyLimit::LossFloor)
        } else if daily_pnl >= self.daily_profit_goal {
            Some(DailyLimit::ProfitGoal)
        } else {
            None
        }
    }

    /// Stale threshold in milliseconds
    pub fn stale_after_ms(&self) -> i64 {
        (self.stale_position_hours * 3_600_000.0) as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DailyLimit {
    LossFloor,
    ProfitGoal,
}

impl std::fmt::Display for DailyLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DailyLimit::LossFloor => write!(f, "DAILY_LOSS_LIMIT"),
            DailyLimit::ProfitGoal => write!(f, "DAILY_PROFIT_GOAL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> RiskProfile {
        RiskProfile {
            global_halt: false,
            risk_per_trade: 4.0,
            max_open_positions: 5,
            leverage: 5,
            adx_threshold: 25.0,
            daily_loss_limit: -7.0,
            daily_profit_goal: 15.0,
            max_funding_rate: 0.001,
            stale_position_hours: 4.0,
            auto_scale: true,
            pause_until: 0,
        }
    }

    #[test]
    fn loss_limit_is_always_negative() {
        let mut p = profile();
        p.set_daily_loss_limit(10.0);
        assert_eq!(p.daily_loss_limit, -10.0);
        p.set_daily_loss_limit(-3.0);
        assert_eq!(p.daily_loss_limit, -3.0);
    }

    #[test]
    fn persisted_halt_survives_restart_without_override() {
        let live = profile();
        assert!(!live.clone().with_startup_halt(None).global_halt);
        assert!(live.clone().with_startup_halt(Some(true)).global_halt);

        let halted = RiskProfile {
            global_halt: true,
            ..profile()
        };
        assert!(halted.clone().with_startup_halt(None).global_halt);
        assert!(!halted.with_startup_halt(Some(false)).global_halt);
    }

    #[test]
    fn daily_boundaries_are_inclusive() {
        let p = profile();
        assert_eq!(p.daily_limit_breached(-7.0), Some(DailyLimit::LossFloor));
        assert_eq!(p.daily_limit_breached(15.0), Some(DailyLimit::ProfitGoal));
        assert_eq!(p.daily_limit_breached(-6.99), None);
        assert_eq!(p.daily_limit_breached(0.0), None);
    }

    #[test]
    fn resume_clears_halt_and_pause() {
        let mut p = profile();
        p.global_halt = true;
        p.pause_until = 10_000_000;
        assert!(p.is_paused(0));
        assert_eq!(p.pause_minutes_left(0), 166);
        p.resume();
        assert!(!p.global_halt);
        assert!(!p.is_paused(0));
    }
}
