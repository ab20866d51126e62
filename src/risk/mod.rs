//! Risk & Memory Ledger
//!
//! Implements:
//! - Win/loss counters and win-rate driven risk scaling
//! - Per-instrument loss streaks with a 24h blacklist
//! - Operator pardons that shield an instrument from the blacklist
//! - Post-exit cooldowns
//! - Loss-velocity circuit breaker

mod breaker;
mod profile;

pub use breaker::CircuitBreaker;
pub use profile::{DailyLimit, RiskProfile, RISK_CEILING, RISK_FLOOR};

use std::collections::HashMap;

use crate::types::Symbol;

pub const BLACKLIST_MS: i64 = 24 * 3_600_000;
pub const PARDON_MS: i64 = 24 * 3_600_000;
/// Consecutive losses that blacklist an instrument
pub const LOSS_STREAK_LIMIT: u32 = 2;
/// Outcomes needed before the win rate drives scaling
pub const MIN_OUTCOMES_FOR_SCALING: usize = 5;

const SCALE_UP_WIN_RATE: f64 = 60.0;
const SCALE_DOWN_WIN_RATE: f64 = 40.0;
const SCALE_UP: f64 = 1.1;
const SCALE_DOWN: f64 = 0.9;

/// What an exit did to an instrument's streak
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreakOutcome {
    /// Winning exit, streak reset
    Reset,
    /// Loss recorded, below the blacklist limit
    Recorded(u32),
    /// Loss pushed the instrument into the blacklist until the given time
    Blacklisted { streak: u32, until: i64 },
    /// Loss would have blacklisted, but an active pardon shields it
    Shielded(u32),
}

#[derive(Debug, Clone)]
pub struct Ledger {
    wins: usize,
    losses: usize,
    /// Outcome count at the last scaling decision
    scaled_at: usize,
    loss_streak: HashMap<Symbol, u32>,
    /// Symbol -> blacklist expiry
    blacklist: HashMap<Symbol, i64>,
    /// Symbol -> pardon grant time
    pardons: HashMap<Symbol, i64>,
    /// Symbol -> last exit time
    cooldowns: HashMap<Symbol, i64>,
    cooldown_ms: i64,
    breaker: CircuitBreaker,
}

impl Ledger {
    pub fn new(cooldown_ms: i64) -> Self {
        Self::with_breaker(cooldown_ms, CircuitBreaker::default())
    }

    pub fn with_breaker(cooldown_ms: i64, breaker: CircuitBreaker) -> Self {
        Self {
            wins: 0,
            losses: 0,
            scaled_at: 0,
            loss_streak: HashMap::new(),
            blacklist: HashMap::new(),
            pardons: HashMap::new(),
            cooldowns: HashMap::new(),
            cooldown_ms,
            breaker,
        }
    }

    // ==================== OUTCOMES & SCALING ====================

    /// Count a realised outcome; losses also feed the breaker window
    pub fn record_outcome(&mut self, pnl: f64, ts: i64) {
        if pnl > 0.0 {
            self.wins += 1;
        } else {
            self.losses += 1;
            self.breaker.record_loss(ts);
        }
    }

    pub fn outcomes(&self) -> usize {
        self.wins + self.losses
    }

    pub fn wins(&self) -> usize {
        self.wins
    }

    pub fn losses(&self) -> usize {
        self.losses
    }

    /// Win rate in percent; zero until enough outcomes accumulate
    pub fn win_rate(&self) -> f64 {
        let total = self.outcomes();
        if total < MIN_OUTCOMES_FOR_SCALING {
            return 0.0;
        }
        self.wins as f64 / total as f64 * 100.0
    }

    /// Adjust `risk_per_trade` from the win rate
    ///
    /// Only acts once per new outcome; returns the new risk when it changed.
    pub fn apply_scaling(&mut self, profile: &mut RiskProfile) -> Option<f64> {
        let total = self.outcomes();
        if total < MIN_OUTCOMES_FOR_SCALING || total == self.scaled_at {
            return None;
        }
        self.scaled_at = total;
        if !profile.auto_scale {
            return None;
        }

        let rate = self.win_rate();
        let current = profile.risk_per_trade;
        let target = if rate > SCALE_UP_WIN_RATE {
            (current * SCALE_UP).min(RISK_CEILING)
        } else if rate < SCALE_DOWN_WIN_RATE {
            (current * SCALE_DOWN).max(RISK_FLOOR)
        } else {
            return None;
        };
        let target = (target * 100.0).round() / 100.0;

        if (target - current).abs() < f64::EPSILON {
            return None;
        }
        profile.risk_per_trade = target;
        Some(target)
    }

    // ==================== STREAKS, BLACKLIST, PARDONS ====================

    /// Update the instrument's streak after an exit
    pub fn record_exit(&mut self, symbol: &Symbol, pnl: f64, now: i64) -> StreakOutcome {
        if pnl >= 0.0 {
            self.loss_streak.insert(symbol.clone(), 0);
            return StreakOutcome::Reset;
        }

        let streak = self.loss_streak.entry(symbol.clone()).or_insert(0);
        *streak += 1;
        let streak = *streak;

        if streak < LOSS_STREAK_LIMIT {
            StreakOutcome::Recorded(streak)
        } else if self.is_pardoned(symbol, now) {
            StreakOutcome::Shielded(streak)
        } else {
            let until = now + BLACKLIST_MS;
            self.blacklist.insert(symbol.clone(), until);
            StreakOutcome::Blacklisted { streak, until }
        }
    }

    pub fn loss_streak(&self, symbol: &Symbol) -> u32 {
        self.loss_streak.get(symbol).copied().unwrap_or(0)
    }

    pub fn is_pardoned(&self, symbol: &Symbol, now: i64) -> bool {
        self.pardons
            .get(symbol)
            .is_some_and(|&granted| now - granted < PARDON_MS)
    }

    pub fn blacklist_expiry(&self, symbol: &Symbol) -> Option<i64> {
        self.blacklist.get(symbol).copied()
    }

    /// Blacklisted, unexpired and not shielded by a pardon
    pub fn is_blocked(&self, symbol: &Symbol, now: i64) -> bool {
        self.blacklist
            .get(symbol)
            .is_some_and(|&until| now < until)
            && !self.is_pardoned(symbol, now)
    }

    /// Unexpired blacklist entries, soonest expiry first
    pub fn blacklisted(&self, now: i64) -> Vec<(Symbol, i64)> {
        let mut entries: Vec<(Symbol, i64)> = self
            .blacklist
            .iter()
            .filter(|(_, &until)| now < until)
            .map(|(s, &until)| (s.clone(), until))
            .collect();
        entries.sort_by_key(|(_, until)| *until);
        entries
    }

    /// Find a blacklisted symbol by operator fragment
    pub fn find_blacklisted(&self, fragment: &str) -> Option<Symbol> {
        let mut matches: Vec<&Symbol> = self
            .blacklist
            .keys()
            .filter(|s| s.matches_fragment(fragment))
            .collect();
        matches.sort();
        matches.first().map(|s| (*s).clone())
    }

    /// Operator unban: clear blacklist and streak, shield for 24h
    pub fn pardon(&mut self, symbol: &Symbol, now: i64) {
        self.blacklist.remove(symbol);
        self.loss_streak.insert(symbol.clone(), 0);
        self.pardons.insert(symbol.clone(), now);
    }

    /// Seed pardons loaded from disk
    pub fn restore_pardons(&mut self, pardons: HashMap<Symbol, i64>) {
        self.pardons.extend(pardons);
    }

    pub fn pardons(&self) -> &HashMap<Symbol, i64> {
        &self.pardons
    }

    // ==================== COOLDOWNS ====================

    pub fn start_cooldown(&mut self, symbol: &Symbol, now: i64) {
        self.cooldowns.insert(symbol.clone(), now);
    }

    pub fn in_cooldown(&self, symbol: &Symbol, now: i64) -> bool {
        self.cooldowns
            .get(symbol)
            .is_some_and(|&exit| now - exit < self.cooldown_ms)
    }

    // ==================== HOUSEKEEPING ====================

    /// Forget expired blacklist entries, cooldowns and pardons
    ///
    /// Returns true when a pardon was dropped, so the pardon file is stale.
    pub fn prune_expired(&mut self, now: i64) -> bool {
        self.blacklist.retain(|_, until| now < *until);
        let cooldown_ms = self.cooldown_ms;
        self.cooldowns.retain(|_, exit| now - *exit < cooldown_ms);
        let pardons = self.pardons.len();
        self.pardons.retain(|_, granted| now - *granted < PARDON_MS);
        self.pardons.len() != pardons
    }

    // ==================== CIRCUIT BREAKER ====================

    /// Evaluate the breaker; on trip stores the resume time in the profile
    pub fn evaluate_breaker(&mut self, profile: &mut RiskProfile, now: i64) -> bool {
        match self.breaker.evaluate(now) {
            Some(until) => {
                profile.pause_until = until;
                true
            }
            None => false,
        }
    }
}
