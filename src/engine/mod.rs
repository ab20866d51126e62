//! Orchestration loop
//!
//! One tick: daily P&L, breaker pause, daily limits, market refresh, position
//! reconciliation, closed-trade accounting, zombie reaping, then the entry
//! scan. Every exchange call happens outside the state lock; decisions are
//! taken inside one locked section and acted on afterwards.

mod state;

pub use state::{BotState, MarketView, SharedState};

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, BotConfig, ModeConfig, SelectorConfig, StrategyConfig};
use crate::control::Notifier;
use crate::exchange::{Exchange, ExchangeError};
use crate::execution::{EntryRequest, ExecutionManager};
use crate::mood::MoodSource;
use crate::persistence::{EntryContext, TradeJournal, TradeRecord};
use crate::risk::StreakOutcome;
use crate::selector::InstrumentSelector;
use crate::signal::{apply_htf_veto, SignalEngine};
use crate::types::{ClosedTrade, ExchangePosition, MarketSnapshot, Symbol, TradingMode, Trend};

const DAY_MS: i64 = 24 * 3_600_000;
/// Closed trades fetched for the daily P&L sum
const DAILY_PNL_LIMIT: usize = 50;
/// Closed trades inspected per tick
const RECENT_CLOSED_LIMIT: usize = 10;
/// Closed trades replayed into the ledger at startup
const REPLAY_LIMIT: usize = 50;

/// Wall clock in milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Configuration slices the engine needs
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bot: BotConfig,
    pub strategy: StrategyConfig,
    pub selector: SelectorConfig,
}

impl From<&AppConfig> for EngineConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            bot: cfg.bot.clone(),
            strategy: cfg.strategy.clone(),
            selector: cfg.selector.clone(),
        }
    }
}

/// What a tick ended in; drives the cadence of the next one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Circuit breaker pause active, nothing after the P&L refresh ran
    Paused,
    /// Global stop active, bookkeeping ran but no entries were attempted
    Halted,
    Scanned { entries: usize },
}

pub struct Orchestrator {
    state: Arc<SharedState>,
    exchange: Arc<dyn Exchange>,
    signal: SignalEngine,
    selector: InstrumentSelector,
    execution: Arc<ExecutionManager>,
    mood: Arc<dyn MoodSource>,
    notifier: Arc<dyn Notifier>,
    journal: Option<Arc<TradeJournal>>,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(
        state: Arc<SharedState>,
        exchange: Arc<dyn Exchange>,
        execution: Arc<ExecutionManager>,
        mood: Arc<dyn MoodSource>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        let signal = SignalEngine::new(
            exchange.clone(),
            Symbol::new(&config.strategy.reference_symbol),
            &config.strategy.trend_interval,
        );
        let selector = InstrumentSelector::new(exchange.clone(), &config.selector);
        Self {
            state,
            exchange,
            signal,
            selector,
            execution,
            mood,
            notifier,
            journal: None,
            config,
        }
    }

    pub fn with_journal(mut self, journal: Arc<TradeJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    // ==================== LIFECYCLE ====================

    /// Initial market view and a silent replay of recent closed trades
    pub async fn bootstrap(&self, now: i64) {
        self.refresh_market(now, true).await;
        let trend = self.signal.global_trend(now).await;
        self.state.with(|s| s.market.trend = trend);
        self.reconcile_positions(now).await;

        let trades = match self.exchange.closed_pnl(REPLAY_LIMIT, None).await {
            Ok(trades) => trades,
            Err(e) => {
                warn!(error = %e, "closed trade replay failed");
                return;
            }
        };

        let (replayed, blacklisted) = self.state.with_profile_persisted_if(|s| {
            let mut replayed = 0;
            let mut blacklisted = 0;
            let mut changed = false;
            for trade in &trades {
                if !s.processed.insert(trade.order_id.clone()) {
                    continue;
                }
                replayed += 1;
                s.ledger.record_outcome(trade.closed_pnl, trade.updated_at);
                if !s.active.contains(&trade.symbol) {
                    let outcome =
                        s.ledger
                            .record_exit(&trade.symbol, trade.closed_pnl, trade.updated_at);
                    if matches!(outcome, StreakOutcome::Blacklisted { .. }) {
                        blacklisted += 1;
                    }
                }
                changed |= s.ledger.apply_scaling(&mut s.profile).is_some();
            }
            ((replayed, blacklisted), changed)
        });

        let (wins, losses, risk) = self.state.with(|s| {
            (
                s.ledger.wins(),
                s.ledger.losses(),
                s.profile.risk_per_trade,
            )
        });
        info!(replayed, blacklisted, wins, losses, risk, "history replayed");
    }

    /// Run ticks until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(tag = %self.config.bot.tag, "🚀 Orchestration loop started");
        loop {
            let outcome = self.tick(now_ms()).await;
            let secs = match outcome {
                TickOutcome::Paused => self.config.bot.paused_tick_secs,
                TickOutcome::Halted => self.config.bot.halted_tick_secs,
                TickOutcome::Scanned { entries } => {
                    debug!(entries, "scan complete");
                    self.config.bot.tick_secs
                }
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!("Orchestration loop stopped");
    }

    /// One pass of the loop
    pub async fn tick(&self, now: i64) -> TickOutcome {
        self.refresh_daily_pnl(now).await;
        self.state
            .with_pardons_persisted_if(|s| ((), s.ledger.prune_expired(now)));

        // Breaker pause wins over everything else, including the daily limits
        if self.state.with(|s| s.profile.is_paused(now)) {
            return TickOutcome::Paused;
        }

        self.enforce_daily_limits().await;
        self.refresh_market(now, false).await;

        let trend = self.signal.global_trend(now).await;
        self.state.with(|s| s.market.trend = trend);

        let positions = self.reconcile_positions(now).await;
        self.process_closed_trades(now).await;
        if let Some(positions) = positions {
            self.reap_zombies(&positions, now).await;
        }

        if self.state.with(|s| s.profile.global_halt) {
            return TickOutcome::Halted;
        }
        let entries = self.scan(now).await;
        TickOutcome::Scanned { entries }
    }

    // ==================== BOOKKEEPING ====================

    async fn refresh_daily_pnl(&self, now: i64) {
        match self
            .exchange
            .closed_pnl(DAILY_PNL_LIMIT, Some(now - DAY_MS))
            .await
        {
            Ok(trades) => {
                let pnl: f64 = trades.iter().map(|t| t.closed_pnl).sum();
                self.state.with(|s| s.daily_pnl = pnl);
            }
            Err(e) => self.exchange_failure("daily P&L refresh", &e).await,
        }
    }

    /// Transient failures wait for the next tick; anything else halts trading
    async fn exchange_failure(&self, operation: &str, e: &ExchangeError) {
        if e.is_transient() {
            warn!(operation, error = %e, "exchange call failed, retrying next tick");
            return;
        }
        let newly_halted = self.state.with_profile_persisted_if(|s| {
            let newly = !s.profile.global_halt;
            s.profile.global_halt = true;
            (newly, newly)
        });
        error!(operation, error = %e, "exchange call failed, trading halted");
        if newly_halted {
            self.notifier
                .notify(&format!(
                    "🛑 *EXCHANGE ERROR* during {operation}: {e}. Trading halted, /resume once fixed."
                ))
                .await;
        }
    }

    async fn enforce_daily_limits(&self) {
        let breach = self.state.with_profile_persisted_if(|s| {
            if s.profile.global_halt {
                return (None, false);
            }
            match s.profile.daily_limit_breached(s.daily_pnl) {
                Some(limit) => {
                    s.profile.global_halt = true;
                    (Some((limit, s.daily_pnl)), true)
                }
                None => (None, false),
            }
        });

        if let Some((limit, pnl)) = breach {
            warn!(limit = %limit, daily_pnl = pnl, "daily limit reached, trading halted");
            self.notifier
                .notify(&format!("🛑 *{limit}* reached (`${pnl:.2}`). Trading halted."))
                .await;
        }
    }

    async fn refresh_market(&self, now: i64, force: bool) {
        let refresh_ms = self.config.strategy.market_refresh_secs * 1000;
        let (due, previous, max_funding) = self.state.with(|s| {
            let due = force
                || s
                    .market
                    .last_refresh
                    .map_or(true, |last| now - last >= refresh_ms);
            (due, s.market.universe.clone(), s.profile.max_funding_rate)
        });
        if !due {
            return;
        }

        let universe = self.selector.refresh(&previous, max_funding).await;
        let mood = match self.mood.fetch().await {
            Ok(mood) => Some(mood),
            Err(e) => {
                warn!(error = %e, "mood refresh failed, keeping previous reading");
                None
            }
        };

        self.state.with(|s| {
            s.market.universe = universe;
            if let Some(mood) = mood {
                s.market.mood = mood;
            }
            s.market.last_refresh = Some(now);
        });
    }

    /// Sync the active set with the exchange; `None` when positions are unknown
    async fn reconcile_positions(&self, now: i64) -> Option<Vec<ExchangePosition>> {
        let positions = match self.exchange.positions().await {
            Ok(p) => p,
            Err(e) => {
                self.exchange_failure("position sync", &e).await;
                return None;
            }
        };

        let live: BTreeSet<Symbol> = positions.iter().map(|p| p.symbol.clone()).collect();
        let dropped = self.state.with(|s| {
            let dropped: Vec<Symbol> = s.active.difference(&live).cloned().collect();
            for symbol in &dropped {
                s.ledger.start_cooldown(symbol, now);
                s.entry_times.remove(symbol);
            }
            s.active = live;
            dropped
        });
        for symbol in &dropped {
            info!(symbol = %symbol, "position gone, cooldown started");
        }
        Some(positions)
    }

    async fn process_closed_trades(&self, now: i64) {
        let trades = match self.exchange.closed_pnl(RECENT_CLOSED_LIMIT, None).await {
            Ok(trades) => trades,
            Err(e) => {
                self.exchange_failure("closed trade fetch", &e).await;
                return;
            }
        };

        let recent_ms = self.config.strategy.notify_recent_secs * 1000;
        let (notes, rows) = self.state.with_profile_persisted_if(|s| {
            let mut notes = Vec::new();
            let mut rows = Vec::new();
            let mut changed = false;

            // Trades older than the newest page never come back
            if !trades.is_empty() {
                s.processed
                    .retain(|id| trades.iter().any(|t| &t.order_id == id));
            }

            for trade in &trades {
                if !s.processed.insert(trade.order_id.clone()) {
                    continue;
                }
                if let Some(entry) = s.entries.remove(&trade.symbol) {
                    rows.push(TradeRecord::from_exit(
                        &trade.symbol,
                        &entry,
                        trade.avg_exit_price,
                        trade.closed_pnl,
                    ));
                }

                s.ledger.record_outcome(trade.closed_pnl, trade.updated_at);
                if let Some(risk) = s.ledger.apply_scaling(&mut s.profile) {
                    info!(risk, win_rate = s.ledger.win_rate(), "risk rescaled");
                    notes.push(format!(
                        "⚖️ Risk adjusted: `${risk}` (WinRate {:.1}%)",
                        s.ledger.win_rate()
                    ));
                    changed = true;
                }

                if now - trade.updated_at < recent_ms {
                    notes.push(outcome_note(trade));
                }
                info!(
                    symbol = %trade.symbol,
                    pnl = trade.closed_pnl,
                    order_id = %trade.order_id,
                    "trade closed"
                );

                if !s.active.contains(&trade.symbol) {
                    match s.ledger.record_exit(&trade.symbol, trade.closed_pnl, now) {
                        StreakOutcome::Blacklisted { streak, .. } => {
                            warn!(symbol = %trade.symbol, streak, "instrument blacklisted");
                            notes.push(format!(
                                "☠️ *{}* blacklisted for 24h ({streak} losses in a row)",
                                trade.symbol
                            ));
                        }
                        StreakOutcome::Shielded(streak) => {
                            info!(symbol = %trade.symbol, streak, "blacklist shielded by pardon");
                            notes.push(format!(
                                "🛡️ *{}* lost {streak} in a row, pardon keeps it tradable",
                                trade.symbol
                            ));
                        }
                        StreakOutcome::Reset | StreakOutcome::Recorded(_) => {}
                    }
                }

                if !trade.is_win() && s.ledger.evaluate_breaker(&mut s.profile, now) {
                    let minutes = s.profile.pause_minutes_left(now);
                    warn!(resume_at = s.profile.pause_until, "circuit breaker tripped");
                    notes.push(format!(
                        "⛔ *CIRCUIT BREAKER*: loss velocity too high, pausing {minutes}m"
                    ));
                    changed = true;
                }
            }
            ((notes, rows), changed)
        });

        if let Some(journal) = &self.journal {
            for row in &rows {
                if let Err(e) = journal.append(row).await {
                    error!(symbol = %row.symbol, error = %e, "journal write failed");
                }
            }
        }
        for note in notes {
            self.notifier.notify(&note).await;
        }
    }

    /// Close stale flat scalp positions, sparing fresh entries of this process
    async fn reap_zombies(&self, positions: &[ExchangePosition], now: i64) {
        let grace_ms = self.config.strategy.zombie_grace_minutes * 60_000;
        let min_pnl = self.config.strategy.zombie_min_pnl;

        let zombies: Vec<ExchangePosition> = self.state.with(|s| {
            let stale_ms = s.profile.stale_after_ms();
            positions
                .iter()
                .filter(|p| s.market.universe.is_scalp(&p.symbol))
                .filter(|p| {
                    s.entry_times
                        .get(&p.symbol)
                        .map_or(true, |&entered| now - entered >= grace_ms)
                })
                .filter(|p| now - p.created_at > stale_ms && p.unrealised_pnl < min_pnl)
                .cloned()
                .collect()
        });

        for zombie in zombies {
            let hours = (now - zombie.created_at) as f64 / 3_600_000.0;
            warn!(symbol = %zombie.symbol, hours, pnl = zombie.unrealised_pnl, "reaping zombie position");
            match self.execution.close(&zombie.symbol).await {
                Ok(_) => {
                    self.notifier
                        .notify(&format!(
                            "🧟 Zombie closed: *{}* after {hours:.1}h (PnL `${:.2}`)",
                            zombie.symbol, zombie.unrealised_pnl
                        ))
                        .await
                }
                Err(e) => error!(symbol = %zombie.symbol, error = %e, "zombie close failed"),
            }
        }
    }

    // ==================== ENTRY SCAN ====================

    async fn scan(&self, now: i64) -> usize {
        let (universe, trend) = self
            .state
            .with(|s| (s.market.universe.clone(), s.market.trend));
        let strategy = &self.config.strategy;

        let mut heatmap = Vec::new();
        let mut entries = 0;
        'modes: for (mode, symbols, mode_config) in [
            (TradingMode::Scalp, &universe.scalp, &strategy.scalp),
            (TradingMode::Swing, &universe.swing, &strategy.swing),
        ] {
            for symbol in symbols {
                // The operator may stop trading mid-scan
                let (stopped, block, adx_threshold) = self.state.with(|s| {
                    (
                        s.profile.global_halt || s.profile.is_paused(now),
                        s.entry_block(symbol, now),
                        s.profile.adx_threshold,
                    )
                });
                if stopped {
                    break 'modes;
                }
                if let Some(reason) = block {
                    debug!(symbol = %symbol, reason, "skipped");
                    continue;
                }

                let Some(mut snapshot) = self
                    .signal
                    .evaluate(symbol, mode, mode_config, trend, adx_threshold, now)
                    .await
                else {
                    continue;
                };

                let mut htf = None;
                if mode_config.htf_veto && snapshot.signal.side().is_some() {
                    let t = self.signal.higher_timeframe_trend(symbol, now).await;
                    let vetoed = apply_htf_veto(snapshot.signal, t);
                    if vetoed != snapshot.signal {
                        debug!(symbol = %symbol, signal = %snapshot.signal, htf = %t, "vetoed by higher timeframe");
                    }
                    snapshot.signal = vetoed;
                    htf = Some(t);
                }

                if snapshot.signal.side().is_some() && self.enter(&snapshot, mode_config, htf, now).await {
                    entries += 1;
                }
                heatmap.push(snapshot);
            }
        }

        self.state.with(|s| s.market.heatmap = heatmap);
        entries
    }

    async fn enter(
        &self,
        snapshot: &MarketSnapshot,
        mode_config: &ModeConfig,
        htf: Option<Trend>,
        now: i64,
    ) -> bool {
        let Some(side) = snapshot.signal.side() else {
            return false;
        };
        let (profile, sentiment) = self
            .state
            .with(|s| (s.profile.clone(), s.market.mood.sentiment_multiplier()));
        let b = &snapshot.indicators;

        let request = EntryRequest {
            symbol: &snapshot.symbol,
            side,
            price: b.price,
            atr: b.atr,
            mode_config,
            size_multiplier: snapshot.volume_multiplier,
            risk_per_trade: profile.risk_per_trade,
            leverage: profile.leverage,
            sentiment_multiplier: sentiment,
        };
        let Some(fill) = self.execution.open(&request).await else {
            return false;
        };

        let context = EntryContext {
            entered_at: now,
            mode: snapshot.mode,
            side,
            rsi: b.rsi,
            adx: b.adx,
            atr: b.atr,
            trend: EntryContext::trend_label(snapshot.mode, htf),
            entry_price: b.price,
        };
        self.state.with(|s| {
            s.active.insert(snapshot.symbol.clone());
            s.entry_times.insert(snapshot.symbol.clone(), now);
            s.entries.insert(snapshot.symbol.clone(), context);
        });

        let shield = if fill.protected { "🛡️" } else { "⚠️ unprotected" };
        self.notifier
            .notify(&format!(
                "🚀 *{side} {}* ({}) qty `{}` @ `{}` {shield}",
                snapshot.symbol, snapshot.mode, fill.qty, b.price
            ))
            .await;
        true
    }
}

fn outcome_note(trade: &ClosedTrade) -> String {
    if trade.is_win() {
        format!("💰 *WIN* {}: `${:.2}`", trade.symbol, trade.closed_pnl)
    } else {
        format!("💀 *LOSS* {}: `${:.2}`", trade.symbol, trade.closed_pnl)
    }
}
