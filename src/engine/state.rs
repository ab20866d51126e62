//! Process-wide mutable state shared by the orchestration and command loops
//!
//! Everything lives in one [`BotState`] behind a `std::sync::Mutex`. Every
//! read-modify-write is a single closure passed to [`SharedState::with`]; the
//! lock is never held across an `.await`. Mutations of the risk profile and
//! of the pardon table are persisted before the lock is released.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use tracing::error;

use crate::mood::MoodIndex;
use crate::persistence::{EntryContext, PardonStore, SettingsStore};
use crate::risk::{Ledger, RiskProfile};
use crate::selector::Universe;
use crate::types::{MarketSnapshot, Symbol, Trend};

/// Latest view of the market, refreshed by the orchestration loop
#[derive(Debug, Clone, Default)]
pub struct MarketView {
    pub universe: Universe,
    pub trend: Trend,
    pub mood: MoodIndex,
    /// Snapshots from the last completed scan, scalp first
    pub heatmap: Vec<MarketSnapshot>,
    /// Last universe / mood refresh in milliseconds
    pub last_refresh: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct BotState {
    pub profile: RiskProfile,
    pub ledger: Ledger,
    pub market: MarketView,
    /// Realised P&L over the trailing 24h
    pub daily_pnl: f64,
    /// Symbols with a non-zero exchange position
    pub active: BTreeSet<Symbol>,
    /// Entries made by this process (symbol -> entry time)
    pub entry_times: HashMap<Symbol, i64>,
    /// Closed-trade order ids already reconciled, limited to the latest
    /// closed-trade page
    pub processed: HashSet<String>,
    /// Entry context awaiting its exit row in the journal
    pub entries: HashMap<Symbol, EntryContext>,
}

impl BotState {
    pub fn new(profile: RiskProfile, ledger: Ledger) -> Self {
        Self {
            profile,
            ledger,
            market: MarketView::default(),
            daily_pnl: 0.0,
            active: BTreeSet::new(),
            entry_times: HashMap::new(),
            processed: HashSet::new(),
            entries: HashMap::new(),
        }
    }

    /// Reason an instrument cannot be entered right now
    pub fn entry_block(&self, symbol: &Symbol, now: i64) -> Option<&'static str> {
        if self.active.contains(symbol) {
            Some("open")
        } else if self.ledger.is_blocked(symbol, now) {
            Some("blacklisted")
        } else if self.ledger.in_cooldown(symbol, now) {
            Some("cooldown")
        } else if self.active.len() >= self.profile.max_open_positions {
            Some("position cap")
        } else {
            None
        }
    }

    /// Active symbol matching an operator fragment
    pub fn find_active(&self, fragment: &str) -> Option<Symbol> {
        self.active
            .iter()
            .find(|s| s.matches_fragment(fragment))
            .cloned()
    }
}

pub struct SharedState {
    inner: Mutex<BotState>,
    settings: Option<SettingsStore>,
    pardons: Option<PardonStore>,
}

impl SharedState {
    pub fn new(state: BotState, settings: SettingsStore, pardons: PardonStore) -> Self {
        Self {
            inner: Mutex::new(state),
            settings: Some(settings),
            pardons: Some(pardons),
        }
    }

    /// State that is never written to disk
    pub fn in_memory(state: BotState) -> Self {
        Self {
            inner: Mutex::new(state),
            settings: None,
            pardons: None,
        }
    }

    /// Run `f` under the lock
    pub fn with<R>(&self, f: impl FnOnce(&mut BotState) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Run `f` under the lock, then persist the risk profile
    pub fn with_profile_persisted<R>(&self, f: impl FnOnce(&mut BotState) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let out = f(&mut guard);
        self.persist_profile(&guard.profile);
        out
    }

    /// Like [`Self::with_profile_persisted`], but only writes when `f` reports a change
    pub fn with_profile_persisted_if<R>(&self, f: impl FnOnce(&mut BotState) -> (R, bool)) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let (out, changed) = f(&mut guard);
        if changed {
            self.persist_profile(&guard.profile);
        }
        out
    }

    /// Run `f` under the lock, then persist the pardon table
    pub fn with_pardons_persisted<R>(&self, f: impl FnOnce(&mut BotState) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let out = f(&mut guard);
        self.persist_pardons(&guard.ledger);
        out
    }

    /// Like [`Self::with_pardons_persisted`], but only writes when `f` reports a change
    pub fn with_pardons_persisted_if<R>(&self, f: impl FnOnce(&mut BotState) -> (R, bool)) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let (out, changed) = f(&mut guard);
        if changed {
            self.persist_pardons(&guard.ledger);
        }
        out
    }

    pub fn profile(&self) -> RiskProfile {
        self.with(|s| s.profile.clone())
    }

    fn persist_pardons(&self, ledger: &Ledger) {
        if let Some(store) = &self.pardons {
            if let Err(e) = store.save(ledger.pardons()) {
                error!(error = %e, "Failed to persist pardons");
            }
        }
    }

    fn persist_profile(&self, profile: &RiskProfile) {
        if let Some(store) = &self.settings {
            if let Err(e) = store.save(profile) {
                error!(error = %e, "Failed to persist settings");
            }
        }
    }
}
