//! Persistence Module
//!
//! - `SettingsStore`: risk profile JSON, merged over defaults at load
//! - `PardonStore`: operator pardons JSON, pruned of expired grants at load
//! - `TradeJournal`: append-only CSV audit trail, one row per closed trade
//!
//! JSON documents are written to a temp file and renamed into place so a crash
//! mid-write never leaves a truncated file behind.

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use csv::WriterBuilder;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{info, warn};

use crate::risk::{RiskProfile, PARDON_MS};
use crate::types::{Side, Symbol, TradingMode, Trend};

/// Serialize `value` as pretty JSON via temp file + rename
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let json =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let value =
        serde_json::from_str(&json).with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(value))
}

// ==================== SETTINGS ====================

/// Persisted risk profile
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Stored fields override `defaults`; unknown keys are ignored and
    /// missing keys keep their default
    pub fn load(&self, defaults: &RiskProfile) -> Result<RiskProfile> {
        let Some(stored) = read_json::<serde_json::Value>(&self.path)? else {
            info!(path = %self.path.display(), "No settings file found, using defaults");
            return Ok(defaults.clone());
        };

        let mut merged = serde_json::to_value(defaults)?;
        if let (Some(base), Some(overrides)) = (merged.as_object_mut(), stored.as_object()) {
            for (key, value) in overrides {
                if base.contains_key(key) {
                    base.insert(key.clone(), value.clone());
                }
            }
        }

        let profile: RiskProfile =
            serde_json::from_value(merged).context("Stored settings have invalid values")?;
        info!(
            path = %self.path.display(),
            halted = profile.global_halt,
            risk = profile.risk_per_trade,
            "Settings loaded"
        );
        Ok(profile)
    }

    pub fn save(&self, profile: &RiskProfile) -> Result<()> {
        write_json_atomic(&self.path, profile)
    }
}

// ==================== PARDONS ====================

/// Persisted operator pardons (symbol -> grant time in ms)
#[derive(Debug, Clone)]
pub struct PardonStore {
    path: PathBuf,
}

impl PardonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Pardons granted less than 24h before `now`
    pub fn load(&self, now: i64) -> Result<HashMap<Symbol, i64>> {
        let stored: HashMap<Symbol, i64> = read_json(&self.path)?.unwrap_or_default();
        let total = stored.len();
        let active: HashMap<Symbol, i64> = stored
            .into_iter()
            .filter(|(_, granted)| now - granted < PARDON_MS)
            .collect();
        if active.len() < total {
            info!(pruned = total - active.len(), "Expired pardons dropped");
        }
        Ok(active)
    }

    pub fn save(&self, pardons: &HashMap<Symbol, i64>) -> Result<()> {
        write_json_atomic(&self.path, pardons)
    }
}

// ==================== TRADE JOURNAL ====================

/// Market context captured when a position is opened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryContext {
    /// Entry time in milliseconds
    pub entered_at: i64,
    pub mode: TradingMode,
    pub side: Side,
    pub rsi: f64,
    pub adx: f64,
    pub atr: f64,
    /// Higher-timeframe trend for scalp entries, mode name for swing entries
    pub trend: String,
    pub entry_price: f64,
}

impl EntryContext {
    pub fn trend_label(mode: TradingMode, htf: Option<Trend>) -> String {
        match (mode, htf) {
            (TradingMode::Scalp, Some(t)) => t.to_string(),
            _ => mode.to_string(),
        }
    }
}

/// One row of the trade journal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    #[serde(rename = "Time")]
    pub time: String,
    #[serde(rename = "Symbol")]
    pub symbol: String,
    #[serde(rename = "Mode")]
    pub mode: String,
    #[serde(rename = "Side")]
    pub side: String,
    #[serde(rename = "RSI")]
    pub rsi: f64,
    #[serde(rename = "ADX")]
    pub adx: f64,
    #[serde(rename = "ATR")]
    pub atr: f64,
    #[serde(rename = "Trend")]
    pub trend: String,
    #[serde(rename = "EntryPrice")]
    pub entry_price: f64,
    #[serde(rename = "ExitPrice")]
    pub exit_price: f64,
    #[serde(rename = "PnL")]
    pub pnl: f64,
    /// 1 = win, 0 = loss
    #[serde(rename = "Result")]
    pub result: u8,
}

impl TradeRecord {
    pub fn from_exit(symbol: &Symbol, entry: &EntryContext, exit_price: f64, pnl: f64) -> Self {
        Self {
            time: format_ts(entry.entered_at),
            symbol: symbol.to_string(),
            mode: entry.mode.to_string(),
            side: entry.side.order_side().to_string(),
            rsi: entry.rsi,
            adx: entry.adx,
            atr: entry.atr,
            trend: entry.trend.clone(),
            entry_price: entry.entry_price,
            exit_price,
            pnl,
            result: u8::from(pnl > 0.0),
        }
    }
}

fn format_ts(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

/// Append-only CSV of closed trades
pub struct TradeJournal {
    writer: AsyncRwLock<csv::Writer<std::fs::File>>,
}

impl TradeJournal {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).context("Failed to create data directory")?;
            }
        }
        let writer = Self::create_writer(&path)?;
        Ok(Self {
            writer: AsyncRwLock::new(writer),
        })
    }

    fn create_writer(path: &Path) -> Result<csv::Writer<std::fs::File>> {
        let file_has_data =
            path.exists() && fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .context("Failed to open CSV file")?;

        Ok(WriterBuilder::new()
            .has_headers(!file_has_data)
            .from_writer(file))
    }

    pub async fn append(&self, record: &TradeRecord) -> Result<()> {
        let mut writer = self.writer.write().await;
        writer
            .serialize(record)
            .context("Failed to write trade record")?;
        writer.flush().context("Failed to flush trade writer")?;
        Ok(())
    }
}

/// Load settings, falling back to defaults on a corrupt file
pub fn load_settings_or_default(store: &SettingsStore, defaults: &RiskProfile) -> RiskProfile {
    store.load(defaults).unwrap_or_else(|e| {
        warn!(error = %e, "Settings file unusable, using defaults");
        defaults.clone()
    })
}
