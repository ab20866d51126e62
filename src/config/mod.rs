//! Configuration management for PerpBot
//!
//! Loads from optional config files + environment variables via .env

mod types;

pub use types::*;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub exchange: ExchangeConfig,
    pub strategy: StrategyConfig,
    pub risk: RiskConfig,
    pub selector: SelectorConfig,
    pub persistence: PersistenceConfig,
    pub telegram: TelegramConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Bot version tag for logging and status
    pub tag: String,
    /// Tick cadence while scanning
    pub tick_secs: u64,
    /// Tick cadence while globally halted
    pub halted_tick_secs: u64,
    /// Tick cadence while the circuit breaker pause is active
    pub paused_tick_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    /// REST endpoint
    pub base_url: String,
    /// Signed request receive window in milliseconds
    pub recv_window_ms: u64,
    /// Timeout for every REST call in milliseconds
    pub request_timeout_ms: u64,
    /// Wait after a confirmed fill before placing protection
    pub protection_delay_ms: u64,
    /// Wait between the stop-loss and the trailing-stop request
    pub protection_leg_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    pub scalp: ModeConfig,
    pub swing: ModeConfig,
    /// Instrument whose trend gates every entry
    pub reference_symbol: String,
    /// Interval used for the global and higher-timeframe trend checks
    pub trend_interval: String,
    /// Minimum time between an exit and the next entry on the same instrument
    pub cooldown_minutes: i64,
    /// Entries younger than this are never reaped as zombies
    pub zombie_grace_minutes: i64,
    /// Unrealised P&L below which a stale scalp position is reaped
    pub zombie_min_pnl: f64,
    /// Universe and mood refresh cadence
    pub market_refresh_secs: i64,
    /// Closed trades older than this are processed silently
    pub notify_recent_secs: i64,
}

/// Startup defaults for the persisted risk profile
#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Overrides the persisted halt flag at startup when given
    /// (`PERPBOT__RISK__START_HALTED`)
    #[serde(default)]
    pub start_halted: Option<bool>,
    /// Risk amount per trade in USDT
    pub risk_per_trade: f64,
    /// Maximum concurrent positions
    pub max_open_positions: usize,
    /// Leverage applied to every entry
    pub leverage: u32,
    /// ADX activation threshold
    pub adx_threshold: f64,
    /// Daily realised P&L floor (negative)
    pub daily_loss_limit: f64,
    /// Daily realised P&L ceiling
    pub daily_profit_goal: f64,
    /// Maximum tolerated absolute funding rate
    pub max_funding_rate: f64,
    /// Age after which a flat scalp position counts as stale
    pub stale_position_hours: f64,
    /// Win-rate driven risk scaling
    pub auto_scale: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectorConfig {
    /// Number of most liquid instruments kept before the volatility split
    pub top_liquidity: usize,
    pub fallback_scalp: String,
    pub fallback_swing: String,
    /// Fear & Greed index endpoint
    pub mood_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Data directory
    pub data_dir: String,
    pub settings_file: String,
    pub pardon_file: String,
    pub journal_file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    /// Use Telegram as control surface (falls back to log-only notifications)
    pub enabled: bool,
    pub api_url: String,
    /// Long-poll timeout passed to getUpdates
    pub poll_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Emit JSON log lines
    pub json: bool,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let scalp = ModeConfig::scalp_default();
        let swing = ModeConfig::swing_default();

        let config = Config::builder()
            .set_default("bot.tag", env!("CARGO_PKG_VERSION"))?
            .set_default("bot.tick_secs", 60)?
            .set_default("bot.halted_tick_secs", 5)?
            .set_default("bot.paused_tick_secs", 30)?
            // Exchange defaults
            .set_default("exchange.base_url", "https://api.bybit.com")?
            .set_default("exchange.recv_window_ms", 5000)?
            .set_default("exchange.request_timeout_ms", 5000)?
            .set_default("exchange.protection_delay_ms", 2000)?
            .set_default("exchange.protection_leg_delay_ms", 200)?
            // Strategy defaults
            .set_default("strategy.scalp.interval", scalp.interval)?
            .set_default("strategy.scalp.sl_atr", scalp.sl_atr)?
            .set_default("strategy.scalp.trail_activation_atr", scalp.trail_activation_atr)?
            .set_default("strategy.scalp.trail_callback_atr", scalp.trail_callback_atr)?
            .set_default("strategy.scalp.volume_boost", scalp.volume_boost)?
            .set_default("strategy.scalp.htf_veto", scalp.htf_veto)?
            .set_default("strategy.swing.interval", swing.interval)?
            .set_default("strategy.swing.sl_atr", swing.sl_atr)?
            .set_default("strategy.swing.trail_activation_atr", swing.trail_activation_atr)?
            .set_default("strategy.swing.trail_callback_atr", swing.trail_callback_atr)?
            .set_default("strategy.swing.volume_boost", swing.volume_boost)?
            .set_default("strategy.swing.htf_veto", swing.htf_veto)?
            .set_default("strategy.reference_symbol", "BTCUSDT")?
            .set_default("strategy.trend_interval", "60")?
            .set_default("strategy.cooldown_minutes", 90)?
            .set_default("strategy.zombie_grace_minutes", 60)?
            .set_default("strategy.zombie_min_pnl", 0.2)?
            .set_default("strategy.market_refresh_secs", 14400)?
            .set_default("strategy.notify_recent_secs", 900)?
            // Risk defaults
            .set_default("risk.risk_per_trade", 4.0)?
            .set_default("risk.max_open_positions", 5)?
            .set_default("risk.leverage", 5)?
            .set_default("risk.adx_threshold", 25.0)?
            .set_default("risk.daily_loss_limit", -7.0)?
            .set_default("risk.daily_profit_goal", 15.0)?
            .set_default("risk.max_funding_rate", 0.001)?
            .set_default("risk.stale_position_hours", 4.0)?
            .set_default("risk.auto_scale", true)?
            // Selector defaults
            .set_default("selector.top_liquidity", 40)?
            .set_default("selector.fallback_scalp", "SOLUSDT")?
            .set_default("selector.fallback_swing", "BTCUSDT")?
            .set_default("selector.mood_url", "https://api.alternative.me/fng/")?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            .set_default("persistence.settings_file", "live_settings.json")?
            .set_default("persistence.pardon_file", "pardoned.json")?
            .set_default("persistence.journal_file", "trade_history.csv")?
            // Control surface defaults
            .set_default("telegram.enabled", true)?
            .set_default("telegram.api_url", "https://api.telegram.org")?
            .set_default("telegram.poll_timeout_secs", 10)?
            .set_default("log.json", false)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (PERPBOT__*)
            .add_source(Environment::with_prefix("PERPBOT").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;
        Ok(app_config)
    }

    /// Reject settings that would make the engine misbehave silently
    pub fn validate(&self) -> Result<()> {
        for (name, mode) in [("scalp", &self.strategy.scalp), ("swing", &self.strategy.swing)] {
            if mode.sl_atr <= 0.0 || mode.trail_activation_atr <= 0.0 || mode.trail_callback_atr <= 0.0
            {
                bail!("strategy.{name}: ATR multiples must be positive");
            }
        }
        if self.risk.daily_loss_limit > 0.0 {
            bail!("risk.daily_loss_limit must be zero or negative");
        }
        if self.risk.leverage == 0 {
            bail!("risk.leverage must be at least 1");
        }
        if self.selector.top_liquidity == 0 {
            bail!("selector.top_liquidity must be at least 1");
        }
        Ok(())
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        format!(
            "bot={} exchange={} risk=${:.2} max_pos={} lev={}x adx>{:.1} scalp_tf={} swing_tf={}",
            self.bot.tag,
            self.exchange.base_url,
            self.risk.risk_per_trade,
            self.risk.max_open_positions,
            self.risk.leverage,
            self.risk.adx_threshold,
            self.strategy.scalp.interval,
            self.strategy.swing.interval
        )
    }

    /// Validate required environment variables
    pub fn validate_env(&self) -> Result<()> {
        let mut required = vec!["BYBIT_API_KEY", "BYBIT_API_SECRET"];
        if self.telegram.enabled {
            required.extend(["TELEGRAM_BOT_TOKEN", "TELEGRAM_CHAT_ID"]);
        }

        for var in required {
            match std::env::var(var) {
                Ok(v) if !v.trim().is_empty() => {}
                _ => bail!("Required environment variable {} is not set", var),
            }
        }

        Ok(())
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
