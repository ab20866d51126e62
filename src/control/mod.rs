//! Operator control surface
//!
//! Line commands of the shape `/<verb> [arg]`, parsed into [`Command`] and
//! answered with free-form text by [`CommandHandler`]. Transport (Telegram)
//! lives in [`telegram`]; outbound announcements go through [`Notifier`].

pub mod telegram;

use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{info, warn};

use crate::engine::SharedState;
use crate::exchange::Exchange;
use crate::execution::ExecutionManager;
use crate::types::{Symbol, TradingMode};

/// Rows per mode in the `/scan` heatmap
const HEATMAP_ROWS: usize = 8;

/// Outbound announcements (halts, entries, blacklist, breaker trips)
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one message; delivery failures are logged, never returned
    async fn notify(&self, text: &str);
}

/// Fallback notifier that only writes to the log
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, text: &str) {
        info!(target: "perpbot::notify", "{}", text);
    }
}

/// Parsed operator command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Status,
    Risk(Option<f64>),
    Adx(Option<f64>),
    Leverage(Option<u32>),
    Blacklist,
    Unban(Option<String>),
    Close(Option<String>),
    Limit(Option<f64>),
    Goal(Option<f64>),
    Scan,
    Positions,
    Balance,
    Report,
    Pause,
    Resume,
    Kill,
    /// Known verb with an unparseable argument
    Invalid(String),
}

impl Command {
    /// `None` for text that is not a known command
    pub fn parse(text: &str) -> Option<Command> {
        let mut parts = text.split_whitespace();
        let verb = parts.next()?.to_lowercase();
        // Group chats address commands as /verb@botname
        let verb = verb.split('@').next().unwrap_or_default().to_string();
        let arg = parts.next();

        fn num<T: std::str::FromStr>(verb: &str, arg: Option<&str>) -> Result<Option<T>, Command> {
            match arg {
                None => Ok(None),
                Some(raw) => raw
                    .parse()
                    .map(Some)
                    .map_err(|_| Command::Invalid(format!("❌ Invalid value for {verb}: `{raw}`"))),
            }
        }
        let text_arg = arg.map(str::to_string);

        let cmd = match verb.as_str() {
            "/status" => Command::Status,
            "/risk" => num(&verb, arg).map_or_else(|e| e, Command::Risk),
            "/adx" => num(&verb, arg).map_or_else(|e| e, Command::Adx),
            "/lev" => num(&verb, arg).map_or_else(|e| e, Command::Leverage),
            "/black" => Command::Blacklist,
            "/unban" => Command::Unban(text_arg),
            "/close" => Command::Close(text_arg),
            "/limit" => num(&verb, arg).map_or_else(|e| e, Command::Limit),
            "/goal" => num(&verb, arg).map_or_else(|e| e, Command::Goal),
            "/scan" => Command::Scan,
            "/positions" => Command::Positions,
            "/balance" => Command::Balance,
            "/report" => Command::Report,
            "/pause" => Command::Pause,
            "/resume" => Command::Resume,
            "/kill" => Command::Kill,
            _ => return None,
        };
        Some(cmd)
    }
}

/// Command menu advertised to the chat client
pub const COMMAND_MENU: &[(&str, &str)] = &[
    ("status", "📊 Status"),
    ("scan", "🔍 Market Heatmap"),
    ("report", "📈 Daily PnL"),
    ("risk", "🎲 Set Risk ($)"),
    ("adx", "📉 Set ADX"),
    ("lev", "⚙️ Set Leverage"),
    ("black", "☠️ Blacklist"),
    ("unban", "✨ Unban Coin"),
    ("close", "✂️ Close Coin"),
    ("limit", "🛑 Loss Limit"),
    ("goal", "🏆 Profit Goal"),
    ("balance", "💰 Balance"),
    ("positions", "📋 Trades"),
    ("resume", "🟢 START"),
    ("pause", "🛑 STOP"),
    ("kill", "⚠️ KILL ALL"),
];

/// Executes operator commands against the shared state and the exchange
pub struct CommandHandler {
    state: Arc<SharedState>,
    exchange: Arc<dyn Exchange>,
    execution: Arc<ExecutionManager>,
    tag: String,
}

impl CommandHandler {
    pub fn new(
        state: Arc<SharedState>,
        exchange: Arc<dyn Exchange>,
        execution: Arc<ExecutionManager>,
        tag: &str,
    ) -> Self {
        Self {
            state,
            exchange,
            execution,
            tag: tag.to_string(),
        }
    }

    /// Handle one line of operator text; `None` when it is not a command
    pub async fn handle_text(&self, text: &str, now: i64) -> Option<String> {
        let cmd = Command::parse(text)?;
        info!(command = ?cmd, "operator command");
        Some(self.handle(cmd, now).await)
    }

    pub async fn handle(&self, cmd: Command, now: i64) -> String {
        match cmd {
            Command::Status => self.status(now),
            Command::Risk(value) => self.risk(value),
            Command::Adx(value) => self.adx(value),
            Command::Leverage(value) => self.leverage(value),
            Command::Blacklist => self.blacklist(now),
            Command::Unban(fragment) => self.unban(fragment, now),
            Command::Close(fragment) => self.close(fragment).await,
            Command::Limit(value) => self.limit(value),
            Command::Goal(value) => self.goal(value),
            Command::Scan => self.scan(),
            Command::Positions => self.positions().await,
            Command::Balance => self.balance().await,
            Command::Report => self.report(),
            Command::Pause => {
                self.state
                    .with_profile_persisted(|s| s.profile.global_halt = true);
                "🛑 *PAUSED*".to_string()
            }
            Command::Resume => {
                self.state.with_profile_persisted(|s| s.profile.resume());
                "🟢 *LIVE*".to_string()
            }
            Command::Kill => self.kill().await,
            Command::Invalid(reply) => reply,
        }
    }

    fn status(&self, now: i64) -> String {
        self.state.with(|s| {
            let state = if s.profile.is_paused(now) {
                format!(
                    "⛔ *CIRCUIT BREAKER ({}m left)*",
                    s.profile.pause_minutes_left(now)
                )
            } else if s.profile.global_halt {
                "🛑 PAUSED".to_string()
            } else {
                "🟢 LIVE".to_string()
            };
            format!(
                "🤖 *PERPBOT {}*\nState: {}\n🌍 BTC: *{}*\n🧠 Mood: *{}* ({})\n📉 PnL: `${:.2}`\n💰 Risk: `${}`\n📈 WinRate: `{:.1}%`\n📂 Trades: {}/{}",
                self.tag,
                state,
                s.market.trend,
                s.market.mood.label,
                s.market.mood.value,
                s.daily_pnl,
                s.profile.risk_per_trade,
                s.ledger.win_rate(),
                s.active.len(),
                s.profile.max_open_positions
            )
        })
    }

    fn risk(&self, value: Option<f64>) -> String {
        match value {
            Some(v) if v > 0.0 && v.is_finite() => {
                self.state
                    .with_profile_persisted(|s| s.profile.risk_per_trade = v);
                format!("✅ Risk updated: `${v}`")
            }
            Some(_) => "❌ Risk must be positive".to_string(),
            None => format!("Current Risk: `${}`", self.state.profile().risk_per_trade),
        }
    }

    fn adx(&self, value: Option<f64>) -> String {
        match value {
            Some(v) if v >= 0.0 && v.is_finite() => {
                self.state
                    .with_profile_persisted(|s| s.profile.adx_threshold = v);
                format!("✅ ADX Threshold: `{v}`")
            }
            Some(_) => "❌ ADX threshold must be zero or positive".to_string(),
            None => format!("Current ADX: `{}`", self.state.profile().adx_threshold),
        }
    }

    fn leverage(&self, value: Option<u32>) -> String {
        match value {
            Some(v) if v >= 1 => {
                self.state.with_profile_persisted(|s| s.profile.leverage = v);
                format!("✅ Leverage: `{v}x`")
            }
            Some(_) => "❌ Leverage must be at least 1".to_string(),
            None => format!("Current Leverage: `{}x`", self.state.profile().leverage),
        }
    }

    fn limit(&self, value: Option<f64>) -> String {
        match value {
            Some(v) if v.is_finite() => {
                let stored = self.state.with_profile_persisted(|s| {
                    s.profile.set_daily_loss_limit(v);
                    s.profile.daily_loss_limit
                });
                format!("✅ Daily Loss Limit: `${stored}`")
            }
            Some(_) => "❌ Invalid limit".to_string(),
            None => format!(
                "Current Limit: `${}`",
                self.state.profile().daily_loss_limit
            ),
        }
    }

    fn goal(&self, value: Option<f64>) -> String {
        match value {
            Some(v) if v.is_finite() => {
                self.state
                    .with_profile_persisted(|s| s.profile.daily_profit_goal = v);
                format!("✅ Profit Goal: `${v}`")
            }
            Some(_) => "❌ Invalid goal".to_string(),
            None => format!(
                "Current Goal: `${}`",
                self.state.profile().daily_profit_goal
            ),
        }
    }

    fn blacklist(&self, now: i64) -> String {
        let entries = self.state.with(|s| s.ledger.blacklisted(now));
        if entries.is_empty() {
            return "✅ *No coins in Penalty Box.*".to_string();
        }
        let mut msg = "☠️ *BLACKLISTED:*\n".to_string();
        for (symbol, until) in entries {
            let hours = (until - now) as f64 / 3_600_000.0;
            let _ = writeln!(msg, "❌ {symbol} ({hours:.1}h left)");
        }
        msg
    }

    fn unban(&self, fragment: Option<String>, now: i64) -> String {
        let Some(fragment) = fragment else {
            return "⚠️ Usage: `/unban PEPE`".to_string();
        };
        let target = self.state.with_pardons_persisted(|s| {
            let target = s
                .ledger
                .find_blacklisted(&fragment)
                .unwrap_or_else(|| Symbol::from_fragment(&fragment));
            s.ledger.pardon(&target, now);
            target
        });
        info!(symbol = %target, "pardon granted");
        format!("✨ *{target}* unbanned (pardon active for 24h).")
    }

    async fn close(&self, fragment: Option<String>) -> String {
        let Some(fragment) = fragment else {
            return "⚠️ Usage: `/close PEPE`".to_string();
        };
        let Some(symbol) = self.state.with(|s| s.find_active(&fragment)) else {
            return format!("❌ Not found: {}", fragment.to_uppercase());
        };
        match self.execution.close(&symbol).await {
            Ok(_) => format!("✂️ *{symbol}* closed."),
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "operator close failed");
                format!("❌ Close failed for {symbol}")
            }
        }
    }

    fn scan(&self) -> String {
        let (trend, heatmap) = self
            .state
            .with(|s| (s.market.trend, s.market.heatmap.clone()));
        if heatmap.is_empty() {
            return "⏳ Syncing...".to_string();
        }

        let mut msg = format!("*🧗 MARKET: {trend}*\n");
        for (mode, title) in [
            (TradingMode::Scalp, "⚡ *SCALP (Top 8):*"),
            (TradingMode::Swing, "🐢 *SWING (Top 8):*"),
        ] {
            let _ = write!(msg, "\n{title}\n```\n");
            for snap in heatmap
                .iter()
                .filter(|s| s.mode == mode)
                .take(HEATMAP_ROWS)
            {
                let _ = writeln!(msg, "{:<10} {}", snap.symbol.as_str(), snap.signal);
            }
            msg.push_str("```");
        }
        msg
    }

    async fn positions(&self) -> String {
        match self.exchange.positions().await {
            Ok(positions) if positions.is_empty() => "🤷 *No open positions.*".to_string(),
            Ok(positions) => {
                let mut msg = "📋 *OPEN POSITIONS:*\n".to_string();
                for p in positions {
                    let icon = if p.unrealised_pnl >= 0.0 { "🟢" } else { "🔴" };
                    let _ = writeln!(
                        msg,
                        "{icon} *{}* {} | PnL: `${:.2}`",
                        p.symbol, p.side, p.unrealised_pnl
                    );
                }
                msg
            }
            Err(e) => {
                warn!(error = %e, "position listing failed");
                "❌ Error".to_string()
            }
        }
    }

    async fn balance(&self) -> String {
        let (active, max) = self
            .state
            .with(|s| (s.active.len(), s.profile.max_open_positions));
        match self.exchange.wallet_balance().await {
            Ok(balance) => format!("💰 Balance: `${balance:.2}`\nTrades: {active}/{max}"),
            Err(e) => {
                warn!(error = %e, "balance query failed");
                "❌ Error".to_string()
            }
        }
    }

    fn report(&self) -> String {
        self.state.with(|s| {
            let color = if s.daily_pnl >= 0.0 { "🟢" } else { "🔴" };
            format!(
                "📅 *DAILY REPORT*\n\nRealized PnL: {color} `${:.2}`\n\nTarget: `${}`\nStop: `${}`",
                s.daily_pnl, s.profile.daily_profit_goal, s.profile.daily_loss_limit
            )
        })
    }

    async fn kill(&self) -> String {
        warn!("kill switch requested by operator");
        match self.execution.kill_all().await {
            Ok(n) => format!("⚠️ *KILL ALL* done. Flattened {n} position(s)."),
            Err(e) => format!("❌ Kill switch incomplete: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_verbs_and_arguments() {
        assert_eq!(Command::parse("/status"), Some(Command::Status));
        assert_eq!(Command::parse("/risk 5.5"), Some(Command::Risk(Some(5.5))));
        assert_eq!(Command::parse("/RISK"), Some(Command::Risk(None)));
        assert_eq!(Command::parse("/lev 10"), Some(Command::Leverage(Some(10))));
        assert_eq!(
            Command::parse("/unban pepe"),
            Some(Command::Unban(Some("pepe".to_string())))
        );
        assert_eq!(Command::parse("/close"), Some(Command::Close(None)));
        assert_eq!(
            Command::parse("/scan@perp_bot"),
            Some(Command::Scan)
        );
        assert_eq!(Command::parse("/limit 7"), Some(Command::Limit(Some(7.0))));
    }

    #[test]
    fn unknown_text_is_ignored() {
        assert_eq!(Command::parse("hello"), None);
        assert_eq!(Command::parse(""), None);
        assert_eq!(Command::parse("/dance"), None);
    }

    #[test]
    fn bad_numbers_are_reported() {
        assert!(matches!(Command::parse("/risk lots"), Some(Command::Invalid(_))));
        assert!(matches!(Command::parse("/lev -2"), Some(Command::Invalid(_))));
    }

    // ==================== HANDLER ====================

    use crate::engine::BotState;
    use crate::exchange::MockExchange;
    use crate::persistence::{PardonStore, SettingsStore};
    use crate::risk::{Ledger, RiskProfile};
    use std::path::PathBuf;
    use std::time::Duration;

    const NOW: i64 = 1_700_000_000_000;

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

    struct Fixture {
        dir: PathBuf,
        state: Arc<SharedState>,
        handler: CommandHandler,
    }

    impl Fixture {
        fn new(ledger: Ledger) -> Self {
            let dir = std::env::temp_dir().join(format!("perpbot_control_{}", uuid::Uuid::new_v4()));
            let state = Arc::new(SharedState::new(
                BotState::new(profile(), ledger),
                SettingsStore::new(dir.join("live_settings.json")),
                PardonStore::new(dir.join("pardoned.json")),
            ));
            let exchange: Arc<dyn Exchange> = Arc::new(MockExchange::new());
            let execution = Arc::new(ExecutionManager::new(
                exchange.clone(),
                Duration::ZERO,
                Duration::ZERO,
            ));
            let handler = CommandHandler::new(state.clone(), exchange, execution, "test");
            Self {
                dir,
                state,
                handler,
            }
        }

        fn settings(&self) -> SettingsStore {
            SettingsStore::new(self.dir.join("live_settings.json"))
        }

        async fn send(&self, text: &str) -> String {
            self.handler.handle_text(text, NOW).await.unwrap()
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    #[tokio::test]
    async fn profile_commands_are_persisted() {
        let f = Fixture::new(Ledger::new(90 * 60_000));

        assert!(f.send("/risk 6").await.contains("✅"));
        assert!(f.send("/lev 10").await.contains("10x"));
        assert!(f.send("/adx 30").await.contains("30"));
        assert!(f.send("/goal 20").await.contains("20"));
        // Loss limits are stored negative
        assert!(f.send("/limit 5").await.contains("-5"));

        let reloaded = f.settings().load(&profile()).unwrap();
        assert_eq!(reloaded.risk_per_trade, 6.0);
        assert_eq!(reloaded.leverage, 10);
        assert_eq!(reloaded.adx_threshold, 30.0);
        assert_eq!(reloaded.daily_profit_goal, 20.0);
        assert_eq!(reloaded.daily_loss_limit, -5.0);
        assert_eq!(reloaded, f.state.profile());
    }

    #[tokio::test]
    async fn invalid_values_leave_the_profile_alone() {
        let f = Fixture::new(Ledger::new(90 * 60_000));

        for text in [
            "/risk lots",
            "/risk 0",
            "/risk -2",
            "/lev 0",
            "/lev 2.5",
            "/adx -1",
            "/goal NaN",
            "/limit inf",
        ] {
            assert!(f.send(text).await.starts_with("❌"), "{text}");
        }

        assert_eq!(f.state.profile(), profile());
        assert!(!f.dir.join("live_settings.json").exists());
    }

    #[tokio::test]
    async fn bare_command_reports_current_value() {
        let f = Fixture::new(Ledger::new(90 * 60_000));
        assert_eq!(f.send("/risk").await, "Current Risk: `$4`");
        assert_eq!(f.send("/lev").await, "Current Leverage: `5x`");
        assert_eq!(f.send("/limit").await, "Current Limit: `$-7`");
        assert!(!f.dir.join("live_settings.json").exists());
    }

    #[tokio::test]
    async fn unban_survives_a_restart() {
        let pepe = Symbol::new("PEPEUSDT");
        let mut ledger = Ledger::new(90 * 60_000);
        ledger.record_exit(&pepe, -1.0, NOW - 60_000);
        ledger.record_exit(&pepe, -1.0, NOW - 60_000);
        let f = Fixture::new(ledger);
        assert!(f.send("/black").await.contains("PEPEUSDT"));

        let reply = f.send("/unban pepe").await;
        assert!(reply.contains("*PEPEUSDT* unbanned"));
        assert_eq!(f.state.with(|s| s.entry_block(&pepe, NOW)), None);

        // A fresh process restores the pardon from disk
        let restored = PardonStore::new(f.dir.join("pardoned.json"))
            .load(NOW + 60_000)
            .unwrap();
        assert_eq!(restored.get(&pepe), Some(&NOW));
        let mut ledger = Ledger::new(90 * 60_000);
        ledger.restore_pardons(restored);
        assert!(ledger.is_pardoned(&pepe, NOW + 60_000));
    }
}
