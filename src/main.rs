//! PerpBot entrypoint
//!
//! Wires configuration, the exchange client, persisted state and both
//! long-running loops (orchestration and operator commands).

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use perpbot::config::AppConfig;
use perpbot::control::telegram::TelegramClient;
use perpbot::control::{CommandHandler, LogNotifier, Notifier};
use perpbot::engine::{now_ms, BotState, EngineConfig, Orchestrator, SharedState};
use perpbot::exchange::{BybitRestClient, Exchange};
use perpbot::execution::ExecutionManager;
use perpbot::mood::{MoodClient, MoodSource};
use perpbot::persistence::{load_settings_or_default, PardonStore, SettingsStore, TradeJournal};
use perpbot::risk::{Ledger, RiskProfile};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Configuration (.env is read inside load)
    let config = AppConfig::load()?;
    init_tracing(config.log.json);
    config.validate_env()?;
    info!(config = %config.digest(), "🤖 PerpBot starting");

    // 2. Persisted state
    let data_dir = Path::new(&config.persistence.data_dir);
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;
    let settings = SettingsStore::new(data_dir.join(&config.persistence.settings_file));
    let pardons = PardonStore::new(data_dir.join(&config.persistence.pardon_file));
    let journal = Arc::new(TradeJournal::open(
        data_dir.join(&config.persistence.journal_file),
    )?);

    let now = now_ms();
    let profile = load_settings_or_default(&settings, &RiskProfile::from(&config.risk))
        .with_startup_halt(config.risk.start_halted);
    let mut ledger = Ledger::new(config.strategy.cooldown_minutes * 60_000);
    match pardons.load(now) {
        Ok(active) => {
            info!(pardons = active.len(), "pardons restored");
            ledger.restore_pardons(active);
        }
        Err(e) => warn!(error = %e, "Pardon file unusable, starting without pardons"),
    }
    info!(
        halted = profile.global_halt,
        risk = profile.risk_per_trade,
        leverage = profile.leverage,
        "risk profile loaded"
    );
    let state = Arc::new(SharedState::new(
        BotState::new(profile, ledger),
        settings,
        pardons,
    ));

    // 3. Components
    let exchange: Arc<dyn Exchange> = Arc::new(BybitRestClient::from_config(&config.exchange)?);
    let execution = Arc::new(ExecutionManager::from_config(
        exchange.clone(),
        &config.exchange,
    ));
    let mood: Arc<dyn MoodSource> = Arc::new(MoodClient::new(
        &config.selector.mood_url,
        Duration::from_millis(config.exchange.request_timeout_ms),
    )?);

    let telegram = if config.telegram.enabled {
        Some(Arc::new(TelegramClient::from_config(&config.telegram)?))
    } else {
        None
    };
    let notifier: Arc<dyn Notifier> = match &telegram {
        Some(client) => client.clone() as Arc<dyn Notifier>,
        None => {
            warn!("Telegram disabled, notifications go to the log only");
            Arc::new(LogNotifier)
        }
    };

    let orchestrator = Arc::new(
        Orchestrator::new(
            state.clone(),
            exchange.clone(),
            execution.clone(),
            mood,
            notifier.clone(),
            EngineConfig::from(&config),
        )
        .with_journal(journal),
    );

    // 4. Warm up and announce
    orchestrator.bootstrap(now_ms()).await;
    let halted = state.with(|s| s.profile.global_halt);
    notifier
        .notify(&format!(
            "🤖 *PerpBot {}* online. {}",
            config.bot.tag,
            if halted { "🛑 PAUSED (send /resume)" } else { "🟢 LIVE" }
        ))
        .await;

    // 5. Loops
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let engine_task = {
        let orchestrator = orchestrator.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { orchestrator.run(shutdown).await })
    };

    let command_task = telegram.map(|client| {
        let handler = Arc::new(CommandHandler::new(
            state.clone(),
            exchange.clone(),
            execution.clone(),
            &config.bot.tag,
        ));
        tokio::spawn(client.run_command_loop(handler, shutdown_rx.clone()))
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received, stopping loops");
    let _ = shutdown_tx.send(true);

    if let Err(e) = engine_task.await {
        error!(error = %e, "orchestration task failed");
    }
    if let Some(task) = command_task {
        if let Err(e) = task.await {
            error!(error = %e, "command task failed");
        }
    }

    info!("👋 PerpBot stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
