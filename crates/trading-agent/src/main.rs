use std::sync::Arc;

use agent_ports::{notify_quietly, AlertSink, ExecutionClient, Persistence, PriceFeed};
use anyhow::Result;
use kelly_position_sizer::KellyPositionSizer;
use risk_manager::RiskRegistry;
use tokio::signal::unix::SignalKind;

use trading_agent::adapters::{HttpPriceFeed, OpenAiCompletion, PaperExecutionClient};
use trading_agent::notifier::DiscordAlertSink;
use trading_agent::store::SqliteStore;
use trading_agent::{
    standard_arbitrator, AgentConfig, AgentPipeline, Collaborators, CycleScheduler, PositionMonitor,
    SchedulerSettings,
};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env, init tracing
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    // Panic hook: log panic info before crashing
    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("Starting autonomous trading agents");

    // 2. Load configuration
    let config = AgentConfig::from_env()?;
    tracing::info!("Configuration loaded and validated");
    tracing::info!("  Cycle interval: {} seconds", config.cycle_interval_seconds);
    tracing::info!(
        "  Workers: {} (pacing {}ms)",
        config.max_concurrent_agents,
        config.agent_pacing_ms
    );
    tracing::info!(
        "  Breakers: max trade ${}, daily loss {}%, drawdown {}%, {} open positions",
        config.breaker.max_trade_usd,
        config.breaker.max_daily_loss_percent,
        config.breaker.max_drawdown_percent,
        config.breaker.max_open_positions
    );

    // 3. Store
    let store = SqliteStore::connect(&config.database_url).await?;
    store.init_schema().await?;
    store
        .ping()
        .await
        .map_err(|e| anyhow::anyhow!("Database connectivity check failed: {}", e))?;
    tracing::info!("Startup check: database OK ({})", config.database_url);

    let store: Arc<dyn Persistence> = Arc::new(store);
    let agents = store.load_agents().await?;
    let open_positions = store.load_open_positions(None).await?;
    tracing::info!(
        "Loaded {} agents ({} active), {} open positions",
        agents.len(),
        agents.iter().filter(|a| a.is_active).count(),
        open_positions.len()
    );

    // 4. Collaborators
    let feed: Arc<dyn PriceFeed> = Arc::new(HttpPriceFeed::new(&config.price_feed_url)?);
    let execution: Arc<dyn ExecutionClient> = Arc::new(PaperExecutionClient::new(Arc::clone(&feed)));
    tracing::info!("Paper execution against {}", config.price_feed_url);

    let llm = OpenAiCompletion::new(&config.llm_api_url, &config.llm_api_key, &config.llm_model)?;
    if !llm.is_configured() {
        tracing::warn!("LLM_API_KEY not set, the AI text tier will never produce a signal");
    }

    let notifier = DiscordAlertSink::new(config.discord_webhook_url.clone())?;
    if !notifier.is_configured() {
        tracing::info!("DISCORD_WEBHOOK_URL not set, alerts are log-only");
    }
    let alerts: Arc<dyn AlertSink> = Arc::new(notifier);

    // 5. Pipeline and scheduler
    let registry = Arc::new(RiskRegistry::new(config.breaker.clone()));
    let arbitrator = standard_arbitrator(
        Arc::new(llm),
        config.thresholds,
        config.llm_temperature,
        config.llm_max_tokens,
    );
    let sizer = KellyPositionSizer::new(0.5, 0.10, 0.25, config.min_agent_balance)?;

    let pipeline = Arc::new(AgentPipeline::new(
        Collaborators {
            feed,
            store,
            execution,
            alerts: Arc::clone(&alerts),
        },
        arbitrator,
        sizer,
        registry,
        PositionMonitor::new(config.exit_rules),
        config.history_lookback,
    ));
    let scheduler = Arc::new(CycleScheduler::new(pipeline, SchedulerSettings::from(&config)));

    // 6. Startup notification
    notify_quietly(
        alerts.as_ref(),
        &format!(
            "**Trading Agents Started**\n\
             Agents: {} | Open positions: {}\n\
             Cycle interval: {}s | Max trade: ${} | Daily loss limit: {}%",
            agents.len(),
            open_positions.len(),
            config.cycle_interval_seconds,
            config.breaker.max_trade_usd,
            config.breaker.max_daily_loss_percent
        ),
    )
    .await;

    scheduler.start().await;
    tracing::info!(
        "Agents are now running. Cycling every {}s. Press Ctrl+C to stop.",
        config.cycle_interval_seconds
    );

    // Graceful shutdown (SIGINT + SIGTERM)
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    let shutdown = async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            }
        }
    };
    shutdown.await;

    tracing::info!("Shutting down, waiting for the current cycle to finish");
    scheduler.stop().await;
    scheduler.metrics().log_metrics();

    let snapshot = scheduler.metrics().snapshot();
    notify_quietly(
        alerts.as_ref(),
        &format!(
            "**Trading Agents Stopped** after {} cycles\n\
             Executed: {} | Closed: {} | Total P&L: ${:.2}",
            snapshot.cycles_completed,
            snapshot.trades_executed,
            snapshot.positions_closed,
            snapshot.total_pnl
        ),
    )
    .await;

    tracing::info!("Shutdown complete");
    Ok(())
}
