// Group quiz bot entry point.
//
// Startup sequence:
// 1. Initialize tracing (stderr)
// 2. Load config
// 3. Open database
// 4. Identify the bot via getMe
// 5. Create mpsc channels
// 6. Spawn update poller, scheduler and app loop
// 7. Wait for Ctrl+C
// 8. Cleanup on exit

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use groupquiz_bot::app::{self, AppState};
use groupquiz_bot::config;
use groupquiz_bot::scheduler;
use groupquiz_bot::telegram::TelegramClient;
use groupquiz_core::{Database, DeliveryOrchestrator, TemplateStore};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing
    init_tracing()?;
    info!("Group quiz bot starting up");

    // 2. Load config
    let config = config::load_config().context("failed to load configuration")?;
    let token = config.require_token()?.to_string();
    info!(
        "Config loaded: schedule {} at {} (UTC{}), ask-now {}",
        if config.schedule.enabled { "enabled" } else { "disabled" },
        config.schedule.time.format("%H:%M"),
        config.schedule.offset,
        if config.bot.ask_now_enabled { "enabled" } else { "disabled" },
    );

    // 3. Open database
    let db = Arc::new(Database::open(&config.db_path).context("failed to open database")?);
    info!("Database opened at {}", config.db_path);
    match db.count_all().context("failed to count question templates")? {
        0 => warn!(
            "No question templates found; run groupquiz-seed to load {}",
            config.questions_path
        ),
        n => info!("{n} question templates available"),
    }

    // 4. Identify the bot
    let client = Arc::new(TelegramClient::new(&config.bot.api_base_url, &token));
    let me = client
        .get_me()
        .await
        .context("failed to reach the Telegram Bot API (getMe)")?;
    let bot_username = me.username.unwrap_or_default();
    info!("Running as @{bot_username} (id {})", me.id);

    // 5. Create mpsc channels
    let (update_tx, update_rx) = mpsc::channel(256);
    let (tick_tx, tick_rx) = mpsc::channel(4);

    let orchestrator = Arc::new(DeliveryOrchestrator::new(
        Arc::clone(&db),
        Arc::clone(&client),
        config.delivery,
    ));
    let mut state = AppState::new(
        Arc::clone(&db),
        orchestrator,
        Arc::clone(&client),
        bot_username,
        config.bot.ask_now_enabled,
        config.schedule.pause_between_groups,
    );

    // 6. Spawn tasks
    let poll_timeout = Duration::from_secs(config.bot.poll_timeout_secs);
    let poller_handle = tokio::spawn(app::run_update_poller(
        Arc::clone(&client),
        update_tx,
        poll_timeout,
    ));

    let scheduler_handle = if config.schedule.enabled {
        Some(tokio::spawn(scheduler::run_schedule(
            tick_tx,
            config.schedule.clone(),
        )))
    } else {
        info!("Daily schedule disabled");
        drop(tick_tx);
        None
    };

    let app_handle = tokio::spawn(async move {
        if let Err(e) = app::run(update_rx, tick_rx, &mut state).await {
            error!("Application loop error: {e:#}");
        }
        state.finish_daily_job().await;
    });

    // 7. Wait for Ctrl+C
    info!("Bot ready, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("Shutdown requested");

    // 8. Cleanup: stopping the poller closes the update channel, which ends
    // the app loop once any in-flight command or daily job completes.
    poller_handle.abort();
    if let Some(handle) = scheduler_handle {
        handle.abort();
    }
    if tokio::time::timeout(Duration::from_secs(10), app_handle)
        .await
        .is_err()
    {
        warn!("App loop did not finish within 10s");
    }

    drop(db);
    info!("Group quiz bot shut down cleanly");
    Ok(())
}

/// Initialize tracing to stderr.
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("groupquiz_core=info,groupquiz_bot=info,warn")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
