//! Wiring & DI. Entry point: bootstrap adapters, build the engine, start the scheduler, run UI.
//! No business logic here.

use cloud_backup::adapters::persistence::{JsonStore, LibsqlAppState};
use cloud_backup::adapters::remote::oauth::UrlPrompt;
use cloud_backup::adapters::remote::{GoogleDriveTransport, InMemoryTransport};
use cloud_backup::adapters::ui::tui::TuiInputPort;
use cloud_backup::ports::{AppStatePort, InputPort, RemoteTransport, SettingsPort, StatusPort};
use cloud_backup::shared::config::AppConfig;
use cloud_backup::usecases::{BackupEngine, EngineOptions};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_loaded = dotenv::dotenv();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match &env_loaded {
        Ok(path) => info!(path = %path.display(), "loaded .env"),
        Err(_) => info!("no .env found"),
    }

    cloud_backup::adapters::ui::init_ui();

    let cfg = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "invalid configuration; using defaults");
        AppConfig::default()
    });
    let data_dir = cfg.data_dir_or_default();
    tokio::fs::create_dir_all(&data_dir)
        .await
        .map_err(|e| anyhow::anyhow!("create data dir {}: {}", data_dir.display(), e))?;
    info!(path = %data_dir.display(), "data directory");

    // --- Application database ---
    let db_path = cfg.database_path_or_default();
    let app: Arc<dyn AppStatePort> = Arc::new(
        LibsqlAppState::create(&db_path)
            .await
            .map_err(|e| anyhow::anyhow!("open {}: {}", db_path.display(), e))?,
    );

    // --- Settings & status files ---
    let store = Arc::new(JsonStore::new(&data_dir));
    let settings_port: Arc<dyn SettingsPort> = Arc::clone(&store) as Arc<dyn SettingsPort>;
    let status_port: Arc<dyn StatusPort> = store;

    // --- Remote store ---
    let transport: Arc<dyn RemoteTransport> = if cfg.is_google_configured() {
        let prompt: UrlPrompt = Arc::new(|url: &str| {
            println!("Open this URL to authorize Google Drive access:\n\n  {}\n", url);
        });
        info!(folder = %cfg.drive_folder_or_default(), "Google Drive remote store enabled");
        Arc::new(GoogleDriveTransport::from_config(&cfg, Some(prompt))?)
    } else {
        warn!(
            "CLOUD_BACKUP_GOOGLE_CLIENT_ID / CLOUD_BACKUP_GOOGLE_CLIENT_SECRET not set, using in-memory remote store"
        );
        Arc::new(InMemoryTransport::new("offline@localhost"))
    };

    let engine = Arc::new(
        BackupEngine::new(
            app,
            transport,
            settings_port,
            status_port,
            EngineOptions::from_config(&cfg),
        )
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?,
    );

    // --- Scheduler (timer loop + connection watcher) ---
    let shutdown = CancellationToken::new();
    let tick = cfg.scheduler_tick();
    info!(tick_secs = tick.as_secs(), "scheduler started");
    let background = engine.spawn_scheduler(tick, shutdown.clone());

    // --- Run (main menu) ---
    let input_port: Arc<dyn InputPort> = Arc::new(TuiInputPort::new(Arc::clone(&engine)));
    let outcome = input_port.run().await;

    shutdown.cancel();
    for handle in background {
        if let Err(e) = handle.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }
    outcome.map_err(|e| anyhow::anyhow!("{}", e))?;
    info!("bye");
    Ok(())
}
