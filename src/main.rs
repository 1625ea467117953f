use ago_recipes::{
    ago_device_client::AgoDeviceClient,
    config::AppConfig,
    notice::NoticeBus,
    recipe_store::SqliteRecipeStore,
    services::{
        connectivity::{ConnectionState, ConnectivityManager, LinkSettings},
        persistence::PersistenceEngine,
        upload::UploadService,
    },
    wifi_client::NetworkSetupClient,
};
use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};
use log::{debug, error, info};
use std::io::Write;
use tokio::signal::unix::{SignalKind, signal};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("application error: {e:#}");
        std::process::exit(1);
    }
}

fn initialize() {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout).init();

    info!("module version: {}", env!("CARGO_PKG_VERSION"));
}

async fn run() -> Result<()> {
    initialize();

    let config = AppConfig::get();
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    info!("opening {}", config.store.database_path.display());
    let store = SqliteRecipeStore::open(&config.store.database_path)
        .context("failed to open recipe store")?;

    let notices = NoticeBus::default();
    let engine = PersistenceEngine::new(store, notices.clone(), config.timing.write_debounce);
    engine.load_settings().await;
    engine.load_recipes().await;
    info!("{} recipe(s) loaded", engine.recipes().len());

    let device = AgoDeviceClient::new(&config.timing).context("failed to create device client")?;
    let wifi = NetworkSetupClient::new(config.timing.command_timeout);
    let manager = ConnectivityManager::new(
        wifi,
        device.clone(),
        notices.clone(),
        LinkSettings::from(&engine.settings()),
    );
    let (link, link_task) = manager.spawn(config.timing.poll_interval);
    let uploads = UploadService::new(engine.clone(), device, link.subscribe(), notices);

    let mut status_rx = link.subscribe();
    let mut last_state = ConnectionState::Disconnected;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                debug!("ctrl-c received");
                break;
            },
            _ = sigterm.recv() => {
                debug!("SIGTERM received");
                break;
            },
            changed = status_rx.changed() => {
                if changed.is_err() {
                    error!("connectivity manager stopped unexpectedly");
                    break;
                }

                let status = status_rx.borrow_and_update().clone();
                info!(
                    "link {:?}, network {:?}, previous {:?}",
                    status.state, status.current_name, status.previous_name
                );

                if status.state == ConnectionState::Connected && last_state != ConnectionState::Connected {
                    if let Some(programs) = uploads.list_programs().await {
                        info!("{} custom program(s) on device", programs.len());
                    }
                }
                last_state = status.state;
            },
        }
    }

    info!("shutting down");

    drop(link);
    if let Err(e) = link_task.await {
        error!("connectivity task failed: {e}");
    }

    engine.flush_pending().await;
    info!("shutdown complete");

    Ok(())
}
