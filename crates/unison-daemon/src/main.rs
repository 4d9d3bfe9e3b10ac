use std::sync::Arc;

use tracing::{error, info, warn};

use unison_coord::{Coordinator, JobRegistry, ListenerHealth};
use unison_core::config::{StoreBackend, UnisonConfig};
use unison_core::store::{ChangeFeed, LockStore, ScheduleStore};
use unison_store::{MemoryCoordination, PgCoordination};

mod handlers;

type StoreHandles = (
    Arc<dyn LockStore>,
    Arc<dyn ScheduleStore>,
    Arc<dyn ChangeFeed>,
);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "unison_daemon=info,unison_coord=info,unison_store=info".into()
            }),
        )
        .init();

    // load config: explicit path via UNISON_CONFIG > ~/.unison/unison.toml
    let config_path = std::env::var("UNISON_CONFIG").ok();
    let config = UnisonConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        UnisonConfig::default()
    });

    let (lock_store, schedule_store, feed): StoreHandles = match config.store.backend {
        StoreBackend::Postgres => {
            info!(url = %config.store.url, channel = %config.store.channel, "connecting to Postgres store");
            let pg = Arc::new(
                PgCoordination::connect(&config.store.url, &config.store.channel).await?,
            );
            (pg.clone(), pg.clone(), pg)
        }
        StoreBackend::Memory => {
            warn!("memory store backend: no cross-process coordination");
            let mem = Arc::new(MemoryCoordination::new());
            (mem.clone(), mem.clone(), mem)
        }
    };

    let registry = Arc::new(handlers::builtin_registry());
    info!(handlers = ?registry.names(), "job handlers registered");

    // Outcome sink: one record per fire event, consumed here by logging.
    // A real deployment forwards these to its observability pipeline.
    let (outcome_tx, mut outcome_rx) = tokio::sync::mpsc::channel(256);
    tokio::spawn(async move {
        while let Some(outcome) = outcome_rx.recv().await {
            match serde_json::to_string(&outcome) {
                Ok(line) => info!(target: "unison_outcomes", "{line}"),
                Err(e) => warn!(error = %e, "could not serialize job outcome"),
            }
        }
    });

    let coordinator = Arc::new(Coordinator::new(
        lock_store,
        schedule_store,
        feed,
        registry,
        config.scheduler.tick_secs,
        Some(outcome_tx),
    ));
    coordinator.start().await?;
    info!(instance = %coordinator.instance_id(), "coordinator started");

    // Surface persistent listener failure loudly: a dead listener means
    // this process silently runs a stale schedule.
    let mut health_rx = coordinator.listener_health();
    tokio::spawn(async move {
        while health_rx.changed().await.is_ok() {
            if *health_rx.borrow() == ListenerHealth::Failed {
                error!("UNHEALTHY: schedule change listener failed; schedule may be stale");
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    coordinator.shutdown().await;
    Ok(())
}
