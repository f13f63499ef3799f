use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use orchestra_coordinator::{CoordinatorConfig, HeartbeatMonitor, TrainingCoordinator};
use orchestra_modeling::Evaluator;
use orchestra_store::{
    BlobStore, DeviceRepository, ModelRepository, TrainingJobRepository, connect_database,
};

use crate::api;
use crate::config::ServerSettings;
use crate::rpc;

/// Bounded time for the RPC and API surfaces to drain after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shared handles for every request surface, built once at startup and
/// passed explicitly; no global store handles anywhere.
pub struct AppContext {
    pub devices: DeviceRepository,
    pub models: ModelRepository,
    pub jobs: TrainingJobRepository,
    pub blob: BlobStore,
    pub heartbeat: HeartbeatMonitor,
    pub settings: ServerSettings,
}

pub struct App {
    ctx: Arc<AppContext>,
    coordinator: TrainingCoordinator,
    cancel: CancellationToken,
}

impl App {
    pub async fn new(settings: ServerSettings) -> Result<Self> {
        let pool = connect_database(&settings.database_url)
            .await
            .context("failed to connect to database")?;
        let blob = BlobStore::connect(&settings.cache_url)
            .await
            .context("failed to connect to cache")?;

        let devices = DeviceRepository::new(pool.clone());
        let models = ModelRepository::new(pool.clone());
        let jobs = TrainingJobRepository::new(pool);

        let heartbeat = HeartbeatMonitor::new(
            blob.clone(),
            devices.clone(),
            settings.heartbeat_interval_seconds,
            settings.heartbeat_timeout_multiplier,
        );
        let evaluator = Arc::new(match &settings.data_dir {
            Some(dir) => Evaluator::from_dir(dir),
            None => Evaluator::empty(),
        });

        let cancel = CancellationToken::new();
        let coordinator = TrainingCoordinator::new(
            devices.clone(),
            models.clone(),
            jobs.clone(),
            blob.clone(),
            heartbeat.clone(),
            evaluator,
            CoordinatorConfig {
                round_timeout: Duration::from_secs(settings.training_round_timeout_seconds),
                ..Default::default()
            },
            cancel.clone(),
        );

        let ctx = Arc::new(AppContext {
            devices,
            models,
            jobs,
            blob,
            heartbeat,
            settings,
        });
        Ok(App {
            ctx,
            coordinator,
            cancel,
        })
    }

    pub async fn run(self) -> Result<()> {
        let api_listener = TcpListener::bind(("0.0.0.0", self.ctx.settings.api_port))
            .await
            .context("failed to bind API port")?;
        let rpc_listener = TcpListener::bind(("0.0.0.0", self.ctx.settings.rpc_port))
            .await
            .context("failed to bind RPC port")?;
        let tls = rpc::maybe_tls_acceptor(&self.ctx.settings)?;
        info!(addr = %api_listener.local_addr()?, "operator API listening");

        let sweeper = tokio::spawn({
            let monitor = self.ctx.heartbeat.clone();
            let cancel = self.cancel.clone();
            async move { monitor.run_stale_device_sweep(cancel).await }
        });
        let coordinator = tokio::spawn({
            let coordinator = self.coordinator.clone();
            async move { coordinator.run().await }
        });
        let rpc_task = tokio::spawn(rpc::serve(
            self.ctx.clone(),
            rpc_listener,
            tls,
            self.cancel.clone(),
        ));
        let api_task = tokio::spawn({
            let router = api::router(self.ctx.clone());
            let cancel = self.cancel.clone();
            async move {
                axum::serve(api_listener, router)
                    .with_graceful_shutdown(async move { cancel.cancelled().await })
                    .await
            }
        });

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
            _ = self.cancel.cancelled() => {}
        }
        self.cancel.cancel();

        if tokio::time::timeout(SHUTDOWN_GRACE, async {
            let _ = tokio::join!(api_task, rpc_task, sweeper, coordinator);
        })
        .await
        .is_err()
        {
            warn!("shutdown grace period elapsed before all tasks drained");
        }
        info!("shutdown complete");
        Ok(())
    }
}
