use std::time::Duration;

use chrono::Utc;
use tokio::select;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use orchestra_core::{DeviceCommand, DeviceRecord, DeviceStatus, DeviceTelemetry};
use orchestra_store::{BlobStore, DeviceRepository, StoreError};

/// Per-device liveness with TTL, command delivery, and the stale-device
/// sweep. Liveness keys live in the blob store; the durable row is the
/// fallback when a key has expired.
#[derive(Clone)]
pub struct HeartbeatMonitor {
    blob: BlobStore,
    devices: DeviceRepository,
    interval: Duration,
    timeout: Duration,
}

impl HeartbeatMonitor {
    pub fn new(
        blob: BlobStore,
        devices: DeviceRepository,
        interval_seconds: u64,
        timeout_multiplier: u64,
    ) -> Self {
        HeartbeatMonitor {
            blob,
            devices,
            interval: Duration::from_secs(interval_seconds),
            timeout: Duration::from_secs(interval_seconds * timeout_multiplier),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Handle one inbound heartbeat: refresh the liveness key, bring an
    /// offline device back online (a plain heartbeat never downgrades
    /// `training`), and merge reported telemetry into the metrics map.
    pub async fn process_heartbeat(
        &self,
        device_id: Uuid,
        telemetry: &DeviceTelemetry,
    ) -> Result<Option<DeviceRecord>, StoreError> {
        self.blob
            .mark_heartbeat(device_id, self.timeout.as_secs())
            .await?;

        let Some(device) = self
            .devices
            .record_heartbeat(
                device_id,
                Some(DeviceStatus::Online),
                telemetry.battery_level,
                telemetry.battery_state,
            )
            .await?
        else {
            debug!(%device_id, "heartbeat from unregistered device");
            return Ok(None);
        };

        let reported = telemetry.to_metrics();
        if reported.is_empty() {
            return Ok(Some(device));
        }

        let mut metrics = device.metrics.clone();
        metrics.extend(reported);
        self.devices.update_metrics(device_id, &metrics).await?;
        Ok(Some(DeviceRecord { metrics, ..device }))
    }

    pub async fn queue_command(
        &self,
        device_id: Uuid,
        command: &DeviceCommand,
    ) -> Result<(), StoreError> {
        self.blob.queue_command(device_id, command).await
    }

    pub async fn pop_pending_command(
        &self,
        device_id: Uuid,
    ) -> Result<Option<DeviceCommand>, StoreError> {
        self.blob.pop_pending_command(device_id).await
    }

    /// Background sweep, one pass per heartbeat interval. Runs until the
    /// token cancels.
    pub async fn run_stale_device_sweep(&self, cancel: CancellationToken) {
        info!(timeout_seconds = self.timeout.as_secs(), "stale device sweep started");
        let mut tick = interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            select! {
                _ = cancel.cancelled() => {
                    info!("stale device sweep stopping");
                    return;
                }
                _ = tick.tick() => {}
            }
            if let Err(err) = self.sweep_once().await {
                warn!("stale device sweep failed: {err:#}");
            }
        }
    }

    /// Mark `online` devices `offline` when the liveness key has expired
    /// *and* the row itself is older than the timeout. Devices in
    /// `training` belong to the coordinator and are never touched here.
    async fn sweep_once(&self) -> Result<(), StoreError> {
        let devices = self.devices.list_all(Some(DeviceStatus::Online)).await?;
        for device in devices {
            if self.blob.heartbeat_alive(device.id).await? {
                continue;
            }
            let elapsed = (Utc::now() - device.last_seen_at)
                .to_std()
                .unwrap_or_default();
            if elapsed > self.timeout {
                self.devices
                    .update_status(device.id, DeviceStatus::Offline)
                    .await?;
                info!(
                    device_id = %device.id,
                    elapsed_seconds = elapsed.as_secs(),
                    "device marked offline"
                );
            }
        }
        Ok(())
    }
}
