use std::collections::BTreeMap;

use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use orchestra_core::{BatteryState, DeviceRecord, DeviceStatus, HardwareProfile};

use crate::error::StoreError;

const DEVICE_COLUMNS: &str = "id, name, device_model, os_version, chip, memory_bytes, cpu_cores, \
     gpu_cores, neural_engine_cores, battery_level, battery_state, status, metrics, \
     registered_at, last_seen_at";

pub struct NewDevice {
    pub id: Option<Uuid>,
    pub name: String,
    pub hardware: HardwareProfile,
}

/// Durable store of devices. Every update bumps `last_seen_at`.
#[derive(Clone)]
pub struct DeviceRepository {
    pool: PgPool,
}

impl DeviceRepository {
    pub fn new(pool: PgPool) -> Self {
        DeviceRepository { pool }
    }

    /// Insert a device, or refresh name/hardware when the id already
    /// exists (re-registration).
    pub async fn create(&self, device: NewDevice) -> Result<DeviceRecord, StoreError> {
        let id = device.id.unwrap_or_else(Uuid::new_v4);
        let hw = &device.hardware;
        let row = sqlx::query(&format!(
            "INSERT INTO devices (id, name, device_model, os_version, chip, memory_bytes, \
             cpu_cores, gpu_cores, neural_engine_cores, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (id) DO UPDATE SET \
             name = EXCLUDED.name, device_model = EXCLUDED.device_model, \
             os_version = EXCLUDED.os_version, chip = EXCLUDED.chip, \
             memory_bytes = EXCLUDED.memory_bytes, cpu_cores = EXCLUDED.cpu_cores, \
             gpu_cores = EXCLUDED.gpu_cores, neural_engine_cores = EXCLUDED.neural_engine_cores, \
             status = EXCLUDED.status, last_seen_at = now() \
             RETURNING {DEVICE_COLUMNS}"
        ))
        .bind(id)
        .bind(&device.name)
        .bind(&hw.device_model)
        .bind(&hw.os_version)
        .bind(&hw.chip)
        .bind(hw.memory_bytes)
        .bind(hw.cpu_cores)
        .bind(hw.gpu_cores)
        .bind(hw.neural_engine_cores)
        .bind(DeviceStatus::Online.as_str())
        .fetch_one(&self.pool)
        .await?;
        device_from_row(&row)
    }

    pub async fn get(&self, device_id: Uuid) -> Result<Option<DeviceRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE id = $1"
        ))
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(device_from_row).transpose()
    }

    pub async fn list_all(
        &self,
        status: Option<DeviceStatus>,
    ) -> Result<Vec<DeviceRecord>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {DEVICE_COLUMNS} FROM devices WHERE status = $1 \
                     ORDER BY registered_at DESC"
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {DEVICE_COLUMNS} FROM devices ORDER BY registered_at DESC"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(device_from_row).collect()
    }

    pub async fn update_status(
        &self,
        device_id: Uuid,
        status: DeviceStatus,
    ) -> Result<Option<DeviceRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE devices SET status = $2, last_seen_at = $3 WHERE id = $1 \
             RETURNING {DEVICE_COLUMNS}"
        ))
        .bind(device_id)
        .bind(status.as_str())
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(device_from_row).transpose()
    }

    /// Conditional reservation/release: flips status only when the row is
    /// still in `expected`, so a concurrent transition wins cleanly.
    pub async fn transition_status(
        &self,
        device_id: Uuid,
        expected: DeviceStatus,
        status: DeviceStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE devices SET status = $3, last_seen_at = $4 WHERE id = $1 AND status = $2",
        )
        .bind(device_id)
        .bind(expected.as_str())
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Heartbeat write: battery columns when reported, optional status
    /// transition, and a `last_seen_at` bump, in one statement. A
    /// heartbeat never downgrades a `training` device; the coordinator
    /// owns that status.
    pub async fn record_heartbeat(
        &self,
        device_id: Uuid,
        status: Option<DeviceStatus>,
        battery_level: Option<f64>,
        battery_state: Option<BatteryState>,
    ) -> Result<Option<DeviceRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE devices SET \
             status = CASE WHEN devices.status = 'training' THEN devices.status \
                           ELSE COALESCE($2, devices.status) END, \
             battery_level = COALESCE($3, battery_level), \
             battery_state = COALESCE($4, battery_state), \
             last_seen_at = $5 \
             WHERE id = $1 RETURNING {DEVICE_COLUMNS}"
        ))
        .bind(device_id)
        .bind(status.map(|s| s.as_str()))
        .bind(battery_level)
        .bind(battery_state.map(|s| s.as_str()))
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(device_from_row).transpose()
    }

    /// Store the full metric map and bump `last_seen_at`.
    pub async fn update_metrics(
        &self,
        device_id: Uuid,
        metrics: &BTreeMap<String, f64>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE devices SET metrics = $2, last_seen_at = $3 WHERE id = $1")
            .bind(device_id)
            .bind(serde_json::to_value(metrics)?)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, device_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM devices WHERE id = $1")
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn device_from_row(row: &PgRow) -> Result<DeviceRecord, StoreError> {
    let battery_state: Option<String> = row.try_get("battery_state")?;
    let status: String = row.try_get("status")?;
    let metrics: Option<serde_json::Value> = row.try_get("metrics")?;
    let metrics = match metrics {
        Some(value) => serde_json::from_value(value)?,
        None => BTreeMap::new(),
    };

    Ok(DeviceRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        hardware: HardwareProfile {
            device_model: row.try_get("device_model")?,
            os_version: row.try_get("os_version")?,
            chip: row.try_get("chip")?,
            memory_bytes: row.try_get("memory_bytes")?,
            cpu_cores: row.try_get("cpu_cores")?,
            gpu_cores: row.try_get("gpu_cores")?,
            neural_engine_cores: row.try_get("neural_engine_cores")?,
        },
        battery_level: row.try_get("battery_level")?,
        battery_state: battery_state
            .map(|s| s.parse().map_err(|_| StoreError::Corrupt(format!("battery_state {s:?}"))))
            .transpose()?,
        status: status
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("device status {status:?}")))?,
        metrics,
        registered_at: row.try_get("registered_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
    })
}
