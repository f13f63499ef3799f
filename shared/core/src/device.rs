use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OrchestraError;

/// Lifecycle status of an edge device.
///
/// `Training` is owned by the coordinator: heartbeats never downgrade it,
/// and every coordinator exit path releases it back to `Online`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Online,
    Offline,
    Training,
    Error,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Training => "training",
            DeviceStatus::Error => "error",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = OrchestraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(DeviceStatus::Online),
            "offline" => Ok(DeviceStatus::Offline),
            "training" => Ok(DeviceStatus::Training),
            "error" => Ok(DeviceStatus::Error),
            other => Err(OrchestraError::invalid_argument(format!(
                "unknown device status {other:?}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatteryState {
    #[default]
    Unknown,
    Charging,
    Discharging,
    Full,
    NotCharging,
}

impl BatteryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatteryState::Unknown => "unknown",
            BatteryState::Charging => "charging",
            BatteryState::Discharging => "discharging",
            BatteryState::Full => "full",
            BatteryState::NotCharging => "not_charging",
        }
    }

    /// Charging and full batteries earn the scheduler's battery bonus.
    pub fn is_powered(&self) -> bool {
        matches!(self, BatteryState::Charging | BatteryState::Full)
    }
}

impl FromStr for BatteryState {
    type Err = OrchestraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(BatteryState::Unknown),
            "charging" => Ok(BatteryState::Charging),
            "discharging" => Ok(BatteryState::Discharging),
            "full" => Ok(BatteryState::Full),
            "not_charging" => Ok(BatteryState::NotCharging),
            other => Err(OrchestraError::invalid_argument(format!(
                "unknown battery state {other:?}"
            ))),
        }
    }
}

/// Static hardware descriptor captured at registration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub device_model: String,
    pub os_version: String,
    pub chip: Option<String>,
    pub memory_bytes: Option<i64>,
    pub cpu_cores: Option<i32>,
    pub gpu_cores: Option<i32>,
    pub neural_engine_cores: Option<i32>,
}

/// Telemetry carried on a heartbeat. All pressure/usage values are scaled
/// 0..=1; absent fields mean the device did not report them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceTelemetry {
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub thermal_pressure: Option<f64>,
    pub battery_level: Option<f64>,
    pub battery_state: Option<BatteryState>,
    pub is_low_power_mode: Option<bool>,
}

impl DeviceTelemetry {
    /// Flatten the reported fields into metric-map entries. Flags are
    /// stored as 0.0/1.0 so the map stays a plain number map on every
    /// wire format.
    pub fn to_metrics(&self) -> BTreeMap<String, f64> {
        let mut metrics = BTreeMap::new();
        if let Some(v) = self.cpu_usage {
            metrics.insert("cpu_usage".to_string(), v);
        }
        if let Some(v) = self.memory_usage {
            metrics.insert("memory_usage".to_string(), v);
        }
        if let Some(v) = self.thermal_pressure {
            metrics.insert("thermal_pressure".to_string(), v);
        }
        if let Some(v) = self.is_low_power_mode {
            metrics.insert("is_low_power_mode".to_string(), if v { 1.0 } else { 0.0 });
        }
        metrics
    }
}

/// A registered device row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: Uuid,
    pub name: String,
    pub hardware: HardwareProfile,
    pub battery_level: Option<f64>,
    pub battery_state: Option<BatteryState>,
    pub status: DeviceStatus,
    pub metrics: BTreeMap<String, f64>,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl DeviceRecord {
    pub fn metric_f64(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).copied()
    }

    pub fn metric_flag(&self, key: &str) -> Option<bool> {
        self.metrics.get(key).map(|&v| v != 0.0)
    }
}
