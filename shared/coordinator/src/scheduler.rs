use serde::Deserialize;

use orchestra_core::DeviceRecord;

/// Relative weight of each sub-score in the final ranking.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoreWeights {
    pub battery: f64,
    pub thermal: f64,
    pub cpu_load: f64,
    pub memory_load: f64,
    pub hardware: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        ScoreWeights {
            battery: 0.35,
            thermal: 0.25,
            cpu_load: 0.20,
            memory_load: 0.10,
            hardware: 0.10,
        }
    }
}

impl ScoreWeights {
    fn apply_overrides(&mut self, overrides: &std::collections::BTreeMap<String, f64>) {
        for (key, &value) in overrides {
            match key.as_str() {
                "battery" => self.battery = value,
                "thermal" => self.thermal = value,
                "cpu_load" => self.cpu_load = value,
                "memory_load" => self.memory_load = value,
                "hardware" => self.hardware = value,
                _ => {}
            }
        }
    }
}

/// Selection policy for one job, built from the defaults plus the job's
/// `config.scheduler` block.
#[derive(Clone, Debug, PartialEq)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub target_devices: Option<usize>,
    pub min_battery: f64,
    pub allow_low_power_mode: bool,
    pub max_thermal_pressure: f64,
    pub max_cpu_usage: f64,
    pub weights: ScoreWeights,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            enabled: false,
            target_devices: None,
            min_battery: 0.20,
            allow_low_power_mode: false,
            max_thermal_pressure: 0.70,
            max_cpu_usage: 0.90,
            weights: ScoreWeights::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SchedulerOverrides {
    enabled: Option<bool>,
    target_devices: Option<usize>,
    min_battery: Option<f64>,
    allow_low_power_mode: Option<bool>,
    max_thermal_pressure: Option<f64>,
    max_cpu_usage: Option<f64>,
    #[serde(default)]
    weights: std::collections::BTreeMap<String, f64>,
}

impl SchedulerConfig {
    /// Parse the `scheduler` block of a job's config value. Missing or
    /// malformed blocks fall back to the defaults; unknown weight keys are
    /// ignored.
    pub fn from_job_config(config: Option<&serde_json::Value>) -> Self {
        let Some(block) = config.and_then(|c| c.get("scheduler")) else {
            return Self::default();
        };
        let overrides: SchedulerOverrides =
            serde_json::from_value(block.clone()).unwrap_or_default();

        let mut cfg = Self::default();
        if let Some(enabled) = overrides.enabled {
            cfg.enabled = enabled;
        }
        cfg.target_devices = overrides.target_devices;
        if let Some(v) = overrides.min_battery {
            cfg.min_battery = v;
        }
        if let Some(v) = overrides.allow_low_power_mode {
            cfg.allow_low_power_mode = v;
        }
        if let Some(v) = overrides.max_thermal_pressure {
            cfg.max_thermal_pressure = v;
        }
        if let Some(v) = overrides.max_cpu_usage {
            cfg.max_cpu_usage = v;
        }
        cfg.weights.apply_overrides(&overrides.weights);
        cfg
    }
}

fn is_eligible(device: &DeviceRecord, cfg: &SchedulerConfig) -> bool {
    if let Some(battery) = device.battery_level {
        if battery < cfg.min_battery {
            return false;
        }
    }
    if device.metric_flag("is_low_power_mode").unwrap_or(false) && !cfg.allow_low_power_mode {
        return false;
    }
    if let Some(thermal) = device.metric_f64("thermal_pressure") {
        if thermal > cfg.max_thermal_pressure {
            return false;
        }
    }
    if let Some(cpu) = device.metric_f64("cpu_usage") {
        if cpu > cfg.max_cpu_usage {
            return false;
        }
    }
    true
}

fn score_device(
    device: &DeviceRecord,
    cfg: &SchedulerConfig,
    pool_max_neural_cores: i64,
    pool_max_memory: i64,
) -> f64 {
    let w = &cfg.weights;

    let battery_score = match device.battery_level {
        Some(level) => {
            let bonus = if device.battery_state.map(|s| s.is_powered()).unwrap_or(false) {
                0.15
            } else {
                0.0
            };
            (level + bonus).min(1.0)
        }
        None => 0.5,
    };

    let thermal_score = device
        .metric_f64("thermal_pressure")
        .map(|t| 1.0 - t)
        .unwrap_or(0.5);
    let cpu_score = device
        .metric_f64("cpu_usage")
        .map(|c| 1.0 - c)
        .unwrap_or(0.5);
    let memory_score = device
        .metric_f64("memory_usage")
        .map(|m| 1.0 - m)
        .unwrap_or(0.5);

    let neural_cores = device.hardware.neural_engine_cores.unwrap_or(0) as i64;
    let memory_bytes = device.hardware.memory_bytes.unwrap_or(0);
    let neural_norm = if pool_max_neural_cores > 0 {
        neural_cores as f64 / pool_max_neural_cores as f64
    } else {
        0.5
    };
    let memory_norm = if pool_max_memory > 0 {
        memory_bytes as f64 / pool_max_memory as f64
    } else {
        0.5
    };
    let hardware_score = (neural_norm + memory_norm) / 2.0;

    w.battery * battery_score
        + w.thermal * thermal_score
        + w.cpu_load * cpu_score
        + w.memory_load * memory_score
        + w.hardware * hardware_score
}

/// Pick the devices for one round. Returns `None` when the eligible pool
/// is smaller than `min_devices`; the caller waits and retries.
///
/// With the scheduler disabled the input pool is returned verbatim.
/// Missing metrics never disqualify a device; they score the neutral 0.5.
pub fn select_devices(
    devices: &[DeviceRecord],
    cfg: &SchedulerConfig,
    min_devices: usize,
) -> Option<Vec<DeviceRecord>> {
    if !cfg.enabled {
        return Some(devices.to_vec());
    }

    let eligible: Vec<&DeviceRecord> = devices.iter().filter(|d| is_eligible(d, cfg)).collect();
    if eligible.len() < min_devices {
        return None;
    }

    let pool_max_neural_cores = eligible
        .iter()
        .map(|d| d.hardware.neural_engine_cores.unwrap_or(0) as i64)
        .max()
        .unwrap_or(0);
    let pool_max_memory = eligible
        .iter()
        .map(|d| d.hardware.memory_bytes.unwrap_or(0))
        .max()
        .unwrap_or(0);

    let mut scored: Vec<(&DeviceRecord, f64)> = eligible
        .into_iter()
        .map(|d| {
            let score = score_device(d, cfg, pool_max_neural_cores, pool_max_memory);
            (d, score)
        })
        .collect();
    // Stable sort keeps the incoming order for equal scores.
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));

    let selected: Vec<DeviceRecord> = match cfg.target_devices {
        Some(target) => scored
            .into_iter()
            .take(target.max(min_devices))
            .map(|(d, _)| d.clone())
            .collect(),
        None => scored.into_iter().map(|(d, _)| d.clone()).collect(),
    };
    Some(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestra_core::{BatteryState, DeviceStatus, HardwareProfile};
    use chrono::Utc;
    use uuid::Uuid;

    fn device(name: &str) -> DeviceRecord {
        DeviceRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            hardware: HardwareProfile::default(),
            battery_level: None,
            battery_state: None,
            status: DeviceStatus::Online,
            metrics: Default::default(),
            registered_at: Utc::now(),
            last_seen_at: Utc::now(),
        }
    }

    fn with_metric(mut d: DeviceRecord, key: &str, value: f64) -> DeviceRecord {
        d.metrics.insert(key.to_string(), value);
        d
    }

    fn enabled_config() -> SchedulerConfig {
        SchedulerConfig {
            enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn disabled_scheduler_returns_pool_verbatim() {
        let pool = vec![device("a"), device("b")];
        let selected = select_devices(&pool, &SchedulerConfig::default(), 5).unwrap();
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].name, "a");
    }

    #[test]
    fn low_battery_is_filtered() {
        let mut low = device("low");
        low.battery_level = Some(0.10);
        let mut ok = device("ok");
        ok.battery_level = Some(0.80);

        let selected = select_devices(&[low, ok], &enabled_config(), 1).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "ok");
    }

    #[test]
    fn low_power_mode_is_filtered_even_when_otherwise_ideal() {
        let mut ideal = device("lpm");
        ideal.battery_level = Some(1.0);
        ideal.battery_state = Some(BatteryState::Charging);
        let ideal = with_metric(ideal, "is_low_power_mode", 1.0);

        assert!(select_devices(&[ideal.clone()], &enabled_config(), 1).is_none());

        let mut allow = enabled_config();
        allow.allow_low_power_mode = true;
        assert_eq!(select_devices(&[ideal], &allow, 1).unwrap().len(), 1);
    }

    #[test]
    fn thermal_and_cpu_limits_are_enforced() {
        let hot = with_metric(device("hot"), "thermal_pressure", 0.95);
        let busy = with_metric(device("busy"), "cpu_usage", 0.99);
        let fine = device("fine");

        let selected = select_devices(&[hot, busy, fine], &enabled_config(), 1).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "fine");
    }

    #[test]
    fn insufficient_pool_returns_none() {
        let mut low = device("low");
        low.battery_level = Some(0.05);
        assert!(select_devices(&[low], &enabled_config(), 1).is_none());
    }

    #[test]
    fn missing_metrics_are_eligible_and_score_neutral() {
        let bare = device("bare");
        let selected = select_devices(&[bare], &enabled_config(), 1).unwrap();
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn charging_bonus_ranks_above_discharging() {
        let mut charging = device("charging");
        charging.battery_level = Some(0.70);
        charging.battery_state = Some(BatteryState::Charging);

        let mut discharging = device("discharging");
        discharging.battery_level = Some(0.70);
        discharging.battery_state = Some(BatteryState::Discharging);

        let selected =
            select_devices(&[discharging, charging], &enabled_config(), 1).unwrap();
        assert_eq!(selected[0].name, "charging");
    }

    #[test]
    fn battery_score_caps_at_one() {
        let mut full = device("full");
        full.battery_level = Some(1.0);
        full.battery_state = Some(BatteryState::Full);

        let mut near = device("near");
        near.battery_level = Some(0.97);
        near.battery_state = Some(BatteryState::Charging);

        // Both saturate at 1.0; the stable sort keeps input order.
        let selected = select_devices(&[full, near], &enabled_config(), 1).unwrap();
        assert_eq!(selected[0].name, "full");
    }

    #[test]
    fn improving_a_sub_score_never_lowers_rank() {
        let cool = with_metric(device("cool"), "thermal_pressure", 0.10);
        let warm = with_metric(device("warm"), "thermal_pressure", 0.50);

        let selected = select_devices(&[warm, cool], &enabled_config(), 1).unwrap();
        assert_eq!(selected[0].name, "cool");
    }

    #[test]
    fn hardware_normalization_prefers_bigger_devices() {
        let mut big = device("big");
        big.hardware.neural_engine_cores = Some(16);
        big.hardware.memory_bytes = Some(8 << 30);

        let mut small = device("small");
        small.hardware.neural_engine_cores = Some(4);
        small.hardware.memory_bytes = Some(2 << 30);

        let selected = select_devices(&[small, big], &enabled_config(), 1).unwrap();
        assert_eq!(selected[0].name, "big");
    }

    #[test]
    fn target_devices_takes_top_n_but_at_least_min() {
        let pool: Vec<DeviceRecord> = (0..5).map(|i| device(&format!("d{i}"))).collect();

        let mut cfg = enabled_config();
        cfg.target_devices = Some(2);
        assert_eq!(select_devices(&pool, &cfg, 1).unwrap().len(), 2);

        // target below min_devices is clamped up
        assert_eq!(select_devices(&pool, &cfg, 4).unwrap().len(), 4);
    }

    #[test]
    fn config_overrides_are_applied() {
        let config = serde_json::json!({
            "scheduler": {
                "enabled": true,
                "min_battery": 0.5,
                "target_devices": 3,
                "weights": { "battery": 0.9, "bogus": 1.0 }
            }
        });
        let cfg = SchedulerConfig::from_job_config(Some(&config));
        assert!(cfg.enabled);
        assert_eq!(cfg.min_battery, 0.5);
        assert_eq!(cfg.target_devices, Some(3));
        assert_eq!(cfg.weights.battery, 0.9);
        assert_eq!(cfg.weights.thermal, 0.25);
    }

    #[test]
    fn missing_scheduler_block_uses_defaults() {
        assert_eq!(
            SchedulerConfig::from_job_config(None),
            SchedulerConfig::default()
        );
        assert_eq!(
            SchedulerConfig::from_job_config(Some(&serde_json::json!({"other": 1}))),
            SchedulerConfig::default()
        );
    }
}
