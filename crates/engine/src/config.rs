//! TOML config file loading, validation, and database seeding for units,
//! plants, sensors and pump calibrations, plus the engine's tunables.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;

use crate::db::{Db, PlantConfig, SensorConfig, UnitConfig};
use crate::drydown::DrydownSettings;
use crate::duration::DurationLimits;
use crate::executor::ExecutionSettings;
use crate::manual::ManualSettings;
use crate::outcome::OutcomeSettings;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub units: Vec<UnitEntry>,
    #[serde(default)]
    pub plants: Vec<PlantEntry>,
    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
    #[serde(default)]
    pub calibrations: Vec<CalibrationEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub tick_interval_sec: u64,
    pub claim_batch_limit: i64,
    pub default_duration_sec: i64,
    pub min_duration_sec: i64,
    pub max_duration_sec: i64,
    pub lock_margin_sec: i64,
    pub post_delay_sec: i64,
    pub attribution_epsilon: f64,
    pub hysteresis_margin: f64,
    pub request_ttl_min: i64,
    pub max_attempts: i64,
    pub retry_backoff_sec: i64,
    pub manual_rise_threshold: f64,
    pub manual_prompt_cooldown_min: i64,
    pub manual_recent_activity_min: i64,
    pub manual_pre_window_min: i64,
    pub manual_settle_delay_sec: i64,
    pub drydown_lookback_hours: i64,
    pub drydown_max_gap_hours: i64,
    pub drydown_min_samples: usize,
    pub stale_reading_min: i64,
    pub default_flow_rate_ml_per_sec: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tick_interval_sec: 30,
            claim_batch_limit: 10,
            default_duration_sec: 30,
            min_duration_sec: 5,
            max_duration_sec: 900,
            lock_margin_sec: 120,
            post_delay_sec: 900,
            attribution_epsilon: 0.5,
            hysteresis_margin: 5.0,
            request_ttl_min: 360,
            max_attempts: 5,
            retry_backoff_sec: 300,
            manual_rise_threshold: 5.0,
            manual_prompt_cooldown_min: 60,
            manual_recent_activity_min: 90,
            manual_pre_window_min: 15,
            manual_settle_delay_sec: 900,
            drydown_lookback_hours: 72,
            drydown_max_gap_hours: 24,
            drydown_min_samples: 4,
            stale_reading_min: 30,
            default_flow_rate_ml_per_sec: 10.0,
        }
    }
}

impl EngineSettings {
    pub fn stale_after_sec(&self) -> i64 {
        self.stale_reading_min * 60
    }

    pub fn request_ttl_sec(&self) -> i64 {
        self.request_ttl_min * 60
    }

    pub fn duration_limits(&self) -> DurationLimits {
        DurationLimits {
            default_seconds: self.default_duration_sec,
            min_seconds: self.min_duration_sec,
            max_seconds: self.max_duration_sec,
            default_flow_rate: self.default_flow_rate_ml_per_sec,
        }
    }

    pub fn execution(&self) -> ExecutionSettings {
        ExecutionSettings {
            lock_margin_sec: self.lock_margin_sec,
            retry_backoff_sec: self.retry_backoff_sec,
            max_attempts: self.max_attempts,
        }
    }

    pub fn outcome(&self) -> OutcomeSettings {
        OutcomeSettings {
            post_delay_sec: self.post_delay_sec,
            epsilon: self.attribution_epsilon,
            hysteresis_margin: self.hysteresis_margin,
        }
    }

    pub fn drydown(&self) -> DrydownSettings {
        DrydownSettings {
            lookback_hours: self.drydown_lookback_hours,
            max_gap_hours: self.drydown_max_gap_hours,
            min_samples: self.drydown_min_samples,
            post_delay_sec: self.post_delay_sec,
        }
    }

    pub fn manual(&self) -> ManualSettings {
        ManualSettings {
            rise_threshold: self.manual_rise_threshold,
            prompt_cooldown_sec: self.manual_prompt_cooldown_min * 60,
            recent_activity_sec: self.manual_recent_activity_min * 60,
            pre_window_sec: self.manual_pre_window_min * 60,
            settle_delay_sec: self.manual_settle_delay_sec,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnitEntry {
    pub unit_id: String,
    pub name: String,
    pub user_id: String,
    #[serde(default)]
    pub pump_actuator_id: Option<String>,
    #[serde(default)]
    pub feedback_enabled: bool,
    #[serde(default)]
    pub ml_learning_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlantEntry {
    pub plant_id: String,
    pub unit_id: String,
    pub name: String,
    #[serde(default)]
    pub sensor_id: Option<String>,
    pub threshold: f64,
    pub target_moisture: f64,
    pub ml_per_point: f64,
    #[serde(default)]
    pub valve_actuator_id: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorEntry {
    pub sensor_id: String,
    pub node_id: String,
    pub raw_dry: i64,
    pub raw_wet: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalibrationEntry {
    pub actuator_id: String,
    pub flow_rate_ml_per_sec: f64,
}

/// Maximum single-ended reading from the ADS1115 (15-bit unsigned).
const ADS1115_MAX: i64 = 32767;

/// Anything longer than this is a stuck actuator, not a watering.
const MAX_DURATION_CEILING_SEC: i64 = 3600;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn blank(s: &str) -> bool {
    s.trim().is_empty()
}

fn blank_opt(s: &Option<String>) -> bool {
    s.as_deref().is_some_and(blank)
}

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_engine(&mut errors);
        self.validate_units(&mut errors);
        self.validate_sensors(&mut errors);
        self.validate_plants(&mut errors);
        self.validate_calibrations(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_engine(&self, errors: &mut Vec<String>) {
        let e = &self.engine;
        let positive: [(&str, i64); 14] = [
            ("claim_batch_limit", e.claim_batch_limit),
            ("min_duration_sec", e.min_duration_sec),
            ("default_duration_sec", e.default_duration_sec),
            ("max_duration_sec", e.max_duration_sec),
            ("request_ttl_min", e.request_ttl_min),
            ("max_attempts", e.max_attempts),
            ("retry_backoff_sec", e.retry_backoff_sec),
            ("manual_prompt_cooldown_min", e.manual_prompt_cooldown_min),
            ("manual_recent_activity_min", e.manual_recent_activity_min),
            ("manual_pre_window_min", e.manual_pre_window_min),
            ("drydown_lookback_hours", e.drydown_lookback_hours),
            ("drydown_max_gap_hours", e.drydown_max_gap_hours),
            ("stale_reading_min", e.stale_reading_min),
            ("lock_margin_sec", e.lock_margin_sec),
        ];
        for (name, v) in positive {
            if v <= 0 {
                errors.push(format!("engine: {name} must be positive, got {v}"));
            }
        }
        for (name, v) in [
            ("post_delay_sec", e.post_delay_sec),
            ("manual_settle_delay_sec", e.manual_settle_delay_sec),
        ] {
            if v < 0 {
                errors.push(format!("engine: {name} must not be negative, got {v}"));
            }
        }

        if e.tick_interval_sec == 0 {
            errors.push("engine: tick_interval_sec must be positive".into());
        }
        if e.drydown_min_samples == 0 {
            errors.push("engine: drydown_min_samples must be at least 1".into());
        }

        if !(e.min_duration_sec <= e.default_duration_sec && e.default_duration_sec <= e.max_duration_sec) {
            errors.push(format!(
                "engine: durations must satisfy min ({}) <= default ({}) <= max ({})",
                e.min_duration_sec, e.default_duration_sec, e.max_duration_sec
            ));
        }
        if e.max_duration_sec > MAX_DURATION_CEILING_SEC {
            errors.push(format!(
                "engine: max_duration_sec {} exceeds the {MAX_DURATION_CEILING_SEC} s ceiling",
                e.max_duration_sec
            ));
        }

        if !(e.attribution_epsilon >= 0.0) {
            errors.push(format!(
                "engine: attribution_epsilon must not be negative, got {}",
                e.attribution_epsilon
            ));
        }
        if !(e.hysteresis_margin >= 0.0) {
            errors.push(format!(
                "engine: hysteresis_margin must not be negative, got {}",
                e.hysteresis_margin
            ));
        }
        if !(e.manual_rise_threshold > 0.0) {
            errors.push(format!(
                "engine: manual_rise_threshold must be positive, got {}",
                e.manual_rise_threshold
            ));
        }
        if !(e.default_flow_rate_ml_per_sec > 0.0) {
            errors.push(format!(
                "engine: default_flow_rate_ml_per_sec must be positive, got {}",
                e.default_flow_rate_ml_per_sec
            ));
        }
    }

    fn validate_units(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, u) in self.units.iter().enumerate() {
            let ctx = || {
                if u.unit_id.is_empty() {
                    format!("units[{i}]")
                } else {
                    format!("unit '{}'", u.unit_id)
                }
            };

            if blank(&u.unit_id) {
                errors.push(format!("{}: unit_id is empty", ctx()));
            } else if !seen_ids.insert(&u.unit_id) {
                errors.push(format!("{}: duplicate unit_id", ctx()));
            }
            if blank(&u.name) {
                errors.push(format!("{}: name is empty", ctx()));
            }
            if blank(&u.user_id) {
                errors.push(format!("{}: user_id is empty", ctx()));
            }
            if blank_opt(&u.pump_actuator_id) {
                errors.push(format!("{}: pump_actuator_id is blank (omit it instead)", ctx()));
            }
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, s) in self.sensors.iter().enumerate() {
            let ctx = || {
                if s.sensor_id.is_empty() {
                    format!("sensors[{i}]")
                } else {
                    format!("sensor '{}'", s.sensor_id)
                }
            };

            if blank(&s.sensor_id) {
                errors.push(format!("{}: sensor_id is empty", ctx()));
            } else if !seen_ids.insert(&s.sensor_id) {
                errors.push(format!("{}: duplicate sensor_id", ctx()));
            }
            if blank(&s.node_id) {
                errors.push(format!("{}: node_id is empty", ctx()));
            }

            if s.raw_dry < 0 || s.raw_dry > ADS1115_MAX {
                errors.push(format!(
                    "{}: raw_dry {} out of ADS1115 range [0, {ADS1115_MAX}]",
                    ctx(),
                    s.raw_dry
                ));
            }
            if s.raw_wet < 0 || s.raw_wet > ADS1115_MAX {
                errors.push(format!(
                    "{}: raw_wet {} out of ADS1115 range [0, {ADS1115_MAX}]",
                    ctx(),
                    s.raw_wet
                ));
            }
            if s.raw_dry == s.raw_wet {
                errors.push(format!(
                    "{}: raw_dry and raw_wet are both {}, calibration range is zero",
                    ctx(),
                    s.raw_dry
                ));
            }
        }
    }

    fn validate_plants(&self, errors: &mut Vec<String>) {
        let unit_ids: HashSet<&str> = self.units.iter().map(|u| u.unit_id.as_str()).collect();
        let sensor_ids: HashSet<&str> = self.sensors.iter().map(|s| s.sensor_id.as_str()).collect();
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, p) in self.plants.iter().enumerate() {
            let ctx = || {
                if p.plant_id.is_empty() {
                    format!("plants[{i}]")
                } else {
                    format!("plant '{}'", p.plant_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if blank(&p.plant_id) {
                errors.push(format!("{}: plant_id is empty", ctx()));
            } else if !seen_ids.insert(&p.plant_id) {
                errors.push(format!("{}: duplicate plant_id", ctx()));
            }
            if blank(&p.name) {
                errors.push(format!("{}: name is empty", ctx()));
            }
            if !unit_ids.contains(p.unit_id.as_str()) {
                errors.push(format!(
                    "{}: unit_id '{}' does not match any defined unit",
                    ctx(),
                    p.unit_id
                ));
            }
            if let Some(sensor_id) = &p.sensor_id {
                if !sensor_ids.contains(sensor_id.as_str()) {
                    errors.push(format!(
                        "{}: sensor_id '{sensor_id}' does not match any defined sensor",
                        ctx()
                    ));
                }
            }
            if blank_opt(&p.valve_actuator_id) {
                errors.push(format!("{}: valve_actuator_id is blank (omit it instead)", ctx()));
            }

            // ── Moisture bounds (percent) ───────────────────────
            if !(0.0..=100.0).contains(&p.threshold) {
                errors.push(format!(
                    "{}: threshold {} out of range [0, 100]",
                    ctx(),
                    p.threshold
                ));
            }
            if !(0.0..=100.0).contains(&p.target_moisture) {
                errors.push(format!(
                    "{}: target_moisture {} out of range [0, 100]",
                    ctx(),
                    p.target_moisture
                ));
            }
            if p.target_moisture <= p.threshold {
                errors.push(format!(
                    "{}: target_moisture ({}) must be greater than threshold ({})",
                    ctx(),
                    p.target_moisture,
                    p.threshold
                ));
            }
            if !(p.ml_per_point > 0.0) {
                errors.push(format!(
                    "{}: ml_per_point must be positive, got {}",
                    ctx(),
                    p.ml_per_point
                ));
            }
        }
    }

    fn validate_calibrations(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, c) in self.calibrations.iter().enumerate() {
            if blank(&c.actuator_id) {
                errors.push(format!("calibrations[{i}]: actuator_id is empty"));
            } else if !seen_ids.insert(&c.actuator_id) {
                errors.push(format!(
                    "calibration '{}': duplicate actuator_id",
                    c.actuator_id
                ));
            }
            if !(c.flow_rate_ml_per_sec > 0.0) {
                errors.push(format!(
                    "calibration '{}': flow_rate_ml_per_sec must be positive, got {}",
                    c.actuator_id, c.flow_rate_ml_per_sec
                ));
            }
        }
    }

    /// Every actuator id named anywhere in the config.
    pub fn actuator_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .units
            .iter()
            .filter_map(|u| u.pump_actuator_id.clone())
            .chain(self.plants.iter().filter_map(|p| p.valve_actuator_id.clone()))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert sensors, units, plants and calibrations into the database, in
/// foreign-key order.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for s in &config.sensors {
        db.upsert_sensor(&SensorConfig {
            sensor_id: s.sensor_id.clone(),
            node_id: s.node_id.clone(),
            raw_dry: s.raw_dry,
            raw_wet: s.raw_wet,
        })
        .await
        .with_context(|| format!("failed to upsert sensor '{}'", s.sensor_id))?;
    }

    for u in &config.units {
        db.upsert_unit(&UnitConfig {
            unit_id: u.unit_id.clone(),
            name: u.name.clone(),
            user_id: u.user_id.clone(),
            pump_actuator_id: u.pump_actuator_id.clone(),
            feedback_enabled: u.feedback_enabled,
            ml_learning_enabled: u.ml_learning_enabled,
        })
        .await
        .with_context(|| format!("failed to upsert unit '{}'", u.unit_id))?;
    }

    for p in &config.plants {
        db.upsert_plant(&PlantConfig {
            plant_id: p.plant_id.clone(),
            unit_id: p.unit_id.clone(),
            name: p.name.clone(),
            sensor_id: p.sensor_id.clone(),
            threshold: p.threshold,
            target_moisture: p.target_moisture,
            ml_per_point: p.ml_per_point,
            valve_actuator_id: p.valve_actuator_id.clone(),
            active: p.active,
        })
        .await
        .with_context(|| format!("failed to upsert plant '{}'", p.plant_id))?;
    }

    for c in &config.calibrations {
        db.upsert_calibration(&c.actuator_id, c.flow_rate_ml_per_sec)
            .await
            .with_context(|| format!("failed to upsert calibration '{}'", c.actuator_id))?;
    }

    tracing::info!(
        units = config.units.len(),
        plants = config.plants.len(),
        sensors = config.sensors.len(),
        calibrations = config.calibrations.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
