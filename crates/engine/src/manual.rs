//! Manual irrigation: spotting hand watering on plants the engine does not
//! water itself, logging it when the user confirms, and capturing the
//! settled outcome the same way automatic runs are captured.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::db::{Db, PlantConfig};
use crate::drydown::{DrydownEstimator, Prediction};
use crate::logs::{ManualLog, NewManualLog};
use crate::notify::Notifier;
use crate::outcome::CaptureReport;
use crate::plants::PlantLookup;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ManualSettings {
    /// Moisture points between two readings that look like watering.
    pub rise_threshold: f64,
    pub prompt_cooldown_sec: i64,
    pub recent_activity_sec: i64,
    pub pre_window_sec: i64,
    pub settle_delay_sec: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WateringEvent {
    pub watered_at: Option<i64>,
    pub amount_ml: Option<f64>,
    pub notes: Option<String>,
}

pub struct ManualIrrigation {
    db: Db,
    plants: Arc<dyn PlantLookup>,
    notifier: Arc<dyn Notifier>,
    drydown: DrydownEstimator,
    settings: ManualSettings,
    /// Last moisture seen per sensor, this process only.
    last_seen: Mutex<HashMap<String, f64>>,
}

impl ManualIrrigation {
    pub fn new(
        db: Db,
        plants: Arc<dyn PlantLookup>,
        notifier: Arc<dyn Notifier>,
        drydown: DrydownEstimator,
        settings: ManualSettings,
    ) -> Self {
        Self {
            db,
            plants,
            notifier,
            drydown,
            settings,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    // ----------------------------
    // Detection
    // ----------------------------

    /// Feeds one calibrated reading. Returns the plants that were prompted.
    pub async fn on_reading(&self, sensor_id: &str, moisture: f64, now: i64) -> Vec<String> {
        let previous = match self.last_seen.lock() {
            Ok(mut map) => map.insert(sensor_id.to_string(), moisture),
            Err(_) => return Vec::new(),
        };
        let Some(previous) = previous else {
            return Vec::new();
        };
        let rise = moisture - previous;
        if rise <= self.settings.rise_threshold {
            return Vec::new();
        }

        let plants = match self.db.plants_for_sensor(sensor_id).await {
            Ok(p) => p,
            Err(e) => {
                warn!(sensor = %sensor_id, "manual: plant lookup failed: {e:#}");
                return Vec::new();
            }
        };

        let mut prompted = Vec::new();
        for plant in plants.iter().filter(|p| p.active) {
            match self.maybe_prompt(plant, rise, now).await {
                Ok(true) => prompted.push(plant.plant_id.clone()),
                Ok(false) => {}
                Err(e) => warn!(plant = %plant.plant_id, "manual: prompt check failed: {e:#}"),
            }
        }
        prompted
    }

    async fn maybe_prompt(&self, plant: &PlantConfig, rise: f64, now: i64) -> Result<bool> {
        if plant.valve_actuator_id.is_some() {
            debug!(plant = %plant.plant_id, "manual: plant has a valve, skipping");
            return Ok(false);
        }
        let unit = self
            .db
            .get_unit(&plant.unit_id)
            .await?
            .ok_or_else(|| anyhow!("unknown unit '{}'", plant.unit_id))?;
        if unit.pump_actuator_id.is_some() {
            debug!(plant = %plant.plant_id, "manual: unit has a pump, skipping");
            return Ok(false);
        }

        if let Some(last) = self.db.last_manual_prompt(&plant.plant_id).await? {
            if now - last < self.settings.prompt_cooldown_sec {
                debug!(plant = %plant.plant_id, "manual: prompt cooling down");
                return Ok(false);
            }
        }

        let since = now - self.settings.recent_activity_sec;
        if self.db.has_recent_activity(&unit.unit_id, &plant.plant_id, since).await? {
            debug!(plant = %plant.plant_id, "manual: recent watering already known");
            return Ok(false);
        }

        self.notifier
            .send_notification(
                &unit.user_id,
                &format!("Did you water {}?", plant.name),
                &format!(
                    "Moisture for {} rose by {rise:.1} points. Log the watering so future predictions stay accurate.",
                    plant.name
                ),
            )
            .await?;
        self.db.set_manual_prompt(&plant.plant_id, now).await?;
        info!(plant = %plant.plant_id, unit = %unit.unit_id, rise, "manual watering prompt sent");
        Ok(true)
    }

    // ----------------------------
    // Logging
    // ----------------------------

    /// Records a user-declared watering. The "before" moisture is the latest
    /// reading in the pre-window ending at the watering time.
    pub async fn log_watering_event(&self, plant_id: &str, event: &WateringEvent, now: i64) -> Result<i64> {
        let plant = self
            .db
            .get_plant_config(plant_id)
            .await?
            .ok_or_else(|| anyhow!("unknown plant '{plant_id}'"))?;
        let unit = self
            .db
            .get_unit(&plant.unit_id)
            .await?
            .ok_or_else(|| anyhow!("unknown unit '{}'", plant.unit_id))?;

        let watered_at = event.watered_at.unwrap_or(now);
        let pre_moisture = match &plant.sensor_id {
            Some(sensor_id) => self
                .db
                .latest_reading_between(sensor_id, watered_at - self.settings.pre_window_sec, watered_at)
                .await?
                .map(|r| r.moisture),
            None => None,
        };

        let id = self
            .db
            .create_manual_log(
                &NewManualLog {
                    unit_id: unit.unit_id.clone(),
                    plant_id: plant.plant_id.clone(),
                    user_id: unit.user_id.clone(),
                    watered_at,
                    amount_ml: event.amount_ml,
                    notes: event.notes.clone(),
                    pre_moisture,
                    settle_delay_s: self.settings.settle_delay_sec,
                },
                now,
            )
            .await?;
        info!(plant = %plant_id, log_id = id, watered_at, pre_moisture = ?pre_moisture, "manual watering logged");
        Ok(id)
    }

    // ----------------------------
    // Outcome capture
    // ----------------------------

    pub async fn capture_manual_outcomes(&self, now: i64) -> CaptureReport {
        let mut report = CaptureReport::default();
        let due = match self.db.pending_manual_capture(now).await {
            Ok(d) => d,
            Err(e) => {
                warn!("manual: listing pending captures failed: {e:#}");
                return report;
            }
        };
        report.due = due.len();

        for log in &due {
            match self.capture_one(log, now).await {
                Ok(true) => report.captured += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(log_id = log.id, "manual: capture failed: {e:#}");
                    report.skipped += 1;
                }
            }
        }
        report
    }

    async fn capture_one(&self, log: &ManualLog, now: i64) -> Result<bool> {
        let Some(plant) = self.plants.get_plant(&log.plant_id, &log.unit_id, now).await? else {
            return Ok(false);
        };
        let post = match (plant.moisture_level, plant.moisture_at) {
            (Some(m), Some(ts)) if ts > log.watered_at => m,
            _ => {
                debug!(log_id = log.id, "manual: no reading since watering yet");
                return Ok(false);
            }
        };

        let delta = log.pre_moisture.map(|pre| post - pre);
        if !self.db.record_manual_capture(log.id, post, delta, now).await? {
            return Ok(false);
        }
        info!(log_id = log.id, plant = %log.plant_id, post_moisture = post, delta = ?delta, "manual outcome captured");

        let model = match self
            .drydown
            .update(&log.plant_id, self.drydown.lookback_hours(), now)
            .await
        {
            Ok(m) => m,
            Err(e) => {
                warn!(plant = %log.plant_id, "manual: dry-down refresh failed: {e:#}");
                return Ok(true);
            }
        };

        let prediction = self
            .drydown
            .predict(&log.plant_id, plant.threshold, post, model.drydown_rate_per_hour, now)
            .await?;
        if let Prediction::Due { hours_until, predicted_at } = prediction {
            let when = OffsetDateTime::from_unix_timestamp(predicted_at)
                .ok()
                .and_then(|t| t.format(&Rfc3339).ok())
                .unwrap_or_else(|| predicted_at.to_string());
            if let Err(e) = self
                .notifier
                .send_notification(
                    &log.user_id,
                    &format!("Next watering for {}", plant.name),
                    &format!("{} should need water in about {hours_until:.1} h ({when}).", plant.name),
                )
                .await
            {
                warn!(plant = %log.plant_id, "manual: next-watering notification failed: {e:#}");
            }
        }
        Ok(true)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
