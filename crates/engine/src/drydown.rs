//! Per-plant dry-down model: how fast moisture falls when nobody waters,
//! and when the plant will therefore cross its threshold again.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use sqlx::Row;
use tracing::{debug, info};

use crate::db::{Db, MoistureReading};
use crate::logs::Window;

/// Confidence saturates at this many slopes.
const FULL_CONFIDENCE_SAMPLES: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrydownSettings {
    pub lookback_hours: i64,
    pub max_gap_hours: i64,
    pub min_samples: usize,
    /// Readings this long after an automatic watering still count as wet.
    pub post_delay_sec: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrydownModel {
    pub plant_id: String,
    /// Negative: moisture points lost per hour. `None` when there is not
    /// enough clean data.
    pub drydown_rate_per_hour: Option<f64>,
    pub sample_count: i64,
    pub confidence: f64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Prediction {
    InsufficientData,
    Due { hours_until: f64, predicted_at: i64 },
}

/// Moisture change per hour for each consecutive reading pair that is
/// clear of every watering window and whose gap is in `(0, max_gap_sec]`.
/// Only drying (negative) slopes are kept.
pub fn drying_slopes(readings: &[MoistureReading], windows: &[Window], max_gap_sec: i64) -> Vec<f64> {
    readings
        .windows(2)
        .filter_map(|pair| {
            let (a, b) = (pair[0], pair[1]);
            let gap = b.ts - a.ts;
            if gap <= 0 || gap > max_gap_sec {
                return None;
            }
            if windows.iter().any(|&(start, end)| a.ts <= end && b.ts >= start) {
                return None;
            }
            let slope = (b.moisture - a.moisture) / (gap as f64 / 3600.0);
            (slope < 0.0).then_some(slope)
        })
        .collect()
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut v = values.to_vec();
    v.sort_by(f64::total_cmp);
    let mid = v.len() / 2;
    Some(if v.len() % 2 == 0 {
        (v[mid - 1] + v[mid]) / 2.0
    } else {
        v[mid]
    })
}

/// Hours until `current` falls to `threshold` at `rate` points per hour.
pub fn predict_with_rate(rate: Option<f64>, threshold: f64, current: f64, now: i64) -> Prediction {
    let Some(rate) = rate.filter(|r| *r < 0.0) else {
        return Prediction::InsufficientData;
    };
    let hours_until = if current <= threshold {
        0.0
    } else {
        (current - threshold) / rate.abs()
    };
    Prediction::Due {
        hours_until,
        predicted_at: now + (hours_until * 3600.0).round() as i64,
    }
}

#[derive(Clone)]
pub struct DrydownEstimator {
    db: Db,
    settings: DrydownSettings,
}

impl DrydownEstimator {
    pub fn new(db: Db, settings: DrydownSettings) -> Self {
        Self { db, settings }
    }

    pub fn lookback_hours(&self) -> i64 {
        self.settings.lookback_hours
    }

    /// Recomputes and stores the model from the last `lookback_hours` of
    /// readings. Too little data stores a model without a rate.
    pub async fn update(&self, plant_id: &str, lookback_hours: i64, now: i64) -> Result<DrydownModel> {
        let plant = self
            .db
            .get_plant_config(plant_id)
            .await?
            .ok_or_else(|| anyhow!("unknown plant '{plant_id}'"))?;
        let since = now - lookback_hours * 3600;

        let readings = match &plant.sensor_id {
            Some(sensor_id) => self.db.readings_since(sensor_id, since).await?,
            None => Vec::new(),
        };

        let mut model = DrydownModel {
            plant_id: plant_id.to_string(),
            drydown_rate_per_hour: None,
            sample_count: 0,
            confidence: 0.0,
            updated_at: now,
        };

        if readings.len() >= 2 {
            let mut windows = self.db.manual_windows(plant_id, since).await?;
            windows.extend(
                self.db
                    .execution_windows(plant_id, &plant.unit_id, since, self.settings.post_delay_sec)
                    .await?,
            );

            let slopes = drying_slopes(&readings, &windows, self.settings.max_gap_hours * 3600);
            model.sample_count = slopes.len() as i64;
            if slopes.len() >= self.settings.min_samples {
                model.drydown_rate_per_hour = median(&slopes);
                model.confidence = (slopes.len() as f64 / FULL_CONFIDENCE_SAMPLES).min(1.0);
            }
            debug!(
                plant = %plant_id,
                readings = readings.len(),
                windows = windows.len(),
                slopes = slopes.len(),
                "dry-down slopes collected"
            );
        }

        self.db.upsert_plant_model(&model).await?;
        info!(
            plant = %plant_id,
            rate = ?model.drydown_rate_per_hour,
            samples = model.sample_count,
            confidence = model.confidence,
            "dry-down model updated"
        );
        Ok(model)
    }

    /// Uses `rate` when given, else the stored model.
    pub async fn predict(
        &self,
        plant_id: &str,
        threshold: f64,
        current_moisture: f64,
        rate: Option<f64>,
        now: i64,
    ) -> Result<Prediction> {
        let rate = match rate {
            Some(r) => Some(r),
            None => self
                .db
                .get_plant_model(plant_id)
                .await?
                .and_then(|m| m.drydown_rate_per_hour),
        };
        Ok(predict_with_rate(rate, threshold, current_moisture, now))
    }
}

impl Db {
    pub async fn upsert_plant_model(&self, m: &DrydownModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO plant_irrigation_models (
              plant_id, drydown_rate_per_hour, sample_count, confidence, updated_at
            ) VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(plant_id) DO UPDATE SET
              drydown_rate_per_hour=excluded.drydown_rate_per_hour,
              sample_count=excluded.sample_count,
              confidence=excluded.confidence,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(&m.plant_id)
        .bind(m.drydown_rate_per_hour)
        .bind(m.sample_count)
        .bind(m.confidence)
        .bind(m.updated_at)
        .execute(self.pool())
        .await
        .context("upsert_plant_model failed")?;
        Ok(())
    }

    pub async fn get_plant_model(&self, plant_id: &str) -> Result<Option<DrydownModel>> {
        let row = sqlx::query("SELECT * FROM plant_irrigation_models WHERE plant_id = ?")
            .bind(plant_id)
            .fetch_optional(self.pool())
            .await
            .context("get_plant_model failed")?;
        row.map(|r| {
            Ok(DrydownModel {
                plant_id: r.try_get("plant_id")?,
                drydown_rate_per_hour: r.try_get("drydown_rate_per_hour")?,
                sample_count: r.try_get("sample_count")?,
                confidence: r.try_get("confidence")?,
                updated_at: r.try_get("updated_at")?,
            })
        })
        .transpose()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
