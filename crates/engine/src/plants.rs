use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::Row;

use crate::db::{plant_from_row, Db, PlantConfig};

/// A plant plus its current moisture, as seen by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plant {
    pub plant_id: String,
    pub unit_id: String,
    pub name: String,
    pub sensor_id: Option<String>,
    pub threshold: f64,
    pub target_moisture: f64,
    pub ml_per_point: f64,
    pub valve_actuator_id: Option<String>,
    /// Latest fresh reading in percent; `None` when no recent reading exists.
    pub moisture_level: Option<f64>,
    /// Timestamp of the reading behind `moisture_level`.
    pub moisture_at: Option<i64>,
}

#[async_trait]
pub trait PlantLookup: Send + Sync {
    /// Moisture is the newest reading still fresh at `now`.
    async fn get_plant(&self, plant_id: &str, unit_id: &str, now: i64) -> Result<Option<Plant>>;
    async fn get_active_plant(&self, unit_id: &str, now: i64) -> Result<Option<Plant>>;
    async fn get_plant_valve_actuator_id(&self, plant_id: &str) -> Result<Option<String>>;
}

/// Plants from the `plants` table, moisture from the newest reading of the
/// plant's sensor no older than `stale_after_sec`.
#[derive(Clone)]
pub struct StorePlants {
    db: Db,
    stale_after_sec: i64,
}

impl StorePlants {
    pub fn new(db: Db, stale_after_sec: i64) -> Self {
        Self { db, stale_after_sec }
    }

    async fn with_moisture(&self, cfg: PlantConfig, now: i64) -> Result<Plant> {
        let reading = match &cfg.sensor_id {
            Some(sensor_id) => {
                self.db
                    .latest_reading_between(sensor_id, now - self.stale_after_sec, now)
                    .await?
            }
            None => None,
        };
        Ok(Plant {
            plant_id: cfg.plant_id,
            unit_id: cfg.unit_id,
            name: cfg.name,
            sensor_id: cfg.sensor_id,
            threshold: cfg.threshold,
            target_moisture: cfg.target_moisture,
            ml_per_point: cfg.ml_per_point,
            valve_actuator_id: cfg.valve_actuator_id,
            moisture_level: reading.as_ref().map(|r| r.moisture),
            moisture_at: reading.map(|r| r.ts),
        })
    }
}

#[async_trait]
impl PlantLookup for StorePlants {
    async fn get_plant(&self, plant_id: &str, unit_id: &str, now: i64) -> Result<Option<Plant>> {
        let row = sqlx::query("SELECT * FROM plants WHERE plant_id = ? AND unit_id = ?")
            .bind(plant_id)
            .bind(unit_id)
            .fetch_optional(self.db.pool())
            .await
            .context("get_plant failed")?;
        match row {
            Some(r) => Ok(Some(self.with_moisture(plant_from_row(&r)?, now).await?)),
            None => Ok(None),
        }
    }

    async fn get_active_plant(&self, unit_id: &str, now: i64) -> Result<Option<Plant>> {
        let row = sqlx::query(
            "SELECT * FROM plants WHERE unit_id = ? AND active = 1 ORDER BY plant_id LIMIT 1",
        )
        .bind(unit_id)
        .fetch_optional(self.db.pool())
        .await
        .context("get_active_plant failed")?;
        match row {
            Some(r) => Ok(Some(self.with_moisture(plant_from_row(&r)?, now).await?)),
            None => Ok(None),
        }
    }

    async fn get_plant_valve_actuator_id(&self, plant_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT valve_actuator_id FROM plants WHERE plant_id = ?")
            .bind(plant_id)
            .fetch_optional(self.db.pool())
            .await
            .context("get_plant_valve_actuator_id failed")?;
        Ok(row
            .map(|r| r.try_get::<Option<String>, _>("valve_actuator_id"))
            .transpose()?
            .flatten())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
