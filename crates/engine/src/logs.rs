//! Execution and manual watering logs.
//!
//! An execution log row is written once when an attempt starts (or is
//! refused), finalised once by the completion sweep and annotated once by
//! the post-outcome capture. Each of those writes is conditional on the
//! column it fills still being empty.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::fmt;
use std::str::FromStr;

use crate::db::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Started,
    Completed,
    Failed,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "started" => Self::Started,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            other => bail!("unknown execution log status '{other}'"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionLog {
    pub id: i64,
    pub request_id: Option<i64>,
    pub unit_id: String,
    pub plant_id: Option<String>,
    pub trigger_moisture: Option<f64>,
    pub threshold: Option<f64>,
    pub planned_duration_s: i64,
    pub actual_duration_s: Option<i64>,
    pub pump_actuator_id: Option<String>,
    pub valve_actuator_id: Option<String>,
    pub flow_rate_ml_per_sec: Option<f64>,
    pub estimated_volume_ml: Option<f64>,
    pub execution_status: LogStatus,
    pub execution_error: Option<String>,
    pub executed_at: i64,
    pub post_moisture: Option<f64>,
    pub post_moisture_delta: Option<f64>,
    pub recommendation: Option<String>,
    pub post_captured_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewExecutionLog {
    pub request_id: Option<i64>,
    pub unit_id: String,
    pub plant_id: Option<String>,
    pub trigger_moisture: Option<f64>,
    pub threshold: Option<f64>,
    pub planned_duration_s: i64,
    pub pump_actuator_id: Option<String>,
    pub valve_actuator_id: Option<String>,
    pub flow_rate_ml_per_sec: Option<f64>,
    pub status: LogStatus,
    pub error: Option<String>,
    pub executed_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManualLog {
    pub id: i64,
    pub unit_id: String,
    pub plant_id: String,
    pub user_id: String,
    pub watered_at: i64,
    pub amount_ml: Option<f64>,
    pub notes: Option<String>,
    pub pre_moisture: Option<f64>,
    pub settle_delay_s: i64,
    pub post_moisture: Option<f64>,
    pub post_moisture_delta: Option<f64>,
    pub post_captured_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewManualLog {
    pub unit_id: String,
    pub plant_id: String,
    pub user_id: String,
    pub watered_at: i64,
    pub amount_ml: Option<f64>,
    pub notes: Option<String>,
    pub pre_moisture: Option<f64>,
    pub settle_delay_s: i64,
}

/// A `[start, end]` span during which moisture readings reflect watering
/// rather than drying.
pub type Window = (i64, i64);

fn execution_log_from_row(r: &SqliteRow) -> Result<ExecutionLog> {
    let status: String = r.try_get("execution_status")?;
    Ok(ExecutionLog {
        id: r.try_get("id")?,
        request_id: r.try_get("request_id")?,
        unit_id: r.try_get("unit_id")?,
        plant_id: r.try_get("plant_id")?,
        trigger_moisture: r.try_get("trigger_moisture")?,
        threshold: r.try_get("threshold")?,
        planned_duration_s: r.try_get("planned_duration_s")?,
        actual_duration_s: r.try_get("actual_duration_s")?,
        pump_actuator_id: r.try_get("pump_actuator_id")?,
        valve_actuator_id: r.try_get("valve_actuator_id")?,
        flow_rate_ml_per_sec: r.try_get("flow_rate_ml_per_sec")?,
        estimated_volume_ml: r.try_get("estimated_volume_ml")?,
        execution_status: status.parse()?,
        execution_error: r.try_get("execution_error")?,
        executed_at: r.try_get("executed_at")?,
        post_moisture: r.try_get("post_moisture")?,
        post_moisture_delta: r.try_get("post_moisture_delta")?,
        recommendation: r.try_get("recommendation")?,
        post_captured_at: r.try_get("post_captured_at")?,
    })
}

fn manual_log_from_row(r: &SqliteRow) -> Result<ManualLog> {
    Ok(ManualLog {
        id: r.try_get("id")?,
        unit_id: r.try_get("unit_id")?,
        plant_id: r.try_get("plant_id")?,
        user_id: r.try_get("user_id")?,
        watered_at: r.try_get("watered_at")?,
        amount_ml: r.try_get("amount_ml")?,
        notes: r.try_get("notes")?,
        pre_moisture: r.try_get("pre_moisture")?,
        settle_delay_s: r.try_get("settle_delay_s")?,
        post_moisture: r.try_get("post_moisture")?,
        post_moisture_delta: r.try_get("post_moisture_delta")?,
        post_captured_at: r.try_get("post_captured_at")?,
        created_at: r.try_get("created_at")?,
    })
}

impl Db {
    // ----------------------------
    // Execution logs
    // ----------------------------

    pub async fn create_execution_log(&self, log: &NewExecutionLog) -> Result<i64> {
        let res = sqlx::query(
            r#"
            INSERT INTO irrigation_execution_logs (
              request_id, unit_id, plant_id, trigger_moisture, threshold,
              planned_duration_s, pump_actuator_id, valve_actuator_id,
              flow_rate_ml_per_sec, execution_status, execution_error, executed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(log.request_id)
        .bind(&log.unit_id)
        .bind(&log.plant_id)
        .bind(log.trigger_moisture)
        .bind(log.threshold)
        .bind(log.planned_duration_s)
        .bind(&log.pump_actuator_id)
        .bind(&log.valve_actuator_id)
        .bind(log.flow_rate_ml_per_sec)
        .bind(log.status.as_str())
        .bind(&log.error)
        .bind(log.executed_at)
        .execute(self.pool())
        .await
        .context("create_execution_log failed")?;
        Ok(res.last_insert_rowid())
    }

    #[cfg(test)]
    pub async fn get_execution_log(&self, id: i64) -> Result<Option<ExecutionLog>> {
        let row = sqlx::query("SELECT * FROM irrigation_execution_logs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .context("get_execution_log failed")?;
        row.as_ref().map(execution_log_from_row).transpose()
    }

    /// The still-open (`started`) log of a request's current attempt.
    pub async fn started_log_for_request(&self, request_id: i64) -> Result<Option<ExecutionLog>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM irrigation_execution_logs
            WHERE request_id = ? AND execution_status = 'started'
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(request_id)
        .fetch_optional(self.pool())
        .await
        .context("started_log_for_request failed")?;
        row.as_ref().map(execution_log_from_row).transpose()
    }

    #[cfg(test)]
    pub async fn execution_logs_for_request(&self, request_id: i64) -> Result<Vec<ExecutionLog>> {
        let rows = sqlx::query(
            "SELECT * FROM irrigation_execution_logs WHERE request_id = ? ORDER BY id",
        )
        .bind(request_id)
        .fetch_all(self.pool())
        .await
        .context("execution_logs_for_request failed")?;
        rows.iter().map(execution_log_from_row).collect()
    }

    /// Closes a `started` log. Returns false if it was already closed.
    pub async fn finalize_execution_log(
        &self,
        id: i64,
        status: LogStatus,
        actual_duration_s: Option<i64>,
        estimated_volume_ml: Option<f64>,
        error: Option<&str>,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE irrigation_execution_logs
            SET execution_status = ?,
                actual_duration_s = ?,
                estimated_volume_ml = ?,
                execution_error = ?
            WHERE id = ? AND execution_status = 'started'
            "#,
        )
        .bind(status.as_str())
        .bind(actual_duration_s)
        .bind(estimated_volume_ml)
        .bind(error)
        .bind(id)
        .execute(self.pool())
        .await
        .with_context(|| format!("finalize_execution_log({id}) failed"))?;
        Ok(res.rows_affected() == 1)
    }

    /// Completed logs still waiting for their post-watering sample.
    pub async fn pending_post_capture(&self, now: i64, post_delay_s: i64) -> Result<Vec<ExecutionLog>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM irrigation_execution_logs
            WHERE execution_status = 'completed'
              AND post_moisture IS NULL
              AND executed_at + COALESCE(actual_duration_s, planned_duration_s) + ? <= ?
            ORDER BY executed_at ASC
            "#,
        )
        .bind(post_delay_s)
        .bind(now)
        .fetch_all(self.pool())
        .await
        .context("pending_post_capture failed")?;
        rows.iter().map(execution_log_from_row).collect()
    }

    /// One-time write of the post-watering outcome.
    pub async fn record_post_capture(
        &self,
        id: i64,
        post_moisture: f64,
        delta: Option<f64>,
        recommendation: &str,
        now: i64,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE irrigation_execution_logs
            SET post_moisture = ?, post_moisture_delta = ?, recommendation = ?, post_captured_at = ?
            WHERE id = ? AND post_moisture IS NULL
            "#,
        )
        .bind(post_moisture)
        .bind(delta)
        .bind(recommendation)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await
        .with_context(|| format!("record_post_capture({id}) failed"))?;
        Ok(res.rows_affected() == 1)
    }

    /// Watering spans from execution logs touching `plant_id` (or its unit,
    /// for logs without a plant) since `since`. Failed attempts are skipped.
    pub async fn execution_windows(
        &self,
        plant_id: &str,
        unit_id: &str,
        since: i64,
        post_delay_s: i64,
    ) -> Result<Vec<Window>> {
        let rows = sqlx::query(
            r#"
            SELECT executed_at,
                   executed_at + COALESCE(actual_duration_s, planned_duration_s) + ? AS ends_at
            FROM irrigation_execution_logs
            WHERE (plant_id = ? OR (plant_id IS NULL AND unit_id = ?))
              AND execution_status != 'failed'
              AND executed_at + COALESCE(actual_duration_s, planned_duration_s) + ? >= ?
            ORDER BY executed_at
            "#,
        )
        .bind(post_delay_s)
        .bind(plant_id)
        .bind(unit_id)
        .bind(post_delay_s)
        .bind(since)
        .fetch_all(self.pool())
        .await
        .context("execution_windows failed")?;
        rows.iter()
            .map(|r| Ok((r.try_get("executed_at")?, r.try_get("ends_at")?)))
            .collect()
    }

    /// True if the unit ran (or is running) an automatic watering, or the
    /// plant has a manual watering, at or after `since`.
    pub async fn has_recent_activity(&self, unit_id: &str, plant_id: &str, since: i64) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT
              EXISTS (
                SELECT 1 FROM irrigation_execution_logs
                WHERE unit_id = ? AND execution_status != 'failed' AND executed_at >= ?
              ) OR EXISTS (
                SELECT 1 FROM manual_irrigation_logs
                WHERE plant_id = ? AND watered_at >= ?
              ) AS active
            "#,
        )
        .bind(unit_id)
        .bind(since)
        .bind(plant_id)
        .bind(since)
        .fetch_one(self.pool())
        .await
        .context("has_recent_activity failed")?;
        Ok(row.try_get::<i64, _>("active")? != 0)
    }

    // ----------------------------
    // Manual logs
    // ----------------------------

    pub async fn create_manual_log(&self, log: &NewManualLog, now: i64) -> Result<i64> {
        let res = sqlx::query(
            r#"
            INSERT INTO manual_irrigation_logs (
              unit_id, plant_id, user_id, watered_at, amount_ml, notes,
              pre_moisture, settle_delay_s, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&log.unit_id)
        .bind(&log.plant_id)
        .bind(&log.user_id)
        .bind(log.watered_at)
        .bind(log.amount_ml)
        .bind(&log.notes)
        .bind(log.pre_moisture)
        .bind(log.settle_delay_s)
        .bind(now)
        .execute(self.pool())
        .await
        .context("create_manual_log failed")?;
        Ok(res.last_insert_rowid())
    }

    #[cfg(test)]
    pub async fn get_manual_log(&self, id: i64) -> Result<Option<ManualLog>> {
        let row = sqlx::query("SELECT * FROM manual_irrigation_logs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .context("get_manual_log failed")?;
        row.as_ref().map(manual_log_from_row).transpose()
    }

    /// Manual logs whose settle delay has passed and that have no post sample.
    pub async fn pending_manual_capture(&self, now: i64) -> Result<Vec<ManualLog>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM manual_irrigation_logs
            WHERE post_moisture IS NULL AND watered_at + settle_delay_s <= ?
            ORDER BY watered_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(self.pool())
        .await
        .context("pending_manual_capture failed")?;
        rows.iter().map(manual_log_from_row).collect()
    }

    pub async fn record_manual_capture(
        &self,
        id: i64,
        post_moisture: f64,
        delta: Option<f64>,
        now: i64,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE manual_irrigation_logs
            SET post_moisture = ?, post_moisture_delta = ?, post_captured_at = ?
            WHERE id = ? AND post_moisture IS NULL
            "#,
        )
        .bind(post_moisture)
        .bind(delta)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await
        .with_context(|| format!("record_manual_capture({id}) failed"))?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn manual_windows(&self, plant_id: &str, since: i64) -> Result<Vec<Window>> {
        let rows = sqlx::query(
            r#"
            SELECT watered_at, watered_at + settle_delay_s AS ends_at
            FROM manual_irrigation_logs
            WHERE plant_id = ? AND watered_at + settle_delay_s >= ?
            ORDER BY watered_at
            "#,
        )
        .bind(plant_id)
        .bind(since)
        .fetch_all(self.pool())
        .await
        .context("manual_windows failed")?;
        rows.iter()
            .map(|r| Ok((r.try_get("watered_at")?, r.try_get("ends_at")?)))
            .collect()
    }

    // ----------------------------
    // Manual prompts
    // ----------------------------

    pub async fn last_manual_prompt(&self, plant_id: &str) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT prompted_at FROM manual_irrigation_prompts WHERE plant_id = ?")
            .bind(plant_id)
            .fetch_optional(self.pool())
            .await
            .context("last_manual_prompt failed")?;
        Ok(row.map(|r| r.try_get("prompted_at")).transpose()?)
    }

    pub async fn set_manual_prompt(&self, plant_id: &str, now: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO manual_irrigation_prompts (plant_id, prompted_at) VALUES (?, ?)
            ON CONFLICT(plant_id) DO UPDATE SET prompted_at = excluded.prompted_at
            "#,
        )
        .bind(plant_id)
        .bind(now)
        .execute(self.pool())
        .await
        .context("set_manual_prompt failed")?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
