//! Request Store: persisted `IrrigationRequest` rows and their lifecycle.
//!
//! ```text
//! pending ──▶ approved ──┐
//!    │  ╲                 ├──[claim + mark started]──▶ executing ──▶ executed
//!    │   ╲──▶ delayed ────┘                                 │
//!    │                                                      └──────▶ failed
//!    └──▶ expired | cancelled
//! ```
//!
//! Every write that changes `status` goes through [`RequestStatus::can_transition_to`]
//! and is conditional on the status it was validated against, so a concurrent
//! writer that moved the row first makes the second write fail instead of
//! silently overwriting it.

use anyhow::{anyhow, bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::fmt;
use std::str::FromStr;

use crate::db::{Db, PreferenceCounter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Delayed,
    Executing,
    Executed,
    Failed,
    Expired,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Delayed => "delayed",
            Self::Executing => "executing",
            Self::Executed => "executed",
            Self::Failed => "failed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    #[cfg(test)]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Executed | Self::Failed | Self::Expired | Self::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        match self {
            Pending => matches!(
                next,
                Approved | Delayed | Executing | Expired | Cancelled | Failed
            ),
            Approved => matches!(next, Delayed | Executing | Expired | Cancelled | Failed),
            Delayed => matches!(
                next,
                Approved | Delayed | Executing | Expired | Cancelled | Failed
            ),
            Executing => matches!(next, Executed | Failed),
            Executed | Failed | Expired | Cancelled => false,
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "pending" => Self::Pending,
            "approved" => Self::Approved,
            "delayed" => Self::Delayed,
            "executing" => Self::Executing,
            "executed" => Self::Executed,
            "failed" => Self::Failed,
            "expired" => Self::Expired,
            "cancelled" => Self::Cancelled,
            other => bail!("unknown request status '{other}'"),
        })
    }
}

/// Sub-status of the physical attempt, independent of the request status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Executing,
    /// A completion sweep owns the running attempt.
    Stopping,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Executing => "executing",
            Self::Stopping => "stopping",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "executing" => Self::Executing,
            "stopping" => Self::Stopping,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            other => bail!("unknown execution status '{other}'"),
        })
    }
}

/// Conditions at detection time, kept for later model training.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub vpd: Option<f64>,
    pub lux: Option<f64>,
}

impl EnvironmentSnapshot {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.humidity.is_none()
            && self.vpd.is_none()
            && self.lux.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrrigationRequest {
    pub id: i64,
    pub unit_id: String,
    pub user_id: String,
    pub plant_id: Option<String>,
    pub actuator_id: Option<String>,
    pub sensor_id: Option<String>,
    pub detected_moisture: f64,
    pub threshold: f64,
    pub status: RequestStatus,
    pub execution_status: Option<ExecutionStatus>,
    pub scheduled_time: i64,
    pub delayed_until: Option<i64>,
    pub expires_at: Option<i64>,
    pub claimed_at: Option<i64>,
    pub attempt_count: i64,
    pub last_attempt_at: Option<i64>,
    pub user_response: Option<String>,
    pub response_at: Option<i64>,
    pub planned_duration_s: Option<i64>,
    pub actual_duration_s: Option<i64>,
    pub post_moisture: Option<f64>,
    pub execution_error: Option<String>,
    pub environment: EnvironmentSnapshot,
    pub created_at: i64,
}

impl IrrigationRequest {
    pub fn environment(&self) -> Option<&EnvironmentSnapshot> {
        (!self.environment.is_empty()).then_some(&self.environment)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewRequest {
    pub unit_id: String,
    pub user_id: String,
    pub plant_id: Option<String>,
    pub actuator_id: Option<String>,
    pub sensor_id: Option<String>,
    pub detected_moisture: f64,
    pub threshold: f64,
    pub scheduled_time: i64,
    pub expires_at: Option<i64>,
    pub environment: EnvironmentSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserResponse {
    Approve,
    Delay { minutes: i64 },
    Cancel,
}

impl FromStr for UserResponse {
    type Err = anyhow::Error;

    /// `approve`, `cancel`, or `delay:<minutes>`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "approve" => Ok(Self::Approve),
            "cancel" => Ok(Self::Cancel),
            _ => {
                let minutes = s
                    .strip_prefix("delay:")
                    .ok_or_else(|| anyhow!("unknown response '{s}' (use approve, cancel, delay:<minutes>)"))?
                    .parse::<i64>()
                    .with_context(|| format!("bad delay minutes in '{s}'"))?;
                ensure!(minutes > 0, "delay must be positive, got {minutes}");
                Ok(Self::Delay { minutes })
            }
        }
    }
}

fn request_from_row(r: &SqliteRow) -> Result<IrrigationRequest> {
    let status: String = r.try_get("status")?;
    let execution_status: Option<String> = r.try_get("execution_status")?;
    Ok(IrrigationRequest {
        id: r.try_get("id")?,
        unit_id: r.try_get("unit_id")?,
        user_id: r.try_get("user_id")?,
        plant_id: r.try_get("plant_id")?,
        actuator_id: r.try_get("actuator_id")?,
        sensor_id: r.try_get("sensor_id")?,
        detected_moisture: r.try_get("detected_moisture")?,
        threshold: r.try_get("threshold")?,
        status: status.parse()?,
        execution_status: execution_status.as_deref().map(str::parse).transpose()?,
        scheduled_time: r.try_get("scheduled_time")?,
        delayed_until: r.try_get("delayed_until")?,
        expires_at: r.try_get("expires_at")?,
        claimed_at: r.try_get("claimed_at")?,
        attempt_count: r.try_get("attempt_count")?,
        last_attempt_at: r.try_get("last_attempt_at")?,
        user_response: r.try_get("user_response")?,
        response_at: r.try_get("response_at")?,
        planned_duration_s: r.try_get("planned_duration_s")?,
        actual_duration_s: r.try_get("actual_duration_s")?,
        post_moisture: r.try_get("post_moisture")?,
        execution_error: r.try_get("execution_error")?,
        environment: EnvironmentSnapshot {
            temperature: r.try_get("temperature")?,
            humidity: r.try_get("humidity")?,
            vpd: r.try_get("vpd")?,
            lux: r.try_get("lux")?,
        },
        created_at: r.try_get("created_at")?,
    })
}

impl Db {
    // ----------------------------
    // Creation + lookup
    // ----------------------------

    /// Inserts a new pending request unless a non-terminal one already exists
    /// for the same (unit, plant, actuator). Returns the request id and
    /// whether it was newly created.
    pub async fn create_request(&self, req: &NewRequest, now: i64) -> Result<(i64, bool)> {
        let existing = sqlx::query(
            r#"
            SELECT id FROM pending_irrigation_requests
            WHERE unit_id = ? AND plant_id IS ? AND actuator_id IS ?
              AND status IN ('pending', 'approved', 'delayed', 'executing')
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(&req.unit_id)
        .bind(&req.plant_id)
        .bind(&req.actuator_id)
        .fetch_optional(self.pool())
        .await
        .context("create_request: existence check failed")?;

        if let Some(row) = existing {
            return Ok((row.try_get("id")?, false));
        }

        let res = sqlx::query(
            r#"
            INSERT INTO pending_irrigation_requests (
              unit_id, user_id, plant_id, actuator_id, sensor_id,
              detected_moisture, threshold, status,
              scheduled_time, expires_at,
              temperature, humidity, vpd, lux, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&req.unit_id)
        .bind(&req.user_id)
        .bind(&req.plant_id)
        .bind(&req.actuator_id)
        .bind(&req.sensor_id)
        .bind(req.detected_moisture)
        .bind(req.threshold)
        .bind(req.scheduled_time)
        .bind(req.expires_at)
        .bind(req.environment.temperature)
        .bind(req.environment.humidity)
        .bind(req.environment.vpd)
        .bind(req.environment.lux)
        .bind(now)
        .execute(self.pool())
        .await
        .context("create_request: insert failed")?;

        Ok((res.last_insert_rowid(), true))
    }

    pub async fn get_request(&self, id: i64) -> Result<Option<IrrigationRequest>> {
        let row = sqlx::query("SELECT * FROM pending_irrigation_requests WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .context("get_request failed")?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn require_request(&self, id: i64) -> Result<IrrigationRequest> {
        self.get_request(id)
            .await?
            .ok_or_else(|| anyhow!("irrigation request {id} not found"))
    }

    // ----------------------------
    // Claim
    // ----------------------------

    /// Atomically claims up to `limit` due requests for this caller.
    ///
    /// The UPDATE is the first statement of the transaction, so SQLite takes
    /// the write lock before anything is read; a concurrent claimer blocks
    /// until this transaction commits and then no longer sees these rows as
    /// unclaimed.
    pub async fn claim_due(&self, now: i64, limit: i64) -> Result<Vec<IrrigationRequest>> {
        let mut tx = self.pool().begin().await.context("claim_due: begin failed")?;

        let claimed = sqlx::query(
            r#"
            UPDATE pending_irrigation_requests
            SET claimed_at = ?,
                execution_status = 'executing',
                attempt_count = attempt_count + 1
            WHERE claimed_at IS NULL
              AND id IN (
                SELECT id FROM pending_irrigation_requests
                WHERE claimed_at IS NULL
                  AND (
                    (status IN ('pending', 'approved') AND scheduled_time <= ?)
                    OR (status = 'delayed' AND delayed_until IS NOT NULL AND delayed_until <= ?)
                  )
                  AND (expires_at IS NULL OR expires_at > ?)
                ORDER BY scheduled_time ASC, id ASC
                LIMIT ?
              )
            RETURNING id
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .context("claim_due: update failed")?;

        let mut out = Vec::with_capacity(claimed.len());
        for row in &claimed {
            let id: i64 = row.try_get("id")?;
            let full = sqlx::query("SELECT * FROM pending_irrigation_requests WHERE id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await
                .context("claim_due: reselect failed")?;
            out.push(request_from_row(&full)?);
        }

        tx.commit().await.context("claim_due: commit failed")?;

        out.sort_by_key(|r| (r.scheduled_time, r.id));
        Ok(out)
    }

    // ----------------------------
    // Execution bookkeeping
    // ----------------------------

    /// Validates `current -> next` and writes it conditionally on `current`.
    async fn transition(
        &self,
        current: &IrrigationRequest,
        next: RequestStatus,
        apply: &str,
        binds: Vec<Option<BindValue>>,
    ) -> Result<()> {
        ensure!(
            current.status.can_transition_to(next),
            "request {}: invalid transition {} -> {}",
            current.id,
            current.status,
            next
        );

        let sql = format!(
            "UPDATE pending_irrigation_requests SET status = ?, {apply} WHERE id = ? AND status = ?"
        );
        let mut q = sqlx::query(&sql).bind(next.as_str());
        for b in binds {
            q = match b {
                Some(BindValue::Int(v)) => q.bind(v),
                Some(BindValue::Text(v)) => q.bind(v),
                None => q.bind(Option::<i64>::None),
            };
        }
        let res = q
            .bind(current.id)
            .bind(current.status.as_str())
            .execute(self.pool())
            .await
            .with_context(|| format!("request {}: {} -> {} failed", current.id, current.status, next))?;

        ensure!(
            res.rows_affected() == 1,
            "request {}: status changed concurrently (expected {})",
            current.id,
            current.status
        );
        Ok(())
    }

    /// Marks the physical attempt as started with its planned duration.
    pub async fn mark_execution_started(&self, id: i64, planned_duration_s: i64, now: i64) -> Result<()> {
        let current = self.require_request(id).await?;
        self.transition(
            &current,
            RequestStatus::Executing,
            "execution_status = 'executing', planned_duration_s = ?, last_attempt_at = ?",
            vec![Some(BindValue::Int(planned_duration_s)), Some(BindValue::Int(now))],
        )
        .await
    }

    /// Finalises an executing request as `executed` or `failed`.
    pub async fn record_execution_result(
        &self,
        id: i64,
        success: bool,
        actual_duration_s: Option<i64>,
        error: Option<&str>,
    ) -> Result<()> {
        let current = self.require_request(id).await?;
        let (status, exec) = if success {
            (RequestStatus::Executed, ExecutionStatus::Completed)
        } else {
            (RequestStatus::Failed, ExecutionStatus::Failed)
        };
        self.transition(
            &current,
            status,
            "execution_status = ?, actual_duration_s = ?, execution_error = ?",
            vec![
                Some(BindValue::Text(exec.as_str().to_string())),
                actual_duration_s.map(BindValue::Int),
                error.map(|e| BindValue::Text(e.to_string())),
            ],
        )
        .await
    }

    /// Hands a claimed request back after an admission failure: re-queued as
    /// `delayed` until `retry_at`, or `failed` once `max_attempts` is used up.
    pub async fn release_claim(
        &self,
        id: i64,
        retry_at: i64,
        max_attempts: i64,
        error: &str,
    ) -> Result<RequestStatus> {
        let current = self.require_request(id).await?;
        if current.attempt_count >= max_attempts {
            self.transition(
                &current,
                RequestStatus::Failed,
                "execution_status = 'failed', execution_error = ?",
                vec![Some(BindValue::Text(format!(
                    "{error} (gave up after {} attempts)",
                    current.attempt_count
                )))],
            )
            .await?;
            return Ok(RequestStatus::Failed);
        }

        self.transition(
            &current,
            RequestStatus::Delayed,
            "claimed_at = NULL, execution_status = NULL, delayed_until = ?, execution_error = ?",
            vec![
                Some(BindValue::Int(retry_at)),
                Some(BindValue::Text(error.to_string())),
            ],
        )
        .await?;
        Ok(RequestStatus::Delayed)
    }

    /// Requests being watered right now, for the completion sweep.
    pub async fn executing_requests(&self) -> Result<Vec<IrrigationRequest>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM pending_irrigation_requests
            WHERE status = 'executing'
              AND execution_status = 'executing'
              AND planned_duration_s IS NOT NULL
              AND last_attempt_at IS NOT NULL
            ORDER BY last_attempt_at ASC
            "#,
        )
        .fetch_all(self.pool())
        .await
        .context("executing_requests failed")?;
        rows.iter().map(request_from_row).collect()
    }

    /// Takes the right to finish the attempt that started at `started_at`.
    /// Exactly one caller gets `true`; everyone else must leave the pump,
    /// the valve and the unit lock alone.
    pub async fn begin_completion(&self, id: i64, started_at: i64) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE pending_irrigation_requests
            SET execution_status = 'stopping'
            WHERE id = ?
              AND status = 'executing'
              AND execution_status = 'executing'
              AND last_attempt_at = ?
            "#,
        )
        .bind(id)
        .bind(started_at)
        .execute(self.pool())
        .await
        .context("begin_completion failed")?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn set_request_post_moisture(&self, id: i64, post_moisture: f64) -> Result<()> {
        sqlx::query("UPDATE pending_irrigation_requests SET post_moisture = ? WHERE id = ?")
            .bind(post_moisture)
            .bind(id)
            .execute(self.pool())
            .await
            .context("set_request_post_moisture failed")?;
        Ok(())
    }

    // ----------------------------
    // Expiry
    // ----------------------------

    /// Unclaimed waiting requests whose `expires_at` has passed.
    pub async fn get_expired(&self, now: i64) -> Result<Vec<IrrigationRequest>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM pending_irrigation_requests
            WHERE status IN ('pending', 'approved', 'delayed')
              AND claimed_at IS NULL
              AND expires_at IS NOT NULL
              AND expires_at <= ?
            ORDER BY id
            "#,
        )
        .bind(now)
        .fetch_all(self.pool())
        .await
        .context("get_expired failed")?;
        rows.iter().map(request_from_row).collect()
    }

    pub async fn expire(&self, id: i64) -> Result<()> {
        let current = self.require_request(id).await?;
        ensure!(
            current.claimed_at.is_none(),
            "request {id} is claimed; not expiring an in-flight request"
        );
        self.transition(&current, RequestStatus::Expired, "execution_status = NULL", vec![])
            .await
    }

    // ----------------------------
    // User responses
    // ----------------------------

    pub async fn respond(&self, id: i64, response: UserResponse, now: i64) -> Result<RequestStatus> {
        let current = self.require_request(id).await?;
        ensure!(
            current.claimed_at.is_none(),
            "request {id} is already being executed"
        );

        let (next, label, delayed_until, counter) = match response {
            UserResponse::Approve => (RequestStatus::Approved, "approve", None, PreferenceCounter::Approval),
            UserResponse::Cancel => (RequestStatus::Cancelled, "cancel", None, PreferenceCounter::Cancellation),
            UserResponse::Delay { minutes } => (
                RequestStatus::Delayed,
                "delay",
                Some(now + minutes * 60),
                PreferenceCounter::Delay,
            ),
        };

        self.transition(
            &current,
            next,
            "user_response = ?, response_at = ?, delayed_until = COALESCE(?, delayed_until)",
            vec![
                Some(BindValue::Text(label.to_string())),
                Some(BindValue::Int(now)),
                delayed_until.map(BindValue::Int),
            ],
        )
        .await?;

        self.bump_preference(&current.user_id, &current.unit_id, counter)
            .await?;
        Ok(next)
    }

    /// Records the implicit `auto` response for a request nobody answered.
    /// Conditional on `user_response IS NULL`, so it lands at most once.
    pub async fn record_auto_response(&self, id: i64, now: i64) -> Result<bool> {
        let current = self.require_request(id).await?;
        let res = sqlx::query(
            r#"
            UPDATE pending_irrigation_requests
            SET user_response = 'auto', response_at = ?
            WHERE id = ? AND user_response IS NULL
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await
        .context("record_auto_response failed")?;

        if res.rows_affected() == 0 {
            return Ok(false);
        }
        self.bump_preference(&current.user_id, &current.unit_id, PreferenceCounter::Auto)
            .await?;
        Ok(true)
    }
}

/// Extra column values bound by [`Db::transition`], in placeholder order.
enum BindValue {
    Int(i64),
    Text(String),
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::tests::test_db;
    use std::collections::HashSet;

    pub(crate) fn new_request(unit: &str, plant: Option<&str>, scheduled: i64) -> NewRequest {
        NewRequest {
            unit_id: unit.into(),
            user_id: "alice".into(),
            plant_id: plant.map(str::to_string),
            actuator_id: None,
            sensor_id: Some("node-a/s1".into()),
            detected_moisture: 22.0,
            threshold: 30.0,
            scheduled_time: scheduled,
            expires_at: Some(scheduled + 3600),
            environment: EnvironmentSnapshot {
                temperature: Some(24.5),
                humidity: Some(55.0),
                vpd: Some(1.3),
                lux: None,
            },
        }
    }

    // -- Status table -----------------------------------------------------

    #[test]
    fn terminal_statuses_never_transition() {
        use RequestStatus::*;
        let all = [
            Pending, Approved, Delayed, Executing, Executed, Failed, Expired, Cancelled,
        ];
        for from in [Executed, Failed, Expired, Cancelled] {
            assert!(from.is_terminal());
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn executing_only_finishes() {
        use RequestStatus::*;
        assert!(Executing.can_transition_to(Executed));
        assert!(Executing.can_transition_to(Failed));
        assert!(!Executing.can_transition_to(Pending));
        assert!(!Executing.can_transition_to(Cancelled));
        assert!(!Executing.can_transition_to(Expired));
    }

    #[test]
    fn pending_fans_out() {
        use RequestStatus::*;
        for to in [Approved, Delayed, Executing, Expired, Cancelled] {
            assert!(Pending.can_transition_to(to));
        }
        assert!(!Pending.can_transition_to(Executed));
    }

    #[test]
    fn status_round_trips_through_text() {
        for s in ["pending", "approved", "delayed", "executing", "executed", "failed", "expired", "cancelled"] {
            assert_eq!(s.parse::<RequestStatus>().unwrap().as_str(), s);
        }
        assert!("done".parse::<RequestStatus>().is_err());
    }

    #[test]
    fn parse_user_response() {
        assert_eq!("approve".parse::<UserResponse>().unwrap(), UserResponse::Approve);
        assert_eq!(" CANCEL ".parse::<UserResponse>().unwrap(), UserResponse::Cancel);
        assert_eq!(
            "delay:45".parse::<UserResponse>().unwrap(),
            UserResponse::Delay { minutes: 45 }
        );
        assert!("delay:0".parse::<UserResponse>().is_err());
        assert!("delay:soon".parse::<UserResponse>().is_err());
        assert!("water".parse::<UserResponse>().is_err());
    }

    // -- Creation ---------------------------------------------------------

    #[tokio::test]
    async fn create_request_dedupes_non_terminal_tuple() {
        let db = test_db().await;
        let (id1, created1) = db.create_request(&new_request("u1", Some("p1"), 100), 100).await.unwrap();
        let (id2, created2) = db.create_request(&new_request("u1", Some("p1"), 200), 200).await.unwrap();
        assert!(created1);
        assert!(!created2);
        assert_eq!(id1, id2);

        // different plant on the same unit is a different tuple
        let (id3, created3) = db.create_request(&new_request("u1", Some("p2"), 200), 200).await.unwrap();
        assert!(created3);
        assert_ne!(id1, id3);

        // once terminal, a new one may be created
        db.respond(id1, UserResponse::Cancel, 300).await.unwrap();
        let (id4, created4) = db.create_request(&new_request("u1", Some("p1"), 400), 400).await.unwrap();
        assert!(created4);
        assert_ne!(id1, id4);
    }

    #[tokio::test]
    async fn created_request_keeps_environment_snapshot() {
        let db = test_db().await;
        let (id, _) = db.create_request(&new_request("u1", None, 100), 100).await.unwrap();
        let r = db.get_request(id).await.unwrap().unwrap();
        assert_eq!(r.status, RequestStatus::Pending);
        assert_eq!(r.execution_status, None);
        assert_eq!(r.environment.temperature, Some(24.5));
        assert_eq!(r.environment.lux, None);
        assert!(r.environment().is_some());
        assert_eq!(r.plant_id, None);
    }

    // -- Claim ------------------------------------------------------------

    #[tokio::test]
    async fn claim_due_takes_only_due_unclaimed_rows() {
        let db = test_db().await;
        let (due, _) = db.create_request(&new_request("u1", Some("p1"), 100), 100).await.unwrap();
        let (future, _) = db.create_request(&new_request("u2", Some("p1"), 10_000), 100).await.unwrap();
        let mut expired = new_request("u3", Some("p1"), 50);
        expired.expires_at = Some(90);
        db.create_request(&expired, 50).await.unwrap();

        let claimed = db.claim_due(200, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, due);
        assert_eq!(claimed[0].claimed_at, Some(200));
        assert_eq!(claimed[0].attempt_count, 1);
        assert_eq!(claimed[0].execution_status, Some(ExecutionStatus::Executing));

        // already claimed: not handed out again
        assert!(db.claim_due(300, 10).await.unwrap().is_empty());

        let f = db.get_request(future).await.unwrap().unwrap();
        assert_eq!(f.claimed_at, None);
    }

    #[tokio::test]
    async fn claim_due_honours_limit_and_order() {
        let db = test_db().await;
        let (b, _) = db.create_request(&new_request("u1", Some("p1"), 20), 0).await.unwrap();
        let (a, _) = db.create_request(&new_request("u2", Some("p1"), 10), 0).await.unwrap();
        let (c, _) = db.create_request(&new_request("u3", Some("p1"), 30), 0).await.unwrap();

        let first = db.claim_due(100, 2).await.unwrap();
        assert_eq!(first.iter().map(|r| r.id).collect::<Vec<_>>(), vec![a, b]);
        let second = db.claim_due(100, 2).await.unwrap();
        assert_eq!(second.iter().map(|r| r.id).collect::<Vec<_>>(), vec![c]);
    }

    #[tokio::test]
    async fn delayed_request_waits_for_delayed_until() {
        let db = test_db().await;
        let (id, _) = db.create_request(&new_request("u1", Some("p1"), 100), 100).await.unwrap();
        db.respond(id, UserResponse::Delay { minutes: 10 }, 100).await.unwrap();

        assert!(db.claim_due(600, 10).await.unwrap().is_empty());
        let claimed = db.claim_due(700, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].user_response.as_deref(), Some("delay"));
    }

    #[tokio::test]
    async fn concurrent_claims_partition_the_due_set() {
        let path = std::env::temp_dir().join(format!(
            "irrigation-claim-{}-{}.db",
            std::process::id(),
            crate::db::now_unix()
        ));
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let db = Db::connect(&url).await.unwrap();
        db.migrate().await.unwrap();

        for i in 0..40 {
            db.create_request(&new_request(&format!("u{i}"), Some("p1"), 10), 0)
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let db = db.clone();
            handles.push(tokio::spawn(async move { db.claim_due(100, 7).await.unwrap() }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for h in handles {
            for r in h.await.unwrap() {
                total += 1;
                assert!(seen.insert(r.id), "request {} claimed twice", r.id);
            }
        }
        assert_eq!(total, 40);
        assert_eq!(seen.len(), 40);

        db.pool().close().await;
        let _ = std::fs::remove_file(&path);
    }

    // -- Execution bookkeeping --------------------------------------------

    #[tokio::test]
    async fn started_then_executed() {
        let db = test_db().await;
        let (id, _) = db.create_request(&new_request("u1", Some("p1"), 100), 100).await.unwrap();
        db.claim_due(100, 10).await.unwrap();
        db.mark_execution_started(id, 45, 110).await.unwrap();

        let r = db.get_request(id).await.unwrap().unwrap();
        assert_eq!(r.status, RequestStatus::Executing);
        assert_eq!(r.planned_duration_s, Some(45));
        assert_eq!(r.last_attempt_at, Some(110));
        assert_eq!(db.executing_requests().await.unwrap().len(), 1);

        db.record_execution_result(id, true, Some(47), None).await.unwrap();
        let r = db.get_request(id).await.unwrap().unwrap();
        assert_eq!(r.status, RequestStatus::Executed);
        assert_eq!(r.execution_status, Some(ExecutionStatus::Completed));
        assert_eq!(r.actual_duration_s, Some(47));
        assert!(db.executing_requests().await.unwrap().is_empty());

        // terminal: finishing again is rejected
        let err = db.record_execution_result(id, false, None, Some("late")).await.unwrap_err();
        assert!(format!("{err:#}").contains("invalid transition"));
    }

    #[tokio::test]
    async fn cannot_finish_a_request_that_never_started() {
        let db = test_db().await;
        let (id, _) = db.create_request(&new_request("u1", Some("p1"), 100), 100).await.unwrap();
        let err = db.record_execution_result(id, true, Some(10), None).await.unwrap_err();
        assert!(format!("{err:#}").contains("pending -> executed"));
    }

    #[tokio::test]
    async fn release_claim_delays_then_fails_after_max_attempts() {
        let db = test_db().await;
        let (id, _) = db.create_request(&new_request("u1", Some("p1"), 100), 100).await.unwrap();

        db.claim_due(100, 10).await.unwrap();
        let s = db.release_claim(id, 400, 2, "lock busy").await.unwrap();
        assert_eq!(s, RequestStatus::Delayed);
        let r = db.get_request(id).await.unwrap().unwrap();
        assert_eq!(r.claimed_at, None);
        assert_eq!(r.execution_status, None);
        assert_eq!(r.delayed_until, Some(400));

        assert!(db.claim_due(300, 10).await.unwrap().is_empty());
        let again = db.claim_due(400, 10).await.unwrap();
        assert_eq!(again[0].attempt_count, 2);

        let s = db.release_claim(id, 700, 2, "lock busy").await.unwrap();
        assert_eq!(s, RequestStatus::Failed);
        let r = db.get_request(id).await.unwrap().unwrap();
        assert!(r.execution_error.unwrap().contains("gave up after 2 attempts"));
    }

    // -- Expiry -----------------------------------------------------------

    #[tokio::test]
    async fn expiry_sweep_moves_stale_pending_rows() {
        let db = test_db().await;
        let (id, _) = db.create_request(&new_request("u1", Some("p1"), 100), 100).await.unwrap();

        assert!(db.get_expired(3699).await.unwrap().is_empty());
        let expired = db.get_expired(3700).await.unwrap();
        assert_eq!(expired.len(), 1);

        db.expire(id).await.unwrap();
        let r = db.get_request(id).await.unwrap().unwrap();
        assert_eq!(r.status, RequestStatus::Expired);
        assert!(db.get_expired(5000).await.unwrap().is_empty());
        assert!(db.claim_due(5000, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claimed_requests_are_not_expired() {
        let db = test_db().await;
        let (id, _) = db.create_request(&new_request("u1", Some("p1"), 100), 100).await.unwrap();
        db.claim_due(100, 10).await.unwrap();
        assert!(db.get_expired(10_000).await.unwrap().is_empty());
        assert!(db.expire(id).await.is_err());
    }

    // -- Responses --------------------------------------------------------

    #[tokio::test]
    async fn respond_records_response_and_preference() {
        let db = test_db().await;
        let (id, _) = db.create_request(&new_request("u1", Some("p1"), 100), 100).await.unwrap();
        assert_eq!(
            db.respond(id, UserResponse::Approve, 150).await.unwrap(),
            RequestStatus::Approved
        );
        let r = db.get_request(id).await.unwrap().unwrap();
        assert_eq!(r.user_response.as_deref(), Some("approve"));
        assert_eq!(r.response_at, Some(150));
        assert_eq!(
            db.preference_count("alice", "u1", PreferenceCounter::Approval).await.unwrap(),
            1
        );

        db.respond(id, UserResponse::Cancel, 160).await.unwrap();
        assert!(db.respond(id, UserResponse::Approve, 170).await.is_err());
    }

    #[tokio::test]
    async fn auto_response_lands_once() {
        let db = test_db().await;
        let (id, _) = db.create_request(&new_request("u1", Some("p1"), 100), 100).await.unwrap();
        assert!(db.record_auto_response(id, 100).await.unwrap());
        assert!(!db.record_auto_response(id, 200).await.unwrap());
        assert_eq!(
            db.preference_count("alice", "u1", PreferenceCounter::Auto).await.unwrap(),
            1
        );
        let r = db.get_request(id).await.unwrap().unwrap();
        assert_eq!(r.user_response.as_deref(), Some("auto"));
        assert_eq!(r.response_at, Some(100));
    }
}
