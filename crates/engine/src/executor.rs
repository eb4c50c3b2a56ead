//! Execution Orchestrator: turns one claimed request into a running pump.
//!
//! ```text
//! start ──▶ valve_open ──▶ pump_on ──▶ running ──(completion sweep)──▶ completed
//!   │            │             │
//!   └────────────┴─────────────┴──▶ failed (compensate, release lock)
//! ```
//!
//! `execute` returns as soon as the pump is on. The unit lock stays held
//! until the completion sweep stops the pump; on every failure path it is
//! released before `execute` returns.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::actuator::ActuatorControl;
use crate::db::Db;
use crate::duration::{DurationEstimator, EstimateInput, PumpCalibration};
use crate::lock::LockManager;
use crate::logs::{LogStatus, NewExecutionLog};
use crate::plants::PlantLookup;
use crate::requests::{IrrigationRequest, RequestStatus};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionSettings {
    pub lock_margin_sec: i64,
    pub retry_backoff_sec: i64,
    pub max_attempts: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionOutcome {
    pub request_id: i64,
    pub success: bool,
    pub error: Option<String>,
    pub execution_log_id: Option<i64>,
    pub planned_duration_s: Option<i64>,
    /// Where the request ended up, when it is known.
    pub request_status: Option<RequestStatus>,
}

impl ExecutionOutcome {
    fn started(request_id: i64, log_id: i64, duration: i64) -> Self {
        Self {
            request_id,
            success: true,
            error: None,
            execution_log_id: Some(log_id),
            planned_duration_s: Some(duration),
            request_status: Some(RequestStatus::Executing),
        }
    }

    fn failed(request_id: i64, error: impl Into<String>) -> Self {
        Self {
            request_id,
            success: false,
            error: Some(error.into()),
            execution_log_id: None,
            planned_duration_s: None,
            request_status: None,
        }
    }
}

/// Everything resolved before any actuator is touched.
struct Attempt<'a> {
    req: &'a IrrigationRequest,
    pump: String,
    valve: Option<String>,
    duration: i64,
    flow_rate: Option<f64>,
}

impl Attempt<'_> {
    fn log(&self, status: LogStatus, error: Option<String>, now: i64) -> NewExecutionLog {
        NewExecutionLog {
            request_id: Some(self.req.id),
            unit_id: self.req.unit_id.clone(),
            plant_id: self.req.plant_id.clone(),
            trigger_moisture: Some(self.req.detected_moisture),
            threshold: Some(self.req.threshold),
            planned_duration_s: self.duration,
            pump_actuator_id: Some(self.pump.clone()),
            valve_actuator_id: self.valve.clone(),
            flow_rate_ml_per_sec: self.flow_rate,
            status,
            error,
            executed_at: now,
        }
    }
}

/// A failed step after the lock was taken.
struct StepFailure {
    error: String,
    log_id: Option<i64>,
}

pub struct ExecutionOrchestrator {
    db: Db,
    locks: LockManager,
    actuators: Arc<dyn ActuatorControl>,
    plants: Arc<dyn PlantLookup>,
    durations: DurationEstimator,
    calibration: Arc<dyn PumpCalibration>,
    settings: ExecutionSettings,
}

impl ExecutionOrchestrator {
    pub fn new(
        db: Db,
        actuators: Arc<dyn ActuatorControl>,
        plants: Arc<dyn PlantLookup>,
        durations: DurationEstimator,
        calibration: Arc<dyn PumpCalibration>,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            locks: LockManager::new(db.clone()),
            db,
            actuators,
            plants,
            durations,
            calibration,
            settings,
        }
    }

    /// Runs one claimed request up to "pump on". Never returns an error:
    /// every failure is reported through [`ExecutionOutcome`].
    pub async fn execute(&self, req: &IrrigationRequest, now: i64) -> ExecutionOutcome {
        let unit = match self.db.get_unit(&req.unit_id).await {
            Ok(Some(u)) => u,
            Ok(None) => {
                return self
                    .refuse(req, None, format!("unknown unit '{}'", req.unit_id), now)
                    .await
            }
            Err(e) => {
                return self
                    .refuse(req, None, format!("unit lookup failed: {e:#}"), now)
                    .await
            }
        };

        if req.user_response.is_none() && unit.ml_learning_enabled {
            match self.db.record_auto_response(req.id, now).await {
                Ok(true) => info!(request_id = req.id, unit = %req.unit_id, "recorded auto response"),
                Ok(false) => {}
                Err(e) => warn!(request_id = req.id, "auto response not recorded: {e:#}"),
            }
        }

        // 1. actuators
        let Some(pump) = req.actuator_id.clone().or(unit.pump_actuator_id) else {
            return self.refuse(req, None, "no actuator configured".into(), now).await;
        };
        let valve = match &req.plant_id {
            Some(plant_id) => match self.plants.get_plant_valve_actuator_id(plant_id).await {
                Ok(v) => v,
                Err(e) => {
                    return self
                        .refuse(req, None, format!("valve lookup failed: {e:#}"), now)
                        .await
                }
            },
            None => None,
        };

        // 2. duration
        let estimate = self
            .durations
            .estimate(&EstimateInput {
                plant_id: req.plant_id.as_deref(),
                actuator_id: Some(pump.as_str()),
                environment: req.environment(),
                user_id: &req.user_id,
                unit_id: &req.unit_id,
                now,
            })
            .await;
        let duration = estimate.seconds.min(self.durations.max_seconds());

        let flow_rate = match self.calibration.get_flow_rate(&pump).await {
            Ok(rate) => rate,
            Err(e) => {
                warn!(actuator = %pump, "flow rate lookup failed: {e:#}");
                None
            }
        };

        let attempt = Attempt {
            req,
            pump,
            valve,
            duration,
            flow_rate,
        };

        // 3. lock
        let ttl = duration + self.settings.lock_margin_sec;
        if !self.locks.acquire(&req.unit_id, ttl, now).await {
            return self.refuse(req, Some(&attempt), "lock busy".into(), now).await;
        }

        match self.actuate(&attempt, now).await {
            Ok(log_id) => {
                info!(
                    request_id = req.id,
                    unit = %req.unit_id,
                    pump = %attempt.pump,
                    valve = ?attempt.valve,
                    duration_s = duration,
                    source = ?estimate.source,
                    "irrigation started"
                );
                ExecutionOutcome::started(req.id, log_id, duration)
            }
            Err(failure) => {
                self.release_lock(&req.unit_id).await;
                let status = self.fail_request(req.id, &failure.error).await;
                warn!(request_id = req.id, unit = %req.unit_id, "irrigation failed: {}", failure.error);
                ExecutionOutcome {
                    execution_log_id: failure.log_id,
                    planned_duration_s: Some(duration),
                    request_status: status,
                    ..ExecutionOutcome::failed(req.id, failure.error)
                }
            }
        }
    }

    /// Steps 4-6. The caller holds the unit lock and releases it on `Err`.
    async fn actuate(&self, a: &Attempt<'_>, now: i64) -> Result<i64, StepFailure> {
        // 4. valve before pump
        if let Some(valve) = &a.valve {
            let resp = self.actuators.turn_on(valve).await;
            if resp.is_failure() {
                let error = resp.describe(valve, "valve open");
                let log_id = self.write_failed_log(a, &error, now).await;
                return Err(StepFailure { error, log_id });
            }
        }

        // 5. durable record before the pump runs
        let log_id = match self.record_start(a, now).await {
            Ok(id) => id,
            Err(e) => {
                self.close_valve(a).await;
                return Err(StepFailure {
                    error: format!("bookkeeping failed: {e:#}"),
                    log_id: None,
                });
            }
        };

        // 6. pump
        let resp = self.actuators.turn_on(&a.pump).await;
        if resp.is_failure() {
            let error = resp.describe(&a.pump, "pump on");
            self.close_valve(a).await;
            if let Err(e) = self
                .db
                .finalize_execution_log(log_id, LogStatus::Failed, Some(0), None, Some(&error))
                .await
            {
                warn!(log_id, "could not mark execution log failed: {e:#}");
            }
            return Err(StepFailure {
                error,
                log_id: Some(log_id),
            });
        }

        Ok(log_id)
    }

    async fn record_start(&self, a: &Attempt<'_>, now: i64) -> anyhow::Result<i64> {
        self.db
            .mark_execution_started(a.req.id, a.duration, now)
            .await?;
        self.db
            .create_execution_log(&a.log(LogStatus::Started, None, now))
            .await
    }

    /// Admission failure: nothing was actuated. The claim is handed back so
    /// a later tick can retry, up to the attempt cap.
    async fn refuse(
        &self,
        req: &IrrigationRequest,
        attempt: Option<&Attempt<'_>>,
        reason: String,
        now: i64,
    ) -> ExecutionOutcome {
        let log_id = match attempt {
            Some(a) => self.write_failed_log(a, &reason, now).await,
            None => {
                let log = NewExecutionLog {
                    request_id: Some(req.id),
                    unit_id: req.unit_id.clone(),
                    plant_id: req.plant_id.clone(),
                    trigger_moisture: Some(req.detected_moisture),
                    threshold: Some(req.threshold),
                    planned_duration_s: 0,
                    pump_actuator_id: req.actuator_id.clone(),
                    valve_actuator_id: None,
                    flow_rate_ml_per_sec: None,
                    status: LogStatus::Failed,
                    error: Some(reason.clone()),
                    executed_at: now,
                };
                match self.db.create_execution_log(&log).await {
                    Ok(id) => Some(id),
                    Err(e) => {
                        warn!(request_id = req.id, "could not log refused execution: {e:#}");
                        None
                    }
                }
            }
        };

        let status = match self
            .db
            .release_claim(
                req.id,
                now + self.settings.retry_backoff_sec,
                self.settings.max_attempts,
                &reason,
            )
            .await
        {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(request_id = req.id, "could not release claim: {e:#}");
                None
            }
        };

        info!(request_id = req.id, unit = %req.unit_id, ?status, "execution refused: {reason}");
        ExecutionOutcome {
            execution_log_id: log_id,
            request_status: status,
            ..ExecutionOutcome::failed(req.id, reason)
        }
    }

    async fn write_failed_log(&self, a: &Attempt<'_>, error: &str, now: i64) -> Option<i64> {
        match self
            .db
            .create_execution_log(&a.log(LogStatus::Failed, Some(error.to_string()), now))
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(request_id = a.req.id, "could not log failed execution: {e:#}");
                None
            }
        }
    }

    async fn fail_request(&self, id: i64, error: &str) -> Option<RequestStatus> {
        match self.db.record_execution_result(id, false, Some(0), Some(error)).await {
            Ok(()) => Some(RequestStatus::Failed),
            Err(e) => {
                warn!(request_id = id, "could not mark request failed: {e:#}");
                None
            }
        }
    }

    async fn close_valve(&self, a: &Attempt<'_>) {
        let Some(valve) = &a.valve else { return };
        let resp = self.actuators.turn_off(valve).await;
        if resp.is_failure() {
            warn!(
                request_id = a.req.id,
                unit = %a.req.unit_id,
                actuator = %valve,
                "compensation: {}",
                resp.describe(valve, "valve close")
            );
        }
    }

    async fn release_lock(&self, unit_id: &str) {
        if !self.locks.release(unit_id).await {
            warn!(unit = %unit_id, "compensation: lock release failed, it expires with its TTL");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::actuator::{ActuatorState, Command, MockActuators};
    use crate::db::tests::seeded_db;
    use crate::db::PreferenceCounter;
    use crate::duration::tests::limits;
    use crate::plants::StorePlants;
    use crate::requests::tests::new_request;
    use crate::requests::UserResponse;

    pub(crate) const NOW: i64 = 1_700_000_000;

    pub(crate) fn settings() -> ExecutionSettings {
        ExecutionSettings {
            lock_margin_sec: 120,
            retry_backoff_sec: 300,
            max_attempts: 5,
        }
    }

    pub(crate) fn orchestrator(db: &Db, board: Arc<MockActuators>) -> ExecutionOrchestrator {
        let calibration: Arc<dyn PumpCalibration> = Arc::new(db.clone());
        ExecutionOrchestrator::new(
            db.clone(),
            board,
            Arc::new(StorePlants::new(db.clone(), 1800)),
            DurationEstimator::new(None, calibration.clone(), db.clone(), limits()),
            calibration,
            settings(),
        )
    }

    pub(crate) fn board() -> Arc<MockActuators> {
        Arc::new(MockActuators::new(&["pump-1".to_string(), "valve-1".to_string()]))
    }

    /// Seeds a due request and claims it.
    pub(crate) async fn claimed(db: &Db) -> IrrigationRequest {
        db.create_request(&new_request("u1", Some("p1"), NOW - 10), NOW - 10)
            .await
            .unwrap();
        db.claim_due(NOW, 10).await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn happy_path_opens_valve_then_pump_and_keeps_lock() {
        let db = seeded_db(Some("pump-1"), Some("valve-1")).await;
        let b = board();
        let req = claimed(&db).await;

        let out = orchestrator(&db, b.clone()).execute(&req, NOW).await;
        assert!(out.success, "{out:?}");
        assert_eq!(out.planned_duration_s, Some(30));
        assert_eq!(
            b.calls(),
            vec![
                ("valve-1".to_string(), Command::On),
                ("pump-1".to_string(), Command::On),
            ]
        );

        let r = db.get_request(req.id).await.unwrap().unwrap();
        assert_eq!(r.status, RequestStatus::Executing);
        assert_eq!(r.planned_duration_s, Some(30));
        assert_eq!(r.last_attempt_at, Some(NOW));

        let log = db.started_log_for_request(req.id).await.unwrap().unwrap();
        assert_eq!(Some(log.id), out.execution_log_id);
        assert_eq!(log.valve_actuator_id.as_deref(), Some("valve-1"));

        // lock held until the completion sweep: 30 s + 120 s margin
        let locks = LockManager::new(db.clone());
        assert_eq!(locks.locked_until("u1").await.unwrap(), Some(NOW + 150));
    }

    #[tokio::test]
    async fn valve_failure_never_starts_pump() {
        let db = seeded_db(Some("pump-1"), Some("valve-1")).await;
        let b = board();
        b.fail("valve-1", Command::On, ActuatorState::Error);
        let req = claimed(&db).await;

        let out = orchestrator(&db, b.clone()).execute(&req, NOW).await;
        assert!(!out.success);
        assert!(b.calls().iter().all(|(id, _)| id != "pump-1"));
        assert!(!b.is_on("pump-1"));

        assert_eq!(LockManager::new(db.clone()).locked_until("u1").await.unwrap(), None);
        let r = db.get_request(req.id).await.unwrap().unwrap();
        assert_eq!(r.status, RequestStatus::Failed);
        let logs = db.execution_logs_for_request(req.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].execution_status, LogStatus::Failed);
    }

    #[tokio::test]
    async fn pump_failure_closes_valve_and_fails_everything() {
        let db = seeded_db(Some("pump-1"), Some("valve-1")).await;
        let b = board();
        b.fail("pump-1", Command::On, ActuatorState::Unavailable);
        let req = claimed(&db).await;

        let out = orchestrator(&db, b.clone()).execute(&req, NOW).await;
        assert!(!out.success);
        assert!(out.error.as_deref().unwrap().contains("unavailable"));
        assert_eq!(
            b.calls(),
            vec![
                ("valve-1".to_string(), Command::On),
                ("pump-1".to_string(), Command::On),
                ("valve-1".to_string(), Command::Off),
            ]
        );
        assert!(!b.is_on("valve-1"));

        assert_eq!(LockManager::new(db.clone()).locked_until("u1").await.unwrap(), None);
        assert_eq!(out.request_status, Some(RequestStatus::Failed));
        let log = db.get_execution_log(out.execution_log_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(log.execution_status, LogStatus::Failed);
    }

    #[tokio::test]
    async fn compensation_errors_are_swallowed() {
        let db = seeded_db(Some("pump-1"), Some("valve-1")).await;
        let b = board();
        b.fail("pump-1", Command::On, ActuatorState::Error);
        b.fail("valve-1", Command::Off, ActuatorState::Error);
        let req = claimed(&db).await;

        let out = orchestrator(&db, b).execute(&req, NOW).await;
        assert!(!out.success);
        // the original failure is reported, not the compensation one
        assert!(out.error.as_deref().unwrap().contains("pump on"));
        assert_eq!(LockManager::new(db.clone()).locked_until("u1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn bookkeeping_failure_closes_valve_and_releases_lock() {
        let db = seeded_db(Some("pump-1"), Some("valve-1")).await;
        let b = board();
        let req = claimed(&db).await;
        // the row moves on under the orchestrator's feet
        sqlx::query("UPDATE pending_irrigation_requests SET status = 'cancelled' WHERE id = ?")
            .bind(req.id)
            .execute(db.pool())
            .await
            .unwrap();

        let out = orchestrator(&db, b.clone()).execute(&req, NOW).await;
        assert!(!out.success);
        assert!(out.error.as_deref().unwrap().contains("bookkeeping"));
        assert!(!b.is_on("valve-1"));
        assert!(b.calls().iter().all(|(id, _)| id != "pump-1"));
        assert_eq!(LockManager::new(db.clone()).locked_until("u1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn busy_lock_touches_no_actuator_and_requeues() {
        let db = seeded_db(Some("pump-1"), Some("valve-1")).await;
        let b = board();
        let locks = LockManager::new(db.clone());
        assert!(locks.acquire("u1", 600, NOW - 5).await);
        let req = claimed(&db).await;

        let out = orchestrator(&db, b.clone()).execute(&req, NOW).await;
        assert!(!out.success);
        assert_eq!(out.error.as_deref(), Some("lock busy"));
        assert!(b.calls().is_empty());
        // someone else's lease is untouched
        assert_eq!(locks.locked_until("u1").await.unwrap(), Some(NOW + 595));

        assert_eq!(out.request_status, Some(RequestStatus::Delayed));
        let r = db.get_request(req.id).await.unwrap().unwrap();
        assert_eq!(r.claimed_at, None);
        assert_eq!(r.delayed_until, Some(NOW + 300));
        let logs = db.execution_logs_for_request(req.id).await.unwrap();
        assert_eq!(logs[0].execution_error.as_deref(), Some("lock busy"));
    }

    #[tokio::test]
    async fn missing_actuator_is_an_admission_failure() {
        let db = seeded_db(None, None).await;
        let b = board();
        let req = claimed(&db).await;

        let out = orchestrator(&db, b.clone()).execute(&req, NOW).await;
        assert!(!out.success);
        assert_eq!(out.error.as_deref(), Some("no actuator configured"));
        assert!(b.calls().is_empty());
        assert_eq!(out.request_status, Some(RequestStatus::Delayed));
    }

    #[tokio::test]
    async fn attempt_cap_turns_refusal_into_failure() {
        let db = seeded_db(None, None).await;
        let orch = orchestrator(&db, board());
        let req = claimed(&db).await;
        let mut now = NOW;
        let mut out = orch.execute(&req, now).await;
        for _ in 0..10 {
            if out.request_status == Some(RequestStatus::Failed) {
                break;
            }
            now += 301;
            let next = db.claim_due(now, 10).await.unwrap().remove(0);
            out = orch.execute(&next, now).await;
        }
        assert_eq!(out.request_status, Some(RequestStatus::Failed));
        let r = db.get_request(req.id).await.unwrap().unwrap();
        assert_eq!(r.attempt_count, 5);
    }

    #[tokio::test]
    async fn auto_response_recorded_once() {
        let db = seeded_db(None, None).await;
        let orch = orchestrator(&db, board());
        let req = claimed(&db).await;
        orch.execute(&req, NOW).await;

        let again = db.claim_due(NOW + 301, 10).await.unwrap().remove(0);
        assert_eq!(again.user_response.as_deref(), Some("auto"));
        orch.execute(&again, NOW + 301).await;
        // a stale copy without the response must not count twice either
        orch.execute(&req, NOW + 302).await;

        assert_eq!(
            db.preference_count("alice", "u1", PreferenceCounter::Auto).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn answered_request_gets_no_auto_response() {
        let db = seeded_db(Some("pump-1"), None).await;
        let (id, _) = db
            .create_request(&new_request("u1", Some("p1"), NOW - 10), NOW - 10)
            .await
            .unwrap();
        db.respond(id, UserResponse::Approve, NOW - 5).await.unwrap();
        let req = db.claim_due(NOW, 10).await.unwrap().remove(0);

        let out = orchestrator(&db, board()).execute(&req, NOW).await;
        assert!(out.success);
        assert_eq!(
            db.preference_count("alice", "u1", PreferenceCounter::Auto).await.unwrap(),
            0
        );
    }
}
