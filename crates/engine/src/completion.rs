//! Completion Sweeper: stops pumps whose planned run has elapsed, finalises
//! the request and its execution log, then closes the valve and releases
//! the unit lock whatever happened before. Only the sweep that takes
//! ownership of an attempt touches its actuators or its lock.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::actuator::ActuatorControl;
use crate::db::Db;
use crate::duration::PumpCalibration;
use crate::lock::LockManager;
use crate::logs::{ExecutionLog, LogStatus};
use crate::notify::Notifier;
use crate::plants::PlantLookup;
use crate::requests::IrrigationRequest;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionResult {
    pub request_id: i64,
    pub success: bool,
    pub error: Option<String>,
    pub actual_duration_s: i64,
    pub estimated_volume_ml: Option<f64>,
    pub feedback_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    pub completed: usize,
    pub failed: usize,
}

pub struct CompletionSweeper {
    db: Db,
    locks: LockManager,
    actuators: Arc<dyn ActuatorControl>,
    plants: Arc<dyn PlantLookup>,
    calibration: Arc<dyn PumpCalibration>,
    notifier: Arc<dyn Notifier>,
}

impl CompletionSweeper {
    pub fn new(
        db: Db,
        actuators: Arc<dyn ActuatorControl>,
        plants: Arc<dyn PlantLookup>,
        calibration: Arc<dyn PumpCalibration>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            locks: LockManager::new(db.clone()),
            db,
            actuators,
            plants,
            calibration,
            notifier,
        }
    }

    pub async fn sweep(&self, now: i64) -> SweepReport {
        let mut report = SweepReport::default();
        let running = match self.db.executing_requests().await {
            Ok(r) => r,
            Err(e) => {
                warn!("completion: listing executing requests failed: {e:#}");
                return report;
            }
        };

        for req in running {
            report.checked += 1;
            let (Some(started), Some(planned)) = (req.last_attempt_at, req.planned_duration_s) else {
                continue;
            };
            if now < started + planned {
                debug!(request_id = req.id, remaining_s = started + planned - now, "still watering");
                continue;
            }
            match self.complete(&req, started, now).await {
                Some(r) if r.success => report.completed += 1,
                Some(_) => report.failed += 1,
                None => {}
            }
        }
        report
    }

    /// Stops one request. `None` when another sweep already owns (or has
    /// finished) this attempt. Otherwise valve close and lock release run
    /// on every path.
    pub async fn complete(
        &self,
        req: &IrrigationRequest,
        started: i64,
        now: i64,
    ) -> Option<CompletionResult> {
        match self.db.begin_completion(req.id, started).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(request_id = req.id, "completion: attempt already finalised elsewhere");
                return None;
            }
            Err(e) => {
                warn!(request_id = req.id, "completion: taking ownership failed: {e:#}");
                return None;
            }
        }

        let log = match self.db.started_log_for_request(req.id).await {
            Ok(l) => l,
            Err(e) => {
                warn!(request_id = req.id, "completion: log lookup failed: {e:#}");
                None
            }
        };

        let mut result = self.stop_and_record(req, log.as_ref(), started, now).await;

        self.close_valve(req, log.as_ref()).await;
        if !self.locks.release(&req.unit_id).await {
            warn!(unit = %req.unit_id, request_id = req.id, "completion: lock release failed, it expires with its TTL");
        }

        if result.success {
            result.feedback_id = self.request_feedback(req, log.as_ref()).await;
            info!(
                request_id = req.id,
                unit = %req.unit_id,
                actual_s = result.actual_duration_s,
                volume_ml = ?result.estimated_volume_ml,
                "irrigation completed"
            );
        } else {
            warn!(
                request_id = req.id,
                unit = %req.unit_id,
                "irrigation finished with error: {}",
                result.error.as_deref().unwrap_or("unknown")
            );
        }
        Some(result)
    }

    async fn stop_and_record(
        &self,
        req: &IrrigationRequest,
        log: Option<&ExecutionLog>,
        started: i64,
        now: i64,
    ) -> CompletionResult {
        let pump = match log.and_then(|l| l.pump_actuator_id.clone()) {
            Some(p) => Some(p),
            None => match &req.actuator_id {
                Some(a) => Some(a.clone()),
                None => self
                    .db
                    .get_unit(&req.unit_id)
                    .await
                    .ok()
                    .flatten()
                    .and_then(|u| u.pump_actuator_id),
            },
        };

        let wall_clock = (now - started).max(0);
        let (mut error, actual) = match &pump {
            Some(pump) => {
                let resp = self.actuators.turn_off(pump).await;
                let actual = resp
                    .runtime_seconds
                    .map(|s| s.round() as i64)
                    .unwrap_or(wall_clock);
                if resp.is_failure() {
                    (Some(resp.describe(pump, "pump off")), actual)
                } else {
                    (None, actual)
                }
            }
            None => (Some("pump actuator unknown".to_string()), wall_clock),
        };

        let volume = match &pump {
            Some(pump) if error.is_none() => match self.calibration.get_flow_rate(pump).await {
                Ok(Some(rate)) => Some(rate * actual as f64),
                Ok(None) => None,
                Err(e) => {
                    warn!(actuator = %pump, "completion: flow rate lookup failed: {e:#}");
                    None
                }
            },
            _ => None,
        };

        let status = if error.is_none() {
            LogStatus::Completed
        } else {
            LogStatus::Failed
        };
        if let Some(log) = log {
            if let Err(e) = self
                .db
                .finalize_execution_log(log.id, status, Some(actual), volume, error.as_deref())
                .await
            {
                warn!(log_id = log.id, "completion: finalising log failed: {e:#}");
                error.get_or_insert_with(|| format!("bookkeeping failed: {e:#}"));
            }
        }

        if let Err(e) = self
            .db
            .record_execution_result(req.id, error.is_none(), Some(actual), error.as_deref())
            .await
        {
            warn!(request_id = req.id, "completion: recording result failed: {e:#}");
            error.get_or_insert_with(|| format!("bookkeeping failed: {e:#}"));
        }

        CompletionResult {
            request_id: req.id,
            success: error.is_none(),
            error,
            actual_duration_s: actual,
            estimated_volume_ml: volume,
            feedback_id: None,
        }
    }

    async fn close_valve(&self, req: &IrrigationRequest, log: Option<&ExecutionLog>) {
        let valve = match log {
            Some(l) => l.valve_actuator_id.clone(),
            None => match &req.plant_id {
                Some(plant_id) => self
                    .plants
                    .get_plant_valve_actuator_id(plant_id)
                    .await
                    .unwrap_or_else(|e| {
                        warn!(plant = %plant_id, "completion: valve lookup failed: {e:#}");
                        None
                    }),
                None => None,
            },
        };
        let Some(valve) = valve else { return };
        let resp = self.actuators.turn_off(&valve).await;
        if resp.is_failure() {
            warn!(
                request_id = req.id,
                unit = %req.unit_id,
                actuator = %valve,
                "completion: {}",
                resp.describe(&valve, "valve close")
            );
        }
    }

    async fn request_feedback(&self, req: &IrrigationRequest, log: Option<&ExecutionLog>) -> Option<i64> {
        let log = log?;
        let unit = match self.db.get_unit(&req.unit_id).await {
            Ok(Some(u)) if u.feedback_enabled => u,
            Ok(_) => return None,
            Err(e) => {
                warn!(unit = %req.unit_id, "completion: unit lookup failed: {e:#}");
                return None;
            }
        };
        match self
            .notifier
            .request_irrigation_feedback(&unit.unit_id, &unit.user_id, log.id)
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(unit = %unit.unit_id, "completion: feedback request failed: {e:#}");
                None
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
