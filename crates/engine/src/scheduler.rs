//! Periodic driver for the request lifecycle. One tokio task, one ticker;
//! every tick runs the sweeps in a fixed order:
//!
//! ```text
//! expire ──▶ claim + execute ──▶ complete ──▶ post-outcome ──▶ manual outcome
//! ```
//!
//! A failing step is logged and the tick moves on to the next one; nothing
//! here ever ends the loop.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::completion::{CompletionSweeper, SweepReport};
use crate::db::{now_unix, Db};
use crate::executor::ExecutionOrchestrator;
use crate::manual::ManualIrrigation;
use crate::outcome::{CaptureReport, PostOutcomeCapturer};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub expired: usize,
    pub executed: usize,
    pub execution_failed: usize,
    pub completion: SweepReport,
    pub outcomes: CaptureReport,
    pub manual: CaptureReport,
}

impl TickReport {
    fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Scheduler {
    db: Db,
    executor: ExecutionOrchestrator,
    completion: CompletionSweeper,
    outcomes: PostOutcomeCapturer,
    manual: Arc<ManualIrrigation>,
    claim_limit: i64,
}

impl Scheduler {
    pub fn new(
        db: Db,
        executor: ExecutionOrchestrator,
        completion: CompletionSweeper,
        outcomes: PostOutcomeCapturer,
        manual: Arc<ManualIrrigation>,
        claim_limit: i64,
    ) -> Self {
        Self {
            db,
            executor,
            completion,
            outcomes,
            manual,
            claim_limit,
        }
    }

    pub async fn tick(&self, now: i64) -> TickReport {
        let mut report = TickReport {
            expired: self.expire_sweep(now).await,
            ..TickReport::default()
        };

        let (executed, failed) = self.claim_and_execute(now).await;
        report.executed = executed;
        report.execution_failed = failed;

        report.completion = self.completion.sweep(now).await;
        report.outcomes = self.outcomes.capture(now).await;
        report.manual = self.manual.capture_manual_outcomes(now).await;
        report
    }

    async fn expire_sweep(&self, now: i64) -> usize {
        let expired = match self.db.get_expired(now).await {
            Ok(v) => v,
            Err(e) => {
                error!("scheduler: get_expired failed: {e:#}");
                return 0;
            }
        };

        let mut count = 0;
        for req in &expired {
            match self.db.expire(req.id).await {
                Ok(()) => {
                    info!(request_id = req.id, unit = %req.unit_id, "request expired");
                    count += 1;
                }
                Err(e) => warn!(request_id = req.id, "scheduler: expire failed: {e:#}"),
            }
        }
        count
    }

    async fn claim_and_execute(&self, now: i64) -> (usize, usize) {
        let claimed = match self.db.claim_due(now, self.claim_limit).await {
            Ok(v) => v,
            Err(e) => {
                error!("scheduler: claim_due failed: {e:#}");
                return (0, 0);
            }
        };

        let (mut ok, mut failed) = (0, 0);
        for req in &claimed {
            let outcome = self.executor.execute(req, now).await;
            if outcome.success {
                ok += 1;
            } else {
                failed += 1;
                warn!(
                    request_id = req.id,
                    unit = %req.unit_id,
                    error = outcome.error.as_deref().unwrap_or(""),
                    status = ?outcome.request_status,
                    "scheduler: execution did not start"
                );
            }
        }
        (ok, failed)
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the scheduler loop.  Intended to be `tokio::spawn`-ed from main.
pub async fn run(scheduler: Scheduler, tick_interval_sec: u64) {
    // Brief startup delay so the first telemetry readings can arrive before
    // the scheduler starts making decisions on empty data.
    tokio::time::sleep(Duration::from_secs(tick_interval_sec)).await;

    let mut ticker = tokio::time::interval(Duration::from_secs(tick_interval_sec));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(tick_sec = tick_interval_sec, "scheduler started");

    loop {
        ticker.tick().await;
        let report = scheduler.tick(now_unix()).await;
        if report.is_idle() {
            debug!("scheduler: idle tick");
        } else {
            info!(
                expired = report.expired,
                executed = report.executed,
                execution_failed = report.execution_failed,
                completed = report.completion.completed,
                completion_failed = report.completion.failed,
                outcomes = report.outcomes.captured,
                manual_outcomes = report.manual.captured,
                "scheduler tick"
            );
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
