//! Post-Outcome Capturer: once the water has settled, sample moisture again
//! and classify what the result says about the plant's settings.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::Db;
use crate::drydown::DrydownEstimator;
use crate::logs::ExecutionLog;
use crate::plants::PlantLookup;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribution {
    SensorIssue,
    AdjustThreshold,
    AdjustDuration,
    Unknown,
}

impl Attribution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SensorIssue => "sensor_issue",
            Self::AdjustThreshold => "adjust_threshold",
            Self::AdjustDuration => "adjust_duration",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Attribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn in_range(v: f64) -> bool {
    (0.0..=100.0).contains(&v)
}

/// Classification rules, first match wins:
/// - any value outside `[0, 100]` → `SensorIssue`
/// - watering started at or above the threshold → `AdjustThreshold`
/// - result overshot `threshold + hysteresis` or stayed under the
///   threshold → `AdjustDuration`
pub fn classify_attribution(
    trigger: f64,
    threshold: f64,
    post: f64,
    epsilon: f64,
    hysteresis_margin: f64,
) -> Attribution {
    if !in_range(trigger) || !in_range(threshold) || !in_range(post) {
        return Attribution::SensorIssue;
    }
    if trigger >= threshold - epsilon {
        return Attribution::AdjustThreshold;
    }
    if post > threshold + hysteresis_margin || post < threshold - epsilon {
        return Attribution::AdjustDuration;
    }
    Attribution::Unknown
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutcomeSettings {
    pub post_delay_sec: i64,
    pub epsilon: f64,
    pub hysteresis_margin: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CaptureReport {
    pub due: usize,
    pub captured: usize,
    /// No reading since watering yet; retried next sweep.
    pub skipped: usize,
}

pub struct PostOutcomeCapturer {
    db: Db,
    plants: Arc<dyn PlantLookup>,
    drydown: DrydownEstimator,
    settings: OutcomeSettings,
}

impl PostOutcomeCapturer {
    pub fn new(
        db: Db,
        plants: Arc<dyn PlantLookup>,
        drydown: DrydownEstimator,
        settings: OutcomeSettings,
    ) -> Self {
        Self {
            db,
            plants,
            drydown,
            settings,
        }
    }

    pub async fn capture(&self, now: i64) -> CaptureReport {
        let mut report = CaptureReport::default();
        let due = match self.db.pending_post_capture(now, self.settings.post_delay_sec).await {
            Ok(d) => d,
            Err(e) => {
                warn!("outcome: listing pending captures failed: {e:#}");
                return report;
            }
        };
        report.due = due.len();

        for log in &due {
            match self.capture_one(log, now).await {
                Some(_) => report.captured += 1,
                None => report.skipped += 1,
            }
        }
        report
    }

    /// Moisture sampled after the pump stopped; an older reading still
    /// describes the plant before watering and is never captured.
    async fn current_moisture(&self, log: &ExecutionLog, now: i64) -> Option<(String, f64)> {
        let plant = match &log.plant_id {
            Some(id) => self.plants.get_plant(id, &log.unit_id, now).await,
            None => self.plants.get_active_plant(&log.unit_id, now).await,
        };
        let watered_until =
            log.executed_at + log.actual_duration_s.unwrap_or(log.planned_duration_s);
        match plant {
            Ok(Some(p)) => match (p.moisture_level, p.moisture_at) {
                (Some(m), Some(ts)) if ts >= watered_until => Some((p.plant_id, m)),
                _ => None,
            },
            Ok(None) => None,
            Err(e) => {
                warn!(log_id = log.id, "outcome: plant lookup failed: {e:#}");
                None
            }
        }
    }

    async fn capture_one(&self, log: &ExecutionLog, now: i64) -> Option<Attribution> {
        let Some((plant_id, post)) = self.current_moisture(log, now).await else {
            debug!(log_id = log.id, unit = %log.unit_id, "outcome: no reading since watering yet");
            return None;
        };

        let delta = log.trigger_moisture.map(|t| post - t);
        let attribution = match (log.trigger_moisture, log.threshold) {
            (Some(trigger), Some(threshold)) => classify_attribution(
                trigger,
                threshold,
                post,
                self.settings.epsilon,
                self.settings.hysteresis_margin,
            ),
            _ if !in_range(post) => Attribution::SensorIssue,
            _ => Attribution::Unknown,
        };

        match self
            .db
            .record_post_capture(log.id, post, delta, attribution.as_str(), now)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(log_id = log.id, "outcome: already captured");
                return None;
            }
            Err(e) => {
                warn!(log_id = log.id, "outcome: capture write failed: {e:#}");
                return None;
            }
        }

        if let Some(request_id) = log.request_id {
            if let Err(e) = self.db.set_request_post_moisture(request_id, post).await {
                warn!(request_id, "outcome: request post moisture not stored: {e:#}");
            }
        }

        info!(
            log_id = log.id,
            unit = %log.unit_id,
            plant = %plant_id,
            post_moisture = post,
            delta = ?delta,
            %attribution,
            "post-watering outcome captured"
        );

        if let Err(e) = self
            .drydown
            .update(&plant_id, self.drydown.lookback_hours(), now)
            .await
        {
            warn!(plant = %plant_id, "outcome: dry-down refresh failed: {e:#}");
        }
        Some(attribution)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
