//! Watering duration: calculator result (or a fixed default), scaled by the
//! user's feedback history, clamped to a hard safety window.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::db::{Db, FeedbackCounts};
use crate::requests::EnvironmentSnapshot;

/// Fewer answered feedback prompts than this leave the duration unscaled.
const MIN_FEEDBACK_SAMPLES: i64 = 3;
const FEEDBACK_STEP: f64 = 0.1;
const MAX_FEEDBACK_ADJUSTMENT: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationCalculation {
    pub duration_seconds: f64,
    pub water_volume_ml: f64,
    pub confidence: f64,
    /// Already corrected by a learned model; feedback scaling is skipped.
    pub ml_adjusted: bool,
}

#[async_trait]
pub trait DurationCalculator: Send + Sync {
    /// `now` bounds which readings count as current.
    async fn calculate(&self, plant_id: &str, flow_rate: f64, now: i64) -> Result<DurationCalculation>;

    /// Model-assisted variant. `Ok(None)` means no model is available and the
    /// caller should use [`DurationCalculator::calculate`].
    async fn calculate_with_ml(
        &self,
        _plant_id: &str,
        _flow_rate: f64,
        _environment: &EnvironmentSnapshot,
    ) -> Result<Option<DurationCalculation>> {
        Ok(None)
    }
}

#[async_trait]
pub trait PumpCalibration: Send + Sync {
    /// Calibrated flow in ml/s.
    async fn get_flow_rate(&self, actuator_id: &str) -> Result<Option<f64>>;
}

#[async_trait]
impl PumpCalibration for Db {
    async fn get_flow_rate(&self, actuator_id: &str) -> Result<Option<f64>> {
        self.flow_rate(actuator_id).await
    }
}

/// Water the plant from its current moisture up to its target:
/// `(target - current) * ml_per_point / flow_rate`. Without a fresh reading
/// the plant is assumed to sit at its threshold.
pub struct FormulaCalculator {
    db: Db,
    stale_after_sec: i64,
}

impl FormulaCalculator {
    pub fn new(db: Db, stale_after_sec: i64) -> Self {
        Self { db, stale_after_sec }
    }
}

#[async_trait]
impl DurationCalculator for FormulaCalculator {
    async fn calculate(&self, plant_id: &str, flow_rate: f64, now: i64) -> Result<DurationCalculation> {
        if flow_rate <= 0.0 {
            bail!("flow rate must be positive, got {flow_rate}");
        }
        let Some(plant) = self.db.get_plant_config(plant_id).await? else {
            bail!("unknown plant '{plant_id}'");
        };

        let current = match &plant.sensor_id {
            Some(sensor_id) => self
                .db
                .latest_reading_between(sensor_id, now - self.stale_after_sec, now)
                .await?
                .map(|r| r.moisture),
            None => None,
        };

        let (from, confidence) = match current {
            Some(m) => (m, 0.8),
            None => (plant.threshold, 0.5),
        };
        let deficit = (plant.target_moisture - from).max(0.0);
        let water_volume_ml = deficit * plant.ml_per_point;

        Ok(DurationCalculation {
            duration_seconds: water_volume_ml / flow_rate,
            water_volume_ml,
            confidence,
            ml_adjusted: false,
        })
    }
}

/// Fixed limits and fallbacks for [`DurationEstimator`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationLimits {
    pub default_seconds: i64,
    pub min_seconds: i64,
    pub max_seconds: i64,
    pub default_flow_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationSource {
    Formula,
    Model,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationEstimate {
    pub seconds: i64,
    pub source: DurationSource,
    pub volume_factor: f64,
}

/// `1 + clamp(net * 0.1, -0.2, 0.2)` with `net = (too_little - too_much) / total`,
/// or 1.0 below the sample floor.
pub fn volume_adjustment_factor(counts: &FeedbackCounts) -> f64 {
    let total = counts.total();
    if total < MIN_FEEDBACK_SAMPLES {
        return 1.0;
    }
    let net = (counts.too_little - counts.too_much) as f64 / total as f64;
    1.0 + (net * FEEDBACK_STEP).clamp(-MAX_FEEDBACK_ADJUSTMENT, MAX_FEEDBACK_ADJUSTMENT)
}

pub struct DurationEstimator {
    calculator: Option<Arc<dyn DurationCalculator>>,
    calibration: Arc<dyn PumpCalibration>,
    db: Db,
    limits: DurationLimits,
}

pub struct EstimateInput<'a> {
    pub plant_id: Option<&'a str>,
    pub actuator_id: Option<&'a str>,
    pub environment: Option<&'a EnvironmentSnapshot>,
    pub user_id: &'a str,
    pub unit_id: &'a str,
    pub now: i64,
}

impl DurationEstimator {
    pub fn new(
        calculator: Option<Arc<dyn DurationCalculator>>,
        calibration: Arc<dyn PumpCalibration>,
        db: Db,
        limits: DurationLimits,
    ) -> Self {
        Self {
            calculator,
            calibration,
            db,
            limits,
        }
    }

    pub fn max_seconds(&self) -> i64 {
        self.limits.max_seconds
    }

    /// Never fails: any collaborator error falls back to the default duration.
    pub async fn estimate(&self, input: &EstimateInput<'_>) -> DurationEstimate {
        let (raw, source) = self.base_duration(input).await;

        let mut factor = 1.0;
        if source != DurationSource::Model {
            match self.db.feedback_counts(input.user_id, input.unit_id).await {
                Ok(counts) => factor = volume_adjustment_factor(&counts),
                Err(e) => warn!(unit = %input.unit_id, "duration: feedback lookup failed: {e:#}"),
            }
        }

        let seconds = self.clamp(raw * factor);
        debug!(
            unit = %input.unit_id,
            raw_seconds = raw,
            factor,
            seconds,
            ?source,
            "duration estimated"
        );
        DurationEstimate {
            seconds,
            source,
            volume_factor: factor,
        }
    }

    fn clamp(&self, seconds: f64) -> i64 {
        let s = if seconds.is_finite() {
            seconds.round() as i64
        } else {
            self.limits.default_seconds
        };
        s.clamp(self.limits.min_seconds, self.limits.max_seconds)
    }

    async fn base_duration(&self, input: &EstimateInput<'_>) -> (f64, DurationSource) {
        let fallback = (self.limits.default_seconds as f64, DurationSource::Default);
        let (Some(calc), Some(plant_id)) = (&self.calculator, input.plant_id) else {
            return fallback;
        };

        let flow_rate = match input.actuator_id {
            Some(id) => match self.calibration.get_flow_rate(id).await {
                Ok(rate) => rate,
                Err(e) => {
                    warn!(actuator = %id, "duration: calibration lookup failed: {e:#}");
                    None
                }
            },
            None => None,
        }
        .unwrap_or(self.limits.default_flow_rate);

        if let Some(env) = input.environment {
            match calc.calculate_with_ml(plant_id, flow_rate, env).await {
                Ok(Some(c)) => {
                    let source = if c.ml_adjusted {
                        DurationSource::Model
                    } else {
                        DurationSource::Formula
                    };
                    return (c.duration_seconds, source);
                }
                Ok(None) => {}
                Err(e) => warn!(plant = %plant_id, "duration: model calculation failed: {e:#}"),
            }
        }

        match calc.calculate(plant_id, flow_rate, input.now).await {
            Ok(c) => (c.duration_seconds, DurationSource::Formula),
            Err(e) => {
                warn!(plant = %plant_id, "duration: calculation failed, using default: {e:#}");
                fallback
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::tests::{seeded_db, test_db};
    use crate::db::FeedbackResponse;

    /// Calculator returning a fixed result, optionally from the model path.
    pub(crate) struct FixedCalculator {
        pub seconds: f64,
        pub ml: Option<f64>,
        pub fail: bool,
    }

    #[async_trait]
    impl DurationCalculator for FixedCalculator {
        async fn calculate(&self, _plant_id: &str, _flow_rate: f64, _now: i64) -> Result<DurationCalculation> {
            if self.fail {
                bail!("calculator offline");
            }
            Ok(DurationCalculation {
                duration_seconds: self.seconds,
                water_volume_ml: self.seconds * 10.0,
                confidence: 0.9,
                ml_adjusted: false,
            })
        }

        async fn calculate_with_ml(
            &self,
            _plant_id: &str,
            _flow_rate: f64,
            _environment: &EnvironmentSnapshot,
        ) -> Result<Option<DurationCalculation>> {
            Ok(self.ml.map(|s| DurationCalculation {
                duration_seconds: s,
                water_volume_ml: s * 10.0,
                confidence: 0.7,
                ml_adjusted: true,
            }))
        }
    }

    const NOW: i64 = 1_700_000_000;

    pub(crate) fn limits() -> DurationLimits {
        DurationLimits {
            default_seconds: 30,
            min_seconds: 5,
            max_seconds: 900,
            default_flow_rate: 10.0,
        }
    }

    fn input<'a>(plant: Option<&'a str>, env: Option<&'a EnvironmentSnapshot>) -> EstimateInput<'a> {
        EstimateInput {
            plant_id: plant,
            actuator_id: Some("pump-1"),
            environment: env,
            user_id: "alice",
            unit_id: "u1",
            now: NOW,
        }
    }

    async fn seed_feedback(db: &Db, responses: &[FeedbackResponse]) {
        sqlx::query(
            "INSERT INTO irrigation_execution_logs (unit_id, planned_duration_s, execution_status, executed_at)
             VALUES ('u1', 30, 'completed', 0)",
        )
        .execute(db.pool())
        .await
        .unwrap();
        for r in responses {
            let id = db.create_feedback_request("u1", "alice", 1, 0).await.unwrap();
            db.record_feedback_response(id, *r, 1).await.unwrap();
        }
    }

    fn estimator(db: Db, calc: Option<FixedCalculator>) -> DurationEstimator {
        let calibration: Arc<dyn PumpCalibration> = Arc::new(db.clone());
        DurationEstimator::new(
            calc.map(|c| Arc::new(c) as Arc<dyn DurationCalculator>),
            calibration,
            db,
            limits(),
        )
    }

    // -- volume_adjustment_factor -----------------------------------------

    #[test]
    fn factor_needs_three_samples() {
        let c = FeedbackCounts { too_little: 2, too_much: 0, just_right: 0 };
        assert_eq!(volume_adjustment_factor(&c), 1.0);
    }

    #[test]
    fn factor_follows_net_ratio() {
        let all_little = FeedbackCounts { too_little: 3, too_much: 0, just_right: 0 };
        assert!((volume_adjustment_factor(&all_little) - 1.1).abs() < 1e-9);
        let mixed = FeedbackCounts { too_little: 1, too_much: 3, just_right: 0 };
        assert!((volume_adjustment_factor(&mixed) - 0.95).abs() < 1e-9);
        let balanced = FeedbackCounts { too_little: 2, too_much: 2, just_right: 5 };
        assert_eq!(volume_adjustment_factor(&balanced), 1.0);
    }

    #[test]
    fn factor_stays_within_bounds() {
        for too_little in 0..25 {
            for too_much in 0..25 {
                for just_right in [0, 1, 7] {
                    let c = FeedbackCounts { too_little, too_much, just_right };
                    let f = volume_adjustment_factor(&c);
                    assert!((0.8..=1.2).contains(&f), "{c:?} -> {f}");
                }
            }
        }
    }

    // -- DurationEstimator ------------------------------------------------

    #[tokio::test]
    async fn no_calculator_uses_default() {
        let est = estimator(test_db().await, None).estimate(&input(Some("p1"), None)).await;
        assert_eq!(est.seconds, 30);
        assert_eq!(est.source, DurationSource::Default);
    }

    #[tokio::test]
    async fn no_plant_uses_default() {
        let calc = FixedCalculator { seconds: 120.0, ml: None, fail: false };
        let est = estimator(test_db().await, Some(calc)).estimate(&input(None, None)).await;
        assert_eq!(est.seconds, 30);
        assert_eq!(est.source, DurationSource::Default);
    }

    #[tokio::test]
    async fn long_calculation_is_clamped_to_max() {
        let calc = FixedCalculator { seconds: 2000.0, ml: None, fail: false };
        let est = estimator(test_db().await, Some(calc)).estimate(&input(Some("p1"), None)).await;
        assert_eq!(est.seconds, 900);
        assert_eq!(est.source, DurationSource::Formula);
    }

    #[tokio::test]
    async fn short_calculation_is_clamped_to_min() {
        let calc = FixedCalculator { seconds: 1.2, ml: None, fail: false };
        let est = estimator(test_db().await, Some(calc)).estimate(&input(Some("p1"), None)).await;
        assert_eq!(est.seconds, 5);
    }

    #[tokio::test]
    async fn failing_calculator_falls_back_to_default() {
        let calc = FixedCalculator { seconds: 100.0, ml: None, fail: true };
        let est = estimator(test_db().await, Some(calc)).estimate(&input(Some("p1"), None)).await;
        assert_eq!(est.seconds, 30);
        assert_eq!(est.source, DurationSource::Default);
    }

    #[tokio::test]
    async fn feedback_scales_formula_duration() {
        let db = seeded_db(Some("pump-1"), None).await;
        seed_feedback(&db, &[FeedbackResponse::TooLittle; 3]).await;
        let calc = FixedCalculator { seconds: 100.0, ml: None, fail: false };
        let est = estimator(db, Some(calc)).estimate(&input(Some("p1"), None)).await;
        assert_eq!(est.seconds, 110);
        assert!((est.volume_factor - 1.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn model_result_is_not_rescaled() {
        let db = seeded_db(Some("pump-1"), None).await;
        seed_feedback(&db, &[FeedbackResponse::TooMuch; 4]).await;
        let env = EnvironmentSnapshot { vpd: Some(1.1), ..Default::default() };
        let calc = FixedCalculator { seconds: 100.0, ml: Some(80.0), fail: false };
        let est = estimator(db, Some(calc)).estimate(&input(Some("p1"), Some(&env))).await;
        assert_eq!(est.seconds, 80);
        assert_eq!(est.source, DurationSource::Model);
        assert_eq!(est.volume_factor, 1.0);
    }

    // -- FormulaCalculator ------------------------------------------------

    #[tokio::test]
    async fn formula_waters_up_to_target() {
        let db = seeded_db(Some("pump-1"), None).await;
        db.insert_reading(NOW - 30, "node-a/s1", 0, 25.0).await.unwrap();
        // target 45, 10 ml per point, 20 points short, 5 ml/s
        let c = FormulaCalculator::new(db, 1800).calculate("p1", 5.0, NOW).await.unwrap();
        assert!((c.water_volume_ml - 200.0).abs() < 1e-9);
        assert!((c.duration_seconds - 40.0).abs() < 1e-9);
        assert!(!c.ml_adjusted);
    }

    #[tokio::test]
    async fn formula_without_reading_assumes_threshold() {
        let db = seeded_db(Some("pump-1"), None).await;
        // only reading is stale at NOW
        db.insert_reading(NOW - 3600, "node-a/s1", 0, 10.0).await.unwrap();
        let c = FormulaCalculator::new(db, 1800).calculate("p1", 10.0, NOW).await.unwrap();
        // threshold 30 -> 15 points short
        assert!((c.duration_seconds - 15.0).abs() < 1e-9);
        assert_eq!(c.confidence, 0.5);
    }

    #[tokio::test]
    async fn formula_rejects_unknown_plant_and_bad_flow() {
        let db = seeded_db(Some("pump-1"), None).await;
        let calc = FormulaCalculator::new(db, 1800);
        assert!(calc.calculate("nope", 5.0, NOW).await.is_err());
        assert!(calc.calculate("p1", 0.0, NOW).await.is_err());
    }
}
