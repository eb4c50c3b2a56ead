//! Inbound MQTT traffic: telemetry persistence + threshold detection, user
//! responses to requests, feedback answers and declared manual waterings.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::{compute_moisture, Db, FeedbackResponse, SensorConfig};
use crate::manual::{ManualIrrigation, WateringEvent};
use crate::mqtt::{
    extract_feedback_id, extract_manual_plant_id, extract_node_id, extract_request_id,
    parse_manual_payload, payload_text, ReadingMsg,
};
use crate::requests::{EnvironmentSnapshot, NewRequest, RequestStatus, UserResponse};

pub struct Ingestor {
    db: Db,
    manual: Arc<ManualIrrigation>,
    /// Keyed by qualified id, "node-a/s1".
    sensors: HashMap<String, SensorConfig>,
    stale_after_sec: i64,
    request_ttl_sec: i64,
}

impl Ingestor {
    pub async fn new(
        db: Db,
        manual: Arc<ManualIrrigation>,
        stale_after_sec: i64,
        request_ttl_sec: i64,
    ) -> Result<Self> {
        let sensors = db
            .load_sensors()
            .await?
            .into_iter()
            .map(|s| (s.sensor_id.clone(), s))
            .collect();
        Ok(Self {
            db,
            manual,
            sensors,
            stale_after_sec,
            request_ttl_sec,
        })
    }

    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    /// Routes one publish by topic. Errors are logged, never returned.
    pub async fn dispatch(&self, topic: &str, payload: &[u8], now: i64) {
        if let Some(node_id) = extract_node_id(topic) {
            match serde_json::from_slice::<ReadingMsg>(payload) {
                Ok(msg) => {
                    self.handle_readings(node_id, &msg, now).await;
                }
                Err(e) => warn!(%topic, "bad telemetry json: {e}"),
            }
        } else if let Some(request_id) = extract_request_id(topic) {
            let text = payload_text(payload);
            match self.handle_response(request_id, &text, now).await {
                Ok(status) => info!(request_id, %status, "user response applied"),
                Err(e) => warn!(request_id, "user response rejected: {e:#}"),
            }
        } else if let Some(feedback_id) = extract_feedback_id(topic) {
            let text = payload_text(payload);
            match self.handle_feedback(feedback_id, &text, now).await {
                Ok(true) => info!(feedback_id, response = %text, "feedback recorded"),
                Ok(false) => debug!(feedback_id, "feedback unknown or already answered"),
                Err(e) => warn!(feedback_id, "feedback rejected: {e:#}"),
            }
        } else if let Some(plant_id) = extract_manual_plant_id(topic) {
            if let Err(e) = self.handle_manual(plant_id, payload, now).await {
                warn!(plant = %plant_id, "manual watering rejected: {e:#}");
            }
        } else {
            debug!(%topic, "unhandled topic");
        }
    }

    // ----------------------------
    // Telemetry
    // ----------------------------

    /// Persists each calibrated reading, feeds the manual detector and opens
    /// a request for every plant that dropped below its threshold. Returns
    /// the ids of newly created requests.
    pub async fn handle_readings(&self, node_id: &str, msg: &ReadingMsg, now: i64) -> Vec<i64> {
        let env = msg.environment();
        let mut created = Vec::new();

        for r in &msg.readings {
            // Nodes publish local channel names ("s1"); qualify them so they
            // are unique across nodes.
            let qualified_id = format!("{node_id}/{}", r.sensor_id);
            let Some(sc) = self.sensors.get(&qualified_id) else {
                warn!(sensor = %qualified_id, "unknown sensor, skipping");
                continue;
            };
            let moisture = compute_moisture(r.raw, sc.raw_dry, sc.raw_wet);
            if let Err(e) = self
                .db
                .insert_reading(msg.ts, &qualified_id, r.raw, moisture)
                .await
            {
                warn!(sensor = %qualified_id, "insert_reading failed: {e:#}");
                continue;
            }

            self.manual.on_reading(&qualified_id, moisture, now).await;

            if now - msg.ts > self.stale_after_sec {
                debug!(sensor = %qualified_id, age_sec = now - msg.ts, "stale reading, no detection");
                continue;
            }
            match self.detect(&qualified_id, moisture, &env, now).await {
                Ok(ids) => created.extend(ids),
                Err(e) => warn!(sensor = %qualified_id, "threshold detection failed: {e:#}"),
            }
        }
        created
    }

    async fn detect(
        &self,
        sensor_id: &str,
        moisture: f64,
        env: &EnvironmentSnapshot,
        now: i64,
    ) -> Result<Vec<i64>> {
        let mut created = Vec::new();
        for plant in self.db.plants_for_sensor(sensor_id).await? {
            if !plant.active || moisture >= plant.threshold {
                continue;
            }
            let Some(unit) = self.db.get_unit(&plant.unit_id).await? else {
                continue;
            };
            // The valve alone cannot water; the executor needs a pump.
            if unit.pump_actuator_id.is_none() {
                debug!(plant = %plant.plant_id, "below threshold but unit has no pump");
                continue;
            }

            let (id, new) = self
                .db
                .create_request(
                    &NewRequest {
                        unit_id: unit.unit_id.clone(),
                        user_id: unit.user_id.clone(),
                        plant_id: Some(plant.plant_id.clone()),
                        actuator_id: unit.pump_actuator_id.clone(),
                        sensor_id: Some(sensor_id.to_string()),
                        detected_moisture: moisture,
                        threshold: plant.threshold,
                        scheduled_time: now,
                        expires_at: Some(now + self.request_ttl_sec),
                        environment: *env,
                    },
                    now,
                )
                .await?;
            if new {
                info!(
                    request_id = id,
                    unit = %unit.unit_id,
                    plant = %plant.plant_id,
                    moisture,
                    threshold = plant.threshold,
                    "irrigation request created"
                );
                created.push(id);
            }
        }
        Ok(created)
    }

    // ----------------------------
    // Responses
    // ----------------------------

    pub async fn handle_response(&self, request_id: i64, text: &str, now: i64) -> Result<RequestStatus> {
        let response: UserResponse = text.parse()?;
        self.db.respond(request_id, response, now).await
    }

    pub async fn handle_feedback(&self, feedback_id: i64, text: &str, now: i64) -> Result<bool> {
        let response: FeedbackResponse = text.parse()?;
        self.db.record_feedback_response(feedback_id, response, now).await
    }

    pub async fn handle_manual(&self, plant_id: &str, payload: &[u8], now: i64) -> Result<i64> {
        let msg = parse_manual_payload(payload).context("bad manual watering json")?;
        if msg.watered_at.is_some_and(|t| t > now) {
            return Err(anyhow!("watered_at lies in the future"));
        }
        self.manual
            .log_watering_event(
                plant_id,
                &WateringEvent {
                    watered_at: msg.watered_at,
                    amount_ml: msg.amount_ml,
                    notes: msg.notes,
                },
                now,
            )
            .await
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::seeded_db;
    use crate::db::PreferenceCounter;
    use crate::manual::tests::manual;
    use crate::notify::tests::RecordingNotifier;

    const NOW: i64 = 1_700_000_000;

    async fn ingestor(db: &Db) -> Ingestor {
        let m = manual(db, Arc::new(RecordingNotifier::default()));
        Ingestor::new(db.clone(), Arc::new(m), 1800, 6 * 3600)
            .await
            .unwrap()
    }

    /// raw 23200 on a 26000/12000 sensor is 20 %.
    fn reading(ts: i64, raw: i64) -> Vec<u8> {
        format!(r#"{{"ts":{ts},"readings":[{{"sensor_id":"s1","raw":{raw}}}],"temperature":21.5}}"#)
            .into_bytes()
    }

    #[tokio::test]
    async fn dry_reading_creates_one_request() {
        let db = seeded_db(Some("pump-1"), None).await;
        let ing = ingestor(&db).await;
        assert_eq!(ing.sensor_count(), 1);

        ing.dispatch("tele/node-a/reading", &reading(NOW, 23200), NOW).await;
        let due = db.claim_due(NOW, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        let req = &due[0];
        assert_eq!(req.plant_id.as_deref(), Some("p1"));
        assert_eq!(req.actuator_id.as_deref(), Some("pump-1"));
        assert_eq!(req.sensor_id.as_deref(), Some("node-a/s1"));
        assert!((req.detected_moisture - 20.0).abs() < 1e-9);
        assert_eq!(req.threshold, 30.0);
        assert_eq!(req.expires_at, Some(NOW + 6 * 3600));
        assert_eq!(req.environment.temperature, Some(21.5));
        assert!(db.latest_sensor_reading("node-a/s1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn repeated_dry_readings_do_not_duplicate() {
        let db = seeded_db(Some("pump-1"), None).await;
        let ing = ingestor(&db).await;
        let msg: ReadingMsg = serde_json::from_slice(&reading(NOW, 23200)).unwrap();

        assert_eq!(ing.handle_readings("node-a", &msg, NOW).await.len(), 1);
        assert!(ing.handle_readings("node-a", &msg, NOW + 30).await.is_empty());
    }

    #[tokio::test]
    async fn wet_stale_or_unactuated_readings_create_nothing() {
        // 40 %
        let db = seeded_db(Some("pump-1"), None).await;
        let ing = ingestor(&db).await;
        let wet: ReadingMsg = serde_json::from_slice(&reading(NOW, 20400)).unwrap();
        assert!(ing.handle_readings("node-a", &wet, NOW).await.is_empty());

        let stale: ReadingMsg = serde_json::from_slice(&reading(NOW - 7200, 23200)).unwrap();
        assert!(ing.handle_readings("node-a", &stale, NOW).await.is_empty());

        let db = seeded_db(None, None).await;
        let ing = ingestor(&db).await;
        let dry: ReadingMsg = serde_json::from_slice(&reading(NOW, 23200)).unwrap();
        assert!(ing.handle_readings("node-a", &dry, NOW).await.is_empty());
    }

    #[tokio::test]
    async fn pump_and_valve_plant_gets_a_request() {
        let db = seeded_db(Some("pump-1"), Some("valve-1")).await;
        let ing = ingestor(&db).await;
        let dry: ReadingMsg = serde_json::from_slice(&reading(NOW, 23200)).unwrap();
        assert_eq!(ing.handle_readings("node-a", &dry, NOW).await.len(), 1);

        // valve without a pump cannot water
        let db = seeded_db(None, Some("valve-1")).await;
        let ing = ingestor(&db).await;
        assert!(ing.handle_readings("node-a", &dry, NOW).await.is_empty());
    }

    #[tokio::test]
    async fn unknown_sensor_is_skipped() {
        let db = seeded_db(Some("pump-1"), None).await;
        let ing = ingestor(&db).await;
        let msg: ReadingMsg = serde_json::from_slice(&reading(NOW, 23200)).unwrap();
        assert!(ing.handle_readings("node-z", &msg, NOW).await.is_empty());
        assert!(db.latest_sensor_reading("node-z/s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn response_topic_updates_request() {
        let db = seeded_db(Some("pump-1"), None).await;
        let ing = ingestor(&db).await;
        let msg: ReadingMsg = serde_json::from_slice(&reading(NOW, 23200)).unwrap();
        let id = ing.handle_readings("node-a", &msg, NOW).await[0];

        ing.dispatch(&format!("request/{id}/respond"), b"delay:30\n", NOW).await;
        let req = db.get_request(id).await.unwrap().unwrap();
        assert_eq!(req.status, RequestStatus::Delayed);
        assert_eq!(req.delayed_until, Some(NOW + 1800));
        assert_eq!(
            db.preference_count("alice", "u1", PreferenceCounter::Delay).await.unwrap(),
            1
        );

        assert!(ing.handle_response(id, "maybe", NOW).await.is_err());
    }

    #[tokio::test]
    async fn feedback_answer_is_recorded_once() {
        let db = seeded_db(Some("pump-1"), None).await;
        let ing = ingestor(&db).await;
        let fid = db.create_feedback_request("u1", "alice", 1, NOW).await.unwrap();

        assert!(ing.handle_feedback(fid, "too_little", NOW).await.unwrap());
        assert!(!ing.handle_feedback(fid, "too_much", NOW).await.unwrap());
        assert!(ing.handle_feedback(fid, "lots", NOW).await.is_err());
        assert_eq!(db.feedback_counts("alice", "u1").await.unwrap().too_little, 1);
    }

    #[tokio::test]
    async fn manual_topic_logs_watering() {
        let db = seeded_db(None, None).await;
        let ing = ingestor(&db).await;

        let id = ing
            .handle_manual("p1", br#"{"amount_ml":250,"notes":"can"}"#, NOW)
            .await
            .unwrap();
        let log = db.get_manual_log(id).await.unwrap().unwrap();
        assert_eq!(log.watered_at, NOW);
        assert_eq!(log.amount_ml, Some(250.0));

        assert!(ing.handle_manual("p1", b"", NOW).await.is_ok());
        assert!(ing.handle_manual("nope", b"", NOW).await.is_err());
        let future = format!(r#"{{"watered_at":{}}}"#, NOW + 60);
        assert!(ing.handle_manual("p1", future.as_bytes(), NOW).await.is_err());
    }
}
