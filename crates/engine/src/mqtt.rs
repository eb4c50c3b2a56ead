use serde::Deserialize;

use crate::requests::EnvironmentSnapshot;

pub(crate) const TOPIC_READINGS: &str = "tele/+/reading";
pub(crate) const TOPIC_RESPONSES: &str = "request/+/respond";
pub(crate) const TOPIC_FEEDBACK: &str = "feedback/+/response";
pub(crate) const TOPIC_MANUAL: &str = "manual/+/watered";

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct Reading {
    pub(crate) sensor_id: String,
    pub(crate) raw: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReadingMsg {
    pub(crate) ts: i64,
    pub(crate) readings: Vec<Reading>,
    /// Nodes with an SHT/lux sensor attach ambient conditions.
    #[serde(default)]
    pub(crate) temperature: Option<f64>,
    #[serde(default)]
    pub(crate) humidity: Option<f64>,
    #[serde(default)]
    pub(crate) vpd: Option<f64>,
    #[serde(default)]
    pub(crate) lux: Option<f64>,
}

impl ReadingMsg {
    pub(crate) fn environment(&self) -> EnvironmentSnapshot {
        EnvironmentSnapshot {
            temperature: self.temperature,
            humidity: self.humidity,
            vpd: self.vpd,
            lux: self.lux,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ManualWateredMsg {
    #[serde(default)]
    pub(crate) watered_at: Option<i64>,
    #[serde(default)]
    pub(crate) amount_ml: Option<f64>,
    #[serde(default)]
    pub(crate) notes: Option<String>,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Middle segment of "<prefix>/<id>/<suffix>".
fn middle_segment<'a>(topic: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == prefix && parts[2] == suffix && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Extract node_id from "tele/<node_id>/reading".
pub(crate) fn extract_node_id(topic: &str) -> Option<&str> {
    middle_segment(topic, "tele", "reading")
}

/// Extract the request id from "request/<id>/respond".
pub(crate) fn extract_request_id(topic: &str) -> Option<i64> {
    middle_segment(topic, "request", "respond")?.parse().ok()
}

/// Extract the feedback id from "feedback/<id>/response".
pub(crate) fn extract_feedback_id(topic: &str) -> Option<i64> {
    middle_segment(topic, "feedback", "response")?.parse().ok()
}

/// Extract plant_id from "manual/<plant_id>/watered".
pub(crate) fn extract_manual_plant_id(topic: &str) -> Option<&str> {
    middle_segment(topic, "manual", "watered")
}

/// Text payload, trimmed.
pub(crate) fn payload_text(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).trim().to_string()
}

/// An empty manual payload means "watered just now, no details".
pub(crate) fn parse_manual_payload(payload: &[u8]) -> Result<ManualWateredMsg, serde_json::Error> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(ManualWateredMsg::default());
    }
    serde_json::from_slice(payload)
}

// ===========================================================================
// Tests
// ===========================================================================
