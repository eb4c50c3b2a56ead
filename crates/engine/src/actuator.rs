//! Actuator control. `MqttActuators` drives relay boards by publishing
//! `ON`/`OFF` to `actuator/<id>/set`; `MockActuators` keeps state in memory
//! (development and tests) and records every command it receives.

use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorState {
    On,
    Off,
    Error,
    Unavailable,
}

impl fmt::Display for ActuatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Error => "error",
            Self::Unavailable => "unavailable",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorResponse {
    pub state: ActuatorState,
    pub error_message: Option<String>,
    /// How long the actuator was on, reported by `turn_off` when known.
    pub runtime_seconds: Option<f64>,
}

impl ActuatorResponse {
    pub fn ok(state: ActuatorState, runtime_seconds: Option<f64>) -> Self {
        Self {
            state,
            error_message: None,
            runtime_seconds,
        }
    }

    pub fn failed(state: ActuatorState, msg: impl Into<String>) -> Self {
        Self {
            state,
            error_message: Some(msg.into()),
            runtime_seconds: None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.state, ActuatorState::Error | ActuatorState::Unavailable)
    }

    /// Human-readable reason for a failed command.
    pub fn describe(&self, actuator_id: &str, action: &str) -> String {
        match &self.error_message {
            Some(m) => format!("{action} {actuator_id}: {} ({m})", self.state),
            None => format!("{action} {actuator_id}: {}", self.state),
        }
    }
}

/// Bounded, non-blocking actuator commands. Implementations report failures
/// through the response state instead of returning errors.
#[async_trait]
pub trait ActuatorControl: Send + Sync {
    async fn turn_on(&self, actuator_id: &str) -> ActuatorResponse;
    async fn turn_off(&self, actuator_id: &str) -> ActuatorResponse;
}

// ---------------------------------------------------------------------------
// MQTT relay backend (production)
// ---------------------------------------------------------------------------

pub struct MqttActuators {
    client: AsyncClient,
    on_since: Mutex<HashMap<String, Instant>>,
}

impl MqttActuators {
    pub fn new(client: AsyncClient) -> Self {
        Self {
            client,
            on_since: Mutex::new(HashMap::new()),
        }
    }

    async fn publish(&self, actuator_id: &str, on: bool) -> Result<(), rumqttc::ClientError> {
        let payload: &[u8] = if on { b"ON" } else { b"OFF" };
        self.client
            .publish(
                format!("actuator/{actuator_id}/set"),
                QoS::AtLeastOnce,
                false,
                payload.to_vec(),
            )
            .await
    }

    /// Fail-safe: switch every actuator we believe is on back off. Runs
    /// while the event loop is not being polled, so it never waits for room
    /// in the request queue; an OFF that does not fit stays tracked and is
    /// retried by the next call.
    pub fn all_off(&self) {
        let ids: Vec<String> = match self.on_since.lock() {
            Ok(map) => map.keys().cloned().collect(),
            Err(_) => return,
        };
        for id in ids {
            match self.client.try_publish(
                format!("actuator/{id}/set"),
                QoS::AtLeastOnce,
                false,
                b"OFF".to_vec(),
            ) {
                Ok(()) => {
                    if let Ok(mut map) = self.on_since.lock() {
                        map.remove(&id);
                    }
                    info!(actuator = %id, "fail-safe: actuator OFF queued");
                }
                Err(e) => warn!(actuator = %id, "fail-safe: OFF not queued: {e}"),
            }
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.on_since.lock().map(|m| m.len()).unwrap_or_default()
    }
}

#[async_trait]
impl ActuatorControl for MqttActuators {
    async fn turn_on(&self, actuator_id: &str) -> ActuatorResponse {
        if let Err(e) = self.publish(actuator_id, true).await {
            return ActuatorResponse::failed(ActuatorState::Unavailable, e.to_string());
        }
        if let Ok(mut map) = self.on_since.lock() {
            map.entry(actuator_id.to_string()).or_insert_with(Instant::now);
        }
        info!(actuator = %actuator_id, "actuator ON");
        ActuatorResponse::ok(ActuatorState::On, None)
    }

    async fn turn_off(&self, actuator_id: &str) -> ActuatorResponse {
        if let Err(e) = self.publish(actuator_id, false).await {
            return ActuatorResponse::failed(ActuatorState::Unavailable, e.to_string());
        }
        let runtime = self
            .on_since
            .lock()
            .ok()
            .and_then(|mut map| map.remove(actuator_id))
            .map(|since| since.elapsed().as_secs_f64());
        info!(actuator = %actuator_id, runtime_s = ?runtime, "actuator OFF");
        ActuatorResponse::ok(ActuatorState::Off, runtime)
    }
}

// ---------------------------------------------------------------------------
// In-memory backend (development + tests)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    On,
    Off,
}

#[derive(Default)]
pub struct MockActuators {
    states: Mutex<HashMap<String, bool>>,
    calls: Mutex<Vec<(String, Command)>>,
    failures: Mutex<HashMap<(String, Command), ActuatorState>>,
    runtimes: Mutex<HashMap<String, f64>>,
}

impl MockActuators {
    pub fn new(actuator_ids: &[String]) -> Self {
        let board = Self::default();
        if let Ok(mut states) = board.states.lock() {
            for id in actuator_ids {
                info!(actuator = %id, "[mock-actuator] registered");
                states.insert(id.clone(), false);
            }
        }
        board
    }

    /// Makes every future `cmd` on `actuator_id` report `state`.
    #[cfg(test)]
    pub fn fail(&self, actuator_id: &str, cmd: Command, state: ActuatorState) {
        if let Ok(mut f) = self.failures.lock() {
            f.insert((actuator_id.to_string(), cmd), state);
        }
    }

    /// Runtime reported by the next `turn_off` of `actuator_id`.
    #[cfg(test)]
    pub fn report_runtime(&self, actuator_id: &str, seconds: f64) {
        if let Ok(mut r) = self.runtimes.lock() {
            r.insert(actuator_id.to_string(), seconds);
        }
    }

    #[cfg(test)]
    pub fn calls(&self) -> Vec<(String, Command)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    #[cfg(test)]
    pub fn is_on(&self, actuator_id: &str) -> bool {
        self.states
            .lock()
            .ok()
            .and_then(|s| s.get(actuator_id).copied())
            .unwrap_or(false)
    }

    pub fn all_off(&self) {
        if let Ok(mut states) = self.states.lock() {
            for on in states.values_mut() {
                *on = false;
            }
        }
    }

    fn command(&self, actuator_id: &str, cmd: Command) -> ActuatorResponse {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((actuator_id.to_string(), cmd));
        }

        let injected = self
            .failures
            .lock()
            .ok()
            .and_then(|f| f.get(&(actuator_id.to_string(), cmd)).copied());
        if let Some(state) = injected {
            return ActuatorResponse::failed(state, "injected failure");
        }

        let Ok(mut states) = self.states.lock() else {
            return ActuatorResponse::failed(ActuatorState::Error, "state poisoned");
        };
        let Some(on) = states.get_mut(actuator_id) else {
            warn!(actuator = %actuator_id, "[mock-actuator] unknown actuator");
            return ActuatorResponse::failed(ActuatorState::Unavailable, "unknown actuator");
        };

        *on = cmd == Command::On;
        info!(
            actuator = %actuator_id,
            "[mock-actuator] set {}",
            if *on { "ON" } else { "OFF" }
        );

        match cmd {
            Command::On => ActuatorResponse::ok(ActuatorState::On, None),
            Command::Off => {
                let runtime = self.runtimes.lock().ok().and_then(|mut r| r.remove(actuator_id));
                ActuatorResponse::ok(ActuatorState::Off, runtime)
            }
        }
    }
}

#[async_trait]
impl ActuatorControl for MockActuators {
    async fn turn_on(&self, actuator_id: &str) -> ActuatorResponse {
        self.command(actuator_id, Command::On)
    }

    async fn turn_off(&self, actuator_id: &str) -> ActuatorResponse {
        self.command(actuator_id, Command::Off)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn board() -> MockActuators {
        MockActuators::new(&["pump-1".to_string(), "valve-1".to_string()])
    }

    #[tokio::test]
    async fn mock_starts_all_off() {
        let b = board();
        assert!(!b.is_on("pump-1"));
        assert!(!b.is_on("valve-1"));
    }

    #[tokio::test]
    async fn mock_turn_on_and_off() {
        let b = board();
        assert_eq!(b.turn_on("pump-1").await.state, ActuatorState::On);
        assert!(b.is_on("pump-1"));
        b.report_runtime("pump-1", 31.5);
        let off = b.turn_off("pump-1").await;
        assert_eq!(off.state, ActuatorState::Off);
        assert_eq!(off.runtime_seconds, Some(31.5));
        assert!(!b.is_on("pump-1"));
    }

    #[tokio::test]
    async fn mock_records_call_order() {
        let b = board();
        b.turn_on("valve-1").await;
        b.turn_on("pump-1").await;
        b.turn_off("pump-1").await;
        assert_eq!(
            b.calls(),
            vec![
                ("valve-1".to_string(), Command::On),
                ("pump-1".to_string(), Command::On),
                ("pump-1".to_string(), Command::Off),
            ]
        );
    }

    #[tokio::test]
    async fn mock_unknown_actuator_is_unavailable() {
        let b = board();
        let r = b.turn_on("nope").await;
        assert_eq!(r.state, ActuatorState::Unavailable);
        assert!(r.is_failure());
    }

    #[tokio::test]
    async fn mock_injected_failure_leaves_state_alone() {
        let b = board();
        b.fail("valve-1", Command::On, ActuatorState::Error);
        let r = b.turn_on("valve-1").await;
        assert!(r.is_failure());
        assert!(r.describe("valve-1", "turn_on").contains("error"));
        assert!(!b.is_on("valve-1"));
        // other commands unaffected
        assert!(!b.turn_off("valve-1").await.is_failure());
    }

    #[tokio::test]
    async fn mock_all_off_resets_everything() {
        let b = board();
        b.turn_on("pump-1").await;
        b.turn_on("valve-1").await;
        b.all_off();
        assert!(!b.is_on("pump-1"));
        assert!(!b.is_on("valve-1"));
    }

    fn mqtt(cap: usize) -> (MqttActuators, rumqttc::EventLoop) {
        let opts = rumqttc::MqttOptions::new("test-actuators", "127.0.0.1", 1883);
        let (client, eventloop) = AsyncClient::new(opts, cap);
        (MqttActuators::new(client), eventloop)
    }

    #[tokio::test]
    async fn mqtt_all_off_does_not_wait_on_a_full_queue() {
        // nothing polls the event loop, so the two ONs fill the queue
        let (act, _eventloop) = mqtt(2);
        act.turn_on("pump-1").await;
        act.turn_on("valve-1").await;

        act.all_off();
        // neither OFF fit, both stay tracked for the next attempt
        assert_eq!(act.tracked(), 2);
    }

    #[tokio::test]
    async fn mqtt_all_off_clears_what_it_queued() {
        let (act, _eventloop) = mqtt(10);
        act.turn_on("pump-1").await;
        act.turn_on("valve-1").await;
        act.all_off();
        assert_eq!(act.tracked(), 0);
    }

    #[tokio::test]
    async fn mqtt_turn_on_reports_on_while_queue_has_room() {
        let (act, _eventloop) = mqtt(10);
        assert_eq!(act.turn_on("pump-1").await.state, ActuatorState::On);
        let off = act.turn_off("pump-1").await;
        assert_eq!(off.state, ActuatorState::Off);
        assert!(off.runtime_seconds.is_some());
    }
}
