mod actuator;
mod completion;
mod config;
mod db;
mod drydown;
mod duration;
mod executor;
mod ingest;
mod lock;
mod logs;
mod manual;
mod mqtt;
mod notify;
mod outcome;
mod plants;
mod requests;
mod scheduler;

use anyhow::{bail, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use actuator::{ActuatorControl, MockActuators, MqttActuators};
use completion::CompletionSweeper;
use db::{now_unix, Db};
use drydown::DrydownEstimator;
use duration::{DurationCalculator, DurationEstimator, FormulaCalculator, PumpCalibration};
use executor::ExecutionOrchestrator;
use ingest::Ingestor;
use manual::ManualIrrigation;
use notify::{MqttNotifier, Notifier};
use outcome::PostOutcomeCapturer;
use plants::{PlantLookup, StorePlants};
use scheduler::Scheduler;

/// Which actuator backend drives the hardware; kept concrete so the MQTT
/// error path can switch everything off.
enum Actuators {
    Mqtt(Arc<MqttActuators>),
    Mock(Arc<MockActuators>),
}

impl Actuators {
    fn control(&self) -> Arc<dyn ActuatorControl> {
        match self {
            Self::Mqtt(a) => a.clone(),
            Self::Mock(a) => a.clone(),
        }
    }

    fn all_off(&self) {
        match self {
            Self::Mqtt(a) => a.all_off(),
            Self::Mock(a) => a.all_off(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url = env::var("DB_URL")
        .unwrap_or_else(|_| "sqlite:irrigation.db?mode=rwc".to_string());
    let backend = env::var("ACTUATOR_BACKEND").unwrap_or_else(|_| "mqtt".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed units, plants, sensors, calibrations) ──────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;
    let settings = cfg.engine.clone();

    let units = db.load_units().await?;
    if units.is_empty() {
        warn!("no units configured in the database");
    }

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("irrigation-engine", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 50);

    // ── Actuators ───────────────────────────────────────────────────
    let actuators = match backend.as_str() {
        "mqtt" => Actuators::Mqtt(Arc::new(MqttActuators::new(client.clone()))),
        "mock" => Actuators::Mock(Arc::new(MockActuators::new(&cfg.actuator_ids()))),
        other => bail!("unknown ACTUATOR_BACKEND '{other}' (use mqtt or mock)"),
    };
    actuators.all_off();

    // ── Engine components ───────────────────────────────────────────
    let stale = settings.stale_after_sec();
    let plants: Arc<dyn PlantLookup> = Arc::new(StorePlants::new(db.clone(), stale));
    let calibration: Arc<dyn PumpCalibration> = Arc::new(db.clone());
    let calculator: Arc<dyn DurationCalculator> =
        Arc::new(FormulaCalculator::new(db.clone(), stale));
    let notifier: Arc<dyn Notifier> = Arc::new(MqttNotifier::new(client.clone(), db.clone()));
    let drydown = DrydownEstimator::new(db.clone(), settings.drydown());

    let manual = Arc::new(ManualIrrigation::new(
        db.clone(),
        plants.clone(),
        notifier.clone(),
        drydown.clone(),
        settings.manual(),
    ));

    let executor = ExecutionOrchestrator::new(
        db.clone(),
        actuators.control(),
        plants.clone(),
        DurationEstimator::new(
            Some(calculator),
            calibration.clone(),
            db.clone(),
            settings.duration_limits(),
        ),
        calibration.clone(),
        settings.execution(),
    );
    let completion = CompletionSweeper::new(
        db.clone(),
        actuators.control(),
        plants.clone(),
        calibration,
        notifier,
    );
    let outcomes = PostOutcomeCapturer::new(db.clone(), plants, drydown, settings.outcome());

    let ingestor = Ingestor::new(
        db.clone(),
        manual.clone(),
        stale,
        settings.request_ttl_sec(),
    )
    .await?;

    info!(
        units = units.len(),
        sensors = ingestor.sensor_count(),
        backend = %backend,
        "db ready"
    );

    // ── Scheduler ───────────────────────────────────────────────────
    let sched = Scheduler::new(
        db.clone(),
        executor,
        completion,
        outcomes,
        manual,
        settings.claim_batch_limit,
    );
    tokio::spawn(scheduler::run(sched, settings.tick_interval_sec));

    // ── Subscriptions ───────────────────────────────────────────────
    for topic in [
        mqtt::TOPIC_READINGS,
        mqtt::TOPIC_RESPONSES,
        mqtt::TOPIC_FEEDBACK,
        mqtt::TOPIC_MANUAL,
    ] {
        client.subscribe(topic, QoS::AtLeastOnce).await?;
    }
    info!("engine subscribed to telemetry, response, feedback and manual topics");

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                ingestor.dispatch(&p.topic, &p.payload, now_unix()).await;
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                // Best-effort fail-safe: turn everything off on comms error
                actuators.all_off();
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
