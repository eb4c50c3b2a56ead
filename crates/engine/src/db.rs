use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitConfig {
    pub unit_id: String,
    pub name: String,
    pub user_id: String,
    pub pump_actuator_id: Option<String>,
    pub feedback_enabled: bool,
    pub ml_learning_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub sensor_id: String,
    pub node_id: String,
    pub raw_dry: i64,
    pub raw_wet: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlantConfig {
    pub plant_id: String,
    pub unit_id: String,
    pub name: String,
    pub sensor_id: Option<String>,
    /// Moisture percent below which the plant wants water.
    pub threshold: f64,
    pub target_moisture: f64,
    /// Millilitres of water needed to raise moisture by one point.
    pub ml_per_point: f64,
    pub valve_actuator_id: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoistureReading {
    pub ts: i64,
    pub moisture: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackResponse {
    TooLittle,
    TooMuch,
    JustRight,
}

impl FeedbackResponse {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TooLittle => "too_little",
            Self::TooMuch => "too_much",
            Self::JustRight => "just_right",
        }
    }
}

impl FromStr for FeedbackResponse {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "too_little" => Ok(Self::TooLittle),
            "too_much" => Ok(Self::TooMuch),
            "just_right" => Ok(Self::JustRight),
            other => bail!("unknown feedback response '{other}'"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedbackCounts {
    pub too_little: i64,
    pub too_much: i64,
    pub just_right: i64,
}

impl FeedbackCounts {
    pub fn total(&self) -> i64 {
        self.too_little + self.too_much + self.just_right
    }
}

/// Per-(user, unit) response counter, see [`Db::bump_preference`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferenceCounter {
    Approval,
    Delay,
    Cancellation,
    Auto,
}

impl PreferenceCounter {
    fn column(&self) -> &'static str {
        match self {
            Self::Approval => "approvals",
            Self::Delay => "delays",
            Self::Cancellation => "cancellations",
            Self::Auto => "auto_responses",
        }
    }
}

/// Convert a raw ADC reading to a 0..=100 moisture percent using the
/// sensor's dry/wet calibration endpoints. Clamped so out-of-range readings
/// don't produce nonsensical values.
pub fn compute_moisture(raw: i64, raw_dry: i64, raw_wet: i64) -> f64 {
    let range = raw_dry - raw_wet;
    if range == 0 {
        return 0.0; // zero-width calibration
    }
    let m = (raw_dry - raw) as f64 / range as f64;
    m.clamp(0.0, 1.0) * 100.0
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn unit_from_row(r: &SqliteRow) -> Result<UnitConfig> {
    Ok(UnitConfig {
        unit_id: r.try_get("unit_id")?,
        name: r.try_get("name")?,
        user_id: r.try_get("user_id")?,
        pump_actuator_id: r.try_get("pump_actuator_id")?,
        feedback_enabled: r.try_get("feedback_enabled")?,
        ml_learning_enabled: r.try_get("ml_learning_enabled")?,
    })
}

pub(crate) fn plant_from_row(r: &SqliteRow) -> Result<PlantConfig> {
    Ok(PlantConfig {
        plant_id: r.try_get("plant_id")?,
        unit_id: r.try_get("unit_id")?,
        name: r.try_get("name")?,
        sensor_id: r.try_get("sensor_id")?,
        threshold: r.try_get("threshold")?,
        target_moisture: r.try_get("target_moisture")?,
        ml_per_point: r.try_get("ml_per_point")?,
        valve_actuator_id: r.try_get("valve_actuator_id")?,
        active: r.try_get("active")?,
    })
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/irrigation/irrigation.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Units
    // ----------------------------

    pub async fn upsert_unit(&self, u: &UnitConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO units (
              unit_id, name, user_id, pump_actuator_id,
              feedback_enabled, ml_learning_enabled
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(unit_id) DO UPDATE SET
              name=excluded.name,
              user_id=excluded.user_id,
              pump_actuator_id=excluded.pump_actuator_id,
              feedback_enabled=excluded.feedback_enabled,
              ml_learning_enabled=excluded.ml_learning_enabled
            "#,
        )
        .bind(&u.unit_id)
        .bind(&u.name)
        .bind(&u.user_id)
        .bind(&u.pump_actuator_id)
        .bind(u.feedback_enabled)
        .bind(u.ml_learning_enabled)
        .execute(&self.pool)
        .await
        .context("upsert_unit failed")?;
        Ok(())
    }

    pub async fn load_units(&self) -> Result<Vec<UnitConfig>> {
        let rows = sqlx::query("SELECT * FROM units ORDER BY unit_id")
            .fetch_all(&self.pool)
            .await
            .context("load_units failed")?;
        rows.iter().map(unit_from_row).collect()
    }

    pub async fn get_unit(&self, unit_id: &str) -> Result<Option<UnitConfig>> {
        let row = sqlx::query("SELECT * FROM units WHERE unit_id = ?")
            .bind(unit_id)
            .fetch_optional(&self.pool)
            .await
            .context("get_unit failed")?;
        row.as_ref().map(unit_from_row).transpose()
    }

    // ----------------------------
    // Sensor config
    // ----------------------------

    pub async fn upsert_sensor(&self, s: &SensorConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensors (sensor_id, node_id, raw_dry, raw_wet)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(sensor_id) DO UPDATE SET
              node_id=excluded.node_id,
              raw_dry=excluded.raw_dry,
              raw_wet=excluded.raw_wet
            "#,
        )
        .bind(&s.sensor_id)
        .bind(&s.node_id)
        .bind(s.raw_dry)
        .bind(s.raw_wet)
        .execute(&self.pool)
        .await
        .context("upsert_sensor failed")?;
        Ok(())
    }

    pub async fn load_sensors(&self) -> Result<Vec<SensorConfig>> {
        let rows = sqlx::query(
            "SELECT sensor_id, node_id, raw_dry, raw_wet FROM sensors ORDER BY sensor_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("load_sensors failed")?;

        rows.iter()
            .map(|r| {
                Ok(SensorConfig {
                    sensor_id: r.try_get("sensor_id")?,
                    node_id: r.try_get("node_id")?,
                    raw_dry: r.try_get("raw_dry")?,
                    raw_wet: r.try_get("raw_wet")?,
                })
            })
            .collect()
    }

    // ----------------------------
    // Plant config
    // ----------------------------

    pub async fn upsert_plant(&self, p: &PlantConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO plants (
              plant_id, unit_id, name, sensor_id,
              threshold, target_moisture, ml_per_point,
              valve_actuator_id, active
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(plant_id) DO UPDATE SET
              unit_id=excluded.unit_id,
              name=excluded.name,
              sensor_id=excluded.sensor_id,
              threshold=excluded.threshold,
              target_moisture=excluded.target_moisture,
              ml_per_point=excluded.ml_per_point,
              valve_actuator_id=excluded.valve_actuator_id,
              active=excluded.active
            "#,
        )
        .bind(&p.plant_id)
        .bind(&p.unit_id)
        .bind(&p.name)
        .bind(&p.sensor_id)
        .bind(p.threshold)
        .bind(p.target_moisture)
        .bind(p.ml_per_point)
        .bind(&p.valve_actuator_id)
        .bind(p.active)
        .execute(&self.pool)
        .await
        .context("upsert_plant failed")?;
        Ok(())
    }

    pub async fn get_plant_config(&self, plant_id: &str) -> Result<Option<PlantConfig>> {
        let row = sqlx::query("SELECT * FROM plants WHERE plant_id = ?")
            .bind(plant_id)
            .fetch_optional(&self.pool)
            .await
            .context("get_plant_config failed")?;
        row.as_ref().map(plant_from_row).transpose()
    }

    pub async fn plants_for_sensor(&self, sensor_id: &str) -> Result<Vec<PlantConfig>> {
        let rows = sqlx::query("SELECT * FROM plants WHERE sensor_id = ? ORDER BY plant_id")
            .bind(sensor_id)
            .fetch_all(&self.pool)
            .await
            .context("plants_for_sensor failed")?;
        rows.iter().map(plant_from_row).collect()
    }

    // ----------------------------
    // Pump calibration
    // ----------------------------

    pub async fn upsert_calibration(&self, actuator_id: &str, flow_rate: f64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pump_calibrations (actuator_id, flow_rate_ml_per_sec)
            VALUES (?, ?)
            ON CONFLICT(actuator_id) DO UPDATE SET
              flow_rate_ml_per_sec=excluded.flow_rate_ml_per_sec
            "#,
        )
        .bind(actuator_id)
        .bind(flow_rate)
        .execute(&self.pool)
        .await
        .context("upsert_calibration failed")?;
        Ok(())
    }

    pub async fn flow_rate(&self, actuator_id: &str) -> Result<Option<f64>> {
        let row = sqlx::query(
            "SELECT flow_rate_ml_per_sec FROM pump_calibrations WHERE actuator_id = ?",
        )
        .bind(actuator_id)
        .fetch_optional(&self.pool)
        .await
        .context("flow_rate failed")?;
        Ok(row.map(|r| r.try_get("flow_rate_ml_per_sec")).transpose()?)
    }

    // ----------------------------
    // Readings
    // ----------------------------

    pub async fn insert_reading(&self, ts: i64, sensor_id: &str, raw: i64, moisture: f64) -> Result<()> {
        sqlx::query("INSERT INTO readings (ts, sensor_id, raw, moisture) VALUES (?, ?, ?, ?)")
            .bind(ts)
            .bind(sensor_id)
            .bind(raw)
            .bind(moisture)
            .execute(&self.pool)
            .await
            .context("insert_reading failed")?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn latest_sensor_reading(&self, sensor_id: &str) -> Result<Option<MoistureReading>> {
        self.latest_reading_between(sensor_id, i64::MIN, i64::MAX).await
    }

    /// Newest reading with `from <= ts <= to`.
    pub async fn latest_reading_between(
        &self,
        sensor_id: &str,
        from: i64,
        to: i64,
    ) -> Result<Option<MoistureReading>> {
        let row = sqlx::query(
            r#"
            SELECT ts, moisture FROM readings
            WHERE sensor_id = ? AND ts >= ? AND ts <= ?
            ORDER BY ts DESC
            LIMIT 1
            "#,
        )
        .bind(sensor_id)
        .bind(from)
        .bind(to)
        .fetch_optional(&self.pool)
        .await
        .context("latest_reading_between failed")?;

        row.map(|r| {
            Ok(MoistureReading {
                ts: r.try_get("ts")?,
                moisture: r.try_get("moisture")?,
            })
        })
        .transpose()
    }

    /// Readings with `ts >= since`, oldest first.
    pub async fn readings_since(&self, sensor_id: &str, since: i64) -> Result<Vec<MoistureReading>> {
        let rows = sqlx::query(
            "SELECT ts, moisture FROM readings WHERE sensor_id = ? AND ts >= ? ORDER BY ts ASC",
        )
        .bind(sensor_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("readings_since failed")?;

        rows.iter()
            .map(|r| {
                Ok(MoistureReading {
                    ts: r.try_get("ts")?,
                    moisture: r.try_get("moisture")?,
                })
            })
            .collect()
    }

    // ----------------------------
    // Feedback
    // ----------------------------

    pub async fn create_feedback_request(
        &self,
        unit_id: &str,
        user_id: &str,
        execution_log_id: i64,
        now: i64,
    ) -> Result<i64> {
        let res = sqlx::query(
            r#"
            INSERT INTO irrigation_feedback (unit_id, user_id, execution_log_id, requested_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(unit_id)
        .bind(user_id)
        .bind(execution_log_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("create_feedback_request failed")?;
        Ok(res.last_insert_rowid())
    }

    /// Returns false if the feedback row is unknown or already answered.
    pub async fn record_feedback_response(
        &self,
        feedback_id: i64,
        response: FeedbackResponse,
        now: i64,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE irrigation_feedback
            SET response = ?, responded_at = ?
            WHERE id = ? AND response IS NULL
            "#,
        )
        .bind(response.as_str())
        .bind(now)
        .bind(feedback_id)
        .execute(&self.pool)
        .await
        .context("record_feedback_response failed")?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn feedback_counts(&self, user_id: &str, unit_id: &str) -> Result<FeedbackCounts> {
        let row = sqlx::query(
            r#"
            SELECT
              COALESCE(SUM(CASE WHEN response = 'too_little' THEN 1 ELSE 0 END), 0) AS too_little,
              COALESCE(SUM(CASE WHEN response = 'too_much' THEN 1 ELSE 0 END), 0) AS too_much,
              COALESCE(SUM(CASE WHEN response = 'just_right' THEN 1 ELSE 0 END), 0) AS just_right
            FROM irrigation_feedback
            WHERE user_id = ? AND unit_id = ?
            "#,
        )
        .bind(user_id)
        .bind(unit_id)
        .fetch_one(&self.pool)
        .await
        .context("feedback_counts failed")?;

        Ok(FeedbackCounts {
            too_little: row.try_get("too_little")?,
            too_much: row.try_get("too_much")?,
            just_right: row.try_get("just_right")?,
        })
    }

    // ----------------------------
    // User preference counters
    // ----------------------------

    pub async fn bump_preference(
        &self,
        user_id: &str,
        unit_id: &str,
        counter: PreferenceCounter,
    ) -> Result<()> {
        let column = counter.column();
        sqlx::query(
            "INSERT INTO user_irrigation_preferences (user_id, unit_id) VALUES (?, ?)
             ON CONFLICT(user_id, unit_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(unit_id)
        .execute(&self.pool)
        .await
        .context("bump_preference: ensure row failed")?;

        sqlx::query(&format!(
            "UPDATE user_irrigation_preferences SET {column} = {column} + 1
             WHERE user_id = ? AND unit_id = ?"
        ))
        .bind(user_id)
        .bind(unit_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("bump_preference({column}) failed"))?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn preference_count(
        &self,
        user_id: &str,
        unit_id: &str,
        counter: PreferenceCounter,
    ) -> Result<i64> {
        let column = counter.column();
        let row = sqlx::query(&format!(
            "SELECT {column} AS n FROM user_irrigation_preferences WHERE user_id = ? AND unit_id = ?"
        ))
        .bind(user_id)
        .bind(unit_id)
        .fetch_optional(&self.pool)
        .await
        .context("preference_count failed")?;
        Ok(row.map(|r| r.try_get("n")).transpose()?.unwrap_or(0))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    pub(crate) fn test_unit(pump: Option<&str>) -> UnitConfig {
        UnitConfig {
            unit_id: "u1".into(),
            name: "Greenhouse".into(),
            user_id: "alice".into(),
            pump_actuator_id: pump.map(str::to_string),
            feedback_enabled: true,
            ml_learning_enabled: true,
        }
    }

    pub(crate) fn test_plant(valve: Option<&str>) -> PlantConfig {
        PlantConfig {
            plant_id: "p1".into(),
            unit_id: "u1".into(),
            name: "Basil".into(),
            sensor_id: Some("node-a/s1".into()),
            threshold: 30.0,
            target_moisture: 45.0,
            ml_per_point: 10.0,
            valve_actuator_id: valve.map(str::to_string),
            active: true,
        }
    }

    /// Unit "u1" with plant "p1" on sensor "node-a/s1".
    pub(crate) async fn seeded_db(pump: Option<&str>, valve: Option<&str>) -> Db {
        let db = test_db().await;
        db.upsert_unit(&test_unit(pump)).await.unwrap();
        db.upsert_sensor(&SensorConfig {
            sensor_id: "node-a/s1".into(),
            node_id: "node-a".into(),
            raw_dry: 26000,
            raw_wet: 12000,
        })
        .await
        .unwrap();
        db.upsert_plant(&test_plant(valve)).await.unwrap();
        db
    }

    #[test]
    fn compute_moisture_maps_calibration_to_percent() {
        assert_eq!(compute_moisture(26000, 26000, 12000), 0.0);
        assert_eq!(compute_moisture(12000, 26000, 12000), 100.0);
        assert!((compute_moisture(19000, 26000, 12000) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn compute_moisture_clamps_and_handles_degenerate_range() {
        assert_eq!(compute_moisture(30000, 26000, 12000), 0.0);
        assert_eq!(compute_moisture(5000, 26000, 12000), 100.0);
        assert_eq!(compute_moisture(15000, 15000, 15000), 0.0);
    }

    #[test]
    fn feedback_response_parses_case_insensitively() {
        assert_eq!("Too_Little".parse::<FeedbackResponse>().unwrap(), FeedbackResponse::TooLittle);
        assert_eq!(" just_right\n".parse::<FeedbackResponse>().unwrap(), FeedbackResponse::JustRight);
        assert!("meh".parse::<FeedbackResponse>().is_err());
    }

    #[tokio::test]
    async fn latest_reading_between_respects_window() {
        let db = seeded_db(None, None).await;
        db.insert_reading(100, "node-a/s1", 0, 40.0).await.unwrap();
        db.insert_reading(200, "node-a/s1", 0, 35.0).await.unwrap();
        db.insert_reading(300, "node-a/s1", 0, 30.0).await.unwrap();

        let r = db.latest_reading_between("node-a/s1", 150, 250).await.unwrap().unwrap();
        assert_eq!(r, MoistureReading { ts: 200, moisture: 35.0 });
        assert!(db.latest_reading_between("node-a/s1", 400, 500).await.unwrap().is_none());
        assert_eq!(db.latest_sensor_reading("node-a/s1").await.unwrap().unwrap().ts, 300);
    }

    #[tokio::test]
    async fn feedback_counts_only_answered_rows() {
        let db = seeded_db(Some("pump-1"), None).await;
        let a = db.create_feedback_request("u1", "alice", 0, 10).await;
        // execution_log_id 0 violates the foreign key
        assert!(a.is_err());

        sqlx::query(
            "INSERT INTO irrigation_execution_logs (unit_id, planned_duration_s, execution_status, executed_at)
             VALUES ('u1', 30, 'completed', 0)",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let f1 = db.create_feedback_request("u1", "alice", 1, 10).await.unwrap();
        let f2 = db.create_feedback_request("u1", "alice", 1, 10).await.unwrap();
        let _unanswered = db.create_feedback_request("u1", "alice", 1, 10).await.unwrap();

        assert!(db.record_feedback_response(f1, FeedbackResponse::TooLittle, 20).await.unwrap());
        assert!(db.record_feedback_response(f2, FeedbackResponse::JustRight, 20).await.unwrap());
        // second answer to the same prompt is ignored
        assert!(!db.record_feedback_response(f1, FeedbackResponse::TooMuch, 30).await.unwrap());

        let c = db.feedback_counts("alice", "u1").await.unwrap();
        assert_eq!(c, FeedbackCounts { too_little: 1, too_much: 0, just_right: 1 });
        assert_eq!(db.feedback_counts("bob", "u1").await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn bump_preference_creates_and_increments() {
        let db = test_db().await;
        assert_eq!(db.preference_count("alice", "u1", PreferenceCounter::Auto).await.unwrap(), 0);
        db.bump_preference("alice", "u1", PreferenceCounter::Auto).await.unwrap();
        db.bump_preference("alice", "u1", PreferenceCounter::Auto).await.unwrap();
        db.bump_preference("alice", "u1", PreferenceCounter::Approval).await.unwrap();
        assert_eq!(db.preference_count("alice", "u1", PreferenceCounter::Auto).await.unwrap(), 2);
        assert_eq!(db.preference_count("alice", "u1", PreferenceCounter::Approval).await.unwrap(), 1);
    }
}
