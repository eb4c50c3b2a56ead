//! User notifications. Delivery itself (push, email, in-app) happens
//! downstream of the broker; the engine only publishes JSON to
//! `notify/<user_id>` and keeps feedback prompts in `irrigation_feedback`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use tracing::info;

use crate::db::{now_unix, Db};

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Asks the user how the watering went. Returns the feedback id the
    /// answer must be published against.
    async fn request_irrigation_feedback(
        &self,
        unit_id: &str,
        user_id: &str,
        execution_log_id: i64,
    ) -> Result<i64>;

    async fn send_notification(&self, user_id: &str, title: &str, message: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    FeedbackRequest {
        feedback_id: i64,
        unit_id: String,
        execution_log_id: i64,
        ts: i64,
    },
    Message {
        title: String,
        message: String,
        ts: i64,
    },
}

pub fn notify_topic(user_id: &str) -> String {
    format!("notify/{user_id}")
}

pub struct MqttNotifier {
    client: AsyncClient,
    db: Db,
}

impl MqttNotifier {
    pub fn new(client: AsyncClient, db: Db) -> Self {
        Self { client, db }
    }

    async fn publish(&self, user_id: &str, n: &Notification) -> Result<()> {
        let payload = serde_json::to_vec(n).context("encode notification")?;
        self.client
            .publish(notify_topic(user_id), QoS::AtLeastOnce, false, payload)
            .await
            .with_context(|| format!("publish notification to {user_id}"))?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for MqttNotifier {
    async fn request_irrigation_feedback(
        &self,
        unit_id: &str,
        user_id: &str,
        execution_log_id: i64,
    ) -> Result<i64> {
        let now = now_unix();
        let feedback_id = self
            .db
            .create_feedback_request(unit_id, user_id, execution_log_id, now)
            .await?;
        self.publish(
            user_id,
            &Notification::FeedbackRequest {
                feedback_id,
                unit_id: unit_id.to_string(),
                execution_log_id,
                ts: now,
            },
        )
        .await?;
        info!(unit = %unit_id, user = %user_id, feedback_id, "feedback requested");
        Ok(feedback_id)
    }

    async fn send_notification(&self, user_id: &str, title: &str, message: &str) -> Result<()> {
        self.publish(
            user_id,
            &Notification::Message {
                title: title.to_string(),
                message: message.to_string(),
                ts: now_unix(),
            },
        )
        .await?;
        info!(user = %user_id, %title, "notification sent");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
