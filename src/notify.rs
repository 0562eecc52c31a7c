//! Group notification dispatch
//!
//! Delivery is best effort: the session logs a failed send and moves on.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::NotifyError;

/// Path appended to the configured server base URL
pub const FATIGUE_WARNING_PATH: &str = "/send-fatigue-warning";

/// Body of a group warning request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationMessage {
    #[serde(rename = "messageTitle")]
    pub title: String,
    #[serde(rename = "messageBody")]
    pub body: String,
    #[serde(rename = "groupID")]
    pub group_id: String,
}

impl NotificationMessage {
    pub fn new(title: impl Into<String>, body: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            group_id: group_id.into(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &NotificationMessage) -> Result<(), NotifyError>;
}

/// Posts warnings to the group notification server
pub struct HttpNotifier {
    client: reqwest::Client,
    url: String,
}

impl HttpNotifier {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), FATIGUE_WARNING_PATH),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(&self, message: &NotificationMessage) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(message)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status {
                status: status.as_u16(),
            });
        }
        debug!(group_id = %message.group_id, "group notified");
        Ok(())
    }
}

/// Used when no notification server is configured
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &NotificationMessage) -> Result<(), NotifyError> {
        info!(
            group_id = %message.group_id,
            title = %message.title,
            body = %message.body,
            "notification (not dispatched)"
        );
        Ok(())
    }
}

/// Keeps every message in memory
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<NotificationMessage>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<NotificationMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: &NotificationMessage) -> Result<(), NotifyError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(message.clone());
        }
        Ok(())
    }
}
