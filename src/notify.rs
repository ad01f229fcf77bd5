//! Best-effort webhook notifications.
//!
//! When a task message carries a notification URL the worker posts the
//! final status to it after the status record is finalized. Delivery is
//! advisory: failures are logged and never affect the pipeline or the
//! acknowledgement.

use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use crate::error::WorkerError;
use crate::message::RunStatus;

/// HTTP client for task completion webhooks.
pub struct Notifier {
    client: reqwest::Client,
}

impl Notifier {
    pub fn new() -> Result<Self, WorkerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }

    /// Posts `{key-value-id, status}` to `url`, logging the outcome.
    pub async fn notify(&self, url: &str, kv_id: &str, status: RunStatus) {
        let body = json!({
            "key-value-id": kv_id,
            "status": status,
        });
        match self.client.post(url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url, kv_id, "notification delivered");
            }
            Ok(response) => {
                warn!(url, kv_id, status = %response.status(), "notification rejected");
            }
            Err(e) => {
                warn!(url, kv_id, error = %e, "notification delivery failed");
            }
        }
    }
}
