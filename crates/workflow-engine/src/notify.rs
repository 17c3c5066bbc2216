use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Posts workflow outcome notifications to the external notifier.
/// Delivery failures are logged, never fatal to the execution.
#[derive(Clone)]
pub struct Notifier {
    client: Client,
    endpoint: Option<String>,
}

impl Notifier {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub async fn workflow_finished(
        &self,
        workflow_id: Uuid,
        execution_id: Uuid,
        status: &str,
        error: Option<&str>,
    ) {
        let Some(endpoint) = &self.endpoint else {
            return;
        };
        let payload = json!({
            "workflow_id": workflow_id,
            "execution_id": execution_id,
            "status": status,
            "error": error,
        });
        match self
            .client
            .post(endpoint)
            .json(&payload)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                debug!(execution_id = %execution_id, "Notification delivered");
            }
            Ok(response) => {
                warn!(
                    execution_id = %execution_id,
                    status = %response.status(),
                    "Notifier rejected the notification"
                );
            }
            Err(error) => {
                warn!(execution_id = %execution_id, error = %error, "Notification delivery failed");
            }
        }
    }
}
