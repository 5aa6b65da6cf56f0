//! Eventlog shipper. Delivery of check events to the eventlog service is an
//! external collaborator; this module only knows the target and whether
//! HTTP shipping is switched on. Failures are logged and swallowed, the
//! eventlog is never allowed to slow down task processing.

use serde_json::{json, Value};

use crate::config::EventLogConfig;

pub struct EventLog {
    enabled: bool,
    target: String,
    http: reqwest::Client,
}

impl EventLog {
    pub fn new(config: &EventLogConfig) -> Self {
        Self {
            enabled: config.http,
            target: format!("http://{}:{}/", config.host, config.port),
            http: reqwest::Client::new(),
        }
    }

    /// Ship one entry, best effort.
    pub async fn put(&self, type_id: u32, attributes: Value) {
        if !self.enabled {
            tracing::debug!(type_id, "eventlog http disabled, entry skipped");
            return;
        }
        let payload = json!([{
            "typeId": type_id,
            "time": chrono::Utc::now().to_rfc3339(),
            "attributes": attributes,
        }]);
        match self.http.post(&self.target).json(&payload).send().await {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(status = %response.status(), "eventlog rejected entry");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "eventlog delivery failed"),
        }
    }
}
