//! # Sampling Configuration Module
//!
//! Runtime-refreshed policy controlling whether a given check is traced and
//! reported. Defaults come from the worker configuration; a ZMON entity
//! endpoint can override them at runtime:
//!
//! ```json
//! {
//!     "id": "zmon-sampling-rate",
//!     "type": "zmon_config",
//!     "default_sampling": 100,
//!     "critical_checks": [13, 14, 19],
//!     "worker_sampling": {"account-1": 50, "account-2": 0}
//! }
//! ```
//!
//! Refresh happens opportunistically from the intake loop, at most once per
//! `update_rate`, with a 2 second timeout. A failed refresh keeps the
//! previously loaded value; refresh failures never block task processing.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::SamplingSettings;
use crate::worker_error::WorkerError;

/// Entity id serving the sampling policy.
pub const SAMPLING_RATE_ENTITY_ID: &str = "zmon-sampling-rate";

/// Timeout for the entity fetch.
pub const SAMPLING_FETCH_TIMEOUT: Duration = Duration::from_secs(2);

/// Sampling policy as consumed by task handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub default_sampling: u32,
    #[serde(default)]
    pub critical_checks: Vec<i64>,
    #[serde(default)]
    pub worker_sampling: HashMap<String, u32>,
}

impl SamplingConfig {
    pub fn from_settings(settings: &SamplingSettings) -> Self {
        Self {
            default_sampling: settings.rate,
            critical_checks: settings.critical_checks.clone(),
            worker_sampling: HashMap::new(),
        }
    }
}

/// Owns the current sampling policy and its refresh schedule.
pub struct SamplingUpdater {
    settings: SamplingSettings,
    http: reqwest::Client,
    current: Option<SamplingConfig>,
    last_attempt: Option<Instant>,
}

impl SamplingUpdater {
    pub fn new(settings: SamplingSettings) -> Self {
        Self {
            settings,
            http: reqwest::Client::new(),
            current: None,
            last_attempt: None,
        }
    }

    pub fn current(&self) -> Option<&SamplingConfig> {
        self.current.as_ref()
    }

    fn due(&self) -> bool {
        match (self.current.as_ref(), self.last_attempt) {
            (None, None) => true,
            (None, Some(at)) | (Some(_), Some(at)) => at.elapsed() >= self.settings.update_rate,
            (Some(_), None) => true,
        }
    }

    /// Refresh the policy when the update interval has elapsed. Returns
    /// `None` when no attempt was due, otherwise whether the entity merge
    /// succeeded. The attempt clock advances on failure too, so a dead
    /// endpoint is retried once per interval, not once per message.
    pub async fn refresh_if_due(&mut self) -> Option<bool> {
        if !self.due() {
            return None;
        }
        self.last_attempt = Some(Instant::now());

        let defaults = SamplingConfig::from_settings(&self.settings);
        let Some(zmon_url) = self.settings.zmon_url.clone() else {
            tracing::debug!("no zmon_url configured, sampling entity not used");
            self.current.get_or_insert(defaults);
            return Some(false);
        };

        match self.fetch_entity(&zmon_url).await {
            Ok(entity) => match merge_entity(&defaults, &entity) {
                Ok(merged) => {
                    tracing::debug!(config = ?merged, "sampling config refreshed");
                    self.current = Some(merged);
                    Some(true)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "sampling entity malformed, keeping previous config");
                    self.current.get_or_insert(defaults);
                    Some(false)
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "sampling entity fetch failed, keeping previous config");
                self.current.get_or_insert(defaults);
                Some(false)
            }
        }
    }

    async fn fetch_entity(&self, zmon_url: &str) -> Result<Value, WorkerError> {
        let url = format!("{zmon_url}/api/v1/entities/{SAMPLING_RATE_ENTITY_ID}");
        let mut request = self.http.get(&url).timeout(SAMPLING_FETCH_TIMEOUT);
        if let Some(token) = &self.settings.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?.error_for_status()?;
        Ok(response.json().await?)
    }
}

/// Merge the entity document over the configured defaults, matching keys
/// replacing wholesale.
fn merge_entity(defaults: &SamplingConfig, entity: &Value) -> Result<SamplingConfig, WorkerError> {
    let mut base = serde_json::to_value(defaults)?;
    let (Some(base_map), Some(entity_map)) = (base.as_object_mut(), entity.as_object()) else {
        return Err(WorkerError::decode("sampling entity is not a JSON object"));
    };
    for (key, value) in entity_map {
        base_map.insert(key.clone(), value.clone());
    }
    // entities carry extra fields like "id" and "type"
    let merged = serde_json::from_value(Value::Object(
        base_map
            .iter()
            .filter(|(k, _)| {
                matches!(
                    k.as_str(),
                    "default_sampling" | "critical_checks" | "worker_sampling"
                )
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    ))?;
    Ok(merged)
}
