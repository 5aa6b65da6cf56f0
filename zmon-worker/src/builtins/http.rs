//! Built-in `http` check-function provider: GET a url, report status code,
//! response time and a body snippet.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use zmon_worker_sdk::{
    CheckCommand, CheckError, FactoryContext, FunctionFactoryPlugin, PluginContext, PluginError,
    PluginObject,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const BODY_SNIPPET_LIMIT: usize = 1024;

/// Builder registered under kind `http`.
pub fn build(_ctx: &PluginContext) -> Result<Arc<dyn PluginObject>, PluginError> {
    Ok(Arc::new(HttpFunctionPlugin {
        timeout: Mutex::new(DEFAULT_TIMEOUT),
        user_agent: Mutex::new(format!("zmon-worker/{}", env!("CARGO_PKG_VERSION"))),
    }))
}

pub struct HttpFunctionPlugin {
    timeout: Mutex<Duration>,
    user_agent: Mutex<String>,
}

impl PluginObject for HttpFunctionPlugin {
    fn configure(&self, conf: &HashMap<String, String>) -> Result<(), PluginError> {
        if let Some(raw) = conf.get("timeout") {
            let secs: u64 = raw.parse().map_err(|_| PluginError::InvalidConfiguration {
                message: format!("timeout must be whole seconds, got {raw:?}"),
            })?;
            *self.timeout.lock().expect("timeout lock") = Duration::from_secs(secs);
        }
        if let Some(user_agent) = conf.get("user_agent") {
            *self.user_agent.lock().expect("user agent lock") = user_agent.clone();
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_function_factory(&self) -> Option<&dyn FunctionFactoryPlugin> {
        Some(self)
    }
}

impl FunctionFactoryPlugin for HttpFunctionPlugin {
    fn create(&self, factory_ctx: &FactoryContext) -> Box<dyn CheckCommand> {
        Box::new(HttpGetCommand {
            client: reqwest::Client::new(),
            timeout: *self.timeout.lock().expect("timeout lock"),
            user_agent: self.user_agent.lock().expect("user agent lock").clone(),
            check_id: factory_ctx.check_id,
        })
    }
}

struct HttpGetCommand {
    client: reqwest::Client,
    timeout: Duration,
    user_agent: String,
    check_id: Option<i64>,
}

#[async_trait]
impl CheckCommand for HttpGetCommand {
    async fn call(&self, args: &[Value], kwargs: &Map<String, Value>) -> Result<Value, CheckError> {
        let url = args
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| CheckError::Configuration {
                message: "http check needs a url as first argument".to_string(),
            })?;
        let timeout = kwargs
            .get("timeout")
            .and_then(Value::as_f64)
            .filter(|secs| *secs > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(self.timeout);

        let started = Instant::now();
        let response = self
            .client
            .get(url)
            .header("user-agent", &self.user_agent)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| CheckError::Http {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| CheckError::Http {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        let elapsed = started.elapsed().as_secs_f64();

        let snippet: String = body.chars().take(BODY_SNIPPET_LIMIT).collect();
        Ok(json!({
            "check_id": self.check_id,
            "status": status,
            "time": elapsed,
            "length": body.len(),
            "body": snippet,
        }))
    }
}
