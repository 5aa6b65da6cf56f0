//! # Built-in Task Handlers Module
//!
//! Thin implementations of the fixed handler table. The real check and
//! notification logic lives in the check layer outside this crate; these
//! handlers own the parts the worker core is responsible for: the sampling
//! decision, resolving the check command through the plugin registry, and
//! reporting failures.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use zmon_worker_sdk::{FactoryContext, PluginRegistry};

use crate::envelope::TaskContext;
use crate::eventlog::EventLog;
use crate::executor::{TaskExecutor, TaskHandler};
use crate::sampling::SamplingConfig;
use crate::worker_error::WorkerError;

/// Category the executor resolves check commands from.
pub const FUNCTION_CATEGORY: &str = "Function";

/// Eventlog type id for check failures.
pub const EVENTLOG_TYPE_CHECK_ERROR: u32 = 212;

/// Sampling decision: critical checks are always sampled; otherwise the
/// per-account rate applies, falling back to the default rate.
pub fn is_sampled(
    sampling_config: Option<&SamplingConfig>,
    check_id: Option<i64>,
    account: Option<&str>,
) -> bool {
    let Some(config) = sampling_config else {
        return true;
    };
    if let Some(id) = check_id {
        if config.critical_checks.contains(&id) {
            return true;
        }
    }
    let rate = account
        .and_then(|account| config.worker_sampling.get(account).copied())
        .unwrap_or(config.default_sampling);
    rand::random::<f64>() * 100.0 < f64::from(rate)
}

struct CheckRequest<'a> {
    check_id: Option<i64>,
    entity: Value,
    account: Option<&'a str>,
    plugin: &'a str,
    command_args: Vec<Value>,
}

fn parse_check_request<'a>(
    args: &'a [Value],
    taskname: &str,
) -> Result<CheckRequest<'a>, WorkerError> {
    let request = args
        .first()
        .and_then(Value::as_object)
        .ok_or_else(|| WorkerError::Task {
            taskname: taskname.to_string(),
            message: "first positional argument must be a check request mapping".to_string(),
        })?;
    Ok(CheckRequest {
        check_id: request.get("check_id").and_then(Value::as_i64),
        entity: request.get("entity").cloned().unwrap_or(Value::Null),
        account: request
            .get("entity")
            .and_then(|entity| entity.get("account_id"))
            .and_then(Value::as_str),
        plugin: request.get("plugin").and_then(Value::as_str).unwrap_or("http"),
        command_args: request
            .get("command_args")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
    })
}

async fn run_check(
    registry: &PluginRegistry,
    request: &CheckRequest<'_>,
    kwargs: &Map<String, Value>,
    taskname: &str,
) -> Result<Value, WorkerError> {
    let plugin_object = registry
        .get_plugin_obj_by_name(request.plugin, FUNCTION_CATEGORY)
        .ok_or_else(|| WorkerError::Task {
            taskname: taskname.to_string(),
            message: format!("no Function plugin named {}", request.plugin),
        })?;
    let factory = plugin_object
        .as_function_factory()
        .ok_or_else(|| WorkerError::Task {
            taskname: taskname.to_string(),
            message: format!("plugin {} is not a function factory", request.plugin),
        })?;
    let command = factory.create(&FactoryContext {
        check_id: request.check_id,
        entity: request.entity.clone(),
        extras: Map::new(),
    });
    Ok(command.call(&request.command_args, kwargs).await?)
}

/// `check_and_notify`: run the check command for an entity and report the
/// outcome. Skipped entirely when the sampling decision says no.
pub struct CheckAndNotifyHandler {
    registry: &'static PluginRegistry,
    eventlog: Arc<EventLog>,
}

#[async_trait]
impl TaskHandler for CheckAndNotifyHandler {
    async fn run(
        &self,
        args: &[Value],
        kwargs: &Map<String, Value>,
        task_context: &TaskContext,
        sampling_config: Option<&SamplingConfig>,
    ) -> Result<(), WorkerError> {
        let request = parse_check_request(args, &task_context.taskname)?;
        if !is_sampled(sampling_config, request.check_id, request.account) {
            tracing::debug!(check_id = ?request.check_id, "check not sampled, skipping");
            return Ok(());
        }
        match run_check(&*self.registry, &request, kwargs, &task_context.taskname).await {
            Ok(value) => {
                tracing::info!(
                    check_id = ?request.check_id,
                    task_id = %task_context.task_properties.id,
                    result = %value,
                    "check finished"
                );
                Ok(())
            }
            Err(e) => {
                self.eventlog
                    .put(
                        EVENTLOG_TYPE_CHECK_ERROR,
                        json!({
                            "checkId": request.check_id,
                            "taskId": task_context.task_properties.id,
                            "error": e.to_string(),
                        }),
                    )
                    .await;
                Err(e)
            }
        }
    }
}

/// `trial_run`: same execution path as `check_and_notify`, but ad hoc and
/// never sampled away; an operator is waiting for the result.
pub struct TrialRunHandler {
    registry: &'static PluginRegistry,
}

#[async_trait]
impl TaskHandler for TrialRunHandler {
    async fn run(
        &self,
        args: &[Value],
        kwargs: &Map<String, Value>,
        task_context: &TaskContext,
        _sampling_config: Option<&SamplingConfig>,
    ) -> Result<(), WorkerError> {
        let request = parse_check_request(args, &task_context.taskname)?;
        let value = run_check(&*self.registry, &request, kwargs, &task_context.taskname).await?;
        tracing::info!(check_id = ?request.check_id, result = %value, "trial run finished");
        Ok(())
    }
}

/// `cleanup`: housekeeping trigger from the scheduler.
pub struct CleanupHandler;

#[async_trait]
impl TaskHandler for CleanupHandler {
    async fn run(
        &self,
        _args: &[Value],
        _kwargs: &Map<String, Value>,
        task_context: &TaskContext,
        _sampling_config: Option<&SamplingConfig>,
    ) -> Result<(), WorkerError> {
        tracing::info!(queue = %task_context.queue, "cleanup requested");
        Ok(())
    }
}

/// Wire the fixed handler table.
pub fn register_builtin_handlers(
    executor: &mut TaskExecutor,
    registry: &'static PluginRegistry,
    eventlog: Arc<EventLog>,
) {
    executor.register(
        "check_and_notify",
        Arc::new(CheckAndNotifyHandler { registry, eventlog }),
    );
    executor.register("trial_run", Arc::new(TrialRunHandler { registry }));
    executor.register("cleanup", Arc::new(CleanupHandler));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventLogConfig;
    use crate::envelope::decode_frame;
    use std::collections::HashMap;
    use zmon_worker_sdk::{
        CategoryInterface, CheckCommand, CheckError, CollectOptions, FunctionFactoryPlugin,
        PluginContext, PluginError, PluginObject,
    };

    fn sampling(default: u32) -> SamplingConfig {
        SamplingConfig {
            default_sampling: default,
            critical_checks: vec![13],
            worker_sampling: HashMap::from([("account-1".to_string(), 0)]),
        }
    }

    #[test]
    fn sampling_decision_honours_rates_and_critical_checks() {
        // no config means everything runs
        assert!(is_sampled(None, Some(1), None));
        // full rate always samples, zero rate never does
        assert!(is_sampled(Some(&sampling(100)), Some(1), None));
        assert!(!is_sampled(Some(&sampling(0)), Some(1), None));
        // critical checks bypass the rate
        assert!(is_sampled(Some(&sampling(0)), Some(13), None));
        // per-account rate beats the default
        assert!(!is_sampled(Some(&sampling(100)), Some(1), Some("account-1")));
    }

    struct EchoCommand;

    #[async_trait]
    impl CheckCommand for EchoCommand {
        async fn call(
            &self,
            args: &[Value],
            _kwargs: &Map<String, Value>,
        ) -> Result<Value, CheckError> {
            Ok(json!({"echo": args}))
        }
    }

    struct EchoFactory;

    impl PluginObject for EchoFactory {
        fn configure(
            &self,
            _conf: &std::collections::HashMap<String, String>,
        ) -> Result<(), PluginError> {
            Ok(())
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }

        fn as_function_factory(&self) -> Option<&dyn FunctionFactoryPlugin> {
            Some(self)
        }
    }

    impl FunctionFactoryPlugin for EchoFactory {
        fn create(&self, _factory_ctx: &FactoryContext) -> Box<dyn CheckCommand> {
            Box::new(EchoCommand)
        }
    }

    fn build_echo(_ctx: &PluginContext) -> Result<Arc<dyn PluginObject>, PluginError> {
        Ok(Arc::new(EchoFactory))
    }

    fn leaked_registry_with_echo() -> &'static PluginRegistry {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("echo.worker-plugin.toml"),
            "[plugin]\nname = \"echo\"\ncategory = \"Function\"\n",
        )
        .unwrap();
        let mut filter = HashMap::new();
        filter.insert(
            FUNCTION_CATEGORY.to_string(),
            CategoryInterface::function_factory(),
        );
        let mut registry = PluginRegistry::new(filter);
        registry.register_builder("echo", build_echo);
        registry
            .collect(CollectOptions {
                additional_dirs: vec![tmp.path().to_path_buf()],
                ..Default::default()
            })
            .unwrap();
        Box::leak(Box::new(registry))
    }

    fn context_for(taskname: &str) -> TaskContext {
        let frame = format!(
            r#"{{"body":{{"task":"{taskname}","timelimit":[90,60]}},"properties":{{"body_encoding":"nested"}}}}"#
        );
        let envelope = decode_frame(frame.as_bytes()).unwrap();
        let record = envelope.decode_body().unwrap();
        TaskContext::synthesize("zmon:queue:default", &envelope, &record)
    }

    fn disabled_eventlog() -> Arc<EventLog> {
        Arc::new(EventLog::new(&EventLogConfig {
            host: "localhost".to_string(),
            port: 8081,
            http: false,
        }))
    }

    #[tokio::test]
    async fn check_and_notify_resolves_plugin_and_runs_command() {
        let handler = CheckAndNotifyHandler {
            registry: leaked_registry_with_echo(),
            eventlog: disabled_eventlog(),
        };
        let args = vec![json!({
            "check_id": 277,
            "entity": {"id": "host-1", "account_id": "account-9"},
            "plugin": "echo",
            "command_args": ["https://example.org"]
        })];
        handler
            .run(
                &args,
                &Map::new(),
                &context_for("check_and_notify"),
                Some(&sampling(100)),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unsampled_checks_are_skipped_without_plugin_lookup() {
        // registry without any plugin: the handler must not even look
        let mut filter = HashMap::new();
        filter.insert(
            FUNCTION_CATEGORY.to_string(),
            CategoryInterface::function_factory(),
        );
        let registry: &'static PluginRegistry =
            Box::leak(Box::new(PluginRegistry::new(filter)));
        let handler = CheckAndNotifyHandler {
            registry,
            eventlog: disabled_eventlog(),
        };
        let args = vec![json!({"check_id": 277, "entity": {"account_id": "account-1"}})];
        handler
            .run(
                &args,
                &Map::new(),
                &context_for("check_and_notify"),
                Some(&sampling(100)),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_plugin_is_a_task_error() {
        let handler = TrialRunHandler {
            registry: leaked_registry_with_echo(),
        };
        let args = vec![json!({"check_id": 1, "plugin": "no_such_plugin"})];
        let err = handler
            .run(&args, &Map::new(), &context_for("trial_run"), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no_such_plugin"));
    }

    #[tokio::test]
    async fn malformed_check_request_is_a_task_error() {
        let handler = TrialRunHandler {
            registry: leaked_registry_with_echo(),
        };
        let err = handler
            .run(
                &[json!("not a mapping")],
                &Map::new(),
                &context_for("trial_run"),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Task { .. }));
    }
}
