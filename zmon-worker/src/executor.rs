//! # Task Executor Module
//!
//! A thin dispatcher over the fixed handler table. Handlers receive the
//! record's positional arguments, the synthesized task context, the current
//! sampling policy and the record's named arguments. Unknown task names are
//! a programming error at the dispatch site: the producer is trusted, so
//! the error is logged and the intake loop continues.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::envelope::{TaskContext, TaskRecord};
use crate::sampling::SamplingConfig;
use crate::worker_error::WorkerError;

/// A registered task handler.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(
        &self,
        args: &[Value],
        kwargs: &Map<String, Value>,
        task_context: &TaskContext,
        sampling_config: Option<&SamplingConfig>,
    ) -> Result<(), WorkerError>;
}

/// Dispatcher over the fixed handler table.
#[derive(Default)]
pub struct TaskExecutor {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, taskname: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(taskname.into(), handler);
    }

    pub fn known_tasks(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn dispatch(
        &self,
        record: &TaskRecord,
        task_context: &TaskContext,
        sampling_config: Option<&SamplingConfig>,
    ) -> Result<(), WorkerError> {
        let handler = self
            .handlers
            .get(&record.task)
            .ok_or_else(|| WorkerError::UnknownTask(record.task.clone()))?;
        handler
            .run(&record.args, &record.kwargs, task_context, sampling_config)
            .await
    }
}
