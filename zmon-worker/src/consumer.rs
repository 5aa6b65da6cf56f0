//! # Broker Consumer Module
//!
//! The worker's main loop: drain one named queue with a blocking pop,
//! decode envelopes, filter expired tasks, and hand decoded records plus a
//! synthesized task context to the executor inside a reactor task scope.
//! The sampling policy is refreshed opportunistically along the way.
//!
//! ## Failure semantics
//!
//! - An empty pop is an idle loop, trace-logged, never an error.
//! - Broker outages back off for `retry_backoff` and reconnect; the task
//!   stays on the broker if it was never popped.
//! - Decode errors drop the offending message and continue.
//! - Handler errors are recorded through the task scope and span-tagged
//!   `error`; they never break the loop.
//! - Expired tasks are silently discarded; a counter is logged every 500.
//!
//! Every message is processed inside a `worker_task_processing` span
//! carrying `worker_task_result` (`success` / `expired` / `error`),
//! `taskname`, `check_id` and, for dropped tasks,
//! `worker_task_expire_time`.

use std::sync::Arc;

use serde_json::Value;
use tracing::Instrument as _;

use crate::config::WorkerConfig;
use crate::envelope::{decode_frame, TaskContext, TaskEnvelope};
use crate::executor::TaskExecutor;
use crate::reactor::FlowControlReactor;
use crate::sampling::SamplingUpdater;
use crate::worker_error::WorkerError;

/// Expired-task count is logged every this many drops.
const EXPIRED_LOG_EVERY: u64 = 500;

/// Single-threaded consumer of one broker queue.
pub struct BrokerConsumer {
    config: WorkerConfig,
    executor: Arc<TaskExecutor>,
    reactor: Arc<FlowControlReactor>,
    sampling: SamplingUpdater,
    expired_count: u64,
    processed_count: u64,
}

impl BrokerConsumer {
    pub fn new(
        config: WorkerConfig,
        executor: Arc<TaskExecutor>,
        reactor: Arc<FlowControlReactor>,
    ) -> Self {
        let sampling = SamplingUpdater::new(config.sampling.clone());
        Self {
            config,
            executor,
            reactor,
            sampling,
            expired_count: 0,
            processed_count: 0,
        }
    }

    /// Run the intake loop forever. Returns only when the broker url is
    /// unusable; every runtime failure backs off and retries.
    pub async fn run(&mut self) -> Result<(), WorkerError> {
        let client = redis::Client::open(self.config.broker.url.as_str())?;
        tracing::info!(
            queue = %self.config.broker.queue,
            known_tasks = ?self.executor.known_tasks(),
            "connecting simple queue consumer"
        );
        loop {
            if let Err(e) = self.drain(&client).await {
                tracing::error!(error = %e, "error in broker loop, backing off");
                tokio::time::sleep(self.config.broker.retry_backoff).await;
            }
        }
    }

    async fn drain(&mut self, client: &redis::Client) -> Result<(), WorkerError> {
        let mut conn = client.get_multiplexed_async_connection().await?;
        loop {
            let popped: Option<(String, Vec<u8>)> = redis::cmd("BLPOP")
                .arg(&self.config.broker.queue)
                .arg(self.config.broker.pop_timeout.as_secs())
                .query_async(&mut conn)
                .await?;
            let Some((queue, raw)) = popped else {
                tracing::trace!("idle loop, no task received");
                continue;
            };
            self.handle_frame(&queue, &raw).await;
        }
    }

    /// Decode and process one raw frame. Never propagates: per-message
    /// failures must not break the loop.
    pub async fn handle_frame(&mut self, queue: &str, raw: &[u8]) {
        let span = tracing::info_span!(
            "worker_task_processing",
            taskname = tracing::field::Empty,
            check_id = tracing::field::Empty,
            worker_task_result = tracing::field::Empty,
            worker_task_expire_time = tracing::field::Empty,
            sampling_rate_updated = tracing::field::Empty,
            trace_parent = tracing::field::Empty,
        );

        async {
            let span = tracing::Span::current();

            let envelope = match decode_frame(raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    // frame-level garbage backs off like a broker failure;
                    // body-level decode errors below just drop the message
                    span.record("worker_task_result", "error");
                    tracing::error!(error = %e, "dropping undecodable frame, backing off");
                    tokio::time::sleep(self.config.broker.retry_backoff).await;
                    return;
                }
            };

            // trace context handed over from the scheduler
            if !envelope.properties.trace.is_empty() {
                let trace = Value::Object(envelope.properties.trace.clone()).to_string();
                span.record("trace_parent", trace.as_str());
            }

            if let Some(updated) = self.sampling.refresh_if_due().await {
                span.record("sampling_rate_updated", updated);
            }

            match self.process_message(queue, &envelope).await {
                Ok(true) => {
                    span.record("worker_task_result", "success");
                }
                Ok(false) => {
                    span.record("worker_task_result", "expired");
                    self.expired_count += 1;
                    if self.expired_count % EXPIRED_LOG_EVERY == 0 {
                        tracing::warn!(expired_count = self.expired_count, "expired tasks count");
                    }
                }
                Err(e) => {
                    span.record("worker_task_result", "error");
                    tracing::error!(error = %e, "task processing failed");
                }
            }
            self.processed_count += 1;
        }
        .instrument(span)
        .await;
    }

    /// Decode the body, apply the expiry gate and dispatch. `Ok(true)` when
    /// the task executed, `Ok(false)` when it was dropped as expired.
    pub async fn process_message(
        &self,
        queue: &str,
        envelope: &TaskEnvelope,
    ) -> Result<bool, WorkerError> {
        let record = envelope.decode_body()?;
        let span = tracing::Span::current();
        span.record("taskname", record.task.as_str());
        span.record("check_id", record.check_id().as_str());

        let now = record.current_time();
        let (expired, deadline) = record.is_expired(now)?;
        if expired {
            span.record("worker_task_expire_time", deadline.to_string().as_str());
            tracing::warn!(
                taskname = %record.task,
                check_id = %record.check_id(),
                cur_time = %now,
                expire_time = %deadline,
                "discarding task due to time expiration"
            );
            return Ok(false);
        }

        let task_context = TaskContext::synthesize(queue, envelope, &record);
        let scope = self.reactor.task_scope(
            &record.task,
            record.timelimit.hard,
            record.timelimit.soft,
        );
        match self
            .executor
            .dispatch(&record, &task_context, self.sampling.current())
            .await
        {
            Ok(()) => {
                scope.complete();
                Ok(true)
            }
            Err(e) => {
                scope.fail(&e);
                Err(e)
            }
        }
    }

    /// Tasks dropped by the expiry gate so far.
    pub fn expired_count(&self) -> u64 {
        self.expired_count
    }

    /// Frames handled so far, including expired and failed ones.
    pub fn processed_count(&self) -> u64 {
        self.processed_count
    }
}
