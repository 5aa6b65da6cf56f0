//! # ZMON Worker Library
//!
//! Execution core of a distributed monitoring worker. A fleet of these
//! processes pulls check-execution tasks from a shared broker queue, runs
//! each check under strict time limits, and cooperates with a parent
//! supervisor that can terminate misbehaving workers.
//!
//! ## Architecture
//!
//! - **`consumer`**: the intake loop: blocking pop from the broker,
//!   envelope decoding, expiry filtering, dispatch.
//! - **`reactor`**: the flow-control reactor: per-task deadline tracking
//!   with hard-kill escalation, liveness pings and batched event shipping
//!   to the parent over RPC.
//! - **`executor`** / **`tasks`**: the fixed handler table
//!   (`check_and_notify`, `trial_run`, `cleanup`) and its built-in
//!   handlers.
//! - **`envelope`**: wire model for broker frames, transport encodings and
//!   the expiry gate.
//! - **`sampling`**: runtime-refreshed sampling policy.
//! - **`rpc_client`**: XML-RPC client for the parent supervisor, including
//!   the `js:<json>` keyword-argument bridge.
//! - **`builtins`**: compiled-in plugins discovered through the
//!   `zmon-worker-sdk` registry.
//!
//! ## Correctness envelope
//!
//! At most one execution per task (ack by consumption), bounded latency
//! through hard-kill escalation, backpressure through pop timeouts and
//! backoff under broker outages, and a typed extension model via the plugin
//! SDK.

pub mod builtins;
pub mod config;
pub mod consumer;
pub mod envelope;
pub mod eventlog;
pub mod executor;
pub mod reactor;
pub mod rpc_client;
pub mod sampling;
pub mod tasks;
pub mod worker_error;

pub use config::WorkerConfig;
pub use consumer::BrokerConsumer;
pub use envelope::{decode_frame, TaskContext, TaskEnvelope, TaskRecord, TimeLimit};
pub use executor::{TaskExecutor, TaskHandler};
pub use reactor::{FlowControlReactor, ReactorConfig, TaskScope};
pub use rpc_client::{EventKind, EventRecord, PingData, WorkerRpc, XmlRpcClient};
pub use sampling::{SamplingConfig, SamplingUpdater};
pub use worker_error::WorkerError;
