//! # Worker Error Types Module
//!
//! Error taxonomy for the worker execution core, one variant per recovery
//! class:
//!
//! - **Transient I/O** (`Broker`, `Http`): logged and retried with backoff,
//!   never fatal.
//! - **Decode errors** (`Decode`, `Serialization`): the offending message is
//!   dropped, the loop continues.
//! - **Handler failures** (`Task`, `Check`, `UnknownTask`): recorded as an
//!   ERROR event in the reactor; the loop continues.
//! - **RPC failures** (`Rpc`): best-effort calls to the parent; the reactor
//!   loop records them and keeps ticking.
//! - **Plugin-fatal** (`Plugin`): surfaces to the process entry point, which
//!   exits non-zero.

use thiserror::Error;
use zmon_worker_sdk::{CheckError, PluginError};

/// Errors raised by the worker's intake loop, reactor and executor.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Broker connectivity or command failure
    #[error("broker error: {0}")]
    Broker(#[from] redis::RedisError),

    /// A message that cannot be decoded into a task record
    #[error("decode error: {message}")]
    Decode { message: String },

    /// JSON (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Outbound HTTP failure (sampling entity, eventlog)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A parent RPC call failed
    #[error("RPC call {method} failed: {message}")]
    Rpc { method: String, message: String },

    /// Dispatch asked for a task name outside the fixed handler table.
    /// The producer is trusted, so this is a programming error when seen.
    #[error("unknown task name: {0}")]
    UnknownTask(String),

    /// A task handler failed
    #[error("task {taskname} failed: {message}")]
    Task { taskname: String, message: String },

    /// A check command failed
    #[error(transparent)]
    Check(#[from] CheckError),

    /// Plugin discovery or activation failure, fatal to the process
    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// Invalid worker configuration
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl WorkerError {
    pub fn decode(message: impl Into<String>) -> Self {
        WorkerError::Decode {
            message: message.into(),
        }
    }

    pub fn rpc(method: impl Into<String>, message: impl Into<String>) -> Self {
        WorkerError::Rpc {
            method: method.into(),
            message: message.into(),
        }
    }

    /// Whether this error class must reach the process exit path instead of
    /// being retried or dropped locally.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WorkerError::Plugin(_))
    }
}
