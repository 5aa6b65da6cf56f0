//! # Error Types Module
//!
//! This module defines the error taxonomies shared between the plugin
//! registry and the check layer.
//!
//! ## Overview
//!
//! Two families of errors live here:
//!
//! - **`PluginError`**: everything that can go wrong while discovering,
//!   validating and activating plugins. All collection errors are fatal to
//!   the collection pass and surface the offending plugin by name, so that
//!   operators can locate the broken plugin directory from the message
//!   alone.
//! - **`CheckError`**: the taxonomy check commands report through. Check
//!   implementations live outside this repository, but the command surface
//!   they implement is defined here, so the error type is too.
//!
//! ## Fatality
//!
//! There is no partial recovery during collection: a plugin that declares a
//! known category either activates fully or aborts the pass. The only
//! non-error path that skips work is a manifest whose category is outside
//! the host's category filter, which is skipped silently.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the plugin registry during init, collection and lookup.
///
/// Every variant that points at a concrete plugin carries its name; the
/// `UnsatisfiedRequirements` message enumerates **all** missing dependency
/// names, not just the first one found.
#[derive(Error, Debug)]
pub enum PluginError {
    /// `collect` was invoked a second time on the same registry
    #[error("plugins were already collected; collect() can run only once per process")]
    AlreadyCollected,

    /// A plugin's `requirements.txt` names dependencies the host does not provide
    #[error("plugin {plugin} has unsatisfied requirements, missing: {}", missing.join(", "))]
    UnsatisfiedRequirements { plugin: String, missing: Vec<String> },

    /// The instantiated plugin object does not satisfy its category interface
    #[error("plugin {plugin} does not satisfy the capability interface of category {category}")]
    InterfaceMismatch { plugin: String, category: String },

    /// Two manifests resolved to the same (name, category) pair
    #[error("duplicate plugin {name} in category {category}")]
    DuplicatePlugin { name: String, category: String },

    /// The manifest names a kind with no registered builder
    #[error("plugin {plugin} declares unknown kind {kind}: no builder registered")]
    UnknownKind { plugin: String, kind: String },

    /// A manifest file could not be read or parsed
    #[error("invalid plugin manifest {}: {message}", path.display())]
    Manifest { path: PathBuf, message: String },

    /// The plugin's `configure` call rejected its resolved configuration
    #[error("plugin {plugin} failed to configure: {source}")]
    Configure {
        plugin: String,
        #[source]
        source: Box<PluginError>,
    },

    /// Free-form configuration rejection raised from inside a plugin
    #[error("invalid plugin configuration: {message}")]
    InvalidConfiguration { message: String },

    /// Filesystem error while scanning plugin directories
    #[error("plugin scan failed for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PluginError {
    /// Whether this error must halt collection and reach the process exit
    /// path. All collection errors are fatal; lookups never produce errors.
    pub fn is_fatal(&self) -> bool {
        true
    }
}

/// Errors reported by check commands.
///
/// Mirrors the check-layer taxonomy the worker's result encoder and
/// notification layer consume.
#[derive(Error, Debug)]
pub enum CheckError {
    #[error("check failed: {message}")]
    Check { message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("HTTP request failed for {url}: {message}")]
    Http { url: String, message: String },

    #[error("DB operation {operation} failed: {message}")]
    Db { operation: String, message: String },

    #[error("security error: {message}")]
    Security { message: String },

    #[error("notification error: {message}")]
    Notification { message: String },

    #[error("result size error: {message}")]
    ResultSize { message: String },

    #[error("check timed out: {message}")]
    Timeout { message: String },
}

impl CheckError {
    pub fn check(message: impl Into<String>) -> Self {
        CheckError::Check {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsatisfied_requirements_message_lists_every_missing_name() {
        let err = PluginError::UnsatisfiedRequirements {
            plugin: "color_germany".to_string(),
            missing: vec!["a".to_string(), "b".to_string(), "c".to_string()],
        };
        let msg = err.to_string();
        for name in ["a", "b", "c"] {
            assert!(msg.contains(name), "missing {name} in: {msg}");
        }
        assert!(msg.contains("color_germany"));
    }

    #[test]
    fn fatal_errors_name_the_offending_plugin() {
        let err = PluginError::InterfaceMismatch {
            plugin: "bad_color".to_string(),
            category: "Color".to_string(),
        };
        assert!(err.to_string().contains("bad_color"));
        assert!(err.is_fatal());
    }
}
