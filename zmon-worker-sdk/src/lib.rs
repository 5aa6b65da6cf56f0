//! # ZMON Worker SDK
//!
//! Extension model for the ZMON worker: a category-filtered plugin registry,
//! the capability traits plugin objects implement, protected partial
//! application for check commands, and the error taxonomy shared between the
//! registry and the check layer.
//!
//! ## Overview
//!
//! The worker discovers check-function providers at startup by scanning
//! plugin manifests on disk. Each manifest declares a plugin name, a
//! category and the `kind` of compiled-in builder that instantiates it.
//! Categories are capability contracts: the registry admits an object into a
//! category only when it satisfies the category's capability predicate. The
//! built-in **Function** category requires two operations: `create` a check
//! command for a factory context and `configure` the plugin with its merged
//! configuration.
//!
//! ## Quick start
//!
//! ```rust
//! use std::collections::HashMap;
//! use zmon_worker_sdk::{
//!     CategoryInterface, CollectOptions, PluginRegistry,
//! };
//!
//! let mut filter = HashMap::new();
//! filter.insert("Function".to_string(), CategoryInterface::function_factory());
//!
//! let mut registry = PluginRegistry::new(filter);
//! registry.register_builder("http", my_http_builder);
//! registry.collect(CollectOptions {
//!     load_builtins: true,
//!     load_env: true,
//!     ..Default::default()
//! })?;
//!
//! let http = registry.get_plugin_obj_by_name("http", "Function");
//! ```
//!
//! Collection is one-shot: a second `collect` on the same registry fails.

pub mod error;
pub mod manifest;
pub mod partial;
pub mod plugin;
pub mod registry;

pub use error::{CheckError, PluginError};
pub use manifest::{PluginManifest, MANIFEST_SUFFIX, REQUIREMENTS_FILE};
pub use partial::ProtectedPartial;
pub use plugin::{
    CategoryInterface, CheckCommand, FactoryContext, FunctionFactoryPlugin, PluginBuilder,
    PluginContext, PluginDescriptor, PluginObject,
};
pub use registry::{global, init_plugin_manager, CollectOptions, PluginRegistry, PLUGIN_PATHS_ENV};
