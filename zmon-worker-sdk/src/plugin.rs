//! # Plugin Capability Model
//!
//! This module defines what a plugin *is* from the registry's point of view:
//! an opaque, shared object that can be configured once at activation time
//! and exposes zero or more capability surfaces.
//!
//! ## Categories as capability sets
//!
//! Plugins are grouped by category, and each category is a contract: a set
//! of operations an object must support to be registered under it. The
//! registry never type-checks by nominal type: a [`CategoryInterface`]
//! carries a capability predicate, and any object the predicate accepts
//! belongs to the category.
//!
//! The built-in category is **Function**: a plugin that manufactures check
//! commands. Its capability surface is [`FunctionFactoryPlugin`], reachable
//! through [`PluginObject::as_function_factory`]. Hosts can define further
//! categories by pairing their own capability trait with a predicate that
//! downcasts through [`PluginObject::as_any`].
//!
//! ## Instantiation
//!
//! Rust has no runtime import machinery, so a manifest on disk is bound to
//! compiled-in code through a [`PluginBuilder`] registered under the
//! manifest's `kind`. The builder receives a [`PluginContext`] with the
//! manifest's directory, so a plugin can resolve sibling resources shipped
//! next to its manifest.

use std::any::Any;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{CheckError, PluginError};

/// Creation context handed to [`FunctionFactoryPlugin::create`].
///
/// Carries the check/entity metadata the command is being built for. Fields
/// are dynamically typed because entities are free-form JSON documents.
#[derive(Debug, Clone, Default)]
pub struct FactoryContext {
    /// Check definition id, when the command is built for a concrete check
    pub check_id: Option<i64>,
    /// The entity the check runs against
    pub entity: Value,
    /// Additional host-supplied context values
    pub extras: Map<String, Value>,
}

/// A callable check command, the unit of work the Function category
/// manufactures.
///
/// Arguments mirror the task payload convention: a positional list plus a
/// named-argument map, both dynamically typed.
#[async_trait::async_trait]
pub trait CheckCommand: Send + Sync {
    async fn call(&self, args: &[Value], kwargs: &Map<String, Value>)
        -> Result<Value, CheckError>;
}

/// The base surface every plugin object exposes to the registry.
///
/// `configure` is invoked exactly once during collection, after the
/// manifest and global configuration have been merged; implementations use
/// interior mutability since objects are shared behind `Arc` afterwards.
pub trait PluginObject: Send + Sync + 'static {
    /// Apply the resolved configuration. Called once, before activation.
    fn configure(&self, conf: &HashMap<String, String>) -> Result<(), PluginError>;

    /// Downcast hook for host-defined capability predicates.
    fn as_any(&self) -> &dyn Any;

    /// Capability accessor for the built-in Function category.
    fn as_function_factory(&self) -> Option<&dyn FunctionFactoryPlugin> {
        None
    }
}

/// Capability surface of the built-in **Function** category: manufacture a
/// check command for a creation context.
pub trait FunctionFactoryPlugin: PluginObject {
    fn create(&self, factory_ctx: &FactoryContext) -> Box<dyn CheckCommand>;
}

/// A category contract: a name-independent predicate deciding whether an
/// object carries the category's capabilities.
#[derive(Clone, Copy)]
pub struct CategoryInterface {
    satisfies: fn(&dyn PluginObject) -> bool,
}

impl CategoryInterface {
    pub fn new(satisfies: fn(&dyn PluginObject) -> bool) -> Self {
        Self { satisfies }
    }

    /// The built-in Function category contract.
    pub fn function_factory() -> Self {
        Self::new(|obj| obj.as_function_factory().is_some())
    }

    pub fn satisfied_by(&self, obj: &dyn PluginObject) -> bool {
        (self.satisfies)(obj)
    }
}

impl std::fmt::Debug for CategoryInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CategoryInterface").finish_non_exhaustive()
    }
}

/// Context handed to a [`PluginBuilder`] when a manifest is instantiated.
#[derive(Debug, Clone)]
pub struct PluginContext {
    /// Plugin name from the manifest
    pub name: String,
    /// Directory containing the manifest; sibling resources resolve from here
    pub plugin_dir: PathBuf,
}

/// Constructor binding a manifest `kind` to compiled-in plugin code.
pub type PluginBuilder = fn(&PluginContext) -> Result<Arc<dyn PluginObject>, PluginError>;

/// A discovered, validated and activated plugin as stored in the registry.
///
/// `(name, category)` is unique across the registry. `plugin_object` is the
/// shared handle lookups hand out; object identity is stable for the
/// lifetime of the collection.
pub struct PluginDescriptor {
    pub name: String,
    pub category: String,
    pub is_activated: bool,
    pub plugin_object: Arc<dyn PluginObject>,
    pub config: HashMap<String, String>,
}

impl std::fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("is_activated", &self.is_activated)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
