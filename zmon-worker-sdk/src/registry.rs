//! # Plugin Registry Module
//!
//! One-shot discovery, validation and activation of plugin objects,
//! organised by category and parameterised by the category filter the host
//! supplies at startup.
//!
//! ## Overview
//!
//! The registry walks a list of search paths in a fixed order (built-in
//! locations, the colon-separated `ZMON_PLUGINS` environment variable, then
//! any additional directories) and for every manifest found:
//!
//! 1. Skips it silently when its category is outside the filter.
//! 2. Verifies the adjacent `requirements.txt` against the host's provided
//!    dependency set; a failure enumerates **every** missing name.
//! 3. Instantiates the plugin through the builder registered for the
//!    manifest's `kind` and checks it against the category's capability
//!    interface.
//! 4. Resolves configuration: the manifest's `[configuration]` table is the
//!    base, `plugin.<name>.<key>` entries from the host's global
//!    configuration override it, keys addressed to other plugins are
//!    ignored.
//! 5. Calls `configure` on the object and marks it activated.
//!
//! Collection runs exactly once per registry: a second `collect` call fails
//! with [`PluginError::AlreadyCollected`]. All collection errors are fatal
//! and carry the offending plugin's name.
//!
//! ## Process-wide instance
//!
//! The worker process uses a single registry initialised once via
//! [`init_plugin_manager`]; tests construct throwaway instances directly.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use crate::error::PluginError;
use crate::manifest::{self, PluginManifest};
use crate::plugin::{
    CategoryInterface, PluginBuilder, PluginContext, PluginDescriptor, PluginObject,
};

/// Environment variable holding colon-separated plugin search paths.
pub const PLUGIN_PATHS_ENV: &str = "ZMON_PLUGINS";

/// Options for a collection pass.
#[derive(Debug, Clone, Default)]
pub struct CollectOptions {
    /// Scan the registry's built-in manifest locations
    pub load_builtins: bool,
    /// Scan the paths named by `ZMON_PLUGINS`
    pub load_env: bool,
    /// Extra directories scanned after builtins and the environment
    pub additional_dirs: Vec<PathBuf>,
    /// Host configuration; `plugin.<name>.<key>` entries override manifests
    pub global_config: HashMap<String, String>,
}

/// Category-filtered plugin registry.
pub struct PluginRegistry {
    categories: HashMap<String, CategoryInterface>,
    builders: HashMap<String, PluginBuilder>,
    provided: HashSet<String>,
    builtin_dirs: Vec<PathBuf>,
    collected: AtomicBool,
    plugins: DashMap<(String, String), Arc<PluginDescriptor>>,
}

impl PluginRegistry {
    /// Create a registry with the host's category filter. Only manifests
    /// whose category appears here are ever instantiated.
    pub fn new(category_filter: HashMap<String, CategoryInterface>) -> Self {
        Self {
            categories: category_filter,
            builders: HashMap::new(),
            provided: HashSet::new(),
            builtin_dirs: Vec::new(),
            collected: AtomicBool::new(false),
            plugins: DashMap::new(),
        }
    }

    /// Bind a manifest `kind` to a compiled-in constructor.
    pub fn register_builder(&mut self, kind: impl Into<String>, builder: PluginBuilder) {
        self.builders.insert(kind.into(), builder);
    }

    /// Declare a dependency name the host satisfies; `requirements.txt`
    /// entries are verified against this set.
    pub fn provide_requirement(&mut self, name: impl Into<String>) {
        self.provided.insert(name.into());
    }

    /// Add a built-in manifest location scanned when
    /// [`CollectOptions::load_builtins`] is set.
    pub fn add_builtin_dir(&mut self, dir: impl Into<PathBuf>) {
        self.builtin_dirs.push(dir.into());
    }

    /// Run the one-shot collection pass. The second invocation on the same
    /// registry fails with [`PluginError::AlreadyCollected`].
    pub fn collect(&self, opts: CollectOptions) -> Result<(), PluginError> {
        if self.collected.swap(true, Ordering::SeqCst) {
            return Err(PluginError::AlreadyCollected);
        }

        let mut dirs: Vec<PathBuf> = Vec::new();
        if opts.load_builtins {
            dirs.extend(self.builtin_dirs.iter().cloned());
        }
        if opts.load_env {
            if let Ok(paths) = env::var(PLUGIN_PATHS_ENV) {
                dirs.extend(
                    paths
                        .split(':')
                        .filter(|p| !p.is_empty())
                        .map(PathBuf::from),
                );
            }
        }
        dirs.extend(opts.additional_dirs.iter().cloned());

        for dir in &dirs {
            for manifest in manifest::discover_manifests(dir)? {
                self.activate(manifest, &opts.global_config)?;
            }
        }

        tracing::info!(
            plugins = self.plugins.len(),
            scanned_dirs = dirs.len(),
            "plugin collection finished"
        );
        Ok(())
    }

    fn activate(
        &self,
        manifest: PluginManifest,
        global_config: &HashMap<String, String>,
    ) -> Result<(), PluginError> {
        let Some(interface) = self.categories.get(&manifest.category) else {
            tracing::debug!(
                plugin = %manifest.name,
                category = %manifest.category,
                "category outside filter, skipping"
            );
            return Ok(());
        };

        // Requirements are checked before any code from the plugin runs so
        // the error can enumerate the full missing set.
        let missing: Vec<String> = manifest
            .requirements()?
            .into_iter()
            .filter(|req| !self.provided.contains(req))
            .collect();
        if !missing.is_empty() {
            return Err(PluginError::UnsatisfiedRequirements {
                plugin: manifest.name,
                missing,
            });
        }

        let builder =
            self.builders
                .get(&manifest.kind)
                .copied()
                .ok_or_else(|| PluginError::UnknownKind {
                    plugin: manifest.name.clone(),
                    kind: manifest.kind.clone(),
                })?;
        let ctx = PluginContext {
            name: manifest.name.clone(),
            plugin_dir: manifest.dir.clone(),
        };
        let plugin_object = builder(&ctx)?;

        if !interface.satisfied_by(plugin_object.as_ref()) {
            return Err(PluginError::InterfaceMismatch {
                plugin: manifest.name,
                category: manifest.category,
            });
        }

        let key = (manifest.name.clone(), manifest.category.clone());
        if self.plugins.contains_key(&key) {
            return Err(PluginError::DuplicatePlugin {
                name: manifest.name,
                category: manifest.category,
            });
        }

        // Manifest [configuration] is the base; matching global keys win.
        let mut config = manifest.configuration.clone();
        let prefix = format!("plugin.{}.", manifest.name);
        for (k, v) in global_config {
            if let Some(conf_key) = k.strip_prefix(&prefix) {
                config.insert(conf_key.to_string(), v.clone());
            }
        }

        plugin_object
            .configure(&config)
            .map_err(|source| PluginError::Configure {
                plugin: manifest.name.clone(),
                source: Box::new(source),
            })?;

        tracing::info!(plugin = %manifest.name, category = %manifest.category, "plugin activated");
        self.plugins.insert(
            key,
            Arc::new(PluginDescriptor {
                name: manifest.name,
                category: manifest.category,
                is_activated: true,
                plugin_object,
                config,
            }),
        );
        Ok(())
    }

    /// Names of every activated plugin, sorted, de-duplicated across
    /// categories.
    pub fn get_all_plugin_names(&self) -> Vec<String> {
        let names: BTreeSet<String> = self
            .plugins
            .iter()
            .map(|entry| entry.key().0.clone())
            .collect();
        names.into_iter().collect()
    }

    /// Every category the filter admits, loaded or not.
    pub fn get_all_categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = self.categories.keys().cloned().collect();
        categories.sort();
        categories
    }

    /// Categories that have at least one activated plugin.
    pub fn get_loaded_plugins_categories(&self) -> Vec<String> {
        let categories: BTreeSet<String> = self
            .plugins
            .iter()
            .map(|entry| entry.key().1.clone())
            .collect();
        categories.into_iter().collect()
    }

    pub fn get_plugin_by_name(&self, name: &str, category: &str) -> Option<Arc<PluginDescriptor>> {
        self.plugins
            .get(&(name.to_string(), category.to_string()))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn get_plugin_obj_by_name(
        &self,
        name: &str,
        category: &str,
    ) -> Option<Arc<dyn PluginObject>> {
        self.get_plugin_by_name(name, category)
            .map(|descriptor| Arc::clone(&descriptor.plugin_object))
    }

    pub fn get_plugin_objs_of_category(&self, category: &str) -> Vec<Arc<dyn PluginObject>> {
        let mut objs: Vec<(String, Arc<dyn PluginObject>)> = self
            .plugins
            .iter()
            .filter(|entry| entry.key().1 == category)
            .map(|entry| {
                (
                    entry.key().0.clone(),
                    Arc::clone(&entry.value().plugin_object),
                )
            })
            .collect();
        objs.sort_by(|a, b| a.0.cmp(&b.0));
        objs.into_iter().map(|(_, obj)| obj).collect()
    }
}

static GLOBAL: OnceLock<PluginRegistry> = OnceLock::new();

/// Install the process-wide registry. Idempotent: a second call returns the
/// registry installed first and drops the argument.
pub fn init_plugin_manager(registry: PluginRegistry) -> &'static PluginRegistry {
    GLOBAL.get_or_init(|| registry)
}

/// The process-wide registry, when [`init_plugin_manager`] has run.
pub fn global() -> Option<&'static PluginRegistry> {
    GLOBAL.get()
}
