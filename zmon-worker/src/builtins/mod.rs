//! Compiled-in plugins and the registry wiring for them.
//!
//! `collect(load_builtins = true)` scans the manifest directory shipped with
//! the crate; each manifest's `kind` resolves to a builder registered here.
//! Additional plugin trees come from `ZMON_PLUGINS` and the configuration's
//! `additional_dirs`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use zmon_worker_sdk::{CategoryInterface, PluginRegistry};

use crate::tasks::FUNCTION_CATEGORY;

pub mod http;

/// Category filter of this worker: check-function providers only.
pub fn category_filter() -> HashMap<String, CategoryInterface> {
    let mut filter = HashMap::new();
    filter.insert(
        FUNCTION_CATEGORY.to_string(),
        CategoryInterface::function_factory(),
    );
    filter
}

/// Manifest directory shipped with the crate.
pub fn builtin_manifest_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("plugins")
}

/// A registry wired with the worker's category filter, builtin builders and
/// the dependency set this binary links.
pub fn build_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new(category_filter());
    registry.register_builder("http", http::build);
    registry.provide_requirement("reqwest");
    registry.provide_requirement("serde_json");
    registry.add_builtin_dir(builtin_manifest_dir());
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use zmon_worker_sdk::CollectOptions;

    #[test]
    fn builtin_http_plugin_collects_and_activates() {
        let registry = build_registry();
        registry
            .collect(CollectOptions {
                load_builtins: true,
                ..Default::default()
            })
            .unwrap();

        assert!(registry
            .get_all_plugin_names()
            .contains(&"http".to_string()));
        let descriptor = registry
            .get_plugin_by_name("http", FUNCTION_CATEGORY)
            .expect("http plugin is under category Function");
        assert!(descriptor.is_activated);
        assert!(descriptor
            .plugin_object
            .as_function_factory()
            .is_some());
    }
}
