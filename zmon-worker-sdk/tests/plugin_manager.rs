//! Multi-category discovery over an on-disk plugin tree, mirroring how a
//! host wires the registry: several categories in the filter, builders per
//! kind, and plugins that resolve sibling resources from their own
//! directory.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use zmon_worker_sdk::{
    CategoryInterface, CollectOptions, PluginContext, PluginError, PluginObject, PluginRegistry,
};

struct ColorPlugin {
    country: Mutex<String>,
    fashion_sites: Mutex<Vec<String>>,
}

impl ColorPlugin {
    fn fashion_sites(&self) -> Vec<String> {
        self.fashion_sites.lock().unwrap().clone()
    }
}

impl PluginObject for ColorPlugin {
    fn configure(&self, conf: &HashMap<String, String>) -> Result<(), PluginError> {
        if let Some(country) = conf.get("country") {
            *self.country.lock().unwrap() = country.clone();
        }
        if let Some(sites) = conf.get("fashion_sites") {
            *self.fashion_sites.lock().unwrap() =
                sites.split_whitespace().map(str::to_string).collect();
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn build_color(_ctx: &PluginContext) -> Result<Arc<dyn PluginObject>, PluginError> {
    Ok(Arc::new(ColorPlugin {
        country: Mutex::new(String::new()),
        fashion_sites: Mutex::new(Vec::new()),
    }))
}

/// A plugin that loads an engine definition shipped next to its manifest,
/// the way a plugin package bundles sub-modules beside itself.
struct TemperaturePlugin {
    power_unit: String,
}

impl PluginObject for TemperaturePlugin {
    fn configure(&self, _conf: &HashMap<String, String>) -> Result<(), PluginError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn build_temperature(ctx: &PluginContext) -> Result<Arc<dyn PluginObject>, PluginError> {
    let engine = ctx.plugin_dir.join("engine.toml");
    let raw = fs::read_to_string(&engine).map_err(|source| PluginError::Io {
        path: engine,
        source,
    })?;
    let parsed: toml::Value = raw.parse().map_err(|e| PluginError::Manifest {
        path: ctx.plugin_dir.join("engine.toml"),
        message: format!("{e}"),
    })?;
    Ok(Arc::new(TemperaturePlugin {
        power_unit: parsed["engine"]["power_unit"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
    }))
}

fn category_filter() -> HashMap<String, CategoryInterface> {
    let mut filter = HashMap::new();
    filter.insert(
        "Color".to_string(),
        CategoryInterface::new(|obj| obj.as_any().downcast_ref::<ColorPlugin>().is_some()),
    );
    filter.insert(
        "Temperature".to_string(),
        CategoryInterface::new(|obj| obj.as_any().downcast_ref::<TemperaturePlugin>().is_some()),
    );
    filter
}

fn write(path: &Path, body: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, body).unwrap();
}

fn populate_plugin_tree(root: &Path) {
    write(
        &root.join("colors/germany/color.worker-plugin.toml"),
        r#"
        [plugin]
        name = "color_germany"
        category = "Color"
        kind = "color"

        [configuration]
        country = "germany"
        fashion_sites = "www.big_fashion_site.de www.other_fashion_site.de"
        "#,
    );
    write(
        &root.join("colors/spain/color.worker-plugin.toml"),
        r#"
        [plugin]
        name = "color_spain"
        category = "Color"
        kind = "color"

        [configuration]
        country = "spain"
        "#,
    );
    write(
        &root.join("temperature/fridge.worker-plugin.toml"),
        r#"
        [plugin]
        name = "temperature_fridge"
        category = "Temperature"
        kind = "temperature"
        "#,
    );
    write(
        &root.join("temperature/engine.toml"),
        "[engine]\npower_unit = \"Watts\"\n",
    );
}

fn collected_registry(root: &Path, global_config: HashMap<String, String>) -> PluginRegistry {
    let mut registry = PluginRegistry::new(category_filter());
    registry.register_builder("color", build_color);
    registry.register_builder("temperature", build_temperature);
    registry
        .collect(CollectOptions {
            additional_dirs: vec![root.to_path_buf()],
            global_config,
            ..Default::default()
        })
        .unwrap();
    registry
}

#[test]
fn loads_plugins_across_categories() {
    let tmp = tempfile::tempdir().unwrap();
    populate_plugin_tree(tmp.path());
    let registry = collected_registry(tmp.path(), HashMap::new());

    assert_eq!(
        registry.get_all_plugin_names(),
        vec!["color_germany", "color_spain", "temperature_fridge"]
    );
    assert_eq!(registry.get_all_categories(), vec!["Color", "Temperature"]);
    assert_eq!(
        registry.get_loaded_plugins_categories(),
        vec!["Color", "Temperature"]
    );

    let color_ger = registry.get_plugin_by_name("color_germany", "Color").unwrap();
    let color_ger_obj = registry
        .get_plugin_obj_by_name("color_germany", "Color")
        .unwrap();
    assert!(Arc::ptr_eq(&color_ger.plugin_object, &color_ger_obj));
    assert!(color_ger.is_activated);

    let color = color_ger_obj.as_any().downcast_ref::<ColorPlugin>().unwrap();
    assert_eq!(
        color.fashion_sites(),
        vec!["www.big_fashion_site.de", "www.other_fashion_site.de"]
    );

    let all_colors = registry.get_plugin_objs_of_category("Color");
    assert_eq!(all_colors.len(), 2);
}

#[test]
fn sibling_resources_resolve_from_the_plugin_directory() {
    let tmp = tempfile::tempdir().unwrap();
    populate_plugin_tree(tmp.path());
    let registry = collected_registry(tmp.path(), HashMap::new());

    let fridge = registry
        .get_plugin_obj_by_name("temperature_fridge", "Temperature")
        .unwrap();
    let fridge = fridge.as_any().downcast_ref::<TemperaturePlugin>().unwrap();
    assert_eq!(fridge.power_unit, "Watts");
}

#[test]
fn global_config_takes_precedence_over_local_config() {
    let tmp = tempfile::tempdir().unwrap();
    populate_plugin_tree(tmp.path());
    let global_config = HashMap::from([
        (
            "plugin.color_germany.fashion_sites".to_string(),
            "superfashion.de hypefashion.de".to_string(),
        ),
        (
            "plugin.other_plugin.otherkey".to_string(),
            "this will not reach color_germany".to_string(),
        ),
    ]);
    let registry = collected_registry(tmp.path(), global_config);

    let color = registry
        .get_plugin_obj_by_name("color_germany", "Color")
        .unwrap();
    let color = color.as_any().downcast_ref::<ColorPlugin>().unwrap();
    assert_eq!(color.fashion_sites(), vec!["superfashion.de", "hypefashion.de"]);

    // color_spain keeps its local configuration untouched
    let spain = registry
        .get_plugin_obj_by_name("color_spain", "Color")
        .unwrap();
    let spain = spain.as_any().downcast_ref::<ColorPlugin>().unwrap();
    assert!(spain.fashion_sites().is_empty());
}
