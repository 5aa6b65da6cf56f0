//! Plugin manifest discovery and parsing.
//!
//! A plugin is declared by a `*.worker-plugin.toml` file:
//!
//! ```toml
//! [plugin]
//! name = "http"
//! category = "Function"
//! kind = "http"          # builder key, defaults to name
//!
//! [configuration]
//! timeout = "5"
//! ```
//!
//! An optional `requirements.txt` next to the manifest lists dependency
//! names the host must provide, one per line; blank lines and `#` comments
//! are ignored.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::PluginError;

/// File name suffix that marks a plugin manifest.
pub const MANIFEST_SUFFIX: &str = ".worker-plugin.toml";

/// Name of the optional per-plugin dependency list.
pub const REQUIREMENTS_FILE: &str = "requirements.txt";

#[derive(Debug, Deserialize)]
struct ManifestFile {
    plugin: ManifestHeader,
    #[serde(default)]
    configuration: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ManifestHeader {
    name: String,
    category: String,
    kind: Option<String>,
}

/// A parsed plugin manifest, not yet validated against the category filter.
#[derive(Debug, Clone)]
pub struct PluginManifest {
    pub name: String,
    pub category: String,
    pub kind: String,
    pub configuration: HashMap<String, String>,
    /// Path of the manifest file itself
    pub path: PathBuf,
    /// Directory containing the manifest
    pub dir: PathBuf,
}

impl PluginManifest {
    pub fn parse(path: &Path) -> Result<Self, PluginError> {
        let raw = fs::read_to_string(path).map_err(|source| PluginError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: ManifestFile = toml::from_str(&raw).map_err(|e| PluginError::Manifest {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let kind = file.plugin.kind.unwrap_or_else(|| file.plugin.name.clone());
        Ok(Self {
            name: file.plugin.name,
            category: file.plugin.category,
            kind,
            configuration: file.configuration,
            path: path.to_path_buf(),
            dir,
        })
    }

    /// Dependency names from the adjacent `requirements.txt`, empty when the
    /// file does not exist.
    pub fn requirements(&self) -> Result<Vec<String>, PluginError> {
        let path = self.dir.join(REQUIREMENTS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path).map_err(|source| PluginError::Io { path, source })?;
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect())
    }
}

/// Recursively enumerate every plugin manifest below `dir`, sorted by path
/// for a deterministic activation order. A missing directory yields an empty
/// list: search paths are allowed to be sparse.
pub fn discover_manifests(dir: &Path) -> Result<Vec<PluginManifest>, PluginError> {
    let mut found = Vec::new();
    if !dir.exists() {
        return Ok(found);
    }
    let mut paths = Vec::new();
    collect_manifest_paths(dir, &mut paths)?;
    paths.sort();
    for path in paths {
        found.push(PluginManifest::parse(&path)?);
    }
    Ok(found)
}

fn collect_manifest_paths(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), PluginError> {
    let entries = fs::read_dir(dir).map_err(|source| PluginError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| PluginError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            collect_manifest_paths(&path, out)?;
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(MANIFEST_SUFFIX))
        {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_manifest(dir: &Path, file: &str, body: &str) -> PathBuf {
        let path = dir.join(file);
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn parses_manifest_with_configuration() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_manifest(
            tmp.path(),
            "http.worker-plugin.toml",
            r#"
            [plugin]
            name = "http"
            category = "Function"

            [configuration]
            timeout = "5"
            "#,
        );
        let manifest = PluginManifest::parse(&path).unwrap();
        assert_eq!(manifest.name, "http");
        assert_eq!(manifest.category, "Function");
        assert_eq!(manifest.kind, "http", "kind defaults to name");
        assert_eq!(manifest.configuration["timeout"], "5");
        assert_eq!(manifest.dir, tmp.path());
    }

    #[test]
    fn requirements_skip_comments_and_blanks() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_manifest(
            tmp.path(),
            "db.worker-plugin.toml",
            "[plugin]\nname = \"db\"\ncategory = \"Function\"\n",
        );
        fs::write(
            tmp.path().join(REQUIREMENTS_FILE),
            "# core\npostgres\n\n  mysql  \n",
        )
        .unwrap();
        let manifest = PluginManifest::parse(&path).unwrap();
        assert_eq!(manifest.requirements().unwrap(), vec!["postgres", "mysql"]);
    }

    #[test]
    fn discovery_walks_subdirectories_and_sorts() {
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("colors/germany");
        fs::create_dir_all(&sub).unwrap();
        write_manifest(
            &sub,
            "color.worker-plugin.toml",
            "[plugin]\nname = \"color_germany\"\ncategory = \"Color\"\n",
        );
        write_manifest(
            tmp.path(),
            "a.worker-plugin.toml",
            "[plugin]\nname = \"a\"\ncategory = \"Function\"\n",
        );
        fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

        let manifests = discover_manifests(tmp.path()).unwrap();
        assert_eq!(manifests.len(), 2);
        assert_eq!(manifests[0].name, "a");
        assert_eq!(manifests[1].name, "color_germany");
    }

    #[test]
    fn missing_directory_is_empty_not_error() {
        let manifests = discover_manifests(Path::new("/nonexistent/plugins")).unwrap();
        assert!(manifests.is_empty());
    }

    #[test]
    fn malformed_manifest_is_a_manifest_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_manifest(tmp.path(), "bad.worker-plugin.toml", "not toml [");
        let err = PluginManifest::parse(&path).unwrap_err();
        assert!(matches!(err, PluginError::Manifest { .. }));
    }
}
