//! Structural diff results exported from the framework's own autodetector.
//!
//! The document is produced by running the framework's change detection
//! against a history in which every project app has no migrations, and
//! dumping the proposed migrations with their operations as Python source:
//!
//! ```json
//! {
//!   "apps_with_models": ["app"],
//!   "settings": {"AUTH_USER_MODEL": "auth.User"},
//!   "changes": {
//!     "app": [{
//!       "name": "0001_initial",
//!       "initial": true,
//!       "dependencies": [["__setting__", "AUTH_USER_MODEL"]],
//!       "imports": ["from django.db import migrations, models"],
//!       "operations": ["migrations.CreateModel(name='Person', fields=[])"]
//!     }]
//!   }
//! }
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use log::debug;
use serde::Deserialize;

use crate::{
    error::{Result, SquashError},
    loader::MigrationGraph,
    migration::{Dependency, ProposedMigration},
    parser::MigrationParser,
    resolver::ModuleResolver,
};

/// Source of the migrations that recreate the current models from nothing.
pub trait ChangeDetector {
    /// Proposed migrations per app, computed against `graph`, leaving out
    /// the apps in `exclusions`.
    fn changes(
        &self,
        graph: &MigrationGraph,
        exclusions: &[String],
    ) -> Result<IndexMap<String, Vec<ProposedMigration>>>;

    /// Labels of the apps that currently define at least one model.
    fn apps_with_models(&self) -> Vec<String>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChangesDocument {
    #[serde(default)]
    apps_with_models: Vec<String>,
    #[serde(default)]
    settings: IndexMap<String, String>,
    #[serde(default)]
    changes: IndexMap<String, Vec<ProposedEntry>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProposedEntry {
    name: String,
    #[serde(default)]
    initial: bool,
    #[serde(default)]
    dependencies: Vec<[String; 2]>,
    #[serde(default)]
    imports: Vec<String>,
    #[serde(default)]
    operations: Vec<String>,
}

/// A JSON changes document, parsed lazily against the project's modules.
#[derive(Debug)]
pub struct ChangesFile<'a> {
    path: PathBuf,
    document: ChangesDocument,
    resolver: &'a ModuleResolver,
}

impl<'a> ChangesFile<'a> {
    pub fn load(path: &Path, resolver: &'a ModuleResolver) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|error| SquashError::io(path, error))?;
        Self::from_json(path, &text, resolver)
    }

    pub fn from_json(path: impl Into<PathBuf>, text: &str, resolver: &'a ModuleResolver) -> Result<Self> {
        let path = path.into();
        let document = serde_json::from_str(text).map_err(|error| SquashError::Parse {
            path: path.clone(),
            message: error.to_string(),
        })?;
        Ok(Self {
            path,
            document,
            resolver,
        })
    }

    /// Setting values recorded alongside the diff.
    pub fn settings(&self) -> &IndexMap<String, String> {
        &self.document.settings
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn module_of(&self, app_label: &str, name: &str) -> String {
        let package = self
            .resolver
            .config()
            .migrations_module(app_label)
            .unwrap_or_else(|| format!("{app_label}.migrations"));
        format!("{package}.{name}")
    }
}

impl ChangeDetector for ChangesFile<'_> {
    fn changes(
        &self,
        graph: &MigrationGraph,
        exclusions: &[String],
    ) -> Result<IndexMap<String, Vec<ProposedMigration>>> {
        let parser = MigrationParser::new(self.resolver);
        let mut changes = IndexMap::new();
        for (app_label, entries) in &self.document.changes {
            if exclusions.contains(app_label) {
                continue;
            }
            let mut proposed = Vec::with_capacity(entries.len());
            for entry in entries {
                let module = self.module_of(app_label, &entry.name);
                let operations = parser
                    .parse_operations(&module, &entry.imports, &entry.operations)
                    .map_err(|error| SquashError::bad_migration(&self.path, error.to_string()))?;
                let dependencies: Vec<Dependency> = entry
                    .dependencies
                    .iter()
                    .map(|[first, second]| Dependency::from_pair(first, second))
                    .collect();
                for dependency in &dependencies {
                    if let Dependency::Node(key) = dependency
                        && !self.document.changes.contains_key(&key.app_label)
                        && !graph.contains(key)
                    {
                        debug!("{app_label}.{} depends on {key}, unknown to the diff", entry.name);
                    }
                }
                proposed.push(ProposedMigration {
                    app_label: app_label.clone(),
                    name: entry.name.clone(),
                    dependencies,
                    operations,
                    initial: entry.initial,
                    imports: entry.imports.clone(),
                });
            }
            changes.insert(app_label.clone(), proposed);
        }
        Ok(changes)
    }

    fn apps_with_models(&self) -> Vec<String> {
        self.document.apps_with_models.clone()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{config::Config, migration::NodeKey};

    const DOCUMENT: &str = r#"{
        "apps_with_models": ["app", "app2"],
        "settings": {"AUTH_USER_MODEL": "auth.User"},
        "changes": {
            "app": [{
                "name": "0001_initial",
                "initial": true,
                "dependencies": [["__setting__", "AUTH_USER_MODEL"]],
                "imports": ["from django.db import migrations, models"],
                "operations": [
                    "migrations.CreateModel(name='Person', fields=[('id', models.AutoField(primary_key=True))])"
                ]
            }],
            "app2": [{
                "name": "0001_initial",
                "dependencies": [["app", "0001_initial"]],
                "operations": []
            }]
        }
    }"#;

    fn resolver() -> ModuleResolver {
        ModuleResolver::new(Config {
            project_root: PathBuf::from("/nonexistent"),
            ..Config::default()
        })
    }

    #[test]
    fn test_changes_are_read() -> Result<()> {
        let resolver = resolver();
        let file = ChangesFile::from_json("changes.json", DOCUMENT, &resolver)?;
        assert_eq!(file.apps_with_models(), vec!["app", "app2"]);
        assert_eq!(file.settings()["AUTH_USER_MODEL"], "auth.User");

        let changes = file.changes(&MigrationGraph::default(), &[])?;
        let app = &changes["app"][0];
        assert!(app.initial);
        assert_eq!(
            app.dependencies,
            vec![Dependency::Setting("AUTH_USER_MODEL".to_owned())]
        );
        assert_eq!(app.operations.len(), 1);
        assert_eq!(app.operations[0].describe(), "Create model Person");
        assert_eq!(
            changes["app2"][0].dependencies,
            vec![Dependency::Node(NodeKey::new("app", "0001_initial"))]
        );
        Ok(())
    }

    #[test]
    fn test_excluded_apps_are_dropped() -> Result<()> {
        let resolver = resolver();
        let file = ChangesFile::from_json("changes.json", DOCUMENT, &resolver)?;
        let changes = file.changes(&MigrationGraph::default(), &["app".to_owned()])?;
        assert_eq!(changes.keys().collect::<Vec<_>>(), vec!["app2"]);
        Ok(())
    }

    #[test]
    fn test_invalid_document() {
        let resolver = resolver();
        let result = ChangesFile::from_json("changes.json", "{\"changes\": 1}", &resolver);
        assert!(matches!(result, Err(SquashError::Parse { .. })));
    }
}
