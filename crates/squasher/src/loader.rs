//! Migration history as found on disk, and the dependency graph built from
//! it.

use std::{fs, path::PathBuf};

use indexmap::IndexMap;
use log::{debug, warn};
use petgraph::{
    Direction,
    algo::{is_cyclic_directed, tarjan_scc},
    graph::{DiGraph, NodeIndex},
};
use rustc_hash::FxHashMap;

use crate::{
    error::{Result, SquashError},
    migration::{Dependency, NodeKey, RawMigration},
    parser::MigrationParser,
    resolver::ModuleResolver,
};

/// An application that owns a migrations package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub label: String,
    /// Dotted module path of the migrations package.
    pub module: String,
    /// The migrations directory.
    pub path: PathBuf,
    /// Lives outside the project root or inside an environment.
    pub read_only: bool,
}

/// Where the squash reads migration history from.
pub trait MigrationSource {
    /// Every migration module found, keyed by identity, in load order.
    fn disk_migrations(&self) -> &IndexMap<NodeKey, RawMigration>;

    /// The graph with replaced migrations substituted by their replacement.
    fn graph(&self) -> &MigrationGraph;

    fn apps(&self) -> &IndexMap<String, AppInfo>;
}

/// Dependency graph of migrations.
///
/// Edges go from a dependency to its dependent. When a migration declares
/// `replaces`, the replaced migrations are left out and every edge that
/// touched them is carried by the replacement, which is how the framework
/// sees a history that has not been applied anywhere yet.
#[derive(Debug, Clone, Default)]
pub struct MigrationGraph {
    graph: DiGraph<NodeKey, ()>,
    node_indices: FxHashMap<NodeKey, NodeIndex>,
}

impl MigrationGraph {
    pub fn build<'a>(migrations: impl IntoIterator<Item = &'a RawMigration>) -> Self {
        let migrations: Vec<&RawMigration> = migrations.into_iter().collect();

        let mut replaced_by: FxHashMap<&NodeKey, &NodeKey> = FxHashMap::default();
        for migration in &migrations {
            for replaced in &migration.replaces {
                if replaced != &migration.key {
                    replaced_by.insert(replaced, &migration.key);
                }
            }
        }
        let mut graph = Self::default();
        for migration in &migrations {
            if replaced_by.contains_key(&migration.key) {
                debug!(
                    "{} is replaced by {}",
                    migration.key,
                    canonical(&replaced_by, &migration.key)
                );
                continue;
            }
            graph.add_node(migration.key.clone());
        }

        // Dependencies inside an app first, so `__first__` and `__latest__`
        // markers see each app's own ordering.
        for internal in [true, false] {
            for migration in &migrations {
                let dependent = canonical(&replaced_by, &migration.key);
                for dependency in &migration.dependencies {
                    let same_app = dependency.app_label() == Some(migration.key.app_label.as_str());
                    if same_app != internal {
                        continue;
                    }
                    let Some(target) = graph.resolve(dependency) else {
                        debug!("{}: ignoring dependency {dependency}", migration.key);
                        continue;
                    };
                    let target = canonical(&replaced_by, &target);
                    if target != dependent {
                        graph.add_edge(&target, &dependent);
                    }
                }
            }
        }
        graph
    }

    fn add_node(&mut self, key: NodeKey) {
        if !self.node_indices.contains_key(&key) {
            let index = self.graph.add_node(key.clone());
            self.node_indices.insert(key, index);
        }
    }

    /// `dependent` depends on `dependency`.
    fn add_edge(&mut self, dependency: &NodeKey, dependent: &NodeKey) {
        if let (Some(&from), Some(&to)) = (
            self.node_indices.get(dependency),
            self.node_indices.get(dependent),
        ) && !self.graph.contains_edge(from, to)
        {
            self.graph.add_edge(from, to, ());
        }
    }

    fn resolve(&self, dependency: &Dependency) -> Option<NodeKey> {
        match dependency {
            Dependency::Node(key) => Some(key.clone()),
            Dependency::First(app_label) => self.root_nodes(app_label).into_iter().next(),
            Dependency::Latest(app_label) => self.leaf_nodes(app_label).into_iter().next(),
            Dependency::Setting(_) => None,
        }
    }

    pub fn contains(&self, key: &NodeKey) -> bool {
        self.node_indices.contains_key(key)
    }

    /// Every node, in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeKey> {
        self.graph.node_indices().map(|index| &self.graph[index])
    }

    /// Nodes of one app, sorted.
    pub fn app_nodes(&self, app_label: &str) -> Vec<NodeKey> {
        let mut nodes: Vec<NodeKey> = self
            .nodes()
            .filter(|key| key.app_label == app_label)
            .cloned()
            .collect();
        nodes.sort();
        nodes
    }

    /// Nodes of `app_label` with no dependency inside the app, sorted.
    pub fn root_nodes(&self, app_label: &str) -> Vec<NodeKey> {
        self.app_boundary(app_label, Direction::Incoming)
    }

    /// Nodes of `app_label` nothing else in the app depends on, sorted.
    pub fn leaf_nodes(&self, app_label: &str) -> Vec<NodeKey> {
        self.app_boundary(app_label, Direction::Outgoing)
    }

    fn app_boundary(&self, app_label: &str, direction: Direction) -> Vec<NodeKey> {
        let mut nodes: Vec<NodeKey> = self
            .graph
            .node_indices()
            .filter(|&index| self.graph[index].app_label == app_label)
            .filter(|&index| {
                !self
                    .graph
                    .neighbors_directed(index, direction)
                    .any(|neighbor| self.graph[neighbor].app_label == app_label)
            })
            .map(|index| self.graph[index].clone())
            .collect();
        nodes.sort();
        nodes
    }

    /// Direct dependencies of `key`, sorted.
    pub fn dependencies(&self, key: &NodeKey) -> Vec<NodeKey> {
        let Some(&index) = self.node_indices.get(key) else {
            return Vec::new();
        };
        let mut dependencies: Vec<NodeKey> = self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .map(|neighbor| self.graph[neighbor].clone())
            .collect();
        dependencies.sort();
        dependencies
    }

    pub fn has_cycles(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    /// Groups of migrations that depend on each other, each sorted.
    pub fn cycles(&self) -> Vec<Vec<NodeKey>> {
        let mut cycles: Vec<Vec<NodeKey>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| component.len() > 1)
            .map(|component| {
                let mut keys: Vec<NodeKey> =
                    component.into_iter().map(|index| self.graph[index].clone()).collect();
                keys.sort();
                keys
            })
            .collect();
        cycles.sort();
        cycles
    }
}

/// The node standing in for `key`, following chains such as a squash of an
/// earlier squash.
fn canonical<'k>(replaced_by: &FxHashMap<&'k NodeKey, &'k NodeKey>, key: &'k NodeKey) -> NodeKey {
    let mut current = key;
    for _ in 0..=replaced_by.len() {
        match replaced_by.get(current) {
            Some(next) => current = *next,
            None => break,
        }
    }
    current.clone()
}

/// History read from every configured app's migrations directory.
#[derive(Debug, Default)]
pub struct DiskLoader {
    apps: IndexMap<String, AppInfo>,
    disk_migrations: IndexMap<NodeKey, RawMigration>,
    graph: MigrationGraph,
}

impl DiskLoader {
    /// Scans and parses the migrations of every app in the resolver's
    /// configuration.
    pub fn load(resolver: &ModuleResolver) -> Result<Self> {
        let parser = MigrationParser::new(resolver);
        let config = resolver.config();

        let mut apps = IndexMap::new();
        let mut migrations = Vec::new();
        for (label, app) in &config.apps {
            let Some(module) = config.migrations_module(label) else {
                return Err(SquashError::bad_migration(
                    &app.migrations,
                    format!(
                        "cannot derive the migrations module of app `{label}`, set `module` for it"
                    ),
                ));
            };
            let read_only = !resolver.is_project_path(&app.migrations);
            for (name, path) in migration_files(&app.migrations)? {
                let key = NodeKey::new(label.as_str(), name.as_str());
                migrations.push(parser.parse_file(
                    key,
                    &format!("{module}.{name}"),
                    &path,
                    read_only,
                )?);
            }
            apps.insert(
                label.clone(),
                AppInfo {
                    label: label.clone(),
                    module,
                    path: app.migrations.clone(),
                    read_only,
                },
            );
        }

        let loader = Self::from_migrations(apps, migrations);
        debug!(
            "Loaded {} migrations of {} apps",
            loader.disk_migrations.len(),
            loader.apps.len()
        );
        if loader.graph.has_cycles() {
            warn!("The migration graph contains a dependency cycle");
        }
        Ok(loader)
    }

    pub fn from_migrations(
        apps: IndexMap<String, AppInfo>,
        migrations: impl IntoIterator<Item = RawMigration>,
    ) -> Self {
        let disk_migrations: IndexMap<NodeKey, RawMigration> = migrations
            .into_iter()
            .map(|migration| (migration.key.clone(), migration))
            .collect();
        let graph = MigrationGraph::build(disk_migrations.values());
        Self {
            apps,
            disk_migrations,
            graph,
        }
    }
}

impl MigrationSource for DiskLoader {
    fn disk_migrations(&self) -> &IndexMap<NodeKey, RawMigration> {
        &self.disk_migrations
    }

    fn graph(&self) -> &MigrationGraph {
        &self.graph
    }

    fn apps(&self) -> &IndexMap<String, AppInfo> {
        &self.apps
    }
}

/// Module names and paths of the migrations in `directory`, sorted.
///
/// A missing directory means the app has no migrations yet.
fn migration_files(directory: &std::path::Path) -> Result<Vec<(String, PathBuf)>> {
    if !directory.is_dir() {
        debug!("{} does not exist, no migrations", directory.display());
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(directory).map_err(|error| SquashError::io(directory, error))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|error| SquashError::io(directory, error))?.path();
        if !path.is_file() || path.extension().is_none_or(|extension| extension != "py") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        if stem.starts_with('_') || stem.starts_with('~') {
            continue;
        }
        files.push((stem.to_owned(), path.clone()));
    }
    files.sort();
    Ok(files)
}

/// History seen by the structural diff: project apps have none, so the diff
/// proposes recreating every model from scratch. Read-only apps keep theirs.
#[derive(Debug)]
pub struct SquashMigrationLoader {
    inner: DiskLoader,
}

impl SquashMigrationLoader {
    pub fn new(source: &dyn MigrationSource) -> Self {
        let migrations = source
            .disk_migrations()
            .values()
            .filter(|migration| migration.read_only)
            .cloned();
        Self {
            inner: DiskLoader::from_migrations(source.apps().clone(), migrations),
        }
    }
}

impl MigrationSource for SquashMigrationLoader {
    fn disk_migrations(&self) -> &IndexMap<NodeKey, RawMigration> {
        self.inner.disk_migrations()
    }

    fn graph(&self) -> &MigrationGraph {
        self.inner.graph()
    }

    fn apps(&self) -> &IndexMap<String, AppInfo> {
        self.inner.apps()
    }
}
