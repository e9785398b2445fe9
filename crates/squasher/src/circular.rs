//! Circular dependencies that keep a history from being squashed cleanly.
//!
//! Two kinds are reported: migrations on disk that depend on each other,
//! and apps whose freshly proposed migrations depend on each other. The
//! second kind is what a squash would write, since every app collapses into
//! as few nodes as its models allow.

use indexmap::IndexMap;
use petgraph::{
    algo::tarjan_scc,
    graph::{DiGraph, NodeIndex},
};
use rustc_hash::FxHashMap;

use crate::migration::{Dependency, NodeKey, ProposedMigration};

/// A proposed migration depending on a migration of another app in the
/// same cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossDependency {
    pub from: NodeKey,
    pub to: Dependency,
}

/// Apps depending on each other through their proposed migrations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppCycle {
    /// Sorted labels.
    pub apps: Vec<String>,
    pub dependencies: Vec<CrossDependency>,
}

#[derive(Debug, Default)]
struct AppGraph {
    graph: DiGraph<String, ()>,
    node_indices: FxHashMap<String, NodeIndex>,
}

impl AppGraph {
    fn add_node(&mut self, app_label: &str) -> NodeIndex {
        if let Some(&index) = self.node_indices.get(app_label) {
            return index;
        }
        let index = self.graph.add_node(app_label.to_owned());
        self.node_indices.insert(app_label.to_owned(), index);
        index
    }
}

/// App-level cycles among `changes`, ignoring swappable dependencies.
pub fn app_cycles(changes: &IndexMap<String, Vec<ProposedMigration>>) -> Vec<AppCycle> {
    let mut apps = AppGraph::default();
    for (app_label, migrations) in changes {
        let dependent = apps.add_node(app_label);
        for migration in migrations {
            for dependency in &migration.dependencies {
                let Some(target) = dependency.app_label() else {
                    continue;
                };
                if target == app_label.as_str() {
                    continue;
                }
                let target = apps.add_node(target);
                if !apps.graph.contains_edge(target, dependent) {
                    apps.graph.add_edge(target, dependent, ());
                }
            }
        }
    }

    let mut cycles: Vec<AppCycle> = tarjan_scc(&apps.graph)
        .into_iter()
        .filter(|component| component.len() > 1)
        .map(|component| {
            let mut labels: Vec<String> = component
                .into_iter()
                .map(|index| apps.graph[index].clone())
                .collect();
            labels.sort();
            let dependencies = cross_dependencies(changes, &labels);
            AppCycle {
                apps: labels,
                dependencies,
            }
        })
        .collect();
    cycles.sort_by(|a, b| a.apps.cmp(&b.apps));
    cycles
}

fn cross_dependencies(
    changes: &IndexMap<String, Vec<ProposedMigration>>,
    labels: &[String],
) -> Vec<CrossDependency> {
    let mut found = Vec::new();
    for label in labels {
        let Some(migrations) = changes.get(label) else {
            continue;
        };
        for migration in migrations {
            for dependency in &migration.dependencies {
                if let Some(target) = dependency.app_label()
                    && target != label.as_str()
                    && labels.iter().any(|other| other == target)
                {
                    found.push(CrossDependency {
                        from: NodeKey::new(label.clone(), migration.name.clone()),
                        to: dependency.clone(),
                    });
                }
            }
        }
    }
    found
}
