//! Turns a migration history into a squashed one.
//!
//! The structural diff proposes migrations that recreate every model from
//! nothing. Those proposals are renamed to continue each app's numbering,
//! marked as replacing the whole current history, and given the operations
//! the diff cannot infer: non-elidable raw Python and raw SQL, lifted out of
//! the migrations they supersede. A separate pass cleans up the remains of
//! earlier squashes.

use std::rc::Rc;

use chrono::{
    DateTime, Local,
    format::{Item, StrftimeItems},
};
use indexmap::{IndexMap, IndexSet, map::Entry};
use log::{debug, info, warn};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    changes_file::ChangeDetector,
    config::DEFAULT_MIGRATION_NAME,
    error::{Result, SquashError},
    loader::MigrationSource,
    migration::{
        Dependency, HistoryNode, IntoHistoryNode, NodeKey, NodeKind, ProposedMigration,
        RawMigration, SquashFlags,
    },
    operations::{Operation, lift_custom_operations, lift_extensions},
    unique_names::{KeepName, RenamePolicy, UniqueVariableName},
};

/// Nodes to write, per app, in writing order.
pub type SquashedHistory = IndexMap<String, Vec<HistoryNode>>;

/// Where a dependency of a new node points while names are still moving.
#[derive(Debug, Clone)]
enum Link {
    /// Another node generated in this run, by position.
    New(usize),
    /// A migration that stays on disk.
    Existing(NodeKey),
    /// Written as declared.
    Literal(Dependency),
}

/// A new node before its final name is known.
#[derive(Debug)]
struct Draft {
    key: NodeKey,
    declared: Vec<Dependency>,
    links: Vec<Link>,
    operations: Vec<Operation>,
    initial: bool,
    replaces: Vec<NodeKey>,
    extra_imports: Vec<String>,
}

impl Draft {
    fn new(proposed: ProposedMigration) -> Self {
        Self {
            key: NodeKey::new(proposed.app_label, proposed.name),
            declared: proposed.dependencies,
            links: Vec::new(),
            operations: proposed.operations,
            initial: proposed.initial,
            replaces: Vec::new(),
            extra_imports: Vec::new(),
        }
    }
}

/// Generated nodes of one run, addressable by position so dependencies
/// survive renaming.
#[derive(Debug, Default)]
struct Arena {
    drafts: Vec<Draft>,
    by_app: IndexMap<String, Vec<usize>>,
    /// Every node seen so far, generated or existing, in the order it was
    /// first seen.
    seen: IndexMap<NodeKey, Link>,
}

#[derive(Debug)]
pub struct SquashAutodetector {
    /// Values of settings named by swappable dependencies.
    settings: IndexMap<String, String>,
    policy: Rc<dyn RenamePolicy>,
    timestamp: DateTime<Local>,
}

impl SquashAutodetector {
    pub fn new(settings: IndexMap<String, String>) -> Self {
        Self {
            settings,
            policy: Rc::new(KeepName),
            timestamp: Local::now(),
        }
    }

    /// Policy applied to the names of relocated functions.
    #[must_use]
    pub fn with_policy(mut self, policy: Rc<dyn RenamePolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Time used to expand a timestamp format in the squashed name.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Local>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Squashes the history of every app outside `ignore_apps`.
    ///
    /// `real` is the history on disk; `squash` is the view handed to the
    /// structural diff, in which project apps have no history.
    pub fn squash(
        &self,
        real: &dyn MigrationSource,
        squash: &dyn MigrationSource,
        detector: &dyn ChangeDetector,
        ignore_apps: &[String],
        migration_name: Option<&str>,
    ) -> Result<SquashedHistory> {
        let edits = self.delete_old_squashed(real, ignore_apps)?;

        let mut changes = detector.changes(squash.graph(), ignore_apps)?;
        changes.retain(|app_label, _| !ignore_apps.contains(app_label));
        create_deleted_models_migrations(real, detector, ignore_apps, &mut changes);

        let mut arena = Arena::default();
        for (app_label, proposals) in changes {
            for proposed in proposals {
                let draft = Draft::new(proposed);
                let index = arena.drafts.len();
                arena.seen.insert(draft.key.clone(), Link::New(index));
                arena.by_app.entry(app_label.clone()).or_default().push(index);
                arena.drafts.push(draft);
            }
        }

        self.link_dependencies(real, ignore_apps, &mut arena)?;
        self.rename_migrations(real, &mut arena, migration_name)?;
        replace_current_migrations(real, &mut arena);
        self.add_non_elidables(real, &mut arena)?;

        let mut squashed = finish(arena);
        for (app_label, nodes) in edits {
            squashed.entry(app_label).or_default().extend(nodes);
        }

        let replaced: usize = squashed
            .values()
            .flatten()
            .map(|node| node.replaces.len())
            .sum();
        if replaced == 0 {
            return Err(SquashError::NothingToSquash);
        }
        info!(
            "Squashing {replaced} replaced migrations into {} nodes",
            squashed.values().map(Vec::len).sum::<usize>()
        );
        Ok(squashed)
    }

    /// Finds migrations superseded by an earlier squash and the edits that
    /// retire them: the superseded files are removed, dependencies on them
    /// are dropped and the squashing migrations stop declaring `replaces`.
    ///
    /// A file touched for several reasons yields one node carrying every
    /// flag.
    pub fn delete_old_squashed(
        &self,
        loader: &dyn MigrationSource,
        ignore_apps: &[String],
    ) -> Result<SquashedHistory> {
        let project_apps: FxHashSet<&str> = loader
            .apps()
            .values()
            .filter(|app| !app.read_only && !ignore_apps.contains(&app.label))
            .map(|app| app.label.as_str())
            .collect();
        let project_migrations: Vec<&RawMigration> = loader
            .graph()
            .nodes()
            .filter_map(|key| loader.disk_migrations().get(key))
            .filter(|migration| project_apps.contains(migration.key.app_label.as_str()))
            .collect();
        let replacing: Vec<&RawMigration> = project_migrations
            .iter()
            .copied()
            .filter(|migration| !migration.replaces.is_empty())
            .collect();

        let mut edits: IndexMap<String, IndexMap<NodeKey, HistoryNode>> = IndexMap::new();
        let mut removed: FxHashSet<&NodeKey> = FxHashSet::default();
        for key in replacing.iter().flat_map(|migration| &migration.replaces) {
            if ignore_apps.contains(&key.app_label) {
                continue;
            }
            removed.insert(key);
            match loader.disk_migrations().get(key) {
                Some(migration) => edit(&mut edits, migration, |_, flags| flags.removed = true)?,
                None => debug!("{key} is already gone"),
            }
        }

        for migration in &project_migrations {
            let kept: Vec<Dependency> = migration
                .dependencies
                .iter()
                .filter(|dependency| {
                    !matches!(dependency, Dependency::Node(key) if removed.contains(key))
                })
                .cloned()
                .collect();
            if kept.len() == migration.dependencies.len() {
                continue;
            }
            edit(&mut edits, migration, |node, flags| {
                node.dependencies = kept;
                flags.dependencies_changed = true;
            })?;
        }

        for migration in replacing {
            edit(&mut edits, migration, |node, flags| {
                node.replaces.clear();
                flags.replaces_cleared = true;
            })?;
        }

        Ok(edits
            .into_iter()
            .map(|(app_label, nodes)| (app_label, nodes.into_values().collect()))
            .collect())
    }

    /// Points every declared dependency at a node: another generated node,
    /// an existing migration, or the declaration itself when neither fits.
    fn link_dependencies(
        &self,
        real: &dyn MigrationSource,
        ignore_apps: &[String],
        arena: &mut Arena,
    ) -> Result<()> {
        for index in 0..arena.drafts.len() {
            let declared = std::mem::take(&mut arena.drafts[index].declared);
            let node = arena.drafts[index].key.clone();
            let links = declared
                .iter()
                .map(|dependency| self.link(real, ignore_apps, &mut arena.seen, &node, dependency))
                .collect::<Result<Vec<_>>>()?;
            arena.drafts[index].links = links;
        }
        Ok(())
    }

    fn link(
        &self,
        real: &dyn MigrationSource,
        ignore_apps: &[String],
        seen: &mut IndexMap<NodeKey, Link>,
        node: &NodeKey,
        dependency: &Dependency,
    ) -> Result<Link> {
        let key = match dependency {
            Dependency::Setting(setting) => {
                let value = self
                    .settings
                    .get(setting)
                    .ok_or_else(|| SquashError::UnknownSetting(setting.clone()))?;
                let app_label = value.split('.').next().unwrap_or(value);
                // The framework's writer renders the marker itself when the
                // owning app produced nothing in this run.
                return Ok(seen
                    .iter()
                    .rev()
                    .find(|(key, _)| key.app_label == app_label)
                    .map_or_else(|| Link::Literal(dependency.clone()), |(_, link)| link.clone()));
            }
            Dependency::First(app_label) => match real.graph().root_nodes(app_label).into_iter().next() {
                Some(root) => root,
                None => return Ok(Link::Literal(dependency.clone())),
            },
            Dependency::Latest(app_label) => match real.graph().leaf_nodes(app_label).into_iter().next() {
                Some(leaf) => leaf,
                None => return Ok(Link::Literal(dependency.clone())),
            },
            Dependency::Node(key) => key.clone(),
        };

        if ignore_apps.contains(&key.app_label) {
            let Some(leaf) = real.graph().leaf_nodes(&key.app_label).into_iter().next() else {
                return Err(SquashError::UnresolvedDependency {
                    node: node.to_string(),
                    dependency: dependency.to_string(),
                    reason: format!("app `{}` is excluded and has no migrations", key.app_label),
                });
            };
            debug!("{node}: {dependency} is excluded, depending on {leaf}");
            let link = Link::Existing(leaf.clone());
            seen.entry(leaf).or_insert_with(|| link.clone());
            return Ok(link);
        }
        if let Some(link) = seen.get(&key) {
            return Ok(link.clone());
        }
        if real.disk_migrations().contains_key(&key) {
            let link = Link::Existing(key.clone());
            seen.insert(key, link.clone());
            return Ok(link);
        }
        debug!("{node}: {dependency} is not a known migration, keeping it as declared");
        Ok(Link::Literal(Dependency::Node(key)))
    }

    /// Continues each app's numbering after the highest number on disk.
    fn rename_migrations(
        &self,
        real: &dyn MigrationSource,
        arena: &mut Arena,
        migration_name: Option<&str>,
    ) -> Result<()> {
        let suffix = self.expand_name(migration_name.unwrap_or(DEFAULT_MIGRATION_NAME))?;

        let mut counters: FxHashMap<&str, u64> = FxHashMap::default();
        for key in real.disk_migrations().keys() {
            let number = migration_number(&key.name)?;
            let counter = counters.entry(key.app_label.as_str()).or_default();
            *counter = (*counter).max(number);
        }

        for (app_label, indices) in &arena.by_app {
            let mut counter = counters.get(app_label.as_str()).copied().unwrap_or_default();
            for &index in indices {
                counter = counter
                    .checked_add(1)
                    .ok_or_else(|| SquashError::InvalidMigrationName {
                        name: suffix.clone(),
                        reason: format!(
                            "no migration number is left after {counter} in app `{app_label}`"
                        ),
                    })?;
                let draft = &mut arena.drafts[index];
                debug!("Renaming {} to {counter:04}_{suffix}", draft.key);
                draft.key.name = format!("{counter:04}_{suffix}");
            }
        }
        Ok(())
    }

    /// The squashed name with any `strftime` format expanded.
    fn expand_name(&self, template: &str) -> Result<String> {
        let items: Vec<Item<'_>> = StrftimeItems::new(template).collect();
        if items.iter().any(|item| matches!(item, Item::Error)) {
            return Err(SquashError::InvalidMigrationName {
                name: template.to_owned(),
                reason: "invalid date format".to_owned(),
            });
        }
        let name = self.timestamp.format_with_items(items.into_iter()).to_string();
        if name.is_empty() {
            return Ok(DEFAULT_MIGRATION_NAME.to_owned());
        }
        if name
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '.' | '/' | '\\'))
        {
            return Err(SquashError::InvalidMigrationName {
                name,
                reason: "it cannot be used as a module name".to_owned(),
            });
        }
        Ok(name)
    }

    /// Moves the operations the diff cannot infer from the superseded
    /// migrations to the new nodes of their app.
    ///
    /// Extension operations go first in the first node, everything else is
    /// appended to the last one together with the superseded imports.
    fn add_non_elidables(&self, real: &dyn MigrationSource, arena: &mut Arena) -> Result<()> {
        for (app_label, indices) in &arena.by_app {
            let (Some(&first), Some(&last)) = (indices.first(), indices.last()) else {
                continue;
            };
            let replaced: IndexSet<NodeKey> = indices
                .iter()
                .flat_map(|&index| arena.drafts[index].replaces.iter().cloned())
                .collect();

            let mut names = UniqueVariableName::with_policy(Rc::clone(&self.policy));
            names.context_mut().app_label = Some(app_label.clone());
            names.context_mut().node = Some(arena.drafts[last].key.name.clone());

            let mut lifted = Vec::new();
            let mut extensions = Vec::new();
            let mut imports: IndexSet<String> = IndexSet::new();
            for key in &replaced {
                let Some(migration) = real.disk_migrations().get(key) else {
                    warn!("{key} is replaced but its module was not found, skipping it");
                    continue;
                };
                names.context_mut().original_node = Some(key.name.clone());
                imports.extend(migration.imports.iter().cloned());
                extensions.extend(lift_extensions(&migration.operations));
                for operation in &migration.operations {
                    names.context_mut().operation = Some(operation.describe());
                    lifted.extend(lift_custom_operations(
                        std::slice::from_ref(operation),
                        &mut names,
                    )?);
                }
            }
            debug!(
                "{app_label}: lifted {} operations and {} extensions",
                lifted.len(),
                extensions.len()
            );

            let imports: Vec<String> = imports.into_iter().collect();
            if !extensions.is_empty() {
                let draft = &mut arena.drafts[first];
                draft.operations.splice(0..0, extensions);
                if first != last {
                    draft.extra_imports.extend(imports.iter().cloned());
                }
            }
            let draft = &mut arena.drafts[last];
            draft.operations.extend(lifted);
            draft.extra_imports.extend(imports);
        }
        Ok(())
    }
}

/// Applies `change` to the edit node of `migration`, creating it on first
/// use.
fn edit(
    edits: &mut IndexMap<String, IndexMap<NodeKey, HistoryNode>>,
    migration: &RawMigration,
    change: impl FnOnce(&mut HistoryNode, &mut SquashFlags),
) -> Result<()> {
    let nodes = edits.entry(migration.key.app_label.clone()).or_default();
    let node = match nodes.entry(migration.key.clone()) {
        Entry::Occupied(entry) => entry.into_mut(),
        Entry::Vacant(entry) => entry.insert(migration.clone().into_history_node()?),
    };
    let mut flags = node.flags();
    change(node, &mut flags);
    node.kind = NodeKind::Edit(flags);
    Ok(())
}

/// Apps that keep migration files but no longer define models get a single
/// empty node, so their history is replaced instead of re-proposed.
fn create_deleted_models_migrations(
    real: &dyn MigrationSource,
    detector: &dyn ChangeDetector,
    ignore_apps: &[String],
    changes: &mut IndexMap<String, Vec<ProposedMigration>>,
) {
    let with_models: FxHashSet<String> = detector.apps_with_models().into_iter().collect();
    let mut labels: IndexSet<&str> = IndexSet::new();
    for migration in real.disk_migrations().values() {
        let app_label = migration.key.app_label.as_str();
        if !migration.read_only
            && !with_models.contains(app_label)
            && !ignore_apps.iter().any(|ignored| ignored == app_label)
        {
            labels.insert(app_label);
        }
    }
    for app_label in labels {
        debug!("{app_label} has migrations but no models");
        changes.insert(
            app_label.to_owned(),
            vec![ProposedMigration {
                app_label: app_label.to_owned(),
                name: "temp".to_owned(),
                ..ProposedMigration::default()
            }],
        );
    }
}

/// Every new node replaces what the framework currently sees of its app.
fn replace_current_migrations(real: &dyn MigrationSource, arena: &mut Arena) {
    for (app_label, indices) in &arena.by_app {
        let replaces = real.graph().app_nodes(app_label);
        for &index in indices {
            arena.drafts[index].replaces.clone_from(&replaces);
        }
    }
}

/// Leading number of a migration name, zero when there is none.
fn migration_number(name: &str) -> Result<u64> {
    let (number, _) = name.split_once('_').unwrap_or((name, ""));
    if number.is_empty() || !number.bytes().all(|byte| byte.is_ascii_digit()) {
        return Ok(0);
    }
    number.parse().map_err(|_| SquashError::InvalidMigrationName {
        name: name.to_owned(),
        reason: "its number is too large".to_owned(),
    })
}

/// Resolves links against the final names.
fn finish(arena: Arena) -> SquashedHistory {
    let keys: Vec<NodeKey> = arena.drafts.iter().map(|draft| draft.key.clone()).collect();
    let mut nodes: Vec<Option<HistoryNode>> = arena
        .drafts
        .into_iter()
        .map(|draft| {
            let dependencies = draft
                .links
                .into_iter()
                .map(|link| match link {
                    Link::New(index) => Dependency::Node(keys[index].clone()),
                    Link::Existing(key) => Dependency::Node(key),
                    Link::Literal(dependency) => dependency,
                })
                .collect();
            Some(HistoryNode {
                dependencies,
                operations: draft.operations,
                replaces: draft.replaces,
                initial: draft.initial,
                extra_imports: draft.extra_imports,
                ..HistoryNode::generated(draft.key)
            })
        })
        .collect();

    arena
        .by_app
        .into_iter()
        .map(|(app_label, indices)| {
            let app_nodes = indices
                .into_iter()
                .filter_map(|index| nodes[index].take())
                .collect();
            (app_label, app_nodes)
        })
        .collect()
}
