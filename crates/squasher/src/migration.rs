//! Migration records: what is read from disk, what the structural diff
//! proposes, and the nodes of the squashed history that get written.

use std::{fmt, ops::Index, path::PathBuf};

use crate::{
    error::{Result, SquashError},
    operations::Operation,
    serializer::{MIGRATIONS_IMPORT, Reference, SETTINGS_IMPORT, Value},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    pub app_label: String,
    pub name: String,
}

impl NodeKey {
    pub fn new(app_label: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            app_label: app_label.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.app_label, self.name)
    }
}

/// A dependency as declared by a migration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dependency {
    Node(NodeKey),
    /// `(app, "__first__")`: the root migration of `app`.
    First(String),
    /// `(app, "__latest__")`: the leaf migration of `app`.
    Latest(String),
    /// A swappable dependency on the app named by a setting, such as
    /// `AUTH_USER_MODEL`.
    Setting(String),
}

impl Dependency {
    /// Interprets the two-element tuple form.
    pub fn from_pair(first: &str, second: &str) -> Self {
        if first == "__setting__" {
            Self::Setting(second.to_owned())
        } else if second == "__first__" {
            Self::First(first.to_owned())
        } else if second == "__latest__" {
            Self::Latest(first.to_owned())
        } else {
            Self::Node(NodeKey::new(first, second))
        }
    }

    pub fn app_label(&self) -> Option<&str> {
        match self {
            Self::Node(key) => Some(&key.app_label),
            Self::First(app_label) | Self::Latest(app_label) => Some(app_label),
            Self::Setting(_) => None,
        }
    }

    /// The value written into a `dependencies` list.
    pub fn to_value(&self) -> Value {
        let pair = |app: &str, name: &str| Value::Tuple(vec![Value::str(app), Value::str(name)]);
        match self {
            Self::Node(key) => pair(&key.app_label, &key.name),
            Self::First(app_label) => pair(app_label, "__first__"),
            Self::Latest(app_label) => pair(app_label, "__latest__"),
            Self::Setting(setting) => Value::Reference(
                Reference::new(format!("migrations.swappable_dependency(settings.{setting})"))
                    .with_import(MIGRATIONS_IMPORT)
                    .with_import(SETTINGS_IMPORT),
            ),
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(key) => write!(f, "('{}', '{}')", key.app_label, key.name),
            Self::First(app_label) => write!(f, "('{app_label}', '__first__')"),
            Self::Latest(app_label) => write!(f, "('{app_label}', '__latest__')"),
            Self::Setting(setting) => write!(f, "('__setting__', '{setting}')"),
        }
    }
}

/// A migration module as found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMigration {
    pub key: NodeKey,
    /// Dotted module name, such as `app.migrations.0001_initial`.
    pub module: String,
    pub path: PathBuf,
    pub source: String,
    pub dependencies: Vec<Dependency>,
    pub replaces: Vec<NodeKey>,
    pub initial: bool,
    pub operations: Vec<Operation>,
    /// Top-level import statements of the module.
    pub imports: Vec<String>,
    /// Names assigned in the body of the migration class.
    pub attributes: Vec<String>,
    /// Lives outside the project and is never rewritten.
    pub read_only: bool,
}

/// A migration produced by the structural diff, before squashing assigns its
/// final name and links.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProposedMigration {
    pub app_label: String,
    pub name: String,
    pub dependencies: Vec<Dependency>,
    pub operations: Vec<Operation>,
    pub initial: bool,
    /// Imports needed by the proposed operations beyond the defaults.
    pub imports: Vec<String>,
}

/// What squashing does to an existing migration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SquashFlags {
    pub removed: bool,
    pub dependencies_changed: bool,
    pub replaces_cleared: bool,
}

impl SquashFlags {
    pub fn any(self) -> bool {
        self.removed || self.dependencies_changed || self.replaces_cleared
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// A new migration module.
    Generated,
    /// A surgical change to an existing module.
    Edit(SquashFlags),
}

/// Attributes squashing keeps on a node; a migration that already assigns
/// one of them cannot be processed.
pub const RESERVED_ATTRIBUTES: &[&str] = &[
    "_deleted",
    "_dependencies_change",
    "_replaces_change",
    "_original_migration",
];

/// A node of the squashed history.
///
/// Behaves like its `(app_label, name)` pair when indexed or iterated.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryNode {
    pub key: NodeKey,
    pub dependencies: Vec<Dependency>,
    pub operations: Vec<Operation>,
    pub replaces: Vec<NodeKey>,
    pub initial: bool,
    /// Imports copied from the superseded modules.
    pub extra_imports: Vec<String>,
    pub kind: NodeKind,
    /// The file an edit node rewrites.
    pub original: Option<Box<RawMigration>>,
}

impl HistoryNode {
    pub fn generated(key: NodeKey) -> Self {
        Self {
            key,
            dependencies: Vec::new(),
            operations: Vec::new(),
            replaces: Vec::new(),
            initial: false,
            extra_imports: Vec::new(),
            kind: NodeKind::Generated,
            original: None,
        }
    }

    pub fn app_label(&self) -> &str {
        &self.key.app_label
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    /// Whether the node is a change to an existing module rather than a
    /// module to render.
    pub fn is_migration_level(&self) -> bool {
        self.flags().any()
    }

    pub fn flags(&self) -> SquashFlags {
        match &self.kind {
            NodeKind::Edit(flags) => *flags,
            NodeKind::Generated => SquashFlags::default(),
        }
    }

    /// Lines describing a migration-level change.
    pub fn describe(&self) -> Vec<String> {
        let flags = self.flags();
        let mut description = Vec::new();
        if flags.removed {
            description.push("Deleted".to_owned());
        }
        if flags.dependencies_changed {
            description.push("\"dependencies\" changed".to_owned());
        }
        if flags.replaces_cleared {
            description.push("\"replaces\" keyword removed".to_owned());
        }
        description
    }
}

/// Indexes the node as the pair `(app_label, name)`.
impl Index<usize> for HistoryNode {
    type Output = str;

    /// # Panics
    ///
    /// Panics when `index` is greater than 1.
    fn index(&self, index: usize) -> &str {
        match index {
            0 => &self.key.app_label,
            1 => &self.key.name,
            _ => panic!("migration node index out of range: {index}"),
        }
    }
}

impl<'a> IntoIterator for &'a HistoryNode {
    type Item = &'a str;
    type IntoIter = std::array::IntoIter<&'a str, 2>;

    fn into_iter(self) -> Self::IntoIter {
        [self.key.app_label.as_str(), self.key.name.as_str()].into_iter()
    }
}

/// Conversion of migration records into history nodes.
pub trait IntoHistoryNode {
    fn into_history_node(self) -> Result<HistoryNode>;
}

impl IntoHistoryNode for HistoryNode {
    fn into_history_node(self) -> Result<HistoryNode> {
        Ok(self)
    }
}

impl IntoHistoryNode for RawMigration {
    fn into_history_node(self) -> Result<HistoryNode> {
        if let Some(attribute) = self
            .attributes
            .iter()
            .find(|attribute| RESERVED_ATTRIBUTES.contains(&attribute.as_str()))
        {
            return Err(SquashError::ReservedAttribute {
                node: self.key.to_string(),
                attribute: attribute.clone(),
            });
        }
        Ok(HistoryNode {
            key: self.key.clone(),
            dependencies: self.dependencies.clone(),
            operations: self.operations.clone(),
            replaces: self.replaces.clone(),
            initial: self.initial,
            extra_imports: Vec::new(),
            kind: NodeKind::Edit(SquashFlags::default()),
            original: Some(Box::new(self)),
        })
    }
}
