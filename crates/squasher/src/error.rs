use std::path::PathBuf;

use thiserror::Error;

/// Reasons a callable cannot be given a relocatable name.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NamingError {
    #[error("`{0}` is not a callable")]
    NotCallable(String),

    #[error("`{0}` is a lambda and cannot be copied into a migration")]
    Lambda(String),

    #[error("`{0}` is bound to its class and cannot be copied into a migration")]
    BoundMethod(String),

    #[error("`{0}` is an instance method and cannot be copied into a migration")]
    InstanceMethod(String),
}

#[derive(Debug, Error)]
pub enum SquashError {
    #[error("The following apps are not valid: {}", .0.join(", "))]
    InvalidApps(Vec<String>),

    #[error("The following apps are both selected and ignored: {}", .0.join(", "))]
    ConflictingApps(Vec<String>),

    #[error("There are no migrations to squash.")]
    NothingToSquash,

    #[error("Found {0} circular dependencies")]
    CircularDependencies(usize),

    #[error(transparent)]
    Naming(#[from] NamingError),

    #[error("Invalid squashed migration name {name:?}: {reason}")]
    InvalidMigrationName { name: String, reason: String },

    #[error("Migration {node} already defines the reserved attribute `{attribute}`")]
    ReservedAttribute { node: String, attribute: String },

    #[error("Cannot resolve dependency {dependency} of {node}: {reason}")]
    UnresolvedDependency {
        node: String,
        dependency: String,
        reason: String,
    },

    #[error("Setting `{0}` is used by a swappable dependency but has no value")]
    UnknownSetting(String),

    #[error("{}: {message}", path.display())]
    BadMigration { path: PathBuf, message: String },

    #[error("Cannot serialize {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
}

impl SquashError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn bad_migration(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::BadMigration {
            path: path.into(),
            message: message.into(),
        }
    }
}

pub type Result<T, E = SquashError> = std::result::Result<T, E>;
