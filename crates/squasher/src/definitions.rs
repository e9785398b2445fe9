//! Statically resolved Python definitions referenced from migration operations.
//!
//! Migrations are never imported; a callable or operation class is described
//! by the module that defines it, its qualified name and, when the defining
//! module is part of the project, its source text.

use std::fmt;

/// How a referenced callable binds when it is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallableKind {
    /// A plain function, either module level or a function defined in a
    /// class body without a `self` parameter.
    Function,
    Lambda,
    StaticMethod,
    ClassMethod,
    /// A function that declares a `self` parameter.
    InstanceMethod,
    /// The reference resolved to something that cannot be called.
    NotCallable,
}

/// Identity of a definition: the module it lives in and the name it was
/// defined under. Renaming a callable never changes its identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DefinitionId {
    pub module: String,
    pub qualname: String,
}

impl fmt::Display for DefinitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.qualname)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallableRef {
    pub module: String,
    /// Current name; differs from `original_qualname` once relocated.
    pub qualname: String,
    pub original_qualname: String,
    pub kind: CallableKind,
    /// Defined directly in the body of a `Migration` subclass.
    pub in_migration_class: bool,
    /// Dedented source of the definition, when the module could be read.
    pub source: Option<String>,
    /// Lives in an installed package, the standard library, or could not be
    /// located at all.
    pub read_only: bool,
    /// Emitted into the generated module and referenced by bare name.
    pub local: bool,
}

impl CallableRef {
    pub fn new(module: impl Into<String>, qualname: impl Into<String>, kind: CallableKind) -> Self {
        let qualname = qualname.into();
        Self {
            module: module.into(),
            original_qualname: qualname.clone(),
            qualname,
            kind,
            in_migration_class: false,
            source: None,
            read_only: false,
            local: false,
        }
    }

    /// A callable from a module that is never rewritten.
    pub fn external(module: impl Into<String>, qualname: impl Into<String>) -> Self {
        let mut callable = Self::new(module, qualname, CallableKind::Function);
        callable.read_only = true;
        callable
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn in_migration_class(mut self) -> Self {
        self.in_migration_class = true;
        self
    }

    pub fn id(&self) -> DefinitionId {
        DefinitionId {
            module: self.module.clone(),
            qualname: self.original_qualname.clone(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.module, self.qualname)
    }

    /// Name the definition was written with, without its class prefix.
    pub fn original_name(&self) -> &str {
        self.original_qualname
            .rsplit_once('.')
            .map_or(self.original_qualname.as_str(), |(_, name)| name)
    }

    pub fn is_renamed(&self) -> bool {
        self.original_name() != self.qualname
    }

    /// Whether the definition can be copied into a generated module as a
    /// top-level function.
    pub fn is_relocatable(&self) -> bool {
        self.source.is_some()
            && !self.read_only
            && (self.in_migration_class || !self.original_qualname.contains('.'))
    }
}

/// An operation class that is not part of the framework's migrations module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassRef {
    pub module: String,
    pub qualname: String,
    pub source: Option<String>,
    pub read_only: bool,
    pub local: bool,
}

impl ClassRef {
    pub fn new(module: impl Into<String>, qualname: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            qualname: qualname.into(),
            source: None,
            read_only: false,
            local: false,
        }
    }

    pub fn id(&self) -> DefinitionId {
        DefinitionId {
            module: self.module.clone(),
            qualname: self.qualname.clone(),
        }
    }

    pub fn name(&self) -> &str {
        self.qualname
            .rsplit_once('.')
            .map_or(self.qualname.as_str(), |(_, name)| name)
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.module, self.qualname)
    }

    pub fn is_relocatable(&self) -> bool {
        self.source.is_some() && !self.read_only && !self.qualname.contains('.')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_method_is_relocatable() {
        let callable = CallableRef::new("app.migrations.0002_auto", "Migration.forwards", CallableKind::Function)
            .with_source("def forwards(apps, schema_editor):\n    return\n")
            .in_migration_class();
        assert!(callable.is_relocatable());
        assert_eq!(callable.original_name(), "forwards");
    }

    #[test]
    fn test_nested_function_is_not_relocatable() {
        let callable = CallableRef::new("app.migrations.0002_auto", "A.func", CallableKind::StaticMethod)
            .with_source("def func():\n    return 3\n");
        assert!(!callable.is_relocatable());
    }

    #[test]
    fn test_external_callable_is_read_only() {
        let callable = CallableRef::external("django.db.migrations", "RunPython.noop");
        assert!(callable.read_only);
        assert!(!callable.is_relocatable());
        assert_eq!(callable.full_name(), "django.db.migrations.RunPython.noop");
    }
}
