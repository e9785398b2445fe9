//! Name bindings of a parsed module, enough to follow references from a
//! migration's class body without executing anything.

use ruff_python_ast::{Expr, ModModule, Stmt, StmtClassDef, StmtFunctionDef};
use rustc_hash::FxHashMap;

/// What a name is bound to.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Binding<'a> {
    /// `import a.b` binds `a` to `a`; `import a.b as c` binds `c` to `a.b`.
    Import { path: &'a str, statement: usize },
    /// `from module import name [as alias]`.
    ImportFrom {
        module: &'a str,
        level: u32,
        name: &'a str,
        statement: usize,
    },
    Function(&'a StmtFunctionDef),
    Class(&'a StmtClassDef),
    Lambda,
    /// Any other assignment; the right-hand side is followed lazily.
    Assign(&'a Expr),
}

/// Top-level and `class Migration` bindings of one module.
#[derive(Debug)]
pub(crate) struct ModuleIndex<'a> {
    /// Dotted module name.
    pub(crate) module: String,
    pub(crate) source: &'a str,
    pub(crate) migration_class: Option<&'a StmtClassDef>,
    /// One normalized statement per imported name.
    imports: Vec<String>,
    module_scope: FxHashMap<&'a str, Binding<'a>>,
    class_scope: FxHashMap<&'a str, Binding<'a>>,
}

impl<'a> ModuleIndex<'a> {
    pub(crate) fn new(module: impl Into<String>, source: &'a str, parsed: &'a ModModule) -> Self {
        let mut index = Self {
            module: module.into(),
            source,
            migration_class: None,
            imports: Vec::new(),
            module_scope: FxHashMap::default(),
            class_scope: FxHashMap::default(),
        };

        let mut module_scope = FxHashMap::default();
        index.bind_all(&parsed.body, &mut module_scope);
        index.module_scope = module_scope;

        if let Some(migration) = crate::source_utils::find_migration_class(parsed) {
            index.migration_class = Some(migration);
            let mut class_scope = FxHashMap::default();
            index.bind_all(&migration.body, &mut class_scope);
            index.class_scope = class_scope;
        }
        index
    }

    fn bind_all(&mut self, body: &'a [Stmt], scope: &mut FxHashMap<&'a str, Binding<'a>>) {
        for stmt in body {
            match stmt {
                Stmt::Import(import) => {
                    for alias in &import.names {
                        let statement = self.imports.len();
                        match &alias.asname {
                            Some(asname) => {
                                self.imports
                                    .push(format!("import {} as {asname}", alias.name));
                                scope.insert(
                                    asname.as_str(),
                                    Binding::Import {
                                        path: alias.name.as_str(),
                                        statement,
                                    },
                                );
                            }
                            None => {
                                self.imports.push(format!("import {}", alias.name));
                                let top = alias
                                    .name
                                    .as_str()
                                    .split('.')
                                    .next()
                                    .unwrap_or(alias.name.as_str());
                                scope.insert(
                                    top,
                                    Binding::Import {
                                        path: top,
                                        statement,
                                    },
                                );
                            }
                        }
                    }
                }
                Stmt::ImportFrom(import_from) => {
                    let module = import_from.module.as_ref().map_or("", |m| m.as_str());
                    let dots = ".".repeat(import_from.level as usize);
                    for alias in &import_from.names {
                        let statement = self.imports.len();
                        let bound = match &alias.asname {
                            Some(asname) => {
                                self.imports.push(format!(
                                    "from {dots}{module} import {} as {asname}",
                                    alias.name
                                ));
                                asname.as_str()
                            }
                            None => {
                                self.imports
                                    .push(format!("from {dots}{module} import {}", alias.name));
                                alias.name.as_str()
                            }
                        };
                        scope.insert(
                            bound,
                            Binding::ImportFrom {
                                module,
                                level: import_from.level,
                                name: alias.name.as_str(),
                                statement,
                            },
                        );
                    }
                }
                Stmt::FunctionDef(function) => {
                    scope.insert(function.name.as_str(), Binding::Function(function));
                }
                Stmt::ClassDef(class_def) => {
                    scope.insert(class_def.name.as_str(), Binding::Class(class_def));
                }
                Stmt::Assign(assign) => {
                    let binding = match assign.value.as_ref() {
                        Expr::Lambda(_) => Binding::Lambda,
                        value => Binding::Assign(value),
                    };
                    for target in &assign.targets {
                        if let Expr::Name(name) = target {
                            scope.insert(name.id.as_str(), binding);
                        }
                    }
                }
                Stmt::AnnAssign(assign) => {
                    if let (Expr::Name(name), Some(value)) = (assign.target.as_ref(), &assign.value)
                    {
                        let binding = match value.as_ref() {
                            Expr::Lambda(_) => Binding::Lambda,
                            value => Binding::Assign(value),
                        };
                        scope.insert(name.id.as_str(), binding);
                    }
                }
                // Conditional imports such as `try: ... except ImportError:`
                Stmt::Try(try_stmt) => {
                    self.bind_all(&try_stmt.body, scope);
                }
                Stmt::If(if_stmt) => {
                    self.bind_all(&if_stmt.body, scope);
                }
                _ => {}
            }
        }
    }

    /// Looks `name` up, in the migration class body first when
    /// `class_scope` is set.
    pub(crate) fn lookup(&self, name: &str, class_scope: bool) -> Option<Binding<'a>> {
        if class_scope && let Some(binding) = self.class_scope.get(name) {
            return Some(*binding);
        }
        self.module_scope.get(name).copied()
    }

    pub(crate) fn is_class_binding(&self, name: &str) -> bool {
        self.class_scope.contains_key(name)
    }

    /// Statement that introduced an import binding.
    pub(crate) fn import_statement(&self, statement: usize) -> Option<&str> {
        self.imports.get(statement).map(String::as_str)
    }

    /// Absolute module of a `from` import, resolving leading dots against
    /// this module's package.
    pub(crate) fn absolute_module(&self, module: &str, level: u32) -> String {
        if level == 0 {
            return module.to_owned();
        }
        let mut package: Vec<&str> = self.module.split('.').collect();
        for _ in 0..level {
            package.pop();
        }
        if !module.is_empty() {
            package.push(module);
        }
        package.join(".")
    }
}

#[cfg(test)]
mod tests {
    use ruff_python_parser::parse_module;

    use super::*;

    const SOURCE: &str = r"import datetime
import django.contrib.contenttypes.models
import numpy as np
from django.db import migrations, models as m
from . import utils

noop = migrations.RunPython.noop
forwards = lambda apps, schema_editor: None


def same_name(apps, schema_editor):
    pass


class Migration(migrations.Migration):
    def same_name(apps, schema_editor):
        pass

    operations = []
";

    #[test]
    fn test_bindings() {
        let parsed = parse_module(SOURCE).expect("valid source");
        let index = ModuleIndex::new("app.migrations.0002_auto", SOURCE, parsed.syntax());

        let Some(Binding::Import { path, statement }) = index.lookup("django", false) else {
            panic!("expected an import binding");
        };
        assert_eq!(path, "django");
        assert_eq!(
            index.import_statement(statement),
            Some("import django.contrib.contenttypes.models")
        );
        assert!(matches!(
            index.lookup("np", false),
            Some(Binding::Import { path: "numpy", .. })
        ));
        let Some(Binding::ImportFrom { name, statement, .. }) = index.lookup("m", false) else {
            panic!("expected an import binding");
        };
        assert_eq!(name, "models");
        assert_eq!(
            index.import_statement(statement),
            Some("from django.db import models as m")
        );
        assert!(matches!(index.lookup("noop", false), Some(Binding::Assign(_))));
        assert!(matches!(index.lookup("forwards", false), Some(Binding::Lambda)));

        let Some(Binding::Function(function)) = index.lookup("same_name", true) else {
            panic!("expected a function");
        };
        assert!(index.is_class_binding("same_name"));
        assert!(function.range.start() > index.migration_class.expect("class").range.start());
        assert!(index.lookup("operations", false).is_none());
    }

    #[test]
    fn test_relative_modules() {
        let parsed = parse_module(SOURCE).expect("valid source");
        let index = ModuleIndex::new("app.migrations.0002_auto", SOURCE, parsed.syntax());
        assert_eq!(index.absolute_module("", 1), "app.migrations");
        assert_eq!(index.absolute_module("utils", 2), "app.utils");
        assert_eq!(index.absolute_module("django.db", 0), "django.db");
    }
}
