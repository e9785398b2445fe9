//! Reads migration modules without importing them.

mod convert;
mod index;

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::debug;
use ruff_python_ast::{Expr, Stmt};
use ruff_python_codegen::Stylist;
use ruff_python_parser::parse_module;

use crate::{
    error::{Result, SquashError},
    migration::{Dependency, NodeKey, RawMigration},
    operations::Operation,
    resolver::ModuleResolver,
    serializer::MIGRATIONS_IMPORT,
    source_utils::collect_imports,
};
use convert::Converter;
use index::ModuleIndex;

/// The values of `class Migration` a squash cares about.
#[derive(Debug, Default)]
struct MigrationBody {
    dependencies: Vec<Dependency>,
    replaces: Vec<NodeKey>,
    initial: bool,
    operations: Vec<Operation>,
    attributes: Vec<String>,
    imports: Vec<String>,
}

#[derive(Debug)]
pub struct MigrationParser<'a> {
    resolver: &'a ModuleResolver,
}

impl<'a> MigrationParser<'a> {
    pub fn new(resolver: &'a ModuleResolver) -> Self {
        Self { resolver }
    }

    /// Reads and parses the migration module at `path`.
    pub fn parse_file(
        &self,
        key: NodeKey,
        module: &str,
        path: &Path,
        read_only: bool,
    ) -> Result<RawMigration> {
        let source = fs::read_to_string(path).map_err(|error| SquashError::io(path, error))?;
        self.parse_source(key, module, path.to_path_buf(), source, read_only)
    }

    pub fn parse_source(
        &self,
        key: NodeKey,
        module: &str,
        path: PathBuf,
        source: String,
        read_only: bool,
    ) -> Result<RawMigration> {
        debug!("Parsing migration {key} from {}", path.display());
        let body = self.parse_body(module, &path, &source, read_only)?;
        Ok(RawMigration {
            key,
            module: module.to_owned(),
            path,
            source,
            dependencies: body.dependencies,
            replaces: body.replaces,
            initial: body.initial,
            operations: body.operations,
            imports: body.imports,
            attributes: body.attributes,
            read_only,
        })
    }

    /// Parses operations given as Python expressions, resolving names
    /// through `imports`.
    pub fn parse_operations(
        &self,
        module: &str,
        imports: &[String],
        operations: &[String],
    ) -> Result<Vec<Operation>> {
        let mut source = String::new();
        if !imports.iter().any(|import| import == MIGRATIONS_IMPORT) {
            source.push_str(MIGRATIONS_IMPORT);
            source.push('\n');
        }
        for import in imports {
            source.push_str(import);
            source.push('\n');
        }
        source.push_str("\n\nclass Migration(migrations.Migration):\n    operations = [\n");
        for operation in operations {
            source.push_str(operation.trim());
            source.push_str(",\n");
        }
        source.push_str("    ]\n");

        let path = PathBuf::from(format!("<{module}>"));
        Ok(self.parse_body(module, &path, &source, false)?.operations)
    }

    fn parse_body(
        &self,
        module: &str,
        path: &Path,
        source: &str,
        read_only: bool,
    ) -> Result<MigrationBody> {
        let parsed = parse_module(source).map_err(|error| SquashError::Parse {
            path: path.to_path_buf(),
            message: error.to_string(),
        })?;
        let index = ModuleIndex::new(module, source, parsed.syntax());
        let Some(migration) = index.migration_class else {
            return Err(SquashError::bad_migration(path, "no `Migration` class"));
        };
        let stylist = Stylist::from_tokens(parsed.tokens(), source);
        let converter = Converter::new(&index, self.resolver, &stylist, path, read_only);

        let mut body = MigrationBody {
            imports: collect_imports(parsed.syntax()),
            ..MigrationBody::default()
        };
        for stmt in &migration.body {
            let (targets, value): (Vec<&Expr>, &Expr) = match stmt {
                Stmt::Assign(assign) => (assign.targets.iter().collect(), &assign.value),
                Stmt::AnnAssign(assign) => match &assign.value {
                    Some(value) => (vec![assign.target.as_ref()], value),
                    None => continue,
                },
                _ => continue,
            };
            for target in targets {
                let Expr::Name(name) = target else {
                    continue;
                };
                body.attributes.push(name.id.to_string());
                match name.id.as_str() {
                    "dependencies" => {
                        body.dependencies = converter
                            .elements(value, true)?
                            .iter()
                            .map(|expr| converter.dependency(expr, true))
                            .collect::<Result<_>>()?;
                    }
                    "replaces" => {
                        body.replaces = converter
                            .elements(value, true)?
                            .iter()
                            .map(|expr| converter.node_key(expr, true))
                            .collect::<Result<_>>()?;
                    }
                    "initial" => body.initial = converter.value(value, true)?.is_truthy(),
                    "operations" => body.operations = converter.operations(value, true)?,
                    _ => {}
                }
            }
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{config::Config, serializer::Value};

    fn resolver() -> ModuleResolver {
        ModuleResolver::new(Config {
            project_root: PathBuf::from("/nonexistent"),
            ..Config::default()
        })
    }

    #[test]
    fn test_parse_squashed_migration() -> Result<()> {
        let source = r#"from django.db import migrations


class Migration(migrations.Migration):

    replaces = [('app', '0001_initial'), ('app', '0002_person_age')]

    initial = True

    dependencies = [
        ('app2', '__first__'),
    ]

    operations = [
        migrations.DeleteModel('Person'),
    ]
"#;
        let resolver = resolver();
        let migration = MigrationParser::new(&resolver).parse_source(
            NodeKey::new("app", "0003_squashed"),
            "app.migrations.0003_squashed",
            PathBuf::from("app/migrations/0003_squashed.py"),
            source.to_owned(),
            false,
        )?;
        assert!(migration.initial);
        assert_eq!(
            migration.replaces,
            vec![
                NodeKey::new("app", "0001_initial"),
                NodeKey::new("app", "0002_person_age"),
            ]
        );
        assert_eq!(migration.dependencies, vec![Dependency::First("app2".to_owned())]);
        assert_eq!(migration.operations.len(), 1);
        assert_eq!(migration.operations[0].describe(), "Delete model Person");
        assert_eq!(
            migration.attributes,
            vec!["replaces", "initial", "dependencies", "operations"]
        );
        assert_eq!(migration.imports, vec![MIGRATIONS_IMPORT]);
        Ok(())
    }

    #[test]
    fn test_missing_migration_class() {
        let resolver = resolver();
        let result = MigrationParser::new(&resolver).parse_source(
            NodeKey::new("app", "0001_initial"),
            "app.migrations.0001_initial",
            PathBuf::from("app/migrations/0001_initial.py"),
            "x = 1\n".to_owned(),
            false,
        );
        assert!(matches!(result, Err(SquashError::BadMigration { .. })));
    }

    #[test]
    fn test_parse_operations() -> Result<()> {
        let resolver = resolver();
        let operations = MigrationParser::new(&resolver).parse_operations(
            "app.migrations.0002_squashed",
            &["from django.db import migrations, models".to_owned()],
            &["migrations.CreateModel(\n    name='Person',\n    fields=[\n        ('id', models.AutoField(primary_key=True)),\n    ],\n)".to_owned()],
        )?;
        let [Operation::Schema(create_model)] = operations.as_slice() else {
            panic!("expected one CreateModel");
        };
        assert_eq!(create_model.name, "CreateModel");
        assert_eq!(create_model.kwarg("name"), Some(&Value::str("Person")));
        Ok(())
    }
}
