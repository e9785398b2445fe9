//! Renders history nodes as migration modules.
//!
//! Generated nodes are rendered in full. Edit nodes rewrite the
//! `dependencies` and `replaces` statements of an existing file in place, or
//! ask for the file to be deleted.

pub mod imports;
pub mod literals;
pub mod operation_writer;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use indexmap::IndexSet;
use log::{debug, warn};

use crate::{
    definitions::DefinitionId,
    error::{Result, SquashError},
    migration::{HistoryNode, NodeKind, SquashFlags},
    operations::{Operation, RunPython, RunSql},
    serializer::{Imports, SerializerRegistry, Value, Variable},
    source_utils::{rename_function_header, replace_migration_attribute},
    unique_names::UniqueVariableName,
};
use imports::ImportSection;
use literals::triple_quoted;
use operation_writer::OperationWriter;

const HEADER_DATE_FORMAT: &str = "%Y-%m-%d %H:%M";

pub struct MigrationWriter<'a> {
    node: &'a HistoryNode,
    directory: PathBuf,
    include_header: bool,
    timestamp: DateTime<Local>,
    registry: SerializerRegistry,
}

impl<'a> MigrationWriter<'a> {
    /// `directory` is the migrations directory of the node's app.
    pub fn new(node: &'a HistoryNode, directory: impl Into<PathBuf>, include_header: bool) -> Self {
        Self {
            node,
            directory: directory.into(),
            include_header,
            timestamp: Local::now(),
            registry: SerializerRegistry::squash(),
        }
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Local>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn filename(&self) -> String {
        format!("{}.py", self.node.name())
    }

    /// Where the module lives, or will.
    pub fn path(&self) -> PathBuf {
        match &self.node.original {
            Some(original) if matches!(self.node.kind, NodeKind::Edit(_)) => original.path.clone(),
            _ => self.directory.join(self.filename()),
        }
    }

    /// Contents of the module, or `None` when the file has to be deleted.
    pub fn as_string(&self) -> Result<Option<String>> {
        match &self.node.kind {
            NodeKind::Edit(flags) => self.replace_in_migration(*flags),
            NodeKind::Generated => self.render().map(Some),
        }
    }

    fn replace_in_migration(&self, flags: SquashFlags) -> Result<Option<String>> {
        if flags.removed {
            return Ok(None);
        }
        let Some(original) = &self.node.original else {
            return Err(SquashError::Internal(format!(
                "edit of {} has no source file",
                self.node.key
            )));
        };

        if !flags.dependencies_changed && !flags.replaces_cleared {
            return Err(SquashError::Internal(format!(
                "{} is marked for editing without any change",
                self.node.key
            )));
        }

        let path = original.path.as_path();
        let mut source = original.source.clone();
        let mut applied = false;
        if flags.dependencies_changed {
            let dependencies = Value::List(
                self.node
                    .dependencies
                    .iter()
                    .map(|dependency| dependency.to_value())
                    .collect(),
            );
            let (value, _) = self.registry.serialize(&dependencies)?;
            applied |= self.replace_attribute(path, &mut source, "dependencies", &value)?;
        }
        if flags.replaces_cleared {
            applied |= self.replace_attribute(path, &mut source, "replaces", "[]")?;
        }
        if !applied {
            return Err(SquashError::bad_migration(
                path,
                "none of the attributes to rewrite are assigned in the migration class",
            ));
        }
        Ok(Some(source))
    }

    /// Rewrites `attribute` in place, reporting whether it was found.
    fn replace_attribute(
        &self,
        path: &Path,
        source: &mut String,
        attribute: &str,
        value: &str,
    ) -> Result<bool> {
        match replace_migration_attribute(path, source, attribute, value)? {
            Some(replaced) => {
                *source = replaced;
                Ok(true)
            }
            None => {
                warn!(
                    "{}: no `{attribute}` assignment in the migration class, leaving it as is",
                    path.display()
                );
                Ok(false)
            }
        }
    }

    fn render(&self) -> Result<String> {
        let operations = self.process_operations()?;
        let mut imports = Imports::new();

        let mut operation_strings = Vec::with_capacity(operations.len());
        for operation in &operations {
            let (text, operation_imports) = OperationWriter::new(operation, &self.registry).serialize()?;
            imports.extend(operation_imports);
            operation_strings.push(text);
        }

        let mut dependency_strings = Vec::with_capacity(self.node.dependencies.len());
        for dependency in &self.node.dependencies {
            let (text, dependency_imports) = self.registry.serialize(&dependency.to_value())?;
            imports.extend(dependency_imports);
            dependency_strings.push(format!("        {text},"));
        }

        let import_section = ImportSection::build(imports, &self.node.extra_imports);
        if import_section.needs_manual_porting() {
            warn!(
                "{} references functions in migrations that will be removed: {}",
                self.node.key,
                import_section.manual_porting.join(", ")
            );
        }

        let replaces_str = if self.node.replaces.is_empty() {
            String::new()
        } else {
            let replaces = Value::List(
                self.node
                    .replaces
                    .iter()
                    .map(|key| {
                        Value::Tuple(vec![Value::str(&key.app_label), Value::str(&key.name)])
                    })
                    .collect(),
            );
            format!("\n    replaces = {}\n", self.registry.serialize(&replaces)?.0)
        };
        let initial_str = if self.node.initial {
            "\n    initial = True\n"
        } else {
            ""
        };
        let header = if self.include_header {
            format!(
                "# Generated by squasher {} on {}\n\n",
                env!("CARGO_PKG_VERSION"),
                self.timestamp.format(HEADER_DATE_FORMAT)
            )
        } else {
            String::new()
        };

        let functions = block(&definitions(&operations));
        let variables = block(&self.variables(&operations)?);

        Ok(format!(
            "{header}{imports}{functions}{variables}\n\nclass Migration(migrations.Migration):\n{replaces_str}{initial_str}\n    dependencies = [\n{dependencies}    ]\n\n    operations = [\n{operations}    ]\n",
            imports = import_section.render(),
            dependencies = lines(&dependency_strings),
            operations = lines(&operation_strings),
        ))
    }

    /// Gives names to raw Python and raw SQL operations that were not
    /// lifted by a squash.
    fn process_operations(&self) -> Result<Vec<Operation>> {
        let mut names = UniqueVariableName::new();
        {
            let context = names.context_mut();
            context.app_label = Some(self.node.app_label().to_owned());
            context.node = Some(self.node.name().to_owned());
        }
        for operation in &self.node.operations {
            match operation {
                Operation::RunPython(run_python) => {
                    for callable in std::iter::once(&run_python.code).chain(&run_python.reverse_code) {
                        if callable.local {
                            names.remember(callable);
                        }
                    }
                }
                Operation::RunSql(run_sql) => {
                    for value in std::iter::once(&run_sql.sql).chain(&run_sql.reverse_sql) {
                        if let Value::Variable(variable) = value {
                            names.reserve(&variable.name);
                        }
                    }
                }
                _ => {}
            }
        }

        self.node
            .operations
            .iter()
            .map(|operation| match operation {
                Operation::RunPython(run_python) if !run_python.is_processed() => {
                    debug!("Naming the callables of an unprocessed RunPython in {}", self.node.key);
                    Ok(Operation::RunPython(RunPython::from_operation(
                        run_python, &mut names,
                    )?))
                }
                Operation::RunSql(run_sql) if !run_sql.is_processed() => Ok(Operation::RunSql(
                    RunSql::from_operation(run_sql, &mut names)?,
                )),
                other => Ok(other.clone()),
            })
            .collect()
    }

    fn variables(&self, operations: &[Operation]) -> Result<Vec<String>> {
        let mut variables = Vec::new();
        for operation in operations {
            let Operation::RunSql(run_sql) = operation else {
                continue;
            };
            if let Value::Variable(variable) = &run_sql.sql {
                variables.push(self.variable(variable)?);
            }
            if let Some(Value::Variable(variable)) = &run_sql.reverse_sql
                && variable.is_truthy()
            {
                variables.push(self.variable(variable)?);
            }
        }
        Ok(variables)
    }

    fn variable(&self, variable: &Variable) -> Result<String> {
        let value = match variable.value.as_ref() {
            Value::Str(text) => triple_quoted(text),
            other => self.registry.serialize(other)?.0,
        };
        Ok(format!("{} = {value}", variable.name))
    }
}

/// Source of the functions and classes that move into the module, each
/// definition once.
fn definitions(operations: &[Operation]) -> Vec<String> {
    let mut seen: IndexSet<DefinitionId> = IndexSet::new();
    let mut sources = Vec::new();
    for operation in operations {
        match operation {
            Operation::RunPython(run_python) => {
                for callable in std::iter::once(&run_python.code).chain(&run_python.reverse_code) {
                    if !callable.local || !seen.insert(callable.id()) {
                        continue;
                    }
                    if let Some(source) = &callable.source {
                        sources.push(rename_function_header(
                            source,
                            callable.original_name(),
                            &callable.qualname,
                        ));
                    }
                }
            }
            Operation::Custom(custom) if custom.class.local => {
                if !seen.insert(custom.class.id()) {
                    continue;
                }
                if let Some(source) = &custom.class.source {
                    sources.push(source.clone());
                }
            }
            _ => {}
        }
    }
    sources
        .into_iter()
        .map(|source| format!("{}\n", source.trim_end()))
        .collect()
}

fn block(items: &[String]) -> String {
    if items.is_empty() {
        String::new()
    } else {
        format!("\n\n{}", items.join("\n\n"))
    }
}

fn lines(items: &[String]) -> String {
    if items.is_empty() {
        String::new()
    } else {
        format!("{}\n", items.join("\n"))
    }
}
