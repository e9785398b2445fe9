//! Migration operations as they are read from, and written back to, migration
//! modules.

use log::trace;

use crate::{
    definitions::{CallableRef, ClassRef},
    error::Result,
    serializer::{Value, Variable},
    unique_names::UniqueVariableName,
};

/// Public names of `django.db.migrations`.
pub const FRAMEWORK_EXPORTS: &[&str] = &[
    "AddConstraint",
    "AddField",
    "AddIndex",
    "AlterConstraint",
    "AlterField",
    "AlterIndexTogether",
    "AlterModelManagers",
    "AlterModelOptions",
    "AlterModelTable",
    "AlterModelTableComment",
    "AlterOrderWithRespectTo",
    "AlterUniqueTogether",
    "CreateModel",
    "DeleteModel",
    "Migration",
    "RemoveConstraint",
    "RemoveField",
    "RemoveIndex",
    "RenameField",
    "RenameIndex",
    "RenameModel",
    "RunPython",
    "RunSQL",
    "SeparateDatabaseAndState",
    "swappable_dependency",
];

/// Constructor signature of a known operation class.
#[derive(Debug, Clone, Copy)]
pub struct OperationSignature {
    pub name: &'static str,
    pub parameters: &'static [&'static str],
    /// Arguments written one item per line.
    pub expand: &'static [&'static str],
}

const fn signature(
    name: &'static str,
    parameters: &'static [&'static str],
    expand: &'static [&'static str],
) -> OperationSignature {
    OperationSignature {
        name,
        parameters,
        expand,
    }
}

const SIGNATURES: &[OperationSignature] = &[
    signature(
        "CreateModel",
        &["name", "fields", "options", "bases", "managers"],
        &["fields", "options", "managers"],
    ),
    signature("DeleteModel", &["name"], &[]),
    signature("RenameModel", &["old_name", "new_name"], &[]),
    signature("AlterModelTable", &["name", "table"], &[]),
    signature("AlterModelTableComment", &["name", "table_comment"], &[]),
    signature("AlterUniqueTogether", &["name", "unique_together"], &[]),
    signature("AlterIndexTogether", &["name", "index_together"], &[]),
    signature(
        "AlterOrderWithRespectTo",
        &["name", "order_with_respect_to"],
        &[],
    ),
    signature("AlterModelOptions", &["name", "options"], &[]),
    signature("AlterModelManagers", &["name", "managers"], &["managers"]),
    signature("AddIndex", &["model_name", "index"], &[]),
    signature("RemoveIndex", &["model_name", "name"], &[]),
    signature(
        "RenameIndex",
        &["model_name", "new_name", "old_name", "old_fields"],
        &[],
    ),
    signature("AddConstraint", &["model_name", "constraint"], &[]),
    signature("RemoveConstraint", &["model_name", "name"], &[]),
    signature("AlterConstraint", &["model_name", "name", "constraint"], &[]),
    signature(
        "AddField",
        &["model_name", "name", "field", "preserve_default"],
        &[],
    ),
    signature("RemoveField", &["model_name", "name"], &[]),
    signature(
        "AlterField",
        &["model_name", "name", "field", "preserve_default"],
        &[],
    ),
    signature("RenameField", &["model_name", "old_name", "new_name"], &[]),
    signature(
        "RunPython",
        &["code", "reverse_code", "atomic", "hints", "elidable"],
        &[],
    ),
    signature(
        "RunSQL",
        &["sql", "reverse_sql", "state_operations", "hints", "elidable"],
        &[],
    ),
    signature(
        "SeparateDatabaseAndState",
        &["database_operations", "state_operations"],
        &["database_operations", "state_operations"],
    ),
];

pub const POSTGRES_OPERATIONS: &str = "django.contrib.postgres.operations";

/// Extension operations shipped with the postgres contrib app and the
/// extension each one installs.
const POSTGRES_EXTENSIONS: &[(&str, &str)] = &[
    ("BloomExtension", "bloom"),
    ("BtreeGinExtension", "btree_gin"),
    ("BtreeGistExtension", "btree_gist"),
    ("CITextExtension", "citext"),
    ("CryptoExtension", "pgcrypto"),
    ("HStoreExtension", "hstore"),
    ("TrigramExtension", "pg_trgm"),
    ("UnaccentExtension", "unaccent"),
];

/// Signature of a framework operation class.
pub fn framework_signature(name: &str) -> Option<&'static OperationSignature> {
    SIGNATURES.iter().find(|signature| signature.name == name)
}

/// For a class of the postgres contrib app: whether it creates an extension
/// and, when fixed by the class, which one.
pub fn postgres_extension(class_name: &str) -> Option<Option<&'static str>> {
    if class_name == "CreateExtension" {
        return Some(None);
    }
    POSTGRES_EXTENSIONS
        .iter()
        .find(|(name, _)| *name == class_name)
        .map(|(_, extension)| Some(*extension))
}

/// Parameters of a postgres contrib operation constructor.
pub fn postgres_signature(class_name: &str) -> &'static [&'static str] {
    match class_name {
        "CreateExtension" => &["name", "hints"],
        "CreateCollation" => &["name", "locale", "provider", "deterministic"],
        "RemoveCollation" => &["name", "locale", "provider", "deterministic"],
        "AddIndexConcurrently" => &["model_name", "index"],
        "RemoveIndexConcurrently" => &["model_name", "name"],
        "AddConstraintNotValid" => &["model_name", "constraint"],
        "ValidateConstraint" => &["model_name", "name"],
        _ if postgres_extension(class_name).is_some() => &["hints"],
        _ => &[],
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunPython {
    pub code: CallableRef,
    pub reverse_code: Option<CallableRef>,
    pub atomic: Option<Value>,
    pub hints: Option<Value>,
    pub elidable: bool,
    /// `elidable` was passed explicitly and is written back.
    pub explicit_elidable: bool,
}

impl RunPython {
    pub fn new(code: CallableRef) -> Self {
        Self {
            code,
            reverse_code: None,
            atomic: None,
            hints: None,
            elidable: false,
            explicit_elidable: false,
        }
    }

    /// Copy of a superseded operation whose callables are renamed to symbols
    /// that are unique in the module being generated.
    ///
    /// A callable that can be copied into that module is marked local; one
    /// that lives in an installed package keeps pointing there.
    pub fn from_operation(operation: &Self, names: &mut UniqueVariableName) -> Result<Self> {
        let code = relocate(&operation.code, names)?;
        let reverse_code = operation
            .reverse_code
            .as_ref()
            .map(|callable| relocate(callable, names))
            .transpose()?;
        Ok(Self {
            code,
            reverse_code,
            atomic: operation.atomic.clone(),
            hints: operation.hints.clone(),
            elidable: false,
            explicit_elidable: true,
        })
    }

    /// Callables that still need a name in the module they are written to.
    pub fn is_processed(&self) -> bool {
        let processed = |callable: &CallableRef| callable.local || !callable.is_relocatable();
        processed(&self.code) && self.reverse_code.as_ref().is_none_or(processed)
    }
}

fn relocate(callable: &CallableRef, names: &mut UniqueVariableName) -> Result<CallableRef> {
    let mut callable = callable.clone();
    let name = names.function(&callable)?;
    if callable.is_relocatable() {
        trace!("Relocating {} as {name}", callable.id());
        callable.qualname = name;
        callable.local = true;
    }
    Ok(callable)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSql {
    pub sql: Value,
    pub reverse_sql: Option<Value>,
    pub state_operations: Vec<Operation>,
    pub hints: Option<Value>,
    pub elidable: bool,
    pub explicit_elidable: bool,
}

impl RunSql {
    pub fn new(sql: Value) -> Self {
        Self {
            sql,
            reverse_sql: None,
            state_operations: Vec::new(),
            hints: None,
            elidable: false,
            explicit_elidable: false,
        }
    }

    /// Copy of a superseded operation whose SQL is moved into module-level
    /// constants: `SQL_<n>` and, when there is something to roll back,
    /// `SQL_<n>_ROLLBACK`.
    pub fn from_operation(operation: &Self, names: &mut UniqueVariableName) -> Result<Self> {
        let name = names.allocate_numbered("SQL");
        let reverse_sql = match &operation.reverse_sql {
            Some(reverse) if reverse.is_truthy() => {
                let rollback = names.allocate(&format!("{name}_ROLLBACK"));
                Some(Value::Variable(Variable::new(rollback, reverse.clone())))
            }
            Some(reverse) => Some(Value::Variable(Variable::new(
                format!("{name}_ROLLBACK"),
                reverse.clone(),
            ))),
            None => None,
        };
        Ok(Self {
            sql: Value::Variable(Variable::new(name, operation.sql.clone())),
            reverse_sql,
            state_operations: operation.state_operations.clone(),
            hints: operation.hints.clone(),
            elidable: false,
            explicit_elidable: true,
        })
    }

    pub fn is_processed(&self) -> bool {
        matches!(self.sql, Value::Variable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SeparateDatabaseAndState {
    pub database_operations: Vec<Operation>,
    pub state_operations: Vec<Operation>,
}

/// A schema operation from `django.db.migrations`, arguments keyed by
/// parameter name where the signature is known.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaOperation {
    pub name: String,
    /// Positional arguments beyond the known signature.
    pub args: Vec<Value>,
    pub kwargs: Vec<(String, Value)>,
}

impl SchemaOperation {
    pub fn new(name: impl Into<String>, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Self {
        let name = name.into();
        let parameters = framework_signature(&name).map_or(&[][..], |signature| signature.parameters);
        let (args, kwargs) = name_arguments(parameters, args, kwargs);
        Self { name, args, kwargs }
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        kwarg(&self.kwargs, name)
    }
}

/// An operation class outside `django.db.migrations`.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomOperation {
    pub class: ClassRef,
    pub args: Vec<Value>,
    pub kwargs: Vec<(String, Value)>,
    pub elidable: bool,
    /// Set for database extension operations, with the extension name when
    /// the class fixes it.
    pub extension: Option<Option<String>>,
}

impl CustomOperation {
    pub fn new(
        class: ClassRef,
        parameters: &[&str],
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Self {
        let (args, kwargs) = name_arguments(parameters, args, kwargs);
        Self {
            class,
            args,
            kwargs,
            elidable: false,
            extension: None,
        }
    }

    pub fn is_extension(&self) -> bool {
        self.extension.is_some()
    }

    /// Copy of an extension operation; a class defined next to the
    /// migration is emitted into the generated module.
    pub fn from_operation(operation: &Self) -> Self {
        let mut operation = operation.clone();
        if operation.class.is_relocatable() {
            operation.class.local = true;
        }
        operation
    }

    fn extension_name(&self) -> Option<String> {
        match &self.extension {
            Some(Some(name)) => Some(name.clone()),
            Some(None) => kwarg(&self.kwargs, "name")
                .and_then(Value::as_str)
                .map(str::to_owned),
            None => None,
        }
    }
}

fn kwarg<'a>(kwargs: &'a [(String, Value)], name: &str) -> Option<&'a Value> {
    kwargs
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value)
}

/// Moves positional arguments covered by `parameters` into keyword
/// arguments, which are then ordered by the signature with unknown keywords
/// last.
fn name_arguments(
    parameters: &[&str],
    args: Vec<Value>,
    mut kwargs: Vec<(String, Value)>,
) -> (Vec<Value>, Vec<(String, Value)>) {
    let mut rest = Vec::new();
    for (index, value) in args.into_iter().enumerate() {
        match parameters.get(index) {
            Some(parameter) => kwargs.push(((*parameter).to_owned(), value)),
            None => rest.push(value),
        }
    }
    kwargs.sort_by_key(|(name, _)| {
        parameters
            .iter()
            .position(|parameter| parameter == name)
            .unwrap_or(parameters.len())
    });
    (rest, kwargs)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    RunPython(RunPython),
    RunSql(RunSql),
    SeparateDatabaseAndState(SeparateDatabaseAndState),
    Schema(SchemaOperation),
    Custom(CustomOperation),
}

/// How the constructor of an operation is spelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationPath {
    /// `migrations.<name>`
    Framework(String),
    /// `<module>.<qualname>`, imported with `import <module>`.
    Module { module: String, qualname: String },
    /// A class defined in the module being written.
    Local(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    pub name: Option<String>,
    pub value: Value,
}

impl Argument {
    fn named(name: &str, value: Value) -> Self {
        Self {
            name: Some(name.to_owned()),
            value,
        }
    }
}

/// Constructor call that recreates an operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Deconstructed {
    pub path: OperationPath,
    pub arguments: Vec<Argument>,
    pub expand: &'static [&'static str],
}

impl Operation {
    pub fn class_name(&self) -> &str {
        match self {
            Self::RunPython(_) => "RunPython",
            Self::RunSql(_) => "RunSQL",
            Self::SeparateDatabaseAndState(_) => "SeparateDatabaseAndState",
            Self::Schema(operation) => &operation.name,
            Self::Custom(operation) => operation.class.name(),
        }
    }

    pub fn is_elidable(&self) -> bool {
        match self {
            Self::RunPython(operation) => operation.elidable,
            Self::RunSql(operation) => operation.elidable,
            Self::Custom(operation) => operation.elidable,
            Self::SeparateDatabaseAndState(_) | Self::Schema(_) => false,
        }
    }

    pub fn is_extension(&self) -> bool {
        matches!(self, Self::Custom(operation) if operation.is_extension())
    }

    /// Human readable summary, as shown when migrations are written.
    pub fn describe(&self) -> String {
        match self {
            Self::RunPython(_) => "Raw Python operation".to_owned(),
            Self::RunSql(_) => "Raw SQL operation".to_owned(),
            Self::SeparateDatabaseAndState(_) => {
                "Custom state/database change combination".to_owned()
            }
            Self::Schema(operation) => describe_schema(operation),
            Self::Custom(operation) => match operation.extension_name() {
                Some(name) => format!("Creates extension {name}"),
                None => operation.class.name().to_owned(),
            },
        }
    }

    pub fn deconstruct(&self) -> Deconstructed {
        match self {
            Self::RunPython(operation) => {
                let mut arguments = vec![Argument::named(
                    "code",
                    Value::Callable(operation.code.clone()),
                )];
                if let Some(reverse_code) = &operation.reverse_code {
                    arguments.push(Argument::named(
                        "reverse_code",
                        Value::Callable(reverse_code.clone()),
                    ));
                }
                if let Some(atomic) = &operation.atomic {
                    arguments.push(Argument::named("atomic", atomic.clone()));
                }
                if let Some(hints) = operation.hints.as_ref().filter(|hints| hints.is_truthy()) {
                    arguments.push(Argument::named("hints", hints.clone()));
                }
                if operation.explicit_elidable || operation.elidable {
                    arguments.push(Argument::named("elidable", Value::Bool(operation.elidable)));
                }
                framework("RunPython", arguments)
            }
            Self::RunSql(operation) => {
                let mut arguments = vec![Argument::named("sql", operation.sql.clone())];
                if let Some(reverse_sql) = &operation.reverse_sql {
                    let skip = matches!(reverse_sql, Value::Variable(variable) if !variable.is_truthy());
                    if !skip {
                        arguments.push(Argument::named("reverse_sql", reverse_sql.clone()));
                    }
                }
                if !operation.state_operations.is_empty() {
                    arguments.push(Argument::named(
                        "state_operations",
                        operations_value(&operation.state_operations),
                    ));
                }
                if let Some(hints) = operation.hints.as_ref().filter(|hints| hints.is_truthy()) {
                    arguments.push(Argument::named("hints", hints.clone()));
                }
                if operation.explicit_elidable || operation.elidable {
                    arguments.push(Argument::named("elidable", Value::Bool(operation.elidable)));
                }
                framework("RunSQL", arguments)
            }
            Self::SeparateDatabaseAndState(operation) => {
                let mut arguments = Vec::new();
                if !operation.database_operations.is_empty() {
                    arguments.push(Argument::named(
                        "database_operations",
                        operations_value(&operation.database_operations),
                    ));
                }
                if !operation.state_operations.is_empty() {
                    arguments.push(Argument::named(
                        "state_operations",
                        operations_value(&operation.state_operations),
                    ));
                }
                framework("SeparateDatabaseAndState", arguments)
            }
            Self::Schema(operation) => {
                let arguments = positional_then_named(&operation.args, &operation.kwargs);
                framework(&operation.name, arguments)
            }
            Self::Custom(operation) => {
                let class = &operation.class;
                let path = if class.local {
                    OperationPath::Local(class.name().to_owned())
                } else if class.module == "django.db.migrations"
                    && FRAMEWORK_EXPORTS.contains(&class.qualname.as_str())
                {
                    OperationPath::Framework(class.qualname.clone())
                } else {
                    OperationPath::Module {
                        module: class.module.clone(),
                        qualname: class.qualname.clone(),
                    }
                };
                Deconstructed {
                    path,
                    arguments: positional_then_named(&operation.args, &operation.kwargs),
                    expand: &[],
                }
            }
        }
    }
}

fn framework(name: &str, arguments: Vec<Argument>) -> Deconstructed {
    Deconstructed {
        path: OperationPath::Framework(name.to_owned()),
        arguments,
        expand: framework_signature(name).map_or(&[][..], |signature| signature.expand),
    }
}

fn positional_then_named(args: &[Value], kwargs: &[(String, Value)]) -> Vec<Argument> {
    args.iter()
        .map(|value| Argument {
            name: None,
            value: value.clone(),
        })
        .chain(kwargs.iter().map(|(name, value)| Argument::named(name, value.clone())))
        .collect()
}

fn operations_value(operations: &[Operation]) -> Value {
    Value::List(
        operations
            .iter()
            .map(|operation| Value::Operation(Box::new(operation.clone())))
            .collect(),
    )
}

fn describe_schema(operation: &SchemaOperation) -> String {
    let arg = |name: &str| -> String {
        match operation.kwarg(name) {
            Some(Value::Str(value)) => value.clone(),
            Some(Value::Reference(reference)) => reference.text.clone(),
            Some(Value::Setting(setting)) => format!("settings.{setting}"),
            _ => String::new(),
        }
    };
    let count = |name: &str| match operation.kwarg(name) {
        Some(Value::List(items) | Value::Tuple(items) | Value::Set(items)) => items.len(),
        _ => 0,
    };
    match operation.name.as_str() {
        "CreateModel" => {
            let proxy = matches!(
                operation.kwarg("options"),
                Some(Value::Dict(items))
                    if items.iter().any(|(key, value)| key.as_str() == Some("proxy") && value.is_truthy())
            );
            if proxy {
                format!("Create proxy model {}", arg("name"))
            } else {
                format!("Create model {}", arg("name"))
            }
        }
        "DeleteModel" => format!("Delete model {}", arg("name")),
        "RenameModel" => format!("Rename model {} to {}", arg("old_name"), arg("new_name")),
        "AlterModelTable" => format!("Rename table for {} to {}", arg("name"), arg("table")),
        "AlterModelTableComment" => format!("Alter {} table comment", arg("name")),
        "AlterUniqueTogether" => format!(
            "Alter unique_together for {} ({} constraint(s))",
            arg("name"),
            count("unique_together")
        ),
        "AlterIndexTogether" => format!(
            "Alter index_together for {} ({} constraint(s))",
            arg("name"),
            count("index_together")
        ),
        "AlterOrderWithRespectTo" => format!(
            "Set order_with_respect_to on {} to {}",
            arg("name"),
            arg("order_with_respect_to")
        ),
        "AlterModelOptions" => format!("Change Meta options on {}", arg("name")),
        "AlterModelManagers" => format!("Change managers on {}", arg("name")),
        "AddIndex" => format!("Create index on {}", arg("model_name")),
        "RemoveIndex" => format!("Remove index {} from {}", arg("name"), arg("model_name")),
        "RenameIndex" => format!(
            "Rename index {} on {} to {}",
            arg("old_name"),
            arg("model_name"),
            arg("new_name")
        ),
        "AddConstraint" => format!("Create constraint on model {}", arg("model_name")),
        "RemoveConstraint" => format!(
            "Remove constraint {} from model {}",
            arg("name"),
            arg("model_name")
        ),
        "AlterConstraint" => format!(
            "Alter constraint {} on {}",
            arg("name"),
            arg("model_name")
        ),
        "AddField" => format!("Add field {} to {}", arg("name"), arg("model_name")),
        "RemoveField" => format!("Remove field {} from {}", arg("name"), arg("model_name")),
        "AlterField" => format!("Alter field {} on {}", arg("name"), arg("model_name")),
        "RenameField" => format!(
            "Rename field {} on {} to {}",
            arg("old_name"),
            arg("model_name"),
            arg("new_name")
        ),
        other => other.to_owned(),
    }
}

/// Operations that survive a squash: non-elidable raw Python and raw SQL,
/// renamed for the module they move to.
///
/// State/database combinations are searched through their state side only.
pub fn lift_custom_operations(
    operations: &[Operation],
    names: &mut UniqueVariableName,
) -> Result<Vec<Operation>> {
    let mut lifted = Vec::new();
    lift_into(operations, names, &mut lifted)?;
    Ok(lifted)
}

fn lift_into(
    operations: &[Operation],
    names: &mut UniqueVariableName,
    lifted: &mut Vec<Operation>,
) -> Result<()> {
    for operation in operations {
        if operation.is_elidable() {
            continue;
        }
        match operation {
            Operation::RunSql(run_sql) => {
                lifted.push(Operation::RunSql(RunSql::from_operation(run_sql, names)?));
            }
            Operation::RunPython(run_python) => {
                lifted.push(Operation::RunPython(RunPython::from_operation(
                    run_python, names,
                )?));
            }
            Operation::SeparateDatabaseAndState(combination) => {
                lift_into(&combination.state_operations, names, lifted)?;
            }
            Operation::Schema(_) | Operation::Custom(_) => {}
        }
    }
    Ok(())
}

/// Non-elidable extension operations of a superseded migration, including
/// those on the state side of a combination. They have to run before
/// anything else in the squashed history.
pub fn lift_extensions(operations: &[Operation]) -> Vec<Operation> {
    let mut lifted = Vec::new();
    lift_extensions_into(operations, &mut lifted);
    lifted
}

fn lift_extensions_into(operations: &[Operation], lifted: &mut Vec<Operation>) {
    for operation in operations {
        if operation.is_elidable() {
            continue;
        }
        match operation {
            Operation::Custom(custom) if custom.is_extension() => {
                lifted.push(Operation::Custom(CustomOperation::from_operation(custom)));
            }
            Operation::SeparateDatabaseAndState(combination) => {
                lift_extensions_into(&combination.state_operations, lifted);
            }
            _ => {}
        }
    }
}
