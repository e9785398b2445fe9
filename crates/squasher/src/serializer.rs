//! Turns [`Value`]s back into Python source.
//!
//! The registry is an explicit value handed to whoever renders a module, so
//! the squash-specific serializers are only active for the render that asked
//! for them.

use std::{collections::BTreeSet, fmt};

use crate::{
    definitions::{CallableKind, CallableRef},
    error::{Result, SquashError},
    operations::{FRAMEWORK_EXPORTS, Operation},
    writer::{literals::string_repr, operation_writer::OperationWriter},
};

pub type Imports = BTreeSet<String>;

/// Source text plus the import statements it needs.
pub type Serialized = (String, Imports);

pub const MIGRATIONS_IMPORT: &str = "from django.db import migrations";
pub const MODELS_IMPORT: &str = "from django.db import models";
pub const SETTINGS_IMPORT: &str = "from django.conf import settings";

/// An expression kept as source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub text: String,
    pub imports: Imports,
}

impl Reference {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            imports: Imports::new(),
        }
    }

    #[must_use]
    pub fn with_import(mut self, import: impl Into<String>) -> Self {
        self.imports.insert(import.into());
        self
    }
}

/// A module-level constant the generated module defines, referenced by name.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub value: Box<Value>,
}

impl Variable {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value: Box::new(value),
        }
    }

    pub fn is_truthy(&self) -> bool {
        self.value.is_truthy()
    }
}

/// A Python value as it appears in a migration module.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    /// Literal rendered verbatim: numbers, bytes, ellipsis.
    Literal(String),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Set(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    /// Opaque expression such as `models.CASCADE`.
    Reference(Reference),
    /// A deconstructed object, for example a model field.
    Call {
        func: Reference,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    },
    /// `settings.<NAME>`
    Setting(String),
    Variable(Variable),
    Callable(CallableRef),
    Operation(Box<Operation>),
}

impl Value {
    pub fn str(value: impl Into<String>) -> Self {
        Self::Str(value.into())
    }

    /// Python truthiness, as far as it can be known statically.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(value) => *value,
            Self::Literal(text) => !matches!(
                text.as_str(),
                "0" | "0.0" | "0j" | "b''" | "b\"\"" | "False" | "None"
            ),
            Self::Str(value) => !value.is_empty(),
            Self::List(items) | Self::Tuple(items) | Self::Set(items) => !items.is_empty(),
            Self::Dict(items) => !items.is_empty(),
            Self::Variable(variable) => variable.is_truthy(),
            Self::Reference(_)
            | Self::Call { .. }
            | Self::Setting(_)
            | Self::Callable(_)
            | Self::Operation(_) => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }
}

/// A serializer for values the built-in rules do not cover, or cover
/// differently.
pub trait ValueSerializer: fmt::Debug {
    /// `None` when this serializer does not handle `value`.
    fn serialize(&self, value: &Value, registry: &SerializerRegistry)
    -> Option<Result<Serialized>>;
}

/// Renders a [`Variable`] as a bare reference to its module-level name.
#[derive(Debug, Default, Clone, Copy)]
pub struct VariableSerializer;

impl ValueSerializer for VariableSerializer {
    fn serialize(
        &self,
        value: &Value,
        _registry: &SerializerRegistry,
    ) -> Option<Result<Serialized>> {
        match value {
            Value::Variable(variable) => Some(Ok((variable.name.clone(), Imports::new()))),
            _ => None,
        }
    }
}

/// Renders callables defined in the module being written by bare name, and
/// framework callables through the `migrations`/`models` imports every
/// migration already has.
#[derive(Debug, Default, Clone, Copy)]
pub struct FunctionTypeSerializer;

impl ValueSerializer for FunctionTypeSerializer {
    fn serialize(
        &self,
        value: &Value,
        _registry: &SerializerRegistry,
    ) -> Option<Result<Serialized>> {
        let Value::Callable(callable) = value else {
            return None;
        };
        if callable.local {
            return Some(Ok((callable.qualname.clone(), Imports::new())));
        }

        let first = callable
            .qualname
            .split('.')
            .next()
            .unwrap_or(callable.qualname.as_str());
        if callable.module.starts_with("django.db.migrations") && FRAMEWORK_EXPORTS.contains(&first)
        {
            return Some(Ok((
                format!("migrations.{}", callable.qualname),
                Imports::from([MIGRATIONS_IMPORT.to_owned()]),
            )));
        }
        if callable.module.starts_with("django.db.models") {
            return Some(Ok((
                format!("models.{}", callable.qualname),
                Imports::from([MODELS_IMPORT.to_owned()]),
            )));
        }
        None
    }
}

#[derive(Debug, Default)]
pub struct SerializerRegistry {
    extensions: Vec<Box<dyn ValueSerializer>>,
}

impl SerializerRegistry {
    /// Only the built-in rules; variable placeholders cannot be serialized.
    pub fn base() -> Self {
        Self::default()
    }

    /// The registry used while writing squashed migrations.
    pub fn squash() -> Self {
        let mut registry = Self::base();
        registry.register(Box::new(VariableSerializer));
        registry.register(Box::new(FunctionTypeSerializer));
        registry
    }

    /// Later registrations take precedence.
    pub fn register(&mut self, serializer: Box<dyn ValueSerializer>) {
        self.extensions.insert(0, serializer);
    }

    pub fn serialize(&self, value: &Value) -> Result<Serialized> {
        for serializer in &self.extensions {
            if let Some(result) = serializer.serialize(value, self) {
                return result;
            }
        }
        self.serialize_builtin(value)
    }

    fn serialize_builtin(&self, value: &Value) -> Result<Serialized> {
        match value {
            Value::None => Ok(("None".to_owned(), Imports::new())),
            Value::Bool(true) => Ok(("True".to_owned(), Imports::new())),
            Value::Bool(false) => Ok(("False".to_owned(), Imports::new())),
            Value::Literal(text) => Ok((text.clone(), Imports::new())),
            Value::Str(value) => Ok((string_repr(value)?, Imports::new())),
            Value::List(items) => {
                let (items, imports) = self.serialize_all(items)?;
                Ok((format!("[{}]", items.join(", ")), imports))
            }
            Value::Tuple(items) => {
                let (items, imports) = self.serialize_all(items)?;
                let text = if items.len() == 1 {
                    format!("({},)", items[0])
                } else {
                    format!("({})", items.join(", "))
                };
                Ok((text, imports))
            }
            Value::Set(items) => {
                if items.is_empty() {
                    return Ok(("set()".to_owned(), Imports::new()));
                }
                let (mut items, imports) = self.serialize_all(items)?;
                items.sort();
                Ok((format!("{{{}}}", items.join(", ")), imports))
            }
            Value::Dict(items) => {
                let mut imports = Imports::new();
                let mut pairs = Vec::with_capacity(items.len());
                for (key, value) in items {
                    let (key, key_imports) = self.serialize(key)?;
                    let (value, value_imports) = self.serialize(value)?;
                    imports.extend(key_imports);
                    imports.extend(value_imports);
                    pairs.push((key, value));
                }
                pairs.sort();
                let body = pairs
                    .into_iter()
                    .map(|(key, value)| format!("{key}: {value}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                Ok((format!("{{{body}}}"), imports))
            }
            Value::Reference(reference) => Ok((reference.text.clone(), reference.imports.clone())),
            Value::Call { func, args, kwargs } => {
                let mut imports = func.imports.clone();
                let mut parts = Vec::with_capacity(args.len() + kwargs.len());
                for arg in args {
                    let (text, arg_imports) = self.serialize(arg)?;
                    imports.extend(arg_imports);
                    parts.push(text);
                }
                let mut sorted: Vec<&(String, Value)> = kwargs.iter().collect();
                sorted.sort_by(|a, b| a.0.cmp(&b.0));
                for (name, value) in sorted {
                    let (text, kwarg_imports) = self.serialize(value)?;
                    imports.extend(kwarg_imports);
                    parts.push(format!("{name}={text}"));
                }
                Ok((format!("{}({})", func.text, parts.join(", ")), imports))
            }
            Value::Setting(name) => Ok((
                format!("settings.{name}"),
                Imports::from([SETTINGS_IMPORT.to_owned()]),
            )),
            Value::Variable(variable) => Err(SquashError::Serialization(format!(
                "variable placeholder `{}`: it is only valid while writing a squashed migration",
                variable.name
            ))),
            Value::Callable(callable) => serialize_callable(callable),
            Value::Operation(operation) => {
                let (text, imports) = OperationWriter::new(operation, self)
                    .with_indentation(0)
                    .serialize()?;
                Ok((text.trim_end_matches(',').to_owned(), imports))
            }
        }
    }

    fn serialize_all(&self, values: &[Value]) -> Result<(Vec<String>, Imports)> {
        let mut imports = Imports::new();
        let mut items = Vec::with_capacity(values.len());
        for value in values {
            let (text, value_imports) = self.serialize(value)?;
            imports.extend(value_imports);
            items.push(text);
        }
        Ok((items, imports))
    }
}

fn serialize_callable(callable: &CallableRef) -> Result<Serialized> {
    match callable.kind {
        CallableKind::Lambda => Err(SquashError::Serialization(format!(
            "function {}: lambdas cannot be referenced from a migration",
            callable.full_name()
        ))),
        CallableKind::NotCallable => Err(SquashError::Serialization(format!(
            "{}: not a function",
            callable.full_name()
        ))),
        _ if callable.module.is_empty() => Err(SquashError::Serialization(format!(
            "function {}: no module",
            callable.qualname
        ))),
        _ => Ok((
            callable.full_name(),
            Imports::from([format!("import {}", callable.module)]),
        )),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn text(registry: &SerializerRegistry, value: &Value) -> String {
        registry.serialize(value).expect("serializable").0
    }

    #[test]
    fn test_python_literals() {
        let registry = SerializerRegistry::base();
        assert_eq!(text(&registry, &Value::None), "None");
        assert_eq!(text(&registry, &Value::Bool(false)), "False");
        assert_eq!(text(&registry, &Value::str("it's")), "\"it's\"");
        assert_eq!(
            text(&registry, &Value::Tuple(vec![Value::str("app")])),
            "('app',)"
        );
        assert_eq!(text(&registry, &Value::Set(vec![])), "set()");
        assert_eq!(
            text(
                &registry,
                &Value::List(vec![Value::Tuple(vec![
                    Value::str("app"),
                    Value::str("0001_initial")
                ])])
            ),
            "[('app', '0001_initial')]"
        );
    }

    #[test]
    fn test_deconstructed_call_sorts_keywords() {
        let registry = SerializerRegistry::base();
        let field = Value::Call {
            func: Reference::new("models.ForeignKey").with_import(MODELS_IMPORT),
            args: vec![],
            kwargs: vec![
                ("to".to_owned(), Value::Setting("AUTH_USER_MODEL".to_owned())),
                (
                    "on_delete".to_owned(),
                    Value::Reference(Reference::new("models.CASCADE").with_import(MODELS_IMPORT)),
                ),
            ],
        };
        let (text, imports) = registry.serialize(&field).expect("serializable");
        assert_eq!(
            text,
            "models.ForeignKey(on_delete=models.CASCADE, to=settings.AUTH_USER_MODEL)"
        );
        assert_eq!(
            imports.into_iter().collect::<Vec<_>>(),
            vec![SETTINGS_IMPORT, MODELS_IMPORT]
        );
    }

    #[test]
    fn test_variables_need_the_squash_registry() {
        let variable = Value::Variable(Variable::new("SQL_1", Value::str("select 1")));
        assert!(SerializerRegistry::base().serialize(&variable).is_err());
        assert_eq!(text(&SerializerRegistry::squash(), &variable), "SQL_1");
    }

    #[test]
    fn test_function_references() {
        let squash = SerializerRegistry::squash();
        let base = SerializerRegistry::base();

        let noop = Value::Callable(CallableRef::external(
            "django.db.migrations.operations.special",
            "RunPython.noop",
        ));
        assert_eq!(
            squash.serialize(&noop).expect("serializable"),
            (
                "migrations.RunPython.noop".to_owned(),
                Imports::from([MIGRATIONS_IMPORT.to_owned()])
            )
        );
        assert_eq!(
            text(&base, &noop),
            "django.db.migrations.operations.special.RunPython.noop"
        );

        let mut local = CallableRef::new("app.migrations.0002_auto", "same_name", CallableKind::Function);
        local.qualname = "same_name_2".to_owned();
        local.local = true;
        assert_eq!(
            squash.serialize(&Value::Callable(local)).expect("serializable"),
            ("same_name_2".to_owned(), Imports::new())
        );

        let helper = Value::Callable(CallableRef::external("app.utils", "forwards"));
        assert_eq!(
            squash.serialize(&helper).expect("serializable"),
            (
                "app.utils.forwards".to_owned(),
                Imports::from(["import app.utils".to_owned()])
            )
        );

        let lambda = Value::Callable(CallableRef::new("app.utils", "<lambda>", CallableKind::Lambda));
        assert!(squash.serialize(&lambda).is_err());
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::str("").is_truthy());
        assert!(Value::str("select 1").is_truthy());
        assert!(!Value::Variable(Variable::new("SQL_1_ROLLBACK", Value::str(""))).is_truthy());
        assert!(!Value::Literal("0".to_owned()).is_truthy());
    }
}
