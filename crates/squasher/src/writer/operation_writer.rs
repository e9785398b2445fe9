use crate::{
    error::Result,
    operations::{Operation, OperationPath},
    serializer::{Imports, Serialized, SerializerRegistry, Value},
};

const INDENT: &str = "    ";

/// Writes one operation as a constructor call, one argument per line.
#[derive(Debug)]
pub struct OperationWriter<'a> {
    operation: &'a Operation,
    registry: &'a SerializerRegistry,
    indentation: usize,
    buff: Vec<String>,
    imports: Imports,
}

impl<'a> OperationWriter<'a> {
    pub fn new(operation: &'a Operation, registry: &'a SerializerRegistry) -> Self {
        Self {
            operation,
            registry,
            indentation: 2,
            buff: Vec::new(),
            imports: Imports::new(),
        }
    }

    #[must_use]
    pub fn with_indentation(mut self, indentation: usize) -> Self {
        self.indentation = indentation;
        self
    }

    pub fn serialize(mut self) -> Result<Serialized> {
        let deconstructed = self.operation.deconstruct();
        match &deconstructed.path {
            OperationPath::Framework(name) => self.feed(&format!("migrations.{name}(")),
            OperationPath::Module { module, qualname } => {
                self.imports.insert(format!("import {module}"));
                self.feed(&format!("{module}.{qualname}("));
            }
            OperationPath::Local(name) => self.feed(&format!("{name}(")),
        }

        self.indent();
        for argument in &deconstructed.arguments {
            match &argument.name {
                Some(name) if deconstructed.expand.contains(&name.as_str()) => {
                    self.write_expanded(name, &argument.value)?;
                }
                Some(name) => self.write_argument(Some(name), &argument.value)?,
                None => self.write_argument(None, &argument.value)?,
            }
        }
        self.unindent();
        self.feed("),");

        Ok((self.buff.join("\n"), self.imports))
    }

    fn write_expanded(&mut self, name: &str, value: &Value) -> Result<()> {
        match value {
            Value::Dict(items) => {
                self.feed(&format!("{name}={{"));
                self.indent();
                for (key, value) in items {
                    let key = self.serialize_value(key)?;
                    let text = self.serialize_value(value)?;
                    let lines: Vec<&str> = text.lines().collect();
                    if let [first, middle @ .., last] = lines.as_slice() {
                        self.feed(&format!("{key}: {first}"));
                        for line in middle {
                            self.feed(line);
                        }
                        self.feed(&format!("{last},"));
                    } else {
                        self.feed(&format!("{key}: {text},"));
                    }
                }
                self.unindent();
                self.feed("},");
            }
            Value::List(items) | Value::Tuple(items) => {
                self.feed(&format!("{name}=["));
                self.indent();
                for item in items {
                    let text = self.serialize_value(item)?;
                    let lines: Vec<&str> = text.lines().collect();
                    if let [head @ .., last] = lines.as_slice()
                        && !head.is_empty()
                    {
                        for line in head {
                            self.feed(line);
                        }
                        self.feed(&format!("{last},"));
                    } else {
                        self.feed(&format!("{text},"));
                    }
                }
                self.unindent();
                self.feed("],");
            }
            _ => self.write_argument(Some(name), value)?,
        }
        Ok(())
    }

    fn write_argument(&mut self, name: Option<&str>, value: &Value) -> Result<()> {
        let prefix = name.map(|name| format!("{name}=")).unwrap_or_default();
        let text = self.serialize_value(value)?;
        let lines: Vec<&str> = text.lines().collect();
        if let [first, middle @ .., last] = lines.as_slice() {
            self.feed(&format!("{prefix}{first}"));
            for line in middle {
                self.feed(line);
            }
            self.feed(&format!("{last},"));
        } else {
            self.feed(&format!("{prefix}{text},"));
        }
        Ok(())
    }

    fn serialize_value(&mut self, value: &Value) -> Result<String> {
        let (text, imports) = self.registry.serialize(value)?;
        self.imports.extend(imports);
        Ok(text)
    }

    fn indent(&mut self) {
        self.indentation += 1;
    }

    fn unindent(&mut self) {
        self.indentation = self.indentation.saturating_sub(1);
    }

    fn feed(&mut self, line: &str) {
        self.buff
            .push(format!("{}{line}", INDENT.repeat(self.indentation)));
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        definitions::ClassRef,
        operations::{CustomOperation, SchemaOperation, SeparateDatabaseAndState},
        serializer::{MODELS_IMPORT, Reference},
    };

    fn field(kind: &str) -> Value {
        Value::Call {
            func: Reference::new(format!("models.{kind}")).with_import(MODELS_IMPORT),
            args: vec![],
            kwargs: vec![],
        }
    }

    #[test]
    fn test_create_model_expands_fields() -> Result<()> {
        let registry = SerializerRegistry::squash();
        let operation = Operation::Schema(SchemaOperation::new(
            "CreateModel",
            vec![],
            vec![
                ("name".to_owned(), Value::str("Person")),
                (
                    "fields".to_owned(),
                    Value::List(vec![
                        Value::Tuple(vec![Value::str("id"), field("AutoField")]),
                        Value::Tuple(vec![Value::str("name"), field("CharField")]),
                    ]),
                ),
                (
                    "options".to_owned(),
                    Value::Dict(vec![(Value::str("abstract"), Value::Bool(false))]),
                ),
            ],
        ));
        let (text, imports) = OperationWriter::new(&operation, &registry).serialize()?;
        let expected = [
            "        migrations.CreateModel(",
            "            name='Person',",
            "            fields=[",
            "                ('id', models.AutoField()),",
            "                ('name', models.CharField()),",
            "            ],",
            "            options={",
            "                'abstract': False,",
            "            },",
            "        ),",
        ]
        .join("\n");
        assert_eq!(text, expected);
        assert_eq!(imports, Imports::from([MODELS_IMPORT.to_owned()]));
        Ok(())
    }

    #[test]
    fn test_nested_operations_are_indented() -> Result<()> {
        let registry = SerializerRegistry::squash();
        let operation = Operation::SeparateDatabaseAndState(SeparateDatabaseAndState {
            database_operations: vec![],
            state_operations: vec![Operation::Schema(SchemaOperation::new(
                "DeleteModel",
                vec![Value::str("Person")],
                vec![],
            ))],
        });
        let (text, _) = OperationWriter::new(&operation, &registry)
            .with_indentation(0)
            .serialize()?;
        let expected = [
            "migrations.SeparateDatabaseAndState(",
            "    state_operations=[",
            "        migrations.DeleteModel(",
            "            name='Person',",
            "        ),",
            "    ],",
            "),",
        ]
        .join("\n");
        assert_eq!(text, expected);
        Ok(())
    }

    #[test]
    fn test_custom_operation_imports_its_module() -> Result<()> {
        let registry = SerializerRegistry::squash();
        let operation = Operation::Custom(CustomOperation::new(
            ClassRef::new("django.contrib.postgres.operations", "CreateExtension"),
            &["name", "hints"],
            vec![Value::str("postgis")],
            vec![],
        ));
        let (text, imports) = OperationWriter::new(&operation, &registry).serialize()?;
        assert_eq!(
            text,
            "        django.contrib.postgres.operations.CreateExtension(\n            name='postgis',\n        ),"
        );
        assert_eq!(
            imports,
            Imports::from(["import django.contrib.postgres.operations".to_owned()])
        );
        Ok(())
    }

    #[test]
    fn test_local_class_uses_bare_name() -> Result<()> {
        let registry = SerializerRegistry::squash();
        let mut class = ClassRef::new("app.migrations.0001_initial", "IgnoreRollbackBtreeGinExtension");
        class.local = true;
        let operation = Operation::Custom(CustomOperation::new(class, &["hints"], vec![], vec![]));
        let (text, imports) = OperationWriter::new(&operation, &registry).serialize()?;
        assert_eq!(text, "        IgnoreRollbackBtreeGinExtension(\n        ),");
        assert!(imports.is_empty());
        Ok(())
    }
}
