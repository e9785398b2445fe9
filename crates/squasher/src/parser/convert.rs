//! Static conversion of migration class expressions into operations, values
//! and dependencies.

use std::{fs, path::Path};

use log::{debug, trace};
use ruff_python_ast::{
    Expr, ExprCall, Stmt, StmtClassDef, StmtFunctionDef, UnaryOp,
    visitor::{Visitor, walk_expr},
};
use ruff_python_codegen::{Generator, Stylist};
use ruff_python_parser::parse_module;
use ruff_python_stdlib::builtins::is_python_builtin;
use ruff_text_size::Ranged;

use super::index::{Binding, ModuleIndex};
use crate::{
    definitions::{CallableKind, CallableRef, ClassRef},
    error::{Result, SquashError},
    migration::{Dependency, NodeKey},
    operations::{
        CustomOperation, Operation, POSTGRES_OPERATIONS, RunPython, RunSql,
        SchemaOperation, SeparateDatabaseAndState, framework_signature, postgres_extension,
        postgres_signature,
    },
    resolver::{ModuleLocation, ModuleResolver},
    serializer::{Imports, MIGRATIONS_IMPORT, MODELS_IMPORT, Reference, Value},
    source_utils::definition_source,
};

const MIGRATIONS_MODULE: &str = "django.db.migrations";
const MODELS_MODULE: &str = "django.db.models";
const SETTINGS_OBJECT: &str = "django.conf.settings";

/// Aliases followed before a name is treated as opaque.
const MAX_ALIAS_DEPTH: usize = 16;

/// What an expression refers to.
#[derive(Debug)]
enum Target<'a> {
    /// A dotted path into an importable module.
    External {
        path: String,
        /// Statement that brought the first name into scope.
        import: Option<String>,
        /// Spelled through its import rather than through an alias.
        direct: bool,
    },
    Function {
        def: &'a StmtFunctionDef,
        qualname: String,
        in_migration_class: bool,
    },
    Class {
        def: &'a StmtClassDef,
        qualname: String,
    },
    Lambda(String),
    /// Any other assigned value.
    Expr { expr: &'a Expr, class_scope: bool },
    Builtin(String),
}

/// Constructor details of an operation class defined in project code.
#[derive(Debug, Default)]
struct ClassInfo {
    source: Option<String>,
    parameters: Vec<String>,
    extension: Option<Option<String>>,
}

pub(crate) struct Converter<'a> {
    index: &'a ModuleIndex<'a>,
    resolver: &'a ModuleResolver,
    stylist: &'a Stylist<'a>,
    path: &'a Path,
    read_only: bool,
}

impl std::fmt::Debug for Converter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Converter")
            .field("module", &self.index.module)
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl<'a> Converter<'a> {
    pub(crate) fn new(
        index: &'a ModuleIndex<'a>,
        resolver: &'a ModuleResolver,
        stylist: &'a Stylist<'a>,
        path: &'a Path,
        read_only: bool,
    ) -> Self {
        Self {
            index,
            resolver,
            stylist,
            path,
            read_only,
        }
    }

    fn error(&self, message: impl Into<String>) -> SquashError {
        SquashError::bad_migration(self.path, message)
    }

    fn text(&self, expr: &Expr) -> String {
        Generator::from(self.stylist).expr(expr)
    }

    fn target(&self, expr: &'a Expr, class_scope: bool, depth: usize) -> Option<Target<'a>> {
        if depth > MAX_ALIAS_DEPTH {
            return None;
        }
        match expr {
            Expr::Name(name) => self.name_target(name.id.as_str(), class_scope, depth),
            Expr::Attribute(attribute) => {
                let attr = attribute.attr.as_str();
                match self.target(&attribute.value, class_scope, depth)? {
                    Target::External {
                        path,
                        import,
                        direct,
                    } => Some(Target::External {
                        path: format!("{path}.{attr}"),
                        import,
                        direct,
                    }),
                    Target::Class { def, qualname } => {
                        def.body.iter().find_map(|stmt| match stmt {
                            Stmt::FunctionDef(function) if function.name.as_str() == attr => {
                                Some(Target::Function {
                                    def: function,
                                    in_migration_class: qualname == "Migration",
                                    qualname: format!("{qualname}.{attr}"),
                                })
                            }
                            _ => None,
                        })
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn name_target(&self, name: &str, class_scope: bool, depth: usize) -> Option<Target<'a>> {
        let in_class = class_scope && self.index.is_class_binding(name);
        let qualname = if in_class {
            format!("Migration.{name}")
        } else {
            name.to_owned()
        };
        let Some(binding) = self.index.lookup(name, class_scope) else {
            let python_version = self.resolver.config().python_version;
            return is_python_builtin(name, python_version, false)
                .then(|| Target::Builtin(name.to_owned()));
        };
        match binding {
            Binding::Import { path, statement } => Some(Target::External {
                path: path.to_owned(),
                import: self.index.import_statement(statement).map(str::to_owned),
                direct: true,
            }),
            Binding::ImportFrom {
                module,
                level,
                name: imported,
                statement,
            } => {
                let module = self.index.absolute_module(module, level);
                Some(Target::External {
                    path: format!("{module}.{imported}"),
                    import: self.index.import_statement(statement).map(str::to_owned),
                    direct: true,
                })
            }
            Binding::Function(def) => Some(Target::Function {
                def,
                qualname,
                in_migration_class: in_class,
            }),
            Binding::Class(def) => Some(Target::Class { def, qualname }),
            Binding::Lambda => Some(Target::Lambda(qualname)),
            Binding::Assign(value) => match value {
                // `noop = migrations.RunPython.noop`
                Expr::Name(_) | Expr::Attribute(_) => {
                    match self.target(value, in_class, depth + 1)? {
                        Target::External { path, import, .. } => Some(Target::External {
                            path,
                            import,
                            direct: false,
                        }),
                        other => Some(other),
                    }
                }
                _ => Some(Target::Expr {
                    expr: value,
                    class_scope: in_class,
                }),
            },
        }
    }

    /// Converts an expression into a value, keeping anything that has no
    /// structured form as source text.
    pub(crate) fn value(&self, expr: &'a Expr, class_scope: bool) -> Result<Value> {
        self.value_at(expr, class_scope, 0)
    }

    fn value_at(&self, expr: &'a Expr, class_scope: bool, depth: usize) -> Result<Value> {
        let items = |elements: &'a [Expr]| -> Result<Vec<Value>> {
            elements
                .iter()
                .map(|element| self.value_at(element, class_scope, depth))
                .collect()
        };
        let value = match expr {
            Expr::StringLiteral(literal) => Value::Str(literal.value.to_str().to_owned()),
            Expr::BooleanLiteral(literal) => Value::Bool(literal.value),
            Expr::NoneLiteral(_) => Value::None,
            Expr::NumberLiteral(_) | Expr::BytesLiteral(_) | Expr::EllipsisLiteral(_) => {
                Value::Literal(self.text(expr))
            }
            Expr::UnaryOp(unary)
                if matches!(unary.op, UnaryOp::USub | UnaryOp::UAdd)
                    && matches!(unary.operand.as_ref(), Expr::NumberLiteral(_)) =>
            {
                Value::Literal(self.text(expr))
            }
            Expr::List(list) if !has_starred(&list.elts) => Value::List(items(&list.elts)?),
            Expr::Tuple(tuple) if !has_starred(&tuple.elts) => Value::Tuple(items(&tuple.elts)?),
            Expr::Set(set) if !has_starred(&set.elts) => Value::Set(items(&set.elts)?),
            Expr::Dict(dict) if dict.items.iter().all(|item| item.key.is_some()) => {
                let mut entries = Vec::with_capacity(dict.items.len());
                for item in &dict.items {
                    if let Some(key) = &item.key {
                        entries.push((
                            self.value_at(key, class_scope, depth)?,
                            self.value_at(&item.value, class_scope, depth)?,
                        ));
                    }
                }
                Value::Dict(entries)
            }
            Expr::Call(call)
                if !has_starred(&call.arguments.args)
                    && call.arguments.keywords.iter().all(|keyword| keyword.arg.is_some()) =>
            {
                let func = self.reference(&call.func, class_scope, depth);
                let args = items(&call.arguments.args)?;
                let mut kwargs = Vec::with_capacity(call.arguments.keywords.len());
                for keyword in &call.arguments.keywords {
                    if let Some(arg) = &keyword.arg {
                        kwargs.push((
                            arg.to_string(),
                            self.value_at(&keyword.value, class_scope, depth)?,
                        ));
                    }
                }
                Value::Call { func, args, kwargs }
            }
            Expr::Name(_) | Expr::Attribute(_) => self.name_value(expr, class_scope, depth)?,
            Expr::Lambda(_) => Value::Callable(CallableRef::new(
                self.index.module.clone(),
                "<lambda>",
                CallableKind::Lambda,
            )),
            _ => Value::Reference(self.opaque(expr, class_scope)),
        };
        Ok(value)
    }

    fn name_value(&self, expr: &'a Expr, class_scope: bool, depth: usize) -> Result<Value> {
        let Some(target) = self.target(expr, class_scope, depth) else {
            return Ok(Value::Reference(self.opaque(expr, class_scope)));
        };
        let value = match target {
            Target::External {
                path,
                import,
                direct,
            } => {
                if let Some(setting) = path.strip_prefix(SETTINGS_OBJECT).and_then(|rest| rest.strip_prefix('.')) {
                    Value::Setting(setting.to_owned())
                } else if path.starts_with(MIGRATIONS_MODULE) && path.ends_with("RunSQL.noop") {
                    Value::str("")
                } else {
                    Value::Reference(self.external_reference(expr, &path, import, direct))
                }
            }
            Target::Function {
                def,
                qualname,
                in_migration_class,
            } => Value::Callable(self.local_callable(def, qualname, in_migration_class)),
            Target::Class { qualname, .. } => Value::Reference(
                Reference::new(format!("{}.{qualname}", self.index.module))
                    .with_import(format!("import {}", self.index.module)),
            ),
            Target::Lambda(qualname) => Value::Callable(CallableRef::new(
                self.index.module.clone(),
                qualname,
                CallableKind::Lambda,
            )),
            Target::Expr { expr, class_scope } => {
                if depth >= MAX_ALIAS_DEPTH {
                    Value::Reference(self.opaque(expr, class_scope))
                } else {
                    self.value_at(expr, class_scope, depth + 1)?
                }
            }
            Target::Builtin(name) => Value::Reference(Reference::new(name)),
        };
        Ok(value)
    }

    /// Text that refers to `expr` from another module, plus its imports.
    fn reference(&self, expr: &'a Expr, class_scope: bool, depth: usize) -> Reference {
        match self.target(expr, class_scope, depth) {
            Some(Target::External {
                path,
                import,
                direct,
            }) => self.external_reference(expr, &path, import, direct),
            Some(Target::Function { qualname, .. } | Target::Class { qualname, .. }) => {
                Reference::new(format!("{}.{qualname}", self.index.module))
                    .with_import(format!("import {}", self.index.module))
            }
            Some(Target::Builtin(name)) => Reference::new(name),
            _ => self.opaque(expr, class_scope),
        }
    }

    fn external_reference(
        &self,
        expr: &Expr,
        path: &str,
        import: Option<String>,
        direct: bool,
    ) -> Reference {
        if let Some(rest) = path.strip_prefix(MIGRATIONS_MODULE).and_then(|rest| rest.strip_prefix('.')) {
            let rest = rest.strip_prefix("operations.").unwrap_or(rest);
            return Reference::new(format!("migrations.{rest}")).with_import(MIGRATIONS_IMPORT);
        }
        if let Some(rest) = path.strip_prefix(MODELS_MODULE).and_then(|rest| rest.strip_prefix('.')) {
            return Reference::new(format!("models.{rest}")).with_import(MODELS_IMPORT);
        }
        if direct {
            let mut reference = Reference::new(self.text(expr));
            reference.imports.extend(import);
            return reference;
        }
        let (module, qualname) = self.resolver.split_module_path(path);
        if module.is_empty() {
            return Reference::new(path);
        }
        Reference::new(format!("{module}.{qualname}")).with_import(format!("import {module}"))
    }

    /// Source text of an expression with the imports of every name it uses.
    fn opaque(&self, expr: &Expr, class_scope: bool) -> Reference {
        let mut collector = NameCollector::default();
        collector.visit_expr(expr);
        let mut imports = Imports::new();
        for name in collector.names {
            if let Some(
                Binding::Import { statement, .. } | Binding::ImportFrom { statement, .. },
            ) = self.index.lookup(&name, class_scope)
            {
                imports.extend(self.index.import_statement(statement).map(str::to_owned));
            }
        }
        trace!("Keeping `{}` as source text", self.text(expr));
        Reference {
            text: self.text(expr),
            imports,
        }
    }

    /// Resolves a `code`/`reverse_code` argument.
    pub(crate) fn callable(&self, expr: &'a Expr, class_scope: bool) -> Result<CallableRef> {
        if let Expr::Lambda(_) = expr {
            return Ok(CallableRef::new(
                self.index.module.clone(),
                "<lambda>",
                CallableKind::Lambda,
            ));
        }
        let Some(target) = self.target(expr, class_scope, 0) else {
            return Err(self.error(format!("cannot resolve callable `{}`", self.text(expr))));
        };
        let callable = match target {
            Target::Function {
                def,
                qualname,
                in_migration_class,
            } => self.local_callable(def, qualname, in_migration_class),
            Target::Lambda(qualname) => {
                CallableRef::new(self.index.module.clone(), qualname, CallableKind::Lambda)
            }
            Target::Class { qualname, .. } => {
                let mut callable =
                    CallableRef::new(self.index.module.clone(), qualname, CallableKind::Function);
                callable.read_only = self.read_only;
                callable
            }
            Target::External { path, .. } => self.external_callable(&path)?,
            Target::Builtin(name) => CallableRef::external("builtins", name),
            Target::Expr { expr, .. } => CallableRef::new(
                self.index.module.clone(),
                self.text(expr),
                CallableKind::NotCallable,
            ),
        };
        Ok(callable)
    }

    fn local_callable(
        &self,
        def: &StmtFunctionDef,
        qualname: String,
        in_migration_class: bool,
    ) -> CallableRef {
        let nested = qualname.contains('.');
        let from = if nested {
            def.name.range().start()
        } else {
            def.range().start()
        };
        let mut callable = CallableRef::new(self.index.module.clone(), qualname, function_kind(def, nested))
            .with_source(definition_source(self.index.source, def.range(), from));
        callable.in_migration_class = in_migration_class;
        callable.read_only = self.read_only;
        callable
    }

    /// A callable imported from another module. Functions of project modules
    /// carry their source so they can be copied.
    fn external_callable(&self, path: &str) -> Result<CallableRef> {
        let (module, qualname) = self.resolver.split_module_path(path);
        let ModuleLocation::Project(module_path) = self.resolver.locate(&module) else {
            return Ok(CallableRef::external(module, qualname));
        };
        if !module_path.is_file() {
            return Ok(CallableRef::external(module, qualname));
        }

        let source = fs::read_to_string(&module_path).map_err(|error| SquashError::io(&module_path, error))?;
        let parsed = parse_module(&source).map_err(|error| SquashError::Parse {
            path: module_path.clone(),
            message: error.to_string(),
        })?;
        let definition = parsed.syntax().body.iter().find_map(|stmt| match stmt {
            Stmt::FunctionDef(function) if function.name.as_str() == qualname => Some(function),
            _ => None,
        });
        let mut callable = match definition {
            Some(function) => CallableRef::new(&module, &qualname, function_kind(function, false))
                .with_source(definition_source(&source, function.range(), function.range().start())),
            None => CallableRef::new(&module, &qualname, CallableKind::Function),
        };
        debug!("Resolved {path} to project module {}", module_path.display());
        callable.read_only = false;
        Ok(callable)
    }

    /// Converts one entry of an `operations` list.
    pub(crate) fn operation(&self, expr: &'a Expr, class_scope: bool) -> Result<Operation> {
        self.operation_at(expr, class_scope, 0)
    }

    fn operation_at(&self, expr: &'a Expr, class_scope: bool, depth: usize) -> Result<Operation> {
        let call = match expr {
            Expr::Call(call) => call,
            Expr::Name(_) => match self.target(expr, class_scope, depth) {
                Some(Target::Expr { expr, class_scope }) if depth < MAX_ALIAS_DEPTH => {
                    return self.operation_at(expr, class_scope, depth + 1);
                }
                _ => return Err(self.error(format!("unsupported operation `{}`", self.text(expr)))),
            },
            _ => return Err(self.error(format!("unsupported operation `{}`", self.text(expr)))),
        };

        match self.target(&call.func, class_scope, 0) {
            Some(Target::External { path, .. }) => {
                if let Some(name) = framework_operation(&path) {
                    return self.framework_operation(name, call, class_scope);
                }
                if let Some(name) = path
                    .strip_prefix(POSTGRES_OPERATIONS)
                    .and_then(|rest| rest.strip_prefix('.'))
                {
                    let (args, kwargs) = self.arguments(call, class_scope)?;
                    let mut operation = CustomOperation::new(
                        ClassRef::new(POSTGRES_OPERATIONS, name),
                        postgres_signature(name),
                        args,
                        kwargs,
                    );
                    operation.class.read_only = true;
                    operation.extension = postgres_extension(name).map(|name| name.map(str::to_owned));
                    return Ok(Operation::Custom(operation));
                }
                self.external_operation(&path, call, class_scope)
            }
            Some(Target::Class { def, qualname }) => {
                let info = self.class_info(def, 0)?;
                let mut class = ClassRef::new(self.index.module.clone(), qualname);
                class.source = info.source;
                class.read_only = self.read_only;
                Ok(Operation::Custom(self.custom_operation(
                    class,
                    &info.parameters,
                    info.extension,
                    call,
                    class_scope,
                )?))
            }
            _ => Err(self.error(format!(
                "cannot resolve operation class `{}`",
                self.text(&call.func)
            ))),
        }
    }

    fn external_operation(&self, path: &str, call: &'a ExprCall, class_scope: bool) -> Result<Operation> {
        let (module, qualname) = self.resolver.split_module_path(path);
        let location = self.resolver.locate(&module);
        let mut class = ClassRef::new(&module, &qualname);
        class.read_only = location.is_read_only();

        let info = match location {
            ModuleLocation::Project(module_path) if module_path.is_file() => {
                inspect_project_class(self.resolver, &module, &qualname, &module_path, 1)?
            }
            _ => ClassInfo::default(),
        };
        // Classes of other modules stay where they are and get imported.
        Ok(Operation::Custom(self.custom_operation(
            class,
            &info.parameters,
            info.extension,
            call,
            class_scope,
        )?))
    }

    fn custom_operation(
        &self,
        class: ClassRef,
        parameters: &[String],
        extension: Option<Option<String>>,
        call: &'a ExprCall,
        class_scope: bool,
    ) -> Result<CustomOperation> {
        let (args, kwargs) = self.arguments(call, class_scope)?;
        let parameters: Vec<&str> = parameters.iter().map(String::as_str).collect();
        let mut operation = CustomOperation::new(class, &parameters, args, kwargs);
        operation.extension = extension;
        if let Some(elidable) = operation
            .kwargs
            .iter()
            .find(|(name, _)| name == "elidable")
            .map(|(_, value)| value.is_truthy())
        {
            operation.elidable = elidable;
        }
        Ok(operation)
    }

    /// Constructor parameters and extension status of an operation class,
    /// following its bases through the module.
    fn class_info(&self, def: &'a StmtClassDef, depth: usize) -> Result<ClassInfo> {
        let mut info = ClassInfo {
            source: Some(definition_source(self.index.source, def.range(), def.range().start())),
            parameters: init_parameters(def).unwrap_or_default(),
            extension: None,
        };
        if depth > MAX_ALIAS_DEPTH {
            return Ok(info);
        }
        let own_parameters = init_parameters(def).is_some();
        for base in def.bases() {
            let inherited = match self.target(base, false, 0) {
                Some(Target::External { path, .. }) => {
                    if let Some(name) = path
                        .strip_prefix(POSTGRES_OPERATIONS)
                        .and_then(|rest| rest.strip_prefix('.'))
                    {
                        ClassInfo {
                            source: None,
                            parameters: postgres_signature(name).iter().map(|p| (*p).to_owned()).collect(),
                            extension: postgres_extension(name).map(|name| name.map(str::to_owned)),
                        }
                    } else {
                        let (module, qualname) = self.resolver.split_module_path(&path);
                        match self.resolver.locate(&module) {
                            ModuleLocation::Project(module_path) if module_path.is_file() => {
                                inspect_project_class(self.resolver, &module, &qualname, &module_path, depth + 1)?
                            }
                            _ => ClassInfo::default(),
                        }
                    }
                }
                Some(Target::Class { def: base, .. }) => self.class_info(base, depth + 1)?,
                _ => ClassInfo::default(),
            };
            if !own_parameters && info.parameters.is_empty() {
                info.parameters = inherited.parameters;
            }
            if info.extension.is_none() {
                info.extension = inherited.extension.map(|name| name.or_else(|| assigned_name(def)));
            }
        }
        Ok(info)
    }

    /// Positional and keyword arguments of a call.
    fn arguments(&self, call: &'a ExprCall, class_scope: bool) -> Result<(Vec<Value>, Vec<(String, Value)>)> {
        if has_starred(&call.arguments.args) {
            return Err(self.error(format!(
                "starred arguments are not supported in `{}`",
                self.text(&call.func)
            )));
        }
        let args = call
            .arguments
            .args
            .iter()
            .map(|arg| self.value(arg, class_scope))
            .collect::<Result<Vec<_>>>()?;
        let mut kwargs = Vec::with_capacity(call.arguments.keywords.len());
        for keyword in &call.arguments.keywords {
            let Some(arg) = &keyword.arg else {
                return Err(self.error(format!(
                    "`**` arguments are not supported in `{}`",
                    self.text(&call.func)
                )));
            };
            kwargs.push((arg.to_string(), self.value(&keyword.value, class_scope)?));
        }
        Ok((args, kwargs))
    }

    /// Argument expressions keyed by parameter name.
    fn bound_arguments(
        &self,
        name: &str,
        call: &'a ExprCall,
    ) -> Result<Vec<(&'static str, &'a Expr)>> {
        let parameters = framework_signature(name).map_or(&[][..], |signature| signature.parameters);
        let mut bound = Vec::new();
        for (position, arg) in call.arguments.args.iter().enumerate() {
            let Some(parameter) = parameters.get(position) else {
                return Err(self.error(format!("too many arguments to {name}")));
            };
            if matches!(arg, Expr::Starred(_)) {
                return Err(self.error(format!("starred arguments are not supported in {name}")));
            }
            bound.push((*parameter, arg));
        }
        for keyword in &call.arguments.keywords {
            let parameter = keyword
                .arg
                .as_ref()
                .and_then(|arg| parameters.iter().find(|parameter| **parameter == arg.as_str()));
            let Some(parameter) = parameter else {
                return Err(self.error(format!(
                    "unsupported argument `{}` to {name}",
                    keyword.arg.as_ref().map_or("**", |arg| arg.as_str())
                )));
            };
            bound.push((*parameter, &keyword.value));
        }
        Ok(bound)
    }

    fn framework_operation(&self, name: &str, call: &'a ExprCall, class_scope: bool) -> Result<Operation> {
        match name {
            "RunPython" => {
                let mut code = None;
                let mut operation = RunPython::new(CallableRef::external(MIGRATIONS_MODULE, "RunPython.noop"));
                for (parameter, expr) in self.bound_arguments(name, call)? {
                    match parameter {
                        "code" => code = Some(self.callable(expr, class_scope)?),
                        "reverse_code" if !matches!(expr, Expr::NoneLiteral(_)) => {
                            operation.reverse_code = Some(self.callable(expr, class_scope)?);
                        }
                        "atomic" => operation.atomic = Some(self.value(expr, class_scope)?),
                        "hints" => operation.hints = Some(self.value(expr, class_scope)?),
                        "elidable" => {
                            operation.elidable = self.value(expr, class_scope)?.is_truthy();
                            operation.explicit_elidable = true;
                        }
                        _ => {}
                    }
                }
                let Some(code) = code else {
                    return Err(self.error("RunPython without `code`"));
                };
                operation.code = code;
                Ok(Operation::RunPython(operation))
            }
            "RunSQL" => {
                let mut sql = None;
                let mut operation = RunSql::new(Value::None);
                for (parameter, expr) in self.bound_arguments(name, call)? {
                    match parameter {
                        "sql" => sql = Some(self.value(expr, class_scope)?),
                        "reverse_sql" if !matches!(expr, Expr::NoneLiteral(_)) => {
                            operation.reverse_sql = Some(self.value(expr, class_scope)?);
                        }
                        "state_operations" => {
                            operation.state_operations = self.operations(expr, class_scope)?;
                        }
                        "hints" => operation.hints = Some(self.value(expr, class_scope)?),
                        "elidable" => {
                            operation.elidable = self.value(expr, class_scope)?.is_truthy();
                            operation.explicit_elidable = true;
                        }
                        _ => {}
                    }
                }
                let Some(sql) = sql else {
                    return Err(self.error("RunSQL without `sql`"));
                };
                operation.sql = sql;
                Ok(Operation::RunSql(operation))
            }
            "SeparateDatabaseAndState" => {
                let mut operation = SeparateDatabaseAndState::default();
                for (parameter, expr) in self.bound_arguments(name, call)? {
                    match parameter {
                        "database_operations" => {
                            operation.database_operations = self.operations(expr, class_scope)?;
                        }
                        "state_operations" => {
                            operation.state_operations = self.operations(expr, class_scope)?;
                        }
                        _ => {}
                    }
                }
                Ok(Operation::SeparateDatabaseAndState(operation))
            }
            _ => {
                let (args, kwargs) = self.arguments(call, class_scope)?;
                Ok(Operation::Schema(SchemaOperation::new(name, args, kwargs)))
            }
        }
    }

    /// Converts a list or tuple of operations.
    pub(crate) fn operations(&self, expr: &'a Expr, class_scope: bool) -> Result<Vec<Operation>> {
        let elements = match expr {
            Expr::List(list) => &list.elts,
            Expr::Tuple(tuple) => &tuple.elts,
            Expr::Name(_) => {
                return match self.target(expr, class_scope, 0) {
                    Some(Target::Expr { expr, class_scope }) => self.operations(expr, class_scope),
                    _ => Err(self.error(format!("unsupported operations `{}`", self.text(expr)))),
                };
            }
            _ => return Err(self.error(format!("unsupported operations `{}`", self.text(expr)))),
        };
        elements
            .iter()
            .map(|element| self.operation(element, class_scope))
            .collect()
    }

    /// Converts one entry of a `dependencies` list.
    pub(crate) fn dependency(&self, expr: &'a Expr, class_scope: bool) -> Result<Dependency> {
        match expr {
            Expr::Call(call) => {
                let is_swappable = matches!(
                    self.target(&call.func, class_scope, 0),
                    Some(Target::External { path, .. }) if path.ends_with("swappable_dependency")
                );
                let argument = call.arguments.args.first().or_else(|| {
                    call.arguments
                        .keywords
                        .iter()
                        .find(|keyword| keyword.arg.as_ref().is_some_and(|arg| arg.as_str() == "value"))
                        .map(|keyword| &keyword.value)
                });
                match (is_swappable, argument) {
                    (true, Some(argument)) => match self.value(argument, class_scope)? {
                        Value::Setting(setting) => Ok(Dependency::Setting(setting)),
                        Value::Str(model) => {
                            let app_label = model.split('.').next().unwrap_or_default();
                            Ok(Dependency::First(app_label.to_owned()))
                        }
                        _ => Err(self.error(format!("unsupported dependency `{}`", self.text(expr)))),
                    },
                    _ => Err(self.error(format!("unsupported dependency `{}`", self.text(expr)))),
                }
            }
            _ => {
                let (first, second) = self.pair(expr, class_scope)?;
                Ok(Dependency::from_pair(&first, &second))
            }
        }
    }

    /// Converts one entry of a `replaces` list.
    pub(crate) fn node_key(&self, expr: &'a Expr, class_scope: bool) -> Result<NodeKey> {
        let (app_label, name) = self.pair(expr, class_scope)?;
        Ok(NodeKey::new(app_label, name))
    }

    fn pair(&self, expr: &'a Expr, class_scope: bool) -> Result<(String, String)> {
        match self.value(expr, class_scope)? {
            Value::Tuple(items) | Value::List(items) => match items.as_slice() {
                [Value::Str(first), Value::Str(second)] => Ok((first.clone(), second.clone())),
                _ => Err(self.error(format!("expected a pair of strings, got `{}`", self.text(expr)))),
            },
            _ => Err(self.error(format!("expected a pair of strings, got `{}`", self.text(expr)))),
        }
    }

    /// Elements of a list or tuple assigned to a class attribute.
    pub(crate) fn elements(&self, expr: &'a Expr, class_scope: bool) -> Result<&'a [Expr]> {
        match expr {
            Expr::List(list) => Ok(list.elts.as_slice()),
            Expr::Tuple(tuple) => Ok(tuple.elts.as_slice()),
            Expr::Name(_) => match self.target(expr, class_scope, 0) {
                Some(Target::Expr { expr, class_scope }) => self.elements(expr, class_scope),
                _ => Err(self.error(format!("expected a list, got `{}`", self.text(expr)))),
            },
            _ => Err(self.error(format!("expected a list, got `{}`", self.text(expr)))),
        }
    }
}

/// Framework operation name for paths such as `django.db.migrations.AddField`
/// or `django.db.migrations.operations.special.RunPython`.
fn framework_operation(path: &str) -> Option<&str> {
    let rest = path.strip_prefix(MIGRATIONS_MODULE)?.strip_prefix('.')?;
    let name = rest.rsplit('.').next()?;
    framework_signature(name).map(|_| name)
}

fn has_starred(elements: &[Expr]) -> bool {
    elements.iter().any(|element| matches!(element, Expr::Starred(_)))
}

fn function_kind(def: &StmtFunctionDef, nested: bool) -> CallableKind {
    for decorator in &def.decorator_list {
        if let Expr::Name(name) = &decorator.expression {
            match name.id.as_str() {
                "staticmethod" => return CallableKind::StaticMethod,
                "classmethod" => return CallableKind::ClassMethod,
                _ => {}
            }
        }
    }
    let parameters = &def.parameters;
    let first = parameters
        .posonlyargs
        .iter()
        .chain(&parameters.args)
        .next()
        .map(|parameter| parameter.parameter.name.as_str());
    if nested && first == Some("self") {
        CallableKind::InstanceMethod
    } else {
        CallableKind::Function
    }
}

/// Parameters of a class's own `__init__`, without `self`.
fn init_parameters(def: &StmtClassDef) -> Option<Vec<String>> {
    def.body.iter().find_map(|stmt| match stmt {
        Stmt::FunctionDef(function) if function.name.as_str() == "__init__" => {
            let parameters = &function.parameters;
            Some(
                parameters
                    .posonlyargs
                    .iter()
                    .chain(&parameters.args)
                    .skip(1)
                    .chain(&parameters.kwonlyargs)
                    .map(|parameter| parameter.parameter.name.to_string())
                    .collect(),
            )
        }
        _ => None,
    })
}

/// `self.name = "<extension>"` in a class's `__init__`.
fn assigned_name(def: &StmtClassDef) -> Option<String> {
    let init = def.body.iter().find_map(|stmt| match stmt {
        Stmt::FunctionDef(function) if function.name.as_str() == "__init__" => Some(function),
        _ => None,
    })?;
    init.body.iter().find_map(|stmt| {
        let Stmt::Assign(assign) = stmt else {
            return None;
        };
        let assigns_name = assign.targets.iter().any(|target| {
            matches!(target, Expr::Attribute(attribute)
                if attribute.attr.as_str() == "name"
                    && matches!(attribute.value.as_ref(), Expr::Name(name) if name.id.as_str() == "self"))
        });
        match assign.value.as_ref() {
            Expr::StringLiteral(literal) if assigns_name => Some(literal.value.to_str().to_owned()),
            _ => None,
        }
    })
}

/// Reads a class defined in a project module.
fn inspect_project_class(
    resolver: &ModuleResolver,
    module: &str,
    qualname: &str,
    path: &Path,
    depth: usize,
) -> Result<ClassInfo> {
    let source = fs::read_to_string(path).map_err(|error| SquashError::io(path, error))?;
    let parsed = parse_module(&source).map_err(|error| SquashError::Parse {
        path: path.to_path_buf(),
        message: error.to_string(),
    })?;
    let index = ModuleIndex::new(module, &source, parsed.syntax());
    let stylist = Stylist::from_tokens(parsed.tokens(), &source);
    let converter = Converter::new(&index, resolver, &stylist, path, false);
    match index.lookup(qualname, false) {
        Some(Binding::Class(def)) => converter.class_info(def, depth),
        _ => Ok(ClassInfo::default()),
    }
}

#[derive(Debug, Default)]
struct NameCollector {
    names: Vec<String>,
}

impl<'a> Visitor<'a> for NameCollector {
    fn visit_expr(&mut self, expr: &'a Expr) {
        if let Expr::Name(name) = expr
            && !self.names.iter().any(|seen| seen == name.id.as_str())
        {
            self.names.push(name.id.to_string());
        }
        walk_expr(self, expr);
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;
    use ruff_python_parser::parse_module;

    use super::*;
    use crate::config::Config;

    const SOURCE: &str = r#"import django.db.models.deletion
from django.conf import settings
from django.db import migrations, models

noop = migrations.RunPython.noop
FORWARD_SQL = "select 1"


def forwards(apps, schema_editor):
    pass


class Migration(migrations.Migration):
    @staticmethod
    def helper(apps, schema_editor):
        pass

    def method(self, apps, schema_editor):
        pass

    dependencies = [
        ("app", "0001_initial"),
        migrations.swappable_dependency(settings.AUTH_USER_MODEL),
    ]

    operations = [
        migrations.RunPython(forwards, noop, elidable=True),
        migrations.RunPython(helper),
        migrations.RunPython(method),
        migrations.RunSQL(FORWARD_SQL, migrations.RunSQL.noop),
        migrations.AddField(
            model_name="person",
            name="owner",
            field=models.ForeignKey(
                on_delete=django.db.models.deletion.CASCADE,
                to=settings.AUTH_USER_MODEL,
                default=-1,
            ),
        ),
    ]
"#;

    fn with_converter<T>(f: impl for<'c> FnOnce(&Converter<'c>, &'c StmtClassDef) -> T) -> T {
        let parsed = parse_module(SOURCE).expect("valid source");
        let index = ModuleIndex::new("app.migrations.0002_auto", SOURCE, parsed.syntax());
        let stylist = Stylist::from_tokens(parsed.tokens(), SOURCE);
        let resolver = ModuleResolver::new(Config {
            project_root: PathBuf::from("/nonexistent"),
            ..Config::default()
        });
        let path = PathBuf::from("app/migrations/0002_auto.py");
        let converter = Converter::new(&index, &resolver, &stylist, &path, false);
        let migration = index.migration_class.expect("migration class");
        f(&converter, migration)
    }

    fn attribute<'a>(class: &'a StmtClassDef, name: &str) -> &'a Expr {
        class
            .body
            .iter()
            .find_map(|stmt| match stmt {
                Stmt::Assign(assign)
                    if matches!(&assign.targets[0], Expr::Name(target) if target.id.as_str() == name) =>
                {
                    Some(assign.value.as_ref())
                }
                _ => None,
            })
            .expect("attribute is assigned")
    }

    #[test]
    fn test_dependencies() -> Result<()> {
        with_converter(|converter, class| {
            let dependencies = converter
                .elements(attribute(class, "dependencies"), true)?
                .iter()
                .map(|expr| converter.dependency(expr, true))
                .collect::<Result<Vec<_>>>()?;
            assert_eq!(
                dependencies,
                vec![
                    Dependency::Node(NodeKey::new("app", "0001_initial")),
                    Dependency::Setting("AUTH_USER_MODEL".to_owned()),
                ]
            );
            Ok(())
        })
    }

    #[test]
    fn test_operations() -> Result<()> {
        with_converter(|converter, class| {
            let operations = converter.operations(attribute(class, "operations"), true)?;
            assert_eq!(operations.len(), 5);

            let Operation::RunPython(forwards) = &operations[0] else {
                panic!("expected RunPython");
            };
            assert_eq!(forwards.code.qualname, "forwards");
            assert!(forwards.code.is_relocatable());
            assert!(forwards.elidable);
            let reverse = forwards.reverse_code.as_ref().expect("reverse code");
            assert_eq!(reverse.module, "django.db.migrations");
            assert_eq!(reverse.qualname, "RunPython.noop");

            let Operation::RunPython(helper) = &operations[1] else {
                panic!("expected RunPython");
            };
            assert_eq!(helper.code.qualname, "Migration.helper");
            assert_eq!(helper.code.kind, CallableKind::StaticMethod);
            assert!(helper.code.in_migration_class);
            assert_eq!(
                helper.code.source.as_deref(),
                Some("def helper(apps, schema_editor):\n    pass\n")
            );

            let Operation::RunPython(method) = &operations[2] else {
                panic!("expected RunPython");
            };
            assert_eq!(method.code.kind, CallableKind::InstanceMethod);

            let Operation::RunSql(run_sql) = &operations[3] else {
                panic!("expected RunSQL");
            };
            assert_eq!(run_sql.sql, Value::str("select 1"));
            assert_eq!(run_sql.reverse_sql, Some(Value::str("")));

            let Operation::Schema(add_field) = &operations[4] else {
                panic!("expected AddField");
            };
            let Some(Value::Call { func, kwargs, .. }) = add_field.kwarg("field") else {
                panic!("expected a field call");
            };
            assert_eq!(func.text, "models.ForeignKey");
            assert!(func.imports.contains(MODELS_IMPORT));
            assert_eq!(kwargs[0].1, Value::Reference(Reference::new("models.deletion.CASCADE").with_import(MODELS_IMPORT)));
            assert_eq!(kwargs[1].1, Value::Setting("AUTH_USER_MODEL".to_owned()));
            assert_eq!(kwargs[2].1, Value::Literal("-1".to_owned()));
            Ok(())
        })
    }

    #[test]
    fn test_unresolved_operation_is_rejected() {
        let source = "from django.db import migrations\n\nclass Migration(migrations.Migration):\n    operations = [Unknown()]\n";
        let parsed = parse_module(source).expect("valid source");
        let index = ModuleIndex::new("app.migrations.0001_initial", source, parsed.syntax());
        let stylist = Stylist::from_tokens(parsed.tokens(), source);
        let resolver = ModuleResolver::new(Config::default());
        let path = PathBuf::from("0001_initial.py");
        let converter = Converter::new(&index, &resolver, &stylist, &path, false);
        let class = index.migration_class.expect("migration class");
        let result = converter.operations(attribute(class, "operations"), true);
        assert!(matches!(result, Err(SquashError::BadMigration { .. })));
    }
}
