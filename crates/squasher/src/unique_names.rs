//! Collision-free names for functions and constants relocated into a
//! generated migration module.

use std::{fmt, rc::Rc};

use cow_utils::CowUtils;
use log::trace;
use rustc_hash::FxHashMap;

use crate::{
    definitions::{CallableKind, CallableRef, DefinitionId},
    error::NamingError,
    source_utils::normalize_function_name,
};

/// What a renaming policy knows about the name being allocated.
///
/// The allocator owner updates it while walking nodes, so a policy can refer
/// to the node a function was lifted from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamingContext {
    pub app_label: Option<String>,
    /// Node the name is allocated for.
    pub node: Option<String>,
    /// Superseded node the callable was copied from.
    pub original_node: Option<String>,
    /// Description of the operation being named.
    pub operation: Option<String>,
}

/// Transforms a base function name before it is made unique.
pub trait RenamePolicy: fmt::Debug {
    fn rename(&self, name: &str, context: &NamingContext) -> String;
}

/// Leaves names untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepName;

impl RenamePolicy for KeepName {
    fn rename(&self, name: &str, _context: &NamingContext) -> String {
        name.to_owned()
    }
}

/// Renames through a template such as `"{original_node}_{name}"`.
///
/// Supported placeholders are `{name}`, `{app}`, `{node}` and
/// `{original_node}`. The result is normalized into a valid identifier.
#[derive(Debug, Clone)]
pub struct TemplateRenamePolicy {
    template: String,
}

impl TemplateRenamePolicy {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

impl RenamePolicy for TemplateRenamePolicy {
    fn rename(&self, name: &str, context: &NamingContext) -> String {
        let rendered = self.template.cow_replace("{name}", name);
        let rendered =
            rendered.cow_replace("{app}", context.app_label.as_deref().unwrap_or_default());
        let rendered = rendered.cow_replace("{node}", context.node.as_deref().unwrap_or_default());
        let rendered = rendered.cow_replace(
            "{original_node}",
            context.original_node.as_deref().unwrap_or_default(),
        );
        normalize_function_name(&rendered)
    }
}

/// Allocator of unique symbol names within one generated module.
///
/// Every allocated name is remembered; a callable asked for twice gets the
/// same answer, keyed by the identity of its definition.
#[derive(Debug)]
pub struct UniqueVariableName {
    names: FxHashMap<String, usize>,
    functions: FxHashMap<DefinitionId, String>,
    context: NamingContext,
    policy: Rc<dyn RenamePolicy>,
}

impl Default for UniqueVariableName {
    fn default() -> Self {
        Self::new()
    }
}

impl UniqueVariableName {
    pub fn new() -> Self {
        Self::with_policy(Rc::new(KeepName))
    }

    pub fn with_policy(policy: Rc<dyn RenamePolicy>) -> Self {
        Self {
            names: FxHashMap::default(),
            functions: FxHashMap::default(),
            context: NamingContext::default(),
            policy,
        }
    }

    pub fn context(&self) -> &NamingContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut NamingContext {
        &mut self.context
    }

    /// Returns `name` the first time it is seen, `name_2`, `name_3`, ... after.
    pub fn allocate(&mut self, name: &str) -> String {
        self.uniq(name.to_owned(), name)
    }

    /// Like [`allocate`](Self::allocate) but always numbered, starting at `name_1`.
    pub fn allocate_numbered(&mut self, name: &str) -> String {
        self.uniq(format!("{name}_1"), name)
    }

    /// Marks a name as taken without allocating it.
    pub fn reserve(&mut self, name: &str) {
        *self.names.entry(name.to_owned()).or_insert(0) += 1;
    }

    /// Records a callable that already carries its final name.
    pub fn remember(&mut self, callable: &CallableRef) {
        self.reserve(&callable.qualname);
        self.functions
            .insert(callable.id(), callable.qualname.clone());
    }

    /// Allocates the name a relocated callable will be emitted under.
    pub fn function(&mut self, callable: &CallableRef) -> Result<String, NamingError> {
        let display = format!("{}.{}", callable.module, callable.original_qualname);
        match callable.kind {
            CallableKind::NotCallable => return Err(NamingError::NotCallable(display)),
            CallableKind::Lambda => return Err(NamingError::Lambda(display)),
            CallableKind::ClassMethod => return Err(NamingError::BoundMethod(display)),
            CallableKind::InstanceMethod => return Err(NamingError::InstanceMethod(display)),
            CallableKind::Function | CallableKind::StaticMethod => {}
        }

        if let Some(existing) = self.functions.get(&callable.id()) {
            return Ok(existing.clone());
        }

        let base = if callable.in_migration_class {
            callable.original_name()
        } else {
            callable.original_qualname.as_str()
        };
        let base = self.policy.rename(base, &self.context);
        let name = self.uniq(base.clone(), &base);
        trace!("Allocated {name} for {display}");
        self.functions.insert(callable.id(), name.clone());
        Ok(name)
    }

    fn uniq(&mut self, mut name: String, original: &str) -> String {
        let mut suffix = 2;
        loop {
            let count = self.names.entry(name.clone()).or_insert(0);
            if *count == 0 {
                *count += 1;
                return name;
            }
            name = format!("{original}_{suffix}");
            suffix += 1;
        }
    }
}
