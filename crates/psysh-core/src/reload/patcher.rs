//! Code patching capability.
//!
//! Live reloading needs a runtime whose function, method and constant tables
//! can be swapped while the session is running. [`CodePatcher`] is that
//! capability; runtimes without it hand out [`UnsupportedPatcher`].

use std::fmt;
use std::rc::Rc;

use thiserror::Error;

use crate::runtime::UserFunction;
use crate::syntax::NameContext;
use crate::syntax::ast::{ClassKind, Expr};
use crate::value::Value;

/// Replacement body installed by a patch.
pub type Callable = Rc<UserFunction>;

/// Why a single patch could not be applied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("code patching is not supported by this runtime")]
    Unsupported,

    #[error("class {0} does not exist")]
    UnknownClass(String),

    #[error("function {0}() does not exist")]
    UnknownFunction(String),

    #[error("{0} is already defined")]
    AlreadyDefined(String),

    #[error("cannot evaluate constant expression: {0}")]
    NotConstant(String),
}

/// Runtime view of a class, used to detect structural changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassShape {
    pub kind: ClassKind,
    pub name: String,
    pub parent: Option<String>,
    pub interfaces: Vec<String>,
    /// Property names, including inherited ones.
    pub properties: Vec<String>,
    /// Lowercased method names, including inherited and patched-in ones.
    pub methods: Vec<String>,
}

impl ClassShape {
    pub fn has_property(&self, name: &str) -> bool {
        self.properties.iter().any(|p| p == name)
    }

    pub fn has_method(&self, name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        self.methods.iter().any(|m| *m == lower)
    }
}

/// Hot-swappable dispatch tables of a running program.
pub trait CodePatcher {
    /// Whether this runtime can patch code at all.
    fn is_supported(&self) -> bool;

    fn class_shape(&self, name: &str) -> Option<ClassShape>;

    fn function_exists(&self, name: &str) -> bool;

    /// Evaluate a constant initializer without running user code.
    fn evaluate_constant(&self, expr: &Expr, names: &NameContext) -> Result<Value, PatchError>;

    /// Install `body` for `class::method`, taking precedence over the
    /// declared method. New method names are accepted.
    fn override_method(
        &mut self,
        class: &str,
        method: &str,
        body: Callable,
    ) -> Result<(), PatchError>;

    /// Install `body` for an existing function.
    fn override_function(&mut self, name: &str, body: Callable) -> Result<(), PatchError>;

    /// Define a function that does not exist yet.
    fn define_function(&mut self, name: &str, body: Callable) -> Result<(), PatchError>;

    /// Set a global constant (`class` is `None`) or a class constant.
    fn redefine_constant(
        &mut self,
        class: Option<&str>,
        name: &str,
        value: Value,
    ) -> Result<(), PatchError>;

    /// Drop an installed override. Returns whether one existed.
    fn unset_override(&mut self, class: Option<&str>, name: &str) -> Result<bool, PatchError>;

    /// Remove a constant. Returns whether it existed.
    fn undefine_constant(&mut self, class: Option<&str>, name: &str) -> Result<bool, PatchError>;
}

/// Patcher for runtimes without hot-swappable dispatch tables.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedPatcher;

impl CodePatcher for UnsupportedPatcher {
    fn is_supported(&self) -> bool {
        false
    }

    fn class_shape(&self, _name: &str) -> Option<ClassShape> {
        None
    }

    fn function_exists(&self, _name: &str) -> bool {
        false
    }

    fn evaluate_constant(&self, _expr: &Expr, _names: &NameContext) -> Result<Value, PatchError> {
        Err(PatchError::Unsupported)
    }

    fn override_method(
        &mut self,
        _class: &str,
        _method: &str,
        _body: Callable,
    ) -> Result<(), PatchError> {
        Err(PatchError::Unsupported)
    }

    fn override_function(&mut self, _name: &str, _body: Callable) -> Result<(), PatchError> {
        Err(PatchError::Unsupported)
    }

    fn define_function(&mut self, _name: &str, _body: Callable) -> Result<(), PatchError> {
        Err(PatchError::Unsupported)
    }

    fn redefine_constant(
        &mut self,
        _class: Option<&str>,
        _name: &str,
        _value: Value,
    ) -> Result<(), PatchError> {
        Err(PatchError::Unsupported)
    }

    fn unset_override(&mut self, _class: Option<&str>, _name: &str) -> Result<bool, PatchError> {
        Err(PatchError::Unsupported)
    }

    fn undefine_constant(&mut self, _class: Option<&str>, _name: &str) -> Result<bool, PatchError> {
        Err(PatchError::Unsupported)
    }
}

/// One definition a reload pass replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedPatch {
    Method { class: String, method: String },
    Function { name: String, defined: bool },
    Constant { class: Option<String>, name: String },
}

impl fmt::Display for AppliedPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppliedPatch::Method { class, method } => write!(f, "{}::{}()", class, method),
            AppliedPatch::Function { name, .. } => write!(f, "{}()", name),
            AppliedPatch::Constant { class: Some(class), name } => write!(f, "{}::{}", class, name),
            AppliedPatch::Constant { class: None, name } => write!(f, "{}", name),
        }
    }
}

/// Outcome of reloading one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
    pub warnings: Vec<String>,
    /// Some definitions were skipped and can be forced with `yolo`.
    pub has_skips: bool,
    pub applied: Vec<AppliedPatch>,
}

impl PatchReport {
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_patcher_rejects_everything() {
        let mut patcher = UnsupportedPatcher;
        assert!(!patcher.is_supported());
        assert_eq!(
            patcher.redefine_constant(None, "DEBUG", Value::Bool(true)),
            Err(PatchError::Unsupported)
        );
        assert_eq!(patcher.unset_override(None, "greet"), Err(PatchError::Unsupported));
        assert!(
            patcher
                .evaluate_constant(&Expr::Int(1), &NameContext::new())
                .is_err()
        );
    }

    #[test]
    fn test_shape_lookups_are_case_aware() {
        let shape = ClassShape {
            kind: ClassKind::Class,
            name: "Greeter".into(),
            parent: None,
            interfaces: vec![],
            properties: vec!["name".into()],
            methods: vec!["greet".into()],
        };
        assert!(shape.has_method("Greet"));
        assert!(shape.has_property("name"));
        assert!(!shape.has_property("Name"));
    }

    #[test]
    fn test_applied_patch_display() {
        let patch = AppliedPatch::Method {
            class: "Greeter".into(),
            method: "greet".into(),
        };
        assert_eq!(patch.to_string(), "Greeter::greet()");
    }
}
