//! User-defined callables.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;

use crate::syntax::NameContext;
use crate::syntax::ast::{ClosureDecl, FunctionDecl, MethodDecl, Param, Stmt, Visibility};
use crate::value::Value;

/// A compiled function, method or closure body.
///
/// Each instance owns its `static` locals, so installing a freshly built
/// replacement resets them.
pub struct UserFunction {
    /// Display name: `greet`, `App\Greeter::hello` or `{closure}`.
    pub name: String,
    pub params: Vec<Param>,
    pub return_type: Option<String>,
    pub body: Rc<Vec<Stmt>>,
    /// Declaring class for methods and closures created inside methods.
    pub class: Option<String>,
    pub is_static: bool,
    pub is_abstract: bool,
    pub visibility: Visibility,
    /// Closure `use (...)` list.
    pub uses: Vec<String>,
    pub is_arrow: bool,
    /// Namespace and imports the body was written under.
    pub names: Rc<NameContext>,
    pub file: Option<PathBuf>,
    pub statics: RefCell<BTreeMap<String, Value>>,
}

impl UserFunction {
    pub fn from_function(
        decl: &FunctionDecl,
        qualified_name: String,
        names: Rc<NameContext>,
        file: Option<PathBuf>,
    ) -> Self {
        Self {
            name: qualified_name,
            params: decl.params.clone(),
            return_type: decl.return_type.clone(),
            body: decl.body.clone(),
            class: None,
            is_static: false,
            is_abstract: false,
            visibility: Visibility::Public,
            uses: Vec::new(),
            is_arrow: false,
            names,
            file,
            statics: RefCell::new(BTreeMap::new()),
        }
    }

    pub fn from_method(
        decl: &MethodDecl,
        class: &str,
        names: Rc<NameContext>,
        file: Option<PathBuf>,
    ) -> Self {
        Self {
            name: format!("{}::{}", class, decl.name),
            params: decl.params.clone(),
            return_type: decl.return_type.clone(),
            body: decl.body.clone().unwrap_or_default(),
            class: Some(class.to_string()),
            is_static: decl.is_static,
            is_abstract: decl.is_abstract || decl.body.is_none(),
            visibility: decl.visibility,
            uses: Vec::new(),
            is_arrow: false,
            names,
            file,
            statics: RefCell::new(BTreeMap::new()),
        }
    }

    pub fn from_closure(
        decl: &ClosureDecl,
        class: Option<String>,
        names: Rc<NameContext>,
        file: Option<PathBuf>,
    ) -> Self {
        Self {
            name: "{closure}".to_string(),
            params: decl.params.clone(),
            return_type: decl.return_type.clone(),
            body: decl.body.clone(),
            class,
            is_static: decl.is_static,
            is_abstract: false,
            visibility: Visibility::Public,
            uses: decl.uses.clone(),
            is_arrow: decl.is_arrow,
            names,
            file,
            statics: RefCell::new(BTreeMap::new()),
        }
    }

    /// Copy of this method rebound to another class (trait imports).
    pub fn rebind(&self, class: &str) -> Self {
        let short = self.short_name();
        Self {
            name: format!("{}::{}", class, short),
            params: self.params.clone(),
            return_type: self.return_type.clone(),
            body: self.body.clone(),
            class: Some(class.to_string()),
            is_static: self.is_static,
            is_abstract: self.is_abstract,
            visibility: self.visibility,
            uses: self.uses.clone(),
            is_arrow: self.is_arrow,
            names: self.names.clone(),
            file: self.file.clone(),
            statics: RefCell::new(BTreeMap::new()),
        }
    }

    /// Name without the class prefix.
    pub fn short_name(&self) -> &str {
        match self.name.rsplit_once("::") {
            Some((_, method)) => method,
            None => &self.name,
        }
    }

    /// Number of parameters without a default value.
    pub fn required_params(&self) -> usize {
        self.params
            .iter()
            .take_while(|p| p.default.is_none() && !p.variadic)
            .count()
    }

    /// `name($a, $b = ..., ...$rest)`
    pub fn signature(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| {
                let mut out = String::new();
                if let Some(ty) = &p.type_hint {
                    out.push_str(ty);
                    out.push(' ');
                }
                if p.by_ref {
                    out.push('&');
                }
                if p.variadic {
                    out.push_str("...");
                }
                out.push('$');
                out.push_str(&p.name);
                if p.default.is_some() {
                    out.push_str(" = ...");
                }
                out
            })
            .collect();
        let mut sig = format!("{}({})", self.name, params.join(", "));
        if let Some(ret) = &self.return_type {
            sig.push_str(": ");
            sig.push_str(ret);
        }
        sig
    }
}

impl fmt::Debug for UserFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserFunction")
            .field("name", &self.name)
            .field("params", &self.params.len())
            .field("file", &self.file)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::{StmtKind, parse};

    fn function(src: &str) -> UserFunction {
        let stmt = parse(src).unwrap().remove(0);
        let StmtKind::Function(decl) = stmt.kind else {
            panic!("expected function");
        };
        UserFunction::from_function(&decl, decl.name.clone(), Rc::default(), None)
    }

    #[test]
    fn test_signature() {
        let f = function("function greet(string $name, $greeting = 'hi', ...$rest): string {}");
        assert_eq!(
            f.signature(),
            "greet(string $name, $greeting = ..., ...$rest): string"
        );
        assert_eq!(f.required_params(), 1);
    }

    #[test]
    fn test_rebind_resets_statics() {
        let f = function("function counter() { static $n = 0; }");
        f.statics.borrow_mut().insert("n".into(), Value::Int(3));
        let bound = f.rebind("Widget");
        assert_eq!(bound.name, "Widget::counter");
        assert!(bound.statics.borrow().is_empty());
    }
}
