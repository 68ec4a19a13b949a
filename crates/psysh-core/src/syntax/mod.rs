//! Lexer, syntax tree and parser for the scripting language, plus the
//! namespace resolution rules shared by the interpreter and the reloader.

pub mod ast;
pub mod lexer;
pub mod parser;

pub use ast::{ClassDecl, ClassKind, ClassMember, ControlFlow, Expr, Span, Stmt, StmtKind};
pub use parser::{parse, parse_expression};

use rustc_hash::FxHashMap;

/// Namespace and `use` imports in effect at some point of a file.
#[derive(Debug, Clone, Default)]
pub struct NameContext {
    namespace: Option<String>,
    imports: FxHashMap<String, String>,
}

impl NameContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Enter a namespace. Imports do not carry across namespaces.
    pub fn enter_namespace(&mut self, name: Option<&str>) {
        self.namespace = name
            .map(|n| n.trim_start_matches('\\').to_string())
            .filter(|n| !n.is_empty());
        self.imports.clear();
    }

    pub fn add_import(&mut self, item: &ast::UseItem) {
        self.imports
            .insert(item.visible_name().to_ascii_lowercase(), item.name.clone());
    }

    /// Fully-qualified name for a symbol declared in the current namespace.
    pub fn qualify(&self, name: &str) -> String {
        if let Some(stripped) = name.strip_prefix('\\') {
            return stripped.to_string();
        }
        match &self.namespace {
            Some(ns) => format!("{}\\{}", ns, name),
            None => name.to_string(),
        }
    }

    /// Resolve a class reference through imports and the current namespace.
    /// `self`, `static` and `parent` are returned unchanged.
    pub fn resolve_class(&self, name: &str) -> String {
        if let Some(stripped) = name.strip_prefix('\\') {
            return stripped.to_string();
        }
        let lower = name.to_ascii_lowercase();
        if matches!(lower.as_str(), "self" | "static" | "parent") {
            return name.to_string();
        }
        let (head, tail) = match name.split_once('\\') {
            Some((head, tail)) => (head, Some(tail)),
            None => (name, None),
        };
        if let Some(imported) = self.imports.get(&head.to_ascii_lowercase()) {
            return match tail {
                Some(tail) => format!("{}\\{}", imported, tail),
                None => imported.clone(),
            };
        }
        self.qualify(name)
    }

    /// Candidate names for a function or constant reference: the namespaced
    /// name first, then the global fallback for unqualified names.
    pub fn resolve_function(&self, name: &str) -> Vec<String> {
        if let Some(stripped) = name.strip_prefix('\\') {
            return vec![stripped.to_string()];
        }
        if name.contains('\\') {
            return vec![self.resolve_class(name)];
        }
        match &self.namespace {
            Some(ns) => vec![format!("{}\\{}", ns, name), name.to_string()],
            None => vec![name.to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ast::UseItem;

    #[test]
    fn test_qualify_and_resolve() {
        let mut ctx = NameContext::new();
        assert_eq!(ctx.qualify("greet"), "greet");

        ctx.enter_namespace(Some("App"));
        ctx.add_import(&UseItem {
            name: r"Vendor\Lib\Client".into(),
            alias: None,
        });
        assert_eq!(ctx.qualify("greet"), r"App\greet");
        assert_eq!(ctx.resolve_class("Client"), r"Vendor\Lib\Client");
        assert_eq!(ctx.resolve_class(r"\Exception"), "Exception");
        assert_eq!(ctx.resolve_class("Model"), r"App\Model");
        assert_eq!(ctx.resolve_function("strlen"), vec![r"App\strlen", "strlen"]);
    }

    #[test]
    fn test_namespace_resets_imports() {
        let mut ctx = NameContext::new();
        ctx.add_import(&UseItem {
            name: r"Vendor\Thing".into(),
            alias: Some("T".into()),
        });
        assert_eq!(ctx.resolve_class("T"), r"Vendor\Thing");
        ctx.enter_namespace(None);
        assert_eq!(ctx.resolve_class("T"), "T");
    }
}
