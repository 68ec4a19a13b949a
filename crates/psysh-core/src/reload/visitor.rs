//! Reload pass over a modified file.
//!
//! [`ReloadVisitor`] walks the syntax tree of a file that changed on disk and
//! patches the running program through a [`CodePatcher`]: function and
//! method bodies are swapped, constants are redefined, and everything that
//! cannot be patched in place is reported as a warning.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::debug;

use super::patcher::{AppliedPatch, ClassShape, CodePatcher, PatchReport};
use crate::runtime::{UserFunction, is_builtin_throwable};
use crate::syntax::NameContext;
use crate::syntax::ast::{
    ClassDecl, ClassMember, ConstDecl, ControlFlow, FunctionDecl, MethodDecl, Stmt, StmtKind,
};

const SNIPPET_LIMIT: usize = 50;

/// Applies one file's definitions to the running program.
pub struct ReloadVisitor<'a> {
    patcher: &'a mut dyn CodePatcher,
    source: &'a str,
    file: PathBuf,
    force: bool,
    names: NameContext,
    report: PatchReport,
}

impl<'a> ReloadVisitor<'a> {
    /// With `force` set, definitions inside top-level conditionals are
    /// reloaded instead of skipped.
    pub fn new(
        patcher: &'a mut dyn CodePatcher,
        file: &Path,
        source: &'a str,
        force: bool,
    ) -> Self {
        Self {
            patcher,
            source,
            file: file.to_path_buf(),
            force,
            names: NameContext::new(),
            report: PatchReport::default(),
        }
    }

    pub fn visit(mut self, stmts: &[Stmt]) -> PatchReport {
        for stmt in stmts {
            self.visit_stmt(stmt, None);
        }
        self.report
    }

    /// `conditional` names the top-level control structure enclosing `stmt`.
    fn visit_stmt(&mut self, stmt: &Stmt, conditional: Option<&'static str>) {
        match &stmt.kind {
            StmtKind::Namespace { name, body } => {
                self.names.enter_namespace(name.as_deref());
                if let Some(body) = body {
                    for stmt in body {
                        self.visit_stmt(stmt, conditional);
                    }
                }
            }
            StmtKind::Use(items) => {
                for item in items {
                    self.names.add_import(item);
                }
            }
            StmtKind::Class(decl) => self.visit_class(decl),
            StmtKind::Function(decl) => self.visit_function(decl, conditional),
            StmtKind::Const(decl) => self.visit_global_constants(decl, conditional),
            StmtKind::Control(flow) => match conditional {
                Some(_) => self.visit_bodies(flow, conditional),
                None if contains_declarations(flow) => self.visit_bodies(flow, Some(flow.kind())),
                None => self.warn(format!("Not re-run: {} (...) {{ ... }}", flow.kind())),
            },
            StmtKind::Block(stmts) => {
                for stmt in stmts {
                    self.visit_stmt(stmt, conditional);
                }
            }
            StmtKind::Expression(_)
            | StmtKind::Echo(_)
            | StmtKind::Global(_)
            | StmtKind::Static(_)
            | StmtKind::Unset(_) => {
                if conditional.is_none() {
                    let snippet = snippet(stmt.span.text(self.source));
                    self.warn(format!("Not re-run: {}", snippet));
                }
            }
            StmtKind::Return(_) | StmtKind::Break | StmtKind::Continue | StmtKind::Nop => {}
        }
    }

    fn visit_bodies(&mut self, flow: &ControlFlow, conditional: Option<&'static str>) {
        for body in flow.bodies() {
            for stmt in body {
                self.visit_stmt(stmt, conditional);
            }
        }
    }

    fn visit_class(&mut self, decl: &ClassDecl) {
        let name = self.names.qualify(&decl.name);
        let Some(shape) = self.patcher.class_shape(&name) else {
            self.warn(format!("Cannot add {} {}", decl.kind, name));
            return;
        };
        self.check_structure(decl, &shape);

        for member in &decl.members {
            match member {
                ClassMember::Method(method) => self.visit_method(&shape.name, method),
                ClassMember::Const(constants) => {
                    for item in &constants.items {
                        let result = self
                            .patcher
                            .evaluate_constant(&item.value, &self.names)
                            .and_then(|value| {
                                self.patcher.redefine_constant(Some(&shape.name), &item.name, value)
                            });
                        match result {
                            Ok(()) => self.report.applied.push(AppliedPatch::Constant {
                                class: Some(shape.name.clone()),
                                name: item.name.clone(),
                            }),
                            Err(e) => self.warn(format!(
                                "Failed to reload {}::{}: {}",
                                shape.name, item.name, e
                            )),
                        }
                    }
                }
                ClassMember::Property(_) | ClassMember::Case { .. } | ClassMember::TraitUse(_) => {}
            }
        }
    }

    /// Warn about changes a running class cannot take.
    fn check_structure(&mut self, decl: &ClassDecl, shape: &ClassShape) {
        for member in &decl.members {
            match member {
                ClassMember::Property(prop) if !shape.has_property(&prop.name) => {
                    let modifier = if prop.is_static { "static " } else { "" };
                    self.warn(format!(
                        "Cannot add {}{} ${}",
                        modifier,
                        prop.visibility.as_str(),
                        prop.name
                    ));
                }
                ClassMember::Method(method) => {
                    for param in &method.params {
                        if let Some(visibility) = param.promoted {
                            if !shape.has_property(&param.name) {
                                let visibility = visibility.as_str();
                                self.warn(format!("Cannot add {} ${}", visibility, param.name));
                            }
                        }
                    }
                    if !shape.has_method(&method.name) {
                        self.warn(format!(
                            "New method {}::{}() added speculatively",
                            shape.name, method.name
                        ));
                    }
                }
                _ => {}
            }
        }

        let parent = decl.parent.as_deref().map(|p| self.class_reference(p));
        let parent_changed = match (&parent, &shape.parent) {
            (Some(new), Some(old)) => !new.eq_ignore_ascii_case(old),
            (None, None) => false,
            _ => true,
        };
        if parent_changed {
            self.warn(format!("Cannot change parent of {}", shape.name));
        }

        let mut declared: Vec<String> = decl
            .interfaces
            .iter()
            .map(|i| self.class_reference(i).to_ascii_lowercase())
            .collect();
        let mut current: Vec<String> =
            shape.interfaces.iter().map(|i| i.to_ascii_lowercase()).collect();
        declared.sort();
        declared.dedup();
        current.sort();
        current.dedup();
        if declared != current {
            self.warn(format!("Cannot change interfaces of {}", shape.name));
        }
    }

    /// Resolve a class reference the way the runtime does: builtin
    /// exception classes are visible unqualified from any namespace.
    fn class_reference(&self, name: &str) -> String {
        let resolved = self.names.resolve_class(name);
        if let Some(shape) = self.patcher.class_shape(&resolved) {
            return shape.name;
        }
        match resolved.rsplit_once('\\') {
            Some((_, short)) if is_builtin_throwable(short) => short.to_string(),
            _ => resolved,
        }
    }

    fn visit_method(&mut self, class: &str, method: &MethodDecl) {
        let Some(body) = &method.body else {
            return;
        };
        if method.is_abstract {
            return;
        }
        if let Some(var) = first_static_var(body) {
            self.warn(format!(
                "Static vars will reset: {}::{}() {{ static ${} = ...; }}",
                class, method.name, var
            ));
        }

        let names = Rc::new(self.names.clone());
        let replacement = UserFunction::from_method(method, class, names, Some(self.file.clone()));
        match self.patcher.override_method(class, &method.name, Rc::new(replacement)) {
            Ok(()) => {
                debug!("Reloaded {}::{}()", class, method.name);
                self.report.applied.push(AppliedPatch::Method {
                    class: class.to_string(),
                    method: method.name.clone(),
                });
            }
            Err(e) => self.warn(format!("Failed to reload {}::{}(): {}", class, method.name, e)),
        }
    }

    fn visit_function(&mut self, decl: &FunctionDecl, conditional: Option<&'static str>) {
        let name = self.names.qualify(&decl.name);
        if let Some(kind) = conditional {
            let snippet = format!("{} (...) {{ function {}() ... }}", kind, decl.name);
            if !self.skip_conditional(snippet) {
                return;
            }
        }

        let function = Rc::new(UserFunction::from_function(
            decl,
            name.clone(),
            Rc::new(self.names.clone()),
            Some(self.file.clone()),
        ));

        if !self.patcher.function_exists(&name) {
            match self.patcher.define_function(&name, function) {
                Ok(()) => self.report.applied.push(AppliedPatch::Function { name, defined: true }),
                Err(e) => self.warn(format!("Failed to add {}(): {}", name, e)),
            }
            return;
        }

        if let Some(var) = first_static_var(&decl.body) {
            self.warn(format!("Static vars will reset: {}() {{ static ${} = ...; }}", name, var));
        }
        match self.patcher.override_function(&name, function) {
            Ok(()) => {
                debug!("Reloaded {}()", name);
                self.report.applied.push(AppliedPatch::Function { name, defined: false });
            }
            Err(e) => self.warn(format!("Failed to reload {}(): {}", name, e)),
        }
    }

    fn visit_global_constants(&mut self, decl: &ConstDecl, conditional: Option<&'static str>) {
        if let Some(kind) = conditional {
            let first = decl.items.first().map_or("CONST", |item| item.name.as_str());
            let snippet = format!("{} (...) {{ const {} = ...; }}", kind, first);
            if !self.skip_conditional(snippet) {
                return;
            }
        }

        for item in &decl.items {
            let name = self.names.qualify(&item.name);
            let result = self
                .patcher
                .evaluate_constant(&item.value, &self.names)
                .and_then(|value| self.patcher.redefine_constant(None, &name, value));
            match result {
                Ok(()) => self.report.applied.push(AppliedPatch::Constant { class: None, name }),
                Err(e) => self.warn(format!("Failed to reload {}: {}", name, e)),
            }
        }
    }

    /// Returns whether a conditional definition should be reloaded.
    fn skip_conditional(&mut self, snippet: String) -> bool {
        if self.force {
            self.warn(format!("YOLO: Force-reloaded {}", snippet));
            true
        } else {
            self.warn(format!("Skipped conditional: {} (use `yolo` to force)", snippet));
            self.report.has_skips = true;
            false
        }
    }

    fn warn(&mut self, message: String) {
        self.report.warnings.push(message);
    }
}

fn contains_declarations(flow: &ControlFlow) -> bool {
    flow.bodies().into_iter().any(declares_anything)
}

fn declares_anything(stmts: &[Stmt]) -> bool {
    stmts.iter().any(|stmt| match &stmt.kind {
        StmtKind::Function(_) | StmtKind::Class(_) | StmtKind::Const(_) => true,
        StmtKind::Control(inner) => contains_declarations(inner),
        StmtKind::Block(stmts) => declares_anything(stmts),
        _ => false,
    })
}

/// First `static` local declared in a body, not looking into closures.
fn first_static_var(stmts: &[Stmt]) -> Option<&str> {
    stmts.iter().find_map(|stmt| match &stmt.kind {
        StmtKind::Static(vars) => vars.first().map(|v| v.name.as_str()),
        StmtKind::Control(flow) => flow.bodies().into_iter().find_map(first_static_var),
        StmtKind::Block(stmts) => first_static_var(stmts),
        _ => None,
    })
}

/// One-line rendering of a statement for warnings.
fn snippet(text: &str) -> String {
    let text = text.trim().trim_end_matches(';').trim_end();
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > SNIPPET_LIMIT {
        let mut short: String = collapsed.chars().take(SNIPPET_LIMIT - 3).collect();
        short.push_str("...");
        short
    } else {
        collapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ClassDef, RuntimeImage};
    use crate::syntax::ast::ClassKind;
    use crate::syntax::parse;
    use crate::value::Value;

    fn reload(image: &mut RuntimeImage, source: &str, force: bool) -> PatchReport {
        let stmts = parse(source).unwrap();
        ReloadVisitor::new(image, Path::new("/src/lib.php"), source, force).visit(&stmts)
    }

    fn declare_function(image: &mut RuntimeImage, source: &str) {
        let stmts = parse(source).unwrap();
        for stmt in &stmts {
            if let StmtKind::Function(decl) = &stmt.kind {
                let names = Rc::new(NameContext::new());
                let function = UserFunction::from_function(decl, decl.name.clone(), names, None);
                image.declare_function(Rc::new(function)).unwrap();
            }
        }
    }

    #[test]
    fn test_snippet_truncation() {
        assert_eq!(snippet("echo  'hi';\n"), "echo 'hi'");
        let long = format!("$x = '{}';", "a".repeat(60));
        let short = snippet(&long);
        assert_eq!(short.chars().count(), 50);
        assert!(short.ends_with("..."));
    }

    #[test]
    fn test_function_body_reload() {
        let mut image = RuntimeImage::new();
        declare_function(&mut image, "function greet() { return 'hello'; }");

        let report = reload(&mut image, "<?php\nfunction greet() { return 'goodbye'; }\n", false);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert_eq!(
            report.applied,
            vec![AppliedPatch::Function {
                name: "greet".into(),
                defined: false
            }]
        );
        assert!(image.lookup_function("greet").is_some());
    }

    #[test]
    fn test_new_function_is_defined() {
        let mut image = RuntimeImage::new();
        let report = reload(&mut image, "function fresh() { return 1; }", false);
        assert!(report.warnings.is_empty());
        assert!(image.has_function("fresh"));
    }

    #[test]
    fn test_conditional_skip_then_force() {
        let mut image = RuntimeImage::new();
        declare_function(&mut image, "function conditional() { return 1; }");
        let source = "if (true) { function conditional() { return 2; } }";

        let report = reload(&mut image, source, false);
        assert!(report.has_skips);
        assert_eq!(report.warnings.len(), 1);
        assert!(
            report.warnings[0]
                .starts_with("Skipped conditional: if (...) { function conditional() ... }")
        );
        assert!(report.applied.is_empty());

        let report = reload(&mut image, source, true);
        assert!(!report.has_skips);
        assert_eq!(
            report.warnings,
            vec!["YOLO: Force-reloaded if (...) { function conditional() ... }"]
        );
        assert_eq!(report.applied.len(), 1);
    }

    #[test]
    fn test_side_effects_are_not_rerun() {
        let mut image = RuntimeImage::new();
        let source = "<?php\necho 'loaded';\n$count = 1;\nwhile (false) { $x = 1; }\n";
        let report = reload(&mut image, source, false);
        assert_eq!(
            report.warnings,
            vec![
                "Not re-run: echo 'loaded'",
                "Not re-run: $count = 1",
                "Not re-run: while (...) { ... }",
            ]
        );
    }

    #[test]
    fn test_declaration_nested_in_block_is_conditional() {
        let mut image = RuntimeImage::new();
        declare_function(&mut image, "function nested() { return 1; }");
        let source = "if (true) { { if (true) { function nested() { return 2; } } } }";

        let report = reload(&mut image, source, false);
        assert!(report.has_skips);
        assert_eq!(report.warnings.len(), 1);
        assert!(
            report.warnings[0].starts_with("Skipped conditional: if (...)"),
            "{:?}",
            report.warnings
        );

        let report = reload(&mut image, source, true);
        assert_eq!(report.applied.len(), 1);
    }

    #[test]
    fn test_missing_class_is_reported() {
        let mut image = RuntimeImage::new();
        let source = "namespace App; interface Shape { function area(); }";
        let report = reload(&mut image, source, false);
        assert_eq!(report.warnings, vec![r"Cannot add interface App\Shape"]);
    }

    #[test]
    fn test_structural_changes_are_reported() {
        let mut image = RuntimeImage::new();
        let mut def = ClassDef::new("Greeter".into(), ClassKind::Class);
        def.interfaces = vec!["Countable".into()];
        image.declare_class(def).unwrap();

        let source = "class Greeter extends Exception {
            private static $cache;
            public function greet() { static $calls = 0; return 'hi'; }
        }";
        let report = reload(&mut image, source, false);
        assert_eq!(
            report.warnings,
            vec![
                "Cannot add static private $cache".to_string(),
                "New method Greeter::greet() added speculatively".to_string(),
                "Cannot change parent of Greeter".to_string(),
                "Cannot change interfaces of Greeter".to_string(),
                "Static vars will reset: Greeter::greet() { static $calls = ...; }".to_string(),
            ]
        );
        assert_eq!(report.applied.len(), 1);
    }

    #[test]
    fn test_constants_are_redefined() {
        let mut image = RuntimeImage::new();
        image.define_constant("LIMIT", Value::Int(1));
        let report = reload(&mut image, "const LIMIT = 10;", false);
        assert!(report.warnings.is_empty());
        assert_eq!(image.constant("LIMIT"), Some(Value::Int(10)));

        let report = reload(&mut image, "if (true) { const DEBUG = true; }", false);
        assert!(report.has_skips);
        assert_eq!(
            report.warnings,
            vec!["Skipped conditional: if (...) { const DEBUG = ...; } (use `yolo` to force)"]
        );
    }
}
