//! Tree-walking evaluator for REPL input and included files.
//!
//! The interpreter owns the [`RuntimeImage`] and the global scope. Every
//! call dispatches through the image, so patches installed by the live
//! reloader take effect on the next call without touching running frames.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use super::UserFunction;
use super::builtins;
use super::image::{self, ClassDef, PropertyDef, RuntimeImage};
use super::ops;
use crate::error::{Error, Result};
use crate::execute::InterruptHandle;
use crate::syntax::ast::{
    BinaryOp, CastType, CatchClause, ClassDecl, ClassKind, ClassMember, ClosureDecl, ControlFlow,
    Expr, FunctionDecl, IncludeKind, Stmt, StmtKind, StringPart, UnaryOp,
};
use crate::syntax::{self, NameContext};
use crate::value::{ArrayKey, ArrayValue, Closure, Object, ObjectRef, Value};

/// Nested user calls allowed before evaluation is aborted.
pub const MAX_CALL_DEPTH: usize = 256;

/// How a statement list finished.
enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

struct Frame {
    function: Rc<UserFunction>,
    locals: BTreeMap<String, Value>,
    this: Option<Value>,
    /// Class `self::` resolves to.
    class: Option<String>,
    /// Class `static::` resolves to.
    static_class: Option<String>,
    /// Names bound by `global`.
    globals: FxHashSet<String>,
    /// Names bound by `static`.
    statics: FxHashSet<String>,
}

/// Context a call binds besides its arguments.
#[derive(Default)]
struct Binding {
    this: Option<Value>,
    class: Option<String>,
    static_class: Option<String>,
    captured: BTreeMap<String, Value>,
}

struct Invocation {
    value: Value,
    /// Final values of by-reference parameters, by argument position.
    by_ref: Vec<(usize, Value)>,
}

/// Class whose constant initializers are being evaluated.
struct PendingClass {
    name: String,
    constants: FxHashMap<String, Value>,
}

/// Evaluates source text against a persistent program image.
pub struct Interpreter {
    image: RuntimeImage,
    globals: BTreeMap<String, Value>,
    frames: Vec<Frame>,
    names: NameContext,
    output: Rc<RefCell<dyn Write>>,
    interrupt: InterruptHandle,
    loaded_files: Vec<PathBuf>,
    file_stack: Vec<PathBuf>,
    include_depth: usize,
    pending_class: Option<PendingClass>,
    /// Object behind the exception currently unwinding.
    thrown: Option<ObjectRef>,
    silenced: usize,
    next_resource_id: u64,
}

impl Interpreter {
    pub fn new(output: Rc<RefCell<dyn Write>>) -> Self {
        Self {
            image: RuntimeImage::new(),
            globals: BTreeMap::new(),
            frames: Vec::new(),
            names: NameContext::new(),
            output,
            interrupt: InterruptHandle::new(),
            loaded_files: Vec::new(),
            file_stack: Vec::new(),
            include_depth: 0,
            pending_class: None,
            thrown: None,
            silenced: 0,
            next_resource_id: 1,
        }
    }

    pub fn interrupt_handle(&self) -> &InterruptHandle {
        &self.interrupt
    }

    pub fn set_interrupt_handle(&mut self, handle: InterruptHandle) {
        self.interrupt = handle;
    }

    pub fn image(&self) -> &RuntimeImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut RuntimeImage {
        &mut self.image
    }

    pub fn globals(&self) -> &BTreeMap<String, Value> {
        &self.globals
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals.insert(name.to_string(), value);
    }

    pub fn unset_global(&mut self, name: &str) -> Option<Value> {
        self.globals.remove(name)
    }

    /// Files loaded by `include`/`require`, in load order.
    pub fn loaded_files(&self) -> &[PathBuf] {
        &self.loaded_files
    }

    /// Evaluate REPL input. Returns the value of a trailing expression
    /// statement, or of a top-level `return`.
    pub fn eval(&mut self, source: &str) -> Result<Option<Value>> {
        let stmts = syntax::parse(source)?;
        self.frames.clear();
        self.thrown = None;
        let (flow, last) = self.run_program(&stmts)?;
        Ok(match flow {
            Flow::Return(value) => Some(value),
            _ => last,
        })
    }

    /// `require_once` a file from the host side.
    pub fn include(&mut self, path: &Path) -> Result<Value> {
        self.include_path(&path.to_string_lossy(), IncludeKind::RequireOnce)
    }

    /// Call a function by name with evaluated arguments.
    pub fn call_function(&mut self, name: &str, args: Vec<Value>) -> Result<Value> {
        let name = name.trim_start_matches('\\');
        if let Some(function) = self.image.lookup_function(name) {
            return Ok(self.invoke(&function, args, Binding::default())?.value);
        }
        if builtins::exists(name) {
            let mut args = args;
            return builtins::call(self, name, &mut args);
        }
        Err(undefined_function(name))
    }

    /// Call any callable value: a closure, a function name, `"Class::method"`
    /// or `[$objectOrClass, "method"]`.
    pub fn call_value(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value> {
        match callee {
            Value::Closure(closure) => {
                let binding = Binding {
                    this: closure.this.clone().map(Value::Object),
                    class: closure.function.class.clone(),
                    static_class: closure.function.class.clone(),
                    captured: closure.captured.clone(),
                };
                Ok(self.invoke(&closure.function, args, binding)?.value)
            }
            Value::String(name) => match name.split_once("::") {
                Some((class, method)) => self.call_static(class, method, args),
                None => self.call_function(name, args),
            },
            Value::Array(array) if array.len() == 2 => {
                let mut items = array.values();
                let (Some(target), Some(Value::String(method))) = (items.next(), items.next())
                else {
                    return Err(Error::exception(
                        "Error",
                        "Array callback must have exactly two elements",
                    ));
                };
                match target {
                    Value::Object(_) | Value::Enum(_) => {
                        self.call_method(target.clone(), method, args)
                    }
                    Value::String(class) => self.call_static(class, method, args),
                    _ => Err(Error::exception(
                        "Error",
                        "Array callback has to contain indices 0 and 1",
                    )),
                }
            }
            Value::Object(object) => {
                let class = object.borrow().class.clone();
                match self.image.find_method(&class, "__invoke") {
                    Some(_) => self.call_method(callee.clone(), "__invoke", args),
                    None => Err(Error::exception(
                        "Error",
                        format!("Object of type {} is not callable", class),
                    )),
                }
            }
            other => Err(Error::exception(
                "Error",
                format!("Value of type {} is not callable", other.type_name()),
            )),
        }
    }

    /// Whether `value` can be passed to [`call_value`](Self::call_value).
    pub fn is_callable(&self, value: &Value) -> bool {
        match value {
            Value::Closure(_) => true,
            Value::String(name) => match name.split_once("::") {
                Some((class, method)) => self.image.find_method(class, method).is_some(),
                None => self.image.has_function(name) || builtins::exists(name),
            },
            Value::Object(object) => {
                self.image.find_method(&object.borrow().class, "__invoke").is_some()
            }
            _ => false,
        }
    }

    /// String conversion honouring `__toString`.
    pub fn stringify(&mut self, value: &Value) -> Result<String> {
        match value {
            Value::Object(object) => {
                let class = object.borrow().class.clone();
                if self.image.find_method(&class, "__toString").is_some() {
                    let result = self.call_method(value.clone(), "__toString", Vec::new())?;
                    return Ok(result.to_output_string());
                }
                Err(Error::exception(
                    "Error",
                    format!("Object of class {} could not be converted to string", class),
                ))
            }
            Value::Array(_) => {
                self.warn("Array to string conversion");
                Ok("Array".to_string())
            }
            Value::Closure(_) => Err(Error::exception(
                "Error",
                "Object of class Closure could not be converted to string",
            )),
            other => Ok(other.to_output_string()),
        }
    }

    /// The object for an uncaught error, as `catch (Throwable $e)` would see it.
    pub fn exception_value(&mut self, err: &Error) -> Option<Value> {
        let (class, message, code) = match err {
            Error::Exception { class, message, code } => (class.as_str(), message.as_str(), *code),
            Error::Runtime(message) => ("Error", message.as_str(), 0),
            _ => return None,
        };
        match self.thrown.take() {
            Some(object) if object.borrow().class == class => Some(Value::Object(object)),
            _ => Some(exception_object(class, message, code)),
        }
    }

    pub(crate) fn write_output(&self, text: &str) -> Result<()> {
        self.output.borrow_mut().write_all(text.as_bytes())?;
        Ok(())
    }

    /// Print a non-fatal diagnostic unless suppressed with `@`.
    pub(crate) fn warn(&self, message: &str) {
        if self.silenced == 0 {
            let _ = self.write_output(&format!("Warning: {}\n", message));
        }
    }

    pub(crate) fn check_interrupt(&self) -> Result<()> {
        if self.interrupt.is_interrupted() {
            return Err(Error::Interrupted);
        }
        Ok(())
    }

    pub(crate) fn next_resource_id(&mut self) -> u64 {
        let id = self.next_resource_id;
        self.next_resource_id += 1;
        id
    }

    pub(crate) fn define_constant(&mut self, name: &str, value: Value) -> bool {
        self.image.define_constant(name, value)
    }

    // ── Programs ──

    /// Execute a file or REPL input. Unconditional functions are declared
    /// before any statement runs.
    fn run_program(&mut self, stmts: &[Stmt]) -> Result<(Flow, Option<Value>)> {
        self.hoist_functions(stmts)?;
        let mut last = None;
        for stmt in stmts {
            last = None;
            match &stmt.kind {
                StmtKind::Function(_) => {}
                StmtKind::Expression(expr) => last = Some(self.eval_expr(expr)?),
                _ => match self.exec_stmt(stmt)? {
                    Flow::Normal => {}
                    Flow::Return(value) => return Ok((Flow::Return(value), None)),
                    Flow::Break | Flow::Continue => {
                        return Err(Error::Fatal(
                            "'break' not in the 'loop' or 'switch' context".into(),
                        ));
                    }
                },
            }
        }
        Ok((Flow::Normal, last))
    }

    fn hoist_functions(&mut self, stmts: &[Stmt]) -> Result<()> {
        let saved = self.names.clone();
        let result = stmts.iter().try_for_each(|stmt| match &stmt.kind {
            StmtKind::Namespace { name, body: None } => {
                self.names.enter_namespace(name.as_deref());
                Ok(())
            }
            StmtKind::Use(items) => {
                items.iter().for_each(|item| self.names.add_import(item));
                Ok(())
            }
            StmtKind::Function(decl) => self.declare_function(decl),
            _ => Ok(()),
        });
        self.names = saved;
        result
    }

    fn include_path(&mut self, target: &str, kind: IncludeKind) -> Result<Value> {
        let Some(path) = self.resolve_include(target) else {
            let verb = if kind.is_require() { "require" } else { "include" };
            if kind.is_require() {
                return Err(Error::Fatal(format!(
                    "Uncaught Error: Failed opening required '{}'",
                    target
                )));
            }
            self.warn(&format!(
                "{}({}): Failed to open stream: No such file or directory",
                verb, target
            ));
            return Ok(Value::Bool(false));
        };
        if kind.is_once() && self.loaded_files.contains(&path) {
            return Ok(Value::Bool(true));
        }

        let source = fs::read_to_string(&path)?;
        let stmts = syntax::parse(&source).map_err(|err| match err {
            Error::Syntax { line, message } => Error::Fatal(format!(
                "syntax error, {} in {} on line {}",
                message,
                path.display(),
                line
            )),
            other => other,
        })?;
        if !self.loaded_files.contains(&path) {
            self.loaded_files.push(path.clone());
        }
        debug!("Including {}", path.display());

        let saved_names = std::mem::take(&mut self.names);
        self.file_stack.push(path);
        self.include_depth += 1;
        let result = self.run_program(&stmts);
        self.include_depth -= 1;
        self.file_stack.pop();
        self.names = saved_names;

        Ok(match result?.0 {
            Flow::Return(value) => value,
            _ => Value::Int(1),
        })
    }

    /// Relative paths resolve against the working directory first, then the
    /// directory of the including file.
    fn resolve_include(&self, target: &str) -> Option<PathBuf> {
        let path = Path::new(target);
        if path.is_absolute() {
            return path.canonicalize().ok();
        }
        if let Ok(found) = path.canonicalize() {
            return Some(found);
        }
        let dir = self.file_stack.last()?.parent()?;
        dir.join(path).canonicalize().ok()
    }

    fn current_file(&self) -> Option<PathBuf> {
        self.file_stack.last().cloned()
    }

    fn names(&self) -> &NameContext {
        match self.frames.last() {
            Some(frame) => &frame.function.names,
            None => &self.names,
        }
    }

    // ── Declarations ──

    fn declare_function(&mut self, decl: &FunctionDecl) -> Result<()> {
        let name = self.names().qualify(&decl.name);
        if self.image.has_function(&name) || builtins::exists(&name) {
            return Err(Error::Fatal(format!("Cannot redeclare {}()", name)));
        }
        let names = Rc::new(self.names().clone());
        let function = UserFunction::from_function(decl, name, names, self.current_file());
        self.image
            .declare_function(Rc::new(function))
            .map_err(|err| Error::Fatal(err.to_string()))
    }

    fn declare_class(&mut self, decl: &ClassDecl) -> Result<()> {
        let name = self.names().qualify(&decl.name);
        if self.image.has_class(&name) {
            return Err(Error::Fatal(format!(
                "Cannot declare {} {}, because the name is already in use",
                decl.kind, name
            )));
        }
        let names = Rc::new(self.names().clone());
        let file = self.current_file();

        let mut def = ClassDef::new(name.clone(), decl.kind);
        def.is_abstract = decl.is_abstract;
        def.session_defined = self.include_depth == 0;
        def.file = file.clone();
        if let Some(parent) = &decl.parent {
            let parent = self.known_class_name(&names.resolve_class(parent));
            match self.image.lookup_class(&parent) {
                Some(found) if found.kind == decl.kind => def.parent = Some(found.name.clone()),
                Some(found) => {
                    return Err(Error::Fatal(format!(
                        "{} cannot extend {} {}",
                        name, found.kind, found.name
                    )));
                }
                None if image::is_builtin_throwable(&parent) => def.parent = Some(parent),
                None => return Err(Error::Fatal(format!("Class \"{}\" not found", parent))),
            }
        }
        def.interfaces = decl
            .interfaces
            .iter()
            .map(|i| self.known_class_name(&names.resolve_class(i)))
            .collect();

        self.pending_class = Some(PendingClass {
            name: name.clone(),
            constants: FxHashMap::default(),
        });
        let result = self.collect_members(&mut def, decl, &names, file);
        let pending = self.pending_class.take();
        result?;
        if let Some(pending) = pending {
            def.constants = pending.constants;
        }

        {
            let mut statics = def.static_values.borrow_mut();
            for property in def.properties.iter().filter(|p| p.is_static) {
                statics.insert(property.name.clone(), property.default.clone());
            }
        }
        debug!("Declared {} {}", def.kind, def.name);
        self.image
            .declare_class(def)
            .map(|_| ())
            .map_err(|err| Error::Fatal(err.to_string()))
    }

    fn collect_members(
        &mut self,
        def: &mut ClassDef,
        decl: &ClassDecl,
        names: &Rc<NameContext>,
        file: Option<PathBuf>,
    ) -> Result<()> {
        for member in &decl.members {
            match member {
                ClassMember::Method(method) => {
                    let function =
                        UserFunction::from_method(method, &def.name, names.clone(), file.clone());
                    if method.name.eq_ignore_ascii_case("__construct") {
                        for param in &method.params {
                            if let Some(visibility) = param.promoted {
                                def.properties.push(PropertyDef {
                                    name: param.name.clone(),
                                    default: Value::Null,
                                    visibility,
                                    is_static: false,
                                });
                            }
                        }
                    }
                    def.methods
                        .insert(method.name.to_ascii_lowercase(), Rc::new(function));
                }
                ClassMember::Property(property) => {
                    let default = match &property.default {
                        Some(expr) => self.eval_expr(expr)?,
                        None => Value::Null,
                    };
                    def.properties.push(PropertyDef {
                        name: property.name.clone(),
                        default,
                        visibility: property.visibility,
                        is_static: property.is_static,
                    });
                }
                ClassMember::Const(constants) => {
                    for item in &constants.items {
                        let value = self.eval_expr(&item.value)?;
                        if let Some(pending) = self.pending_class.as_mut() {
                            pending.constants.insert(item.name.clone(), value);
                        }
                    }
                }
                ClassMember::Case { name, value } => {
                    let value = match value {
                        Some(expr) => Some(self.eval_expr(expr)?),
                        None => None,
                    };
                    def.cases.push((name.clone(), value));
                }
                ClassMember::TraitUse(traits) => {
                    for name in traits {
                        let resolved = names.resolve_class(name);
                        let Some(source) = self
                            .image
                            .lookup_class(&resolved)
                            .filter(|t| t.kind == ClassKind::Trait)
                        else {
                            return Err(Error::Fatal(format!("Trait \"{}\" not found", resolved)));
                        };
                        let class_name = def.name.clone();
                        for (key, method) in &source.methods {
                            def.methods
                                .entry(key.clone())
                                .or_insert_with(|| Rc::new(method.rebind(&class_name)));
                        }
                        def.properties.extend(source.properties.iter().cloned());
                        if let Some(pending) = self.pending_class.as_mut() {
                            for (name, value) in &source.constants {
                                pending
                                    .constants
                                    .entry(name.clone())
                                    .or_insert_with(|| value.clone());
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Unqualified builtin class names resolve globally from any namespace.
    fn known_class_name(&self, resolved: &str) -> String {
        if self.image.has_class(resolved) {
            return resolved.to_string();
        }
        match resolved.rsplit_once('\\') {
            Some((_, short))
                if image::is_builtin_throwable(short) && !self.image.has_class(short) =>
            {
                short.to_string()
            }
            _ => resolved.to_string(),
        }
    }

    fn current_class(&self) -> Option<String> {
        self.frames
            .last()
            .and_then(|frame| frame.class.clone())
            .or_else(|| self.pending_class.as_ref().map(|p| p.name.clone()))
    }

    /// Resolve a class reference, including `self`, `static` and `parent`.
    fn resolve_class_ref(&self, name: &str) -> Result<String> {
        match name.to_ascii_lowercase().as_str() {
            "self" => self.current_class().ok_or_else(|| {
                Error::exception("Error", "Cannot use \"self\" when no class scope is active")
            }),
            "static" => self
                .frames
                .last()
                .and_then(|f| f.static_class.clone())
                .or_else(|| self.current_class())
                .ok_or_else(|| {
                    Error::exception("Error", "Cannot use \"static\" when no class scope is active")
                }),
            "parent" => {
                let class = self.current_class().ok_or_else(|| {
                    Error::exception("Error", "Cannot use \"parent\" when no class scope is active")
                })?;
                self.image
                    .lookup_class(&class)
                    .and_then(|def| def.parent.clone())
                    .ok_or_else(|| {
                        Error::exception(
                            "Error",
                            "Cannot use \"parent\" when current class scope has no parent",
                        )
                    })
            }
            _ => Ok(self.known_class_name(&self.names().resolve_class(name))),
        }
    }

    // ── Variables ──

    fn get_var(&self, name: &str) -> Option<Value> {
        if name == "this" {
            return self.frames.last().and_then(|f| f.this.clone());
        }
        match self.frames.last() {
            None => self.globals.get(name).cloned(),
            Some(frame) if frame.globals.contains(name) => self.globals.get(name).cloned(),
            Some(frame) if frame.statics.contains(name) => {
                frame.function.statics.borrow().get(name).cloned()
            }
            Some(frame) => frame.locals.get(name).cloned(),
        }
    }

    fn set_var(&mut self, name: &str, value: Value) -> Result<()> {
        if name == "this" {
            return Err(Error::Fatal("Cannot re-assign $this".into()));
        }
        match self.frames.last_mut() {
            None => {
                self.globals.insert(name.to_string(), value);
            }
            Some(frame) if frame.globals.contains(name) => {
                self.globals.insert(name.to_string(), value);
            }
            Some(frame) if frame.statics.contains(name) => {
                frame.function.statics.borrow_mut().insert(name.to_string(), value);
            }
            Some(frame) => {
                frame.locals.insert(name.to_string(), value);
            }
        }
        Ok(())
    }

    fn unset_var(&mut self, name: &str) {
        match self.frames.last_mut() {
            None => {
                self.globals.remove(name);
            }
            Some(frame) => {
                frame.globals.remove(name);
                frame.statics.remove(name);
                frame.locals.remove(name);
            }
        }
    }

    /// Variables visible in the current scope, for arrow functions.
    fn visible_vars(&self) -> BTreeMap<String, Value> {
        match self.frames.last() {
            None => self.globals.clone(),
            Some(frame) => {
                let mut vars = frame.locals.clone();
                for name in frame.globals.iter().chain(frame.statics.iter()) {
                    if let Some(value) = self.get_var(name) {
                        vars.insert(name.clone(), value);
                    }
                }
                vars
            }
        }
    }

    fn current_this(&self) -> Option<Value> {
        self.frames.last().and_then(|f| f.this.clone())
    }

    // ── Statements ──

    fn exec_block(&mut self, stmts: &[Stmt]) -> Result<Flow> {
        for stmt in stmts {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Result<Flow> {
        match &stmt.kind {
            StmtKind::Namespace { name, body } => {
                if self.frames.is_empty() {
                    self.names.enter_namespace(name.as_deref());
                }
                if let Some(body) = body {
                    self.hoist_functions(body)?;
                    for inner in body {
                        if !matches!(inner.kind, StmtKind::Function(_)) {
                            match self.exec_stmt(inner)? {
                                Flow::Normal => {}
                                other => return Ok(other),
                            }
                        }
                    }
                }
            }
            StmtKind::Use(items) => {
                if self.frames.is_empty() {
                    for item in items {
                        self.names.add_import(item);
                    }
                }
            }
            StmtKind::Class(decl) => self.declare_class(decl)?,
            StmtKind::Function(decl) => self.declare_function(decl)?,
            StmtKind::Const(decl) => {
                for item in &decl.items {
                    let name = self.names().qualify(&item.name);
                    let value = self.eval_expr(&item.value)?;
                    if !self.image.define_constant(&name, value) {
                        self.warn(&format!("Constant {} already defined", name));
                    }
                }
            }
            StmtKind::Control(flow) => return self.exec_control(flow),
            StmtKind::Expression(expr) => {
                self.eval_expr(expr)?;
            }
            StmtKind::Echo(exprs) => {
                for expr in exprs {
                    let value = self.eval_expr(expr)?;
                    let text = self.stringify(&value)?;
                    self.write_output(&text)?;
                }
            }
            StmtKind::Global(names) => {
                if let Some(frame) = self.frames.last_mut() {
                    for name in names {
                        frame.locals.remove(name);
                        frame.globals.insert(name.clone());
                    }
                }
            }
            StmtKind::Static(vars) => {
                for var in vars {
                    let Some(function) = self.frames.last().map(|f| f.function.clone()) else {
                        if self.get_var(&var.name).is_none() {
                            let value = self.eval_optional(var.default.as_ref())?;
                            self.set_var(&var.name, value)?;
                        }
                        continue;
                    };
                    let initialized = function.statics.borrow().contains_key(&var.name);
                    if !initialized {
                        let value = self.eval_optional(var.default.as_ref())?;
                        function.statics.borrow_mut().insert(var.name.clone(), value);
                    }
                    if let Some(frame) = self.frames.last_mut() {
                        frame.locals.remove(&var.name);
                        frame.statics.insert(var.name.clone());
                    }
                }
            }
            StmtKind::Return(expr) => return Ok(Flow::Return(self.eval_optional(expr.as_ref())?)),
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Unset(targets) => {
                for target in targets {
                    self.unset(target)?;
                }
            }
            StmtKind::Block(body) => return self.exec_block(body),
            StmtKind::Nop => {}
        }
        Ok(Flow::Normal)
    }

    fn eval_optional(&mut self, expr: Option<&Expr>) -> Result<Value> {
        match expr {
            Some(expr) => self.eval_expr(expr),
            None => Ok(Value::Null),
        }
    }

    fn exec_control(&mut self, flow: &ControlFlow) -> Result<Flow> {
        match flow {
            ControlFlow::If {
                cond,
                then,
                elseifs,
                otherwise,
            } => {
                if self.eval_expr(cond)?.is_truthy() {
                    return self.exec_block(then);
                }
                for (cond, body) in elseifs {
                    if self.eval_expr(cond)?.is_truthy() {
                        return self.exec_block(body);
                    }
                }
                match otherwise {
                    Some(body) => self.exec_block(body),
                    None => Ok(Flow::Normal),
                }
            }
            ControlFlow::While { cond, body } => {
                loop {
                    self.check_interrupt()?;
                    if !self.eval_expr(cond)?.is_truthy() {
                        break;
                    }
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            ControlFlow::DoWhile { body, cond } => {
                loop {
                    self.check_interrupt()?;
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    if !self.eval_expr(cond)?.is_truthy() {
                        break;
                    }
                }
                Ok(Flow::Normal)
            }
            ControlFlow::For {
                init,
                cond,
                step,
                body,
            } => {
                for expr in init {
                    self.eval_expr(expr)?;
                }
                loop {
                    self.check_interrupt()?;
                    let mut proceed = true;
                    for expr in cond {
                        proceed = self.eval_expr(expr)?.is_truthy();
                    }
                    if !proceed {
                        break;
                    }
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    for expr in step {
                        self.eval_expr(expr)?;
                    }
                }
                Ok(Flow::Normal)
            }
            ControlFlow::Foreach {
                subject,
                key,
                value,
                by_ref,
                body,
            } => {
                let entries: Vec<(ArrayKey, Value)> = match self.eval_expr(subject)? {
                    Value::Array(array) => array.iter().cloned().collect(),
                    Value::Object(object) => object
                        .borrow()
                        .properties
                        .iter()
                        .map(|(k, v)| (ArrayKey::Str(k.clone()), v.clone()))
                        .collect(),
                    Value::Null => {
                        self.warn("foreach() argument must be of type array|object, null given");
                        Vec::new()
                    }
                    other => {
                        self.warn(&format!(
                            "foreach() argument must be of type array|object, {} given",
                            other.type_name()
                        ));
                        Vec::new()
                    }
                };
                for (entry_key, entry_value) in entries {
                    self.check_interrupt()?;
                    if let Some(key) = key {
                        self.set_var(key, entry_key.to_value())?;
                    }
                    self.set_var(value, entry_value)?;
                    let flow = self.exec_block(body)?;
                    if *by_ref && subject.is_assignable() {
                        let updated = self.get_var(value).unwrap_or_default();
                        let slot = Expr::Index {
                            base: Box::new(subject.clone()),
                            index: Some(Box::new(key_expr(&entry_key))),
                        };
                        self.assign_to(&slot, updated)?;
                    }
                    match flow {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            ControlFlow::Switch { subject, cases } => {
                let subject = self.eval_expr(subject)?;
                let mut start = None;
                for (i, case) in cases.iter().enumerate() {
                    if let Some(test) = &case.test {
                        if self.eval_expr(test)?.loose_eq(&subject) {
                            start = Some(i);
                            break;
                        }
                    }
                }
                let start = start.or_else(|| cases.iter().position(|c| c.test.is_none()));
                if let Some(start) = start {
                    for case in &cases[start..] {
                        match self.exec_block(&case.body)? {
                            Flow::Normal => {}
                            Flow::Break | Flow::Continue => break,
                            Flow::Return(value) => return Ok(Flow::Return(value)),
                        }
                    }
                }
                Ok(Flow::Normal)
            }
            ControlFlow::Try {
                body,
                catches,
                finally,
            } => {
                let result = match self.exec_block(body) {
                    Err(err) => self.catch(err, catches),
                    ok => ok,
                };
                if let Some(finally) = finally {
                    match self.exec_block(finally)? {
                        Flow::Normal => {}
                        other => return Ok(other),
                    }
                }
                result
            }
        }
    }

    fn catch(&mut self, err: Error, catches: &[CatchClause]) -> Result<Flow> {
        let (class, message, code) = match &err {
            Error::Exception { class, message, code } => (class.clone(), message.clone(), *code),
            Error::Runtime(message) => ("Error".to_string(), message.clone(), 0),
            _ => return Err(err),
        };
        for clause in catches {
            let matches = clause.types.iter().any(|ty| {
                let ty = self.known_class_name(&self.names().resolve_class(ty));
                self.image.is_subclass_of(&class, &ty)
            });
            if !matches {
                continue;
            }
            let object = match self.thrown.take() {
                Some(object) if object.borrow().class == class => Value::Object(object),
                _ => exception_object(&class, &message, code),
            };
            if let Some(var) = &clause.var {
                self.set_var(var, object)?;
            }
            return self.exec_block(&clause.body);
        }
        Err(err)
    }

    fn unset(&mut self, target: &Expr) -> Result<()> {
        match target {
            Expr::Var(name) => self.unset_var(name),
            Expr::Index {
                base,
                index: Some(index),
            } => {
                let container = self.read_quiet(base)?;
                let key = self.eval_expr(index)?;
                if let Value::Array(mut array) = container {
                    if let Some(key) = ArrayKey::from_value(&key) {
                        array.remove(&key);
                    }
                    self.assign_to(base, Value::Array(array))?;
                }
            }
            Expr::PropFetch { object, name } => {
                if let Value::Object(object) = self.eval_expr(object)? {
                    object.borrow_mut().properties.remove(name);
                }
            }
            _ => return Err(Error::Fatal("Cannot unset this expression".into())),
        }
        Ok(())
    }

    // ── Expressions ──

    /// Evaluate with undefined-variable and undefined-key warnings suppressed.
    fn read_quiet(&mut self, expr: &Expr) -> Result<Value> {
        self.silenced += 1;
        let result = self.eval_expr(expr);
        self.silenced -= 1;
        result
    }

    fn eval_expr(&mut self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Int(i) => Ok(Value::Int(*i)),
            Expr::Float(f) => Ok(Value::Float(*f)),
            Expr::String(s) => Ok(Value::String(s.clone())),
            Expr::Interpolated(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        StringPart::Literal(text) => out.push_str(text),
                        StringPart::Expr(expr) => {
                            let value = self.eval_expr(expr)?;
                            out.push_str(&self.stringify(&value)?);
                        }
                    }
                }
                Ok(Value::String(out))
            }
            Expr::Array(items) => {
                let mut array = ArrayValue::new();
                for item in items {
                    let value = self.eval_expr(&item.value)?;
                    match &item.key {
                        Some(key) => {
                            let key = self.eval_expr(key)?;
                            array.insert(array_key(&key)?, value);
                        }
                        None => array.push(value),
                    }
                }
                Ok(Value::Array(array))
            }
            Expr::Var(name) => match self.get_var(name) {
                Some(value) => Ok(value),
                None => {
                    if name == "this" {
                        return Err(Error::exception(
                            "Error",
                            "Using $this when not in object context",
                        ));
                    }
                    self.warn(&format!("Undefined variable ${}", name));
                    Ok(Value::Null)
                }
            },
            Expr::ConstFetch(name) => self.constant(name),
            Expr::ClassConstFetch { class, name } => {
                let class = self.resolve_class_ref(class)?;
                if name.eq_ignore_ascii_case("class") {
                    return Ok(Value::String(class));
                }
                if let Some(pending) = &self.pending_class {
                    if pending.name == class {
                        if let Some(value) = pending.constants.get(name) {
                            return Ok(value.clone());
                        }
                    }
                }
                self.image
                    .class_constant(&class, name)
                    .ok_or_else(|| {
                        Error::exception("Error", format!("Undefined constant {}::{}", class, name))
                    })
            }
            Expr::StaticPropFetch { class, name } => {
                let class = self.resolve_class_ref(class)?;
                let owner = self.image.static_property_owner(&class, name).ok_or_else(|| {
                    Error::exception(
                        "Error",
                        format!("Access to undeclared static property {}::${}", class, name),
                    )
                })?;
                let value = owner.static_values.borrow().get(name).cloned();
                Ok(value.unwrap_or_default())
            }
            Expr::Assign { target, op, value } => {
                let value = match op {
                    None => self.eval_expr(value)?,
                    Some(BinaryOp::Coalesce) => match self.read_quiet(target)? {
                        Value::Null => self.eval_expr(value)?,
                        current => return Ok(current),
                    },
                    Some(op) => {
                        let current = self.eval_expr(target)?;
                        let rhs = self.eval_expr(value)?;
                        self.binary(*op, &current, &rhs)?
                    }
                };
                self.assign_to(target, value.clone())?;
                Ok(value)
            }
            Expr::Binary { op, left, right } => match op {
                BinaryOp::And => {
                    let left = self.eval_expr(left)?.is_truthy();
                    Ok(Value::Bool(left && self.eval_expr(right)?.is_truthy()))
                }
                BinaryOp::Or => {
                    let left = self.eval_expr(left)?.is_truthy();
                    Ok(Value::Bool(left || self.eval_expr(right)?.is_truthy()))
                }
                BinaryOp::Coalesce => match self.read_quiet(left)? {
                    Value::Null => self.eval_expr(right),
                    value => Ok(value),
                },
                op => {
                    let left = self.eval_expr(left)?;
                    let right = self.eval_expr(right)?;
                    self.binary(*op, &left, &right)
                }
            },
            Expr::Unary { op, expr } => {
                if *op == UnaryOp::Silence {
                    return self.read_quiet(expr);
                }
                let value = self.eval_expr(expr)?;
                ops::unary(*op, &value)
            }
            Expr::IncDec {
                target,
                increment,
                prefix,
            } => {
                let current = self.read_quiet(target)?;
                let updated = step(&current, *increment)?;
                self.assign_to(target, updated.clone())?;
                Ok(if *prefix { updated } else { current })
            }
            Expr::Call { name, args } => self.call_named(name, args),
            Expr::CallValue { callee, args } => {
                let callee = self.eval_expr(callee)?;
                if let Value::Closure(closure) = &callee {
                    let binding = Binding {
                        this: closure.this.clone().map(Value::Object),
                        class: closure.function.class.clone(),
                        static_class: closure.function.class.clone(),
                        captured: closure.captured.clone(),
                    };
                    let function = closure.function.clone();
                    return self.call_with_exprs(&function, args, binding);
                }
                let args = self.eval_args(None, args)?;
                self.call_value(&callee, args)
            }
            Expr::StaticCall { class, method, args } => self.eval_static_call(class, method, args),
            Expr::MethodCall { object, method, args } => {
                let target = self.eval_expr(object)?;
                self.eval_method_call(target, method, args)
            }
            Expr::PropFetch { object, name } => {
                let target = self.eval_expr(object)?;
                self.read_property(&target, name)
            }
            Expr::Index { base, index } => {
                let container = self.eval_expr(base)?;
                let Some(index) = index else {
                    return Err(Error::Fatal("Cannot use [] for reading".into()));
                };
                let index = self.eval_expr(index)?;
                self.read_index(&container, &index)
            }
            Expr::New { class, args } => {
                let class = self.resolve_class_ref(class)?;
                let args = self.eval_args(None, args)?;
                self.instantiate(&class, args)
            }
            Expr::Closure(decl) => Ok(self.make_closure(decl)),
            Expr::Include { kind, path } => {
                let path = self.eval_expr(path)?;
                let path = self.stringify(&path)?;
                self.include_path(&path, *kind)
            }
            Expr::Exit(code) => {
                let code = match code {
                    Some(expr) => self.eval_expr(expr)?,
                    None => Value::Int(0),
                };
                match code {
                    Value::Int(status) => Err(Error::Exit(status as i32)),
                    other => {
                        let message = self.stringify(&other)?;
                        self.write_output(&message)?;
                        Err(Error::Exit(0))
                    }
                }
            }
            Expr::Ternary {
                cond,
                then,
                otherwise,
            } => {
                let value = self.eval_expr(cond)?;
                match (value.is_truthy(), then) {
                    (true, Some(then)) => self.eval_expr(then),
                    (true, None) => Ok(value),
                    (false, _) => self.eval_expr(otherwise),
                }
            }
            Expr::Isset(exprs) => {
                for expr in exprs {
                    if matches!(self.read_quiet(expr)?, Value::Null) {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Expr::Empty(expr) => Ok(Value::Bool(!self.read_quiet(expr)?.is_truthy())),
            Expr::Instanceof { expr, class } => {
                let value = self.eval_expr(expr)?;
                let class = self.resolve_class_ref(class)?;
                Ok(Value::Bool(match &value {
                    Value::Object(object) => {
                        self.image.is_subclass_of(&object.borrow().class, &class)
                    }
                    Value::Enum(case) => self.image.is_subclass_of(&case.enum_name, &class),
                    Value::Closure(_) => class.eq_ignore_ascii_case("Closure"),
                    _ => false,
                }))
            }
            Expr::Throw(expr) => {
                let value = self.eval_expr(expr)?;
                Err(self.throw(value))
            }
            Expr::Print(expr) => {
                let value = self.eval_expr(expr)?;
                let text = self.stringify(&value)?;
                self.write_output(&text)?;
                Ok(Value::Int(1))
            }
            Expr::Cast { ty, expr } => {
                let value = self.eval_expr(expr)?;
                match ty {
                    CastType::String => Ok(Value::String(self.stringify(&value)?)),
                    _ => Ok(ops::cast(*ty, &value)),
                }
            }
            Expr::Match { subject, arms } => {
                let subject = self.eval_expr(subject)?;
                let mut default = None;
                for arm in arms {
                    let Some(conditions) = &arm.conditions else {
                        default = Some(&arm.body);
                        continue;
                    };
                    for condition in conditions {
                        if self.eval_expr(condition)?.identical(&subject) {
                            return self.eval_expr(&arm.body);
                        }
                    }
                }
                match default {
                    Some(body) => self.eval_expr(body),
                    None => Err(Error::exception(
                        "UnhandledMatchError",
                        format!("Unhandled match case {}", subject),
                    )),
                }
            }
        }
    }

    fn binary(&mut self, op: BinaryOp, left: &Value, right: &Value) -> Result<Value> {
        if op == BinaryOp::Concat {
            let mut text = self.stringify(left)?;
            text.push_str(&self.stringify(right)?);
            return Ok(Value::String(text));
        }
        ops::binary(op, left, right)
    }

    fn constant(&mut self, name: &str) -> Result<Value> {
        let file = self.current_file();
        match name {
            "__DIR__" => {
                let dir = match file.as_deref().and_then(Path::parent) {
                    Some(dir) => dir.to_path_buf(),
                    None => std::env::current_dir()?,
                };
                return Ok(Value::String(dir.display().to_string()));
            }
            "__FILE__" => {
                return Ok(Value::String(
                    file.map(|f| f.display().to_string()).unwrap_or_default(),
                ));
            }
            "__LINE__" => return Ok(Value::Int(0)),
            "__CLASS__" => return Ok(Value::String(self.current_class().unwrap_or_default())),
            "__FUNCTION__" => {
                let name = self.frames.last().map(|f| f.function.short_name().to_string());
                return Ok(Value::String(name.unwrap_or_default()));
            }
            "__METHOD__" => {
                let name = self.frames.last().map(|f| f.function.name.clone());
                return Ok(Value::String(name.unwrap_or_default()));
            }
            "__NAMESPACE__" => {
                return Ok(Value::String(self.names().namespace().unwrap_or_default().to_string()));
            }
            _ => {}
        }
        let candidates = self.names().resolve_function(name);
        candidates
            .iter()
            .find_map(|candidate| self.image.constant(candidate))
            .or_else(|| image::builtin_constant(name))
            .ok_or_else(|| Error::exception("Error", format!("Undefined constant \"{}\"", name)))
    }

    fn read_property(&mut self, target: &Value, name: &str) -> Result<Value> {
        match target {
            Value::Object(object) => {
                let object = object.borrow();
                match object.properties.get(name) {
                    Some(value) => Ok(value.clone()),
                    None => {
                        self.warn(&format!("Undefined property: {}::${}", object.class, name));
                        Ok(Value::Null)
                    }
                }
            }
            Value::Enum(case) => match name {
                "name" => Ok(Value::String(case.case.clone())),
                "value" => {
                    let mut value = None;
                    if let Some(def) = self.image.lookup_class(&case.enum_name) {
                        value = def
                            .cases
                            .iter()
                            .find(|(name, _)| *name == case.case)
                            .and_then(|(_, v)| v.clone());
                    }
                    value.ok_or_else(|| {
                        Error::exception(
                            "Error",
                            format!("Undefined property: {}::$value", case.enum_name),
                        )
                    })
                }
                _ => Err(Error::exception(
                    "Error",
                    format!("Undefined property: {}::${}", case.enum_name, name),
                )),
            },
            other => {
                self.warn(&format!(
                    "Attempt to read property \"{}\" on {}",
                    name,
                    other.type_name()
                ));
                Ok(Value::Null)
            }
        }
    }

    fn read_index(&mut self, container: &Value, index: &Value) -> Result<Value> {
        match container {
            Value::Array(array) => {
                let key = array_key(index)?;
                match array.get(&key) {
                    Some(value) => Ok(value.clone()),
                    None => {
                        self.warn(&format!("Undefined array key {}", key));
                        Ok(Value::Null)
                    }
                }
            }
            Value::String(text) => {
                let chars: Vec<char> = text.chars().collect();
                let offset = match index.to_number() {
                    Some(n) => n.as_f64() as i64,
                    None => {
                        return Err(Error::exception(
                            "TypeError",
                            "Cannot access offset of type string on string",
                        ));
                    }
                };
                let position = if offset < 0 { chars.len() as i64 + offset } else { offset };
                match usize::try_from(position).ok().and_then(|p| chars.get(p)) {
                    Some(c) => Ok(Value::String(c.to_string())),
                    None => {
                        self.warn(&format!("Uninitialized string offset {}", offset));
                        Ok(Value::String(String::new()))
                    }
                }
            }
            Value::Null => {
                self.warn("Trying to access array offset on null");
                Ok(Value::Null)
            }
            Value::Object(object) => Err(Error::exception(
                "Error",
                format!("Cannot use object of type {} as array", object.borrow().class),
            )),
            other => {
                self.warn(&format!(
                    "Trying to access array offset on {}",
                    other.type_name()
                ));
                Ok(Value::Null)
            }
        }
    }

    /// Store `value` into an assignable expression. Arrays are values, so
    /// writing into a nested element rebuilds each enclosing container.
    fn assign_to(&mut self, target: &Expr, value: Value) -> Result<()> {
        match target {
            Expr::Var(name) => self.set_var(name, value),
            Expr::Index { base, index } => {
                let container = self.read_quiet(base)?;
                let key = match index {
                    Some(index) => Some(array_key(&self.eval_expr(index)?)?),
                    None => None,
                };
                let mut array = match container {
                    Value::Null => ArrayValue::new(),
                    Value::Array(array) => array,
                    Value::Object(object) => {
                        return Err(Error::exception(
                            "Error",
                            format!("Cannot use object of type {} as array", object.borrow().class),
                        ));
                    }
                    Value::String(_) => {
                        return Err(Error::exception(
                            "Error",
                            "Cannot use string offset as an array",
                        ));
                    }
                    _ => {
                        return Err(Error::exception(
                            "Error",
                            "Cannot use a scalar value as an array",
                        ));
                    }
                };
                match key {
                    Some(key) => array.insert(key, value),
                    None => array.push(value),
                }
                self.assign_to(base, Value::Array(array))
            }
            Expr::PropFetch { object, name } => match self.eval_expr(object)? {
                Value::Object(object) => {
                    object.borrow_mut().properties.insert(name.clone(), value);
                    Ok(())
                }
                other => Err(Error::exception(
                    "Error",
                    format!("Attempt to assign property \"{}\" on {}", name, other.type_name()),
                )),
            },
            Expr::StaticPropFetch { class, name } => {
                let class = self.resolve_class_ref(class)?;
                let owner = self.image.static_property_owner(&class, name).ok_or_else(|| {
                    Error::exception(
                        "Error",
                        format!("Access to undeclared static property {}::${}", class, name),
                    )
                })?;
                owner.static_values.borrow_mut().insert(name.clone(), value);
                Ok(())
            }
            _ => Err(Error::Fatal("Cannot assign to this expression".into())),
        }
    }

    fn make_closure(&self, decl: &Rc<ClosureDecl>) -> Value {
        let function = UserFunction::from_closure(
            decl,
            self.current_class(),
            Rc::new(self.names().clone()),
            self.current_file(),
        );
        let captured = if decl.is_arrow {
            self.visible_vars()
        } else {
            decl.uses
                .iter()
                .filter_map(|name| self.get_var(name).map(|value| (name.clone(), value)))
                .collect()
        };
        let this = match (decl.is_static, self.current_this()) {
            (false, Some(Value::Object(object))) => Some(object),
            _ => None,
        };
        Value::Closure(Rc::new(Closure {
            function: Rc::new(function),
            captured,
            this,
        }))
    }

    fn throw(&mut self, value: Value) -> Error {
        let Value::Object(object) = value else {
            return Error::exception("Error", "Can only throw objects");
        };
        let (class, message, code) = {
            let borrowed = object.borrow();
            let message = borrowed
                .properties
                .get("message")
                .map(Value::to_output_string)
                .unwrap_or_default();
            let code = match borrowed.properties.get("code") {
                Some(Value::Int(code)) => *code,
                _ => 0,
            };
            (borrowed.class.clone(), message, code)
        };
        if !self.image.is_subclass_of(&class, "Throwable") {
            return Error::exception(
                "Error",
                "Cannot throw objects that do not implement Throwable",
            );
        }
        self.thrown = Some(object);
        Error::Exception { class, message, code }
    }

    // ── Calls ──

    fn call_named(&mut self, name: &str, args: &[Expr]) -> Result<Value> {
        let candidates = self.names().resolve_function(name);
        for candidate in &candidates {
            if let Some(function) = self.image.lookup_function(candidate) {
                return self.call_with_exprs(&function, args, Binding::default());
            }
        }
        let global = candidates.last().map(String::as_str).unwrap_or(name);
        if builtins::exists(global) {
            let mut values = self.eval_args(None, args)?;
            let result = builtins::call(self, global, &mut values)?;
            if builtins::modifies_first_arg(global) {
                if let (Some(target), Some(updated)) = (args.first(), values.into_iter().next()) {
                    if target.is_assignable() {
                        self.assign_to(target, updated)?;
                    }
                }
            }
            return Ok(result);
        }
        Err(undefined_function(name))
    }

    fn eval_args(&mut self, function: Option<&UserFunction>, args: &[Expr]) -> Result<Vec<Value>> {
        let mut values = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            let by_ref = function
                .and_then(|f| f.params.get(i))
                .is_some_and(|p| p.by_ref);
            values.push(if by_ref && arg.is_assignable() {
                self.read_quiet(arg)?
            } else {
                self.eval_expr(arg)?
            });
        }
        Ok(values)
    }

    fn call_with_exprs(
        &mut self,
        function: &Rc<UserFunction>,
        args: &[Expr],
        binding: Binding,
    ) -> Result<Value> {
        let values = self.eval_args(Some(function), args)?;
        let invocation = self.invoke(function, values, binding)?;
        for (i, value) in invocation.by_ref {
            if let Some(arg) = args.get(i) {
                if arg.is_assignable() {
                    self.assign_to(arg, value)?;
                }
            }
        }
        Ok(invocation.value)
    }

    fn invoke(
        &mut self,
        function: &Rc<UserFunction>,
        args: Vec<Value>,
        binding: Binding,
    ) -> Result<Invocation> {
        self.check_interrupt()?;
        if function.is_abstract {
            return Err(Error::exception(
                "Error",
                format!("Cannot call abstract method {}()", function.name),
            ));
        }
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(Error::Fatal(format!(
                "Maximum function nesting level of '{}' reached, aborting!",
                MAX_CALL_DEPTH
            )));
        }
        let required = function.required_params();
        if args.len() < required {
            return Err(Error::exception(
                "ArgumentCountError",
                format!(
                    "Too few arguments to function {}(), {} passed and at least {} expected",
                    function.name,
                    args.len(),
                    required
                ),
            ));
        }

        self.frames.push(Frame {
            function: function.clone(),
            locals: binding.captured,
            this: binding.this,
            class: binding.class,
            static_class: binding.static_class,
            globals: FxHashSet::default(),
            statics: FxHashSet::default(),
        });
        let result = self
            .bind_params(function, args)
            .and_then(|()| self.exec_block(&function.body));
        let frame = self.frames.pop();

        let value = match result? {
            Flow::Return(value) => value,
            _ => Value::Null,
        };
        let by_ref = match frame {
            Some(frame) => function
                .params
                .iter()
                .enumerate()
                .filter(|(_, p)| p.by_ref)
                .map(|(i, p)| (i, frame.locals.get(&p.name).cloned().unwrap_or_default()))
                .collect(),
            None => Vec::new(),
        };
        Ok(Invocation { value, by_ref })
    }

    fn bind_params(&mut self, function: &UserFunction, args: Vec<Value>) -> Result<()> {
        let mut args = args.into_iter();
        for param in &function.params {
            let value = if param.variadic {
                Value::Array(ArrayValue::from_list(args.by_ref()))
            } else if let Some(value) = args.next() {
                value
            } else {
                self.eval_optional(param.default.as_ref())?
            };
            if param.promoted.is_some() {
                if let Some(Value::Object(object)) = self.current_this() {
                    object.borrow_mut().properties.insert(param.name.clone(), value.clone());
                }
            }
            self.set_var(&param.name, value)?;
        }
        Ok(())
    }

    fn eval_method_call(&mut self, target: Value, method: &str, args: &[Expr]) -> Result<Value> {
        let class = match &target {
            Value::Object(object) => object.borrow().class.clone(),
            Value::Enum(case) => case.enum_name.clone(),
            Value::Closure(closure)
                if method.eq_ignore_ascii_case("__invoke") || method.eq_ignore_ascii_case("call") =>
            {
                let closure = closure.clone();
                let values = self.eval_args(Some(&closure.function), args)?;
                return self.call_value(&Value::Closure(closure), values);
            }
            other => {
                return Err(Error::exception(
                    "Error",
                    format!("Call to a member function {}() on {}", method, other.type_name()),
                ));
            }
        };
        match self.image.find_method(&class, method) {
            Some(function) => {
                let this = if function.is_static { None } else { Some(target) };
                let binding = Binding {
                    this,
                    class: function.class.clone(),
                    static_class: Some(class),
                    captured: BTreeMap::new(),
                };
                self.call_with_exprs(&function, args, binding)
            }
            None => {
                let values = self.eval_args(None, args)?;
                self.builtin_method(&target, &class, method, values)
            }
        }
    }

    /// Call a method on an object or enum case with evaluated arguments.
    pub(crate) fn call_method(
        &mut self,
        target: Value,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let class = match &target {
            Value::Object(object) => object.borrow().class.clone(),
            Value::Enum(case) => case.enum_name.clone(),
            other => {
                return Err(Error::exception(
                    "Error",
                    format!("Call to a member function {}() on {}", method, other.type_name()),
                ));
            }
        };
        match self.image.find_method(&class, method) {
            Some(function) => {
                let this = if function.is_static { None } else { Some(target) };
                let binding = Binding {
                    this,
                    class: function.class.clone(),
                    static_class: Some(class),
                    captured: BTreeMap::new(),
                };
                Ok(self.invoke(&function, args, binding)?.value)
            }
            None => self.builtin_method(&target, &class, method, args),
        }
    }

    /// Methods every throwable inherits.
    fn builtin_method(
        &mut self,
        target: &Value,
        class: &str,
        method: &str,
        _args: Vec<Value>,
    ) -> Result<Value> {
        if let Value::Object(object) = target {
            if self.image.is_subclass_of(class, "Throwable") {
                let object = object.borrow();
                let property =
                    |name: &str| object.properties.get(name).cloned().unwrap_or_default();
                match method.to_ascii_lowercase().as_str() {
                    "getmessage" => return Ok(property("message")),
                    "getcode" => return Ok(property("code")),
                    "getprevious" => return Ok(property("previous")),
                    "getfile" => return Ok(Value::string("")),
                    "getline" => return Ok(Value::Int(0)),
                    "gettraceasstring" => return Ok(Value::string("#0 {main}")),
                    _ => {}
                }
            }
        }
        Err(Error::exception(
            "Error",
            format!("Call to undefined method {}::{}()", class, method),
        ))
    }

    fn eval_static_call(&mut self, class_ref: &str, method: &str, args: &[Expr]) -> Result<Value> {
        let class = self.resolve_class_ref(class_ref)?;
        let forwarding =
            matches!(class_ref.to_ascii_lowercase().as_str(), "self" | "static" | "parent");
        match self.image.find_method(&class, method) {
            Some(function) => {
                let binding = self.static_binding(&function, &class, forwarding)?;
                self.call_with_exprs(&function, args, binding)
            }
            None => {
                let values = self.eval_args(None, args)?;
                self.builtin_static(&class, method, values)
            }
        }
    }

    fn call_static(&mut self, class_ref: &str, method: &str, args: Vec<Value>) -> Result<Value> {
        let class = self.resolve_class_ref(class_ref)?;
        match self.image.find_method(&class, method) {
            Some(function) => {
                let binding = self.static_binding(&function, &class, false)?;
                Ok(self.invoke(&function, args, binding)?.value)
            }
            None => self.builtin_static(&class, method, args),
        }
    }

    fn static_binding(
        &self,
        function: &UserFunction,
        class: &str,
        forwarding: bool,
    ) -> Result<Binding> {
        let this = if function.is_static {
            None
        } else {
            let this = self.current_this().filter(|this| match this {
                Value::Object(object) => self.image.is_subclass_of(&object.borrow().class, class),
                _ => false,
            });
            if this.is_none() {
                return Err(Error::exception(
                    "Error",
                    format!("Non-static method {}() cannot be called statically", function.name),
                ));
            }
            this
        };
        let static_class = if forwarding {
            self.frames
                .last()
                .and_then(|f| f.static_class.clone())
                .unwrap_or_else(|| class.to_string())
        } else {
            class.to_string()
        };
        Ok(Binding {
            this,
            class: function.class.clone(),
            static_class: Some(static_class),
            captured: BTreeMap::new(),
        })
    }

    /// `Enum::cases()`, `Enum::from()`, `Enum::tryFrom()` and the builtin
    /// exception constructor reached through `parent::__construct()`.
    fn builtin_static(&mut self, class: &str, method: &str, args: Vec<Value>) -> Result<Value> {
        let lower = method.to_ascii_lowercase();
        if let Some(def) = self.image.lookup_class(class).filter(|d| d.kind == ClassKind::Enum) {
            match lower.as_str() {
                "cases" => {
                    let cases = def.cases.iter().filter_map(|(name, _)| def.enum_case(name));
                    return Ok(Value::Array(ArrayValue::from_list(cases)));
                }
                "from" | "tryfrom" => {
                    let wanted = args.into_iter().next().unwrap_or_default();
                    let found = def
                        .cases
                        .iter()
                        .find(|(_, value)| value.as_ref().is_some_and(|v| v.loose_eq(&wanted)))
                        .and_then(|(name, _)| def.enum_case(name));
                    return match (found, lower.as_str()) {
                        (Some(case), _) => Ok(case),
                        (None, "tryfrom") => Ok(Value::Null),
                        (None, _) => Err(Error::exception(
                            "ValueError",
                            format!(
                                "{} is not a valid backing value for enum {}",
                                wanted, def.name
                            ),
                        )),
                    };
                }
                _ => {}
            }
        }
        if lower == "__construct" && self.image.is_subclass_of(class, "Throwable") {
            if let Some(Value::Object(object)) = self.current_this() {
                init_exception(&mut object.borrow_mut(), args);
                return Ok(Value::Null);
            }
        }
        Err(Error::exception(
            "Error",
            format!("Call to undefined method {}::{}()", class, method),
        ))
    }

    /// Create an instance and run its constructor.
    pub(crate) fn instantiate(&mut self, class: &str, args: Vec<Value>) -> Result<Value> {
        let Some(def) = self.image.lookup_class(class) else {
            if image::is_builtin_throwable(class) && !class.eq_ignore_ascii_case("Throwable") {
                let mut object = Object {
                    class: class.trim_start_matches('\\').to_string(),
                    properties: BTreeMap::new(),
                };
                init_exception(&mut object, args);
                return Ok(Value::Object(Rc::new(RefCell::new(object))));
            }
            return Err(Error::exception("Error", format!("Class \"{}\" not found", class)));
        };
        let kind = match def.kind {
            ClassKind::Class if def.is_abstract => Some("abstract class"),
            ClassKind::Class => None,
            other => Some(other.as_str()),
        };
        if let Some(kind) = kind {
            return Err(Error::exception(
                "Error",
                format!("Cannot instantiate {} {}", kind, def.name),
            ));
        }

        let mut properties = BTreeMap::new();
        let throwable = self.image.is_subclass_of(&def.name, "Throwable");
        if throwable {
            properties.insert("message".to_string(), Value::string(""));
            properties.insert("code".to_string(), Value::Int(0));
            properties.insert("previous".to_string(), Value::Null);
        }
        for ancestor in self.image.ancestry(&def.name).iter().rev() {
            for property in ancestor.properties.iter().filter(|p| !p.is_static) {
                properties.insert(property.name.clone(), property.default.clone());
            }
        }
        let object = Rc::new(RefCell::new(Object {
            class: def.name.clone(),
            properties,
        }));
        let value = Value::Object(object.clone());

        match self.image.find_method(&def.name, "__construct") {
            Some(constructor) => {
                let binding = Binding {
                    this: Some(value.clone()),
                    class: constructor.class.clone(),
                    static_class: Some(def.name.clone()),
                    captured: BTreeMap::new(),
                };
                self.invoke(&constructor, args, binding)?;
            }
            None if throwable => init_exception(&mut object.borrow_mut(), args),
            None => {}
        }
        Ok(value)
    }
}

fn undefined_function(name: &str) -> Error {
    Error::exception("Error", format!("Call to undefined function {}()", name))
}

fn array_key(value: &Value) -> Result<ArrayKey> {
    ArrayKey::from_value(value).ok_or_else(|| Error::exception("TypeError", "Illegal offset type"))
}

fn key_expr(key: &ArrayKey) -> Expr {
    match key {
        ArrayKey::Int(i) => Expr::Int(*i),
        ArrayKey::Str(s) => Expr::String(s.clone()),
    }
}

fn step(value: &Value, increment: bool) -> Result<Value> {
    let delta = if increment { BinaryOp::Add } else { BinaryOp::Sub };
    match value {
        Value::Null if increment => Ok(Value::Int(1)),
        Value::Null => Ok(Value::Null),
        Value::Int(_) | Value::Float(_) | Value::Bool(_) => {
            ops::binary(delta, value, &Value::Int(1))
        }
        Value::String(_) if value.to_number().is_some() => {
            ops::binary(delta, value, &Value::Int(1))
        }
        other => Ok(other.clone()),
    }
}

fn init_exception(object: &mut Object, args: Vec<Value>) {
    let mut args = args.into_iter();
    let message = args.next().unwrap_or_else(|| Value::string(""));
    let code = args.next().unwrap_or(Value::Int(0));
    let previous = args.next().unwrap_or_default();
    object
        .properties
        .insert("message".to_string(), Value::String(message.to_output_string()));
    object.properties.insert("code".to_string(), code);
    object.properties.insert("previous".to_string(), previous);
}

/// Rebuild a caught exception that was raised by the runtime itself.
fn exception_object(class: &str, message: &str, code: i64) -> Value {
    let mut object = Object {
        class: class.to_string(),
        properties: BTreeMap::new(),
    };
    init_exception(&mut object, vec![Value::string(message), Value::Int(code)]);
    Value::Object(Rc::new(RefCell::new(object)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interpreter() -> (Interpreter, Rc<RefCell<Vec<u8>>>) {
        let buffer = Rc::new(RefCell::new(Vec::new()));
        let interp = Interpreter::new(buffer.clone());
        (interp, buffer)
    }

    fn output(buffer: &Rc<RefCell<Vec<u8>>>) -> String {
        String::from_utf8_lossy(&buffer.borrow()).into_owned()
    }

    #[test]
    fn test_eval_returns_trailing_expression() {
        let (mut interp, _) = interpreter();
        assert_eq!(interp.eval("$a = 2; $a * 21").unwrap(), Some(Value::Int(42)));
        assert_eq!(interp.eval("echo 'x';").unwrap(), None);
        assert_eq!(interp.global("a"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_functions_are_hoisted() {
        let (mut interp, _) = interpreter();
        let value = interp
            .eval("$x = twice(4); function twice($n) { return $n * 2; } $x")
            .unwrap();
        assert_eq!(value, Some(Value::Int(8)));
    }

    #[test]
    fn test_redeclare_is_fatal() {
        let (mut interp, _) = interpreter();
        interp.eval("function f() {}").unwrap();
        let err = interp.eval("function f() {}").unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "fatal error: Cannot redeclare f()");
    }

    #[test]
    fn test_undefined_variable_warns() {
        let (mut interp, buffer) = interpreter();
        assert_eq!(interp.eval("$nope").unwrap(), Some(Value::Null));
        assert_eq!(output(&buffer), "Warning: Undefined variable $nope\n");
        assert_eq!(interp.eval("@$nope ?? 'd'").unwrap(), Some(Value::string("d")));
    }

    #[test]
    fn test_classes_and_methods() {
        let (mut interp, _) = interpreter();
        interp
            .eval(
                "class Counter {
                    const STEP = 2;
                    private $count = 0;
                    public function __construct(public string $label = 'c') {}
                    public function tick() { $this->count += self::STEP; return $this; }
                    public function count() { return $this->count; }
                    public static function make() { return new static(); }
                }",
            )
            .unwrap();
        let value = interp.eval("Counter::make()->tick()->tick()->count()").unwrap();
        assert_eq!(value, Some(Value::Int(4)));
        let label = interp.eval("(new Counter('x'))->label").unwrap();
        assert_eq!(label, Some(Value::string("x")));
        let def = interp.image().lookup_class("counter").unwrap();
        assert!(def.session_defined);
    }

    #[test]
    fn test_inheritance_and_parent_calls() {
        let (mut interp, _) = interpreter();
        interp
            .eval(
                "class Base { public function greet() { return 'hello'; } }
                 class Loud extends Base {
                     public function greet() { return strtoupper(parent::greet()); }
                 }",
            )
            .unwrap();
        assert_eq!(
            interp.eval("(new Loud)->greet()").unwrap(),
            Some(Value::string("HELLO"))
        );
        assert_eq!(
            interp.eval("(new Loud) instanceof Base").unwrap(),
            Some(Value::Bool(true))
        );
    }

    #[test]
    fn test_exceptions_are_catchable() {
        let (mut interp, _) = interpreter();
        interp
            .eval("class AppException extends Exception { public $extra = 'kept'; }")
            .unwrap();
        let value = interp
            .eval(
                "try { throw new AppException('boom', 3); }
                 catch (RuntimeException $e) { $r = 'wrong'; }
                 catch (Exception $e) { $r = $e->getMessage() . $e->getCode() . $e->extra; }
                 finally { $done = true; }
                 $r",
            )
            .unwrap();
        assert_eq!(value, Some(Value::string("boom3kept")));
        assert_eq!(interp.global("done"), Some(&Value::Bool(true)));

        let err = interp.eval("throw new LogicException('nope');").unwrap_err();
        assert_eq!(err.to_string(), "LogicException: nope");

        let caught = interp
            .eval("try { intdiv(1, 0); } catch (DivisionByZeroError $e) { $e->getMessage(); }")
            .unwrap();
        assert_eq!(caught, None);
    }

    #[test]
    fn test_closures_capture_by_value() {
        let (mut interp, _) = interpreter();
        let value = interp
            .eval(
                "$base = 10;
                 $add = function ($n) use ($base) { return $n + $base; };
                 $mul = fn($n) => $n * $base;
                 $base = 0;
                 $add(1) + $mul(2)",
            )
            .unwrap();
        assert_eq!(value, Some(Value::Int(31)));
    }

    #[test]
    fn test_static_and_global_bindings() {
        let (mut interp, _) = interpreter();
        interp
            .eval(
                "$total = 0;
                 function counter() { static $n = 0; global $total; $n++; $total += 10; return $n; }
                 counter(); counter();",
            )
            .unwrap();
        assert_eq!(interp.eval("counter()").unwrap(), Some(Value::Int(3)));
        assert_eq!(interp.global("total"), Some(&Value::Int(30)));
    }

    #[test]
    fn test_by_reference_parameters() {
        let (mut interp, _) = interpreter();
        let value = interp
            .eval(
                "function push(&$list, $v) { $list[] = $v; }
                 $items = [];
                 push($items, 'a'); push($items, 'b');
                 count($items)",
            )
            .unwrap();
        assert_eq!(value, Some(Value::Int(2)));
    }

    #[test]
    fn test_nested_array_writes() {
        let (mut interp, _) = interpreter();
        let value = interp
            .eval("$a = []; $a['x']['y'][] = 5; $a['x']['y'][0]")
            .unwrap();
        assert_eq!(value, Some(Value::Int(5)));
        interp.eval("foreach ($a['x']['y'] as &$v) { $v = $v * 2; }").unwrap();
        assert_eq!(interp.eval("$a['x']['y'][0]").unwrap(), Some(Value::Int(10)));
    }

    #[test]
    fn test_enums() {
        let (mut interp, _) = interpreter();
        interp
            .eval(
                "enum Suit: string {
                    case Hearts = 'H';
                    case Spades = 'S';
                    public function label() { return ucfirst(strtolower($this->name)); }
                }",
            )
            .unwrap();
        assert_eq!(
            interp.eval("Suit::from('S')->label()").unwrap(),
            Some(Value::string("Spades"))
        );
        assert_eq!(interp.eval("count(Suit::cases())").unwrap(), Some(Value::Int(2)));
        assert_eq!(interp.eval("Suit::tryFrom('X')").unwrap(), Some(Value::Null));
        assert_eq!(
            interp.eval("Suit::Hearts->value").unwrap(),
            Some(Value::string("H"))
        );
    }

    #[test]
    fn test_traits_and_interfaces() {
        let (mut interp, _) = interpreter();
        interp
            .eval(
                "interface Named { public function name(); }
                 trait Hello { public function hello() { return 'hi ' . $this->name(); } }
                 class Person implements Named {
                     use Hello;
                     public function name() { return 'ann'; }
                 }",
            )
            .unwrap();
        assert_eq!(
            interp.eval("(new Person)->hello()").unwrap(),
            Some(Value::string("hi ann"))
        );
        assert_eq!(
            interp.eval("new Person instanceof Named").unwrap(),
            Some(Value::Bool(true))
        );
        assert!(interp.eval("new Named").is_err());
    }

    #[test]
    fn test_switch_and_match() {
        let (mut interp, _) = interpreter();
        let value = interp
            .eval(
                "$out = '';
                 foreach ([1, 2, 3] as $n) {
                     switch ($n) {
                         case 1: $out .= 'a';
                         case 2: $out .= 'b'; break;
                         default: $out .= 'c';
                     }
                 }
                 $out . match(true) { false => 'x', default => 'y' }",
            )
            .unwrap();
        assert_eq!(value, Some(Value::string("abbcy")));
        let err = interp.eval("match(5) { 1 => 'one' }").unwrap_err();
        assert!(err.to_string().starts_with("UnhandledMatchError"));
    }

    #[test]
    fn test_interrupt_stops_loops() {
        let (mut interp, _) = interpreter();
        interp.interrupt_handle().interrupt();
        let err = interp.eval("while (true) {}").unwrap_err();
        assert!(matches!(err, Error::Interrupted));
    }

    #[test]
    fn test_exit_carries_status() {
        let (mut interp, buffer) = interpreter();
        assert!(matches!(interp.eval("exit(3);"), Err(Error::Exit(3))));
        assert!(matches!(interp.eval("die('bye');"), Err(Error::Exit(0))));
        assert_eq!(output(&buffer), "bye");
    }

    #[test]
    fn test_include_resolves_and_records_files() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("lib.php");
        fs::write(
            &lib,
            concat!(
                "<?php\nnamespace App;\nconst VERSION = '1.2';\n",
                "function version() { return VERSION; }\nreturn 'loaded';\n",
            ),
        )
        .unwrap();

        let (mut interp, buffer) = interpreter();
        let path = lib.display().to_string();
        let value = interp.eval(&format!("require_once '{}'", path)).unwrap();
        assert_eq!(value, Some(Value::string("loaded")));
        assert_eq!(interp.eval("\\App\\version()").unwrap(), Some(Value::string("1.2")));
        assert_eq!(interp.loaded_files(), &[lib.canonicalize().unwrap()]);
        assert_eq!(
            interp.eval(&format!("require_once '{}'", path)).unwrap(),
            Some(Value::Bool(true))
        );

        assert_eq!(
            interp.eval("include 'missing.php'").unwrap(),
            Some(Value::Bool(false))
        );
        assert!(output(&buffer).contains("Failed to open stream"));
        assert!(interp.eval("require 'missing.php';").unwrap_err().is_fatal());
    }

    #[test]
    fn test_to_string_and_interpolation() {
        let (mut interp, _) = interpreter();
        interp
            .eval(
                "class Tag {
                     public $name = 'b';
                     public function __toString() { return '<' . $this->name . '>'; }
                 }",
            )
            .unwrap();
        let value = interp
            .eval("$t = new Tag; $arr = ['k' => 'v']; \"{$t} $arr[k] {$t->name}\"")
            .unwrap();
        assert_eq!(value, Some(Value::string("<b> v b")));
    }
}
