//! Symbol tables of the running program.
//!
//! Every lookup consults the override tables before the declared
//! definitions, which is what makes the image hot-patchable.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use tracing::debug;

use super::UserFunction;
use super::ops;
use crate::reload::{Callable, ClassShape, CodePatcher, PatchError};
use crate::syntax::NameContext;
use crate::syntax::ast::{ClassKind, Expr, UnaryOp, Visibility};
use crate::value::{ArrayValue, EnumCase, Value};

/// A declared property.
#[derive(Debug, Clone)]
pub struct PropertyDef {
    pub name: String,
    pub default: Value,
    pub visibility: Visibility,
    pub is_static: bool,
}

/// A declared class, interface, trait or enum.
#[derive(Debug)]
pub struct ClassDef {
    pub name: String,
    pub kind: ClassKind,
    pub parent: Option<String>,
    pub interfaces: Vec<String>,
    pub is_abstract: bool,
    pub constants: FxHashMap<String, Value>,
    pub properties: Vec<PropertyDef>,
    /// Keyed by lowercased name.
    pub methods: FxHashMap<String, Rc<UserFunction>>,
    /// Enum cases in declaration order, with their backing values.
    pub cases: Vec<(String, Option<Value>)>,
    pub static_values: RefCell<BTreeMap<String, Value>>,
    /// Declared from REPL input rather than a source file.
    pub session_defined: bool,
    pub file: Option<PathBuf>,
}

impl ClassDef {
    pub fn new(name: String, kind: ClassKind) -> Self {
        Self {
            name,
            kind,
            parent: None,
            interfaces: Vec::new(),
            is_abstract: false,
            constants: FxHashMap::default(),
            properties: Vec::new(),
            methods: FxHashMap::default(),
            cases: Vec::new(),
            static_values: RefCell::new(BTreeMap::new()),
            session_defined: false,
            file: None,
        }
    }

    pub fn enum_case(&self, case: &str) -> Option<Value> {
        self.cases.iter().any(|(name, _)| name == case).then(|| {
            Value::Enum(EnumCase {
                enum_name: self.name.clone(),
                case: case.to_string(),
                session_defined: self.session_defined,
            })
        })
    }
}

/// Functions, classes and constants of the running program.
#[derive(Debug, Default)]
pub struct RuntimeImage {
    functions: FxHashMap<String, Rc<UserFunction>>,
    function_overrides: FxHashMap<String, Rc<UserFunction>>,
    classes: FxHashMap<String, Rc<ClassDef>>,
    method_overrides: FxHashMap<(String, String), Rc<UserFunction>>,
    constants: FxHashMap<String, Value>,
    class_constant_overrides: FxHashMap<(String, String), Value>,
}

fn key(name: &str) -> String {
    name.trim_start_matches('\\').to_ascii_lowercase()
}

fn const_key(name: &str) -> String {
    name.trim_start_matches('\\').to_string()
}

impl RuntimeImage {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Functions ──

    pub fn lookup_function(&self, name: &str) -> Option<Rc<UserFunction>> {
        let key = key(name);
        self.function_overrides
            .get(&key)
            .or_else(|| self.functions.get(&key))
            .cloned()
    }

    pub fn has_function(&self, name: &str) -> bool {
        let key = key(name);
        self.functions.contains_key(&key) || self.function_overrides.contains_key(&key)
    }

    /// Declare a function. Fails if the name is taken.
    pub fn declare_function(&mut self, function: Rc<UserFunction>) -> Result<(), PatchError> {
        let key = key(&function.name);
        if self.has_function(&key) {
            return Err(PatchError::AlreadyDefined(format!("{}()", function.name)));
        }
        self.functions.insert(key, function);
        Ok(())
    }

    // ── Classes ──

    pub fn lookup_class(&self, name: &str) -> Option<Rc<ClassDef>> {
        self.classes.get(&key(name)).cloned()
    }

    pub fn has_class(&self, name: &str) -> bool {
        self.classes.contains_key(&key(name))
    }

    pub fn declare_class(&mut self, class: ClassDef) -> Result<Rc<ClassDef>, PatchError> {
        let key = key(&class.name);
        if self.classes.contains_key(&key) {
            return Err(PatchError::AlreadyDefined(class.name));
        }
        let class = Rc::new(class);
        self.classes.insert(key, class.clone());
        Ok(class)
    }

    /// Class and its ancestors, nearest first.
    pub fn ancestry(&self, name: &str) -> Vec<Rc<ClassDef>> {
        let mut chain = Vec::new();
        let mut next = self.lookup_class(name);
        while let Some(class) = next {
            // Guard against a class that names itself as parent.
            if chain.iter().any(|c: &Rc<ClassDef>| Rc::ptr_eq(c, &class)) {
                break;
            }
            next = class.parent.as_deref().and_then(|p| self.lookup_class(p));
            chain.push(class);
        }
        chain
    }

    /// Resolve a method through overrides and the inheritance chain.
    pub fn find_method(&self, class: &str, method: &str) -> Option<Rc<UserFunction>> {
        let method = method.to_ascii_lowercase();
        for def in self.ancestry(class) {
            let class_key = key(&def.name);
            if let Some(found) = self.method_overrides.get(&(class_key, method.clone())) {
                return Some(found.clone());
            }
            if let Some(found) = def.methods.get(&method) {
                return Some(found.clone());
            }
        }
        None
    }

    /// Whether `class` is `target` or extends/implements it.
    pub fn is_subclass_of(&self, class: &str, target: &str) -> bool {
        let target = key(target);
        let mut pending = vec![key(class)];
        let mut seen = Vec::new();
        while let Some(current) = pending.pop() {
            if current == target {
                return true;
            }
            if seen.contains(&current) {
                continue;
            }
            match self.lookup_class(&current) {
                Some(def) => {
                    pending.extend(def.parent.iter().map(|p| key(p)));
                    pending.extend(def.interfaces.iter().map(|i| key(i)));
                }
                None => {
                    if let Some(parent) = builtin_parent(&current) {
                        pending.push(parent.to_ascii_lowercase());
                    }
                }
            }
            seen.push(current);
        }
        false
    }

    /// Look up a class constant or enum case, honouring overrides.
    pub fn class_constant(&self, class: &str, name: &str) -> Option<Value> {
        for def in self.ancestry(class) {
            let pair = (key(&def.name), name.to_string());
            if let Some(value) = self.class_constant_overrides.get(&pair) {
                return Some(value.clone());
            }
            if let Some(value) = def.constants.get(name) {
                return Some(value.clone());
            }
            if let Some(case) = def.enum_case(name) {
                return Some(case);
            }
        }
        None
    }

    /// Find the class in the chain declaring static property `name`.
    pub fn static_property_owner(&self, class: &str, name: &str) -> Option<Rc<ClassDef>> {
        self.ancestry(class)
            .into_iter()
            .find(|def| def.properties.iter().any(|p| p.is_static && p.name == name))
    }

    // ── Constants ──

    pub fn constant(&self, name: &str) -> Option<Value> {
        self.constants.get(&const_key(name)).cloned()
    }

    pub fn define_constant(&mut self, name: &str, value: Value) -> bool {
        let key = const_key(name);
        if self.constants.contains_key(&key) {
            return false;
        }
        self.constants.insert(key, value);
        true
    }

    fn eval_const(&self, expr: &Expr, names: &NameContext) -> Result<Value, PatchError> {
        let not_constant = |what: &str| PatchError::NotConstant(what.to_string());
        Ok(match expr {
            Expr::Null => Value::Null,
            Expr::Bool(b) => Value::Bool(*b),
            Expr::Int(i) => Value::Int(*i),
            Expr::Float(f) => Value::Float(*f),
            Expr::String(s) => Value::String(s.clone()),
            Expr::Array(items) => {
                let mut array = ArrayValue::new();
                for item in items {
                    let value = self.eval_const(&item.value, names)?;
                    match &item.key {
                        Some(key) => {
                            let key = self.eval_const(key, names)?;
                            let key = crate::value::ArrayKey::from_value(&key)
                                .ok_or_else(|| not_constant("illegal array key"))?;
                            array.insert(key, value);
                        }
                        None => array.push(value),
                    }
                }
                Value::Array(array)
            }
            Expr::Unary { op, expr } if *op != UnaryOp::Silence => {
                let value = self.eval_const(expr, names)?;
                ops::unary(*op, &value).map_err(|e| not_constant(&e.to_string()))?
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval_const(left, names)?;
                let right = self.eval_const(right, names)?;
                ops::binary(*op, &left, &right).map_err(|e| not_constant(&e.to_string()))?
            }
            Expr::Ternary {
                cond,
                then,
                otherwise,
            } => {
                let cond_value = self.eval_const(cond, names)?;
                match (cond_value.is_truthy(), then) {
                    (true, Some(then)) => self.eval_const(then, names)?,
                    (true, None) => cond_value,
                    (false, _) => self.eval_const(otherwise, names)?,
                }
            }
            Expr::ConstFetch(name) => names
                .resolve_function(name)
                .iter()
                .find_map(|candidate| self.constant(candidate))
                .or_else(|| builtin_constant(name))
                .ok_or_else(|| not_constant(&format!("undefined constant {}", name)))?,
            Expr::ClassConstFetch { class, name } => {
                let class = names.resolve_class(class);
                if name.eq_ignore_ascii_case("class") {
                    return Ok(Value::String(class));
                }
                self.class_constant(&class, name).ok_or_else(|| {
                    not_constant(&format!("undefined constant {}::{}", class, name))
                })?
            }
            _ => return Err(not_constant("expression is not constant")),
        })
    }
}

/// Parents of the builtin throwable hierarchy.
pub fn builtin_parent(class: &str) -> Option<&'static str> {
    Some(match class.trim_start_matches('\\').to_ascii_lowercase().as_str() {
        "exception" | "error" => "Throwable",
        "errorexception" | "runtimeexception" | "logicexception" | "jsonexception" => "Exception",
        "invalidargumentexception"
        | "domainexception"
        | "lengthexception"
        | "outofrangeexception" => "LogicException",
        "outofboundsexception" | "overflowexception" | "rangeexception" | "underflowexception"
        | "unexpectedvalueexception" => "RuntimeException",
        "typeerror" | "valueerror" | "arithmeticerror" | "unhandledmatcherror" => "Error",
        "argumentcounterror" => "TypeError",
        "divisionbyzeroerror" => "ArithmeticError",
        _ => return None,
    })
}

/// Whether `class` names a builtin throwable.
pub fn is_builtin_throwable(class: &str) -> bool {
    class.trim_start_matches('\\').eq_ignore_ascii_case("throwable")
        || builtin_parent(class).is_some()
}

pub fn builtin_constant(name: &str) -> Option<Value> {
    Some(match name.trim_start_matches('\\') {
        "PHP_EOL" => Value::string("\n"),
        "PHP_INT_MAX" => Value::Int(i64::MAX),
        "PHP_INT_MIN" => Value::Int(i64::MIN),
        "PHP_INT_SIZE" => Value::Int(8),
        "PHP_FLOAT_EPSILON" => Value::Float(f64::EPSILON),
        "M_PI" => Value::Float(std::f64::consts::PI),
        "NAN" => Value::Float(f64::NAN),
        "INF" => Value::Float(f64::INFINITY),
        _ => return None,
    })
}

impl CodePatcher for RuntimeImage {
    fn is_supported(&self) -> bool {
        true
    }

    fn class_shape(&self, name: &str) -> Option<ClassShape> {
        let class = self.lookup_class(name)?;
        let mut properties = Vec::new();
        let mut methods = Vec::new();
        for def in self.ancestry(name) {
            properties.extend(def.properties.iter().map(|p| p.name.clone()));
            methods.extend(def.methods.keys().cloned());
            let class_key = key(&def.name);
            methods.extend(
                self.method_overrides
                    .keys()
                    .filter(|(c, _)| *c == class_key)
                    .map(|(_, m)| m.clone()),
            );
        }
        properties.sort();
        properties.dedup();
        methods.sort();
        methods.dedup();
        Some(ClassShape {
            kind: class.kind,
            name: class.name.clone(),
            parent: class.parent.clone(),
            interfaces: class.interfaces.clone(),
            properties,
            methods,
        })
    }

    fn function_exists(&self, name: &str) -> bool {
        self.has_function(name)
    }

    fn evaluate_constant(&self, expr: &Expr, names: &NameContext) -> Result<Value, PatchError> {
        self.eval_const(expr, names)
    }

    fn override_method(
        &mut self,
        class: &str,
        method: &str,
        body: Callable,
    ) -> Result<(), PatchError> {
        let def = self
            .lookup_class(class)
            .ok_or_else(|| PatchError::UnknownClass(class.to_string()))?;
        debug!("Overriding method {}::{}", def.name, method);
        self.method_overrides
            .insert((key(&def.name), method.to_ascii_lowercase()), body);
        Ok(())
    }

    fn override_function(&mut self, name: &str, body: Callable) -> Result<(), PatchError> {
        if !self.has_function(name) {
            return Err(PatchError::UnknownFunction(name.to_string()));
        }
        debug!("Overriding function {}", name);
        self.function_overrides.insert(key(name), body);
        Ok(())
    }

    fn define_function(&mut self, name: &str, body: Callable) -> Result<(), PatchError> {
        if self.has_function(name) {
            return Err(PatchError::AlreadyDefined(format!("{}()", name)));
        }
        debug!("Defining function {}", name);
        self.functions.insert(key(name), body);
        Ok(())
    }

    fn redefine_constant(
        &mut self,
        class: Option<&str>,
        name: &str,
        value: Value,
    ) -> Result<(), PatchError> {
        match class {
            Some(class) => {
                let def = self
                    .lookup_class(class)
                    .ok_or_else(|| PatchError::UnknownClass(class.to_string()))?;
                self.class_constant_overrides
                    .insert((key(&def.name), name.to_string()), value);
            }
            None => {
                self.constants.insert(const_key(name), value);
            }
        }
        Ok(())
    }

    fn unset_override(&mut self, class: Option<&str>, name: &str) -> Result<bool, PatchError> {
        Ok(match class {
            Some(class) => self
                .method_overrides
                .remove(&(key(class), name.to_ascii_lowercase()))
                .is_some(),
            None => self.function_overrides.remove(&key(name)).is_some(),
        })
    }

    fn undefine_constant(&mut self, class: Option<&str>, name: &str) -> Result<bool, PatchError> {
        Ok(match class {
            Some(class) => self
                .class_constant_overrides
                .remove(&(key(class), name.to_string()))
                .is_some(),
            None => self.constants.remove(&const_key(name)).is_some(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::{StmtKind, parse, parse_expression};

    fn function(src: &str) -> Rc<UserFunction> {
        let StmtKind::Function(decl) = parse(src).unwrap().remove(0).kind else {
            panic!("expected function");
        };
        Rc::new(UserFunction::from_function(
            &decl,
            decl.name.clone(),
            Rc::default(),
            None,
        ))
    }

    #[test]
    fn test_function_override_takes_precedence() {
        let mut image = RuntimeImage::new();
        image
            .declare_function(function("function greet() { return 'hi'; }"))
            .unwrap();
        let replacement = function("function greet() { return 'hello'; }");
        image.override_function("GREET", replacement.clone()).unwrap();
        assert!(Rc::ptr_eq(&image.lookup_function("greet").unwrap(), &replacement));

        assert!(image.unset_override(None, "greet").unwrap());
        assert!(!Rc::ptr_eq(&image.lookup_function("greet").unwrap(), &replacement));
    }

    #[test]
    fn test_define_and_override_errors() {
        let mut image = RuntimeImage::new();
        let f = function("function helper() {}");
        assert_eq!(
            image.override_function("helper", f.clone()),
            Err(PatchError::UnknownFunction("helper".into()))
        );
        image.define_function("helper", f.clone()).unwrap();
        assert!(matches!(
            image.define_function("helper", f),
            Err(PatchError::AlreadyDefined(_))
        ));
    }

    #[test]
    fn test_method_override_and_shape() {
        let mut image = RuntimeImage::new();
        let mut def = ClassDef::new("Greeter".into(), ClassKind::Class);
        def.properties.push(PropertyDef {
            name: "name".into(),
            default: Value::Null,
            visibility: Visibility::Public,
            is_static: false,
        });
        image.declare_class(def).unwrap();

        let body = function("function shout() { return 'HI'; }");
        image.override_method("greeter", "shout", body.clone()).unwrap();
        assert!(Rc::ptr_eq(&image.find_method("Greeter", "SHOUT").unwrap(), &body));

        let shape = image.class_shape("Greeter").unwrap();
        assert_eq!(shape.properties, vec!["name".to_string()]);
        assert!(shape.has_method("shout"));

        assert_eq!(
            image.override_method("Missing", "x", body),
            Err(PatchError::UnknownClass("Missing".into()))
        );
    }

    #[test]
    fn test_constants() {
        let mut image = RuntimeImage::new();
        assert!(image.define_constant("GREETING", Value::string("hi")));
        assert!(!image.define_constant("GREETING", Value::string("again")));

        let expr = parse_expression("GREETING . ', ' . 'there'").unwrap();
        assert_eq!(
            image.evaluate_constant(&expr, &NameContext::new()).unwrap(),
            Value::string("hi, there")
        );

        image
            .redefine_constant(None, "GREETING", Value::string("hello"))
            .unwrap();
        assert_eq!(image.constant("GREETING"), Some(Value::string("hello")));
        assert!(image.undefine_constant(None, "GREETING").unwrap());
        assert_eq!(image.constant("GREETING"), None);

        let call = parse_expression("strlen('x')").unwrap();
        assert!(matches!(
            image.evaluate_constant(&call, &NameContext::new()),
            Err(PatchError::NotConstant(_))
        ));
    }

    #[test]
    fn test_builtin_hierarchy() {
        let image = RuntimeImage::new();
        assert!(image.is_subclass_of("InvalidArgumentException", "Exception"));
        assert!(image.is_subclass_of("DivisionByZeroError", "Throwable"));
        assert!(!image.is_subclass_of("TypeError", "Exception"));
    }
}
