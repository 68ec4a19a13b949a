//! Native functions available to every program.

use std::fmt::Write as _;
use std::thread;
use std::time::Duration;

use super::Interpreter;
use super::image;
use super::ops;
use crate::error::{Error, Result};
use crate::reload::CodePatcher;
use crate::syntax::ast::{BinaryOp, CastType, ClassKind};
use crate::value::{ArrayKey, ArrayValue, Resource, Value};

const NAMES: &[&str] = &[
    "abort",
    "abs",
    "array_filter",
    "array_key_exists",
    "array_keys",
    "array_map",
    "array_merge",
    "array_pop",
    "array_push",
    "array_sum",
    "array_values",
    "ceil",
    "class_exists",
    "constant",
    "count",
    "define",
    "defined",
    "enum_exists",
    "explode",
    "fclose",
    "floatval",
    "floor",
    "function_exists",
    "get_class",
    "get_object_vars",
    "getpid",
    "gettype",
    "implode",
    "in_array",
    "intdiv",
    "interface_exists",
    "intval",
    "is_array",
    "is_bool",
    "is_callable",
    "is_float",
    "is_int",
    "is_null",
    "is_numeric",
    "is_object",
    "is_string",
    "join",
    "max",
    "method_exists",
    "min",
    "print_r",
    "property_exists",
    "range",
    "round",
    "sizeof",
    "sleep",
    "sort",
    "sprintf",
    "str_contains",
    "str_repeat",
    "str_starts_with",
    "strlen",
    "strtolower",
    "strtoupper",
    "strval",
    "tmpfile",
    "trim",
    "ucfirst",
    "usleep",
    "var_dump",
];

/// Longest uninterrupted sleep slice.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

pub(crate) fn exists(name: &str) -> bool {
    let lower = name.trim_start_matches('\\').to_ascii_lowercase();
    NAMES.binary_search(&lower.as_str()).is_ok()
}

/// Builtins that write their result back into the first argument.
pub(crate) fn modifies_first_arg(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "array_push" | "array_pop" | "sort"
    )
}

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or_default()
}

fn string_arg(interp: &mut Interpreter, args: &[Value], index: usize) -> Result<String> {
    interp.stringify(&arg(args, index))
}

fn int_arg(args: &[Value], index: usize) -> i64 {
    match ops::cast(CastType::Int, &arg(args, index)) {
        Value::Int(i) => i,
        _ => 0,
    }
}

fn array_arg(function: &str, args: &[Value], index: usize) -> Result<ArrayValue> {
    match arg(args, index) {
        Value::Array(array) => Ok(array),
        other => Err(Error::exception(
            "TypeError",
            format!(
                "{}(): Argument #{} must be of type array, {} given",
                function,
                index + 1,
                other.type_name()
            ),
        )),
    }
}

/// Class name from an object, enum case or class-name string.
fn class_of(value: &Value) -> Option<String> {
    match value {
        Value::Object(object) => Some(object.borrow().class.clone()),
        Value::Enum(case) => Some(case.enum_name.clone()),
        Value::String(name) => Some(name.trim_start_matches('\\').to_string()),
        _ => None,
    }
}

pub(crate) fn call(interp: &mut Interpreter, name: &str, args: &mut Vec<Value>) -> Result<Value> {
    let lower = name.trim_start_matches('\\').to_ascii_lowercase();
    Ok(match lower.as_str() {
        // ── Strings ──
        "strlen" => Value::Int(string_arg(interp, args, 0)?.len() as i64),
        "strtoupper" => Value::String(string_arg(interp, args, 0)?.to_uppercase()),
        "strtolower" => Value::String(string_arg(interp, args, 0)?.to_lowercase()),
        "ucfirst" => {
            let text = string_arg(interp, args, 0)?;
            let mut chars = text.chars();
            Value::String(match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            })
        }
        "trim" => Value::string(string_arg(interp, args, 0)?.trim()),
        "str_repeat" => {
            let count = usize::try_from(int_arg(args, 1)).map_err(|_| {
                Error::exception(
                    "ValueError",
                    "str_repeat(): Argument #2 ($times) must be greater than or equal to 0",
                )
            })?;
            Value::String(string_arg(interp, args, 0)?.repeat(count))
        }
        "str_contains" => {
            let haystack = string_arg(interp, args, 0)?;
            Value::Bool(haystack.contains(&string_arg(interp, args, 1)?))
        }
        "str_starts_with" => {
            let haystack = string_arg(interp, args, 0)?;
            Value::Bool(haystack.starts_with(&string_arg(interp, args, 1)?))
        }
        "implode" | "join" => {
            let (glue, pieces) = match (arg(args, 0), arg(args, 1)) {
                (Value::Array(pieces), Value::Null) => (String::new(), pieces),
                (glue, Value::Array(pieces)) => (interp.stringify(&glue)?, pieces),
                (Value::Array(pieces), glue) => (interp.stringify(&glue)?, pieces),
                _ => {
                    return Err(Error::exception(
                        "TypeError",
                        "implode(): Argument #2 ($array) must be of type ?array",
                    ));
                }
            };
            let mut parts = Vec::with_capacity(pieces.len());
            for piece in pieces.values() {
                parts.push(interp.stringify(piece)?);
            }
            Value::String(parts.join(&glue))
        }
        "explode" => {
            let separator = string_arg(interp, args, 0)?;
            if separator.is_empty() {
                return Err(Error::exception(
                    "ValueError",
                    "explode(): Argument #1 ($separator) cannot be empty",
                ));
            }
            let text = string_arg(interp, args, 1)?;
            Value::Array(ArrayValue::from_list(text.split(&separator).map(Value::string)))
        }
        "sprintf" => Value::String(sprintf(interp, args)?),
        "strval" => Value::String(string_arg(interp, args, 0)?),
        "intval" => ops::cast(CastType::Int, &arg(args, 0)),
        "floatval" => ops::cast(CastType::Float, &arg(args, 0)),

        // ── Arrays ──
        "count" | "sizeof" => match arg(args, 0) {
            Value::Array(array) => Value::Int(array.len() as i64),
            other => {
                return Err(Error::exception(
                    "TypeError",
                    format!(
                        "count(): Argument #1 ($value) must be of type Countable|array, {} given",
                        other.type_name()
                    ),
                ));
            }
        },
        "array_keys" => {
            let array = array_arg("array_keys", args, 0)?;
            Value::Array(ArrayValue::from_list(array.iter().map(|(k, _)| k.to_value())))
        }
        "array_values" => {
            let array = array_arg("array_values", args, 0)?;
            Value::Array(ArrayValue::from_list(array.values().cloned()))
        }
        "array_merge" => {
            let mut merged = ArrayValue::new();
            for index in 0..args.len() {
                for (key, value) in array_arg("array_merge", args, index)?.iter() {
                    match key {
                        ArrayKey::Int(_) => merged.push(value.clone()),
                        ArrayKey::Str(_) => merged.insert(key.clone(), value.clone()),
                    }
                }
            }
            Value::Array(merged)
        }
        "array_map" => {
            let callback = arg(args, 0);
            let array = array_arg("array_map", args, 1)?;
            let mut mapped = ArrayValue::new();
            for (key, value) in array.iter() {
                let result = interp.call_value(&callback, vec![value.clone()])?;
                mapped.insert(key.clone(), result);
            }
            Value::Array(mapped)
        }
        "array_filter" => {
            let array = array_arg("array_filter", args, 0)?;
            let callback = arg(args, 1);
            let mut kept = ArrayValue::new();
            for (key, value) in array.iter() {
                let keep = match callback {
                    Value::Null => value.is_truthy(),
                    _ => interp.call_value(&callback, vec![value.clone()])?.is_truthy(),
                };
                if keep {
                    kept.insert(key.clone(), value.clone());
                }
            }
            Value::Array(kept)
        }
        "array_sum" => {
            let mut sum = Value::Int(0);
            for value in array_arg("array_sum", args, 0)?.values() {
                sum = ops::binary(BinaryOp::Add, &sum, value)?;
            }
            sum
        }
        "array_key_exists" => {
            let array = array_arg("array_key_exists", args, 1)?;
            let key = ArrayKey::from_value(&arg(args, 0));
            Value::Bool(key.is_some_and(|key| array.contains_key(&key)))
        }
        "in_array" => {
            let needle = arg(args, 0);
            let strict = arg(args, 2).is_truthy();
            let array = array_arg("in_array", args, 1)?;
            Value::Bool(array.values().any(|value| {
                if strict {
                    value.identical(&needle)
                } else {
                    value.loose_eq(&needle)
                }
            }))
        }
        "array_push" => {
            let mut array = array_arg("array_push", args, 0)?;
            for value in args.iter().skip(1) {
                array.push(value.clone());
            }
            let len = array.len();
            args[0] = Value::Array(array);
            Value::Int(len as i64)
        }
        "array_pop" => {
            let mut array = array_arg("array_pop", args, 0)?;
            let popped = array.pop().unwrap_or_default();
            args[0] = Value::Array(array);
            popped
        }
        "sort" => {
            let array = array_arg("sort", args, 0)?;
            let mut values: Vec<Value> = array.values().cloned().collect();
            values.sort_by(ops::compare);
            args[0] = Value::Array(ArrayValue::from_list(values));
            Value::Bool(true)
        }
        "range" => {
            let (start, end) = (int_arg(args, 0), int_arg(args, 1));
            let values: Vec<Value> = if start <= end {
                (start..=end).map(Value::Int).collect()
            } else {
                (end..=start).rev().map(Value::Int).collect()
            };
            Value::Array(ArrayValue::from_list(values))
        }
        "max" | "min" => {
            let candidates: Vec<Value> = match args.as_slice() {
                [Value::Array(array)] => array.values().cloned().collect(),
                other => other.to_vec(),
            };
            let wanted = if lower == "max" {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Less
            };
            let mut best: Option<Value> = None;
            for value in candidates {
                best = match best {
                    Some(current) if ops::compare(&value, &current) != wanted => Some(current),
                    _ => Some(value),
                };
            }
            best.ok_or_else(|| {
                Error::exception(
                    "ValueError",
                    format!("{}(): Argument #1 ($value) must contain at least one element", lower),
                )
            })?
        }

        // ── Math ──
        "abs" => match arg(args, 0) {
            Value::Float(f) => Value::Float(f.abs()),
            other => Value::Int(int_arg(&[other], 0).wrapping_abs()),
        },
        "floor" | "ceil" | "round" => {
            let x = match ops::cast(CastType::Float, &arg(args, 0)) {
                Value::Float(f) => f,
                _ => 0.0,
            };
            Value::Float(match lower.as_str() {
                "floor" => x.floor(),
                "ceil" => x.ceil(),
                _ => x.round(),
            })
        }
        "intdiv" => {
            let (a, b) = (int_arg(args, 0), int_arg(args, 1));
            if b == 0 {
                return Err(Error::exception("DivisionByZeroError", "Division by zero"));
            }
            Value::Int(a.wrapping_div(b))
        }

        // ── Types ──
        "gettype" => Value::string(match arg(args, 0) {
            Value::Null => "NULL",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "double",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) | Value::Enum(_) | Value::Closure(_) => "object",
            Value::Resource(_) => "resource",
        }),
        "is_int" => Value::Bool(matches!(arg(args, 0), Value::Int(_))),
        "is_float" => Value::Bool(matches!(arg(args, 0), Value::Float(_))),
        "is_string" => Value::Bool(matches!(arg(args, 0), Value::String(_))),
        "is_bool" => Value::Bool(matches!(arg(args, 0), Value::Bool(_))),
        "is_array" => Value::Bool(matches!(arg(args, 0), Value::Array(_))),
        "is_null" => Value::Bool(matches!(arg(args, 0), Value::Null)),
        "is_object" => Value::Bool(matches!(
            arg(args, 0),
            Value::Object(_) | Value::Enum(_) | Value::Closure(_)
        )),
        "is_numeric" => Value::Bool(match arg(args, 0) {
            Value::Int(_) | Value::Float(_) => true,
            value @ Value::String(_) => value.to_number().is_some(),
            _ => false,
        }),
        "is_callable" => Value::Bool(interp.is_callable(&arg(args, 0))),
        "get_class" => match arg(args, 0) {
            Value::Closure(_) => Value::string("Closure"),
            value @ (Value::Object(_) | Value::Enum(_)) => {
                Value::String(class_of(&value).unwrap_or_default())
            }
            other => {
                return Err(Error::exception(
                    "TypeError",
                    format!(
                        "get_class(): Argument #1 ($object) must be of type object, {} given",
                        other.type_name()
                    ),
                ));
            }
        },
        "get_object_vars" => match arg(args, 0) {
            Value::Object(object) => {
                let mut array = ArrayValue::new();
                for (name, value) in &object.borrow().properties {
                    array.insert(ArrayKey::Str(name.clone()), value.clone());
                }
                Value::Array(array)
            }
            _ => Value::Null,
        },

        // ── Introspection ──
        "function_exists" => {
            let name = string_arg(interp, args, 0)?;
            Value::Bool(interp.image().function_exists(&name) || exists(&name))
        }
        "class_exists" | "interface_exists" | "enum_exists" => {
            let name = string_arg(interp, args, 0)?;
            let wanted = match lower.as_str() {
                "class_exists" => ClassKind::Class,
                "interface_exists" => ClassKind::Interface,
                _ => ClassKind::Enum,
            };
            Value::Bool(match interp.image().lookup_class(&name) {
                Some(def) => def.kind == wanted,
                None => wanted == ClassKind::Class && image::builtin_parent(&name).is_some(),
            })
        }
        "method_exists" => {
            let method = string_arg(interp, args, 1)?;
            Value::Bool(
                class_of(&arg(args, 0))
                    .and_then(|class| interp.image().find_method(&class, &method))
                    .is_some(),
            )
        }
        "property_exists" => {
            let property = string_arg(interp, args, 1)?;
            let target = arg(args, 0);
            let dynamic = match &target {
                Value::Object(object) => object.borrow().properties.contains_key(&property),
                _ => false,
            };
            let declared = class_of(&target)
                .and_then(|class| interp.image().class_shape(&class))
                .is_some_and(|shape| shape.has_property(&property));
            Value::Bool(dynamic || declared)
        }
        "define" => {
            let name = string_arg(interp, args, 0)?;
            let defined = interp.define_constant(&name, arg(args, 1));
            if !defined {
                interp.warn(&format!("Constant {} already defined", name));
            }
            Value::Bool(defined)
        }
        "defined" => {
            let name = string_arg(interp, args, 0)?;
            Value::Bool(
                interp.image().constant(&name).is_some()
                    || image::builtin_constant(&name).is_some(),
            )
        }
        "constant" => {
            let name = string_arg(interp, args, 0)?;
            let value = match name.split_once("::") {
                Some((class, constant)) => interp.image().class_constant(class, constant),
                None => interp.image().constant(&name).or_else(|| image::builtin_constant(&name)),
            };
            value.ok_or_else(|| {
                Error::exception("Error", format!("Undefined constant \"{}\"", name))
            })?
        }

        // ── Output ──
        "print_r" => {
            let mut out = String::new();
            print_r(&mut out, &arg(args, 0), 0);
            if arg(args, 1).is_truthy() {
                Value::String(out)
            } else {
                interp.write_output(&out)?;
                Value::Bool(true)
            }
        }
        "var_dump" => {
            for value in args.iter() {
                let mut out = String::new();
                var_dump(&mut out, value, 0);
                interp.write_output(&out)?;
            }
            Value::Null
        }

        // ── Process ──
        "tmpfile" => Value::Resource(Resource {
            id: interp.next_resource_id(),
            kind: "stream".to_string(),
        }),
        "fclose" => Value::Bool(matches!(arg(args, 0), Value::Resource(_))),
        "usleep" => {
            sleep_interruptibly(interp, Duration::from_micros(int_arg(args, 0).max(0) as u64))?;
            Value::Null
        }
        "sleep" => {
            sleep_interruptibly(interp, Duration::from_secs(int_arg(args, 0).max(0) as u64))?;
            Value::Int(0)
        }
        "getpid" => Value::Int(i64::from(std::process::id())),
        "abort" => std::process::abort(),

        _ => {
            return Err(Error::exception(
                "Error",
                format!("Call to undefined function {}()", name),
            ));
        }
    })
}

fn sleep_interruptibly(interp: &Interpreter, duration: Duration) -> Result<()> {
    let mut remaining = duration;
    while !remaining.is_zero() {
        interp.check_interrupt()?;
        let slice = remaining.min(SLEEP_SLICE);
        thread::sleep(slice);
        remaining -= slice;
    }
    interp.check_interrupt()
}

/// `%s`, `%d`, `%f` (with optional precision) and `%%`.
fn sprintf(interp: &mut Interpreter, args: &[Value]) -> Result<String> {
    let format = string_arg(interp, args, 0)?;
    let mut out = String::new();
    let mut next = 1;
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut precision = None;
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut digits = String::new();
            while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                digits.push(d);
                chars.next();
            }
            precision = digits.parse::<usize>().ok();
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('s') => {
                out.push_str(&string_arg(interp, args, next)?);
                next += 1;
            }
            Some('d') => {
                let _ = write!(out, "{}", int_arg(args, next));
                next += 1;
            }
            Some('f') => {
                let x = match ops::cast(CastType::Float, &arg(args, next)) {
                    Value::Float(f) => f,
                    _ => 0.0,
                };
                let _ = write!(out, "{:.*}", precision.unwrap_or(6), x);
                next += 1;
            }
            Some(other) => {
                return Err(Error::exception(
                    "ValueError",
                    format!("Unknown format specifier \"{}\"", other),
                ));
            }
            None => {
                return Err(Error::exception(
                    "ValueError",
                    "Missing format specifier at end of string",
                ));
            }
        }
    }
    Ok(out)
}

fn print_r(out: &mut String, value: &Value, depth: usize) {
    let pad = " ".repeat(depth * 8);
    let nested = |out: &mut String, kind: &str, entries: Vec<(String, Value)>| {
        let _ = writeln!(out, "{}", kind);
        let _ = writeln!(out, "{}(", pad);
        for (key, value) in entries {
            let _ = write!(out, "{}    [{}] => ", pad, key);
            print_r(out, &value, depth + 1);
            out.push('\n');
        }
        let _ = writeln!(out, "{})", pad);
    };
    match value {
        Value::Array(array) => nested(
            out,
            "Array",
            array.iter().map(|(k, v)| (plain_key(k), v.clone())).collect(),
        ),
        Value::Object(object) => {
            let object = object.borrow();
            nested(
                out,
                &format!("{} Object", object.class),
                object
                    .properties
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            );
        }
        Value::Enum(case) => {
            let _ = write!(out, "{} Enum ( [name] => {} )", case.enum_name, case.case);
        }
        Value::Closure(_) => out.push_str("Closure Object\n(\n)\n"),
        other => out.push_str(&other.to_output_string()),
    }
}

fn plain_key(key: &ArrayKey) -> String {
    match key {
        ArrayKey::Int(i) => i.to_string(),
        ArrayKey::Str(s) => s.clone(),
    }
}

fn var_dump(out: &mut String, value: &Value, depth: usize) {
    let pad = "  ".repeat(depth);
    match value {
        Value::Null => {
            let _ = writeln!(out, "{}NULL", pad);
        }
        Value::Bool(b) => {
            let _ = writeln!(out, "{}bool({})", pad, b);
        }
        Value::Int(i) => {
            let _ = writeln!(out, "{}int({})", pad, i);
        }
        Value::Float(f) => {
            let text = if f.fract() == 0.0 && f.is_finite() {
                format!("{}", *f as i64)
            } else {
                f.to_string()
            };
            let _ = writeln!(out, "{}float({})", pad, text);
        }
        Value::String(s) => {
            let _ = writeln!(out, "{}string({}) \"{}\"", pad, s.len(), s);
        }
        Value::Array(array) => {
            let _ = writeln!(out, "{}array({}) {{", pad, array.len());
            for (key, item) in array.iter() {
                match key {
                    ArrayKey::Int(i) => {
                        let _ = writeln!(out, "{}  [{}]=>", pad, i);
                    }
                    ArrayKey::Str(s) => {
                        let _ = writeln!(out, "{}  [\"{}\"]=>", pad, s);
                    }
                }
                var_dump(out, item, depth + 1);
            }
            let _ = writeln!(out, "{}}}", pad);
        }
        Value::Object(object) => {
            let object = object.borrow();
            let count = object.properties.len();
            let _ = writeln!(out, "{}object({}) ({}) {{", pad, object.class, count);
            for (name, item) in &object.properties {
                let _ = writeln!(out, "{}  [\"{}\"]=>", pad, name);
                var_dump(out, item, depth + 1);
            }
            let _ = writeln!(out, "{}}}", pad);
        }
        Value::Enum(case) => {
            let _ = writeln!(out, "{}enum({}::{})", pad, case.enum_name, case.case);
        }
        Value::Closure(_) => {
            let _ = writeln!(out, "{}object(Closure) (0) {{\n{}}}", pad, pad);
        }
        Value::Resource(resource) => {
            let _ = writeln!(out, "{}resource({}) of type ({})", pad, resource.id, resource.kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    fn eval(source: &str) -> (Option<Value>, String) {
        let buffer = Rc::new(RefCell::new(Vec::new()));
        let mut interp = Interpreter::new(buffer.clone());
        let value = interp.eval(source).unwrap();
        let output = String::from_utf8_lossy(&buffer.borrow()).into_owned();
        (value, output)
    }

    #[test]
    fn test_names_are_sorted() {
        assert!(NAMES.windows(2).all(|w| w[0] < w[1]));
        assert!(exists("STRLEN"));
        assert!(exists("\\count"));
        assert!(!exists("eval"));
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(eval("strlen('hello')").0, Some(Value::Int(5)));
        assert_eq!(eval("implode(', ', ['a', 'b'])").0, Some(Value::string("a, b")));
        assert_eq!(eval("count(explode(',', 'a,b,c'))").0, Some(Value::Int(3)));
        assert_eq!(
            eval("sprintf('%s=%d (%.2f%%)', 'x', '7', 0.5)").0,
            Some(Value::string("x=7 (0.50%)"))
        );
    }

    #[test]
    fn test_array_functions_write_back() {
        let (value, _) = eval("$a = [3, 1]; array_push($a, 2); sort($a); implode('', $a)");
        assert_eq!(value, Some(Value::string("123")));
        let (value, _) = eval("array_sum(array_map(fn($x) => $x * 2, range(1, 3)))");
        assert_eq!(value, Some(Value::Int(12)));
    }

    #[test]
    fn test_print_r() {
        let (_, output) = eval("print_r(['a' => 1, 'b' => [2]]);");
        assert_eq!(
            output,
            concat!(
                "Array\n(\n    [a] => 1\n    [b] => Array\n",
                "        (\n            [0] => 2\n        )\n\n)\n",
            )
        );
    }

    #[test]
    fn test_introspection() {
        let (value, _) = eval(
            "class Box { public $item; function open() {} }
             function helper() {}
             [function_exists('helper'), class_exists('Box'),
              method_exists('Box', 'OPEN'), property_exists('Box', 'item'),
              property_exists('Box', 'nope'), class_exists('Exception')]",
        );
        let Some(Value::Array(flags)) = value else {
            panic!("expected array");
        };
        let flags: Vec<bool> = flags.values().map(Value::is_truthy).collect();
        assert_eq!(flags, vec![true, true, true, true, false, true]);
    }

    #[test]
    fn test_tmpfile_is_a_resource() {
        let (value, _) = eval("tmpfile()");
        assert!(matches!(value, Some(Value::Resource(_))));
    }

    #[test]
    fn test_usleep_is_interruptible() {
        let buffer = Rc::new(RefCell::new(Vec::new()));
        let mut interp = Interpreter::new(buffer);
        interp.interrupt_handle().interrupt();
        assert!(matches!(interp.eval("usleep(5000000);"), Err(Error::Interrupted)));
    }
}
