//! Interactive session over the host interpreter.
//!
//! [`Session`] is the concrete [`Shell`]: it reads input lines, evaluates
//! them with an [`Interpreter`], prints results and exposes the runtime
//! image to the live reloader.

use std::cell::{Ref, RefCell};
use std::fmt::Write as _;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::rc::Rc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::execute::InterruptHandle;
use crate::listener::{ExecutionOutcome, Shared};
use crate::reload::{CodePatcher, LiveReloader};
use crate::runtime::Interpreter;
use crate::shell::{Notice, Repl, ScopeVariables, Shell, is_special_variable_name};
use crate::value::{ArrayKey, Value};

/// Nesting shown when presenting arrays and objects.
const PRESENT_DEPTH: usize = 4;

/// Unbuffered reader over file descriptor 0.
///
/// `std::io::Stdin` reads ahead into a buffer. A forked worker that dies
/// would take that read-ahead with it, so input is pulled from the
/// descriptor one read at a time instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawStdin;

impl Read for RawStdin {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            // SAFETY: `buf` is valid for `buf.len()` bytes.
            let n = unsafe { libc::read(libc::STDIN_FILENO, buf.as_mut_ptr().cast(), buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

/// A shell session evaluating input with the host interpreter.
pub struct Session<W: Write + 'static> {
    interp: Interpreter,
    output: Rc<RefCell<W>>,
    input: Box<dyn Read>,
    prompt: Option<String>,
    includes: Vec<PathBuf>,
    reloader: Option<Shared<LiveReloader>>,
    /// Last non-empty input, with `yolo !!` already expanded.
    last_input: Option<String>,
}

impl<W: Write + 'static> Session<W> {
    pub fn new(input: impl Read + 'static, output: W) -> Self {
        let output = Rc::new(RefCell::new(output));
        let sink: Rc<RefCell<dyn Write>> = output.clone();
        Self {
            interp: Interpreter::new(sink),
            output,
            input: Box::new(input),
            prompt: None,
            includes: Vec::new(),
            reloader: None,
            last_input: None,
        }
    }

    /// Print `prompt` before reading each line.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    /// Files to `require` before the first input line.
    pub fn with_includes(mut self, includes: Vec<PathBuf>) -> Self {
        self.includes = includes;
        self
    }

    /// Give the session a handle to the reloader registered on the loop, for
    /// the `yolo` and `reload` commands.
    pub fn attach_reloader(&mut self, reloader: Shared<LiveReloader>) {
        self.reloader = Some(reloader);
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interp.interrupt_handle().clone()
    }

    pub fn output(&self) -> Ref<'_, W> {
        self.output.borrow()
    }

    fn write_line(&self, line: &str) {
        let mut out = self.output.borrow_mut();
        let _ = writeln!(out, "{}", line);
        let _ = out.flush();
    }

    /// Evaluate user code and show its result.
    fn evaluate(&mut self, code: &str) -> Result<ExecutionOutcome> {
        let code = if code.ends_with(';') || code.ends_with('}') {
            code.to_string()
        } else {
            format!("{};", code)
        };

        match self.interp.eval(&code) {
            Ok(Some(value)) => {
                self.write_line(&format!("=> {}", present(&value)));
                self.interp.set_global("_", value);
                Ok(ExecutionOutcome::Continue)
            }
            Ok(None) => Ok(ExecutionOutcome::Continue),
            Err(Error::Exit(code)) => Ok(ExecutionOutcome::Exit(code)),
            Err(e) => {
                if let Some(exception) = self.interp.exception_value(&e) {
                    self.interp.set_global("_e", exception);
                }
                Err(e)
            }
        }
    }

    /// `yolo <code>`: evaluate with force reloading switched on. `yolo !!`
    /// repeats the previous input.
    fn yolo(&mut self, code: &str) -> Result<ExecutionOutcome> {
        let code = match code {
            "" => {
                return Err(Error::Runtime("Not enough arguments (missing: \"code\").".into()));
            }
            "!!" => self
                .last_input
                .clone()
                .ok_or_else(|| Error::Runtime("No previous command to repeat".into()))?,
            code => code.to_string(),
        };
        self.last_input = Some(code.clone());

        let reloader = self.reloader.clone();
        if let Some(reloader) = &reloader {
            reloader.borrow_mut().set_force_reload(true, self);
        }
        let result = self.evaluate(&code);
        if let Some(reloader) = &reloader {
            reloader.borrow_mut().set_force_reload(false, self);
        }
        result
    }

    fn reload(&mut self) {
        let Some(reloader) = self.reloader.clone() else {
            self.write_notice(&Notice::Warning("Live reloading is disabled".into()));
            return;
        };
        if reloader.borrow_mut().reload(self).is_empty() {
            self.write_notice(&Notice::Info("No modified files".into()));
        }
    }
}

impl<W: Write + 'static> Shell for Session<W> {
    fn scope_variables(&self, include_special: bool) -> ScopeVariables {
        self.interp
            .globals()
            .iter()
            .filter(|(name, _)| include_special || !is_special_variable_name(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    fn set_scope_variables(&mut self, vars: ScopeVariables) {
        for (name, value) in vars {
            self.interp.set_global(&name, value);
        }
    }

    fn write_exception(&mut self, error: &Error) {
        let line = match error {
            Error::Exception { .. } => error.to_string(),
            Error::Runtime(message) => format!("Error: {}", message),
            Error::Syntax { line, message } => {
                format!("PHP Parse error: {} on line {}", message, line)
            }
            Error::Fatal(message) => format!("PHP Fatal error: {}", message),
            Error::Reload { message, .. } => format!("Error: {}", message),
            other => format!("Error: {}", other.with_hint()),
        };
        self.write_line(&line);
    }

    fn write_notice(&mut self, notice: &Notice) {
        self.write_line(&notice.to_string());
    }

    fn loaded_files(&self) -> Vec<PathBuf> {
        self.interp.loaded_files().to_vec()
    }

    fn code_patcher(&mut self) -> &mut dyn CodePatcher {
        self.interp.image_mut()
    }
}

impl<W: Write + 'static> Repl for Session<W> {
    fn read_input(&mut self) -> Result<Option<String>> {
        if let Some(prompt) = &self.prompt {
            let mut out = self.output.borrow_mut();
            out.write_all(prompt.as_bytes())?;
            out.flush()?;
        }

        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.input.read(&mut byte) {
                Ok(0) if line.is_empty() => return Ok(None),
                Ok(0) => break,
                Ok(_) if byte[0] == b'\n' => break,
                Ok(_) => line.push(byte[0]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    fn load_includes(&mut self) -> Result<()> {
        for path in self.includes.clone() {
            debug!("Including {}", path.display());
            match self.interp.include(&path) {
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => self.write_exception(&e),
            }
        }
        Ok(())
    }

    fn execute(&mut self, code: &str) -> Result<ExecutionOutcome> {
        let code = code.trim();
        let (command, rest) = match code.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (code, ""),
        };

        if !code.is_empty() && command != "yolo" {
            self.last_input = Some(code.to_string());
        }

        match command {
            "" => Ok(ExecutionOutcome::Continue),
            "exit" | "quit" if rest.is_empty() => Ok(ExecutionOutcome::Exit(0)),
            "exit" => match rest.parse::<i32>() {
                Ok(status) => Ok(ExecutionOutcome::Exit(status)),
                Err(_) => self.evaluate(code),
            },
            "yolo" => self.yolo(rest),
            "reload" if rest.is_empty() => {
                self.reload();
                Ok(ExecutionOutcome::Continue)
            }
            _ => self.evaluate(code),
        }
    }
}

/// Render a value the way the shell echoes results.
pub fn present(value: &Value) -> String {
    let mut out = String::new();
    present_into(&mut out, value, 0);
    out
}

fn present_into(out: &mut String, value: &Value, depth: usize) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Int(i) => {
            let _ = write!(out, "{}", i);
        }
        Value::Float(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 => {
            let _ = write!(out, "{:.1}", f);
        }
        Value::Float(f) => {
            let _ = write!(out, "{}", f);
        }
        Value::String(s) => {
            let _ = write!(out, "{:?}", s);
        }
        Value::Array(array) if array.is_empty() => out.push_str("[]"),
        Value::Array(_) | Value::Object(_) if depth >= PRESENT_DEPTH => out.push_str("…"),
        Value::Array(array) => {
            let is_list = array
                .iter()
                .enumerate()
                .all(|(i, (key, _))| *key == ArrayKey::Int(i as i64));
            out.push('[');
            for (i, (key, item)) in array.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                if !is_list {
                    let _ = write!(out, "{} => ", key);
                }
                present_into(out, item, depth + 1);
            }
            out.push(']');
        }
        Value::Object(object) => {
            let object = object.borrow();
            let _ = write!(out, "{} {{", object.class);
            for (i, (name, property)) in object.properties.iter().enumerate() {
                out.push_str(if i > 0 { ", " } else { " " });
                let _ = write!(out, "{}: ", name);
                present_into(out, property, depth + 1);
            }
            out.push_str(if object.properties.is_empty() { "}" } else { " }" });
        }
        Value::Enum(case) => {
            let _ = write!(out, "{}::{}", case.enum_name, case.case);
        }
        Value::Closure(closure) => {
            let params: Vec<String> =
                closure.function.params.iter().map(|p| format!("${}", p.name)).collect();
            let _ = write!(out, "Closure({})", params.join(", "));
        }
        Value::Resource(resource) => {
            let _ = write!(out, "{} resource #{}", resource.kind, resource.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ArrayValue;
    use std::io::Cursor;

    fn session(input: &str) -> Session<Vec<u8>> {
        Session::new(Cursor::new(input.as_bytes().to_vec()), Vec::new())
    }

    fn output(session: &Session<Vec<u8>>) -> String {
        String::from_utf8_lossy(&session.output()).into_owned()
    }

    #[test]
    fn test_read_input_lines() {
        let mut s = session("1 + 1\r\n\nlast");
        assert_eq!(s.read_input().unwrap().as_deref(), Some("1 + 1"));
        assert_eq!(s.read_input().unwrap().as_deref(), Some(""));
        assert_eq!(s.read_input().unwrap().as_deref(), Some("last"));
        assert_eq!(s.read_input().unwrap(), None);
    }

    #[test]
    fn test_prompt_is_written() {
        let mut s = session("1\n").with_prompt(">>> ");
        s.read_input().unwrap();
        assert_eq!(output(&s), ">>> ");
    }

    #[test]
    fn test_result_is_shown_and_stored() {
        let mut s = session("");
        s.execute("$a = 40 + 2").unwrap();
        assert_eq!(output(&s), "=> 42\n");
        assert!(matches!(s.interp.global("_"), Some(Value::Int(42))));

        let vars = s.scope_variables(false);
        assert!(vars.contains_key("a"));
        assert!(!vars.contains_key("_"));
        assert!(s.scope_variables(true).contains_key("_"));
    }

    #[test]
    fn test_exit_commands() {
        let mut s = session("");
        assert_eq!(s.execute("exit").unwrap(), ExecutionOutcome::Exit(0));
        assert_eq!(s.execute("exit 4").unwrap(), ExecutionOutcome::Exit(4));
        assert_eq!(s.execute("exit(5);").unwrap(), ExecutionOutcome::Exit(5));
        assert_eq!(s.execute("   ").unwrap(), ExecutionOutcome::Continue);
    }

    #[test]
    fn test_uncaught_exception_sets_last_error() {
        let mut s = session("");
        let err = s.execute("throw new RuntimeException('nope')").unwrap_err();
        s.write_exception(&err);
        assert_eq!(output(&s), "RuntimeException: nope\n");

        match s.interp.global("_e") {
            Some(Value::Object(object)) => assert_eq!(object.borrow().class, "RuntimeException"),
            other => panic!("expected exception object, got {:?}", other),
        }
    }

    #[test]
    fn test_set_scope_variables_merges() {
        let mut s = session("");
        s.execute("$keep = 1;").unwrap();
        let mut vars = ScopeVariables::new();
        vars.insert("restored".into(), Value::string("yes"));
        s.set_scope_variables(vars);

        let names: Vec<String> = s.scope_variables(false).into_keys().collect();
        assert_eq!(names, vec!["keep", "restored"]);
    }

    #[test]
    fn test_yolo_repeats_previous_input() {
        let mut s = session("");
        match s.execute("yolo !!") {
            Err(Error::Runtime(message)) => assert_eq!(message, "No previous command to repeat"),
            other => panic!("expected runtime error, got {:?}", other),
        }
        assert!(s.execute("yolo").is_err());

        s.execute("$n = 1;").unwrap();
        s.execute("$n = $n + 1").unwrap();
        s.execute("yolo !!").unwrap();
        s.execute("yolo !!").unwrap();
        assert_eq!(output(&s), "=> 1\n=> 2\n=> 3\n=> 4\n");

        s.execute("yolo $n * 10").unwrap();
        s.execute("yolo !!").unwrap();
        assert!(output(&s).ends_with("=> 40\n=> 40\n"));
    }

    #[test]
    fn test_reload_without_reloader_warns() {
        let mut s = session("");
        s.execute("reload").unwrap();
        assert_eq!(output(&s), "Warning: Live reloading is disabled\n");
    }

    #[test]
    fn test_present() {
        assert_eq!(present(&Value::Float(2.0)), "2.0");
        assert_eq!(present(&Value::string("a\"b")), "\"a\\\"b\"");
        assert_eq!(
            present(&Value::Array(ArrayValue::from_list([Value::Int(1), Value::Null]))),
            "[1, null]"
        );

        let mut s = session("");
        s.execute("$m = ['a' => true]").unwrap();
        assert_eq!(output(&s), "=> [\"a\" => true]\n");
    }
}
