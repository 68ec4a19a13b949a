//! The shell seam that listeners hook into.
//!
//! [`Shell`] is what listeners see: scope variables, error and notice
//! reporting, loaded files and the code patcher. [`Repl`] adds what the
//! [`ExecutionLoop`](crate::execute::ExecutionLoop) needs to drive a session.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::listener::ExecutionOutcome;
use crate::reload::CodePatcher;
use crate::value::Value;

/// Variables visible in the shell's scope, keyed without the `$` sigil.
pub type ScopeVariables = BTreeMap<String, Value>;

/// Variables managed by the shell itself. Never transferred between
/// processes.
pub const SPECIAL_NAMES: &[&str] = &[
    "_",
    "_e",
    "__out",
    "__psysh__",
    "this",
    "__function",
    "__method",
    "__class",
    "__namespace",
    "__file",
    "__line",
    "__dir",
];

pub fn is_special_variable_name(name: &str) -> bool {
    SPECIAL_NAMES.contains(&name)
}

/// Keep the variables that can be sent to another process: special names,
/// closures, resources and session-defined enum cases are dropped.
pub fn transferable_variables(vars: ScopeVariables) -> ScopeVariables {
    vars.into_iter()
        .filter(|(name, value)| !is_special_variable_name(name) && value.is_transferable())
        .collect()
}

/// A one-line message for the user that is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Info(String),
    Warning(String),
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Info(message) => f.write_str(message),
            Notice::Warning(message) => write!(f, "Warning: {}", message),
        }
    }
}

/// What listeners can do to the running shell.
pub trait Shell {
    /// Current scope. Special variables are included only on request.
    fn scope_variables(&self, include_special: bool) -> ScopeVariables;

    /// Merge `vars` into the current scope.
    fn set_scope_variables(&mut self, vars: ScopeVariables);

    fn write_exception(&mut self, error: &Error);

    fn write_notice(&mut self, notice: &Notice);

    /// Source files loaded into the runtime, in load order.
    fn loaded_files(&self) -> Vec<PathBuf>;

    fn code_patcher(&mut self) -> &mut dyn CodePatcher;
}

/// A shell the execution loop can drive.
pub trait Repl: Shell {
    /// Next line of input, or `None` at end of input.
    fn read_input(&mut self) -> Result<Option<String>>;

    /// Load the files requested on the command line.
    fn load_includes(&mut self) -> Result<()>;

    /// Evaluate one line of (possibly rewritten) input.
    ///
    /// Errors are reported by the caller. `Exit` ends the session.
    fn execute(&mut self, code: &str) -> Result<ExecutionOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ArrayValue, EnumCase, Resource};

    #[test]
    fn test_special_names() {
        assert!(is_special_variable_name("_"));
        assert!(is_special_variable_name("__psysh__"));
        assert!(is_special_variable_name("__dir"));
        assert!(!is_special_variable_name("foo"));
        assert!(!is_special_variable_name("_foo"));
    }

    #[test]
    fn test_transfer_filter() {
        let resource = Value::Resource(Resource {
            id: 1,
            kind: "stream".into(),
        });
        let mut vars = ScopeVariables::new();
        vars.insert("a".into(), Value::Int(1));
        vars.insert("s".into(), Value::string("x"));
        vars.insert("_".into(), Value::Int(2));
        vars.insert("this".into(), Value::Null);
        vars.insert("r".into(), resource.clone());
        vars.insert(
            "nested".into(),
            Value::Array(ArrayValue::from_list([Value::Int(1), resource])),
        );
        vars.insert(
            "local_enum".into(),
            Value::Enum(EnumCase {
                enum_name: "Suit".into(),
                case: "Hearts".into(),
                session_defined: true,
            }),
        );
        vars.insert(
            "file_enum".into(),
            Value::Enum(EnumCase {
                enum_name: "Suit".into(),
                case: "Spades".into(),
                session_defined: false,
            }),
        );

        let kept = transferable_variables(vars);
        let names: Vec<&str> = kept.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["a", "file_enum", "s"]);
    }

    #[test]
    fn test_notice_display() {
        assert_eq!(Notice::Info("Reloading a.php".into()).to_string(), "Reloading a.php");
        assert_eq!(
            Notice::Warning("Not re-run: echo 1".into()).to_string(),
            "Warning: Not re-run: echo 1"
        );
    }
}
