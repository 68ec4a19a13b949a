//! Error types for psysh-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::reload::PatchError;

/// Result type for psysh-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in psysh-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Source text could not be parsed.
    #[error("syntax error on line {line}: {message}")]
    Syntax { line: usize, message: String },

    /// Catchable runtime error raised while evaluating user code.
    #[error("{0}")]
    Runtime(String),

    /// Unrecoverable runtime error. The process evaluating the code is
    /// expected to die; in fork mode the savegame chain recovers from it.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// A thrown exception that nothing caught.
    #[error("{class}: {message}")]
    Exception {
        class: String,
        message: String,
        code: i64,
    },

    /// `exit` was evaluated. Not a failure: carries the requested status.
    #[error("exit({0})")]
    Exit(i32),

    /// Evaluation was interrupted by SIGINT.
    #[error("interrupted")]
    Interrupted,

    /// Process creation or socket setup failed.
    #[error("{0}")]
    Fork(String),

    /// Communication with the execution loop process failed.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Session state could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A modified source file could not be reloaded.
    #[error("{message}")]
    Reload { file: PathBuf, message: String },

    /// A live patch could not be applied.
    #[error("patch failed: {0}")]
    Patch(#[from] PatchError),

    /// Signal handler installation failed.
    #[error("signal error: {0}")]
    Signal(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a catchable runtime error.
    pub fn runtime(message: impl Into<String>) -> Self {
        Error::Runtime(message.into())
    }

    /// Shorthand for an exception of a builtin class.
    pub fn exception(class: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Exception {
            class: class.into(),
            message: message.into(),
            code: 0,
        }
    }

    /// Whether this error must terminate the evaluating process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }

    /// Render the error with a recovery hint, if one applies.
    pub fn with_hint(&self) -> String {
        let hint = match self {
            Error::Fork(_) => Some("retry with --no-fork to run without process isolation"),
            Error::Ipc(_) => {
                Some("the execution loop process died unexpectedly; session state was lost")
            }
            Error::Signal(_) => {
                Some("retry with --no-fork; Ctrl-C will not interrupt running code")
            }
            Error::Reload { .. } => Some("fix the file and press enter to retry the reload"),
            _ => None,
        };

        match hint {
            Some(hint) => format!("{}\n  hint: {}", self, hint),
            None => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Fatal("Cannot redeclare greet()".into()).is_fatal());
        assert!(!Error::runtime("Call to undefined function nope()").is_fatal());
        assert!(!Error::Interrupted.is_fatal());
    }

    #[test]
    fn test_with_hint() {
        let err = Error::Fork("unable to start execution loop".into());
        let rendered = err.with_hint();
        assert!(rendered.starts_with("unable to start execution loop"));
        assert!(rendered.contains("--no-fork"));

        let err = Error::runtime("boom");
        assert_eq!(err.with_hint(), "boom");
    }
}
