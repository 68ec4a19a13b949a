//! Core engine for the psysh interactive shell.
//!
//! This crate provides:
//! - Execution loop driven by lifecycle listeners
//! - Process-isolated execution with savegame crash recovery
//! - Ctrl-C interruption of running code
//! - Live reloading of modified source files
//! - Host runtime (lexer, parser, interpreter) with a hot-patchable image

pub mod error;
pub mod execute;
pub mod ipc;
pub mod listener;
pub mod paths;
pub mod reload;
pub mod runtime;
pub mod session;
pub mod shell;
pub mod syntax;
pub mod value;

pub use error::{Error, Result};
pub use execute::{ExecutionLoop, InterruptHandle, ProcessForker, SignalHandler, TerminalState};
pub use ipc::SessionPayload;
pub use listener::{ExecutionOutcome, Listener, Shared};
pub use reload::{
    CodePatcher, LiveReloader, PatchReport, ReloadLedger, ReloadSummary, ReloadVisitor,
};
pub use runtime::{Interpreter, RuntimeImage};
pub use session::{RawStdin, Session, present};
pub use shell::{Notice, Repl, ScopeVariables, Shell};
pub use value::Value;
