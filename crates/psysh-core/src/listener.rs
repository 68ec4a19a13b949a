//! Execution loop listeners.
//!
//! A listener hooks the lifecycle of an interactive session:
//!
//! ```text
//! before_run ─┬─> before_loop -> on_input -> on_execute -> (evaluate) -> after_loop ─┐
//!             │                                                                      │
//!             └──────────────────────────── next input <─────────────────────────────┘
//!                                                                      ...  after_run
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Result;
use crate::shell::Shell;

/// Whether the session keeps running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Continue,
    /// End the session with this exit code.
    Exit(i32),
}

/// Hooks invoked by the [`ExecutionLoop`](crate::execute::ExecutionLoop).
///
/// Every hook has a no-op default.
pub trait Listener {
    /// Whether this listener can run on the current platform.
    fn is_supported(&self) -> bool {
        true
    }

    /// Called once before the first input. Returning `Exit` ends the run
    /// without entering the loop.
    fn before_run(&mut self, _shell: &mut dyn Shell) -> Result<ExecutionOutcome> {
        Ok(ExecutionOutcome::Continue)
    }

    fn before_loop(&mut self, _shell: &mut dyn Shell) -> Result<()> {
        Ok(())
    }

    /// Inspect raw input. `Some` replaces it.
    fn on_input(&mut self, _shell: &mut dyn Shell, _input: &str) -> Result<Option<String>> {
        Ok(None)
    }

    /// Inspect code about to be evaluated. `Some` replaces it.
    fn on_execute(&mut self, _shell: &mut dyn Shell, _code: &str) -> Result<Option<String>> {
        Ok(None)
    }

    fn after_loop(&mut self, _shell: &mut dyn Shell) -> Result<()> {
        Ok(())
    }

    fn after_run(&mut self, _shell: &mut dyn Shell, _exit_code: i32) -> Result<()> {
        Ok(())
    }
}

/// A listener the caller keeps a handle to after registering it.
pub type Shared<L> = Rc<RefCell<L>>;

impl<L: Listener> Listener for Rc<RefCell<L>> {
    fn is_supported(&self) -> bool {
        self.borrow().is_supported()
    }

    fn before_run(&mut self, shell: &mut dyn Shell) -> Result<ExecutionOutcome> {
        self.borrow_mut().before_run(shell)
    }

    fn before_loop(&mut self, shell: &mut dyn Shell) -> Result<()> {
        self.borrow_mut().before_loop(shell)
    }

    fn on_input(&mut self, shell: &mut dyn Shell, input: &str) -> Result<Option<String>> {
        self.borrow_mut().on_input(shell, input)
    }

    fn on_execute(&mut self, shell: &mut dyn Shell, code: &str) -> Result<Option<String>> {
        self.borrow_mut().on_execute(shell, code)
    }

    fn after_loop(&mut self, shell: &mut dyn Shell) -> Result<()> {
        self.borrow_mut().after_loop(shell)
    }

    fn after_run(&mut self, shell: &mut dyn Shell, exit_code: i32) -> Result<()> {
        self.borrow_mut().after_run(shell, exit_code)
    }
}
