//! The read-eval loop that drives listeners and a [`Repl`].

use tracing::debug;

use crate::error::{Error, Result};
use crate::listener::{ExecutionOutcome, Listener};
use crate::shell::Repl;

/// Runs a session: listener hooks around each read and evaluation.
#[derive(Default)]
pub struct ExecutionLoop {
    listeners: Vec<Box<dyn Listener>>,
}

impl ExecutionLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Hooks run in registration order.
    pub fn add_listener(&mut self, listener: impl Listener + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Run until end of input or an exit request. Returns the exit code.
    ///
    /// Evaluation errors are reported through the shell and the loop moves
    /// on. A fatal error ends the run with that error, since it leaves the
    /// runtime in an unknown state.
    pub fn run<S: Repl>(&mut self, shell: &mut S) -> Result<i32> {
        for listener in &mut self.listeners {
            if let ExecutionOutcome::Exit(code) = listener.before_run(shell)? {
                return Ok(code);
            }
        }

        shell.load_includes()?;

        let exit_code = loop {
            for listener in &mut self.listeners {
                listener.before_loop(shell)?;
            }

            let Some(mut input) = shell.read_input()? else {
                break 0;
            };
            for listener in &mut self.listeners {
                if let Some(replaced) = listener.on_input(shell, &input)? {
                    input = replaced;
                }
            }

            let mut code = input;
            for listener in &mut self.listeners {
                if let Some(replaced) = listener.on_execute(shell, &code)? {
                    code = replaced;
                }
            }

            match shell.execute(&code) {
                Ok(ExecutionOutcome::Continue) => {}
                Ok(ExecutionOutcome::Exit(code)) => break code,
                Err(Error::Interrupted) => debug!("Evaluation interrupted"),
                Err(e) if e.is_fatal() => {
                    shell.write_exception(&e);
                    return Err(e);
                }
                Err(e) => shell.write_exception(&e),
            }

            for listener in &mut self.listeners {
                listener.after_loop(shell)?;
            }
        };

        for listener in &mut self.listeners {
            listener.after_run(shell, exit_code)?;
        }
        Ok(exit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reload::{CodePatcher, UnsupportedPatcher};
    use crate::shell::{Notice, ScopeVariables, Shell};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::rc::Rc;

    #[derive(Default)]
    struct ScriptedShell {
        input: VecDeque<String>,
        executed: Vec<String>,
        errors: Vec<String>,
        patcher: UnsupportedPatcher,
    }

    impl ScriptedShell {
        fn new(lines: &[&str]) -> Self {
            Self {
                input: lines.iter().map(|l| l.to_string()).collect(),
                ..Default::default()
            }
        }
    }

    impl Shell for ScriptedShell {
        fn scope_variables(&self, _include_special: bool) -> ScopeVariables {
            ScopeVariables::new()
        }
        fn set_scope_variables(&mut self, _vars: ScopeVariables) {}
        fn write_exception(&mut self, error: &Error) {
            self.errors.push(error.to_string());
        }
        fn write_notice(&mut self, _notice: &Notice) {}
        fn loaded_files(&self) -> Vec<PathBuf> {
            Vec::new()
        }
        fn code_patcher(&mut self) -> &mut dyn CodePatcher {
            &mut self.patcher
        }
    }

    impl Repl for ScriptedShell {
        fn read_input(&mut self) -> Result<Option<String>> {
            Ok(self.input.pop_front())
        }

        fn load_includes(&mut self) -> Result<()> {
            Ok(())
        }

        fn execute(&mut self, code: &str) -> Result<ExecutionOutcome> {
            self.executed.push(code.to_string());
            match code {
                "exit" => Ok(ExecutionOutcome::Exit(7)),
                "boom" => Err(Error::runtime("boom")),
                "fatal" => Err(Error::Fatal("Cannot redeclare f()".into())),
                "interrupt" => Err(Error::Interrupted),
                _ => Ok(ExecutionOutcome::Continue),
            }
        }
    }

    /// Records hook calls into a shared log.
    struct Recorder {
        log: Rc<RefCell<Vec<String>>>,
        stop_before_run: bool,
    }

    impl Listener for Recorder {
        fn before_run(&mut self, _shell: &mut dyn Shell) -> Result<ExecutionOutcome> {
            self.log.borrow_mut().push("before_run".into());
            if self.stop_before_run {
                return Ok(ExecutionOutcome::Exit(42));
            }
            Ok(ExecutionOutcome::Continue)
        }

        fn before_loop(&mut self, _shell: &mut dyn Shell) -> Result<()> {
            self.log.borrow_mut().push("before_loop".into());
            Ok(())
        }

        fn on_input(&mut self, _shell: &mut dyn Shell, input: &str) -> Result<Option<String>> {
            self.log.borrow_mut().push(format!("on_input {}", input));
            Ok(None)
        }

        fn on_execute(&mut self, _shell: &mut dyn Shell, code: &str) -> Result<Option<String>> {
            self.log.borrow_mut().push(format!("on_execute {}", code));
            Ok(None)
        }

        fn after_loop(&mut self, _shell: &mut dyn Shell) -> Result<()> {
            self.log.borrow_mut().push("after_loop".into());
            Ok(())
        }

        fn after_run(&mut self, _shell: &mut dyn Shell, exit_code: i32) -> Result<()> {
            self.log.borrow_mut().push(format!("after_run {}", exit_code));
            Ok(())
        }
    }

    struct Rewriter;

    impl Listener for Rewriter {
        fn on_input(&mut self, _shell: &mut dyn Shell, input: &str) -> Result<Option<String>> {
            Ok(input.strip_prefix("say ").map(|rest| format!("echo {};", rest)))
        }
    }

    #[test]
    fn test_hook_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut execution = ExecutionLoop::new();
        execution.add_listener(Recorder {
            log: Rc::clone(&log),
            stop_before_run: false,
        });

        let mut shell = ScriptedShell::new(&["1;"]);
        assert_eq!(execution.run(&mut shell).unwrap(), 0);
        assert_eq!(
            *log.borrow(),
            vec![
                "before_run",
                "before_loop",
                "on_input 1;",
                "on_execute 1;",
                "after_loop",
                "before_loop",
                "after_run 0",
            ]
        );
    }

    #[test]
    fn test_before_run_exit_skips_loop() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut execution = ExecutionLoop::new();
        execution.add_listener(Recorder {
            log: Rc::clone(&log),
            stop_before_run: true,
        });

        let mut shell = ScriptedShell::new(&["1;"]);
        assert_eq!(execution.run(&mut shell).unwrap(), 42);
        assert!(shell.executed.is_empty());
        assert_eq!(*log.borrow(), vec!["before_run"]);
    }

    #[test]
    fn test_errors_are_reported_and_loop_continues() {
        let mut execution = ExecutionLoop::new();
        let mut shell = ScriptedShell::new(&["boom", "interrupt", "2;", "exit", "never"]);
        assert_eq!(execution.run(&mut shell).unwrap(), 7);
        assert_eq!(shell.errors, vec!["boom"]);
        assert_eq!(shell.executed, vec!["boom", "interrupt", "2;", "exit"]);
    }

    #[test]
    fn test_fatal_error_ends_run() {
        let mut execution = ExecutionLoop::new();
        let mut shell = ScriptedShell::new(&["fatal", "1;"]);
        let err = execution.run(&mut shell).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(shell.errors.len(), 1);
        assert_eq!(shell.executed, vec!["fatal"]);
    }

    #[test]
    fn test_input_rewrite() {
        let mut execution = ExecutionLoop::new();
        execution.add_listener(Rewriter);
        let mut shell = ScriptedShell::new(&["say 'hi'"]);
        execution.run(&mut shell).unwrap();
        assert_eq!(shell.executed, vec!["echo 'hi';"]);
    }
}
