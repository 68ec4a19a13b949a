//! Ctrl-C handling without process isolation.

use signal_hook::SigId;
use signal_hook::consts::SIGINT;
use tracing::debug;

use super::interrupt::InterruptHandle;
use super::terminal::TerminalState;
use crate::error::{Error, Result};
use crate::listener::{ExecutionOutcome, Listener};
use crate::shell::Shell;

/// Turns SIGINT into an interrupt of the running evaluation.
///
/// The SIGINT action is only registered while code runs (`on_execute` until
/// `after_loop`). Terminal signal keys follow the same window: they are off
/// from `before_run` on, so Ctrl-C at the prompt generates nothing.
#[derive(Debug)]
pub struct SignalHandler {
    interrupt: InterruptHandle,
    terminal: TerminalState,
    registration: Option<SigId>,
    signal_keys_enabled: bool,
    was_interrupted: bool,
}

impl SignalHandler {
    pub fn new(interrupt: InterruptHandle) -> Self {
        Self {
            interrupt,
            terminal: TerminalState::detached(),
            registration: None,
            signal_keys_enabled: false,
            was_interrupted: false,
        }
    }

    /// Whether the last evaluation was cut short by SIGINT.
    pub fn was_interrupted(&self) -> bool {
        self.was_interrupted
    }

    /// Capture standard input's terminal mode and switch its signal keys off
    /// for the prompt.
    pub(crate) fn capture_terminal(&mut self) {
        self.attach_terminal(TerminalState::capture());
    }

    fn attach_terminal(&mut self, terminal: TerminalState) {
        self.terminal = terminal;
        self.terminal.set_signal_keys(false);
        self.signal_keys_enabled = false;
    }

    pub(crate) fn restore_terminal(&self) {
        self.terminal.restore();
    }

    fn register(&mut self) -> Result<()> {
        if self.registration.is_some() {
            return Ok(());
        }
        let id = signal_hook::flag::register(SIGINT, self.interrupt.flag())
            .map_err(|e| Error::Signal(format!("Failed to install SIGINT handler: {}", e)))?;
        self.registration = Some(id);
        Ok(())
    }

    fn unregister(&mut self) {
        if let Some(id) = self.registration.take() {
            signal_hook::low_level::unregister(id);
        }
    }
}

impl Listener for SignalHandler {
    fn is_supported(&self) -> bool {
        cfg!(unix)
    }

    fn before_run(&mut self, _shell: &mut dyn Shell) -> Result<ExecutionOutcome> {
        self.capture_terminal();
        Ok(ExecutionOutcome::Continue)
    }

    fn on_execute(&mut self, _shell: &mut dyn Shell, _code: &str) -> Result<Option<String>> {
        self.was_interrupted = false;
        self.interrupt.reset();

        if self.terminal.is_tty() {
            self.terminal.set_signal_keys(true);
            self.signal_keys_enabled = true;
        }
        self.register()?;
        Ok(None)
    }

    fn after_loop(&mut self, _shell: &mut dyn Shell) -> Result<()> {
        self.unregister();

        if self.signal_keys_enabled {
            self.terminal.set_signal_keys(false);
            self.signal_keys_enabled = false;
        }

        if self.interrupt.is_interrupted() {
            debug!("Evaluation interrupted, discarding pending input");
            self.was_interrupted = true;
            self.terminal.discard_pending_input();
        }
        Ok(())
    }

    fn after_run(&mut self, _shell: &mut dyn Shell, _exit_code: i32) -> Result<()> {
        self.unregister();
        self.restore_terminal();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reload::{CodePatcher, UnsupportedPatcher};
    use crate::shell::{Notice, ScopeVariables};
    use std::path::PathBuf;

    struct NullShell(UnsupportedPatcher);

    impl Shell for NullShell {
        fn scope_variables(&self, _include_special: bool) -> ScopeVariables {
            ScopeVariables::new()
        }
        fn set_scope_variables(&mut self, _vars: ScopeVariables) {}
        fn write_exception(&mut self, _error: &Error) {}
        fn write_notice(&mut self, _notice: &Notice) {}
        fn loaded_files(&self) -> Vec<PathBuf> {
            Vec::new()
        }
        fn code_patcher(&mut self) -> &mut dyn CodePatcher {
            &mut self.0
        }
    }

    #[test]
    fn test_sigint_sets_interrupt_only_while_executing() {
        let interrupt = InterruptHandle::new();
        let mut handler = SignalHandler::new(interrupt.clone());
        let mut shell = NullShell(UnsupportedPatcher);

        handler.on_execute(&mut shell, "while (true) {}").unwrap();
        signal_hook::low_level::raise(SIGINT).unwrap();
        assert!(interrupt.is_interrupted());

        handler.after_loop(&mut shell).unwrap();
        assert!(handler.was_interrupted());

        // The next evaluation starts clean.
        handler.on_execute(&mut shell, "1;").unwrap();
        assert!(!interrupt.is_interrupted());
        assert!(!handler.was_interrupted());
        handler.after_loop(&mut shell).unwrap();
        assert!(!handler.was_interrupted());

        handler.after_run(&mut shell, 0).unwrap();
    }

    #[test]
    fn test_signal_keys_are_off_at_the_prompt() {
        let mut master: libc::c_int = 0;
        let mut slave: libc::c_int = 0;
        let result = unsafe {
            libc::openpty(
                &mut master,
                &mut slave,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        assert_eq!(result, 0, "openpty failed");
        let isig = || {
            let mut termios = unsafe { std::mem::zeroed::<libc::termios>() };
            assert_eq!(unsafe { libc::tcgetattr(slave, &mut termios) }, 0);
            termios.c_lflag & libc::ISIG != 0
        };
        assert!(isig(), "a fresh pty starts with signal keys on");

        let mut handler = SignalHandler::new(InterruptHandle::new());
        let mut shell = NullShell(UnsupportedPatcher);

        // Ctrl-C at the first prompt must not raise SIGINT.
        handler.attach_terminal(TerminalState::capture_fd(slave));
        assert!(!isig());

        handler.on_execute(&mut shell, "1;").unwrap();
        assert!(isig());
        handler.after_loop(&mut shell).unwrap();
        assert!(!isig());

        handler.after_run(&mut shell, 0).unwrap();
        assert!(isig());

        unsafe {
            libc::close(master);
            libc::close(slave);
        }
    }
}
