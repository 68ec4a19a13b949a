//! Terminal mode handling around evaluation.
//!
//! Signal keys (ISIG) are only enabled while code is being evaluated, so
//! Ctrl-C interrupts running code but not the prompt.

use std::fmt;
use std::io;

use libc::c_int;
use tracing::warn;

fn get_termios(fd: c_int) -> io::Result<libc::termios> {
    // SAFETY: termios is plain data; tcgetattr fills it in.
    let mut termios = unsafe { std::mem::zeroed::<libc::termios>() };
    let result = unsafe { libc::tcgetattr(fd, &mut termios) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(termios)
}

fn set_termios(fd: c_int, termios: &libc::termios) -> io::Result<()> {
    // SAFETY: `termios` is a valid, initialized termios.
    let result = unsafe { libc::tcsetattr(fd, libc::TCSANOW, termios) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn is_tty(fd: c_int) -> bool {
    // SAFETY: isatty has no memory-safety preconditions.
    unsafe { libc::isatty(fd) == 1 }
}

/// Terminal mode captured at session start.
#[derive(Clone, Copy)]
pub struct TerminalState {
    fd: c_int,
    original: Option<libc::termios>,
}

impl TerminalState {
    /// Capture the mode of standard input. Not a terminal: nothing captured.
    pub fn capture() -> Self {
        Self::capture_fd(libc::STDIN_FILENO)
    }

    pub fn capture_fd(fd: c_int) -> Self {
        let original = if is_tty(fd) {
            get_termios(fd)
                .map_err(|e| warn!("Failed to read terminal mode: {}", e))
                .ok()
        } else {
            None
        };
        Self { fd, original }
    }

    /// A state that never touches the terminal.
    pub fn detached() -> Self {
        Self {
            fd: libc::STDIN_FILENO,
            original: None,
        }
    }

    pub fn is_tty(&self) -> bool {
        self.original.is_some()
    }

    /// Turn terminal-generated signals (Ctrl-C, Ctrl-\) on or off.
    pub fn set_signal_keys(&self, enabled: bool) {
        if !self.is_tty() {
            return;
        }
        let result = get_termios(self.fd).and_then(|mut termios| {
            if enabled {
                termios.c_lflag |= libc::ISIG;
            } else {
                termios.c_lflag &= !libc::ISIG;
            }
            set_termios(self.fd, &termios)
        });
        if let Err(e) = result {
            warn!("Failed to toggle terminal signal keys: {}", e);
        }
    }

    /// Throw away input typed but not yet read.
    pub fn discard_pending_input(&self) {
        if self.is_tty() {
            // SAFETY: tcflush has no memory-safety preconditions.
            let _ = unsafe { libc::tcflush(self.fd, libc::TCIFLUSH) };
        }
    }

    /// Put the terminal back the way it was captured.
    pub fn restore(&self) {
        if let Some(original) = &self.original {
            if let Err(e) = set_termios(self.fd, original) {
                warn!("Failed to restore terminal mode: {}", e);
            }
        }
    }
}

impl Default for TerminalState {
    fn default() -> Self {
        Self::detached()
    }
}

impl fmt::Debug for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalState")
            .field("fd", &self.fd)
            .field("captured", &self.original.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pty {
        master: c_int,
        slave: c_int,
    }

    impl Drop for Pty {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.master);
                libc::close(self.slave);
            }
        }
    }

    fn open_pty() -> Pty {
        let mut master: c_int = 0;
        let mut slave: c_int = 0;
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
        Pty { master, slave }
    }

    #[test]
    fn test_signal_keys_toggle_and_restore() {
        let pty = open_pty();
        let state = TerminalState::capture_fd(pty.slave);
        assert!(state.is_tty());
        let original = get_termios(pty.slave).unwrap().c_lflag & libc::ISIG;

        state.set_signal_keys(false);
        assert_eq!(get_termios(pty.slave).unwrap().c_lflag & libc::ISIG, 0);
        state.set_signal_keys(true);
        assert_ne!(get_termios(pty.slave).unwrap().c_lflag & libc::ISIG, 0);

        state.set_signal_keys(original == 0);
        state.restore();
        assert_eq!(get_termios(pty.slave).unwrap().c_lflag & libc::ISIG, original);
    }

    #[test]
    fn test_non_terminal_is_left_alone() {
        let mut fds = [0 as c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let state = TerminalState::capture_fd(fds[0]);
        assert!(!state.is_tty());
        state.set_signal_keys(true);
        state.discard_pending_input();
        state.restore();
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
