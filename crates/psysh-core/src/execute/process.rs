//! Process primitives for the forking supervisor.
//!
//! Thin wrappers over fork(2), waitpid(2) and kill(2) with errors mapped to
//! `io::Error`.

use std::fmt;
use std::io::{self, Write};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, Ordering};

pub type Pid = libc::pid_t;

/// Which side of a fork the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkResult {
    Parent(Pid),
    Child,
}

/// Fork the current process.
///
/// Standard streams are flushed first so buffered output is not written
/// twice.
pub fn fork() -> io::Result<ForkResult> {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();

    // SAFETY: the child only continues on the calling thread, which owns
    // everything it goes on to touch.
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(ForkResult::Child),
        pid => Ok(ForkResult::Parent(pid)),
    }
}

pub fn current_pid() -> Pid {
    // SAFETY: getpid cannot fail.
    unsafe { libc::getpid() }
}

/// Send `signal` to `pid`. A process that is already gone is not an error.
pub fn send_signal(pid: Pid, signal: libc::c_int) -> io::Result<()> {
    // SAFETY: kill has no memory-safety preconditions.
    if unsafe { libc::kill(pid, signal) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

/// Terminate the current process immediately, skipping destructors and
/// exit handlers.
pub fn kill_self() -> ! {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
    let _ = send_signal(current_pid(), libc::SIGKILL);
    // SIGKILL cannot be caught; this is only reached if it could not be sent.
    std::process::abort()
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Exited(i32),
    Signaled(i32),
    Unknown,
}

impl WaitStatus {
    fn from_raw(status: libc::c_int) -> Self {
        if libc::WIFEXITED(status) {
            WaitStatus::Exited(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            WaitStatus::Signaled(libc::WTERMSIG(status))
        } else {
            WaitStatus::Unknown
        }
    }

    /// Whether a worker ended its session on purpose: exit status 0, or the
    /// SIGKILL it sends itself after reporting back.
    pub fn is_clean(&self) -> bool {
        matches!(self, WaitStatus::Exited(0) | WaitStatus::Signaled(libc::SIGKILL))
    }

    /// Shell-style exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            WaitStatus::Exited(code) => *code,
            WaitStatus::Signaled(signal) => 128 + signal,
            WaitStatus::Unknown => 130,
        }
    }
}

impl fmt::Display for WaitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitStatus::Exited(code) => write!(f, "exit status {}", code),
            WaitStatus::Signaled(signal) => write!(f, "signal {}", signal),
            WaitStatus::Unknown => f.write_str("unknown status"),
        }
    }
}

/// Block until `pid` terminates, retrying on EINTR.
pub fn wait_for(pid: Pid) -> io::Result<WaitStatus> {
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: `status` is a valid out-pointer.
        let result = unsafe { libc::waitpid(pid, &mut status, 0) };
        if result == pid {
            return Ok(WaitStatus::from_raw(status));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// A pid visible to every process forked after its creation.
///
/// The worker publishes its pid here each time a savegame hands over to a
/// fresh worker, so the supervisor can relay SIGINT to whichever process is
/// currently evaluating input.
pub struct SharedPid {
    slot: NonNull<AtomicI32>,
}

// SAFETY: the slot is an atomic in a mapping that lives as long as `self`.
unsafe impl Send for SharedPid {}
unsafe impl Sync for SharedPid {}

impl SharedPid {
    pub fn new() -> io::Result<Self> {
        let size = std::mem::size_of::<AtomicI32>();
        // SAFETY: anonymous shared mapping with no file descriptor.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let slot = NonNull::new(ptr.cast::<AtomicI32>())
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;
        // SAFETY: the mapping is page-aligned and large enough for one AtomicI32.
        unsafe { slot.as_ptr().write(AtomicI32::new(0)) };
        Ok(Self { slot })
    }

    fn slot(&self) -> &AtomicI32 {
        // SAFETY: initialized in `new`, unmapped only in `drop`.
        unsafe { self.slot.as_ref() }
    }

    pub fn set(&self, pid: Pid) {
        self.slot().store(pid, Ordering::SeqCst);
    }

    /// The published pid, or `None` before any was set.
    pub fn get(&self) -> Option<Pid> {
        match self.slot().load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }
}

impl fmt::Debug for SharedPid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedPid").field(&self.get()).finish()
    }
}

impl Drop for SharedPid {
    fn drop(&mut self) {
        // SAFETY: the mapping was created in `new` with this size.
        unsafe {
            libc::munmap(self.slot.as_ptr().cast(), std::mem::size_of::<AtomicI32>());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fork a child that immediately leaves with `code`.
    fn spawn_exiting(code: i32) -> Pid {
        match fork().unwrap() {
            ForkResult::Child => unsafe { libc::_exit(code) },
            ForkResult::Parent(pid) => pid,
        }
    }

    #[test]
    fn test_wait_for_exit_status() {
        let pid = spawn_exiting(3);
        let status = wait_for(pid).unwrap();
        assert_eq!(status, WaitStatus::Exited(3));
        assert!(!status.is_clean());
        assert_eq!(status.exit_code(), 3);
    }

    #[test]
    fn test_status_classification() {
        assert!(WaitStatus::Exited(0).is_clean());
        assert!(WaitStatus::Signaled(libc::SIGKILL).is_clean());
        assert!(!WaitStatus::Signaled(libc::SIGSEGV).is_clean());
        assert!(!WaitStatus::Exited(255).is_clean());

        assert_eq!(WaitStatus::Signaled(libc::SIGSEGV).exit_code(), 128 + libc::SIGSEGV);
        assert_eq!(WaitStatus::Unknown.exit_code(), 130);
        assert_eq!(WaitStatus::Signaled(9).to_string(), "signal 9");
    }

    #[test]
    fn test_send_signal_to_missing_process() {
        let pid = spawn_exiting(0);
        wait_for(pid).unwrap();
        // Reaped: the pid no longer names a process.
        send_signal(pid, 0).unwrap();
    }

    #[test]
    fn test_shared_pid_crosses_fork() {
        let shared = SharedPid::new().unwrap();
        assert_eq!(shared.get(), None);

        match fork().unwrap() {
            ForkResult::Child => {
                shared.set(4242);
                unsafe { libc::_exit(0) }
            }
            ForkResult::Parent(pid) => {
                wait_for(pid).unwrap();
                assert_eq!(shared.get(), Some(4242));
            }
        }
    }
}
