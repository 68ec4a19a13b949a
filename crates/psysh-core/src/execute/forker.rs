//! Process-isolated execution loop.
//!
//! ```text
//! supervisor ──fork──> execution loop
//!     │                   │
//!     │ waits on          ├── before_loop: fork ──> worker (evaluates input)
//!     │ socket EOF        │                          │
//!     │                   │   savegame: waits        ├── crash: savegame forks a
//!     │                   │   for the worker         │   fresh worker
//!     │                   │                          └── after_loop: kills the
//!     │                   │                              savegame
//!     │ <── SessionPayload ───────────────────────── after_run
//! ```
//!
//! Every input line is evaluated in a worker whose parent (the savegame) holds
//! the state from before that line. If the worker dies, the savegame forks a
//! new worker from that state and the session carries on.

use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::SigId;
use signal_hook::consts::SIGINT;
use tracing::{debug, warn};

use super::interrupt::InterruptHandle;
use super::process::{self, ForkResult, Pid, SharedPid, WaitStatus};
use super::signal::SignalHandler;
use super::terminal::TerminalState;
use crate::error::{Error, Result};
use crate::ipc::{self, SessionPayload};
use crate::listener::{ExecutionOutcome, Listener};
use crate::shell::Shell;

/// Runs the execution loop in a child process and recovers from crashes.
#[derive(Debug)]
pub struct ProcessForker {
    signals: SignalHandler,
    /// Worker end of the socket pair. Only set in the execution loop.
    socket: Option<UnixStream>,
    /// Process holding the state from before the current input line.
    savegame: Option<Pid>,
    /// Pid of whichever process is currently evaluating input.
    worker: Option<Arc<SharedPid>>,
    shield: Option<SigId>,
}

impl ProcessForker {
    pub fn new(interrupt: InterruptHandle) -> Self {
        Self {
            signals: SignalHandler::new(interrupt),
            socket: None,
            savegame: None,
            worker: None,
            shield: None,
        }
    }

    /// Whether this process is the execution loop side of the fork.
    pub fn is_execution_loop(&self) -> bool {
        self.socket.is_some()
    }

    /// Supervisor side: wait for the execution loop to report back.
    fn supervise(
        &mut self,
        shell: &mut dyn Shell,
        mut socket: UnixStream,
        child: Pid,
        worker: Arc<SharedPid>,
    ) -> Result<i32> {
        let interrupted = Arc::new(AtomicBool::new(false));
        let action = {
            let interrupted = Arc::clone(&interrupted);
            move || {
                interrupted.store(true, Ordering::SeqCst);
                if let Some(pid) = worker.get() {
                    let _ = process::send_signal(pid, SIGINT);
                }
            }
        };
        // SAFETY: the action only touches atomics and calls kill(2), both of
        // which are async-signal-safe.
        let relay = unsafe { signal_hook::low_level::register(SIGINT, action) }
            .map_err(|e| Error::Signal(format!("Failed to install SIGINT relay: {}", e)))?;

        let received = ipc::wait_readable(&socket).and_then(|()| ipc::drain(&mut socket));
        signal_hook::low_level::unregister(relay);
        let payload = received?;

        let status = process::wait_for(child)
            .map_err(|e| Error::Ipc(format!("Failed to wait for execution loop: {}", e)))?;
        debug!("Execution loop {} finished with {}", child, status);

        if payload.is_empty() {
            let code = match status {
                WaitStatus::Exited(code) => code,
                _ if interrupted.load(Ordering::SeqCst) => 130,
                other => other.exit_code(),
            };
            return Ok(code);
        }

        let payload: SessionPayload = ipc::decode_frame(&payload)?;
        debug!("Restoring {} scope variables", payload.scope_vars.len());
        shell.set_scope_variables(payload.scope_vars);
        Ok(payload.exit_code)
    }

    /// Fork a worker and turn this process into its savegame.
    ///
    /// Returns in the worker. The savegame never returns: it kills itself
    /// once its worker ends the session, and forks a replacement worker every
    /// time one dies.
    fn create_savegame(&mut self) -> Result<()> {
        let savegame = process::current_pid();
        self.savegame = Some(savegame);

        loop {
            let fork = process::fork()
                .map_err(|e| Error::Fork(format!("Unable to create savegame fork: {}", e)))?;
            let worker = match fork {
                ForkResult::Child => {
                    if let Some(shared) = &self.worker {
                        shared.set(process::current_pid());
                    }
                    return Ok(());
                }
                ForkResult::Parent(worker) => worker,
            };

            let status = process::wait_for(worker)
                .map_err(|e| Error::Fork(format!("Lost track of worker {}: {}", worker, e)))?;
            if status.is_clean() {
                debug!("Worker {} finished with {}, savegame {} exiting", worker, status, savegame);
                process::kill_self();
            }
            debug!("Worker {} died with {}, restoring savegame {}", worker, status, savegame);
        }
    }
}

impl Listener for ProcessForker {
    fn is_supported(&self) -> bool {
        cfg!(unix)
    }

    fn before_run(&mut self, shell: &mut dyn Shell) -> Result<ExecutionOutcome> {
        let (down, up) = UnixStream::pair()
            .map_err(|e| Error::Fork(format!("Unable to create socket pair: {}", e)))?;
        let worker = SharedPid::new()
            .map_err(|e| Error::Fork(format!("Unable to share worker pid: {}", e)))?;
        let worker = Arc::new(worker);

        let terminal = TerminalState::capture();
        let fork = process::fork()
            .map_err(|e| Error::Fork(format!("Unable to start execution loop: {}", e)))?;
        match fork {
            ForkResult::Parent(child) => {
                drop(up);
                worker.set(child);
                let code = self.supervise(shell, down, child, worker);
                // A worker that died on its way out leaves the prompt mode behind.
                terminal.restore();
                Ok(ExecutionOutcome::Exit(code?))
            }
            ForkResult::Child => {
                drop(down);
                worker.set(process::current_pid());

                // Processes forked from here on survive a terminal Ctrl-C:
                // SIGINT only ever interrupts an evaluation.
                let shield = signal_hook::flag::register(SIGINT, Arc::new(AtomicBool::new(false)))
                    .map_err(|e| {
                        Error::Signal(format!("Failed to install SIGINT handler: {}", e))
                    })?;
                self.shield = Some(shield);

                self.signals.capture_terminal();
                self.socket = Some(up);
                self.worker = Some(worker);
                Ok(ExecutionOutcome::Continue)
            }
        }
    }

    fn before_loop(&mut self, _shell: &mut dyn Shell) -> Result<()> {
        if !self.is_execution_loop() {
            return Ok(());
        }
        self.create_savegame()
    }

    fn on_execute(&mut self, shell: &mut dyn Shell, code: &str) -> Result<Option<String>> {
        self.signals.on_execute(shell, code)
    }

    fn after_loop(&mut self, shell: &mut dyn Shell) -> Result<()> {
        self.signals.after_loop(shell)?;

        if let Some(savegame) = self.savegame.take() {
            if let Err(e) = process::send_signal(savegame, libc::SIGKILL) {
                warn!("Failed to kill savegame {}: {}", savegame, e);
            }
        }
        Ok(())
    }

    fn after_run(&mut self, shell: &mut dyn Shell, exit_code: i32) -> Result<()> {
        let Some(mut socket) = self.socket.take() else {
            return Ok(());
        };

        let payload = SessionPayload::new(exit_code, shell.scope_variables(false));
        if let Err(e) = ipc::write_message(&mut socket, &payload) {
            shell.write_exception(&e);
        }
        drop(socket);

        self.signals.after_run(shell, exit_code)?;
        process::kill_self()
    }
}
