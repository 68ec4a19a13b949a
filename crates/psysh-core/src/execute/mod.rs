//! Execution loop and its process-control listeners.
//!
//! # Listeners
//!
//! - **`ProcessForker`** - Evaluates input in a forked worker. A savegame
//!   process taken before every input line lets the session survive a
//!   crashing worker; SIGINT interrupts the running evaluation.
//! - **`SignalHandler`** - Same Ctrl-C semantics in a single process, without
//!   crash recovery.
//!
//! # Module Structure
//!
//! - `driver` - `ExecutionLoop`, which calls the listener hooks
//! - `forker` - `ProcessForker`
//! - `interrupt` - Cooperative interrupt flag polled by the interpreter
//! - `process` - fork/wait/kill wrappers
//! - `signal` - `SignalHandler`
//! - `terminal` - Terminal mode capture and ISIG toggling

mod driver;
mod forker;
mod interrupt;
pub mod process;
mod signal;
mod terminal;

pub use driver::ExecutionLoop;
pub use forker::ProcessForker;
pub use interrupt::InterruptHandle;
pub use signal::SignalHandler;
pub use terminal::TerminalState;
