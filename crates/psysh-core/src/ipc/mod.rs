//! Inter-process communication between the supervisor and the execution
//! loop process.
//!
//! The execution loop reports back exactly once, when the session ends: a
//! single framed [`SessionPayload`] on one end of a Unix socket pair.

pub mod protocol;
mod socket;

pub use protocol::{SessionPayload, decode_frame, read_message, write_message};
pub use socket::{drain, wait_readable};
