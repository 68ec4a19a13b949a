//! Session payload sent from the execution loop process to the supervisor.
//!
//! Uses length-prefixed bincode messages over a Unix socket pair.
//! Format: 4-byte length (u32 LE) + bincode-encoded (serde) message.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::shell::{ScopeVariables, transferable_variables};

/// Upper bound on a single frame body.
pub const MAX_MESSAGE_LEN: usize = 100 * 1024 * 1024;

/// Final state of a session, written once when the worker exits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionPayload {
    pub exit_code: i32,
    pub scope_vars: ScopeVariables,
}

impl SessionPayload {
    /// Build a payload, dropping variables that cannot cross the process
    /// boundary.
    pub fn new(exit_code: i32, scope_vars: ScopeVariables) -> Self {
        Self {
            exit_code,
            scope_vars: transferable_variables(scope_vars),
        }
    }
}

fn config() -> bincode::config::Configuration {
    bincode::config::standard()
}

/// Write a message to a writer using length-prefixed bincode encoding.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let bytes = bincode::serde::encode_to_vec(message, config())
        .map_err(|e| Error::Serialization(format!("Failed to encode IPC message: {}", e)))?;

    if bytes.len() > MAX_MESSAGE_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", bytes.len())));
    }

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Read a message from a reader using length-prefixed bincode encoding.
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T> {
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message length: {}", e)))?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_MESSAGE_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", len)));
    }

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;

    decode(&bytes)
}

/// Decode a frame that has already been read in full.
///
/// An empty buffer is not a frame; callers treat it as "no payload".
pub fn decode_frame<T: DeserializeOwned>(buffer: &[u8]) -> Result<T> {
    let mut reader = buffer;
    let message = read_message(&mut reader)?;
    if !reader.is_empty() {
        return Err(Error::Ipc(format!("{} trailing bytes after IPC message", reader.len())));
    }
    Ok(message)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (message, _) = bincode::serde::decode_from_slice(bytes, config())
        .map_err(|e| Error::Serialization(format!("Failed to decode IPC message: {}", e)))?;
    Ok(message)
}
