//! Blocking reads on the supervisor's end of the socket pair.

use std::io::{self, Read};
use std::os::fd::AsRawFd;

use crate::error::{Error, Result};

/// Block until `source` is readable or its peer has closed.
///
/// A signal arriving while blocked (SIGINT being relayed to the execution
/// loop, typically) restarts the wait.
pub fn wait_readable(source: &impl AsRawFd) -> Result<()> {
    let mut pfd = libc::pollfd {
        fd: source.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        // SAFETY: `pfd` is a valid pollfd for the duration of the call.
        let ready = unsafe { libc::poll(&mut pfd, 1, -1) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Ipc(format!("Error waiting for execution loop: {}", err)));
        }
        if ready == 0 {
            return Err(Error::Ipc("Timed out waiting for execution loop".to_string()));
        }
        return Ok(());
    }
}

/// Read everything until the peer closes its end.
pub fn drain(source: &mut impl Read) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    source
        .read_to_end(&mut buffer)
        .map_err(|e| Error::Ipc(format!("Failed to read from execution loop: {}", e)))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_wait_then_drain() {
        let (mut parent, mut child) = UnixStream::pair().unwrap();
        child.write_all(b"payload").unwrap();
        drop(child);

        wait_readable(&parent).unwrap();
        assert_eq!(drain(&mut parent).unwrap(), b"payload");
    }

    #[test]
    fn test_closed_peer_is_readable() {
        let (parent, child) = UnixStream::pair().unwrap();
        drop(child);
        wait_readable(&parent).unwrap();
    }
}
