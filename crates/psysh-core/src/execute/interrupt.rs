//! Cooperative interrupt flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Handle for interrupting a running evaluation.
///
/// `InterruptHandle` wraps the flag a SIGINT action sets. The interpreter
/// polls it at every loop iteration and function call, and unwinds with
/// [`Error::Interrupted`](crate::Error::Interrupted) once it is set.
///
/// # Example
///
/// ```
/// use psysh_core::execute::InterruptHandle;
///
/// let handle = InterruptHandle::new();
/// let clone = handle.clone();
///
/// assert!(!handle.is_interrupted());
/// clone.interrupt();
/// assert!(handle.is_interrupted());
/// ```
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check if an interrupt has been requested.
    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Request an interrupt.
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Clear the flag before the next evaluation.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }

    /// The shared flag, for registering as a signal action.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_handle_default() {
        let handle = InterruptHandle::default();
        assert!(!handle.is_interrupted());
    }

    #[test]
    fn test_interrupt_and_reset() {
        let handle = InterruptHandle::new();
        let clone = handle.clone();

        clone.interrupt();
        assert!(handle.is_interrupted());

        handle.reset();
        assert!(!clone.is_interrupted());
    }

    #[test]
    fn test_flag_is_shared() {
        let handle = InterruptHandle::new();
        handle.flag().store(true, Ordering::Relaxed);
        assert!(handle.is_interrupted());
    }
}
