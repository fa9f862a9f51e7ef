//! The sticky, process-wide cancellation flag shared by the manager and
//! every worker it owns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A monotonic cancellation flag: once set, it is never cleared for the life
/// of the manager that owns it.
///
/// Cloning an [`ExitEvent`] yields a handle to the same underlying flag, so
/// that a cloned handle can be handed to each worker at construction time
/// (see the distilled spec's design notes on preferring this direct form
/// over reaching for "a random worker's handle").
#[derive(Clone, Default)]
pub struct ExitEvent {
    flag: Arc<AtomicBool>,
}

impl ExitEvent {
    pub fn new() -> Self {
        ExitEvent {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sets the flag. A no-op if it is already set.
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unset() {
        let event = ExitEvent::new();
        assert!(!event.is_set());
    }

    #[test]
    fn sticky_once_set() {
        let event = ExitEvent::new();
        event.set();
        event.set();
        assert!(event.is_set());
    }

    #[test]
    fn clones_share_the_same_flag() {
        let event = ExitEvent::new();
        let clone = event.clone();
        clone.set();
        assert!(event.is_set());
    }
}
