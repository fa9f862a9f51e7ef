//! Thin wrapper over a multi-producer / multi-consumer channel shared
//! between the manager and every worker it owns.

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::envelope::Envelope;

/// A bounded or unbounded MPMC channel of [`Envelope`]s.
///
/// Cloning a [`Channel`] yields another handle onto the same underlying
/// queue (both ends of `crossbeam-channel` are `Clone`), which is how the
/// manager and every worker come to share one input queue: whichever worker
/// happens to call `recv` first on its own handle wins the race for the
/// next item, exactly matching the distilled spec's "any worker may
/// consume" semantics.
pub struct Channel<T> {
    sender: Sender<Envelope<T>>,
    receiver: Receiver<Envelope<T>>,
    capacity: Option<usize>,
}

// Implemented by hand rather than derived: `#[derive(Clone)]` would add a
// spurious `T: Clone` bound, but `Sender`/`Receiver` are `Clone` regardless
// of the message type.
impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> Channel<T> {
    pub fn unbounded() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Channel {
            sender,
            receiver,
            capacity: None,
        }
    }

    pub fn bounded(capacity: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        Channel {
            sender,
            receiver,
            capacity: Some(capacity),
        }
    }

    pub fn with_capacity(capacity: Option<usize>) -> Self {
        match capacity {
            Some(cap) => Channel::bounded(cap),
            None => Channel::unbounded(),
        }
    }

    /// Pushes an envelope onto the channel, blocking if it is bounded and
    /// currently full.
    pub fn push(&self, envelope: Envelope<T>) {
        // A closed receiver only happens once every handle (manager and
        // workers alike) has been dropped, which only occurs after the pool
        // has already been fully torn down; silently dropping the envelope
        // in that case is correct.
        let _ = self.sender.send(envelope);
    }

    /// Blocks until an envelope is available or every sender has been
    /// dropped, in which case `None` is returned.
    pub fn recv(&self) -> Option<Envelope<T>> {
        self.receiver.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<Envelope<T>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(envelope) => Some(envelope),
            Err(_) => None,
        }
    }

    pub fn try_recv(&self) -> Result<Envelope<T>, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn is_full(&self) -> bool {
        match self.capacity {
            Some(cap) => self.receiver.len() >= cap,
            None => false,
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_round_trip() {
        let channel: Channel<&str> = Channel::unbounded();
        channel.push(Envelope::data("hello", "tester"));
        let envelope = channel.recv().unwrap();
        assert_eq!(envelope.source_worker, "tester");
    }

    #[test]
    fn bounded_reports_full() {
        let channel: Channel<u32> = Channel::bounded(2);
        assert!(!channel.is_full());
        channel.push(Envelope::data(1, "a"));
        channel.push(Envelope::data(2, "a"));
        assert!(channel.is_full());
        assert_eq!(channel.len(), 2);
    }

    #[test]
    fn clones_share_the_queue() {
        let channel: Channel<u32> = Channel::unbounded();
        let clone = channel.clone();
        channel.push(Envelope::data(7, "a"));
        assert_eq!(clone.recv().unwrap().source_worker, "a");
    }
}
