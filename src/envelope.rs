//! The message shape that travels across every channel the manager owns.

/// A control token interpreted by a worker as a state transition instead of
/// user data.
///
/// These correspond to the literal strings `"stop"` and `"wait"` in payload
/// position on any wire format that needs one; since workers in this crate
/// never leave process memory there is nothing to serialize, so a plain enum
/// is the idiomatic choice here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlToken {
    Stop,
    Wait,
}

/// The payload of an [`Envelope`]: either a control token or a user datum.
#[derive(Debug, Clone)]
pub enum Payload<T> {
    Control(ControlToken),
    Data(T),
}

impl<T> Payload<T> {
    pub fn is_stop(&self) -> bool {
        matches!(self, Payload::Control(ControlToken::Stop))
    }

    pub fn is_wait(&self) -> bool {
        matches!(self, Payload::Control(ControlToken::Wait))
    }
}

/// Every message crossing the input, output, or configuration channel.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: Payload<T>,
    pub source_worker: String,
    pub destination_worker: Option<String>,
}

impl<T> Envelope<T> {
    pub fn new(payload: Payload<T>, source_worker: impl Into<String>) -> Self {
        Envelope {
            payload,
            source_worker: source_worker.into(),
            destination_worker: None,
        }
    }

    pub fn with_destination(mut self, destination_worker: impl Into<String>) -> Self {
        self.destination_worker = Some(destination_worker.into());
        self
    }

    pub fn data(payload: T, source_worker: impl Into<String>) -> Self {
        Envelope::new(Payload::Data(payload), source_worker)
    }

    pub fn stop(source_worker: impl Into<String>) -> Self {
        Envelope::new(Payload::Control(ControlToken::Stop), source_worker)
    }

    pub fn wait(source_worker: impl Into<String>) -> Self {
        Envelope::new(Payload::Control(ControlToken::Wait), source_worker)
    }

    /// True when this envelope is addressed to somebody other than `name`.
    pub fn misaddressed(&self, name: &str) -> bool {
        matches!(&self.destination_worker, Some(dest) if dest != name)
    }
}
