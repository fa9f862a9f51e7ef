//! Captures a worker's user-logic panic so it can cross the thread boundary
//! and be reported by the manager.

use std::any::Any;
use std::fmt;

/// Represents a panic caught while running a worker's [`WorkerLogic`](crate::worker::WorkerLogic).
///
/// This mirrors the teacher's `Panic` type: a message plus, when the
/// `backtrace` feature is enabled, a resolved backtrace.
pub struct WorkerPanic {
    msg: String,
    #[cfg(feature = "backtrace")]
    backtrace: Option<backtrace::Backtrace>,
}

impl WorkerPanic {
    pub(crate) fn from_payload(payload: &(dyn Any + Send + 'static)) -> WorkerPanic {
        let msg = match payload.downcast_ref::<&'static str>() {
            Some(s) => (*s).to_string(),
            None => match payload.downcast_ref::<String>() {
                Some(s) => s.clone(),
                None => "worker panicked with a non-string payload".to_string(),
            },
        };

        WorkerPanic {
            msg,
            #[cfg(feature = "backtrace")]
            backtrace: Some(backtrace::Backtrace::new()),
        }
    }

    /// Returns the message of the panic.
    pub fn message(&self) -> &str {
        self.msg.as_str()
    }

    /// Returns a reference to the resolved backtrace, if captured.
    #[cfg(feature = "backtrace")]
    pub fn backtrace(&self) -> Option<&backtrace::Backtrace> {
        self.backtrace.as_ref()
    }

    /// Renders the full trace text the manager logs and hands back to the
    /// worker's exception slot, corresponding to the distilled spec's
    /// `(error, trace_string)` pair.
    pub fn trace_string(&self) -> String {
        #[cfg(feature = "backtrace")]
        {
            match &self.backtrace {
                Some(bt) => format!("{}\n{:?}", self.msg, bt),
                None => self.msg.clone(),
            }
        }
        #[cfg(not(feature = "backtrace"))]
        {
            self.msg.clone()
        }
    }
}

impl fmt::Debug for WorkerPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPanic")
            .field("message", &self.message())
            .finish()
    }
}

impl fmt::Display for WorkerPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}
