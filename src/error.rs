//! Error types for the map engine.

use std::fmt;

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

/// Result type alias for map-engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// How the processing of a single item failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum FailureKind {
    /// The producer yielded an error value for this item.
    Produce,

    /// The worker thread processing this item died.
    Crashed,

    /// The item exceeded the configured per-item deadline.
    TimedOut,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Produce => write!(f, "producer error"),
            FailureKind::Crashed => write!(f, "worker crashed"),
            FailureKind::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Errors yielded while pulling from a result stream.
///
/// Only [`Error::Item`] is recoverable: the stream stays consumable after
/// yielding it. The other variants are fatal and terminate the stream after
/// pool teardown.
#[derive(Debug, Clone)]
pub enum Error {
    /// Processing one specific item failed; the rest of the stream is
    /// unaffected.
    Item {
        /// Input position of the failed item.
        ordinal: usize,

        /// How the item failed.
        kind: FailureKind,

        /// Rendered error or panic message.
        message: String,
    },

    /// The input sequence itself failed mid-iteration.
    Source {
        /// Rendered panic message from the input iterator.
        message: String,
    },

    /// The operating system refused to start a worker thread.
    Spawn {
        /// Rendered spawn error.
        message: String,
    },

    /// The pool can no longer make progress and has been torn down.
    PoolFatal {
        /// Why the pool gave up.
        message: String,
    },
}

impl Error {
    /// Whether this error terminates the result stream.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Item { .. })
    }

    /// The input position of the failed item, for item-level errors.
    pub fn ordinal(&self) -> Option<usize> {
        match self {
            Error::Item { ordinal, .. } => Some(*ordinal),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Item {
                ordinal,
                kind,
                message,
            } => write!(f, "item {} failed ({}): {}", ordinal, kind, message),
            Error::Source { message } => {
                write!(f, "input sequence failed: {}", message)
            }
            Error::Spawn { message } => {
                write!(f, "failed to spawn worker: {}", message)
            }
            Error::PoolFatal { message } => {
                write!(f, "worker pool failed: {}", message)
            }
        }
    }
}

impl std::error::Error for Error {}

/// Render a join/catch_unwind panic payload as a message.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_errors_are_recoverable() {
        let err = Error::Item {
            ordinal: 4,
            kind: FailureKind::Produce,
            message: "bad input".into(),
        };
        assert!(!err.is_fatal());
        assert_eq!(err.ordinal(), Some(4));
    }

    #[test]
    fn non_item_errors_are_fatal() {
        let source = Error::Source {
            message: "exploded".into(),
        };
        let fatal = Error::PoolFatal {
            message: "respawn budget exhausted".into(),
        };
        assert!(source.is_fatal());
        assert!(fatal.is_fatal());
        assert_eq!(source.ordinal(), None);
    }

    #[test]
    fn display_includes_ordinal_and_kind() {
        let err = Error::Item {
            ordinal: 2,
            kind: FailureKind::Crashed,
            message: "oh no".into(),
        };
        assert_eq!(err.to_string(), "item 2 failed (worker crashed): oh no");
    }

    #[test]
    fn panic_payloads_render_to_text() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static str");
        assert_eq!(panic_message(payload.as_ref()), "static str");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn std::any::Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(payload.as_ref()), "worker panicked");
    }
}
