//! Message types exchanged between the dispatcher, workers, and merger.
//!
//! Only [`Record`] is part of the public contract; the assignment and report
//! types are internal wire detail between the caller's thread and the worker
//! threads.

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

use crate::error::FailureKind;

/// One unit of output, attributed to the input item that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct Record<R> {
    /// 0-based position of the originating item in the input sequence.
    pub ordinal: usize,

    /// 0-based position of this record within its item's output.
    pub seq: usize,

    /// The value produced.
    pub value: R,
}

impl<R> Record<R> {
    /// Create a new record.
    pub fn new(ordinal: usize, seq: usize, value: R) -> Self {
        Self {
            ordinal,
            seq,
            value,
        }
    }
}

/// One item of work handed to a worker.
#[derive(Debug)]
pub(crate) struct Assignment<T> {
    /// 0-based position of the item in the input sequence.
    pub ordinal: usize,

    /// The item payload.
    pub item: T,
}

/// Typed failure payload that crosses the worker boundary.
#[derive(Debug, Clone)]
pub(crate) struct FailureDetail {
    /// How the item failed.
    pub kind: FailureKind,

    /// Rendered error or panic message.
    pub message: String,
}

impl FailureDetail {
    pub(crate) fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Everything a worker sends back on its output channel.
///
/// Per item, a worker sends zero or more `Record` reports followed by exactly
/// one terminal marker: `EndOfItem` or `Failed`, never both.
#[derive(Debug)]
pub(crate) enum Report<R> {
    /// One output record.
    Record(Record<R>),

    /// The item's producer ran to completion.
    EndOfItem { ordinal: usize },

    /// The item's producer yielded an error.
    Failed {
        ordinal: usize,
        detail: FailureDetail,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_carries_attribution() {
        let record = Record::new(3, 1, "value");
        assert_eq!(record.ordinal, 3);
        assert_eq!(record.seq, 1);
        assert_eq!(record.value, "value");
    }

    #[test]
    fn failure_detail_accepts_str_and_string() {
        let a = FailureDetail::new(FailureKind::Produce, "boom");
        let b = FailureDetail::new(FailureKind::Crashed, String::from("gone"));
        assert_eq!(a.message, "boom");
        assert_eq!(b.message, "gone");
    }
}
