//! Item source: ordinal-tagging wrapper over the caller's input iterator.
//!
//! The source stays on the caller's thread; only the items it hands out cross
//! into worker threads. A panic in the underlying iterator is surfaced as a
//! fatal [`Error::Source`] rather than a silent truncation of the input.

use crate::error::{Error, Result, panic_message};
use crate::message::Assignment;
use std::panic::{AssertUnwindSafe, catch_unwind};

pub(crate) struct ItemSource<I> {
    inner: I,
    next_ordinal: usize,
    done: bool,
}

impl<I: Iterator> ItemSource<I> {
    pub(crate) fn new(inner: I) -> Self {
        Self {
            inner,
            next_ordinal: 0,
            done: false,
        }
    }

    /// Upper bound on the number of items, when the iterator knows one.
    pub(crate) fn upper_bound(&self) -> Option<usize> {
        self.inner.size_hint().1
    }

    /// Number of items handed out so far.
    pub(crate) fn dispatched(&self) -> usize {
        self.next_ordinal
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.done
    }

    /// Pull the next item, tagged with its ordinal.
    ///
    /// Fuses on exhaustion and after an upstream panic; once `Ok(None)` or
    /// `Err(_)` has been returned, every later call returns `Ok(None)`.
    pub(crate) fn next_assignment(&mut self) -> Result<Option<Assignment<I::Item>>> {
        if self.done {
            return Ok(None);
        }
        match catch_unwind(AssertUnwindSafe(|| self.inner.next())) {
            Ok(Some(item)) => {
                let ordinal = self.next_ordinal;
                self.next_ordinal += 1;
                Ok(Some(Assignment { ordinal, item }))
            }
            Ok(None) => {
                self.done = true;
                Ok(None)
            }
            Err(payload) => {
                self.done = true;
                Err(Error::Source {
                    message: panic_message(payload.as_ref()),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_sequential_ordinals() {
        let mut source = ItemSource::new(vec!["a", "b", "c"].into_iter());
        let first = source.next_assignment().unwrap().unwrap();
        let second = source.next_assignment().unwrap().unwrap();
        assert_eq!((first.ordinal, first.item), (0, "a"));
        assert_eq!((second.ordinal, second.item), (1, "b"));
        assert_eq!(source.dispatched(), 2);
    }

    #[test]
    fn fuses_after_exhaustion() {
        let mut source = ItemSource::new(std::iter::once(1));
        assert!(source.next_assignment().unwrap().is_some());
        assert!(source.next_assignment().unwrap().is_none());
        assert!(source.is_exhausted());
        assert!(source.next_assignment().unwrap().is_none());
    }

    #[test]
    fn reports_known_upper_bound() {
        let source = ItemSource::new(0..5);
        assert_eq!(source.upper_bound(), Some(5));
    }

    #[test]
    fn upstream_panic_becomes_source_error() {
        let mut n = 0;
        let iter = std::iter::from_fn(move || {
            n += 1;
            if n > 2 {
                panic!("iterator exploded");
            }
            Some(n)
        });
        let mut source = ItemSource::new(iter);
        assert!(source.next_assignment().unwrap().is_some());
        assert!(source.next_assignment().unwrap().is_some());

        let err = source.next_assignment().unwrap_err();
        match err {
            Error::Source { message } => assert!(message.contains("iterator exploded")),
            other => panic!("expected a source error, got {other:?}"),
        }

        // fused after the failure
        assert!(source.next_assignment().unwrap().is_none());
    }
}
