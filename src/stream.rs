//! Fan-in merger presenting all worker output as one lazy stream.
//!
//! [`RecordStream`] is the single sequence the caller iterates. Each call to
//! `next()` pumps the pool for events until something is deliverable under
//! the chosen ordering policy. In unordered mode records surface as they
//! arrive from any worker. In ordered mode records are grouped by item in
//! original input order; completed-but-not-yet-due items are buffered, and
//! workers running too far ahead (or past the per-item buffer cap) are
//! paused so a slow caller bounds memory instead of growing it.
//!
//! Item failures surface as `Err` entries exactly where that item's output
//! belongs; the stream stays consumable past them. Fatal errors tear the
//! pool down and end the stream. Dropping the stream early tears the pool
//! down too, without an error.

use crate::error::Error;
use crate::message::Record;
use crate::pool::{Event, MapConfig, Pool};
use std::collections::{BTreeMap, VecDeque};
use std::iter::FusedIterator;

/// How records from different items may interleave in the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderPolicy {
    /// Yield records in arrival order from any worker. Lowest latency and
    /// memory; items' records may interleave.
    #[default]
    Unordered,

    /// Yield records grouped by item, in original input order. Buffers
    /// ahead-of-schedule items, bounded by `max_ahead`.
    Ordered,
}

/// Buffered output of one ahead-of-schedule item (ordered mode).
struct ItemBuf<R> {
    records: VecDeque<Record<R>>,
    /// `Some(None)` once completed, `Some(Some(err))` once failed.
    outcome: Option<Option<Error>>,
}

impl<R> ItemBuf<R> {
    fn new() -> Self {
        Self {
            records: VecDeque::new(),
            outcome: None,
        }
    }
}

/// Lazy, single-pass stream of output records returned by [`map`](crate::map).
///
/// Yields `Ok` records and recoverable `Err` entries for failed items; a
/// fatal error is yielded once and ends the stream. After exhaustion the
/// stream is fused and yields `None` forever.
pub struct RecordStream<I: Iterator, R> {
    pool: Option<Pool<I, R>>,
    order: OrderPolicy,
    max_ahead: usize,
    buffer_cap: usize,
    /// Ordered mode: lowest ordinal not yet fully emitted.
    next_due: usize,
    pending: BTreeMap<usize, ItemBuf<R>>,
    ready: VecDeque<Result<Record<R>, Error>>,
    dispatched: usize,
    completed: usize,
}

impl<I: Iterator, R> RecordStream<I, R> {
    pub(crate) fn new(pool: Pool<I, R>, config: &MapConfig) -> Self {
        Self {
            pool: Some(pool),
            order: config.order,
            max_ahead: config.max_ahead,
            buffer_cap: config.outlet_capacity.max(1),
            next_due: 0,
            pending: BTreeMap::new(),
            ready: VecDeque::new(),
            dispatched: 0,
            completed: 0,
        }
    }

    /// Number of items handed to workers so far.
    pub fn items_dispatched(&self) -> usize {
        self.pool.as_ref().map_or(self.dispatched, |p| p.dispatched())
    }

    /// Number of items that have reached a terminal outcome.
    pub fn items_completed(&self) -> usize {
        self.pool.as_ref().map_or(self.completed, |p| p.completed())
    }

    fn teardown(&mut self) {
        if let Some(mut pool) = self.pool.take() {
            self.dispatched = pool.dispatched();
            self.completed = pool.completed();
            pool.shutdown();
        }
    }

    /// Move every record of due items into the ready queue, advancing the
    /// cursor through completed items.
    fn drain_due(&mut self) {
        loop {
            let Some(buf) = self.pending.get_mut(&self.next_due) else {
                break;
            };
            while let Some(record) = buf.records.pop_front() {
                self.ready.push_back(Ok(record));
            }
            match buf.outcome.take() {
                Some(outcome) => {
                    self.pending.remove(&self.next_due);
                    if let Some(err) = outcome {
                        self.ready.push_back(Err(err));
                    }
                    self.next_due += 1;
                }
                // still in flight; its remaining records arrive live
                None => break,
            }
        }
    }

    /// Flush whatever is still buffered, in ordinal order.
    fn flush_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for (_, mut buf) in pending {
            while let Some(record) = buf.records.pop_front() {
                self.ready.push_back(Ok(record));
            }
            if let Some(Some(err)) = buf.outcome.take() {
                self.ready.push_back(Err(err));
            }
        }
    }
}

impl<I: Iterator, R> Iterator for RecordStream<I, R> {
    type Item = Result<Record<R>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.order == OrderPolicy::Ordered {
                self.drain_due();
            }
            if let Some(out) = self.ready.pop_front() {
                return Some(out);
            }
            let Some(pool) = self.pool.as_mut() else {
                return None;
            };

            let event = match self.order {
                OrderPolicy::Unordered => pool.poll(|_| true),
                OrderPolicy::Ordered => {
                    let next_due = self.next_due;
                    let max_ahead = self.max_ahead;
                    let cap = self.buffer_cap;
                    let pending = &self.pending;
                    pool.poll(move |ordinal| {
                        ordinal == next_due
                            || (ordinal <= next_due + max_ahead
                                && pending.get(&ordinal).map_or(0, |buf| buf.records.len())
                                    < cap)
                    })
                }
            };

            match self.order {
                OrderPolicy::Unordered => match event {
                    Event::Record(record) => return Some(Ok(record)),
                    Event::ItemDone { .. } => continue,
                    Event::ItemFailed {
                        ordinal,
                        kind,
                        message,
                    } => {
                        return Some(Err(Error::Item {
                            ordinal,
                            kind,
                            message,
                        }));
                    }
                    Event::Fatal(err) => {
                        tracing::error!(%err, "fatal error; terminating result stream");
                        self.teardown();
                        return Some(Err(err));
                    }
                    Event::Drained => {
                        self.teardown();
                        return None;
                    }
                },
                OrderPolicy::Ordered => match event {
                    Event::Record(record) => {
                        if record.ordinal == self.next_due {
                            return Some(Ok(record));
                        }
                        self.pending
                            .entry(record.ordinal)
                            .or_insert_with(ItemBuf::new)
                            .records
                            .push_back(record);
                    }
                    Event::ItemDone { ordinal } => {
                        if ordinal == self.next_due {
                            self.pending.remove(&ordinal);
                            self.next_due += 1;
                        } else {
                            self.pending
                                .entry(ordinal)
                                .or_insert_with(ItemBuf::new)
                                .outcome = Some(None);
                        }
                    }
                    Event::ItemFailed {
                        ordinal,
                        kind,
                        message,
                    } => {
                        let err = Error::Item {
                            ordinal,
                            kind,
                            message,
                        };
                        if ordinal == self.next_due {
                            self.pending.remove(&ordinal);
                            self.next_due += 1;
                            return Some(Err(err));
                        }
                        self.pending
                            .entry(ordinal)
                            .or_insert_with(ItemBuf::new)
                            .outcome = Some(Some(err));
                    }
                    Event::Fatal(err) => {
                        tracing::error!(%err, "fatal error; terminating result stream");
                        self.teardown();
                        return Some(Err(err));
                    }
                    Event::Drained => {
                        self.flush_pending();
                        self.teardown();
                        if let Some(out) = self.ready.pop_front() {
                            return Some(out);
                        }
                        return None;
                    }
                },
            }
        }
    }
}

impl<I: Iterator, R> FusedIterator for RecordStream<I, R> {}

impl<I: Iterator, R> Drop for RecordStream<I, R> {
    fn drop(&mut self) {
        self.teardown();
    }
}
