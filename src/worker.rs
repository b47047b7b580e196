//! Worker threads: isolated execution of the user's per-item producer.
//!
//! Each worker owns its clone of the user function and two channel endpoints,
//! and shares no mutable state with any other component. For every item it
//! receives, it drives the producer lazily and forwards each record the
//! moment it is yielded, so large per-item outputs start streaming before the
//! item finishes and are never buffered whole inside the worker. The item
//! ends with exactly one terminal marker: `EndOfItem` or `Failed`.
//!
//! A producer error fails the item but leaves the worker alive for the next
//! one. A producer panic unwinds the thread; the dispatcher detects that via
//! the output channel disconnecting, never via worker self-reporting.

use crate::error::{Error, FailureKind, Result};
use crate::message::{Assignment, FailureDetail, Record, Report};
use crossbeam::channel::{Receiver, Sender};
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

/// Unique identifier for a worker.
pub(crate) type WorkerId = u64;

/// Global worker ID counter.
static WORKER_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Everything the pool hands a new worker thread.
pub(crate) struct WorkerSeat<T, R> {
    /// Channel the dispatcher sends assignments on; disconnect means
    /// shutdown.
    pub intake: Receiver<Assignment<T>>,

    /// Bounded channel the worker reports on.
    pub outlet: Sender<Report<R>>,

    /// Pool-wide teardown flag, checked between records.
    pub shutdown: Arc<AtomicBool>,

    /// Core to pin this worker to, if affinity is enabled.
    pub core: Option<core_affinity::CoreId>,
}

/// Factory that places one worker thread, erasing the user function's
/// generics so the pool can respawn replacements after a crash.
pub(crate) type WorkerSpawner<T, R> =
    Box<dyn FnMut(WorkerSeat<T, R>) -> Result<(WorkerId, JoinHandle<()>)>>;

/// Build a spawner around the user's producer function.
///
/// Every worker gets its own clone of `produce`.
pub(crate) fn spawner<T, R, F, O, E>(produce: F) -> WorkerSpawner<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: FnMut(T) -> O + Clone + Send + 'static,
    O: IntoIterator<Item = std::result::Result<R, E>>,
    E: Display,
{
    Box::new(move |seat| spawn_worker(produce.clone(), seat))
}

fn spawn_worker<T, R, F, O, E>(
    produce: F,
    seat: WorkerSeat<T, R>,
) -> Result<(WorkerId, JoinHandle<()>)>
where
    T: Send + 'static,
    R: Send + 'static,
    F: FnMut(T) -> O + Send + 'static,
    O: IntoIterator<Item = std::result::Result<R, E>>,
    E: Display,
{
    let id = WORKER_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let handle = std::thread::Builder::new()
        .name(format!("scatter-worker-{}", id))
        .spawn(move || {
            if let Some(core) = seat.core {
                core_affinity::set_for_current(core);
            }
            run_worker(id, produce, seat.intake, seat.outlet, seat.shutdown);
        })
        .map_err(|e| Error::Spawn {
            message: e.to_string(),
        })?;
    Ok((id, handle))
}

fn run_worker<T, R, F, O, E>(
    id: WorkerId,
    mut produce: F,
    intake: Receiver<Assignment<T>>,
    outlet: Sender<Report<R>>,
    shutdown: Arc<AtomicBool>,
) where
    F: FnMut(T) -> O,
    O: IntoIterator<Item = std::result::Result<R, E>>,
    E: Display,
{
    tracing::debug!(worker = id, "starting up");

    while let Ok(Assignment { ordinal, item }) = intake.recv() {
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        let started = Instant::now();
        let mut seq = 0;
        let mut failure = None;

        for produced in produce(item) {
            match produced {
                Ok(value) => {
                    // a failed send means the merger is gone; nothing left to do
                    if outlet
                        .send(Report::Record(Record::new(ordinal, seq, value)))
                        .is_err()
                    {
                        return;
                    }
                    seq += 1;
                }
                Err(e) => {
                    failure = Some(FailureDetail::new(FailureKind::Produce, e.to_string()));
                    break;
                }
            }
            // teardown stops between records, never mid-record
            if shutdown.load(Ordering::Acquire) {
                return;
            }
        }

        let report = match failure {
            Some(detail) => {
                tracing::warn!(worker = id, ordinal, error = %detail.message, "producer failed");
                Report::Failed { ordinal, detail }
            }
            None => Report::EndOfItem { ordinal },
        };
        if outlet.send(report).is_err() {
            return;
        }

        tracing::debug!(
            worker = id,
            ordinal,
            records = seq,
            elapsed_us = started.elapsed().as_micros() as u64,
            "item finished"
        );
    }

    tracing::debug!(worker = id, "no more items to process");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;

    fn seat<T, R>(
        intake: Receiver<Assignment<T>>,
        outlet: Sender<Report<R>>,
    ) -> WorkerSeat<T, R> {
        WorkerSeat {
            intake,
            outlet,
            shutdown: Arc::new(AtomicBool::new(false)),
            core: None,
        }
    }

    #[test]
    fn forwards_records_then_end_marker() {
        let (intake_tx, intake_rx) = bounded(4);
        let (outlet_tx, outlet_rx) = bounded(16);
        let produce = |n: u32| -> Vec<std::result::Result<u32, String>> {
            (0..n).map(Ok).collect()
        };

        let (_, join) = spawn_worker(produce, seat(intake_rx, outlet_tx)).unwrap();
        intake_tx.send(Assignment { ordinal: 0, item: 3 }).unwrap();
        drop(intake_tx);

        let reports: Vec<_> = outlet_rx.iter().collect();
        join.join().unwrap();

        assert_eq!(reports.len(), 4);
        for (seq, report) in reports.iter().take(3).enumerate() {
            match report {
                Report::Record(r) => {
                    assert_eq!(r.ordinal, 0);
                    assert_eq!(r.seq, seq);
                    assert_eq!(r.value, seq as u32);
                }
                other => panic!("expected a record, got {other:?}"),
            }
        }
        assert!(matches!(reports[3], Report::EndOfItem { ordinal: 0 }));
    }

    #[test]
    fn producer_error_fails_item_but_worker_survives() {
        let (intake_tx, intake_rx) = bounded(4);
        let (outlet_tx, outlet_rx) = bounded(16);
        let produce = |n: u32| -> Vec<std::result::Result<u32, String>> {
            if n == 0 {
                vec![Err("boom".to_string())]
            } else {
                vec![Ok(n)]
            }
        };

        let (_, join) = spawn_worker(produce, seat(intake_rx, outlet_tx)).unwrap();
        intake_tx.send(Assignment { ordinal: 0, item: 0 }).unwrap();
        intake_tx.send(Assignment { ordinal: 1, item: 7 }).unwrap();
        drop(intake_tx);

        let reports: Vec<_> = outlet_rx.iter().collect();
        join.join().unwrap();

        assert_eq!(reports.len(), 3);
        match &reports[0] {
            Report::Failed { ordinal, detail } => {
                assert_eq!(*ordinal, 0);
                assert_eq!(detail.kind, FailureKind::Produce);
                assert_eq!(detail.message, "boom");
            }
            other => panic!("expected a failure, got {other:?}"),
        }
        assert!(matches!(&reports[1], Report::Record(r) if r.ordinal == 1 && r.value == 7));
        assert!(matches!(reports[2], Report::EndOfItem { ordinal: 1 }));
    }

    #[test]
    fn zero_record_items_still_get_an_end_marker() {
        let (intake_tx, intake_rx) = bounded(4);
        let (outlet_tx, outlet_rx) = bounded(16);
        let produce = |_: u32| -> Vec<std::result::Result<u32, String>> { Vec::new() };

        let (_, join) = spawn_worker(produce, seat(intake_rx, outlet_tx)).unwrap();
        intake_tx.send(Assignment { ordinal: 5, item: 1 }).unwrap();
        drop(intake_tx);

        let reports: Vec<_> = outlet_rx.iter().collect();
        join.join().unwrap();

        assert_eq!(reports.len(), 1);
        assert!(matches!(reports[0], Report::EndOfItem { ordinal: 5 }));
    }
}
