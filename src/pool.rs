//! Dispatcher and lifecycle management for the worker pool.
//!
//! The pool owns the worker slots, the item source, and the dispatch
//! bookkeeping. It hands each idle worker exactly one item at a time,
//! watches every worker's output channel for reports, and classifies an
//! output channel disconnecting while an item is in flight as a worker
//! crash: the in-flight item is converted into an item error (never silently
//! dropped) and a replacement worker is spawned within the configured
//! respawn budget.
//!
//! The merger never touches any of this state; it only chooses which output
//! channels the pool may read from on a given wait, which is how ordered-mode
//! backpressure stays out of the dispatcher.

use crate::error::{Error, FailureKind, Result, panic_message};
use crate::message::{Assignment, Record, Report};
use crate::source::ItemSource;
use crate::stream::OrderPolicy;
use crate::worker::{WorkerId, WorkerSeat, WorkerSpawner};
use crossbeam::channel::{Receiver, Select, Sender, TryRecvError, bounded};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// What the dispatcher does when a worker thread dies mid-item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPolicy {
    /// Spawn a replacement, up to `budget` replacements over the pool's
    /// lifetime. `None` resolves to the worker count at start. Exhausting
    /// the budget is a fatal pool error.
    Respawn {
        /// Maximum number of replacements; `None` means one per starting
        /// worker.
        budget: Option<usize>,
    },

    /// Keep going with one worker fewer. Losing the last worker while items
    /// remain is a fatal pool error.
    Shrink,
}

/// Configuration for [`map`](crate::map).
#[derive(Debug, Clone)]
pub struct MapConfig {
    /// Number of worker threads. Zero is treated as one; the count is
    /// clamped down to the input's known size when it has one.
    pub num_workers: usize,

    /// How records from different items may interleave in the output.
    pub order: OrderPolicy,

    /// Ordered mode only: maximum number of items buffered ahead of the next
    /// due ordinal before their workers are paused.
    pub max_ahead: usize,

    /// Capacity of each worker's bounded output channel; also the per-item
    /// cap on merger-side buffered records for an ahead item.
    pub outlet_capacity: usize,

    /// Deadline for a single item. An over-budget item's worker is abandoned
    /// and replaced, the same remediation as a crash.
    pub per_item_timeout: Option<Duration>,

    /// What to do when a worker thread dies mid-item.
    pub crash_policy: CrashPolicy,

    /// How long teardown waits for workers to exit before detaching them.
    pub shutdown_grace: Duration,

    /// Pin workers to cores, round-robin.
    pub enable_cpu_affinity: bool,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            order: OrderPolicy::Unordered,
            max_ahead: 8,
            outlet_capacity: 64,
            per_item_timeout: None,
            crash_policy: CrashPolicy::Respawn { budget: None },
            shutdown_grace: Duration::from_secs(1),
            enable_cpu_affinity: false,
        }
    }
}

impl MapConfig {
    /// Create a configuration with the default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    pub fn with_num_workers(mut self, num: usize) -> Self {
        self.num_workers = num;
        self
    }

    /// Set the ordering policy.
    pub fn with_order(mut self, order: OrderPolicy) -> Self {
        self.order = order;
        self
    }

    /// Set the ordered-mode look-ahead bound.
    pub fn with_max_ahead(mut self, max_ahead: usize) -> Self {
        self.max_ahead = max_ahead;
        self
    }

    /// Set the per-worker output channel capacity.
    pub fn with_outlet_capacity(mut self, capacity: usize) -> Self {
        self.outlet_capacity = capacity;
        self
    }

    /// Set a deadline for processing a single item.
    pub fn with_per_item_timeout(mut self, timeout: Duration) -> Self {
        self.per_item_timeout = Some(timeout);
        self
    }

    /// Set the crash policy.
    pub fn with_crash_policy(mut self, policy: CrashPolicy) -> Self {
        self.crash_policy = policy;
        self
    }

    /// Set the teardown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Enable CPU affinity pinning.
    pub fn with_cpu_affinity(mut self, enable: bool) -> Self {
        self.enable_cpu_affinity = enable;
        self
    }
}

/// Resolve the effective worker count: at least one, and no more workers
/// than the input can possibly have items.
fn resolved_workers(requested: usize, upper_bound: Option<usize>) -> usize {
    let requested = requested.max(1);
    match upper_bound {
        Some(n) => requested.min(n.max(1)),
        None => requested,
    }
}

enum SlotState {
    Idle,
    Busy { ordinal: usize, since: Instant },
    Draining,
}

/// One worker seat owned by the dispatcher.
struct Slot<T, R> {
    id: WorkerId,
    intake: Option<Sender<Assignment<T>>>,
    outlet: Option<Receiver<Report<R>>>,
    join: Option<thread::JoinHandle<()>>,
    state: SlotState,
}

/// What the merger observes on each wait.
pub(crate) enum Event<R> {
    /// One output record arrived.
    Record(Record<R>),

    /// An item finished cleanly; all of its records have been delivered.
    ItemDone { ordinal: usize },

    /// An item failed; carries the taxonomy for the resulting item error.
    ItemFailed {
        ordinal: usize,
        kind: FailureKind,
        message: String,
    },

    /// The pool can no longer make progress; teardown has already run.
    Fatal(Error),

    /// Every item has been dispatched, finished, and reported.
    Drained,
}

pub(crate) struct Pool<I: Iterator, R> {
    source: ItemSource<I>,
    slots: Vec<Slot<I::Item, R>>,
    spawner: WorkerSpawner<I::Item, R>,
    shutdown_flag: Arc<AtomicBool>,
    deferred: VecDeque<Event<R>>,
    pending_fatal: Option<Error>,
    outlet_capacity: usize,
    per_item_timeout: Option<Duration>,
    /// Remaining respawns; `None` means the shrink policy.
    respawn: Option<usize>,
    shutdown_grace: Duration,
    cores: Vec<core_affinity::CoreId>,
    next_core: usize,
    completed: usize,
    terminated: bool,
}

impl<I: Iterator, R> Pool<I, R> {
    /// Start the pool: spawn every worker, then hand each one its first item.
    pub(crate) fn start(
        source: ItemSource<I>,
        spawner: WorkerSpawner<I::Item, R>,
        config: &MapConfig,
    ) -> Result<Self> {
        let workers = resolved_workers(config.num_workers, source.upper_bound());
        let cores = if config.enable_cpu_affinity {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut pool = Self {
            source,
            slots: Vec::with_capacity(workers),
            spawner,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            deferred: VecDeque::new(),
            pending_fatal: None,
            outlet_capacity: config.outlet_capacity.max(1),
            per_item_timeout: config.per_item_timeout,
            respawn: match config.crash_policy {
                CrashPolicy::Respawn { budget } => Some(budget.unwrap_or(workers)),
                CrashPolicy::Shrink => None,
            },
            shutdown_grace: config.shutdown_grace,
            cores,
            next_core: 0,
            completed: 0,
            terminated: false,
        };

        for _ in 0..workers {
            pool.spawn_slot()?;
        }
        tracing::debug!(workers, "pool started");

        for i in 0..pool.slots.len() {
            if matches!(pool.slots[i].state, SlotState::Idle) {
                pool.dispatch_to(i);
            }
        }
        Ok(pool)
    }

    /// Number of items handed to workers so far.
    pub(crate) fn dispatched(&self) -> usize {
        self.source.dispatched()
    }

    /// Number of items that reached a terminal outcome.
    pub(crate) fn completed(&self) -> usize {
        self.completed
    }

    fn spawn_slot(&mut self) -> Result<()> {
        let (intake_tx, intake_rx) = bounded(1);
        let (outlet_tx, outlet_rx) = bounded(self.outlet_capacity);
        let core = if self.cores.is_empty() {
            None
        } else {
            let core = self.cores[self.next_core % self.cores.len()];
            self.next_core += 1;
            Some(core)
        };
        let seat = WorkerSeat {
            intake: intake_rx,
            outlet: outlet_tx,
            shutdown: Arc::clone(&self.shutdown_flag),
            core,
        };
        let (id, join) = (self.spawner)(seat)?;
        self.slots.push(Slot {
            id,
            intake: Some(intake_tx),
            outlet: Some(outlet_rx),
            join: Some(join),
            state: SlotState::Idle,
        });
        Ok(())
    }

    /// Hand the next item to an idle worker; `assignNext` in spirit.
    ///
    /// When the source is exhausted the slot's intake channel is dropped,
    /// which is the worker's signal to exit once its current work is done.
    fn dispatch_to(&mut self, index: usize) {
        match self.source.next_assignment() {
            Ok(Some(assignment)) => {
                let ordinal = assignment.ordinal;
                let since = Instant::now();
                let slot = &mut self.slots[index];
                let delivered = match slot.intake.as_ref() {
                    Some(tx) => tx.send(assignment).is_ok(),
                    None => false,
                };
                if delivered {
                    slot.state = SlotState::Busy { ordinal, since };
                } else {
                    // the worker died while idle; the item must not vanish
                    slot.intake = None;
                    slot.state = SlotState::Draining;
                    self.completed += 1;
                    self.deferred.push_back(Event::ItemFailed {
                        ordinal,
                        kind: FailureKind::Crashed,
                        message: "worker exited before accepting its assignment".into(),
                    });
                }
            }
            Ok(None) => {
                let slot = &mut self.slots[index];
                slot.intake = None;
                slot.state = SlotState::Draining;
            }
            Err(err) => {
                if self.pending_fatal.is_none() {
                    self.pending_fatal = Some(err);
                }
                let slot = &mut self.slots[index];
                slot.intake = None;
                slot.state = SlotState::Draining;
            }
        }
    }

    /// Wait for the next pool event, reading only from workers whose current
    /// item the merger allows.
    ///
    /// Idle and draining workers are always read so their exits are observed.
    /// The merger guarantees the filter never pauses the next-due item, so a
    /// busy pool always has at least one pollable worker.
    pub(crate) fn poll<A>(&mut self, allow: A) -> Event<R>
    where
        A: Fn(usize) -> bool,
    {
        loop {
            if let Some(event) = self.deferred.pop_front() {
                return event;
            }
            if let Some(err) = self.pending_fatal.take() {
                self.shutdown();
                return Event::Fatal(err);
            }
            if self.slots.is_empty() {
                if self.source.is_exhausted() || self.terminated {
                    return Event::Drained;
                }
                self.pending_fatal = Some(Error::PoolFatal {
                    message: "all workers lost with items remaining".into(),
                });
                continue;
            }

            // per-item deadline scan
            let mut deadline: Option<Instant> = None;
            let mut expired = None;
            if let Some(limit) = self.per_item_timeout {
                let now = Instant::now();
                for (i, slot) in self.slots.iter().enumerate() {
                    if let SlotState::Busy { since, .. } = slot.state {
                        let due = since + limit;
                        if due <= now {
                            expired = Some(i);
                            break;
                        }
                        deadline = Some(deadline.map_or(due, |d: Instant| d.min(due)));
                    }
                }
            }
            if let Some(index) = expired {
                self.abandon(index);
                continue;
            }

            let ready_slot = {
                let mut sel = Select::new();
                let mut indices = Vec::with_capacity(self.slots.len());
                for (i, slot) in self.slots.iter().enumerate() {
                    let listen = match slot.state {
                        SlotState::Busy { ordinal, .. } => allow(ordinal),
                        SlotState::Idle | SlotState::Draining => true,
                    };
                    if listen {
                        if let Some(outlet) = slot.outlet.as_ref() {
                            sel.recv(outlet);
                            indices.push(i);
                        }
                    }
                }
                if indices.is_empty() {
                    // every worker is paused by the merger; only a deadline
                    // can change that
                    match deadline {
                        Some(due) => {
                            thread::sleep(due.saturating_duration_since(Instant::now()));
                            continue;
                        }
                        None => {
                            self.pending_fatal = Some(Error::PoolFatal {
                                message: "dispatcher stalled with no pollable workers".into(),
                            });
                            continue;
                        }
                    }
                }
                match deadline {
                    Some(due) => match sel.ready_deadline(due) {
                        Ok(ready) => indices[ready],
                        Err(_) => continue,
                    },
                    None => indices[sel.ready()],
                }
            };

            let report = match self.slots[ready_slot].outlet.as_ref() {
                Some(outlet) => outlet.try_recv(),
                None => Err(TryRecvError::Disconnected),
            };
            match report {
                Ok(Report::Record(record)) => return Event::Record(record),
                Ok(Report::EndOfItem { ordinal }) => {
                    self.completed += 1;
                    self.slots[ready_slot].state = SlotState::Idle;
                    self.dispatch_to(ready_slot);
                    return Event::ItemDone { ordinal };
                }
                Ok(Report::Failed { ordinal, detail }) => {
                    self.completed += 1;
                    self.slots[ready_slot].state = SlotState::Idle;
                    self.dispatch_to(ready_slot);
                    return Event::ItemFailed {
                        ordinal,
                        kind: detail.kind,
                        message: detail.message,
                    };
                }
                Err(TryRecvError::Empty) => continue,
                Err(TryRecvError::Disconnected) => {
                    self.reap(ready_slot);
                    continue;
                }
            }
        }
    }

    /// A worker's output channel disconnected: either it drained out
    /// normally or it crashed mid-item.
    fn reap(&mut self, index: usize) {
        let mut slot = self.slots.remove(index);
        slot.intake = None;
        slot.outlet = None;
        let panic_msg = slot
            .join
            .take()
            .and_then(|join| join.join().err().map(|p| panic_message(p.as_ref())));

        match slot.state {
            SlotState::Busy { ordinal, .. } => {
                let message =
                    panic_msg.unwrap_or_else(|| "worker thread exited unexpectedly".to_string());
                tracing::warn!(worker = slot.id, ordinal, %message, "worker died mid-item");
                self.completed += 1;
                self.deferred.push_back(Event::ItemFailed {
                    ordinal,
                    kind: FailureKind::Crashed,
                    message,
                });
                self.replace_lost_worker();
            }
            SlotState::Draining => {
                tracing::debug!(worker = slot.id, "worker drained");
            }
            SlotState::Idle => {
                tracing::warn!(worker = slot.id, "worker exited while idle");
                self.replace_lost_worker();
            }
        }
    }

    /// Give up on a worker stuck past the per-item deadline.
    ///
    /// Threads cannot be killed, so the slot's channel ends are dropped (the
    /// thread exits at its next send) and its handle is detached; the item
    /// gets a timeout error and the worker is replaced like a crash.
    fn abandon(&mut self, index: usize) {
        let mut slot = self.slots.remove(index);
        let SlotState::Busy { ordinal, .. } = slot.state else {
            return;
        };
        slot.intake = None;
        slot.outlet = None;
        if let Some(join) = slot.join.take() {
            if join.is_finished() {
                let _ = join.join();
            } else {
                tracing::warn!(
                    worker = slot.id,
                    ordinal,
                    "abandoning worker stuck past the per-item deadline"
                );
            }
        }
        self.completed += 1;
        self.deferred.push_back(Event::ItemFailed {
            ordinal,
            kind: FailureKind::TimedOut,
            message: format!("item {} exceeded the per-item deadline", ordinal),
        });
        self.replace_lost_worker();
    }

    fn replace_lost_worker(&mut self) {
        match self.respawn {
            Some(left) if left > 0 => {
                self.respawn = Some(left - 1);
                match self.spawn_slot() {
                    Ok(()) => {
                        tracing::debug!(budget_left = left - 1, "spawned replacement worker");
                        let index = self.slots.len() - 1;
                        self.dispatch_to(index);
                    }
                    Err(err) => {
                        if self.pending_fatal.is_none() {
                            self.pending_fatal = Some(Error::PoolFatal {
                                message: format!("failed to spawn replacement worker: {}", err),
                            });
                        }
                    }
                }
            }
            Some(_) => {
                if self.pending_fatal.is_none() {
                    self.pending_fatal = Some(Error::PoolFatal {
                        message: "worker respawn budget exhausted".into(),
                    });
                }
            }
            None => {
                tracing::warn!(remaining = self.slots.len(), "pool shrank after worker loss");
            }
        }
    }

    /// Tear the pool down: signal shutdown, close every channel, then join
    /// each worker within the grace period, detaching any that stay stuck in
    /// user code. Idempotent; runs on exhaustion, fatal errors, and drop.
    pub(crate) fn shutdown(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.shutdown_flag.store(true, Ordering::Release);

        for slot in &mut self.slots {
            slot.intake = None;
            slot.outlet = None;
        }

        let deadline = Instant::now() + self.shutdown_grace;
        for mut slot in self.slots.drain(..) {
            let Some(join) = slot.join.take() else {
                continue;
            };
            while !join.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            if join.is_finished() {
                let _ = join.join();
            } else {
                tracing::warn!(
                    worker = slot.id,
                    "worker unresponsive past the grace period; detaching"
                );
            }
        }
        tracing::debug!(
            dispatched = self.source.dispatched(),
            completed = self.completed,
            "pool shut down"
        );
    }
}

impl<I: Iterator, R> Drop for Pool<I, R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_are_conservative() {
        let config = MapConfig::default();
        assert!(config.num_workers >= 1);
        assert_eq!(config.order, OrderPolicy::Unordered);
        assert_eq!(config.max_ahead, 8);
        assert_eq!(config.outlet_capacity, 64);
        assert_eq!(config.per_item_timeout, None);
        assert_eq!(config.crash_policy, CrashPolicy::Respawn { budget: None });
        assert_eq!(config.shutdown_grace, Duration::from_secs(1));
        assert!(!config.enable_cpu_affinity);
    }

    #[test]
    fn config_builders_chain() {
        let config = MapConfig::new()
            .with_num_workers(3)
            .with_order(OrderPolicy::Ordered)
            .with_max_ahead(2)
            .with_outlet_capacity(16)
            .with_per_item_timeout(Duration::from_millis(250))
            .with_crash_policy(CrashPolicy::Shrink)
            .with_shutdown_grace(Duration::from_millis(100))
            .with_cpu_affinity(true);

        assert_eq!(config.num_workers, 3);
        assert_eq!(config.order, OrderPolicy::Ordered);
        assert_eq!(config.max_ahead, 2);
        assert_eq!(config.outlet_capacity, 16);
        assert_eq!(config.per_item_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.crash_policy, CrashPolicy::Shrink);
        assert_eq!(config.shutdown_grace, Duration::from_millis(100));
        assert!(config.enable_cpu_affinity);
    }

    #[test]
    fn worker_count_never_zero_and_clamped_to_input() {
        assert_eq!(resolved_workers(0, None), 1);
        assert_eq!(resolved_workers(8, None), 8);
        assert_eq!(resolved_workers(8, Some(3)), 3);
        assert_eq!(resolved_workers(8, Some(0)), 1);
        assert_eq!(resolved_workers(2, Some(100)), 2);
    }
}
