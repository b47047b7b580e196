//! # Scatter
//!
//! Distributes CPU-bound, per-item work across a fixed pool of isolated
//! worker threads and streams the merged output back to the caller as one
//! lazy sequence.
//!
//! ## Key Features
//!
//! - **Shared-nothing workers**: each worker owns its clone of the user
//!   function; all coordination is message passing, never shared memory
//! - **Streaming producers**: one item may expand into zero or more records,
//!   forwarded the moment they are produced, never buffered whole
//! - **Bounded memory**: bounded channels everywhere; ordered mode pauses
//!   workers that run too far ahead of the caller
//! - **Two ordering policies**: arrival order for latency, or strict input
//!   order with bounded reordering
//! - **Failure containment**: a failed item costs one error entry, a crashed
//!   worker is replaced within a budget, and nothing is ever silently lost
//! - **CPU affinity**: optional pinning of workers to specific cores
//!
//! ## Architecture
//!
//! ```text
//!             ┌────────────┐   items    ┌─────────────┐
//!  caller ──> │ Dispatcher │ ─────────> │  Worker 1   │ ──┐
//!  iterator   │  (ordinal  │ ─────────> │  Worker 2   │ ──┤  (ordinal,
//!             │   tagging) │ ─────────> │   ...       │ ──┤   record)
//!             └────────────┘            └─────────────┘   │
//!                                                         ▼
//!             ┌────────────────────────────────────────────┐
//!  caller <── │ Merger: fan-in, ordering, backpressure     │
//!  stream     └────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use scatter::{map, MapConfig};
//!
//! let stream = map(
//!     vec!["the quick fox", "jumps"],
//!     |line: &str| {
//!         line.split_whitespace()
//!             .map(|word| Ok::<_, String>(word.to_string()))
//!             .collect::<Vec<_>>()
//!     },
//!     MapConfig::new().with_num_workers(2),
//! )
//! .unwrap();
//!
//! let mut words: Vec<String> = stream.map(|entry| entry.unwrap().value).collect();
//! words.sort();
//! assert_eq!(words, ["fox", "jumps", "quick", "the"]);
//! ```

#![warn(missing_docs, rust_2018_idioms)]

pub mod error;
pub mod message;
pub mod pool;
pub mod stream;

mod source;
mod worker;

// Re-exports
pub use error::{Error, FailureKind, Result};
pub use message::Record;
pub use pool::{CrashPolicy, MapConfig};
pub use stream::{OrderPolicy, RecordStream};

use source::ItemSource;
use std::fmt::Display;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::error::{Error, FailureKind, Result};
    pub use crate::map;
    pub use crate::message::Record;
    pub use crate::pool::{CrashPolicy, MapConfig};
    pub use crate::stream::{OrderPolicy, RecordStream};
}

/// Distribute per-item work over a pool of worker threads, returning the
/// merged output as one lazy stream.
///
/// `produce` is invoked once per item, on a worker thread, with each worker
/// holding its own clone. It returns a lazily-consumed sequence of
/// `Result<R, E>` records: every `Ok` becomes an output [`Record`], an `Err`
/// ends that item with a recoverable item error, and a panic counts as a
/// worker crash. Items are consumed from `items` exactly once, in a single
/// pass, on the caller's thread.
///
/// The returned [`RecordStream`] yields `Ok(Record)` and recoverable
/// `Err(Error::Item)` entries interleaved according to the configured
/// [`OrderPolicy`]; fatal errors are yielded once and end the stream.
/// Dropping the stream early tears the whole pool down.
///
/// # Example
///
/// ```
/// use scatter::{map, MapConfig, OrderPolicy};
///
/// let stream = map(
///     0..4u64,
///     |n: u64| (0..n).map(|i| Ok::<_, String>(n * 10 + i)).collect::<Vec<_>>(),
///     MapConfig::new()
///         .with_num_workers(2)
///         .with_order(OrderPolicy::Ordered),
/// )
/// .unwrap();
///
/// let values: Vec<u64> = stream.map(|entry| entry.unwrap().value).collect();
/// assert_eq!(values, [10, 20, 21, 30, 31, 32]);
/// ```
pub fn map<I, F, O, R, E>(
    items: I,
    produce: F,
    config: MapConfig,
) -> Result<RecordStream<I::IntoIter, R>>
where
    I: IntoIterator,
    I::Item: Send + 'static,
    F: FnMut(I::Item) -> O + Clone + Send + 'static,
    O: IntoIterator<Item = std::result::Result<R, E>>,
    R: Send + 'static,
    E: Display,
{
    let source = ItemSource::new(items.into_iter());
    let spawner = worker::spawner(produce);
    let pool = pool::Pool::start(source, spawner, &config)?;
    Ok(RecordStream::new(pool, &config))
}
