//! Fault tolerance walkthrough: some items fail, one kills its worker, and
//! the stream still delivers everything else exactly once.
//!
//! Run with `RUST_LOG=scatter=debug` to watch the pool replace the crashed
//! worker.

use scatter::{Error, FailureKind, MapConfig, map};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Fault Tolerance Walkthrough ===\n");

    let stream = map(
        0..10u32,
        |n: u32| -> Vec<Result<u32, String>> {
            match n {
                3 => vec![Err("item 3 is unprocessable".to_string())],
                7 => panic!("item 7 takes its worker down"),
                _ => vec![Ok(n * n)],
            }
        },
        MapConfig::new().with_num_workers(3),
    )?;

    let mut delivered = 0;
    for entry in stream {
        match entry {
            Ok(record) => {
                delivered += 1;
                println!("item {:>2} -> {}", record.ordinal, record.value);
            }
            Err(Error::Item {
                ordinal,
                kind: FailureKind::Produce,
                message,
            }) => {
                println!("item {:>2} xx producer error: {}", ordinal, message);
            }
            Err(Error::Item {
                ordinal,
                kind: FailureKind::Crashed,
                message,
            }) => {
                println!("item {:>2} xx worker crashed ({}); pool replaced it", ordinal, message);
            }
            Err(err) => return Err(err.into()),
        }
    }

    println!("\n{} of 10 items delivered output; 2 failed; none lost.", delivered);
    Ok(())
}
