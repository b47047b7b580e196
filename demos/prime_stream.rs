//! Prime streaming example: each input item is a numeric range, and each
//! worker streams the primes it finds back one at a time, so results start
//! arriving before any range is finished.

use scatter::{MapConfig, map};

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    let mut d = 2;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 1;
    }
    true
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Streaming Primes from Parallel Ranges ===\n");

    let ranges: Vec<std::ops::Range<u64>> = (0..8).map(|i| (i * 10_000)..((i + 1) * 10_000)).collect();

    let stream = map(
        ranges,
        |range: std::ops::Range<u64>| range.filter(|&n| is_prime(n)).map(Ok::<_, String>),
        MapConfig::new().with_num_workers(4),
    )?;

    let mut total = 0u64;
    let mut largest = 0u64;
    for entry in stream {
        let record = entry?;
        total += 1;
        largest = largest.max(record.value);
    }

    println!("found {} primes below 80000 (largest: {})", total, largest);
    Ok(())
}
