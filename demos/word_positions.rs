//! Word positions example: scans several in-memory documents in parallel
//! and reports where every word occurs, in document order.

use scatter::{MapConfig, OrderPolicy, map};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Word Positions over a Worker Pool ===\n");

    let documents = vec![
        ("intro", "the quick brown fox jumps over the lazy dog"),
        ("body", "pack my box with five dozen liquor jugs"),
        ("outro", "how vexingly quick daft zebras jump"),
    ];

    let stream = map(
        documents,
        |(name, text): (&str, &str)| {
            text.split_whitespace()
                .enumerate()
                .map(|(position, word)| {
                    Ok::<_, String>((name.to_string(), position, word.to_string()))
                })
                .collect::<Vec<_>>()
        },
        MapConfig::new()
            .with_num_workers(2)
            .with_order(OrderPolicy::Ordered),
    )?;

    for entry in stream {
        let record = entry?;
        let (document, position, word) = record.value;
        println!(
            "[doc {}] {:>6}:{:<2} {}",
            record.ordinal, document, position, word
        );
    }

    println!("\nDone.");
    Ok(())
}
