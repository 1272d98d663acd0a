use std::fs;
use std::io::Write;
use std::path::Path;

use bytesize::MIB;
use rand::prelude::*;

use binsort::ExternalSorter;

/// Generates a file of random records, sorts it under a deliberately tight
/// memory budget and verifies the result.
///
/// Run with `cargo run --example quickstart`.
fn main() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_millis()
        .init();

    let input = Path::new("quickstart-input.bin");
    let output = Path::new("quickstart-output.bin");

    generate_input(input, 4 << 20);

    let sorter: ExternalSorter<u32> = ExternalSorter::builder()
        .with_memory_limit(MIB)
        .with_threads_number(4)
        .with_fan_in(8)
        .build()
        .unwrap();

    let stats = sorter.sort(input, output).unwrap();
    println!(
        "sorted {} records through {} chunks and {} merges in {:?}",
        stats.records, stats.l0_chunks, stats.merge_tasks, stats.elapsed
    );

    verify_sorted(output);
    println!("output is sorted");

    fs::remove_file(input).unwrap();
    fs::remove_file(output).unwrap();
}

fn generate_input(path: &Path, bytes: usize) {
    let mut rng = rand::thread_rng();
    let mut file = fs::File::create(path).unwrap();

    let mut buf = vec![0u8; 64 * 1024];
    let mut written = 0;
    while written < bytes {
        rng.fill_bytes(&mut buf);
        let take = buf.len().min(bytes - written);
        file.write_all(&buf[..take]).unwrap();
        written += take;
    }
}

fn verify_sorted(path: &Path) {
    let data = fs::read(path).unwrap();
    let mut prev = 0u32;
    for chunk in data.chunks_exact(4) {
        let value = u32::from_le_bytes(chunk.try_into().unwrap());
        assert!(prev <= value, "output out of order");
        prev = value;
    }
}
