//! `binsort` is an external merge sort for huge files of fixed-width
//! unsigned integer records.
//!
//! External sorting is required when the data being sorted does not fit the
//! main memory (RAM) of a computer. Sorting runs in two stages: stage one
//! splits the input into memory-sized chunks, sorts each chunk in RAM and
//! persists it; stage two merges the sorted chunks level by level through a
//! k-way merge tree until a single totally-ordered file remains. For more
//! information see [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! `binsort` supports the following features:
//!
//! * **Bounded memory:**
//!   a single byte budget covers the sort buffers and all merge I/O buffers;
//!   peak memory stays flat no matter how large the input grows.
//! * **Multithreading:**
//!   a fixed pool of worker threads drives both stages; merge levels run in
//!   parallel under a level-ordering discipline.
//! * **Pluggable chunk I/O:**
//!   chunk files are read and written either through sized buffered streams
//!   or through memory mappings, selected by configuration.
//! * **Pluggable in-memory sort:**
//!   comparison sort, parallel comparison sort, or radix sort for the
//!   integer records.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use bytesize::MIB;
//! use binsort::ExternalSorter;
//!
//! fn main() {
//!     env_logger::Builder::new().filter_level(log::LevelFilter::Info).init();
//!
//!     let sorter: ExternalSorter<u32> = ExternalSorter::builder()
//!         .with_memory_limit(64 * MIB)
//!         .with_threads_number(4)
//!         .with_fan_in(8)
//!         .build()
//!         .unwrap();
//!
//!     let stats = sorter
//!         .sort(Path::new("input.bin"), Path::new("output.bin"))
//!         .unwrap();
//!
//!     println!("sorted {} records in {:?}", stats.records, stats.elapsed);
//! }
//! ```

// the on-disk record format is little-endian and chunk payloads move through
// plain memory casts
#[cfg(target_endian = "big")]
compile_error!("binsort only supports little-endian targets");

pub mod chunk;
pub mod error;
pub mod input;
pub mod record;
pub mod sort;
pub mod task;

pub(crate) mod pipeline;
pub(crate) mod tree;

pub use chunk::{ChunkId, ChunkInput, ChunkOutput, ChunkStore, StreamBackend};
pub use error::{Result, SortError};
pub use record::Record;
pub use sort::{ExternalSorter, ExternalSorterBuilder, SortStats};
pub use task::SortAlgorithm;
