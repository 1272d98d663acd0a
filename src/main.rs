use std::path::{Path, PathBuf};
use std::process;

use bytesize::ByteSize;
use clap::{Arg, ArgAction, ArgMatches, Command};
use env_logger;
use log;

use binsort::{ExternalSorter, ExternalSorterBuilder, SortAlgorithm, SortStats, StreamBackend};

fn main() {
    let args = build_arg_parser();

    let log_level = args.get_one::<String>("log_level").expect("has default");
    init_logger(log_level);

    let record_size = args.get_one::<String>("record_size").expect("has default");
    let result = match record_size.as_str() {
        "1" => run::<u8>(&args),
        "2" => run::<u16>(&args),
        "4" => run::<u32>(&args),
        "8" => run::<u64>(&args),
        _ => unreachable!("record size is pre-validated"),
    };

    match result {
        Ok(stats) => {
            log::info!(
                "done: {} records, {} in {} ms",
                stats.records,
                ByteSize(stats.input_bytes),
                stats.elapsed.as_millis()
            );
        }
        Err(err) => {
            log::error!("{}", err);
            process::exit(1);
        }
    }
}

fn run<T: binsort::Record>(args: &ArgMatches) -> binsort::Result<SortStats> {
    let input: PathBuf = args
        .get_one::<String>("input")
        .map(Into::into)
        .expect("has default");
    let output: PathBuf = args
        .get_one::<String>("output")
        .map(Into::into)
        .expect("has default");

    let mut builder: ExternalSorterBuilder<T> = ExternalSorterBuilder::new();

    let memory = args.get_one::<ByteSize>("memory").expect("has default");
    builder = builder.with_memory_limit(memory.as_u64());

    if let Some(threads) = args.get_one::<u32>("threads") {
        builder = builder.with_threads_number(*threads);
    }
    if let Some(fan_in) = args.get_one::<usize>("fan_in") {
        builder = builder.with_fan_in(*fan_in);
    }
    if let Some(height) = args.get_one::<u32>("tree_height") {
        builder = builder.with_tree_height(*height);
    }
    if args.get_flag("flat") {
        builder = builder.with_flat_merge(true);
    }
    if let Some(ratio) = args.get_one::<f64>("io_ratio") {
        builder = builder.with_io_ratio(*ratio);
    }
    if let Some(tmp_dir) = args.get_one::<String>("tmp_dir") {
        builder = builder.with_tmp_dir(Path::new(tmp_dir));
    }
    if args.get_flag("keep_tmp") {
        builder = builder.with_keep_chunks(true);
    }

    let algorithm = args
        .get_one::<String>("algorithm")
        .expect("has default")
        .parse::<SortAlgorithm>()?;
    builder = builder.with_algorithm(algorithm);

    let backend = match args.get_one::<String>("backend").map(String::as_str) {
        Some("mapped") => StreamBackend::Mapped,
        _ => StreamBackend::Buffered,
    };
    builder = builder.with_backend(backend);

    let sorter: ExternalSorter<T> = builder.build()?;

    if args.get_flag("merge_only") {
        sorter.merge_existing(&output)
    } else {
        sorter.sort(&input, &output)
    }
}

fn build_arg_parser() -> ArgMatches {
    Command::new("binsort")
        .about("external merge sort for files of fixed-width binary integer records")
        .arg(
            Arg::new("input")
                .help("file to be sorted")
                .default_value("input"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .default_value("output"),
        )
        .arg(
            Arg::new("memory")
                .short('m')
                .long("memory")
                .help("total memory budget, e.g. 64MiB")
                .default_value("256MiB")
                .value_parser(parse_byte_size),
        )
        .arg(
            Arg::new("record_size")
                .short('r')
                .long("record-size")
                .help("record width in bytes")
                .default_value("4")
                .value_parser(["1", "2", "4", "8"]),
        )
        .arg(
            Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of worker threads")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("fan_in")
                .short('k')
                .long("fan-in")
                .help("merge fan-in; 0 selects the automatic width")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("tree_height")
                .long("tree-height")
                .help("merge tree height targeted by the automatic fan-in")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("flat")
                .long("flat")
                .help("merge every level-0 chunk in a single root merge")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("algorithm")
                .short('a')
                .long("algorithm")
                .help("in-memory sort algorithm")
                .default_value("std")
                .value_parser(["std", "parallel", "radix"]),
        )
        .arg(
            Arg::new("io_ratio")
                .long("io-ratio")
                .help("input share of each worker's buffer budget")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store chunk files"),
        )
        .arg(
            Arg::new("keep_tmp")
                .long("keep-tmp")
                .help("keep merged chunk files instead of deleting them")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("backend")
                .short('b')
                .long("backend")
                .help("chunk stream backend")
                .default_value("buffered")
                .value_parser(["buffered", "mapped"]),
        )
        .arg(
            Arg::new("merge_only")
                .long("merge-only")
                .help("skip the sort stage and merge the chunks already in --tmp-dir")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .default_value("info")
                .value_parser(["off", "error", "warn", "info", "debug", "trace"]),
        )
        .get_matches()
}

fn parse_byte_size(value: &str) -> Result<ByteSize, String> {
    value
        .parse::<ByteSize>()
        .map_err(|err| format!("size format incorrect: {}", err))
}

fn init_logger(log_level: &str) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            "off" => log::LevelFilter::Off,
            "error" => log::LevelFilter::Error,
            "warn" => log::LevelFilter::Warn,
            "info" => log::LevelFilter::Info,
            "debug" => log::LevelFilter::Debug,
            "trace" => log::LevelFilter::Trace,
            _ => log::LevelFilter::Info,
        })
        .format_timestamp_millis()
        .init();
}
