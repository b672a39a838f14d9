mod info_cmd;
mod read_cmd;
mod recompress_cmd;
mod string_utils;
mod synth_cmd;

use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, Command};
use log::*;
use std::path::PathBuf;

use cazar::recompress::{RecompressOptions, DEFAULT_DICTIONARY_CAPACITY};

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

fn init_log(level: log::LevelFilter) -> Result<()> {
    let local_level = level;
    fern::Dispatch::new()
        .format(move |out, message, record| {
            if local_level > log::LevelFilter::Info {
                // Add some extra info to each message in debug
                out.finish(format_args!(
                    "[{}]({})({}) {}",
                    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                    record.target(),
                    record.level(),
                    message
                ))
            } else {
                out.finish(format_args!("{}", message))
            }
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()
        .map_err(|err| anyhow!("unable to initialize log: {}", err))?;
    Ok(())
}

enum Parsed {
    Info(info_cmd::Command),
    Synthesize(synth_cmd::Command),
    Recompress(recompress_cmd::Command),
    List(read_cmd::ListCommand),
    Cat(read_cmd::CatCommand),
}

fn parse_opts() -> Result<Parsed> {
    let matches = Command::new(PKG_NAME)
        .version(PKG_VERSION)
        .about("Delta distribution of chunked zstd archives.")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::Count)
                .global(true)
                .help("Set verbosity level"),
        )
        .subcommand(
            Command::new("info").about("Print archive details.").arg(
                Arg::new("INPUT")
                    .value_name("INPUT")
                    .help("Input archive file")
                    .required(true),
            ),
        )
        .subcommand(
            Command::new("synthesize")
                .about("Assemble an archive from an index, a chunk store and any seed archives.")
                .arg(
                    Arg::new("index")
                        .long("index")
                        .value_name("FILE")
                        .help("Index file (.caibx) listing the target chunks")
                        .required(true),
                )
                .arg(
                    Arg::new("store")
                        .long("store")
                        .value_name("DIR")
                        .help("Chunk store directory")
                        .required(true),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .value_name("FILE")
                        .action(ArgAction::Append)
                        .help("Existing archive to splice chunks from"),
                )
                .arg(
                    Arg::new("OUTPUT")
                        .value_name("OUTPUT")
                        .help("Output archive file")
                        .required(true),
                ),
        )
        .subcommand(
            Command::new("recompress")
                .about("Recompress every chunk of a store against one dictionary.")
                .arg(
                    Arg::new("store")
                        .long("store")
                        .value_name("DIR")
                        .help("Chunk store directory")
                        .required(true),
                )
                .arg(
                    Arg::new("dictionary-id")
                        .long("dictionary-id")
                        .value_name("ID")
                        .value_parser(clap::value_parser!(u32))
                        .help("Target dictionary id (0 strips dictionaries)")
                        .required(true),
                )
                .arg(
                    Arg::new("level")
                        .long("level")
                        .value_name("LEVEL")
                        .value_parser(clap::value_parser!(i32))
                        .default_value("19")
                        .help("Zstd compression level"),
                )
                .arg(
                    Arg::new("workers")
                        .long("workers")
                        .value_name("NUM")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("0")
                        .help("Worker count, 0 for one per core"),
                )
                .arg(
                    Arg::new("train")
                        .long("train")
                        .action(ArgAction::SetTrue)
                        .help("Retrain the dictionary even if it exists"),
                )
                .arg(
                    Arg::new("verify")
                        .long("verify")
                        .action(ArgAction::SetTrue)
                        .help("Verify chunk content against file names"),
                )
                .arg(
                    Arg::new("dictionary-capacity")
                        .long("dictionary-capacity")
                        .value_name("BYTES")
                        .value_parser(clap::value_parser!(usize))
                        .help("Dictionary trainer capacity"),
                ),
        )
        .subcommand(
            Command::new("ls")
                .about("List a directory of the tar content of an archive.")
                .arg(
                    Arg::new("INPUT")
                        .value_name("INPUT")
                        .help("Input archive file")
                        .required(true),
                )
                .arg(
                    Arg::new("PATH")
                        .value_name("PATH")
                        .help("Directory within the archive [default: the root]"),
                )
                .arg(
                    Arg::new("dictionary-dir")
                        .long("dictionary-dir")
                        .value_name("DIR")
                        .help("Directory holding referenced dictionaries"),
                ),
        )
        .subcommand(
            Command::new("cat")
                .about("Write a file or byte range of an archive to stdout.")
                .arg(
                    Arg::new("INPUT")
                        .value_name("INPUT")
                        .help("Input archive file")
                        .required(true),
                )
                .arg(
                    Arg::new("path")
                        .long("path")
                        .value_name("PATH")
                        .help("File within the tar content"),
                )
                .arg(
                    Arg::new("offset")
                        .long("offset")
                        .value_name("OFFSET")
                        .value_parser(clap::value_parser!(u64))
                        .help("Uncompressed byte offset to read from"),
                )
                .arg(
                    Arg::new("size")
                        .long("size")
                        .value_name("SIZE")
                        .value_parser(clap::value_parser!(usize))
                        .help("Number of bytes to read"),
                )
                .arg(
                    Arg::new("dictionary-dir")
                        .long("dictionary-dir")
                        .value_name("DIR")
                        .help("Directory holding referenced dictionaries"),
                ),
        )
        .get_matches();

    init_log(match matches.get_count("verbose") {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    })?;

    let path_of = |value: &String| PathBuf::from(value);
    Ok(match matches.subcommand() {
        Some(("info", matches)) => Parsed::Info(info_cmd::Command {
            input: matches.get_one::<String>("INPUT").map(path_of).unwrap(),
        }),
        Some(("synthesize", matches)) => Parsed::Synthesize(synth_cmd::Command {
            index: matches.get_one::<String>("index").map(path_of).unwrap(),
            store: matches.get_one::<String>("store").map(path_of).unwrap(),
            seeds: matches
                .get_many::<String>("seed")
                .unwrap_or_default()
                .map(path_of)
                .collect(),
            output: matches.get_one::<String>("OUTPUT").map(path_of).unwrap(),
        }),
        Some(("recompress", matches)) => Parsed::Recompress(recompress_cmd::Command {
            store: matches.get_one::<String>("store").map(path_of).unwrap(),
            options: RecompressOptions {
                dictionary_id: *matches.get_one::<u32>("dictionary-id").unwrap(),
                level: *matches.get_one::<i32>("level").unwrap(),
                workers: *matches.get_one::<usize>("workers").unwrap(),
                train: matches.get_flag("train"),
                verify: matches.get_flag("verify"),
                dictionary_capacity: matches
                    .get_one::<usize>("dictionary-capacity")
                    .copied()
                    .unwrap_or(DEFAULT_DICTIONARY_CAPACITY),
            },
        }),
        Some(("ls", matches)) => Parsed::List(read_cmd::ListCommand {
            input: matches.get_one::<String>("INPUT").map(path_of).unwrap(),
            path: matches
                .get_one::<String>("PATH")
                .cloned()
                .unwrap_or_default(),
            dictionary_dir: matches.get_one::<String>("dictionary-dir").map(path_of),
        }),
        Some(("cat", matches)) => {
            let offset = matches.get_one::<u64>("offset").copied();
            let size = matches.get_one::<usize>("size").copied();
            let range = match (offset, size) {
                (Some(offset), Some(size)) => Some((offset, size)),
                (None, None) => None,
                _ => return Err(anyhow!("--offset and --size go together")),
            };
            Parsed::Cat(read_cmd::CatCommand {
                input: matches.get_one::<String>("INPUT").map(path_of).unwrap(),
                path: matches.get_one::<String>("path").cloned(),
                range,
                dictionary_dir: matches.get_one::<String>("dictionary-dir").map(path_of),
            })
        }
        _ => unreachable!("subcommand is required"),
    })
}

#[tokio::main]
async fn main() {
    let result = match parse_opts() {
        Ok(Parsed::Info(cmd)) => cmd.run().await,
        Ok(Parsed::Synthesize(cmd)) => cmd.run().await,
        Ok(Parsed::Recompress(cmd)) => cmd.run().await,
        Ok(Parsed::List(cmd)) => cmd.run().await,
        Ok(Parsed::Cat(cmd)) => cmd.run().await,
        Err(err) => Err(err),
    };
    if let Err(ref err) = result {
        error!("error: {:#}", err);
        std::process::exit(1);
    }
}
