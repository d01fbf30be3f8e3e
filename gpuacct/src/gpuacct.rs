// `gpuacct` -- Daily GPU-hour accounting rollup for Slurm clusters
//
// Run once a day on the `sacct --parsable2` output for the day's finished jobs:
//
//   sacct -a -X --parsable2 -S <yesterday> -E <today> \
//     --format=JobID,JobName,User,Group,Partition,Elapsed,AllocTRES,NodeList,State > day.txt
//   gpuacct day.txt
//
// This writes the day's per-partition, per-group and per-user totals to `<scope>_dictionary.csv`
// and folds them into the running totals in `<scope>_dictionary_sum.csv`, all in the output
// directory.  See ../../sacctlog/src/snapshot.rs for the file format.
//
// Runs must not overlap; there is no locking of the output directory.
//
// Quirks
//
// The reserved-pool node list is fetched by running `sinfo` at the time of the run, not at the time
// the jobs ran.  If nodes move between partitions the day's partition totals use the new layout.
//
// With --no-merge the metrics file still reports the cumulative totals as they are on disk, ie
// without the current day.

mod configs;
mod format;
mod rollup;
mod tables;

use anyhow::Result;
use chrono::Local;
use clap::Parser;
use log::LevelFilter;
use sacctlog::{CommandNodes, FileNodes, NodeSource};
use std::env;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Accounting file, `sacct --parsable2` output
    input: String,

    /// Directory for the dictionary files [default: $GPUACCT_ROOT, else the current directory]
    #[arg(long)]
    output_dir: Option<String>,

    /// File containing JSON settings: GPU weights, pool labels, node command [default: none]
    #[arg(long)]
    config_file: Option<String>,

    /// Read the reserved-pool nodes from this file instead of running the node command
    #[arg(long)]
    nodes_file: Option<String>,

    /// Write the daily files only, leave the cumulative files alone
    #[arg(long, default_value_t = false)]
    no_merge: bool,

    /// Also write the totals as Prometheus gauges to this file
    #[arg(long)]
    metrics_file: Option<String>,

    /// Print the day's tables to stdout
    #[arg(long, default_value_t = false)]
    print: bool,

    /// Select fields for --print: name,index,gpu-hours,gpu-tres-hours,elapsed-hours
    /// [default: name,index,gpu-hours,gpu-tres-hours]
    #[arg(long)]
    fmt: Option<String>,

    /// Print csv instead of fixed-width columns
    #[arg(long, default_value_t = false)]
    csv: bool,

    /// Log debug information to stderr, including why lines were skipped
    #[arg(long, short, default_value_t = false)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    match gpuacct(&cli) {
        Ok(()) => {}
        Err(msg) => {
            eprintln!("ERROR: {:#}", msg);
            process::exit(1);
        }
    }
}

// RUST_LOG, if set, overrides the level given by --verbose.

fn init_logger(verbose: bool) {
    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, if verbose { LevelFilter::Debug } else { LevelFilter::Info })
        .parse_default_env()
        .init();
}

fn gpuacct(cli: &Cli) -> Result<()> {
    // Validate and regularize input parameters from switches and defaults.

    let fmt = cli.fmt.as_deref().unwrap_or(tables::DEFAULT_FMT);
    if cli.print {
        tables::check_fmt(fmt)?;
    }

    let settings = match &cli.config_file {
        Some(filename) => configs::read_from_json(filename)?,
        None => configs::Settings::default(),
    };

    let output_dir = match &cli.output_dir {
        Some(dir) => dir.clone(),
        None => env::var("GPUACCT_ROOT").unwrap_or_else(|_| ".".to_string()),
    };

    let nodes: Box<dyn NodeSource> = match &cli.nodes_file {
        Some(filename) => Box::new(FileNodes::new(filename)),
        None => Box::new(CommandNodes::new(settings.node_command.clone())),
    };

    let args = rollup::RollupArgs {
        input: PathBuf::from(&cli.input),
        output_dir: PathBuf::from(output_dir),
        merge: !cli.no_merge,
        metrics_file: cli.metrics_file.as_ref().map(PathBuf::from),
    };
    let result = rollup::aggregate_and_store(&args, &settings, nodes.as_ref())?;

    if cli.print {
        tables::print_tables(&mut io::stdout(), &result, fmt, cli.csv)?;
    }
    Ok(())
}
