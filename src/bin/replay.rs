//! Replay a recorded operation log into a target directory.
//!
//! The log is read from stdin. Replay always ends with one simulated
//! power loss, so the target is left in a post-crash state; with
//! `--writeback all` that is indistinguishable from a clean shutdown.

use std::io;
use std::path::PathBuf;

use clap::Parser;
use log::info;
use unplugfs::Controls;
use unplugfs::LogReader;
use unplugfs::Replayer;
use unplugfs::WritebackPolicy;
use unplugfs::replay_log;

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Directory the recorded operations are materialized into.
    target_path: PathBuf,

    /// Simulated sector size in bytes.
    #[arg(long, value_name = "BYTES", default_value_t = 512)]
    sector_size: u64,

    /// Skip the first N records.
    #[arg(long, value_name = "N", default_value_t = 0)]
    skip: u64,

    /// Only replay N operations.
    #[arg(long, value_name = "N")]
    take: Option<u64>,

    /// Which sectors to write before fsync: all, none, odd, even, random.
    #[arg(long, value_name = "MODE", default_value = "all")]
    writeback: WritebackPolicy,

    /// Drop everything before PATH is created.
    #[arg(long, value_name = "PATH")]
    start_touch: Option<PathBuf>,

    /// Stop as soon as PATH is created.
    #[arg(long, value_name = "PATH")]
    stop_touch: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    anyhow::ensure!(args.sector_size > 0, "sector size must be non-zero");

    let mut fs = Replayer::new(&args.target_path, args.sector_size, args.writeback);
    let controls = Controls {
        skip: args.skip,
        take: args.take,
        start_touch: args.start_touch,
        stop_touch: args.stop_touch,
    };

    let stdin = io::stdin();
    let summary = replay_log(LogReader::new(stdin.lock()), &mut fs, &controls)?;
    info!(
        "applied {} of {} recorded operation(s) into {:?}",
        summary.applied, summary.records, args.target_path
    );
    Ok(())
}
