//! Record an application's filesystem activity through a FUSE mount.
//!
//! Everything the application does under `mount_point` is forwarded to
//! `underlying_dir`; each successful mutation appends one record to
//! `log_file`. Runs until unmounted.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use fuser::MountOption;
use unplugfs::LogWriter;
use unplugfs::Recorder;

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Where the recording filesystem is mounted.
    mount_point: PathBuf,

    /// Directory that actually stores the data.
    underlying_dir: PathBuf,

    /// File the operation log is written to.
    log_file: PathBuf,

    /// Unmount automatically when the recorder exits.
    #[arg(long)]
    auto_unmount: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let log = File::create(&args.log_file)
        .with_context(|| format!("cannot open log file {:?}", args.log_file))?;
    let recorder = Recorder::new(&args.underlying_dir, LogWriter::new(BufWriter::new(log)));

    let mut options = vec![
        MountOption::FSName("unplugfs".to_string()),
        MountOption::DefaultPermissions,
    ];
    if args.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }

    // The session loop handles one request at a time, which is what makes
    // the log's order a total order over the application's operations.
    fuser::mount2(recorder, &args.mount_point, &options).context("mount failed")?;
    Ok(())
}
