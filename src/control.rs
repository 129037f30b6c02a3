//! The session loop and its filter layer.
//!
//! Filters decide which window of the log is actually applied: a skip
//! count, a take count, and start/stop triggers that fire when a named
//! path is created. Whatever ends the session cleanly (end of log, the
//! take count, the stop trigger) is followed by exactly one simulated
//! power loss, so the target directory is always left in a post-crash
//! state. Errors do not cut the power; the caller decides.

use std::io::Read;
use std::path::PathBuf;

use log::debug;

use crate::error::Error;
use crate::op::Operation;
use crate::reader::LogReader;
use crate::replay::Replayer;

/// Which slice of the log to replay.
#[derive(Debug, Clone, Default)]
pub struct Controls {
    /// Drop this many records before considering any.
    pub skip: u64,
    /// Stop after applying this many operations. `None` is unbounded.
    pub take: Option<u64>,
    /// Drop records until this path is created; the creating record and
    /// everything after it are considered.
    pub start_touch: Option<PathBuf>,
    /// Stop as soon as this path is created; the creating record is not
    /// applied.
    pub stop_touch: Option<PathBuf>,
}

/// What a finished session did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    /// Records read from the log, including filtered ones.
    pub records: u64,
    /// Operations actually applied to the target.
    pub applied: u64,
}

/// Drive a whole session: read records, filter, apply, and cut the power
/// on clean termination.
pub fn replay_log<R: Read>(
    mut log: LogReader<R>,
    fs: &mut Replayer,
    controls: &Controls,
) -> Result<Summary, Error> {
    let mut skip = controls.skip;
    let mut armed = controls.start_touch.is_some();
    let mut applied: u64 = 0;

    loop {
        let Some(op) = log.next_op()? else {
            break;
        };

        if skip > 0 {
            skip -= 1;
            continue;
        }

        if let Operation::Create { path, .. } = &op {
            if armed && controls.start_touch.as_deref() == Some(path.as_path()) {
                debug!("start trigger {path:?} created on line {}", log.line());
                armed = false;
            }
            if controls.stop_touch.as_deref() == Some(path.as_path()) {
                debug!("stop trigger {path:?} created on line {}", log.line());
                break;
            }
        }

        if armed {
            continue;
        }

        fs.replay(&op).map_err(|source| Error::Replay {
            line: log.line(),
            source,
        })?;
        applied += 1;
        if Some(applied) == controls.take {
            break;
        }
    }

    fs.lose_power();
    Ok(Summary {
        records: log.line(),
        applied,
    })
}
