//! The operation record: one decoded filesystem call from a recorded log.

use std::path::PathBuf;

/// Handle ID assigned by the recorder to an open file.
///
/// This is a small dense integer chosen by the recorder, not a live file
/// descriptor. `None` is the recorded "not applicable" sentinel (serialized
/// as `-1`): the call reached the recorder without an open handle.
pub type HandleId = Option<u32>;

/// A seconds + nanoseconds pair, as recorded for `utimens`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: i64,
}

impl Timestamp {
    pub fn new(secs: i64, nanos: i64) -> Self {
        Timestamp { secs, nanos }
    }
}

/// One filesystem call, with the arguments the recorder captured for it.
///
/// Paths are stored exactly as recorded: absolute, rooted at the recorder's
/// mount point, and byte sequences rather than guaranteed UTF-8. `data` may
/// contain arbitrary bytes including zeros.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Mkdir {
        path: PathBuf,
        mode: u32,
    },
    Unlink {
        path: PathBuf,
    },
    Rmdir {
        path: PathBuf,
    },
    /// `target` is the symlink's content and is not a path under the mount;
    /// only `linkpath` gets remapped at replay time.
    Symlink {
        target: PathBuf,
        linkpath: PathBuf,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
    },
    Link {
        from: PathBuf,
        to: PathBuf,
    },
    Chmod {
        path: PathBuf,
        mode: u32,
    },
    Chown {
        path: PathBuf,
        uid: u32,
        gid: u32,
    },
    Truncate {
        path: PathBuf,
        size: u64,
    },
    Ftruncate {
        path: PathBuf,
        size: u64,
        handle: HandleId,
    },
    Create {
        path: PathBuf,
        flags: i32,
        mode: u32,
        handle: HandleId,
    },
    Open {
        path: PathBuf,
        flags: i32,
        handle: HandleId,
    },
    Write {
        path: PathBuf,
        data: Vec<u8>,
        offset: u64,
        handle: HandleId,
    },
    Release {
        handle: HandleId,
    },
    Fsync {
        path: PathBuf,
        datasync: bool,
        handle: HandleId,
    },
    Utimens {
        path: PathBuf,
        atime: Timestamp,
        mtime: Timestamp,
    },
}

impl Operation {
    /// The opcode name exactly as it appears in the log.
    pub fn opcode(&self) -> &'static str {
        match self {
            Operation::Mkdir { .. } => "mkdir",
            Operation::Unlink { .. } => "unlink",
            Operation::Rmdir { .. } => "rmdir",
            Operation::Symlink { .. } => "symlink",
            Operation::Rename { .. } => "rename",
            Operation::Link { .. } => "link",
            Operation::Chmod { .. } => "chmod",
            Operation::Chown { .. } => "chown",
            Operation::Truncate { .. } => "truncate",
            Operation::Ftruncate { .. } => "ftruncate",
            Operation::Create { .. } => "create",
            Operation::Open { .. } => "open",
            Operation::Write { .. } => "write",
            Operation::Release { .. } => "release",
            Operation::Fsync { .. } => "fsync",
            Operation::Utimens { .. } => "utimens",
        }
    }
}
