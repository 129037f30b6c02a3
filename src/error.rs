//! Error types for the replay side of the harness.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A malformed log record.
///
/// Any of these puts the stream into a failure state; the session layer
/// attaches the 1-based record number and aborts.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("reading log: {0}")]
    Io(#[from] io::Error),
    #[error("expected '(' at start of record")]
    ExpectedRecord,
    #[error("unknown opcode {0:?}")]
    UnknownOpcode(String),
    #[error("expected a quoted string argument")]
    ExpectedString,
    #[error("unterminated string")]
    UnterminatedString,
    #[error("bad string escape")]
    BadEscape,
    #[error("expected an integer argument")]
    ExpectedInteger,
    #[error("integer argument out of range")]
    IntegerOutOfRange,
    #[error("expected ')' at end of record")]
    ExpectedClose,
}

/// A failure while applying one operation to the target directory.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// A host filesystem call returned an error. The inode object's
    /// unpersisted state is left untouched when this is raised.
    #[error("{op} failed: {source}")]
    Host {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("recorded path is not absolute: {path:?}")]
    RelativePath { path: PathBuf },
    #[error("log opens handle {0} twice without a release")]
    HandleReused(u32),
    #[error("log references unknown handle {0}")]
    UnknownHandle(u32),
    #[error("inode for {path:?} changed type during replay")]
    TypeChanged { path: PathBuf },
    #[error("expected {path:?} to be a directory, but it is a regular file")]
    NotADirectory { path: PathBuf },
    #[error("log opens unsupported file type at {path:?}")]
    UnsupportedFileType { path: PathBuf },
    #[error("cannot {action} a directory")]
    DirectoryTarget { action: &'static str },
    /// A declared hook whose semantics are not defined yet. Raised instead
    /// of silently doing the wrong thing.
    #[error("unimplemented: {0}")]
    Unimplemented(&'static str),
}

/// A session-level failure, stamped with the record that caused it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed record on line {line}: {source}")]
    Parse {
        line: u64,
        #[source]
        source: ParseError,
    },
    #[error("while replaying line {line}: {source}")]
    Replay {
        line: u64,
        #[source]
        source: ReplayError,
    },
}

impl Error {
    /// The 1-based record number the failure is attributed to.
    pub fn line(&self) -> u64 {
        match self {
            Error::Parse { line, .. } | Error::Replay { line, .. } => *line,
        }
    }
}

pub(crate) fn host_err(op: &'static str, source: io::Error) -> ReplayError {
    ReplayError::Host { op, source }
}
