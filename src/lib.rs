//! Filesystem crash-consistency test harness.
//!
//! Two cooperating tools built from one library: a **recorder** that
//! interposes on an application's filesystem calls through FUSE and writes
//! an ordered log of every mutation, and a **replayer** that reconstructs
//! that log into a target directory while modeling the delayed-writeback
//! behavior of a real disk. Writes are tracked per sector; a configurable
//! policy decides which sectors hit the backing file immediately and which
//! sit in a cache until `fsync`. Cutting the power (`lose_power`) throws
//! the cached sectors away, leaving the directory tree in a state the
//! application could genuinely have found after a crash.
//!
//! The log grammar is defined by [`reader`] and [`writer`], which must
//! stay in lockstep; [`replay`] and [`control`] implement the replay
//! session; [`record`] is the FUSE passthrough that produces logs.

pub mod control;
pub mod dir;
pub mod error;
pub mod file;
pub mod inode;
pub mod op;
pub mod reader;
pub mod record;
pub mod replay;
pub mod writer;

pub use crate::control::Controls;
pub use crate::control::Summary;
pub use crate::control::replay_log;
pub use crate::error::Error;
pub use crate::error::ParseError;
pub use crate::error::ReplayError;
pub use crate::file::WritebackPolicy;
pub use crate::op::HandleId;
pub use crate::op::Operation;
pub use crate::op::Timestamp;
pub use crate::reader::LogReader;
pub use crate::record::Recorder;
pub use crate::replay::Replayer;
pub use crate::writer::LogWriter;
