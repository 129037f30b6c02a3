//! The inode abstraction the replayer tracks per host inode number.

use std::fs::File;

use crate::dir::DirNode;
use crate::error::ReplayError;
use crate::file::FileNode;

/// One tracked inode: either a regular file with a sector cache or a
/// directory with an undo journal. The variant is fixed at first
/// observation; the replayer treats a change of type as log corruption.
pub enum Inode {
    File(FileNode),
    Directory(DirNode),
}

impl Inode {
    pub fn is_directory(&self) -> bool {
        matches!(self, Inode::Directory(_))
    }

    /// Data writes only make sense against a regular file.
    pub fn apply_write(&mut self, file: &File, data: &[u8], offset: u64) -> Result<(), ReplayError> {
        match self {
            Inode::File(node) => node.apply_write(file, data, offset),
            Inode::Directory(_) => Err(ReplayError::DirectoryTarget { action: "write to" }),
        }
    }

    pub fn apply_truncate(&mut self, file: &File, size: u64) -> Result<(), ReplayError> {
        match self {
            Inode::File(node) => node.apply_truncate(file, size),
            Inode::Directory(_) => Err(ReplayError::DirectoryTarget { action: "truncate" }),
        }
    }

    /// `fsync` on the handle: flush a file's buffered sectors, or commit a
    /// directory's journal.
    pub fn synchronize(&mut self, file: &File) -> Result<(), ReplayError> {
        match self {
            Inode::File(node) => node.synchronize(file),
            Inode::Directory(node) => {
                node.synchronize();
                Ok(())
            }
        }
    }

    /// Simulated power loss: discard whatever was not persisted.
    pub fn forget_unpersisted(&mut self) {
        match self {
            Inode::File(node) => node.forget_unpersisted(),
            Inode::Directory(node) => node.forget_unpersisted(),
        }
    }
}
