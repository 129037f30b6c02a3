//! The replayer driver: applies recorded operations to a target directory.
//!
//! Every recorded path is absolute under the original mount point; the
//! driver prefixes the configured target root and performs the matching
//! host call. Data writes are routed through the per-file sector cache,
//! same-directory renames through the directory journal, everything else
//! straight to the host filesystem. `lose_power` simulates pulling the
//! plug: every inode discards whatever it had not persisted.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::fs::DirBuilder;
use std::fs::File;
use std::fs::OpenOptions;
use std::fs::Permissions;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;

use log::debug;
use nix::fcntl::AT_FDCWD;
use nix::sys::stat::UtimensatFlags;
use nix::sys::stat::utimensat;
use nix::sys::time::TimeSpec;

use crate::dir::DirNode;
use crate::error::ReplayError;
use crate::error::host_err;
use crate::file::FileNode;
use crate::file::WritebackPolicy;
use crate::inode::Inode;
use crate::op::HandleId;
use crate::op::Operation;
use crate::op::Timestamp;

/// One live slot in the handle table: the descriptor backing a recorded
/// handle ID, plus the host inode number indexing the owning inode table
/// entry. Closing the descriptor is this slot's job (dropping the `File`).
struct Handle {
    file: File,
    ino: u64,
}

/// Replays operations into a target directory.
///
/// The inode table is the sole owner of inode objects and lives for the
/// whole session; handle slots refer to entries by inode number and are
/// vacated on `release`.
pub struct Replayer {
    target: PathBuf,
    sector_size: u64,
    policy: WritebackPolicy,
    handles: Vec<Option<Handle>>,
    inodes: HashMap<u64, Inode>,
}

impl Replayer {
    /// `target` does not have to match the directory used when recording;
    /// every recorded path is re-rooted under it.
    pub fn new(target: impl Into<PathBuf>, sector_size: u64, policy: WritebackPolicy) -> Self {
        Replayer {
            target: target.into(),
            sector_size,
            policy,
            handles: Vec::new(),
            inodes: HashMap::new(),
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Apply one recorded operation. Errors leave the target directory in
    /// whatever state the host filesystem reached; nothing is rolled back.
    pub fn replay(&mut self, op: &Operation) -> Result<(), ReplayError> {
        match op {
            Operation::Mkdir { path, mode } => {
                let p = self.remap(path)?;
                DirBuilder::new()
                    .mode(*mode)
                    .create(&p)
                    .map_err(|e| host_err("mkdir", e))?;
            }
            Operation::Unlink { path } => {
                let p = self.remap(path)?;
                fs::remove_file(&p).map_err(|e| host_err("unlink", e))?;
            }
            Operation::Rmdir { path } => {
                let p = self.remap(path)?;
                fs::remove_dir(&p).map_err(|e| host_err("rmdir", e))?;
            }
            Operation::Symlink { target, linkpath } => {
                // The link content is recorded verbatim; only the link
                // itself lands under the target root.
                let p = self.remap(linkpath)?;
                std::os::unix::fs::symlink(target, &p).map_err(|e| host_err("symlink", e))?;
            }
            Operation::Rename { from, to } => {
                let p_from = self.remap(from)?;
                let p_to = self.remap(to)?;
                fs::rename(&p_from, &p_to).map_err(|e| host_err("rename", e))?;
                // A rename within one directory can still be lost with that
                // directory's unsynchronized metadata, so journal it. A move
                // between directories is left committed: the undo shape for
                // that case is not defined.
                if let (Some(parent_from), Some(parent_to)) = (from.parent(), to.parent()) {
                    if parent_from == parent_to {
                        self.directory_at(parent_from)?.record_rename(from, to);
                    }
                }
            }
            Operation::Link { from, to } => {
                let p_from = self.remap(from)?;
                let p_to = self.remap(to)?;
                fs::hard_link(&p_from, &p_to).map_err(|e| host_err("link", e))?;
            }
            Operation::Chmod { path, mode } => {
                let p = self.remap(path)?;
                fs::set_permissions(&p, Permissions::from_mode(*mode))
                    .map_err(|e| host_err("chmod", e))?;
            }
            Operation::Chown { path, uid, gid } => {
                let p = self.remap(path)?;
                std::os::unix::fs::chown(&p, Some(*uid), Some(*gid))
                    .map_err(|e| host_err("chown", e))?;
            }
            Operation::Truncate { path, size } => {
                let p = self.remap(path)?;
                nix::unistd::truncate(&p, *size as i64)
                    .map_err(|e| host_err("truncate", io::Error::from_raw_os_error(e as i32)))?;
            }
            Operation::Ftruncate { size, handle, .. } => {
                let (id, h) = lookup(&self.handles, *handle)?;
                let inode = self
                    .inodes
                    .get_mut(&h.ino)
                    .ok_or(ReplayError::UnknownHandle(id))?;
                inode.apply_truncate(&h.file, *size)?;
            }
            Operation::Create {
                path, mode, handle, ..
            } => {
                let p = self.remap(path)?;
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .mode(*mode)
                    .open(&p)
                    .map_err(|e| host_err("create", e))?;
                self.open_handle("create", path, *handle, file)?;
            }
            Operation::Open { path, handle, .. } => {
                let p = self.remap(path)?;
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&p)
                    .map_err(|e| host_err("open", e))?;
                self.open_handle("open", path, *handle, file)?;
            }
            Operation::Write {
                data,
                offset,
                handle,
                ..
            } => {
                let (id, h) = lookup(&self.handles, *handle)?;
                let inode = self
                    .inodes
                    .get_mut(&h.ino)
                    .ok_or(ReplayError::UnknownHandle(id))?;
                inode.apply_write(&h.file, data, *offset)?;
            }
            Operation::Release { handle } => {
                self.close_handle(*handle)?;
            }
            Operation::Fsync { handle, .. } => {
                // datasync is recorded but the model has a single
                // durability tier, so both flavors flush everything.
                let (id, h) = lookup(&self.handles, *handle)?;
                let inode = self
                    .inodes
                    .get_mut(&h.ino)
                    .ok_or(ReplayError::UnknownHandle(id))?;
                inode.synchronize(&h.file)?;
            }
            Operation::Utimens { path, atime, mtime } => {
                let p = self.remap(path)?;
                utimensat(
                    AT_FDCWD,
                    &p,
                    &timespec(atime),
                    &timespec(mtime),
                    UtimensatFlags::FollowSymlink,
                )
                .map_err(|e| host_err("utimens", io::Error::from_raw_os_error(e as i32)))?;
            }
        }
        Ok(())
    }

    /// Simulated power loss: every inode discards its unpersisted state.
    /// Order over inodes is unspecified.
    pub fn lose_power(&mut self) {
        debug!(
            "power loss across {} tracked inode(s)",
            self.inodes.len()
        );
        for inode in self.inodes.values_mut() {
            inode.forget_unpersisted();
        }
    }

    /// Number of handle slots currently populated.
    pub fn open_handles(&self) -> usize {
        self.handles.iter().filter(|slot| slot.is_some()).count()
    }

    /// Prefix a recorded absolute path with the target root. A relative
    /// path in the log is a recorder bug, not something to paper over.
    fn remap(&self, path: &Path) -> Result<PathBuf, ReplayError> {
        if !path.is_absolute() {
            return Err(ReplayError::RelativePath { path: path.into() });
        }
        let mut joined = OsString::from(self.target.as_os_str());
        joined.push(path.as_os_str());
        Ok(PathBuf::from(joined))
    }

    /// Register a freshly opened descriptor under a recorded handle ID,
    /// creating the inode object on first observation.
    fn open_handle(
        &mut self,
        op: &'static str,
        recorded: &Path,
        handle: HandleId,
        file: File,
    ) -> Result<(), ReplayError> {
        let id = handle.ok_or(ReplayError::Unimplemented(
            "create/open without a recorded handle ID",
        ))?;

        let meta = file.metadata().map_err(|e| host_err(op, e))?;
        let file_type = meta.file_type();
        let is_dir = if file_type.is_dir() {
            true
        } else if file_type.is_file() {
            false
        } else {
            // open() cannot hand back a symlink, but sockets, fifos and
            // device nodes can still show up here.
            return Err(ReplayError::UnsupportedFileType {
                path: recorded.into(),
            });
        };

        let sector_size = self.sector_size;
        let policy = self.policy;
        let inode = self.inodes.entry(meta.ino()).or_insert_with(|| {
            if is_dir {
                Inode::Directory(DirNode::new(recorded))
            } else {
                Inode::File(FileNode::new(sector_size, policy))
            }
        });
        if inode.is_directory() != is_dir {
            return Err(ReplayError::TypeChanged {
                path: recorded.into(),
            });
        }

        if self.handles.len() < id as usize + 1 {
            self.handles.resize_with(id as usize + 1, || None);
        }
        let slot = &mut self.handles[id as usize];
        if slot.is_some() {
            return Err(ReplayError::HandleReused(id));
        }
        *slot = Some(Handle {
            file,
            ino: meta.ino(),
        });
        Ok(())
    }

    /// Vacate a handle slot and close its descriptor.
    fn close_handle(&mut self, handle: HandleId) -> Result<(), ReplayError> {
        let id = handle.ok_or(ReplayError::Unimplemented(
            "release without a recorded handle ID",
        ))?;
        let slot = self
            .handles
            .get_mut(id as usize)
            .ok_or(ReplayError::UnknownHandle(id))?;
        slot.take()
            .map(drop)
            .ok_or(ReplayError::UnknownHandle(id))
    }

    /// The directory inode for a recorded path, created on first contact.
    fn directory_at(&mut self, recorded: &Path) -> Result<&mut DirNode, ReplayError> {
        let remapped = self.remap(recorded)?;
        let meta = fs::metadata(&remapped).map_err(|e| host_err("rename", e))?;
        let inode = self
            .inodes
            .entry(meta.ino())
            .or_insert_with(|| Inode::Directory(DirNode::new(recorded)));
        match inode {
            Inode::Directory(node) => Ok(node),
            Inode::File(_) => Err(ReplayError::NotADirectory {
                path: recorded.into(),
            }),
        }
    }
}

/// Resolve a recorded handle ID to its live slot. The sentinel means the
/// recorded call had no open handle; servicing those would need a
/// temporary descriptor with an undefined close point, so they fail.
fn lookup(handles: &[Option<Handle>], handle: HandleId) -> Result<(u32, &Handle), ReplayError> {
    let id = handle.ok_or(ReplayError::Unimplemented(
        "operation without an open handle (temporary descriptors)",
    ))?;
    handles
        .get(id as usize)
        .and_then(Option::as_ref)
        .map(|h| (id, h))
        .ok_or(ReplayError::UnknownHandle(id))
}

fn timespec(t: &Timestamp) -> TimeSpec {
    TimeSpec::new(t.secs, t.nanos)
}
