//! The recorder: a passthrough FUSE filesystem that logs every mutation.
//!
//! Everything is forwarded to the real filesystem under `underlying_dir`;
//! each *successful* mutating call additionally appends one record to the
//! operation log, in the grammar [`crate::reader`] consumes. Reads and
//! lookups are forwarded without being logged. The filesystem is meant to
//! be mounted single-threaded so that the log order is the order the
//! application's operations actually completed in.
//!
//! Paths are tracked mount-relative (rooted at `/`), which is exactly the
//! shape the replayer expects to re-root under its target directory.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::ffi::OsString;
use std::fs;
use std::fs::DirBuilder;
use std::fs::File;
use std::fs::OpenOptions;
use std::fs::Permissions;
use std::io;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::fs::FileExt;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use fuser::FileAttr;
use fuser::FileType;
use fuser::Filesystem;
use fuser::KernelConfig;
use fuser::ReplyAttr;
use fuser::ReplyCreate;
use fuser::ReplyData;
use fuser::ReplyDirectory;
use fuser::ReplyEmpty;
use fuser::ReplyEntry;
use fuser::ReplyOpen;
use fuser::ReplyWrite;
use fuser::Request;
use fuser::TimeOrNow;
use libc::c_int;
use log::debug;
use log::error;
use log::warn;
use nix::sys::time::TimeSpec;
use nix::unistd::AccessFlags;

use crate::op::HandleId;
use crate::op::Operation;
use crate::op::Timestamp;
use crate::writer::LogWriter;

const TTL: Duration = Duration::from_secs(1);

/// One open file: the backing descriptor plus the recorded path it was
/// opened under (the path that ends up on `write`/`fsync` log lines).
struct OpenFile {
    file: File,
    path: PathBuf,
}

struct DirEntrySnapshot {
    ino: u64,
    kind: FileType,
    name: OsString,
}

/// Passthrough filesystem over `underlying_dir` that appends one log
/// record per successful mutation.
pub struct Recorder<W: Write> {
    underlying: PathBuf,
    log: LogWriter<W>,
    /// Mount-relative path for every inode number we have handed out, and
    /// the reverse. Root is ino 1, path `/`.
    inode_paths: HashMap<u64, PathBuf>,
    path_inodes: HashMap<PathBuf, u64>,
    next_ino: u64,
    open_files: HashMap<u64, OpenFile>,
    open_dirs: HashMap<u64, Vec<DirEntrySnapshot>>,
    next_fh: u64,
}

impl<W: Write> Recorder<W> {
    pub fn new(underlying: impl Into<PathBuf>, log: LogWriter<W>) -> Self {
        let mut recorder = Recorder {
            underlying: underlying.into(),
            log,
            inode_paths: HashMap::new(),
            path_inodes: HashMap::new(),
            next_ino: 1,
            open_files: HashMap::new(),
            open_dirs: HashMap::new(),
            next_fh: 0,
        };
        // The root must come out as FUSE_ROOT_ID.
        let root = recorder.assign_ino(PathBuf::from("/"));
        assert_eq!(root, 1);
        recorder
    }

    /// Recorded (mount-relative) path -> real path under the workdir.
    fn physical(&self, recorded: &Path) -> PathBuf {
        let mut joined = OsString::from(self.underlying.as_os_str());
        joined.push(recorded.as_os_str());
        PathBuf::from(joined)
    }

    fn recorded_path(&self, ino: u64) -> Option<PathBuf> {
        self.inode_paths.get(&ino).cloned()
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.inode_paths.get(&parent).map(|p| p.join(name))
    }

    fn assign_ino(&mut self, recorded: PathBuf) -> u64 {
        if let Some(ino) = self.path_inodes.get(&recorded) {
            return *ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.path_inodes.insert(recorded.clone(), ino);
        self.inode_paths.insert(ino, recorded);
        ino
    }

    fn forget_path(&mut self, recorded: &Path) {
        if let Some(ino) = self.path_inodes.remove(recorded) {
            self.inode_paths.remove(&ino);
        }
    }

    /// Rewrite the path maps after a rename, including everything that
    /// lived below a renamed directory.
    fn rename_tree(&mut self, from: &Path, to: &Path) {
        let mut moved = Vec::new();
        for (ino, path) in &self.inode_paths {
            if let Ok(rest) = path.strip_prefix(from) {
                let new_path = if rest.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(rest)
                };
                moved.push((*ino, new_path));
            }
        }
        for (ino, new_path) in moved {
            if let Some(old) = self.inode_paths.insert(ino, new_path.clone()) {
                self.path_inodes.remove(&old);
            }
            self.path_inodes.insert(new_path, ino);
        }
    }

    fn append(&mut self, op: Operation) -> Result<(), c_int> {
        self.log.append(&op).map_err(|e| {
            error!("cannot append to operation log: {e}");
            libc::EIO
        })
    }

    fn next_handle(&mut self) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        fh
    }
}

fn errno_of(e: &io::Error) -> c_int {
    e.raw_os_error().unwrap_or(libc::EIO)
}

fn handle_id(fh: u64) -> HandleId {
    u32::try_from(fh).ok()
}

fn kind_of(t: fs::FileType) -> FileType {
    if t.is_symlink() {
        FileType::Symlink
    } else if t.is_dir() {
        FileType::Directory
    } else if t.is_fifo() {
        FileType::NamedPipe
    } else if t.is_char_device() {
        FileType::CharDevice
    } else if t.is_block_device() {
        FileType::BlockDevice
    } else if t.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

fn attr_from(meta: &fs::Metadata, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: meta.size(),
        blocks: meta.blocks(),
        atime: meta.accessed().unwrap_or(UNIX_EPOCH),
        mtime: meta.modified().unwrap_or(UNIX_EPOCH),
        ctime: UNIX_EPOCH + Duration::from_secs(meta.ctime().max(0) as u64),
        crtime: meta.created().unwrap_or(UNIX_EPOCH),
        kind: kind_of(meta.file_type()),
        perm: (meta.permissions().mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

/// Map FUSE open flags onto `OpenOptions`, the way the kernel expects the
/// descriptor to behave.
fn open_options(flags: i32) -> Result<OpenOptions, c_int> {
    let mut options = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_RDONLY => {
            options.read(true);
        }
        libc::O_WRONLY => {
            options.write(true);
        }
        libc::O_RDWR => {
            options.read(true).write(true);
        }
        _ => return Err(libc::EINVAL),
    }
    options.append(flags & libc::O_APPEND != 0);
    options.truncate(flags & libc::O_TRUNC != 0);
    Ok(options)
}

/// Resolved `utimensat` argument: a concrete time, or the kernel's
/// "leave it alone" sentinel.
fn utimens_arg(t: Option<TimeOrNow>) -> Timestamp {
    match t {
        None => Timestamp::new(0, libc::UTIME_OMIT as i64),
        Some(TimeOrNow::Now) => system_timestamp(SystemTime::now()),
        Some(TimeOrNow::SpecificTime(st)) => system_timestamp(st),
    }
}

fn system_timestamp(st: SystemTime) -> Timestamp {
    match st.duration_since(UNIX_EPOCH) {
        Ok(d) => Timestamp::new(d.as_secs() as i64, d.subsec_nanos() as i64),
        Err(e) => {
            let d = e.duration();
            Timestamp::new(-(d.as_secs() as i64), d.subsec_nanos() as i64)
        }
    }
}

fn timespec(t: Timestamp) -> TimeSpec {
    TimeSpec::new(t.secs, t.nanos)
}

impl<W: Write> Filesystem for Recorder<W> {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        debug!("recording into {:?}", self.underlying);
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(recorded) = self.child_path(parent, name) else {
            return reply.error(libc::ENOENT);
        };
        match fs::symlink_metadata(self.physical(&recorded)) {
            Ok(meta) => {
                let ino = self.assign_ino(recorded);
                reply.entry(&TTL, &attr_from(&meta, ino), 0);
            }
            Err(e) => {
                if e.kind() == io::ErrorKind::NotFound {
                    self.forget_path(&recorded);
                }
                reply.error(errno_of(&e));
            }
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(recorded) = self.recorded_path(ino) else {
            return reply.error(libc::ENOENT);
        };
        match fs::symlink_metadata(self.physical(&recorded)) {
            Ok(meta) => reply.attr(&TTL, &attr_from(&meta, ino)),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(recorded) = self.recorded_path(ino) else {
            return reply.error(libc::ENOENT);
        };
        match fs::read_link(self.physical(&recorded)) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(recorded) = self.child_path(parent, name) else {
            return reply.error(libc::ENOENT);
        };
        let mode = mode & !umask;
        let physical = self.physical(&recorded);
        if let Err(e) = DirBuilder::new().mode(mode).create(&physical) {
            return reply.error(errno_of(&e));
        }
        if let Err(errno) = self.append(Operation::Mkdir {
            path: recorded.clone(),
            mode,
        }) {
            return reply.error(errno);
        }
        let ino = self.assign_ino(recorded);
        match fs::symlink_metadata(&physical) {
            Ok(meta) => reply.entry(&TTL, &attr_from(&meta, ino), 0),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(recorded) = self.child_path(parent, name) else {
            return reply.error(libc::ENOENT);
        };
        if let Err(e) = fs::remove_file(self.physical(&recorded)) {
            return reply.error(errno_of(&e));
        }
        if let Err(errno) = self.append(Operation::Unlink {
            path: recorded.clone(),
        }) {
            return reply.error(errno);
        }
        self.forget_path(&recorded);
        reply.ok();
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(recorded) = self.child_path(parent, name) else {
            return reply.error(libc::ENOENT);
        };
        if let Err(e) = fs::remove_dir(self.physical(&recorded)) {
            return reply.error(errno_of(&e));
        }
        if let Err(errno) = self.append(Operation::Rmdir {
            path: recorded.clone(),
        }) {
            return reply.error(errno);
        }
        self.forget_path(&recorded);
        reply.ok();
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Some(recorded) = self.child_path(parent, link_name) else {
            return reply.error(libc::ENOENT);
        };
        let physical = self.physical(&recorded);
        if let Err(e) = std::os::unix::fs::symlink(target, &physical) {
            return reply.error(errno_of(&e));
        }
        if let Err(errno) = self.append(Operation::Symlink {
            target: target.to_path_buf(),
            linkpath: recorded.clone(),
        }) {
            return reply.error(errno);
        }
        let ino = self.assign_ino(recorded);
        match fs::symlink_metadata(&physical) {
            Ok(meta) => reply.entry(&TTL, &attr_from(&meta, ino), 0),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(from), Some(to)) = (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) else {
            return reply.error(libc::ENOENT);
        };
        if let Err(e) = fs::rename(self.physical(&from), self.physical(&to)) {
            return reply.error(errno_of(&e));
        }
        if let Err(errno) = self.append(Operation::Rename {
            from: from.clone(),
            to: to.clone(),
        }) {
            return reply.error(errno);
        }
        self.rename_tree(&from, &to);
        reply.ok();
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let (Some(from), Some(to)) = (
            self.recorded_path(ino),
            self.child_path(newparent, newname),
        ) else {
            return reply.error(libc::ENOENT);
        };
        let physical_to = self.physical(&to);
        if let Err(e) = fs::hard_link(self.physical(&from), &physical_to) {
            return reply.error(errno_of(&e));
        }
        if let Err(errno) = self.append(Operation::Link {
            from,
            to: to.clone(),
        }) {
            return reply.error(errno);
        }
        // Tracked as a fresh inode: paths are the identity here, the host
        // keeps the two names backed by one real inode either way.
        let new_ino = self.assign_ino(to);
        match fs::symlink_metadata(&physical_to) {
            Ok(meta) => reply.entry(&TTL, &attr_from(&meta, new_ino), 0),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(recorded) = self.recorded_path(ino) else {
            return reply.error(libc::ENOENT);
        };
        let physical = self.physical(&recorded);

        // FUSE funnels chmod/chown/truncate/utimens through one setattr
        // call; the log keeps them as the distinct operations they are.
        if let Some(mode) = mode {
            if let Err(e) = fs::set_permissions(&physical, Permissions::from_mode(mode)) {
                return reply.error(errno_of(&e));
            }
            if let Err(errno) = self.append(Operation::Chmod {
                path: recorded.clone(),
                mode,
            }) {
                return reply.error(errno);
            }
        }

        if uid.is_some() || gid.is_some() {
            if let Err(e) = std::os::unix::fs::chown(&physical, uid, gid) {
                return reply.error(errno_of(&e));
            }
            if let Err(errno) = self.append(Operation::Chown {
                path: recorded.clone(),
                // Unset halves are recorded as the no-change value the
                // host call understands.
                uid: uid.unwrap_or(u32::MAX),
                gid: gid.unwrap_or(u32::MAX),
            }) {
                return reply.error(errno);
            }
        }

        if let Some(size) = size {
            let via_handle = fh.filter(|fh| self.open_files.contains_key(fh));
            match via_handle {
                Some(fh) => {
                    if let Some(of) = self.open_files.get(&fh) {
                        if let Err(e) = of.file.set_len(size) {
                            return reply.error(errno_of(&e));
                        }
                    }
                    if let Err(errno) = self.append(Operation::Ftruncate {
                        path: recorded.clone(),
                        size,
                        handle: handle_id(fh),
                    }) {
                        return reply.error(errno);
                    }
                }
                None => {
                    if let Err(e) = nix::unistd::truncate(&physical, size as i64) {
                        return reply.error(e as c_int);
                    }
                    if let Err(errno) = self.append(Operation::Truncate {
                        path: recorded.clone(),
                        size,
                    }) {
                        return reply.error(errno);
                    }
                }
            }
        }

        if atime.is_some() || mtime.is_some() {
            let atime = utimens_arg(atime);
            let mtime = utimens_arg(mtime);
            if let Err(e) = nix::sys::stat::utimensat(
                nix::fcntl::AT_FDCWD,
                &physical,
                &timespec(atime),
                &timespec(mtime),
                nix::sys::stat::UtimensatFlags::FollowSymlink,
            ) {
                return reply.error(e as c_int);
            }
            if let Err(errno) = self.append(Operation::Utimens {
                path: recorded.clone(),
                atime,
                mtime,
            }) {
                return reply.error(errno);
            }
        }

        match fs::symlink_metadata(&physical) {
            Ok(meta) => reply.attr(&TTL, &attr_from(&meta, ino)),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(recorded) = self.recorded_path(ino) else {
            return reply.error(libc::ENOENT);
        };
        let options = match open_options(flags) {
            Ok(options) => options,
            Err(errno) => return reply.error(errno),
        };
        let file = match options.open(self.physical(&recorded)) {
            Ok(file) => file,
            Err(e) => return reply.error(errno_of(&e)),
        };
        let fh = self.next_handle();
        if let Err(errno) = self.append(Operation::Open {
            path: recorded.clone(),
            flags,
            handle: handle_id(fh),
        }) {
            return reply.error(errno);
        }
        self.open_files.insert(
            fh,
            OpenFile {
                file,
                path: recorded,
            },
        );
        reply.opened(fh, 0);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(recorded) = self.child_path(parent, name) else {
            return reply.error(libc::ENOENT);
        };
        let mode = mode & !umask;
        let mut options = match open_options(flags) {
            Ok(options) => options,
            Err(errno) => return reply.error(errno),
        };
        options.create(true).create_new(flags & libc::O_EXCL != 0);
        options.mode(mode);

        let physical = self.physical(&recorded);
        let file = match options.open(&physical) {
            Ok(file) => file,
            Err(e) => return reply.error(errno_of(&e)),
        };
        let fh = self.next_handle();
        if let Err(errno) = self.append(Operation::Create {
            path: recorded.clone(),
            flags,
            mode,
            handle: handle_id(fh),
        }) {
            return reply.error(errno);
        }
        let ino = self.assign_ino(recorded.clone());
        self.open_files.insert(
            fh,
            OpenFile {
                file,
                path: recorded,
            },
        );
        match fs::symlink_metadata(&physical) {
            Ok(meta) => reply.created(&TTL, &attr_from(&meta, ino), 0, fh, 0),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(of) = self.open_files.get(&fh) else {
            return reply.error(libc::EBADF);
        };
        let mut buf = vec![0; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match of.file.read_at(&mut buf[filled..], offset as u64 + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return reply.error(errno_of(&e)),
            }
        }
        reply.data(&buf[..filled]);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let path = match self.open_files.get(&fh) {
            Some(of) => {
                if let Err(e) = of.file.write_all_at(data, offset as u64) {
                    return reply.error(errno_of(&e));
                }
                of.path.clone()
            }
            None => return reply.error(libc::EBADF),
        };
        if let Err(errno) = self.append(Operation::Write {
            path,
            data: data.to_vec(),
            offset: offset as u64,
            handle: handle_id(fh),
        }) {
            return reply.error(errno);
        }
        reply.written(data.len() as u32);
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.open_files.remove(&fh) {
            // Dropping the entry closed the descriptor.
            Some(_) => {
                if let Err(errno) = self.append(Operation::Release {
                    handle: handle_id(fh),
                }) {
                    return reply.error(errno);
                }
                reply.ok();
            }
            None => reply.error(libc::EBADF),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let path = match self.open_files.get(&fh) {
            Some(of) => {
                let result = if datasync {
                    of.file.sync_data()
                } else {
                    of.file.sync_all()
                };
                if let Err(e) = result {
                    return reply.error(errno_of(&e));
                }
                of.path.clone()
            }
            None => return reply.error(libc::EBADF),
        };
        if let Err(errno) = self.append(Operation::Fsync {
            path,
            datasync,
            handle: handle_id(fh),
        }) {
            return reply.error(errno);
        }
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(recorded) = self.recorded_path(ino) else {
            return reply.error(libc::ENOENT);
        };
        let physical = self.physical(&recorded);
        let read_dir = match fs::read_dir(&physical) {
            Ok(read_dir) => read_dir,
            Err(e) => return reply.error(errno_of(&e)),
        };

        let parent_ino = recorded
            .parent()
            .and_then(|p| self.path_inodes.get(p).copied())
            .unwrap_or(ino);
        let mut entries = vec![
            DirEntrySnapshot {
                ino,
                kind: FileType::Directory,
                name: OsString::from("."),
            },
            DirEntrySnapshot {
                ino: parent_ino,
                kind: FileType::Directory,
                name: OsString::from(".."),
            },
        ];
        for entry in read_dir {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => return reply.error(errno_of(&e)),
            };
            let name = entry.file_name();
            let kind = entry
                .file_type()
                .map(kind_of)
                .unwrap_or(FileType::RegularFile);
            let child_ino = self.assign_ino(recorded.join(&name));
            entries.push(DirEntrySnapshot {
                ino: child_ino,
                kind,
                name,
            });
        }

        let fh = self.next_handle();
        self.open_dirs.insert(fh, entries);
        reply.opened(fh, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(entries) = self.open_dirs.get(&fh) else {
            warn!("readdir on unknown dir handle {fh}");
            return reply.error(libc::EBADF);
        };
        for (i, entry) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(entry.ino, (i + 1) as i64, entry.kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        match self.open_dirs.remove(&fh) {
            Some(_) => reply.ok(),
            None => reply.error(libc::EBADF),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(recorded) = self.recorded_path(ino) else {
            return reply.error(libc::ENOENT);
        };
        match nix::unistd::access(
            &self.physical(&recorded),
            AccessFlags::from_bits_truncate(mask),
        ) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e as c_int),
        }
    }

    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        // Plain allocation is forwarded (and, like reads, not logged);
        // punch-hole and friends are not supported.
        if mode != 0 {
            return reply.error(libc::EOPNOTSUPP);
        }
        let Some(of) = self.open_files.get(&fh) else {
            return reply.error(libc::EBADF);
        };
        match nix::fcntl::posix_fallocate(&of.file, offset, length) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e as c_int),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn recorder() -> Recorder<Vec<u8>> {
        Recorder::new("/backing", LogWriter::new(Vec::new()))
    }

    #[test]
    fn root_is_ino_one() {
        let r = recorder();
        assert_eq!(r.recorded_path(1), Some(PathBuf::from("/")));
    }

    #[test]
    fn physical_paths_are_rooted_in_the_workdir() {
        let r = recorder();
        assert_eq!(r.physical(Path::new("/d/x")), PathBuf::from("/backing/d/x"));
    }

    #[test]
    fn assign_ino_is_stable_per_path() {
        let mut r = recorder();
        let a = r.assign_ino(PathBuf::from("/a"));
        let b = r.assign_ino(PathBuf::from("/b"));
        assert_ne!(a, b);
        assert_eq!(r.assign_ino(PathBuf::from("/a")), a);
    }

    #[test]
    fn rename_tree_moves_descendants() {
        let mut r = recorder();
        let dir = r.assign_ino(PathBuf::from("/d"));
        let child = r.assign_ino(PathBuf::from("/d/x"));
        let other = r.assign_ino(PathBuf::from("/dd/y"));

        r.rename_tree(Path::new("/d"), Path::new("/e"));
        assert_eq!(r.recorded_path(dir), Some(PathBuf::from("/e")));
        assert_eq!(r.recorded_path(child), Some(PathBuf::from("/e/x")));
        // A sibling that merely shares the name prefix is untouched.
        assert_eq!(r.recorded_path(other), Some(PathBuf::from("/dd/y")));
        assert_eq!(r.path_inodes.get(Path::new("/e/x")), Some(&child));
        assert!(!r.path_inodes.contains_key(Path::new("/d/x")));
    }
}
