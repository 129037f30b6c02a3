//! Emitter for the recorded operation log.
//!
//! Serializes one record per line in the grammar [`crate::reader`] accepts.
//! Printable bytes outside `\` and `"` are written as-is; everything else is
//! escaped, with `\xHH` (lowercase hex) for non-printables, so a log is
//! always an ASCII stream even when payloads are binary.

use std::fmt::Display;
use std::io;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::op::HandleId;
use crate::op::Operation;

pub struct LogWriter<W> {
    out: W,
}

impl<W: Write> LogWriter<W> {
    pub fn new(out: W) -> Self {
        LogWriter { out }
    }

    /// Append one record. Each record is flushed as soon as it is complete,
    /// so the log stays usable if the recorder dies with the application.
    pub fn append(&mut self, op: &Operation) -> io::Result<()> {
        write!(self.out, "({}", op.opcode())?;
        match op {
            Operation::Mkdir { path, mode } => {
                self.path(path)?;
                self.number(mode)?;
            }
            Operation::Unlink { path } | Operation::Rmdir { path } => {
                self.path(path)?;
            }
            Operation::Symlink { target, linkpath } => {
                self.path(target)?;
                self.path(linkpath)?;
            }
            Operation::Rename { from, to } | Operation::Link { from, to } => {
                self.path(from)?;
                self.path(to)?;
            }
            Operation::Chmod { path, mode } => {
                self.path(path)?;
                self.number(mode)?;
            }
            Operation::Chown { path, uid, gid } => {
                self.path(path)?;
                self.number(uid)?;
                self.number(gid)?;
            }
            Operation::Truncate { path, size } => {
                self.path(path)?;
                self.number(size)?;
            }
            Operation::Ftruncate { path, size, handle } => {
                self.path(path)?;
                self.number(size)?;
                self.handle(*handle)?;
            }
            Operation::Create {
                path,
                flags,
                mode,
                handle,
            } => {
                self.path(path)?;
                self.number(flags)?;
                self.number(mode)?;
                self.handle(*handle)?;
            }
            Operation::Open {
                path,
                flags,
                handle,
            } => {
                self.path(path)?;
                self.number(flags)?;
                self.handle(*handle)?;
            }
            Operation::Write {
                path,
                data,
                offset,
                handle,
            } => {
                self.path(path)?;
                self.string(data)?;
                self.number(offset)?;
                self.handle(*handle)?;
            }
            Operation::Release { handle } => {
                self.handle(*handle)?;
            }
            Operation::Fsync {
                path,
                datasync,
                handle,
            } => {
                self.path(path)?;
                self.number(&(*datasync as i32))?;
                self.handle(*handle)?;
            }
            Operation::Utimens { path, atime, mtime } => {
                self.path(path)?;
                self.number(&atime.secs)?;
                self.number(&atime.nanos)?;
                self.number(&mtime.secs)?;
                self.number(&mtime.nanos)?;
            }
        }
        writeln!(self.out, ")")?;
        self.out.flush()
    }

    fn string(&mut self, bytes: &[u8]) -> io::Result<()> {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        self.out.write_all(b" \"")?;
        for &b in bytes {
            match b {
                b'\\' => self.out.write_all(b"\\\\")?,
                b'"' => self.out.write_all(b"\\\"")?,
                b'\n' => self.out.write_all(b"\\n")?,
                32..=126 => self.out.write_all(&[b])?,
                _ => {
                    let escaped = [
                        b'\\',
                        b'x',
                        HEX[usize::from(b >> 4)],
                        HEX[usize::from(b & 0xf)],
                    ];
                    self.out.write_all(&escaped)?;
                }
            }
        }
        self.out.write_all(b"\"")
    }

    fn path(&mut self, path: &Path) -> io::Result<()> {
        self.string(path.as_os_str().as_bytes())
    }

    fn number<T: Display>(&mut self, value: &T) -> io::Result<()> {
        write!(self.out, " {value}")
    }

    fn handle(&mut self, handle: HandleId) -> io::Result<()> {
        match handle {
            Some(id) => self.number(&id),
            None => self.number(&-1),
        }
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use super::*;
    use crate::op::Timestamp;
    use crate::reader::LogReader;

    fn emit(op: &Operation) -> Vec<u8> {
        let mut buf = Vec::new();
        LogWriter::new(&mut buf).append(op).unwrap();
        buf
    }

    #[test]
    fn escaping_matches_grammar() {
        let op = Operation::Write {
            path: PathBuf::from("/f"),
            data: b"a\"b\nc\x00\xffd\\e".to_vec(),
            offset: 8,
            handle: Some(3),
        };
        assert_eq!(
            emit(&op),
            b"(write \"/f\" \"a\\\"b\\nc\\x00\\xffd\\\\e\" 8 3)\n"
        );
    }

    #[test]
    fn sentinel_handle_serializes_as_minus_one() {
        let op = Operation::Fsync {
            path: PathBuf::from("/f"),
            datasync: false,
            handle: None,
        };
        assert_eq!(emit(&op), b"(fsync \"/f\" 0 -1)\n");
    }

    #[test]
    fn reader_accepts_writer_output() {
        let ops = vec![
            Operation::Mkdir {
                path: PathBuf::from("/d"),
                mode: 0o755,
            },
            Operation::Create {
                path: PathBuf::from("/d/x"),
                flags: libc::O_RDWR | libc::O_CREAT,
                mode: 0o644,
                handle: Some(0),
            },
            Operation::Write {
                path: PathBuf::from("/d/x"),
                data: (0u8..=255).collect(),
                offset: 512,
                handle: Some(0),
            },
            Operation::Rename {
                from: PathBuf::from("/d/x"),
                to: PathBuf::from("/d/y"),
            },
            Operation::Utimens {
                path: PathBuf::from("/d/y"),
                atime: Timestamp::new(1, 2),
                mtime: Timestamp::new(-3, 4),
            },
            Operation::Release { handle: Some(0) },
        ];

        let mut buf = Vec::new();
        let mut writer = LogWriter::new(&mut buf);
        for op in &ops {
            writer.append(op).unwrap();
        }

        let decoded: Vec<Operation> = LogReader::new(&buf[..])
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(decoded, ops);
    }
}
