//! Streaming reader for the recorded operation log.
//!
//! The log is an ASCII stream of one s-expression per line:
//! `(` *opcode* *args...* `)`. String arguments are double-quoted with the
//! escapes `\\`, `\"`, `\n` and `\xHH` (two lowercase hex digits) and carry
//! both paths and raw write payloads; integer arguments are signed decimal.
//! The writer in [`crate::writer`] emits exactly this grammar; the two must
//! stay in lockstep.

use std::ffi::OsString;
use std::io;
use std::io::Read;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;

use crate::error::Error;
use crate::error::ParseError;
use crate::op::HandleId;
use crate::op::Operation;
use crate::op::Timestamp;

/// Pull parser yielding one [`Operation`] per log record.
///
/// Reads one byte at a time; hand it something buffered (a `BufReader`, or
/// a byte slice). A malformed record puts the stream into a failure state:
/// the error names the 1-based record number, and further reads are not
/// meaningful. End of input between records is a clean termination.
pub struct LogReader<R> {
    inner: R,
    peeked: Option<u8>,
    line: u64,
}

impl<R: Read> LogReader<R> {
    pub fn new(inner: R) -> Self {
        LogReader {
            inner,
            peeked: None,
            line: 0,
        }
    }

    /// 1-based number of the record most recently started.
    pub fn line(&self) -> u64 {
        self.line
    }

    /// Read the next record, or `None` at a clean end of stream.
    pub fn next_op(&mut self) -> Result<Option<Operation>, Error> {
        self.read_record().map_err(|source| Error::Parse {
            line: self.line,
            source,
        })
    }

    fn read_record(&mut self) -> Result<Option<Operation>, ParseError> {
        let c = loop {
            match self.next_byte()? {
                None => return Ok(None),
                Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r') => continue,
                Some(b) => break b,
            }
        };
        self.line += 1;
        if c != b'(' {
            return Err(ParseError::ExpectedRecord);
        }

        let opcode = self.read_symbol()?;
        let op = match opcode.as_str() {
            "mkdir" => Operation::Mkdir {
                path: self.read_path()?,
                mode: self.read_u32()?,
            },
            "unlink" => Operation::Unlink {
                path: self.read_path()?,
            },
            "rmdir" => Operation::Rmdir {
                path: self.read_path()?,
            },
            "symlink" => Operation::Symlink {
                target: self.read_path()?,
                linkpath: self.read_path()?,
            },
            "rename" => Operation::Rename {
                from: self.read_path()?,
                to: self.read_path()?,
            },
            "link" => Operation::Link {
                from: self.read_path()?,
                to: self.read_path()?,
            },
            "chmod" => Operation::Chmod {
                path: self.read_path()?,
                mode: self.read_u32()?,
            },
            "chown" => Operation::Chown {
                path: self.read_path()?,
                uid: self.read_u32()?,
                gid: self.read_u32()?,
            },
            "truncate" => Operation::Truncate {
                path: self.read_path()?,
                size: self.read_u64()?,
            },
            "ftruncate" => Operation::Ftruncate {
                path: self.read_path()?,
                size: self.read_u64()?,
                handle: self.read_handle()?,
            },
            "create" => Operation::Create {
                path: self.read_path()?,
                flags: self.read_i32()?,
                mode: self.read_u32()?,
                handle: self.read_handle()?,
            },
            "open" => Operation::Open {
                path: self.read_path()?,
                flags: self.read_i32()?,
                handle: self.read_handle()?,
            },
            "write" => Operation::Write {
                path: self.read_path()?,
                data: self.read_string()?,
                offset: self.read_u64()?,
                handle: self.read_handle()?,
            },
            "release" => Operation::Release {
                handle: self.read_handle()?,
            },
            "fsync" => Operation::Fsync {
                path: self.read_path()?,
                datasync: self.read_i64()? != 0,
                handle: self.read_handle()?,
            },
            "utimens" => Operation::Utimens {
                path: self.read_path()?,
                atime: Timestamp::new(self.read_i64()?, self.read_i64()?),
                mtime: Timestamp::new(self.read_i64()?, self.read_i64()?),
            },
            _ => return Err(ParseError::UnknownOpcode(opcode)),
        };

        self.expect_close()?;
        Ok(Some(op))
    }

    fn next_byte(&mut self) -> Result<Option<u8>, ParseError> {
        if let Some(b) = self.peeked.take() {
            return Ok(Some(b));
        }
        let mut buf = [0u8; 1];
        loop {
            match self.inner.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(buf[0])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ParseError::Io(e)),
            }
        }
    }

    fn unread(&mut self, b: u8) {
        debug_assert!(self.peeked.is_none());
        self.peeked = Some(b);
    }

    fn skip_spaces(&mut self) -> Result<Option<u8>, ParseError> {
        loop {
            match self.next_byte()? {
                Some(b' ') | Some(b'\t') => continue,
                other => return Ok(other),
            }
        }
    }

    fn read_symbol(&mut self) -> Result<String, ParseError> {
        let mut out = Vec::new();
        let mut c = self.skip_spaces()?;
        loop {
            match c {
                None | Some(b' ') | Some(b'\t') => break,
                Some(b')') => {
                    self.unread(b')');
                    break;
                }
                Some(b) => out.push(b),
            }
            c = self.next_byte()?;
        }
        if out.is_empty() {
            return Err(ParseError::ExpectedRecord);
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Quoted, escaped string literal. Used for both paths and binary
    /// payloads, so embedded zero bytes are fine.
    fn read_string(&mut self) -> Result<Vec<u8>, ParseError> {
        match self.skip_spaces()? {
            Some(b'"') => {}
            _ => return Err(ParseError::ExpectedString),
        }
        let mut out = Vec::new();
        loop {
            match self.next_byte()? {
                None => return Err(ParseError::UnterminatedString),
                Some(b'"') => return Ok(out),
                Some(b'\\') => match self.next_byte()? {
                    None => return Err(ParseError::UnterminatedString),
                    Some(b'"') => out.push(b'"'),
                    Some(b'n') => out.push(b'\n'),
                    Some(b'\\') => out.push(b'\\'),
                    Some(b'x') => {
                        let hi = self.next_byte()?.ok_or(ParseError::UnterminatedString)?;
                        let lo = self.next_byte()?.ok_or(ParseError::UnterminatedString)?;
                        let hi = decode_hex_digit(hi).ok_or(ParseError::BadEscape)?;
                        let lo = decode_hex_digit(lo).ok_or(ParseError::BadEscape)?;
                        out.push(hi * 16 + lo);
                    }
                    Some(_) => return Err(ParseError::BadEscape),
                },
                Some(b) => out.push(b),
            }
        }
    }

    fn read_path(&mut self) -> Result<PathBuf, ParseError> {
        Ok(PathBuf::from(OsString::from_vec(self.read_string()?)))
    }

    fn read_i64(&mut self) -> Result<i64, ParseError> {
        let mut digits = String::new();
        let mut c = self.skip_spaces()?;
        if c == Some(b'-') {
            digits.push('-');
            c = self.next_byte()?;
        }
        loop {
            match c {
                Some(b @ b'0'..=b'9') => digits.push(b as char),
                Some(other) => {
                    self.unread(other);
                    break;
                }
                None => break,
            }
            c = self.next_byte()?;
        }
        if digits.is_empty() || digits == "-" {
            return Err(ParseError::ExpectedInteger);
        }
        digits
            .parse::<i64>()
            .map_err(|_| ParseError::IntegerOutOfRange)
    }

    fn read_u32(&mut self) -> Result<u32, ParseError> {
        u32::try_from(self.read_i64()?).map_err(|_| ParseError::IntegerOutOfRange)
    }

    fn read_i32(&mut self) -> Result<i32, ParseError> {
        i32::try_from(self.read_i64()?).map_err(|_| ParseError::IntegerOutOfRange)
    }

    fn read_u64(&mut self) -> Result<u64, ParseError> {
        u64::try_from(self.read_i64()?).map_err(|_| ParseError::IntegerOutOfRange)
    }

    /// Handle IDs are recorded as `-1` when the call had no open handle.
    fn read_handle(&mut self) -> Result<HandleId, ParseError> {
        let raw = self.read_i64()?;
        if raw < 0 {
            Ok(None)
        } else {
            u32::try_from(raw)
                .map(Some)
                .map_err(|_| ParseError::IntegerOutOfRange)
        }
    }

    fn expect_close(&mut self) -> Result<(), ParseError> {
        match self.skip_spaces()? {
            Some(b')') => Ok(()),
            _ => Err(ParseError::ExpectedClose),
        }
    }
}

fn decode_hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        _ => None,
    }
}

impl<R: Read> Iterator for LogReader<R> {
    type Item = Result<Operation, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_op().transpose()
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use super::*;

    fn parse_one(input: &str) -> Operation {
        let mut reader = LogReader::new(input.as_bytes());
        let op = reader.next_op().unwrap().unwrap();
        assert!(reader.next_op().unwrap().is_none());
        op
    }

    fn parse_err(input: &str) -> Error {
        let mut reader = LogReader::new(input.as_bytes());
        loop {
            match reader.next_op() {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("expected a parse failure"),
                Err(e) => return e,
            }
        }
    }

    #[test]
    fn mkdir_record() {
        assert_eq!(
            parse_one("(mkdir \"/d\" 493)\n"),
            Operation::Mkdir {
                path: PathBuf::from("/d"),
                mode: 0o755,
            }
        );
    }

    #[test]
    fn create_and_write_records() {
        let mut reader =
            LogReader::new(&b"(create \"/d/x\" 66 420 3)\n(write \"/d/x\" \"hello\" 0 3)\n"[..]);
        assert_eq!(
            reader.next_op().unwrap().unwrap(),
            Operation::Create {
                path: PathBuf::from("/d/x"),
                flags: 66,
                mode: 0o644,
                handle: Some(3),
            }
        );
        assert_eq!(
            reader.next_op().unwrap().unwrap(),
            Operation::Write {
                path: PathBuf::from("/d/x"),
                data: b"hello".to_vec(),
                offset: 0,
                handle: Some(3),
            }
        );
        assert!(reader.next_op().unwrap().is_none());
    }

    #[test]
    fn string_escapes_decode() {
        let op = parse_one("(write \"/f\" \"a\\\"b\\nc\\x00\\x7fd\\\\e\" 8 0)");
        match op {
            Operation::Write { data, offset, .. } => {
                assert_eq!(data, b"a\"b\nc\x00\x7fd\\e");
                assert_eq!(offset, 8);
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn sentinel_handle_is_none() {
        assert_eq!(
            parse_one("(fsync \"/f\" 1 -1)"),
            Operation::Fsync {
                path: PathBuf::from("/f"),
                datasync: true,
                handle: None,
            }
        );
    }

    #[test]
    fn utimens_record() {
        assert_eq!(
            parse_one("(utimens \"/f\" 100 5 -1 999999999)"),
            Operation::Utimens {
                path: PathBuf::from("/f"),
                atime: Timestamp::new(100, 5),
                mtime: Timestamp::new(-1, 999_999_999),
            }
        );
    }

    #[test]
    fn leading_whitespace_between_records() {
        let mut reader = LogReader::new(&b"\n\n  (unlink \"/a\")\n\t(rmdir \"/b\")\n"[..]);
        assert!(matches!(
            reader.next_op().unwrap().unwrap(),
            Operation::Unlink { .. }
        ));
        assert!(matches!(
            reader.next_op().unwrap().unwrap(),
            Operation::Rmdir { .. }
        ));
        assert!(reader.next_op().unwrap().is_none());
    }

    #[test]
    fn missing_argument_names_line_one() {
        let err = parse_err("(mkdir \"/d\" )");
        assert_eq!(err.line(), 1);
        assert!(matches!(
            err,
            Error::Parse {
                source: ParseError::ExpectedInteger,
                ..
            }
        ));
    }

    #[test]
    fn error_on_third_record_names_line_three() {
        let err = parse_err("(unlink \"/a\")\n(unlink \"/b\")\n(unlink /c)\n");
        assert_eq!(err.line(), 3);
    }

    #[test]
    fn unknown_opcode_rejected() {
        assert!(matches!(
            parse_err("(read \"/f\" \"xx\" 0 3)"),
            Error::Parse {
                source: ParseError::UnknownOpcode(_),
                ..
            }
        ));
    }

    #[test]
    fn uppercase_hex_escape_rejected() {
        assert!(matches!(
            parse_err("(unlink \"/\\xAB\")"),
            Error::Parse {
                source: ParseError::BadEscape,
                ..
            }
        ));
    }

    #[test]
    fn unterminated_string_rejected() {
        assert!(matches!(
            parse_err("(unlink \"/a"),
            Error::Parse {
                source: ParseError::UnterminatedString,
                ..
            }
        ));
    }

    #[test]
    fn missing_close_paren_rejected() {
        assert!(matches!(
            parse_err("(release 3"),
            Error::Parse {
                source: ParseError::ExpectedClose,
                ..
            }
        ));
    }

    #[test]
    fn non_utf8_path_round_trips_as_bytes() {
        let op = parse_one("(unlink \"/\\xff\\xfe\")");
        match op {
            Operation::Unlink { path } => {
                use std::os::unix::ffi::OsStrExt;
                assert_eq!(path.as_os_str().as_bytes(), b"/\xff\xfe");
                assert_ne!(path, Path::new("/"));
            }
            other => panic!("unexpected op {other:?}"),
        }
    }
}
