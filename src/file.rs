//! Regular-file inode state: the per-sector delayed-writeback cache.
//!
//! Each recorded write is split at sector boundaries. Under the active
//! writeback policy a sector either goes straight to the backing file (as a
//! disk would under memory pressure) or is buffered here until `fsync`
//! replays it, modeling data still sitting in the drive's volatile cache. A
//! simulated power loss throws the buffered sectors away, which is exactly
//! the state an application would find after a real crash.

use std::cmp::max;
use std::cmp::min;
use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::str::FromStr;

use log::info;
use thiserror::Error;

use crate::error::ReplayError;
use crate::error::host_err;

/// Decides, per sector, whether a write is persisted immediately or
/// buffered until the next `fsync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritebackPolicy {
    /// Every sector is written through; nothing is lost on power loss.
    All,
    /// Every sector is buffered; only synchronized data survives.
    None,
    /// Odd-numbered sectors are written through.
    Odd,
    /// Even-numbered sectors are written through.
    Even,
    /// A coin flip per write.
    Random,
}

impl WritebackPolicy {
    fn admits(self, sector_index: u64) -> bool {
        match self {
            WritebackPolicy::All => true,
            WritebackPolicy::None => false,
            WritebackPolicy::Odd => sector_index % 2 == 1,
            WritebackPolicy::Even => sector_index % 2 == 0,
            WritebackPolicy::Random => rand::random(),
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown writeback mode {0:?}, expected one of: all, none, odd, even, random")]
pub struct UnknownWritebackMode(String);

impl FromStr for WritebackPolicy {
    type Err = UnknownWritebackMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(WritebackPolicy::All),
            "none" => Ok(WritebackPolicy::None),
            "odd" => Ok(WritebackPolicy::Odd),
            "even" => Ok(WritebackPolicy::Even),
            "random" => Ok(WritebackPolicy::Random),
            other => Err(UnknownWritebackMode(other.to_owned())),
        }
    }
}

/// Sector cache for one regular file.
///
/// Keys of `unwritten` are sector-aligned byte offsets; each buffer is at
/// most one sector long, shorter only when it covers a tail sector primed
/// by a short read. `BTreeMap` keeps the flush order ascending by offset,
/// so the post-sync file is deterministic regardless of write order.
pub struct FileNode {
    sector_size: u64,
    policy: WritebackPolicy,
    unwritten: BTreeMap<u64, Vec<u8>>,
}

impl FileNode {
    pub fn new(sector_size: u64, policy: WritebackPolicy) -> Self {
        assert!(sector_size > 0, "sector size must be non-zero");
        FileNode {
            sector_size,
            policy,
            unwritten: BTreeMap::new(),
        }
    }

    /// Apply one recorded write, splitting it at sector boundaries.
    ///
    /// Write-through sectors go to `file` at their true offset and are
    /// evicted from the cache if present. Buffered sectors are overlaid in
    /// memory; a partial update of a sector not yet cached first primes the
    /// buffer from the backing file so the surrounding bytes survive the
    /// eventual flush.
    pub fn apply_write(
        &mut self,
        file: &File,
        mut data: &[u8],
        mut offset: u64,
    ) -> Result<(), ReplayError> {
        let sector_size = self.sector_size as usize;
        while !data.is_empty() {
            let sector_index = offset / self.sector_size;
            let offset_in_sector = (offset % self.sector_size) as usize;
            let bytes_in_sector = min(data.len(), sector_size - offset_in_sector);
            let sector_begin = offset - offset_in_sector as u64;

            if self.policy.admits(sector_index) {
                file.write_all_at(&data[..bytes_in_sector], offset)
                    .map_err(|e| host_err("write", e))?;
                self.unwritten.remove(&sector_begin);
            } else {
                let sector = self.unwritten.entry(sector_begin).or_default();
                if sector.is_empty() && (offset_in_sector != 0 || bytes_in_sector != sector_size) {
                    // Not previously cached and not fully overwritten:
                    // read-modify-write. A short read means the sector
                    // hangs off the end of the file; keep the buffer only
                    // as long as what exists plus what we are writing.
                    sector.resize(sector_size, 0);
                    let read = read_all_at(file, sector, sector_begin)
                        .map_err(|e| host_err("write", e))?;
                    sector.resize(max(read, offset_in_sector + bytes_in_sector), 0);
                } else {
                    sector.resize(sector_size, 0);
                }
                sector[offset_in_sector..offset_in_sector + bytes_in_sector]
                    .copy_from_slice(&data[..bytes_in_sector]);
            }

            data = &data[bytes_in_sector..];
            offset += bytes_in_sector as u64;
        }
        Ok(())
    }

    /// Truncation is applied to the backing file immediately and cannot be
    /// undone by a power loss.
    // TODO: journal the pre-truncate tail so an unsynchronized truncate can
    // be rolled back in forget_unpersisted.
    pub fn apply_truncate(&mut self, file: &File, size: u64) -> Result<(), ReplayError> {
        file.set_len(size).map_err(|e| host_err("ftruncate", e))
    }

    /// Flush every buffered sector, ascending by offset, then forget them.
    /// On a host error the cache is left as it was.
    pub fn synchronize(&mut self, file: &File) -> Result<(), ReplayError> {
        for (offset, sector) in &self.unwritten {
            file.write_all_at(sector, *offset)
                .map_err(|e| host_err("fsync", e))?;
        }
        self.unwritten.clear();
        Ok(())
    }

    /// Simulated power loss: every buffered sector is gone.
    pub fn forget_unpersisted(&mut self) {
        if !self.unwritten.is_empty() {
            info!(
                "forgot {} unsynchronized sector(s) due to power loss",
                self.unwritten.len()
            );
        }
        self.unwritten.clear();
    }

    /// Number of sectors currently buffered and at risk.
    pub fn unpersisted_sectors(&self) -> usize {
        self.unwritten.len()
    }
}

/// Like `pread` in a loop: tolerate short reads, stop at end of file.
fn read_all_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod test {
    use super::*;

    fn read_back(file: &File) -> Vec<u8> {
        let len = file.metadata().unwrap().len() as usize;
        let mut buf = vec![0; len];
        let got = read_all_at(file, &mut buf, 0).unwrap();
        assert_eq!(got, len);
        buf
    }

    #[test]
    fn all_policy_writes_through() {
        let file = tempfile::tempfile().unwrap();
        let mut node = FileNode::new(4, WritebackPolicy::All);
        node.apply_write(&file, b"hello", 0).unwrap();
        assert_eq!(read_back(&file), b"hello");
        assert_eq!(node.unpersisted_sectors(), 0);
    }

    #[test]
    fn none_policy_buffers_until_sync() {
        let file = tempfile::tempfile().unwrap();
        let mut node = FileNode::new(4, WritebackPolicy::None);
        node.apply_write(&file, b"hello", 0).unwrap();
        assert_eq!(read_back(&file), b"");
        assert_eq!(node.unpersisted_sectors(), 2);

        node.synchronize(&file).unwrap();
        assert_eq!(read_back(&file), b"hello");
        assert_eq!(node.unpersisted_sectors(), 0);
    }

    #[test]
    fn power_loss_discards_buffered_sectors() {
        let file = tempfile::tempfile().unwrap();
        let mut node = FileNode::new(4, WritebackPolicy::None);
        node.apply_write(&file, b"hello", 0).unwrap();
        node.forget_unpersisted();
        assert_eq!(read_back(&file), b"");
        assert_eq!(node.unpersisted_sectors(), 0);
    }

    #[test]
    fn odd_policy_persists_only_odd_sectors() {
        let file = tempfile::tempfile().unwrap();
        let mut node = FileNode::new(4, WritebackPolicy::Odd);
        node.apply_write(&file, b"ABCDEFGH", 0).unwrap();
        // Sector 1 went through, sector 0 stayed buffered; the hole reads
        // back as zeros.
        assert_eq!(read_back(&file), b"\0\0\0\0EFGH");
        assert_eq!(node.unpersisted_sectors(), 1);

        node.forget_unpersisted();
        assert_eq!(read_back(&file), b"\0\0\0\0EFGH");
    }

    #[test]
    fn even_policy_persists_only_even_sectors() {
        let file = tempfile::tempfile().unwrap();
        let mut node = FileNode::new(4, WritebackPolicy::Even);
        node.apply_write(&file, b"ABCDEFGH", 0).unwrap();
        assert_eq!(read_back(&file), b"ABCD");
        assert_eq!(node.unpersisted_sectors(), 1);
    }

    #[test]
    fn partial_write_primes_sector_from_backing_file() {
        let file = tempfile::tempfile().unwrap();
        file.write_all_at(b"XXXXXXXX", 0).unwrap();

        let mut node = FileNode::new(8, WritebackPolicy::None);
        node.apply_write(&file, b"yy", 3).unwrap();
        // Backing file untouched until sync.
        assert_eq!(read_back(&file), b"XXXXXXXX");

        node.synchronize(&file).unwrap();
        assert_eq!(read_back(&file), b"XXXyyXXX");
    }

    #[test]
    fn tail_sector_prime_tolerates_short_read() {
        let file = tempfile::tempfile().unwrap();
        file.write_all_at(b"abc", 0).unwrap();

        let mut node = FileNode::new(8, WritebackPolicy::None);
        node.apply_write(&file, b"Z", 1).unwrap();
        node.synchronize(&file).unwrap();
        // The buffer must not grow the file past what existed plus the
        // bytes written.
        assert_eq!(read_back(&file), b"aZc");
    }

    #[test]
    fn write_past_end_of_file_buffers_without_priming_noise() {
        let file = tempfile::tempfile().unwrap();
        let mut node = FileNode::new(4, WritebackPolicy::None);
        node.apply_write(&file, b"zz", 9).unwrap();
        node.synchronize(&file).unwrap();
        assert_eq!(read_back(&file), b"\0\0\0\0\0\0\0\0\0zz");
    }

    #[test]
    fn overlapping_writes_coalesce_in_cache() {
        let file = tempfile::tempfile().unwrap();
        let mut node = FileNode::new(4, WritebackPolicy::None);
        node.apply_write(&file, b"AAAA", 0).unwrap();
        node.apply_write(&file, b"bb", 1).unwrap();
        assert_eq!(node.unpersisted_sectors(), 1);
        node.synchronize(&file).unwrap();
        assert_eq!(read_back(&file), b"AbbA");
    }

    #[test]
    fn writeback_mode_parses() {
        assert_eq!("all".parse::<WritebackPolicy>().unwrap(), WritebackPolicy::All);
        assert_eq!("odd".parse::<WritebackPolicy>().unwrap(), WritebackPolicy::Odd);
        assert!("sometimes".parse::<WritebackPolicy>().is_err());
    }
}
