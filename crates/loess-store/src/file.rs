//! File-backed block device.
//!
//! Blocks vary in size (a block is written whole but may be shorter than
//! the device's natural size), so the file is an append-only log of
//! records with an in-memory index rebuilt on open. A record is an 8 byte
//! header (block id and payload length, big-endian) followed by the
//! payload; a length of `u32::MAX` marks a delete. The file starts with a
//! 16 byte superblock carrying a magic and the device's block size.

use crate::disk::Disk;
use bytes::Bytes;
use loess_common::{LoessError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

const MAGIC: &[u8; 8] = b"loessdk1";
const SUPERBLOCK_SIZE: u64 = 16;
const RECORD_HEADER_SIZE: u64 = 8;
const DELETE_LEN: u32 = u32::MAX;

/// A persistent disk over a single file.
#[derive(Debug)]
pub struct FileDisk {
    block_size: u32,
    fsync_enabled: bool,
    inner: Mutex<FileDiskInner>,
}

#[derive(Debug)]
struct FileDiskInner {
    file: File,
    /// block id -> (payload offset, payload length)
    index: HashMap<u32, (u64, u32)>,
    max: u32,
    end: u64,
}

impl FileDisk {
    /// Opens or creates a file disk at the given path. An existing file
    /// must carry the same block size it was created with.
    pub fn open(path: impl AsRef<Path>, block_size: u32, fsync_enabled: bool) -> Result<FileDisk> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let file_len = file.metadata()?.len();
        if file_len == 0 {
            let mut superblock = [0u8; SUPERBLOCK_SIZE as usize];
            superblock[0..8].copy_from_slice(MAGIC);
            superblock[8..12].copy_from_slice(&block_size.to_be_bytes());
            file.write_all(&superblock)?;
            if fsync_enabled {
                file.sync_all()?;
            }
            return Ok(FileDisk {
                block_size,
                fsync_enabled,
                inner: Mutex::new(FileDiskInner {
                    file,
                    index: HashMap::new(),
                    max: 0,
                    end: SUPERBLOCK_SIZE,
                }),
            });
        }

        if file_len < SUPERBLOCK_SIZE {
            return Err(LoessError::corrupt("file disk superblock truncated"));
        }
        let mut superblock = [0u8; SUPERBLOCK_SIZE as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut superblock)?;
        if &superblock[0..8] != MAGIC {
            return Err(LoessError::corrupt("file disk magic mismatch"));
        }
        let stored = u32::from_be_bytes([superblock[8], superblock[9], superblock[10], superblock[11]]);
        if stored != block_size {
            return Err(LoessError::contract(format!(
                "file disk block size is {stored}, caller expects {block_size}"
            )));
        }

        let (index, max, end) = Self::replay(&mut file, file_len)?;
        Ok(FileDisk {
            block_size,
            fsync_enabled,
            inner: Mutex::new(FileDiskInner {
                file,
                index,
                max,
                end,
            }),
        })
    }

    /// Scans the record log, keeping the latest record per block. A
    /// truncated tail record is ignored, matching the per-record atomicity
    /// the write path provides.
    fn replay(file: &mut File, file_len: u64) -> Result<(HashMap<u32, (u64, u32)>, u32, u64)> {
        let mut index = HashMap::new();
        let mut max = 0u32;
        let mut pos = SUPERBLOCK_SIZE;

        file.seek(SeekFrom::Start(pos))?;
        while pos + RECORD_HEADER_SIZE <= file_len {
            let mut header = [0u8; RECORD_HEADER_SIZE as usize];
            file.read_exact(&mut header)?;
            let block = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
            let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

            if len == DELETE_LEN {
                index.remove(&block);
                max = max.max(block);
                pos += RECORD_HEADER_SIZE;
                continue;
            }
            if pos + RECORD_HEADER_SIZE + len as u64 > file_len {
                break;
            }
            index.insert(block, (pos + RECORD_HEADER_SIZE, len));
            max = max.max(block);
            pos += RECORD_HEADER_SIZE + len as u64;
            file.seek(SeekFrom::Start(pos))?;
        }

        Ok((index, max, pos))
    }
}

impl Disk for FileDisk {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn read(&self, block: u32) -> Result<Option<Bytes>> {
        let mut inner = self.inner.lock();
        let Some(&(offset, len)) = inner.index.get(&block) else {
            return Ok(None);
        };

        let mut data = vec![0u8; len as usize];
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.read_exact(&mut data)?;
        Ok(Some(Bytes::from(data)))
    }

    fn write(&self, block: u32, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();

        let mut header = [0u8; RECORD_HEADER_SIZE as usize];
        header[0..4].copy_from_slice(&block.to_be_bytes());
        header[4..8].copy_from_slice(&(data.len() as u32).to_be_bytes());

        let end = inner.end;
        inner.file.seek(SeekFrom::Start(end))?;
        inner.file.write_all(&header)?;
        inner.file.write_all(data)?;
        if self.fsync_enabled {
            inner.file.sync_all()?;
        }

        inner
            .index
            .insert(block, (end + RECORD_HEADER_SIZE, data.len() as u32));
        inner.end = end + RECORD_HEADER_SIZE + data.len() as u64;
        inner.max = inner.max.max(block);
        Ok(())
    }

    fn delete(&self, block: u32) -> Result<()> {
        let mut inner = self.inner.lock();

        let mut header = [0u8; RECORD_HEADER_SIZE as usize];
        header[0..4].copy_from_slice(&block.to_be_bytes());
        header[4..8].copy_from_slice(&DELETE_LEN.to_be_bytes());

        let end = inner.end;
        inner.file.seek(SeekFrom::Start(end))?;
        inner.file.write_all(&header)?;
        if self.fsync_enabled {
            inner.file.sync_all()?;
        }

        inner.index.remove(&block);
        inner.end = end + RECORD_HEADER_SIZE;
        inner.max = inner.max.max(block);
        Ok(())
    }

    fn max_block(&self) -> Result<u32> {
        Ok(self.inner.lock().max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn disk_at(dir: &tempfile::TempDir) -> FileDisk {
        FileDisk::open(dir.path().join("blocks.dat"), 4096, false).unwrap()
    }

    #[test]
    fn test_file_disk_write_read() {
        let dir = tempdir().unwrap();
        let disk = disk_at(&dir);

        disk.write(1, b"first").unwrap();
        disk.write(2, b"second").unwrap();

        assert_eq!(&disk.read(1).unwrap().unwrap()[..], b"first");
        assert_eq!(&disk.read(2).unwrap().unwrap()[..], b"second");
        assert!(disk.read(3).unwrap().is_none());
        assert_eq!(disk.max_block().unwrap(), 2);
    }

    #[test]
    fn test_file_disk_overwrite_uses_latest() {
        let dir = tempdir().unwrap();
        let disk = disk_at(&dir);

        disk.write(1, b"old").unwrap();
        disk.write(1, b"newer").unwrap();
        assert_eq!(&disk.read(1).unwrap().unwrap()[..], b"newer");
    }

    #[test]
    fn test_file_disk_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.dat");

        {
            let disk = FileDisk::open(&path, 4096, true).unwrap();
            disk.write(1, b"stale").unwrap();
            disk.write(1, b"kept").unwrap();
            disk.write(7, b"other").unwrap();
            disk.delete(3).unwrap();
        }

        let disk = FileDisk::open(&path, 4096, true).unwrap();
        assert_eq!(&disk.read(1).unwrap().unwrap()[..], b"kept");
        assert_eq!(&disk.read(7).unwrap().unwrap()[..], b"other");
        assert!(disk.read(3).unwrap().is_none());
        assert_eq!(disk.max_block().unwrap(), 7);
    }

    #[test]
    fn test_file_disk_delete() {
        let dir = tempdir().unwrap();
        let disk = disk_at(&dir);

        disk.write(4, b"data").unwrap();
        disk.delete(4).unwrap();
        assert!(disk.read(4).unwrap().is_none());
        // max never decreases
        assert_eq!(disk.max_block().unwrap(), 4);
    }

    #[test]
    fn test_file_disk_block_size_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.dat");
        drop(FileDisk::open(&path, 4096, false).unwrap());

        let err = FileDisk::open(&path, 8192, false).unwrap_err();
        assert!(matches!(err, LoessError::ContractViolation(_)));
    }

    #[test]
    fn test_file_disk_ignores_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.dat");

        {
            let disk = FileDisk::open(&path, 4096, false).unwrap();
            disk.write(1, b"whole").unwrap();
        }

        // simulate a torn write: a header promising more bytes than exist
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            let mut header = [0u8; 8];
            header[0..4].copy_from_slice(&2u32.to_be_bytes());
            header[4..8].copy_from_slice(&100u32.to_be_bytes());
            file.write_all(&header).unwrap();
            file.write_all(b"short").unwrap();
        }

        let disk = FileDisk::open(&path, 4096, false).unwrap();
        assert_eq!(&disk.read(1).unwrap().unwrap()[..], b"whole");
        assert!(disk.read(2).unwrap().is_none());

        // the torn tail is overwritten by the next append
        disk.write(2, b"replaced").unwrap();
        assert_eq!(&disk.read(2).unwrap().unwrap()[..], b"replaced");
    }

    #[test]
    fn test_file_disk_rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.dat");
        std::fs::write(&path, b"not a loess file").unwrap();

        let err = FileDisk::open(&path, 4096, false).unwrap_err();
        assert!(matches!(err, LoessError::CorruptNode { .. }));
    }
}
