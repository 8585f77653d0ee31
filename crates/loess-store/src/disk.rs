//! Block device contract and the in-memory implementation.

use bytes::Bytes;
use loess_common::Result;
use parking_lot::Mutex;
use std::collections::HashMap;

/// An abstraction over some persistent block-addressed storage.
pub trait Disk {
    /// Returns the natural block size of the device. Reads and writes may
    /// use arbitrary sizes but perform best at this size.
    fn block_size(&self) -> u32;

    /// Returns the data for the given block number, or `None` if nothing
    /// has been written there.
    fn read(&self, block: u32) -> Result<Option<Bytes>>;

    /// Stores the data for the given block number. The operation is atomic
    /// per block: a read sees either the new data or the previous value.
    /// It is also serial across the device: a later write being observed
    /// implies all earlier writes and deletes are observed.
    fn write(&self, block: u32, data: &[u8]) -> Result<()>;

    /// Removes the block. Atomic and serial like `write`; deleting a block
    /// that does not exist is not an error.
    fn delete(&self, block: u32) -> Result<()>;

    /// Returns the id of the largest block ever written, or zero if no
    /// blocks have been written. It never decreases, even after deletes.
    fn max_block(&self) -> Result<u32>;
}

/// An in-memory disk. Blocks live in a map; useful for tests and for
/// running an index without persistence.
#[derive(Debug)]
pub struct MemDisk {
    size: u32,
    inner: Mutex<MemDiskInner>,
}

#[derive(Debug)]
struct MemDiskInner {
    blocks: HashMap<u32, Bytes>,
    max: u32,
}

impl MemDisk {
    /// Creates an in-memory disk with the given block size.
    pub fn new(size: u32) -> MemDisk {
        MemDisk {
            size,
            inner: Mutex::new(MemDiskInner {
                blocks: HashMap::new(),
                max: 0,
            }),
        }
    }

    /// Returns how many blocks currently hold data.
    pub fn len(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    /// Returns true if no blocks hold data.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Disk for MemDisk {
    fn block_size(&self) -> u32 {
        self.size
    }

    fn read(&self, block: u32) -> Result<Option<Bytes>> {
        Ok(self.inner.lock().blocks.get(&block).cloned())
    }

    fn write(&self, block: u32, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.blocks.insert(block, Bytes::copy_from_slice(data));
        if block > inner.max {
            inner.max = block;
        }
        Ok(())
    }

    fn delete(&self, block: u32) -> Result<()> {
        self.inner.lock().blocks.remove(&block);
        Ok(())
    }

    fn max_block(&self) -> Result<u32> {
        Ok(self.inner.lock().max)
    }
}
