//! Node cache contract and the provided single-writer implementation.

use crate::disk::Disk;
use crate::lease::Lease;
use crate::replacer::ClockReplacer;
use loess_common::{LoessError, Result};
use loess_node::Node;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use sysinfo::System;
use tracing::{debug, trace};

/// A cache of nodes keyed by block number.
pub trait Cache {
    /// The backing block device type.
    type Disk: Disk;

    /// Returns the backing disk of the cache.
    fn disk(&self) -> &Self::Disk;

    /// Writes back every dirty node currently held, leased or not.
    fn flush(&self) -> Result<()>;

    /// Retrieves the node at the given block, loading it from disk on a
    /// miss. Concurrent gets for the same block lease the same in-memory
    /// instance. It is an error if no node exists for the block.
    fn get(&self, block: u32) -> Result<Lease<'_>>;

    /// Places an externally constructed node in the cache at the given
    /// block. It is an error if the block already has a node.
    fn add(&self, node: Node, block: u32) -> Result<()>;
}

#[derive(Debug)]
struct Slot {
    node: Rc<RefCell<Node>>,
    refs: Cell<u32>,
}

/// The provided cache implementation. Single writer: not thread safe.
///
/// Lease release only drops the refcount; dirty nodes reach disk through
/// [`Cache::flush`] or when they are evicted to make room.
#[derive(Debug)]
pub struct NodeCache<D> {
    disk: D,
    capacity: Option<usize>,
    slots: RefCell<HashMap<u32, Slot>>,
    replacer: RefCell<ClockReplacer>,
}

impl<D: Disk> NodeCache<D> {
    /// Creates a cache with no bound on resident nodes.
    pub fn new(disk: D) -> NodeCache<D> {
        NodeCache {
            disk,
            capacity: None,
            slots: RefCell::new(HashMap::new()),
            replacer: RefCell::new(ClockReplacer::new()),
        }
    }

    /// Creates a cache that holds at most `capacity` nodes, evicting
    /// unleased nodes by clock sweep (dirty ones written back first) to
    /// make room.
    pub fn with_capacity(disk: D, capacity: usize) -> NodeCache<D> {
        NodeCache {
            disk,
            capacity: Some(capacity.max(1)),
            slots: RefCell::new(HashMap::new()),
            replacer: RefCell::new(ClockReplacer::new()),
        }
    }

    /// Creates a cache sized to 25% of available system RAM, with a floor
    /// of 1,000 nodes so low-memory systems still cache usefully.
    pub fn auto_sized(disk: D) -> NodeCache<D> {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let target_bytes = (sys.available_memory() / 4) as usize;
        let capacity = (target_bytes / disk.block_size().max(1) as usize).max(1_000);
        Self::with_capacity(disk, capacity)
    }

    /// Returns how many nodes are resident.
    pub fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    /// Returns true if no nodes are resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the block has a resident node.
    pub fn contains(&self, block: u32) -> bool {
        self.slots.borrow().contains_key(&block)
    }

    fn release(&self, block: u32) -> Result<()> {
        let slots = self.slots.borrow();
        if let Some(slot) = slots.get(&block) {
            let refs = slot.refs.get();
            debug_assert!(refs > 0, "release of unleased block {block}");
            slot.refs.set(refs.saturating_sub(1));
        }
        Ok(())
    }

    fn write_back(&self, block: u32, node: &Rc<RefCell<Node>>) -> Result<()> {
        let mut node = node.borrow_mut();
        if !node.dirty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        node.write(&mut buf);
        self.disk.write(block, &buf)?;
        trace!(block, len = buf.len(), "wrote back node");
        Ok(())
    }

    /// Evicts one unleased node picked by the clock sweep, writing it back
    /// first if dirty. A cache full of leased nodes simply grows past its
    /// capacity.
    fn evict_one(&self, slots: &mut HashMap<u32, Slot>) -> Result<()> {
        let victim = self
            .replacer
            .borrow_mut()
            .evict(|block| slots.get(&block).map_or(true, |slot| slot.refs.get() == 0));

        if let Some(block) = victim {
            if let Some(slot) = slots.remove(&block) {
                self.write_back(block, &slot.node)?;
                debug!(block, "evicted node");
            }
        }
        Ok(())
    }

    fn lease(&self, node: Rc<RefCell<Node>>, block: u32) -> Lease<'_> {
        Lease::new(node, block, Box::new(move |b| self.release(b)))
    }
}

impl<D: Disk> Cache for NodeCache<D> {
    type Disk = D;

    fn disk(&self) -> &D {
        &self.disk
    }

    fn flush(&self) -> Result<()> {
        let slots = self.slots.borrow();
        for (&block, slot) in slots.iter() {
            self.write_back(block, &slot.node)?;
        }
        Ok(())
    }

    fn get(&self, block: u32) -> Result<Lease<'_>> {
        let mut slots = self.slots.borrow_mut();

        if let Some(slot) = slots.get(&block) {
            slot.refs.set(slot.refs.get() + 1);
            let node = slot.node.clone();
            drop(slots);
            self.replacer.borrow_mut().record_access(block);
            return Ok(self.lease(node, block));
        }

        let data = self
            .disk
            .read(block)?
            .ok_or_else(|| LoessError::contract(format!("no node for block {block}")))?;
        let node = Rc::new(RefCell::new(Node::load(data)?));

        if let Some(capacity) = self.capacity {
            if slots.len() >= capacity {
                self.evict_one(&mut slots)?;
            }
        }
        slots.insert(
            block,
            Slot {
                node: node.clone(),
                refs: Cell::new(1),
            },
        );
        drop(slots);
        self.replacer.borrow_mut().record_access(block);
        Ok(self.lease(node, block))
    }

    fn add(&self, node: Node, block: u32) -> Result<()> {
        let mut slots = self.slots.borrow_mut();
        if slots.contains_key(&block) {
            return Err(LoessError::contract(format!(
                "block {block} already has a node"
            )));
        }

        if let Some(capacity) = self.capacity {
            if slots.len() >= capacity {
                self.evict_one(&mut slots)?;
            }
        }
        slots.insert(
            block,
            Slot {
                node: Rc::new(RefCell::new(node)),
                refs: Cell::new(0),
            },
        );
        drop(slots);
        self.replacer.borrow_mut().record_access(block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemDisk;

    fn dirty_node(key: &[u8], value: &[u8]) -> Node {
        let mut node = Node::new(0, 0);
        assert!(node.insert(key, value));
        node
    }

    #[test]
    fn test_cache_get_unknown_block() {
        let cache = NodeCache::new(MemDisk::new(4096));
        let err = cache.get(9).unwrap_err();
        assert!(matches!(err, LoessError::ContractViolation(_)));
    }

    #[test]
    fn test_cache_add_then_get() {
        let cache = NodeCache::new(MemDisk::new(4096));
        cache.add(dirty_node(b"key", b"value"), 2).unwrap();

        let lease = cache.get(2).unwrap();
        assert_eq!(lease.node().borrow().count(), 1);
        lease.close().unwrap();
    }

    #[test]
    fn test_cache_add_occupied_block() {
        let cache = NodeCache::new(MemDisk::new(4096));
        cache.add(Node::new(0, 0), 2).unwrap();
        let err = cache.add(Node::new(0, 0), 2).unwrap_err();
        assert!(matches!(err, LoessError::ContractViolation(_)));
    }

    #[test]
    fn test_cache_gets_share_instance() {
        let cache = NodeCache::new(MemDisk::new(4096));
        cache.add(dirty_node(b"key", b"value"), 3).unwrap();

        let first = cache.get(3).unwrap();
        let second = cache.get(3).unwrap();
        assert!(Rc::ptr_eq(first.node(), second.node()));

        first.close().unwrap();
        second.close().unwrap();
    }

    #[test]
    fn test_cache_flush_writes_dirty_nodes() {
        let cache = NodeCache::new(MemDisk::new(4096));
        cache.add(dirty_node(b"key", b"value"), 2).unwrap();

        cache.flush().unwrap();

        let data = cache.disk().read(2).unwrap().unwrap();
        let node = Node::load(data).unwrap();
        assert_eq!(node.count(), 1);

        // the resident node is clean now; a second flush writes nothing new
        assert!(!cache.get(2).unwrap().node().borrow().dirty());
    }

    #[test]
    fn test_cache_miss_loads_from_disk() {
        let disk = MemDisk::new(4096);
        let mut node = dirty_node(b"persisted", b"yes");
        let mut buf = Vec::new();
        node.write(&mut buf);
        disk.write(5, &buf).unwrap();

        let cache = NodeCache::new(disk);
        assert!(!cache.contains(5));

        let lease = cache.get(5).unwrap();
        {
            let node = lease.node().borrow();
            let entries: Vec<_> = node.iter().map(|e| e.key.to_vec()).collect();
            assert_eq!(entries, vec![b"persisted".to_vec()]);
        }
        lease.close().unwrap();
        assert!(cache.contains(5));
    }

    #[test]
    fn test_cache_eviction_writes_back() {
        let cache = NodeCache::with_capacity(MemDisk::new(4096), 1);
        cache.add(dirty_node(b"first", b"1"), 2).unwrap();
        cache.add(dirty_node(b"second", b"2"), 3).unwrap();

        // block 2 was evicted to make room and must be readable from disk
        assert!(!cache.contains(2));
        let lease = cache.get(2).unwrap();
        {
            let node = lease.node().borrow();
            let keys: Vec<_> = node.iter().map(|e| e.key.to_vec()).collect();
            assert_eq!(keys, vec![b"first".to_vec()]);
        }
        lease.close().unwrap();
    }

    #[test]
    fn test_cache_does_not_evict_leased() {
        let cache = NodeCache::with_capacity(MemDisk::new(4096), 1);
        cache.add(dirty_node(b"pinned", b"1"), 2).unwrap();

        let lease = cache.get(2).unwrap();
        // the only resident node is leased, so the cache grows instead
        cache.add(dirty_node(b"other", b"2"), 3).unwrap();
        assert!(cache.contains(2));
        assert_eq!(cache.len(), 2);
        lease.close().unwrap();
    }

    #[test]
    fn test_cache_release_makes_evictable() {
        let cache = NodeCache::with_capacity(MemDisk::new(4096), 1);
        cache.add(dirty_node(b"a", b"1"), 2).unwrap();

        let lease = cache.get(2).unwrap();
        lease.close().unwrap();

        cache.add(dirty_node(b"b", b"2"), 3).unwrap();
        assert!(!cache.contains(2));
        assert!(cache.contains(3));
    }
}
