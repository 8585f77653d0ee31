//! The write-optimized skip list operator.

use crate::flush::Flusher;
use crate::height::{height, threshold};
use loess_common::{LoessError, Result, INVALID_BLOCK, ROOT_BLOCK};
use loess_node::Node;
use loess_store::{Cache, Disk};
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

/// A write-optimized skip list: an ordered key/value index that buffers
/// writes in a randomized hierarchy of block-sized nodes and flushes them
/// down toward the leaves. It is not thread safe.
#[derive(Debug)]
pub struct SkipList<C: Cache> {
    root: Node,
    cache: C,
    max_block: u32,
    b: u32,
    eps: f64,
    zero: u32,
    later: u32,
}

impl<C: Cache> SkipList<C> {
    /// Returns a skip list over the cache's device with the default
    /// epsilon of 0.5.
    pub fn new(cache: C) -> Result<SkipList<C>> {
        Self::with_epsilon(0.5, cache)
    }

    /// Returns a skip list with the given epsilon, which must obey
    /// 0 < epsilon < 1 and must be the same for every open of the same
    /// device. A root persisted at the root block is reloaded.
    pub fn with_epsilon(eps: f64, cache: C) -> Result<SkipList<C>> {
        if !(eps > 0.0 && eps < 1.0) {
            return Err(LoessError::contract(format!(
                "epsilon out of range: {eps}"
            )));
        }

        let disk = cache.disk();
        let b = disk.block_size();
        let zero = threshold(b, 1.0 - eps);
        let later = threshold(b, eps);
        let max_block = disk.max_block()?.max(ROOT_BLOCK);

        let root = match disk.read(ROOT_BLOCK)? {
            Some(buf) => Node::load(buf)?,
            None => {
                let mut root = Node::new(0, 1);
                root.set_pivot(INVALID_BLOCK);
                root
            }
        };

        Ok(SkipList {
            root,
            cache,
            max_block,
            b,
            eps,
            zero,
            later,
        })
    }

    /// Returns the configured epsilon.
    pub fn epsilon(&self) -> f64 {
        self.eps
    }

    /// Returns the device block size the hierarchy is tuned for.
    pub fn block_size(&self) -> u32 {
        self.b
    }

    /// Returns the largest block allocated so far.
    pub fn max_block(&self) -> u32 {
        self.max_block
    }

    /// Returns the in-memory root node.
    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Returns the cache the skip list operates through.
    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Returns the deterministic height for a key: the topmost level of
    /// the hierarchy the key lives at.
    pub fn key_height(&self, key: &[u8]) -> u32 {
        height(xxh3_64(key), self.zero, self.later)
    }

    /// Associates the value with the key. It is not an error to insert a
    /// key that already exists; the newer value wins.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put(key, value, false)
    }

    /// Removes the key by recording a tombstone that flushes down the
    /// hierarchy like any other write.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.put(key, &[], true)
    }

    /// Returns the data for the key if it exists.
    ///
    /// # Panics
    ///
    /// Point reads are not implemented yet.
    pub fn read(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let _ = key;
        unimplemented!("point reads are not implemented yet")
    }

    /// Returns the first entry sorting after `key` that still carries
    /// `prefix`, if one exists.
    ///
    /// # Panics
    ///
    /// Successor queries are not implemented yet.
    pub fn successor(&mut self, key: &[u8], prefix: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let _ = (key, prefix);
        unimplemented!("successor queries are not implemented yet")
    }

    /// Writes the root to its block and flushes every dirty cached node,
    /// so a fresh operator can reopen the index from the device.
    pub fn sync(&mut self) -> Result<()> {
        if self.root.dirty() {
            let mut buf = Vec::new();
            self.root.write(&mut buf);
            self.cache.disk().write(ROOT_BLOCK, &buf)?;
        }
        self.cache.flush()
    }

    fn put(&mut self, key: &[u8], value: &[u8], tombstone: bool) -> Result<()> {
        // the root must stay strictly taller than every key it buffers
        let h = self.key_height(key);
        while h >= self.root.height() {
            self.grow_root()?;
        }

        if self.root.fits(key, value, self.b) && self.write_root(key, value, tombstone) {
            return Ok(());
        }

        // the root is full: push everything one level down and retry
        self.cache.flush()?;
        self.flush_root()?;
        if self.write_root(key, value, tombstone) {
            return Ok(());
        }

        Err(LoessError::TooLarge {
            key: key.len(),
            value: value.len(),
        })
    }

    fn write_root(&mut self, key: &[u8], value: &[u8], tombstone: bool) -> bool {
        if tombstone {
            self.root.delete(key)
        } else {
            self.root.insert(key, value)
        }
    }

    /// Pushes the current root down one level: it moves to a fresh block
    /// behind the cache, and a new empty root one level taller points at
    /// it.
    fn grow_root(&mut self) -> Result<()> {
        let block = self.max_block + 1;
        let old_height = self.root.height();

        let mut old = std::mem::replace(&mut self.root, Node::new(0, old_height + 1));
        old.mark_dirty();
        self.root.set_pivot(block);
        self.cache.add(old, block)?;
        self.max_block = block;

        debug!(height = old_height + 1, block, "grew root");
        Ok(())
    }

    fn flush_root(&mut self) -> Result<()> {
        debug!(
            height = self.root.height(),
            entries = self.root.count(),
            "flushing root"
        );
        let SkipList {
            root,
            cache,
            max_block,
            b,
            zero,
            later,
            ..
        } = self;
        Flusher::new(&*cache, root, *b, *zero, *later, max_block).run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loess_store::{MemDisk, NodeCache};

    const BLOCK: u32 = 1 << 20;

    fn skiplist() -> SkipList<NodeCache<MemDisk>> {
        SkipList::new(NodeCache::new(MemDisk::new(BLOCK))).unwrap()
    }

    /// Finds a key whose deterministic height is exactly `want`.
    fn key_at_height(sl: &SkipList<NodeCache<MemDisk>>, want: u32) -> Vec<u8> {
        for i in 0u64.. {
            let key = format!("probe-{i}").into_bytes();
            if sl.key_height(&key) == want {
                return key;
            }
        }
        unreachable!()
    }

    #[test]
    fn test_epsilon_validation() {
        for eps in [0.0, 1.0, -0.5, 1.5] {
            let err =
                SkipList::with_epsilon(eps, NodeCache::new(MemDisk::new(BLOCK))).unwrap_err();
            assert!(matches!(err, LoessError::ContractViolation(_)));
        }
    }

    #[test]
    fn test_fresh_root_state() {
        let sl = skiplist();
        assert_eq!(sl.root().height(), 1);
        assert_eq!(sl.root().pivot(), INVALID_BLOCK);
        assert_eq!(sl.max_block(), ROOT_BLOCK);
        assert_eq!(sl.epsilon(), 0.5);
        assert_eq!(sl.block_size(), BLOCK);
    }

    #[test]
    fn test_height_determinism() {
        let sl = skiplist();
        let h = sl.key_height(b"stable key");
        for _ in 0..10 {
            assert_eq!(sl.key_height(b"stable key"), h);
        }
    }

    #[test]
    fn test_insert_stays_in_root() {
        let mut sl = skiplist();
        let key = key_at_height(&sl, 0);
        sl.insert(&key, b"value").unwrap();

        assert_eq!(sl.root().count(), 1);
        // nothing left the operator's memory
        assert!(sl.cache().is_empty());
    }

    #[test]
    fn test_root_growth_monotonicity() {
        let mut sl = skiplist();
        let tall = key_at_height(&sl, 1);

        sl.insert(&tall, b"value").unwrap();
        assert!(sl.root().height() > sl.key_height(&tall));
        assert_eq!(sl.root().height(), 2);

        // the pushed-down root is reachable behind the cache
        assert!(sl.max_block() > ROOT_BLOCK);
        assert_eq!(sl.root().pivot(), sl.max_block());
        let lease = sl.cache().get(sl.root().pivot()).unwrap();
        assert_eq!(lease.node().borrow().height(), 1);
        lease.close().unwrap();

        // heights never shrink the root
        let short = key_at_height(&sl, 0);
        sl.insert(&short, b"value").unwrap();
        assert_eq!(sl.root().height(), 2);
    }

    /// Finds `n` distinct keys whose deterministic height is exactly `want`.
    fn keys_at_height(sl: &SkipList<NodeCache<MemDisk>>, want: u32, n: usize) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut i = 0u64;
        while out.len() < n {
            let key = format!("entry-{i}").into_bytes();
            if sl.key_height(&key) == want {
                out.push(key);
            }
            i += 1;
        }
        out
    }

    #[test]
    fn test_flush_root_distributes_to_lazy_leaf() {
        let mut sl = skiplist();
        let keys = keys_at_height(&sl, 0, 5);

        for key in &keys {
            sl.insert(key, b"value").unwrap();
        }
        assert_eq!(sl.root().count(), 5);

        sl.flush_root().unwrap();

        // height-0 keys all left the root for the freshly allocated leaf
        assert_eq!(sl.root().count(), 0);
        let leaf_block = sl.root().pivot();
        assert_ne!(leaf_block, INVALID_BLOCK);

        let lease = sl.cache().get(leaf_block).unwrap();
        {
            let leaf = lease.node().borrow();
            assert_eq!(leaf.height(), 0);
            let mut found: Vec<Vec<u8>> = leaf.iter().map(|e| e.key.to_vec()).collect();
            let mut expected = keys.clone();
            found.sort();
            expected.sort();
            assert_eq!(found, expected);
        }
        lease.close().unwrap();
    }

    #[test]
    fn test_flush_pushes_into_existing_child() {
        let mut sl = skiplist();
        let tall = key_at_height(&sl, 1);
        sl.insert(&tall, b"tall").unwrap();
        // root grew to height 2; the tall key is buffered in the new root
        assert_eq!(sl.root().count(), 1);

        sl.flush_root().unwrap();

        // the tall key flushed into the height-1 child and was dropped
        // from the root, which only routes through its pivot now
        assert_eq!(sl.root().count(), 0);
        let child_block = sl.root().pivot();
        let lease = sl.cache().get(child_block).unwrap();
        {
            let child = lease.node().borrow();
            let keys: Vec<Vec<u8>> = child.iter().map(|e| e.key.to_vec()).collect();
            assert_eq!(keys, vec![tall.clone()]);
        }
        lease.close().unwrap();
    }

    #[test]
    fn test_delete_buffers_tombstone() {
        let mut sl = skiplist();
        let key = key_at_height(&sl, 0);

        sl.insert(&key, b"value").unwrap();
        sl.delete(&key).unwrap();

        let entries: Vec<_> = sl.root().iter().map(|e| e.entry.tombstone()).collect();
        assert_eq!(entries, vec![true]);
    }

    #[test]
    fn test_sync_persists_root() {
        let mut sl = skiplist();
        let key = key_at_height(&sl, 0);
        sl.insert(&key, b"value").unwrap();
        sl.sync().unwrap();

        let data = sl.cache().disk().read(ROOT_BLOCK).unwrap().unwrap();
        let root = Node::load(data).unwrap();
        assert_eq!(root.count(), 1);
        assert_eq!(root.height(), 1);
    }

    #[test]
    #[should_panic(expected = "not implemented")]
    fn test_read_unimplemented() {
        let mut sl = skiplist();
        let _ = sl.read(b"key");
    }
}
