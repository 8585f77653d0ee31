//! Disk-block buffer nodes.
//!
//! A node is one block worth of buffered writes: a fixed header, the
//! serialized entry tree, and an append-only arena holding the raw key and
//! value bytes. Nodes loaded from disk reference the block buffer directly
//! until the first mutation copies the arena out.
//!
//! On-disk layout (header fields big-endian):
//! ```text
//! offset size  field
//! 0      4     next
//! 4      4     height
//! 8      4     pivot
//! 12     8     btree_size
//! 20     ..    padding to sizeof(tree node), for alignment
//! ..     btree_size   serialized entry tree
//! ..     rest         key/value arena
//! ```

use crate::btree::{BTree, BTreeBulk, BTREE_NODE_SIZE};
use crate::entry::{Entry, KEY_MASK, VALUE_MASK};
use bytes::Bytes;
use loess_common::{LoessError, Result};

/// Bytes of meaningful node header.
pub const NODE_HEADER_SIZE: usize = 20;

/// The header is padded out to one tree node so the slab that follows it
/// stays naturally aligned.
pub const NODE_HEADER_PADDED: usize = BTREE_NODE_SIZE;

/// Reserved growth headroom for a write: an insert can split interior tree
/// nodes, allocating up to log(n) of them. Ten is comfortably past that.
pub const NODE_SLACK: u64 = 10 * BTREE_NODE_SIZE as u64;

/// The key/value arena backing a node's entries. Freshly created nodes own
/// their bytes; loaded nodes borrow the disk buffer until first mutation.
#[derive(Debug)]
enum Arena {
    Owned(Vec<u8>),
    Shared(Bytes),
}

impl Arena {
    fn as_slice(&self) -> &[u8] {
        match self {
            Arena::Owned(buf) => buf,
            Arena::Shared(buf) => buf,
        }
    }

    fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Copy-on-write access for appends.
    fn to_mut(&mut self) -> &mut Vec<u8> {
        if let Arena::Shared(buf) = self {
            let owned = buf.to_vec();
            *self = Arena::Owned(owned);
        }
        match self {
            Arena::Owned(buf) => buf,
            Arena::Shared(_) => unreachable!("arena was just copied out"),
        }
    }
}

/// A buffer node in the flush hierarchy. Height 0 is a leaf; anything
/// taller buffers writes destined for its subtree.
pub struct Node {
    next: u32,
    height: u32,
    pivot: u32,
    btree: BTree,
    arena: Arena,
    dirty: bool,
}

impl Node {
    /// Returns an empty node with the given chain pointer and height.
    pub fn new(next: u32, height: u32) -> Node {
        Node {
            next,
            height,
            pivot: 0,
            btree: BTree::new(),
            arena: Arena::Owned(Vec::new()),
            dirty: false,
        }
    }

    pub(crate) fn from_parts(next: u32, height: u32, btree: BTree, arena: Vec<u8>) -> Node {
        let dirty = !btree.is_empty();
        Node {
            next,
            height,
            pivot: 0,
            btree,
            arena: Arena::Owned(arena),
            dirty,
        }
    }

    /// Reads a node back from a block buffer produced by `write`. The
    /// arena references the buffer in place, trimmed to the highest offset
    /// any entry uses so device padding never inflates `length`.
    pub fn load(buf: Bytes) -> Result<Node> {
        if buf.len() < NODE_HEADER_PADDED {
            return Err(LoessError::corrupt(format!(
                "node buffer too small: {} bytes",
                buf.len()
            )));
        }

        let next = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let height = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let pivot = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let btree_size = u64::from_be_bytes([
            buf[12], buf[13], buf[14], buf[15], buf[16], buf[17], buf[18], buf[19],
        ]);

        let tree_end = NODE_HEADER_PADDED as u64 + btree_size;
        if tree_end > buf.len() as u64 {
            return Err(LoessError::corrupt(format!(
                "node claims {btree_size} tree bytes, buffer has {}",
                buf.len()
            )));
        }

        let btree = BTree::load(&buf[NODE_HEADER_PADDED..tree_end as usize])?;

        let arena_buf = buf.slice(tree_end as usize..);
        let mut used = 0usize;
        for ent in btree.iter() {
            let end = ent.offset() as usize + ent.key_len() as usize + ent.value_len() as usize;
            if end > arena_buf.len() {
                return Err(LoessError::corrupt(format!(
                    "entry overruns arena: {end} > {}",
                    arena_buf.len()
                )));
            }
            used = used.max(end);
        }

        Ok(Node {
            next,
            height,
            pivot,
            btree,
            arena: Arena::Shared(arena_buf.slice(..used)),
            dirty: false,
        })
    }

    /// Returns the height of the node. Zero means leaf.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Returns the next node pointer.
    pub fn next(&self) -> u32 {
        self.next
    }

    /// Sets the next pointer.
    pub fn set_next(&mut self, next: u32) {
        self.next = next;
        self.dirty = true;
    }

    /// Returns the block this node's child chain starts at.
    pub fn pivot(&self) -> u32 {
        self.pivot
    }

    /// Sets the child chain block.
    pub fn set_pivot(&mut self, pivot: u32) {
        self.pivot = pivot;
        self.dirty = true;
    }

    /// Returns true if the node has been modified since the last `write`.
    pub fn dirty(&self) -> bool {
        self.dirty
    }

    /// Forces the node dirty, even if no writes have happened. Used when a
    /// node must reach disk despite an untouched buffer, e.g. a root that
    /// was just pushed down a level.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Returns how many entries are in the node.
    pub fn count(&self) -> u32 {
        self.btree.len()
    }

    /// Returns an upper bound on how many bytes writing the node requires.
    pub fn length(&self) -> u64 {
        NODE_HEADER_PADDED as u64 + self.btree.serialized_size() + self.arena.len() as u64
    }

    /// Returns whether a write for the given key and value fits in `size`
    /// bytes, with headroom for the tree splits the insert could cause.
    pub fn fits(&self, key: &[u8], value: &[u8], size: u32) -> bool {
        key.len() <= KEY_MASK as usize
            && value.len() <= VALUE_MASK as usize
            && self.length() + NODE_SLACK < size as u64
    }

    /// Associates the key with the value in the node. Returns false if the
    /// entry cannot be represented, in which case nothing is written.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> bool {
        self.push(key, value, false)
    }

    /// Records a tombstone for the key. Space for any earlier version is
    /// not reclaimed until the next write compacts the arena.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        self.push(key, &[], true)
    }

    fn push(&mut self, key: &[u8], value: &[u8], tombstone: bool) -> bool {
        if !self.fits(key, value, u32::MAX) {
            return false;
        }

        let buf = self.arena.to_mut();
        let offset = buf.len() as u32;
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);

        let ent = Entry::new(key, value, tombstone, offset);
        self.btree.insert(ent, self.arena.as_slice());
        self.dirty = true;
        true
    }

    /// Marshals the node into the buffer, replacing its contents. The
    /// arena is compacted in key order first, so a freshly written node
    /// iterates in sorted order front to back.
    pub fn write(&mut self, buf: &mut Vec<u8>) {
        let mut compacted = Vec::with_capacity(self.arena.len());
        {
            let arena = self.arena.as_slice();
            self.btree.for_each_mut(|ent| {
                let start = ent.offset() as usize;
                let end = start + ent.key_len() as usize + ent.value_len() as usize;
                let offset = compacted.len() as u32;
                compacted.extend_from_slice(&arena[start..end]);
                ent.set_offset(offset);
                true
            });
        }
        self.arena = Arena::Owned(compacted);

        let btree_size = self.btree.serialized_size();
        buf.clear();
        buf.reserve(NODE_HEADER_PADDED + btree_size as usize + self.arena.len());
        buf.extend_from_slice(&self.next.to_be_bytes());
        buf.extend_from_slice(&self.height.to_be_bytes());
        buf.extend_from_slice(&self.pivot.to_be_bytes());
        buf.extend_from_slice(&btree_size.to_be_bytes());
        buf.resize(NODE_HEADER_PADDED, 0);
        self.btree.write(buf);
        buf.extend_from_slice(self.arena.as_slice());

        self.dirty = false;
    }

    /// Returns the node to its initial state, dropping any backing buffer.
    pub fn reset(&mut self) {
        self.btree.reset();
        self.arena = Arena::Owned(Vec::new());
        self.dirty = false;
    }

    /// Iterates the entries in key order.
    pub fn iter(&self) -> NodeIter<'_> {
        NodeIter {
            arena: self.arena.as_slice(),
            inner: self.btree.iter(),
        }
    }

    /// Walks the entries in key order with mutable access, so the caller
    /// can repoint pivots. Returning false stops the walk.
    pub fn update<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut Entry, &[u8]) -> bool,
    {
        let arena = self.arena.as_slice();
        self.btree.for_each_mut(|ent| {
            let key = ent.read_key(arena);
            f(ent, key)
        });
        self.dirty = true;
    }

    /// Drains the node through the callback. Every entry is visited in key
    /// order; the callback may rewrite its pivot. Afterwards the node is
    /// rebuilt keeping only the entries whose pivot survived as nonzero,
    /// with a freshly compacted arena.
    ///
    /// On a callback error the rebuild is abandoned and the error is
    /// returned; entries visited before the failure may carry updated
    /// pivots.
    pub fn flush<F>(&mut self, mut cb: F) -> Result<()>
    where
        F: FnMut(&mut Entry, &[u8], &[u8]) -> Result<()>,
    {
        let mut bulk = BTreeBulk::default();
        let mut compacted = Vec::new();
        let mut failed: Option<LoessError> = None;
        {
            let arena = self.arena.as_slice();
            self.btree.for_each_mut(|ent| {
                let key = ent.read_key(arena);
                let value = ent.read_value(arena);
                if let Err(err) = cb(ent, key, value) {
                    failed = Some(err);
                    return false;
                }
                if ent.pivot() == 0 {
                    return true;
                }
                let mut kept = *ent;
                kept.set_offset(compacted.len() as u32);
                compacted.extend_from_slice(key);
                compacted.extend_from_slice(value);
                bulk.append(kept);
                true
            });
        }
        if let Some(err) = failed {
            return Err(err);
        }

        self.btree = bulk.done();
        self.arena = Arena::Owned(compacted);
        self.dirty = true;
        Ok(())
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("next", &self.next)
            .field("height", &self.height)
            .field("pivot", &self.pivot)
            .field("entries", &self.btree.len())
            .field("arena", &self.arena.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl Node {
    /// Renders the node's entries one per line for debugging, with pivot
    /// and tombstone markers.
    pub fn dump(&self) -> String {
        use std::fmt::Write;

        let mut out = format!("{self:?}\n");
        for ent in self.iter() {
            let _ = write!(out, "  {:?}", String::from_utf8_lossy(ent.key));
            if ent.entry.pivot() != 0 {
                let _ = write!(out, " -> {}", ent.entry.pivot());
            }
            if ent.entry.tombstone() {
                out.push_str(" (tombstone)");
            }
            out.push('\n');
        }
        out
    }
}

/// A borrowed view of one entry during iteration.
pub struct EntryRef<'a> {
    pub entry: Entry,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

/// Iterator over a node's entries in key order.
pub struct NodeIter<'a> {
    arena: &'a [u8],
    inner: crate::btree::BTreeIter<'a>,
}

impl<'a> Iterator for NodeIter<'a> {
    type Item = EntryRef<'a>;

    fn next(&mut self) -> Option<EntryRef<'a>> {
        let ent = self.inner.next()?;
        Some(EntryRef {
            entry: *ent,
            key: ent.read_key(self.arena),
            value: ent.read_value(self.arena),
        })
    }
}
