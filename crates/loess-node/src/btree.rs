//! In-memory B+ tree over entry slabs.
//!
//! The tree is tuned to store [`Entry`] values ordered by (prefix, key).
//! Its nodes are fixed-size records in a flat slab, referencing each other
//! by `u32` index rather than by pointer, so the whole slab can be written
//! out and re-opened without walking it. The saved prefix short-circuits
//! most comparisons without reading the arena.
//!
//! Serialized layout (little-endian):
//! ```text
//! 0    4   root_id
//! 4    4   node_count
//! 8    4   entry_count
//! 12   ..  node_count fixed-size nodes, each:
//!            next:u32 prev:u32 parent:u32 count:u16 leaf:u8 _:u8
//!            payload: [Entry; PAYLOAD_ENTRIES]
//! ```

use crate::entry::{key_prefix, Entry, ENTRY_SIZE};
use loess_common::{LoessError, Result};
use std::cmp::Ordering;

/// Sentinel node index.
pub(crate) const INVALID_NODE: u32 = u32::MAX;

/// Entries per tree node. Odd, so splits leave both halves balanced.
pub const PAYLOAD_ENTRIES: usize = 127;

const PAYLOAD_SPLIT: usize = PAYLOAD_ENTRIES / 2;

/// Serialized size of one tree node in bytes.
pub const BTREE_NODE_SIZE: usize = 16 + PAYLOAD_ENTRIES * ENTRY_SIZE;

const BTREE_HEADER_SIZE: usize = 12;

// It is important that BTreeNode stays pointer-free so the slab can be
// serialized as a flat array of records.
#[derive(Clone, Debug)]
struct BTreeNode {
    next: u32, // next leaf, or the rightmost edge if not a leaf
    prev: u32, // backpointer from next (unused if not a leaf)
    parent: u32,
    count: u16,
    leaf: bool,
    payload: [Entry; PAYLOAD_ENTRIES],
}

impl BTreeNode {
    fn empty(leaf: bool) -> BTreeNode {
        BTreeNode {
            next: INVALID_NODE,
            prev: INVALID_NODE,
            parent: INVALID_NODE,
            count: 0,
            leaf,
            payload: [Entry::default(); PAYLOAD_ENTRIES],
        }
    }

    /// Inserts the entry by binary search on (prefix, key). Must never be
    /// called on a node that would have to split. Returns true if the count
    /// increased. An exact match overwrites in place but keeps the existing
    /// entry's pivot, so a refreshed entry never tears down its down-link.
    fn insert_entry(&mut self, key: &[u8], mut ent: Entry, arena: &[u8]) -> bool {
        let prefix = ent.prefix_u32();

        let (mut i, mut j) = (0usize, self.count as usize);
        while i < j {
            let h = (i + j) >> 1;
            let enth = self.payload[h];

            match prefix.cmp(&enth.prefix_u32()) {
                Ordering::Greater => i = h + 1,
                Ordering::Equal => match key.cmp(enth.read_key(arena)) {
                    Ordering::Greater => i = h + 1,
                    Ordering::Equal => {
                        ent.set_pivot(enth.pivot());
                        self.payload[h] = ent;
                        return false;
                    }
                    Ordering::Less => j = h,
                },
                Ordering::Less => j = h,
            }
        }

        self.payload.copy_within(i..self.count as usize, i + 1);
        self.payload[i] = ent;
        self.count += 1;
        true
    }

    /// Places the entry at the end. It must compare greater than every
    /// entry already present, and the node must have room.
    fn append_entry(&mut self, ent: Entry) {
        self.payload[self.count as usize] = ent;
        self.count += 1;
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.next.to_le_bytes());
        buf.extend_from_slice(&self.prev.to_le_bytes());
        buf.extend_from_slice(&self.parent.to_le_bytes());
        buf.extend_from_slice(&self.count.to_le_bytes());
        buf.push(self.leaf as u8);
        buf.push(0);
        for ent in &self.payload {
            ent.write_to(buf);
        }
    }

    fn read_from(buf: &[u8]) -> Result<BTreeNode> {
        let count = u16::from_le_bytes([buf[12], buf[13]]);
        if count as usize > PAYLOAD_ENTRIES {
            return Err(LoessError::corrupt(format!(
                "tree node count {count} exceeds payload"
            )));
        }
        let leaf = match buf[14] {
            0 => false,
            1 => true,
            other => {
                return Err(LoessError::corrupt(format!("bad leaf flag {other}")));
            }
        };

        let mut node = BTreeNode {
            next: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            prev: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            parent: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            count,
            leaf,
            payload: [Entry::default(); PAYLOAD_ENTRIES],
        };
        for (i, slot) in node.payload.iter_mut().enumerate() {
            let off = 16 + i * ENTRY_SIZE;
            *slot = Entry::read_from(&buf[off..off + ENTRY_SIZE]);
        }
        Ok(node)
    }
}

/// A B+ tree of entries. Keys are resolved through an external arena that
/// the caller passes to every ordering operation.
#[derive(Debug)]
pub struct BTree {
    root: u32,
    count: u32,
    nodes: Vec<BTreeNode>,
}

impl Default for BTree {
    fn default() -> Self {
        BTree::new()
    }
}

impl BTree {
    /// Creates an empty tree.
    pub fn new() -> BTree {
        BTree {
            root: INVALID_NODE,
            count: 0,
            nodes: Vec::new(),
        }
    }

    /// Clears the tree back to an empty state.
    pub fn reset(&mut self) {
        *self = BTree::new();
    }

    /// Returns the number of distinct keys in the tree.
    pub fn len(&self) -> u32 {
        self.count
    }

    /// Returns true if the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns how many bytes writing the tree requires.
    pub fn serialized_size(&self) -> u64 {
        BTREE_HEADER_SIZE as u64 + self.nodes.len() as u64 * BTREE_NODE_SIZE as u64
    }

    fn alloc(&mut self, leaf: bool) -> u32 {
        self.nodes.push(BTreeNode::empty(leaf));
        (self.nodes.len() - 1) as u32
    }

    /// Returns the leaf node that should contain the key, checking the
    /// saved prefix first so equal-prefix hops are the only arena reads.
    fn search(&self, key: &[u8], arena: &[u8]) -> u32 {
        let prefix = key_prefix(key);
        let mut nid = self.root;

        loop {
            let n = &self.nodes[nid as usize];
            if n.leaf {
                return nid;
            }

            let (mut i, mut j) = (0usize, n.count as usize);
            while i < j {
                let h = (i + j) >> 1;
                let enth = &n.payload[h];

                match prefix.cmp(&enth.prefix_u32()) {
                    Ordering::Greater => i = h + 1,
                    Ordering::Equal => {
                        if key >= enth.read_key(arena) {
                            i = h + 1;
                        } else {
                            j = h;
                        }
                    }
                    Ordering::Less => j = h,
                }
            }

            nid = if i == n.count as usize {
                n.next
            } else {
                n.payload[i].pivot()
            };
        }
    }

    /// Splits the node in half, returning a new node containing the smaller
    /// half of the keys. Only ever called on a full node.
    fn split(&mut self, nid: u32) -> u32 {
        let leaf = self.nodes[nid as usize].leaf;
        let sid = self.alloc(leaf);

        // the fresh node always lands at the end of the slab, after nid
        let (head, tail) = self.nodes.split_at_mut(sid as usize);
        let n = &mut head[nid as usize];
        let s = &mut tail[0];

        s.parent = n.parent;
        s.payload[..PAYLOAD_SPLIT].copy_from_slice(&n.payload[..PAYLOAD_SPLIT]);
        s.count = PAYLOAD_SPLIT as u16;

        let mut copy_at = PAYLOAD_SPLIT;
        if !leaf {
            // the split entry is promoted rather than kept, and the new
            // node's rightmost edge is whatever the split entry points at
            copy_at += 1;
            s.next = n.payload[PAYLOAD_SPLIT].pivot();
        } else {
            // fix up the leaf chain: s sits immediately to the left of n
            s.next = nid;
            s.prev = n.prev;
            n.prev = sid;
        }

        let total = n.count as usize;
        n.payload.copy_within(copy_at..total, 0);
        n.count = (total - copy_at) as u16;

        if !leaf {
            // children that moved to s need their parent updated
            let moved: Vec<u32> = {
                let s = &self.nodes[sid as usize];
                std::iter::once(s.next)
                    .chain(s.payload[..s.count as usize].iter().map(|e| e.pivot()))
                    .collect()
            };
            for child in moved {
                self.nodes[child as usize].parent = sid;
            }
        } else {
            let prev = self.nodes[sid as usize].prev;
            if prev != INVALID_NODE {
                self.nodes[prev as usize].next = sid;
            }
        }

        sid
    }

    /// Finds the parent of `nid`, allocating a new root if there is none.
    /// The split sibling `sid` gets the same parent.
    fn parent_of(&mut self, nid: u32, sid: u32) -> u32 {
        let parent = self.nodes[nid as usize].parent;
        if parent != INVALID_NODE {
            return parent;
        }

        let pid = self.alloc(false);
        self.nodes[pid as usize].next = nid;
        self.nodes[nid as usize].parent = pid;
        self.nodes[sid as usize].parent = pid;
        self.root = pid;
        pid
    }

    /// Puts the entry into the tree, using the arena to read keys for
    /// positioning. Returns true if the insert created a new entry.
    pub fn insert(&mut self, ent: Entry, arena: &[u8]) -> bool {
        if self.root == INVALID_NODE {
            let rid = self.alloc(true);
            self.root = rid;
            let key = ent.read_key(arena);
            self.nodes[rid as usize].insert_entry(key, ent, arena);
            self.count += 1;
            return true;
        }

        let mut nid = self.search(ent.read_key(arena), arena);
        let mut ent = ent;
        let mut added_at_leaf = false;

        loop {
            let key = ent.read_key(arena);
            let added = self.nodes[nid as usize].insert_entry(key, ent, arena);
            if added && self.nodes[nid as usize].leaf {
                self.count += 1;
                added_at_leaf = true;
            }

            if (self.nodes[nid as usize].count as usize) < PAYLOAD_ENTRIES {
                return added_at_leaf;
            }

            // promote the middle entry, then split off the smaller half
            let mut promoted = self.nodes[nid as usize].payload[PAYLOAD_SPLIT];
            let sid = self.split(nid);
            let pid = self.parent_of(nid, sid);

            promoted.set_pivot(sid);
            ent = promoted;
            nid = pid;
        }
    }

    /// Appends the entry to the given leaf, splitting upward as needed.
    /// The entry must be greater than every entry in the tree, and the
    /// leaf must be the rightmost one; it remains rightmost afterwards.
    fn append_at(&mut self, leaf: u32, ent: Entry) {
        self.count += 1;

        let mut nid = leaf;
        let mut ent = ent;
        loop {
            self.nodes[nid as usize].append_entry(ent);

            if (self.nodes[nid as usize].count as usize) < PAYLOAD_ENTRIES {
                return;
            }

            let mut promoted = self.nodes[nid as usize].payload[PAYLOAD_SPLIT];
            let sid = self.split(nid);
            let pid = self.parent_of(nid, sid);

            promoted.set_pivot(sid);
            ent = promoted;
            nid = pid;
        }
    }

    /// Iterates the entries in (prefix, key) order.
    pub fn iter(&self) -> BTreeIter<'_> {
        BTreeIter {
            tree: self,
            node: self.leftmost_leaf(),
            idx: 0,
        }
    }

    fn leftmost_leaf(&self) -> u32 {
        let mut nid = self.root;
        if nid == INVALID_NODE {
            return INVALID_NODE;
        }
        loop {
            let n = &self.nodes[nid as usize];
            if n.leaf {
                return nid;
            }
            nid = if n.count == 0 {
                n.next
            } else {
                n.payload[0].pivot()
            };
        }
    }

    /// Walks the entries in order, giving the callback mutable access so it
    /// can rewrite pivots or offsets in place. Returning false stops the
    /// walk. The callback must not change an entry's ordering.
    pub fn for_each_mut<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut Entry) -> bool,
    {
        let mut nid = self.leftmost_leaf();
        while nid != INVALID_NODE {
            let n = &mut self.nodes[nid as usize];
            for i in 0..n.count as usize {
                if !f(&mut n.payload[i]) {
                    return;
                }
            }
            nid = n.next;
        }
    }

    /// Marshals the tree to the buffer, appending to it.
    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.root.to_le_bytes());
        buf.extend_from_slice(&(self.nodes.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.count.to_le_bytes());
        for node in &self.nodes {
            node.write_to(buf);
        }
    }

    /// Reads a tree back from a buffer produced by `write`.
    pub fn load(buf: &[u8]) -> Result<BTree> {
        if buf.len() < BTREE_HEADER_SIZE {
            return Err(LoessError::corrupt(format!(
                "tree buffer too small: {} bytes",
                buf.len()
            )));
        }

        let root = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let node_count = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let entry_count = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);

        let need = BTREE_HEADER_SIZE as u64 + node_count as u64 * BTREE_NODE_SIZE as u64;
        if need > buf.len() as u64 {
            return Err(LoessError::corrupt(format!(
                "tree needs {need} bytes, buffer has {}",
                buf.len()
            )));
        }

        if node_count == 0 {
            if root != INVALID_NODE || entry_count != 0 {
                return Err(LoessError::corrupt("empty tree with a root or entries"));
            }
            return Ok(BTree::new());
        }
        if root >= node_count {
            return Err(LoessError::corrupt(format!(
                "root id {root} out of range for {node_count} nodes"
            )));
        }

        let mut nodes = Vec::with_capacity(node_count as usize);
        let mut leaf_entries = 0u64;
        for i in 0..node_count as usize {
            let off = BTREE_HEADER_SIZE + i * BTREE_NODE_SIZE;
            let node = BTreeNode::read_from(&buf[off..off + BTREE_NODE_SIZE])?;
            for link in [node.next, node.prev, node.parent] {
                if link != INVALID_NODE && link >= node_count {
                    return Err(LoessError::corrupt(format!(
                        "node link {link} out of range for {node_count} nodes"
                    )));
                }
            }
            if node.leaf {
                leaf_entries += node.count as u64;
            }
            nodes.push(node);
        }
        if leaf_entries != entry_count as u64 {
            return Err(LoessError::corrupt(format!(
                "tree claims {entry_count} entries but leaves hold {leaf_entries}"
            )));
        }

        Ok(BTree {
            root,
            count: entry_count,
            nodes,
        })
    }
}

/// Iterator over the entries of a tree in (prefix, key) order.
pub struct BTreeIter<'a> {
    tree: &'a BTree,
    node: u32,
    idx: usize,
}

impl<'a> Iterator for BTreeIter<'a> {
    type Item = &'a Entry;

    fn next(&mut self) -> Option<&'a Entry> {
        loop {
            if self.node == INVALID_NODE {
                return None;
            }
            let n = &self.tree.nodes[self.node as usize];
            if self.idx < n.count as usize {
                let ent = &n.payload[self.idx];
                self.idx += 1;
                return Some(ent);
            }
            self.node = n.next;
            self.idx = 0;
        }
    }
}

/// Bulk loader for a tree. Entries must be appended in strictly ascending
/// key order; the tree grows along its right spine only.
pub struct BTreeBulk {
    tree: BTree,
    leaf: u32,
}

impl Default for BTreeBulk {
    fn default() -> Self {
        BTreeBulk {
            tree: BTree::new(),
            leaf: INVALID_NODE,
        }
    }
}

impl BTreeBulk {
    /// Cheaply adds the entry. It must be strictly greater than any
    /// earlier entry.
    pub fn append(&mut self, ent: Entry) {
        if self.leaf == INVALID_NODE {
            let rid = self.tree.alloc(true);
            self.tree.root = rid;
            self.leaf = rid;
        }
        self.tree.append_at(self.leaf, ent);
    }

    /// Returns the number of entries appended so far.
    pub fn len(&self) -> u32 {
        self.tree.len()
    }

    /// Returns true if nothing has been appended.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Returns how many bytes writing the tree would require.
    pub fn serialized_size(&self) -> u64 {
        self.tree.serialized_size()
    }

    /// Returns the bulk loaded tree.
    pub fn done(self) -> BTree {
        self.tree
    }
}
