//! The flush protocol.
//!
//! Flushing distributes a node's buffered entries among its children,
//! walking the child chain left to right as pivot entries move the write
//! cursor. Keys at or above the node's height stay behind as pivots; keys
//! strictly taller start a new right sibling, built with the bulk loader
//! and stitched into the chain. After a split, every ancestor on the path
//! from the root has its pivots at the old block redirected by leader key.
//! Children that crossed the block size are then flushed recursively,
//! except under height 1 where leaves are rebalanced instead.

use crate::height::height;
use loess_common::{LoessError, Result, INVALID_BLOCK, NO_BLOCK, ROOT_BLOCK};
use loess_node::{Bulk, Entry, Node};
use loess_store::{Cache, Lease};
use tracing::{debug, trace};
use xxhash_rust::xxh3::xxh3_64;

/// A sibling created during a flush: the block it was assigned and the
/// first key that started it.
struct Split {
    block: u32,
    leader: Vec<u8>,
}

/// What one flush pass over a node produced.
struct Outcome {
    height: u32,
    fixups: Vec<u32>,
    splits: Vec<Split>,
}

/// Driver for a top-down flush. Borrows the operator's root directly;
/// every other node is reached through the cache.
pub(crate) struct Flusher<'a, C: Cache> {
    cache: &'a C,
    root: &'a mut Node,
    b: u32,
    zero: u32,
    later: u32,
    max_block: &'a mut u32,
}

impl<'a, C: Cache> Flusher<'a, C> {
    pub(crate) fn new(
        cache: &'a C,
        root: &'a mut Node,
        b: u32,
        zero: u32,
        later: u32,
        max_block: &'a mut u32,
    ) -> Flusher<'a, C> {
        Flusher {
            cache,
            root,
            b,
            zero,
            later,
            max_block,
        }
    }

    /// Flushes the root, cascading into any children that overflowed.
    pub(crate) fn run(&mut self) -> Result<()> {
        let outcome = pass(
            self.cache,
            self.b,
            self.zero,
            self.later,
            self.max_block,
            self.root,
            ROOT_BLOCK,
        )?;
        self.finish(ROOT_BLOCK, &[], outcome)
    }

    /// Handles everything after a pass: ancestor pivot fix-ups for splits,
    /// then recursion into overflowing children or the leaf rebalance.
    fn finish(&mut self, block: u32, parents: &[u32], outcome: Outcome) -> Result<()> {
        if !outcome.splits.is_empty() {
            for &parent in parents {
                self.redirect(parent, block, &outcome.splits)?;
            }
        }

        if outcome.fixups.is_empty() {
            return Ok(());
        }

        let mut next_parents = Vec::with_capacity(1 + outcome.splits.len());
        next_parents.push(block);
        next_parents.extend(outcome.splits.iter().map(|split| split.block));

        if outcome.height == 1 {
            self.rebalance(&next_parents, &outcome.fixups)
        } else {
            for &child in &outcome.fixups {
                self.flush_block(child, &next_parents)?;
            }
            Ok(())
        }
    }

    fn flush_block(&mut self, block: u32, parents: &[u32]) -> Result<()> {
        let cache = self.cache;
        let lease = cache.get(block)?;
        let node = lease.node().clone();
        let outcome = {
            let mut n = node.borrow_mut();
            pass(
                self.cache,
                self.b,
                self.zero,
                self.later,
                self.max_block,
                &mut n,
                block,
            )
        };
        let res = match outcome {
            Ok(outcome) => self.finish(block, parents, outcome),
            Err(err) => Err(err),
        };
        lease.close()?;
        res
    }

    /// Repoints one ancestor's pivots after `block` split. The root never
    /// lives in the cache, so it is patched directly.
    fn redirect(&mut self, parent: u32, block: u32, splits: &[Split]) -> Result<()> {
        if parent == ROOT_BLOCK {
            redirect_node(self.root, block, splits);
            return Ok(());
        }

        let cache = self.cache;
        let lease = cache.get(parent)?;
        {
            let node = lease.node().clone();
            let mut n = node.borrow_mut();
            redirect_node(&mut n, block, splits);
        }
        lease.close()
    }

    /// Redistributes leaf contents so that every leaf begins on one of the
    /// parents' pivot keys and is approximately one block in size.
    ///
    /// This is a contract hook: the current implementation leaves leaf
    /// contents where the flush put them, so leaves may run past the block
    /// size until a redistribution policy lands behind this call site.
    fn rebalance(&mut self, parents: &[u32], leaves: &[u32]) -> Result<()> {
        debug_assert!(!leaves.is_empty());
        let _ = parents;
        trace!(leaves = leaves.len(), "leaf rebalance deferred");
        Ok(())
    }
}

/// One pass over `n`: distribute every entry to the child chain, keeping
/// pivots and carving off new siblings. Commits any block allocations to
/// `max_block` and registers new siblings with the cache before returning.
fn pass<'c, C: Cache>(
    cache: &'c C,
    b: u32,
    zero: u32,
    later: u32,
    max_block: &mut u32,
    n: &mut Node,
    block: u32,
) -> Result<Outcome> {
    debug_assert!(n.height() != 0, "flush on a leaf");
    let nh = n.height();
    trace!(block, height = nh, entries = n.count(), "flushing node");

    // a chain that has never flushed gets its leaf allocated lazily
    if n.pivot() == INVALID_BLOCK {
        let leaf_block = *max_block + 1;
        let mut leaf = Node::new(0, 0);
        leaf.mark_dirty();
        cache.add(leaf, leaf_block)?;
        n.set_pivot(leaf_block);
        *max_block = leaf_block;
    }

    let old_next = n.next();
    let mut st = Pass {
        cblock: n.pivot(),
        lease: None,
        marked: false,
        fixups: Vec::new(),
        leader: None,
        leader_pivot: NO_BLOCK,
        pending: Vec::new(),
        bulk: Bulk::default(),
        next_block: *max_block,
    };

    let res = n.flush(|ent, key, value| {
        st.step(cache, b, zero, later, nh, ent, key, value)
    });
    if let Some(lease) = st.lease.take() {
        lease.close()?;
    }
    res?;

    st.finish_sibling(old_next, nh);

    let mut splits = Vec::new();
    if !st.pending.is_empty() {
        // chain the new siblings to the right of n before any of them can
        // reach disk, so a persisted sibling never has a dangling successor
        n.set_next(st.pending[0].block);
        let count = st.pending.len();
        for i in 0..count {
            let next = if i + 1 < count {
                st.pending[i + 1].block
            } else {
                old_next
            };
            st.pending[i].node.set_next(next);
        }

        for pending in st.pending {
            cache.add(pending.node, pending.block)?;
            splits.push(Split {
                block: pending.block,
                leader: pending.leader,
            });
        }
        *max_block = st.next_block;
        debug!(block, splits = splits.len(), "node split during flush");
    }

    Ok(Outcome {
        height: nh,
        fixups: st.fixups,
        splits,
    })
}

/// A sibling finished during the pass, waiting for its chain pointer.
struct PendingSplit {
    block: u32,
    leader: Vec<u8>,
    node: Node,
}

/// Iteration state for one pass: the write cursor over the child chain
/// and the in-progress sibling.
struct Pass<'c> {
    cblock: u32,
    lease: Option<Lease<'c>>,
    marked: bool,
    fixups: Vec<u32>,
    leader: Option<Vec<u8>>,
    leader_pivot: u32,
    pending: Vec<PendingSplit>,
    bulk: Bulk,
    next_block: u32,
}

impl<'c> Pass<'c> {
    #[allow(clippy::too_many_arguments)]
    fn step<C: Cache>(
        &mut self,
        cache: &'c C,
        b: u32,
        zero: u32,
        later: u32,
        nh: u32,
        ent: &mut Entry,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        // a pivot entry moves the write cursor to its child
        let pivot = ent.pivot();
        if pivot != NO_BLOCK && pivot != self.cblock {
            if let Some(lease) = self.lease.take() {
                lease.close()?;
            }
            self.cblock = pivot;
            self.marked = false;
        }

        let child = if let Some(lease) = &self.lease {
            lease.node().clone()
        } else {
            let lease = self.lease.insert(cache.get(self.cblock)?);
            lease.node().clone()
        };

        {
            let mut child = child.borrow_mut();
            let wrote = if ent.tombstone() {
                child.delete(key)
            } else {
                child.insert(key, value)
            };
            if !wrote {
                return Err(LoessError::TooLarge {
                    key: key.len(),
                    value: value.len(),
                });
            }

            // an overflowing child needs a follow-up flush; at height 1
            // every touched leaf goes to the rebalance step instead
            if !self.marked && (child.length() >= b as u64 || nh == 1) {
                self.marked = true;
                self.fixups.push(self.cblock);
            }
        }

        // entries at or above this node's height stay behind as pivots;
        // a strictly taller entry starts a new right sibling
        let hk = height(xxh3_64(key), zero, later);
        if hk >= nh {
            ent.set_pivot(self.cblock);
            if hk > nh {
                self.finish_sibling(0, nh);
                self.leader = Some(key.to_vec());
                self.leader_pivot = self.cblock;
            }
        }

        if self.leader.is_some() {
            if !self.bulk.append(key, value, ent.tombstone(), ent.pivot()) {
                return Err(LoessError::TooLarge {
                    key: key.len(),
                    value: value.len(),
                });
            }
            // the entry moves to the sibling; drop it from this node
            ent.set_pivot(NO_BLOCK);
        }

        Ok(())
    }

    /// Stamps a block for the in-progress sibling, if any, and queues it.
    /// The chain pointer passed here is provisional; the pass rewrites it
    /// once every sibling has a block.
    fn finish_sibling(&mut self, next: u32, height: u32) {
        if let Some(leader) = self.leader.take() {
            self.next_block += 1;
            let mut node = self.bulk.done(next, height);
            node.set_pivot(self.leader_pivot);
            self.pending.push(PendingSplit {
                block: self.next_block,
                leader,
                node,
            });
        }
    }
}

/// Walks the parent's entries in key order and repoints every pivot at
/// `block` to the split whose leader range now owns the key.
fn redirect_node(n: &mut Node, block: u32, splits: &[Split]) {
    let mut pivot = block;
    let mut rest = splits;
    n.update(|ent, key| {
        if ent.pivot() != block {
            return true;
        }
        while let Some((first, tail)) = rest.split_first() {
            if key >= first.leader.as_slice() {
                pivot = first.block;
                rest = tail;
            } else {
                break;
            }
        }
        ent.set_pivot(pivot);
        true
    });
}
