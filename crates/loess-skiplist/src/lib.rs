//! A write-optimized skip list.
//!
//! Keys flush down a multi-level randomized hierarchy of buffer nodes,
//! each of which caches pending writes until it fills and is pushed to a
//! statically chosen child. Every buffer node is itself an in-memory B+
//! tree over key/value entries, serialized into a single disk block on
//! write-back. The design target is fast ingest with B-tree-like point
//! query complexity.

mod flush;
mod height;
mod pcg;
mod skiplist;

pub use pcg::Pcg;
pub use skiplist::SkipList;
