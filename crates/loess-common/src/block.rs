//! Block identifiers and size limits.
//!
//! Blocks are the natural I/O unit of the backing device and are addressed
//! by a `u32`. Block 0 is reserved so that a zero pivot can mean "no edge".

/// Reserved block id; a pivot of zero means the entry has no child edge.
pub const NO_BLOCK: u32 = 0;

/// The block that always holds the root node.
pub const ROOT_BLOCK: u32 = 1;

/// Sentinel block id. On a node it means "no leaf allocated yet" and
/// triggers lazy leaf allocation at first flush.
pub const INVALID_BLOCK: u32 = u32::MAX;

/// Largest key accepted, in bytes. Key lengths are packed into 15 bits.
pub const MAX_KEY_SIZE: usize = (1 << 15) - 1;

/// Largest value accepted, in bytes. Value lengths are packed into 15 bits.
pub const MAX_VALUE_SIZE: usize = (1 << 15) - 1;
