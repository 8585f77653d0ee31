//! Deterministic geometric key heights.
//!
//! Every key lives at a height drawn from a geometric distribution seeded
//! by the key's hash, so the same key always lands at the same height. The
//! first draw succeeds with probability `b^-(1-eps)` and every later draw
//! with `b^-eps`, giving the buffered hierarchy its classical spacing.

use crate::pcg::Pcg;

/// Returns the height for a key hash given the success thresholds in
/// `zero` and `later`. A threshold of 0 never succeeds; one near 2^32
/// almost always does.
#[inline]
pub(crate) fn height(hash: u64, zero: u32, later: u32) -> u32 {
    let mut rng = Pcg {
        state: hash,
        inc: 1,
    };

    let mut threshold = zero;
    let mut h = 0;
    while rng.next_u32() < threshold {
        h += 1;
        threshold = later;
    }
    h
}

/// Returns `⌊2^32 / b^e⌋` saturated to u32.
pub(crate) fn threshold(b: u32, e: f64) -> u32 {
    let r = 2f64.powi(32) / (b as f64).powf(e);
    if r >= u32::MAX as f64 {
        u32::MAX
    } else {
        r as u32
    }
}
