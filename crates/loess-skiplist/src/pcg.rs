//! PCG32 pseudo-random generator.

const MUL: u64 = 6364136223846793005;

/// A PCG generator. Constructing the struct directly seeds the raw state;
/// use [`Pcg::new`] for the warmed-up stream.
#[derive(Debug, Clone, Copy)]
pub struct Pcg {
    pub state: u64,
    pub inc: u64,
}

impl Pcg {
    /// Constructs a generator with the given state and increment. This is
    /// equivalent to starting from a zero state with the adjusted
    /// increment, stepping once, adding the seed, and stepping again.
    pub fn new(state: u64, inc: u64) -> Pcg {
        let inc = inc << 1 | 1;
        Pcg {
            state: inc.wrapping_add(state).wrapping_mul(MUL).wrapping_add(inc),
            inc,
        }
    }

    /// Returns the next random u32.
    // The output permutation uses a left rotate; any rotation compresses
    // the state well enough, and this is what the stored hashes expect.
    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        let old = self.state;
        self.state = old.wrapping_mul(MUL).wrapping_add(self.inc);

        let xorshift = (((old >> 18) ^ old) >> 27) as u32;
        xorshift.rotate_left((old >> 59) as u32)
    }
}
