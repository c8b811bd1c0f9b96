/// Xor-shift generator used for identity hashes.
///
/// Fast and thread-confined; not suitable for anything that needs real
/// randomness.
pub struct WeakRandom {
    low: u64,
    high: u64,
}

impl WeakRandom {
    fn advance(&mut self) -> u64 {
        let x = self.low;
        let y = self.high;
        self.low = y;
        self.high = Self::next_state(x, y);
        self.high.wrapping_add(self.low)
    }

    pub fn next_state(mut x: u64, y: u64) -> u64 {
        x ^= x << 23;
        x ^= x >> 17;
        x ^= y ^ (y >> 26);
        x
    }

    pub fn get_u64(&mut self) -> u64 {
        self.advance()
    }

    pub fn new(seed: Option<usize>) -> Self {
        let mut this = Self {
            high: 0,
            low: 0,
        };
        this.set_seed(seed.unwrap_or_else(rand::random));

        this
    }

    pub fn set_seed(&mut self, mut seed: usize) {
        if seed == 0 {
            seed = 1;
        }

        self.low = seed as _;
        self.high = seed as _;
        self.advance();
    }
}

#[cfg(test)]
mod tests {
    use super::WeakRandom;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = WeakRandom::new(Some(42));
        let mut b = WeakRandom::new(Some(42));
        for _ in 0..16 {
            assert_eq!(a.get_u64(), b.get_u64());
        }
    }

    #[test]
    fn zero_seed_is_usable() {
        let mut r = WeakRandom::new(Some(0));
        let first = r.get_u64();
        let second = r.get_u64();
        assert_ne!(first, second);
    }
}
