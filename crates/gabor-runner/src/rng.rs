//! Seeded random stream used by both sequence builders.
//!
//! A string seed is folded into 128 bits of state with an avalanche mixing
//! hash, which then seeds a small counter-based generator. Identical seed
//! strings reproduce identical streams and instances share nothing.

/// Mixes every UTF-16 code unit of `seed` into four 32-bit words.
pub fn seed_words(seed: &str) -> [u32; 4] {
    let mut h1: u32 = 1_779_033_703;
    let mut h2: u32 = 3_144_134_277;
    let mut h3: u32 = 1_013_904_242;
    let mut h4: u32 = 2_773_480_762;
    for unit in seed.encode_utf16() {
        let k = unit as u32;
        h1 = h2 ^ (h1 ^ k).wrapping_mul(597_399_067);
        h2 = h3 ^ (h2 ^ k).wrapping_mul(2_869_860_233);
        h3 = h4 ^ (h3 ^ k).wrapping_mul(951_274_213);
        h4 = h1 ^ (h4 ^ k).wrapping_mul(2_716_044_179);
    }
    h1 = (h3 ^ (h1 >> 18)).wrapping_mul(597_399_067);
    h2 = (h4 ^ (h2 >> 22)).wrapping_mul(2_869_860_233);
    h3 = (h1 ^ (h3 >> 17)).wrapping_mul(951_274_213);
    h4 = (h2 ^ (h4 >> 19)).wrapping_mul(2_716_044_179);
    [h1 ^ h2 ^ h3 ^ h4, h2 ^ h1, h3 ^ h1, h4 ^ h1]
}

/// Small-state chaotic counter generator seeded from a string.
#[derive(Debug, Clone)]
pub struct SeededRng {
    a: u32,
    b: u32,
    c: u32,
    d: u32,
}

impl SeededRng {
    pub fn from_seed(seed: &str) -> Self {
        let [a, b, c, d] = seed_words(seed);
        Self { a, b, c, d }
    }

    pub fn next_u32(&mut self) -> u32 {
        let mut t = self.a.wrapping_add(self.b);
        self.a = self.b ^ (self.b >> 9);
        self.b = self.c.wrapping_add(self.c << 3);
        self.c = self.c.rotate_left(21);
        self.d = self.d.wrapping_add(1);
        t = t.wrapping_add(self.d);
        self.c = self.c.wrapping_add(t);
        t
    }

    /// Next value in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        self.next_u32() as f64 / 4_294_967_296.0
    }

    /// Uniform index in `0..bound`. `bound` must be non-zero.
    pub fn index(&mut self, bound: usize) -> usize {
        let idx = (self.next_f64() * bound as f64).floor() as usize;
        idx.min(bound - 1)
    }

    /// In-place Fisher-Yates permutation.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.index(i + 1);
            items.swap(i, j);
        }
    }

    /// `base` displaced by up to `width / 2` either way, clamped to `[min, max]`.
    pub fn jitter(&mut self, base: f64, width: f64, min: f64, max: f64) -> f64 {
        let value = base + (self.next_f64() - 0.5) * width;
        value.clamp(min, max)
    }
}
