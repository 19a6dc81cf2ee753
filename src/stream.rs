//! Deterministic seeded byte stream.
//!
//! # Purpose
//!
//! Every pseudo-random value a test case consumes comes from one of these
//! streams. The stream counts bytes, and that count is the replay
//! coordinate: `(seed, position)` pins down the exact draw at which
//! something happened, across runs, machines, and process boundaries.
//!
//! # Byte costs
//!
//! | Draw                                | Bytes |
//! |-------------------------------------|-------|
//! | `next_u64` / `next_i64` / `next_f64`| 8     |
//! | `next_u32` / `next_i32` (+ bounded) | 4     |
//! | `next_bool`                         | 1     |
//!
//! # Invariants
//!
//! - Same seed + same draw sequence = identical values and positions.
//! - `position()` is monotone non-decreasing and starts at 0.
//! - A draw's byte cost depends only on the draw kind, never on its result.
//!
//! The core is xorshift64*: three shifts plus a multiply, no tables, no
//! platform-dependent behavior. Not cryptographic, and does not need to be.

/// Zero seeds collapse xorshift to a fixed point; remap to a golden-ratio
/// constant instead.
const ZERO_SEED_REMAP: u64 = 0x9E3779B97F4A7C15;

/// Deterministic pseudo-random byte stream.
///
/// Eight bytes are generated per underlying step and handed out through a
/// small buffer, so mixed-width draw sequences stay byte-exact: a `bool`
/// really consumes one byte, and the next draw picks up where it left off.
#[derive(Debug, Clone)]
pub struct SeedStream {
    seed: u64,
    state: u64,
    /// Bytes from the last generator step, little-endian order.
    buf: [u8; 8],
    /// Bytes of `buf` already handed out (8 = buffer exhausted).
    buf_used: usize,
    position: u64,
}

impl SeedStream {
    pub fn new(seed: u64) -> Self {
        let state = if seed == 0 { ZERO_SEED_REMAP } else { seed };
        Self {
            seed,
            state,
            buf: [0; 8],
            buf_used: 8,
            position: 0,
        }
    }

    /// The seed this stream was created with. A zero seed reads back as
    /// zero even though the internal state is remapped.
    #[inline(always)]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Pseudo-random bytes consumed so far.
    #[inline(always)]
    pub fn position(&self) -> u64 {
        self.position
    }

    #[inline]
    fn step(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    /// Pull `n` bytes (1..=8) into the low bytes of a `u64`.
    fn take(&mut self, n: usize) -> u64 {
        debug_assert!((1..=8).contains(&n));
        let mut out = 0u64;
        for i in 0..n {
            if self.buf_used == 8 {
                self.buf = self.step().to_le_bytes();
                self.buf_used = 0;
            }
            out |= u64::from(self.buf[self.buf_used]) << (8 * i);
            self.buf_used += 1;
        }
        self.position += n as u64;
        out
    }

    /// 8 bytes.
    pub fn next_u64(&mut self) -> u64 {
        self.take(8)
    }

    /// 8 bytes.
    pub fn next_i64(&mut self) -> i64 {
        self.take(8) as i64
    }

    /// 4 bytes.
    pub fn next_u32(&mut self) -> u32 {
        self.take(4) as u32
    }

    /// 4 bytes.
    pub fn next_i32(&mut self) -> i32 {
        self.take(4) as u32 as i32
    }

    /// 4 bytes, uniform-enough in `0..bound`. Modulo bias is irrelevant at
    /// harness scale and keeps the byte cost fixed.
    ///
    /// # Panics
    ///
    /// If `bound == 0`.
    pub fn next_u32_bounded(&mut self, bound: u32) -> u32 {
        assert!(bound > 0, "bound must be > 0");
        (self.take(4) % u64::from(bound)) as u32
    }

    /// 4 bytes, `0..bound`.
    ///
    /// # Panics
    ///
    /// If `bound <= 0`.
    pub fn next_i32_bounded(&mut self, bound: i32) -> i32 {
        assert!(bound > 0, "bound must be > 0");
        (self.take(4) % bound as u64) as i32
    }

    /// 8 bytes, uniform in `[0, 1)` with 53-bit resolution.
    pub fn next_f64(&mut self) -> f64 {
        (self.take(8) >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// 1 byte.
    pub fn next_bool(&mut self) -> bool {
        self.take(1) & 1 == 1
    }

    /// Seed for a forked child stream: one `u64` draw, so the derivation is
    /// a pure function of `(seed, position)` at the fork point.
    pub fn derive_child_seed(&mut self) -> u64 {
        self.next_u64()
    }
}

// ============================================================================
// Tests
// ============================================================================
