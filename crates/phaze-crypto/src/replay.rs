//! Replay window for transport frame counters.
//!
//! Tracks the highest accepted counter and a ring bitmap of recently
//! accepted counters, in the style of the WireGuard anti-replay filter.
//!
//! # Design
//!
//! - Window size: up to 1024 counters (configurable)
//! - Counters at or behind `highest - window_size` are rejected
//! - Counters already accepted within the window are rejected
//! - Counters more than `forward_tolerance` ahead of `highest` are rejected
//! - The first frame may carry any counter within the forward tolerance,
//!   including 0
//!
//! `check` never mutates; `accept` must only be called once the frame has
//! authenticated, so forged frames cannot move the window.
//!
//! # Thread Safety
//!
//! This implementation is NOT thread-safe. It lives inside the session lock.

const WORD_BITS: u64 = 64;
const RING_WORDS: usize = 17;

/// Sliding window for replay protection.
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    /// Highest accepted counter (meaningless until `initialized`).
    highest: u64,
    /// Whether any counter has been accepted yet.
    initialized: bool,
    /// Ring of bitmap words, indexed by `(counter / 64) % RING_WORDS`.
    ring: [u64; RING_WORDS],
    window_size: u64,
    forward_tolerance: u64,
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayWindow {
    /// Largest supported window.
    pub const MAX_WINDOW_SIZE: u64 = (RING_WORDS as u64 - 1) * WORD_BITS;

    /// Default forward tolerance (2^20 counters).
    pub const DEFAULT_FORWARD_TOLERANCE: u64 = 1 << 20;

    /// Create a window of the maximum size with the default forward tolerance.
    pub fn new() -> Self {
        Self::with_size(Self::MAX_WINDOW_SIZE, Self::DEFAULT_FORWARD_TOLERANCE)
    }

    /// Create a window with a custom size and forward tolerance.
    ///
    /// # Panics
    /// Panics if size is 0 or greater than [`Self::MAX_WINDOW_SIZE`], or if the
    /// forward tolerance is 0.
    pub fn with_size(window_size: u64, forward_tolerance: u64) -> Self {
        assert!(
            window_size > 0 && window_size <= Self::MAX_WINDOW_SIZE,
            "window size must be 1-1024"
        );
        assert!(forward_tolerance > 0, "forward tolerance must be non-zero");
        Self {
            highest: 0,
            initialized: false,
            ring: [0; RING_WORDS],
            window_size,
            forward_tolerance,
        }
    }

    /// Check whether a counter would be accepted.
    ///
    /// Does NOT update internal state. Use `accept` for that.
    pub fn check(&self, counter: u64) -> bool {
        if !self.initialized {
            return counter <= self.forward_tolerance;
        }

        if counter > self.highest {
            return counter - self.highest <= self.forward_tolerance;
        }

        // Too old (behind the trailing edge)
        if self.highest - counter >= self.window_size {
            return false;
        }

        let (word, bit) = Self::slot(counter);
        self.ring[word] & bit == 0
    }

    /// Check and record a counter: returns true if it was fresh.
    pub fn accept(&mut self, counter: u64) -> bool {
        if !self.check(counter) {
            return false;
        }

        if !self.initialized {
            self.initialized = true;
            self.highest = counter;
        } else if counter > self.highest {
            let current = self.highest / WORD_BITS;
            let target = counter / WORD_BITS;
            let advance = (target - current).min(RING_WORDS as u64);
            for step in 1..=advance {
                let index = ((current + step) % RING_WORDS as u64) as usize;
                self.ring[index] = 0;
            }
            self.highest = counter;
        }

        let (word, bit) = Self::slot(counter);
        self.ring[word] |= bit;
        true
    }

    /// Highest accepted counter, if any.
    pub fn highest(&self) -> Option<u64> {
        self.initialized.then_some(self.highest)
    }

    pub fn window_size(&self) -> u64 {
        self.window_size
    }

    fn slot(counter: u64) -> (usize, u64) {
        let word = ((counter / WORD_BITS) % RING_WORDS as u64) as usize;
        let bit = 1u64 << (counter % WORD_BITS);
        (word, bit)
    }
}
