//! Receive-side sequence window.
//!
//! Tracks the highest sequence number seen on a connection plus a 16-bit
//! bitmap of the trailing window, so that duplicates are rejected while
//! bounded reordering is tolerated.
//!
//! Bit `i` of the bitmap records whether `highest - i` was received.
//! The 32-bit sequence space wraps: once `highest` is within the window of
//! `u32::MAX`, any value in the lower half of the space restarts tracking.

use std::sync::atomic::{AtomicU64, Ordering};

/// Window width. Must match the bit width of the bitmap.
pub const WINDOW_SIZE: i64 = 16;

/// Highest value from which a jump back to the low half counts as wraparound.
const WRAP_SEQ: i64 = u32::MAX as i64 - WINDOW_SIZE;

/// Values below this are acceptable wraparound targets.
const WRAP_ACCEPT_SEQ: i64 = 1 << 31;

/// Plain sequence window state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeqWindow {
    highest: i64,
    bitmap: u16,
}

impl SeqWindow {
    /// Window positioned at `highest` with the given bitmap.
    #[must_use]
    pub fn new(highest: u32, bitmap: u16) -> Self {
        Self {
            highest: i64::from(highest),
            bitmap,
        }
    }

    /// Highest sequence number accepted so far.
    #[must_use]
    pub fn highest(&self) -> u32 {
        // Always assigned from a u32.
        self.highest as u32
    }

    /// Bitmap of the trailing window.
    #[must_use]
    pub fn bitmap(&self) -> u16 {
        self.bitmap
    }

    /// Returns `true` if `seq` should be accepted, advancing the window.
    /// A rejected value leaves the state unchanged.
    pub fn accept(&mut self, seq: u32) -> bool {
        let s = i64::from(seq);
        let d = s - self.highest;

        if d > 0 {
            self.highest = s;
            self.bitmap = if d > WINDOW_SIZE {
                1
            } else {
                // d == 16 shifts every bit out.
                self.bitmap.checked_shl(d as u32).unwrap_or(0) | 1
            };
            true
        } else if d > -WINDOW_SIZE {
            let mask = 1u16 << (-d);
            let accept = self.bitmap & mask == 0;
            self.bitmap |= mask;
            accept
        } else if self.highest > WRAP_SEQ && s < WRAP_ACCEPT_SEQ {
            self.highest = s;
            self.bitmap = 1;
            true
        } else {
            false
        }
    }

    fn pack(self) -> u64 {
        ((self.highest as u64) << 16) | u64::from(self.bitmap)
    }

    fn unpack(v: u64) -> Self {
        Self {
            highest: (v >> 16) as i64,
            bitmap: v as u16,
        }
    }
}

/// Lock-free [`SeqWindow`] shared by concurrent readers of one connection.
#[derive(Debug, Default)]
pub struct SeqTracker {
    state: AtomicU64,
}

impl SeqTracker {
    /// Tracker starting at sequence zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker starting from an explicit window.
    #[must_use]
    pub fn with_window(window: SeqWindow) -> Self {
        Self {
            state: AtomicU64::new(window.pack()),
        }
    }

    /// Current window state.
    #[must_use]
    pub fn window(&self) -> SeqWindow {
        SeqWindow::unpack(self.state.load(Ordering::Acquire))
    }

    /// Returns `true` if `seq` should be accepted, advancing the window.
    pub fn may_accept(&self, seq: u32) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let mut window = SeqWindow::unpack(current);
            if !window.accept(seq) {
                return false;
            }

            match self.state.compare_exchange_weak(
                current,
                window.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}
