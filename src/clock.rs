//! Process-wide virtual clock.
//!
//! All time-dependent behavior — billing eligibility, idempotency TTLs, event
//! timestamps, webhook retry due-times — reads this clock, never the wall
//! clock directly. Concentrating time in one component lets a test
//! fast-forward thirty days of billing in milliseconds while every consumer
//! stays in agreement about "now".
//!
//! Three modes:
//!
//! - **Real**: wall-clock seconds.
//! - **Accelerated**: `start + (wall − start) × multiplier + offset`.
//! - **Manual**: frozen at `start + offset`; only [`VirtualClock::advance`]
//!   moves it.
//!
//! The `(start, offset, mode, multiplier)` tuple lives behind a single mutex
//! so no caller ever observes a torn combination.
//!
//! # Examples
//!
//! ```rust
//! use paper_tiger::clock::{ClockMode, VirtualClock};
//!
//! let clock = VirtualClock::new();
//! clock.set_mode(ClockMode::Manual, 1);
//! let t0 = clock.now();
//! clock.advance(86_400);
//! assert_eq!(clock.now(), t0 + 86_400);
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Time regime the clock is operating under.
///
/// # Examples
///
/// ```rust
/// use paper_tiger::clock::ClockMode;
///
/// assert_eq!(ClockMode::Manual.as_str(), "manual");
/// assert_eq!(ClockMode::Accelerated.as_str(), "accelerated");
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockMode {
    /// Wall-clock time.
    Real,
    /// Wall-clock time scaled by a positive integer multiplier.
    Accelerated,
    /// Frozen time, advanced only explicitly.
    Manual,
}

impl ClockMode {
    /// Lowercase mode name, as reported by introspection surfaces.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClockMode::Real => "real",
            ClockMode::Accelerated => "accelerated",
            ClockMode::Manual => "manual",
        }
    }
}

struct ClockState {
    mode: ClockMode,
    start: i64,
    offset: i64,
    multiplier: i64,
}

/// Shared monotonic second counter with mode-dependent semantics.
///
/// One clock is created per [`crate::state::ApiState`] and shared by every
/// component through an `Arc`. All operations serialize through the internal
/// mutex.
///
/// # Examples
///
/// ```rust
/// use paper_tiger::clock::{ClockMode, VirtualClock};
///
/// let clock = VirtualClock::new();
/// assert_eq!(clock.mode(), ClockMode::Real);
///
/// // freeze for a deterministic test
/// clock.set_mode(ClockMode::Manual, 1);
/// let before = clock.now();
/// clock.advance(3600);
/// assert_eq!(clock.now(), before + 3600);
/// ```
pub struct VirtualClock {
    state: Mutex<ClockState>,
}

fn wall_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualClock {
    /// A clock in real mode.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use paper_tiger::clock::{ClockMode, VirtualClock};
    ///
    /// let clock = VirtualClock::new();
    /// assert_eq!(clock.mode(), ClockMode::Real);
    /// assert!(clock.now() > 0);
    /// ```
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClockState {
                mode: ClockMode::Real,
                start: wall_now(),
                offset: 0,
                multiplier: 1,
            }),
        }
    }

    /// Current virtual time in seconds.
    ///
    /// Non-decreasing within a mode absent [`set_mode`](Self::set_mode) /
    /// [`reset`](Self::reset).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use paper_tiger::clock::VirtualClock;
    ///
    /// let clock = VirtualClock::new();
    /// let a = clock.now();
    /// let b = clock.now();
    /// assert!(b >= a);
    /// ```
    pub fn now(&self) -> i64 {
        let state = self.state.lock();
        match state.mode {
            ClockMode::Real => wall_now(),
            ClockMode::Accelerated => {
                state.start + (wall_now() - state.start) * state.multiplier + state.offset
            }
            ClockMode::Manual => state.start + state.offset,
        }
    }

    /// Adds to the offset. Effective in manual and accelerated modes; a no-op
    /// warning case in real mode (wall time cannot be advanced).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use paper_tiger::clock::{ClockMode, VirtualClock};
    ///
    /// let clock = VirtualClock::new();
    /// clock.set_mode(ClockMode::Manual, 1);
    /// let t0 = clock.now();
    /// clock.advance(30 * 86_400); // skip a month of dunning
    /// assert_eq!(clock.now(), t0 + 30 * 86_400);
    /// ```
    pub fn advance(&self, delta: i64) {
        let mut state = self.state.lock();
        match state.mode {
            ClockMode::Real => {
                tracing::warn!(delta, "ignoring advance() on a real-mode clock");
            }
            ClockMode::Accelerated | ClockMode::Manual => state.offset += delta,
        }
    }

    /// Switches mode, restarting `start` at wall-now and zeroing the offset.
    /// The multiplier must be positive; non-positive values clamp to 1.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use paper_tiger::clock::{ClockMode, VirtualClock};
    ///
    /// let clock = VirtualClock::new();
    /// // a thousand virtual seconds per wall second
    /// clock.set_mode(ClockMode::Accelerated, 1000);
    /// assert_eq!(clock.mode(), ClockMode::Accelerated);
    /// ```
    pub fn set_mode(&self, mode: ClockMode, multiplier: i64) {
        let mut state = self.state.lock();
        state.mode = mode;
        state.start = wall_now();
        state.offset = 0;
        state.multiplier = multiplier.max(1);
    }

    /// Zeroes the offset and restarts `start`, keeping the mode.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use paper_tiger::clock::{ClockMode, VirtualClock};
    ///
    /// let clock = VirtualClock::new();
    /// clock.set_mode(ClockMode::Manual, 1);
    /// clock.advance(999);
    /// clock.reset();
    /// assert_eq!(clock.mode(), ClockMode::Manual);
    /// ```
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.start = wall_now();
        state.offset = 0;
    }

    /// The current mode.
    pub fn mode(&self) -> ClockMode {
        self.state.lock().mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_mode_is_frozen_until_advanced() {
        let clock = VirtualClock::new();
        clock.set_mode(ClockMode::Manual, 1);
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);
        clock.advance(3600);
        assert_eq!(clock.now(), t0 + 3600);
        clock.advance(30 * 86_400);
        assert_eq!(clock.now(), t0 + 3600 + 30 * 86_400);
    }

    #[test]
    fn set_mode_zeroes_offset() {
        let clock = VirtualClock::new();
        clock.set_mode(ClockMode::Manual, 1);
        clock.advance(999);
        clock.set_mode(ClockMode::Manual, 1);
        let t0 = clock.now();
        clock.reset();
        // reset restarts from wall-now; offset is gone either way
        assert!(clock.now() >= t0 - 1);
    }

    #[test]
    fn real_mode_ignores_advance() {
        let clock = VirtualClock::new();
        let before = clock.now();
        clock.advance(10_000);
        assert!(clock.now() - before < 10_000);
    }

    #[test]
    fn now_is_monotonic_without_mode_changes() {
        let clock = VirtualClock::new();
        clock.set_mode(ClockMode::Accelerated, 1000);
        let mut last = clock.now();
        for _ in 0..100 {
            let next = clock.now();
            assert!(next >= last);
            last = next;
        }
    }

    #[test]
    fn multiplier_clamps_to_one() {
        let clock = VirtualClock::new();
        clock.set_mode(ClockMode::Accelerated, 0);
        // must not panic or go backwards
        assert!(clock.now() >= 0);
    }
}
