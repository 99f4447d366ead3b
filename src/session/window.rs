//! Context window bookkeeping
//!
//! Tracks the position cursor and the protected system boundary for a
//! single-sequence context, and decides when and how much to evict when
//! capacity runs out.

use thiserror::Error;

/// Positions kept free so there is always room for at least one more
/// decode step after an eviction check.
pub const EVICTION_RESERVE: u32 = 4;

/// Errors from context window bookkeeping
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WindowError {
    /// The cursor would move past capacity. This means an eviction check
    /// was skipped before submission; it is a controller bug, not a
    /// condition that occurs in normal operation.
    #[error("Context capacity exceeded: cursor {cursor} + {pending} > {capacity}")]
    CapacityExceeded {
        cursor: u32,
        pending: u32,
        capacity: u32,
    },
}

/// A planned context shift, to be applied to the backing KV memory.
///
/// Removes positions `[keep_start, keep_start + discard)` and renumbers
/// `[keep_start + discard, end)` down by `discard`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextShift {
    /// First evictable position (the system boundary).
    pub keep_start: u32,
    /// Number of positions removed.
    pub discard: u32,
    /// One past the last occupied position before the shift.
    pub end: u32,
}

/// Sliding context window for a single generation session.
///
/// Invariant: `system_boundary <= cursor <= capacity` between requests.
/// Positions below `system_boundary` are never evicted.
#[derive(Debug, Clone)]
pub struct ContextWindow {
    capacity: u32,
    cursor: u32,
    system_boundary: u32,
}

impl ContextWindow {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            cursor: 0,
            system_boundary: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Next free position.
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn system_boundary(&self) -> u32 {
        self.system_boundary
    }

    /// Clears the window for a new request.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.system_boundary = 0;
    }

    /// Pins the system boundary at the current cursor. Everything written
    /// so far becomes the protected prefix. Called at most once per reset.
    pub fn seal_system_boundary(&mut self) {
        self.system_boundary = self.cursor;
    }

    /// True when `pending` more positions would run into the reserve and
    /// the caller must evict before submitting.
    pub fn should_evict(&self, pending: usize) -> bool {
        self.cursor + pending as u32 >= self.capacity.saturating_sub(EVICTION_RESERVE)
    }

    /// Plans a half-window eviction: discards the oldest half of the
    /// movable region `[system_boundary, cursor)` and renumbers the rest
    /// down so positions stay contiguous.
    ///
    /// Returns `None` when the movable region is too small to discard
    /// anything. The window itself only does the arithmetic; applying the
    /// shift to the backing memory is the caller's job.
    pub fn evict(&mut self) -> Option<ContextShift> {
        let discard = (self.cursor - self.system_boundary) / 2;
        if discard == 0 {
            return None;
        }
        let shift = ContextShift {
            keep_start: self.system_boundary,
            discard,
            end: self.cursor,
        };
        self.cursor -= discard;
        tracing::info!(
            "Shifting context: discarding {} positions, cursor {} -> {}",
            discard,
            shift.end,
            self.cursor
        );
        Some(shift)
    }

    /// Moves the cursor forward by `n` freshly written positions.
    pub fn advance(&mut self, n: usize) -> Result<(), WindowError> {
        let n = n as u32;
        if self.cursor + n > self.capacity {
            return Err(WindowError::CapacityExceeded {
                cursor: self.cursor,
                pending: n,
                capacity: self.capacity,
            });
        }
        self.cursor += n;
        Ok(())
    }
}
