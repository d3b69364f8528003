//! Monotonic time used across the pipeline.
//!
//! All timestamps are microsecond ticks since boot. The firmware binary backs
//! [`Clock`] with the Embassy time driver; tests use a hand-advanced clock.

/// Microsecond instant since boot.
pub type Instant = fugit::Instant<u64, 1, 1_000_000>;

/// Microsecond duration.
pub type Duration = fugit::Duration<u64, 1, 1_000_000>;

/// Source of the current time.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Seconds elapsed from `earlier` to `later`, zero if time went backwards.
pub fn seconds_between(earlier: Instant, later: Instant) -> f32 {
    match later.checked_duration_since(earlier) {
        Some(d) => d.ticks() as f32 * 1e-6,
        None => 0.0,
    }
}

/// Milliseconds since `start`, saturating at zero.
pub fn millis_since(start: Instant, now: Instant) -> u32 {
    now.checked_duration_since(start)
        .map(|d| d.to_millis() as u32)
        .unwrap_or(0)
}
