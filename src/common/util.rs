use std::sync::atomic::{AtomicU64, Ordering};

static TICKS: AtomicU64 = AtomicU64::new(1);

/// Returns a process-wide monotonically increasing tick.
///
/// Used for container last-active times and pending-event defer stamps. A
/// counter instead of wall-clock time keeps ordering comparisons exact and
/// tests deterministic.
pub fn next_tick() -> u64 {
    TICKS.fetch_add(1, Ordering::Relaxed)
}
