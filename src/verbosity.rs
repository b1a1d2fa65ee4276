//! Process-wide diagnostic verbosity.
//!
//! When the level is above zero, allocate and deallocate calls emit a trace
//! line through the `log` facade at info level. The level never changes
//! behavior.

use std::sync::atomic::{AtomicI32, Ordering};

static VERBOSITY: AtomicI32 = AtomicI32::new(0);

/// Current verbosity level.
#[must_use]
pub fn verbosity() -> i32 {
    VERBOSITY.load(Ordering::Relaxed)
}

/// Set the verbosity level. Values above zero enable allocation tracing.
pub fn set_verbosity(level: i32) {
    VERBOSITY.store(level, Ordering::Relaxed);
}

pub(crate) fn tracing() -> bool {
    verbosity() > 0
}
