//! Process-wide debug mode.
//!
//! When enabled, every forward output and every backward-produced gradient
//! is scanned for NaN/Inf so numerical bugs surface at the operation that
//! introduced them. Disabled by default; the scan has zero cost when off.

use std::sync::atomic::{AtomicBool, Ordering};

static DEBUG: AtomicBool = AtomicBool::new(false);

/// Whether debug-mode value validation is enabled.
pub fn is_debug() -> bool {
    DEBUG.load(Ordering::Relaxed)
}

/// Enable or disable debug-mode value validation, returning the prior state.
pub fn set_debug(enabled: bool) -> bool {
    DEBUG.swap(enabled, Ordering::Relaxed)
}
