//! Breakpoint hook and debugger-helper state.
//!
//! The interactive notion of "stop at a recorded byte position" is split
//! into two injectable pieces: a [`DebugHook`] fired when a draw crosses a
//! configured breakpoint, and a [`DebugState`] holding the process-wide
//! bookkeeping around it (has any session triggered, which positions the
//! operator chose to skip). Nothing here is a hidden global: the runner owns
//! a `DebugState` and threads it into every context, so tests substitute
//! their own instances and counting hooks freely.
//!
//! State starts empty and has no teardown.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Fired when a draw advances the stream across a configured breakpoint
/// position. Implementations must tolerate concurrent calls from worker
/// threads.
pub trait DebugHook: Send + Sync {
    fn on_breakpoint(&self, seed: u64, position: u64);
}

/// Process-wide debugger-session state.
#[derive(Debug, Default)]
pub struct DebugState {
    active: AtomicBool,
    hits: AtomicU64,
    ignored: Mutex<BTreeSet<u64>>,
}

impl DebugState {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once any breakpoint has fired in this process. Timeout handling
    /// consults this: a case is never cooperatively cancelled after a
    /// session has triggered.
    #[inline]
    pub fn session_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Total breakpoints fired.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Suppress future firing at `position` ("continue, and don't stop here
    /// again").
    pub fn ignore_position(&self, position: u64) {
        self.ignored_set().insert(position);
    }

    pub fn is_ignored(&self, position: u64) -> bool {
        self.ignored_set().contains(&position)
    }

    pub(crate) fn record_hit(&self) {
        self.active.store(true, Ordering::Release);
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    // Test bodies panic routinely; a poisoned lock here must not cascade.
    fn ignored_set(&self) -> std::sync::MutexGuard<'_, BTreeSet<u64>> {
        self.ignored.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Default hook: a log notice. Real debugger integration replaces this; the
/// unit tests count invocations instead.
#[derive(Debug, Default)]
pub struct LoggingHook;

impl DebugHook for LoggingHook {
    fn on_breakpoint(&self, seed: u64, position: u64) {
        let seed_hex = format!("{seed:x}");
        tracing::warn!(seed = %seed_hex, position, "breakpoint reached");
    }
}
