//! Per-case context: the stream plus the replay instrumentation around it.
//!
//! # Purpose
//!
//! A [`CaseContext`] is what a test body actually holds while it runs. All
//! draws go through it, which is what lets the harness observe position,
//! fire breakpoints, and stamp placemarks without the body cooperating
//! beyond calling `placemark()` at interesting milestones.
//!
//! # Invariants
//!
//! - Recognized placemark names are fixed at construction; recording under
//!   any other name is an error, so failure files always have a stable
//!   column set.
//! - Breakpoint positions are sorted and deduplicated at construction; each
//!   is fired at most once per context, in order.
//! - A forked child shares breakpoints, names, the check-in cell, and the
//!   reproducing flag, but starts its own stream at position 0 with an
//!   empty placemark map.
//! - The progress cell is the only state the watchdog reads while a case is
//!   in flight; everything else stays owned by the running thread.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::debug::{DebugHook, DebugState};
use crate::error::HarnessError;
use crate::stream::SeedStream;

/// Name used by `placemark()` when the caller does not pick one.
pub const DEFAULT_PLACEMARK: &str = "placemark";

const NEVER: u64 = u64::MAX;

// ============================================================================
// Progress cell
// ============================================================================

/// Shared view of a running case, read by the watchdog thread.
///
/// Placemark recording is rare compared to draws, so a mutex around the mark
/// map is fine; the hot fields are atomics.
#[derive(Debug)]
pub(crate) struct ProgressCell {
    origin: Instant,
    /// Check-in times are tracked only when a progress budget needs them.
    track_check_in: bool,
    /// Nanos since `origin` of the last check-in; `NEVER` until the first.
    last_check_in: AtomicU64,
    /// Stream position at the last root-context placemark.
    last_position: AtomicU64,
    cancel: AtomicBool,
    marks: Mutex<BTreeMap<String, u64>>,
}

impl ProgressCell {
    fn new(track_check_in: bool) -> Self {
        Self {
            origin: Instant::now(),
            track_check_in,
            last_check_in: AtomicU64::new(NEVER),
            last_position: AtomicU64::new(0),
            cancel: AtomicBool::new(false),
            marks: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn touch_time(&self) {
        if !self.track_check_in {
            return;
        }
        let nanos = self.origin.elapsed().as_nanos() as u64;
        self.last_check_in.store(nanos, Ordering::Release);
    }

    fn touch_mark(&self, name: &str, position: u64) {
        self.touch_time();
        self.last_position.store(position, Ordering::Release);
        self.marks_map().insert(name.to_owned(), position);
    }

    pub(crate) fn last_check_in(&self) -> Option<Instant> {
        if !self.track_check_in {
            return None;
        }
        match self.last_check_in.load(Ordering::Acquire) {
            NEVER => None,
            nanos => Some(self.origin + Duration::from_nanos(nanos)),
        }
    }

    pub(crate) fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Last-known placemark view of the case: furthest placemarked position
    /// plus the mark map. This is the diagnostic for cases that never come
    /// back on their own.
    pub(crate) fn snapshot(&self) -> (u64, BTreeMap<String, u64>) {
        let position = self.last_position.load(Ordering::Acquire);
        let marks = self.marks_map().clone();
        (position, marks)
    }

    // Mark maps outlive panicking test bodies; ignore poisoning.
    fn marks_map(&self) -> MutexGuard<'_, BTreeMap<String, u64>> {
        self.marks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// Case setup
// ============================================================================

/// Construction recipe shared by every context of a run.
///
/// Built once from the run configuration, then stamped per case with a seed
/// and a reproducing flag.
#[derive(Clone)]
pub struct CaseSetup {
    names: Arc<[String]>,
    breakpoints: Arc<[u64]>,
    hook: Option<Arc<dyn DebugHook>>,
    debug: Arc<DebugState>,
    track_check_in: bool,
}

impl CaseSetup {
    pub fn new<S: AsRef<str>>(names: &[S]) -> Self {
        let names: Vec<String> = names.iter().map(|n| n.as_ref().to_owned()).collect();
        Self {
            names: names.into(),
            breakpoints: Arc::new([]),
            hook: None,
            debug: Arc::new(DebugState::new()),
            track_check_in: false,
        }
    }

    /// Positions at which the debug hook fires. Sorted and deduplicated.
    pub fn with_breakpoints(mut self, positions: &[u64]) -> Self {
        let mut sorted = positions.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        self.breakpoints = sorted.into();
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn DebugHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn with_debug_state(mut self, debug: Arc<DebugState>) -> Self {
        self.debug = debug;
        self
    }

    /// Enable check-in tracking. Only needed when a progress budget is
    /// configured; off by default so unwatched runs skip the bookkeeping.
    pub fn with_check_in_tracking(mut self, enabled: bool) -> Self {
        self.track_check_in = enabled;
        self
    }

    pub fn placemark_names(&self) -> &[String] {
        &self.names
    }

    /// Build the context for one case.
    pub fn context(&self, seed: u64, reproducing: bool) -> CaseContext {
        CaseContext {
            stream: SeedStream::new(seed),
            names: Arc::clone(&self.names),
            breakpoints: Arc::clone(&self.breakpoints),
            next_breakpoint: 0,
            reproducing,
            is_fork: false,
            marks: BTreeMap::new(),
            cell: Arc::new(ProgressCell::new(self.track_check_in)),
            hook: self.hook.clone(),
            debug: Arc::clone(&self.debug),
        }
    }
}

// ============================================================================
// Case context
// ============================================================================

/// The handle a test body draws from.
pub struct CaseContext {
    stream: SeedStream,
    names: Arc<[String]>,
    breakpoints: Arc<[u64]>,
    next_breakpoint: usize,
    reproducing: bool,
    is_fork: bool,
    marks: BTreeMap<String, u64>,
    cell: Arc<ProgressCell>,
    hook: Option<Arc<dyn DebugHook>>,
    debug: Arc<DebugState>,
}

impl CaseContext {
    #[inline(always)]
    pub fn seed(&self) -> u64 {
        self.stream.seed()
    }

    /// Pseudo-random bytes consumed so far by this context's stream.
    #[inline(always)]
    pub fn position(&self) -> u64 {
        self.stream.position()
    }

    /// True when this context replays a known failure or an explicit case.
    /// Test bodies can branch on this to emit extra diagnostics.
    #[inline(always)]
    pub fn is_reproducing(&self) -> bool {
        self.reproducing
    }

    /// Placemarks recorded so far by this context (forked children keep
    /// their own maps).
    pub fn placemarks(&self) -> &BTreeMap<String, u64> {
        &self.marks
    }

    /// Instant of the most recent placemark. `None` until the first
    /// placemark, or always when check-in tracking is off.
    pub fn last_check_in(&self) -> Option<Instant> {
        self.cell.last_check_in()
    }

    pub(crate) fn progress_cell(&self) -> &Arc<ProgressCell> {
        &self.cell
    }

    // ------------------------------------------------------------------
    // Draws
    // ------------------------------------------------------------------

    pub fn next_u64(&mut self) -> u64 {
        let v = self.stream.next_u64();
        self.advanced();
        v
    }

    pub fn next_i64(&mut self) -> i64 {
        let v = self.stream.next_i64();
        self.advanced();
        v
    }

    pub fn next_u32(&mut self) -> u32 {
        let v = self.stream.next_u32();
        self.advanced();
        v
    }

    pub fn next_i32(&mut self) -> i32 {
        let v = self.stream.next_i32();
        self.advanced();
        v
    }

    pub fn next_u32_bounded(&mut self, bound: u32) -> u32 {
        let v = self.stream.next_u32_bounded(bound);
        self.advanced();
        v
    }

    pub fn next_i32_bounded(&mut self, bound: i32) -> i32 {
        let v = self.stream.next_i32_bounded(bound);
        self.advanced();
        v
    }

    pub fn next_f64(&mut self) -> f64 {
        let v = self.stream.next_f64();
        self.advanced();
        v
    }

    pub fn next_bool(&mut self) -> bool {
        let v = self.stream.next_bool();
        self.advanced();
        v
    }

    /// Fire the hook for every breakpoint the last draw crossed.
    fn advanced(&mut self) {
        let position = self.stream.position();
        while self.next_breakpoint < self.breakpoints.len()
            && self.breakpoints[self.next_breakpoint] <= position
        {
            let bp = self.breakpoints[self.next_breakpoint];
            self.next_breakpoint += 1;
            if self.debug.is_ignored(bp) {
                continue;
            }
            self.debug.record_hit();
            if let Some(hook) = &self.hook {
                hook.on_breakpoint(self.stream.seed(), bp);
            }
        }
    }

    // ------------------------------------------------------------------
    // Placemarks and forking
    // ------------------------------------------------------------------

    /// Record a placemark under the default name. See [`placemark_named`].
    ///
    /// [`placemark_named`]: CaseContext::placemark_named
    pub fn placemark(&mut self) -> Result<(), HarnessError> {
        self.placemark_named(DEFAULT_PLACEMARK)
    }

    /// Record `name -> position` and register a check-in.
    ///
    /// Consumes one bool draw first, so consecutive placemarks land on
    /// distinct positions and replay byte-for-byte. The recorded position is
    /// the one after that draw.
    ///
    /// Fails with `InvalidArgument` if `name` was not registered at
    /// construction.
    ///
    /// # Panics
    ///
    /// After the supervising thread has given up on this case, the next
    /// placemark panics to unwind the abandoned body.
    pub fn placemark_named(&mut self, name: &str) -> Result<(), HarnessError> {
        if !self.names.iter().any(|n| n == name) {
            return Err(HarnessError::invalid(format!(
                "unrecognized placemark name {name:?} (registered: {:?})",
                self.names
            )));
        }
        let _ = self.next_bool();
        let position = self.stream.position();
        self.marks.insert(name.to_owned(), position);
        if self.is_fork {
            self.cell.touch_time();
        } else {
            self.cell.touch_mark(name, position);
        }
        if self.cell.cancelled() {
            panic!("case abandoned by watchdog after timeout");
        }
        Ok(())
    }

    /// Derive a child context with its own stream.
    ///
    /// The child seed is one `u64` draw from this stream, so it is a pure
    /// function of `(seed, position)`. The child starts at position 0,
    /// shares breakpoints, recognized names, check-in cell and reproducing
    /// flag, and keeps its own placemark map. Child placemarks count as
    /// check-ins but do not enter the case's recorded mark set.
    pub fn fork(&mut self) -> CaseContext {
        let child_seed = self.stream.derive_child_seed();
        self.advanced();
        CaseContext {
            stream: SeedStream::new(child_seed),
            names: Arc::clone(&self.names),
            breakpoints: Arc::clone(&self.breakpoints),
            next_breakpoint: 0,
            reproducing: self.reproducing,
            is_fork: true,
            marks: BTreeMap::new(),
            cell: Arc::clone(&self.cell),
            hook: self.hook.clone(),
            debug: Arc::clone(&self.debug),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingHook {
        fired: Mutex<Vec<u64>>,
    }

    impl DebugHook for CountingHook {
        fn on_breakpoint(&self, _seed: u64, position: u64) {
            self.fired.lock().unwrap().push(position);
        }
    }

    fn setup() -> CaseSetup {
        CaseSetup::new(&["placemark", "stage"])
    }

    #[test]
    fn placemark_records_position_after_perturbation_draw() {
        let mut ctx = setup().context(1, false);
        ctx.next_u64();
        ctx.placemark_named("stage").unwrap();
        // 8 bytes for the u64, 1 for the placemark's bool draw.
        assert_eq!(ctx.placemarks().get("stage"), Some(&9));
        assert_eq!(ctx.position(), 9);
    }

    #[test]
    fn default_placemark_uses_default_name() {
        let mut ctx = setup().context(1, false);
        ctx.placemark().unwrap();
        assert!(ctx.placemarks().contains_key(DEFAULT_PLACEMARK));
    }

    #[test]
    fn unknown_placemark_name_is_rejected_without_a_draw() {
        let mut ctx = setup().context(1, false);
        let err = ctx.placemark_named("nope").unwrap_err();
        assert!(matches!(err, HarnessError::InvalidArgument(_)));
        assert_eq!(ctx.position(), 0);
    }

    #[test]
    fn replay_produces_identical_placemark_positions() {
        let run = |seed: u64| {
            let mut ctx = setup().context(seed, false);
            ctx.next_u32();
            ctx.placemark_named("stage").unwrap();
            ctx.next_u64();
            ctx.placemark().unwrap();
            ctx.placemarks().clone()
        };
        assert_eq!(run(77), run(77));
    }

    #[test]
    fn breakpoints_fire_in_order_once_each() {
        let hook = Arc::new(CountingHook::default());
        let setup = setup()
            .with_breakpoints(&[12, 4, 12, 20])
            .with_hook(hook.clone());
        let mut ctx = setup.context(3, false);
        ctx.next_u64(); // position 8, crosses 4
        ctx.next_u64(); // position 16, crosses 12
        ctx.next_u64(); // position 24, crosses 20
        ctx.next_u64(); // no further breakpoints
        assert_eq!(*hook.fired.lock().unwrap(), vec![4, 12, 20]);
        assert!(setup.debug.session_active());
        assert_eq!(setup.debug.hits(), 3);
    }

    #[test]
    fn one_draw_can_cross_several_breakpoints() {
        let hook = Arc::new(CountingHook::default());
        let setup = setup().with_breakpoints(&[1, 2, 3]).with_hook(hook.clone());
        let mut ctx = setup.context(3, false);
        ctx.next_u64();
        assert_eq!(*hook.fired.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn ignored_positions_are_skipped() {
        let hook = Arc::new(CountingHook::default());
        let debug = Arc::new(DebugState::new());
        debug.ignore_position(8);
        let setup = setup()
            .with_breakpoints(&[8, 16])
            .with_hook(hook.clone())
            .with_debug_state(debug.clone());
        let mut ctx = setup.context(3, false);
        ctx.next_u64();
        ctx.next_u64();
        assert_eq!(*hook.fired.lock().unwrap(), vec![16]);
        // Skipped breakpoints do not activate a session.
        assert_eq!(debug.hits(), 1);
    }

    #[test]
    fn fork_child_is_deterministic_and_independent() {
        let mk = || {
            let mut parent = setup().context(9, true);
            parent.next_u64();
            let child = parent.fork();
            (parent, child)
        };
        let (parent_a, mut child_a) = mk();
        let (_, mut child_b) = mk();

        assert_eq!(parent_a.position(), 16); // 8 drawn + 8 for the child seed
        assert_eq!(child_a.position(), 0);
        assert!(child_a.is_reproducing());
        assert_eq!(child_a.next_u64(), child_b.next_u64());
    }

    #[test]
    fn fork_placemarks_stay_out_of_parent_map_but_check_in() {
        let setup = setup().with_check_in_tracking(true);
        let mut parent = setup.context(9, false);
        let mut child = parent.fork();
        child.placemark_named("stage").unwrap();
        assert!(parent.placemarks().is_empty());
        assert!(child.placemarks().contains_key("stage"));
        assert!(parent.last_check_in().is_some());
    }

    #[test]
    fn check_in_is_none_when_tracking_disabled() {
        let mut ctx = setup().context(2, false);
        ctx.placemark().unwrap();
        assert!(ctx.last_check_in().is_none());
    }

    #[test]
    fn check_in_advances_with_placemarks() {
        let setup = setup().with_check_in_tracking(true);
        let mut ctx = setup.context(2, false);
        assert!(ctx.last_check_in().is_none());
        ctx.placemark().unwrap();
        let first = ctx.last_check_in().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        ctx.placemark().unwrap();
        let second = ctx.last_check_in().unwrap();
        assert!(second >= first);
    }

    #[test]
    fn cancelled_case_panics_at_next_placemark() {
        let mut ctx = setup().context(2, false);
        ctx.progress_cell().cancel();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = ctx.placemark();
        }));
        assert!(result.is_err());
    }

    #[test]
    fn hook_panics_do_not_poison_shared_state() {
        struct PanickyHook(AtomicUsize);
        impl DebugHook for PanickyHook {
            fn on_breakpoint(&self, _seed: u64, _position: u64) {
                if self.0.fetch_add(1, Ordering::Relaxed) == 0 {
                    panic!("hook exploded");
                }
            }
        }
        let debug = Arc::new(DebugState::new());
        let setup = setup()
            .with_breakpoints(&[4])
            .with_hook(Arc::new(PanickyHook(AtomicUsize::new(0))))
            .with_debug_state(debug.clone());
        let mut ctx = setup.context(3, false);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            ctx.next_u64();
        }));
        assert!(result.is_err());
        assert!(debug.session_active());
    }
}
