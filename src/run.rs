//! Run configuration and the orchestrator.
//!
//! # Run phases
//!
//! ```text
//!   validate config
//!        │
//!        ▼
//!   open failure store ──────────► <name>.broken
//!        │
//!        ▼
//!   replay known failures          always sequential
//!     unresolved, then resolved
//!        │
//!        ▼
//!   replay explicit cases          always sequential
//!        │
//!        ▼
//!   fresh random cases             sequential, or pooled when
//!        │                         concurrency > 1
//!        ▼
//!   RunSummary
//! ```
//!
//! Stop conditions (captured failures at the limit, case count exhausted,
//! total-run budget spent) are checked between cases. An in-flight case is
//! never preempted by a stop condition; the watchdog budgets in
//! [`exec`](crate::exec) are what interrupt a case.
//!
//! Replays always run in this process, one at a time, whatever the
//! configured concurrency. Reproduction is only believable when nothing
//! else is interleaving with the case.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::context::{CaseSetup, DEFAULT_PLACEMARK};
use crate::debug::{DebugHook, DebugState};
use crate::error::HarnessError;
use crate::exec::{CaseExecutor, CaseOutcome, CaseStatus, TimeBudgets};
use crate::pool::{PoolSpec, PoolSupervisor, WorkerOutcome, WorkerTransport, WorkerVerdict};
use crate::store::{now_store_time, FailureRecord, FailureStore};
use crate::stream::SeedStream;
use crate::testable::{qualified_name, simple_name, TestableRegistry};

/// Environment override for the fresh-case seed source. Accepts decimal or
/// `0x`-prefixed hex.
pub const SEED_ENV: &str = "REGRESS_SEED";

// ============================================================================
// Configuration
// ============================================================================

/// An explicitly requested replay: a seed, plus the placemark positions to
/// arm as breakpoints when debug-on-reproduce is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplicitCase {
    pub seed: u64,
    pub placemarks: BTreeMap<String, u64>,
}

impl ExplicitCase {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            placemarks: BTreeMap::new(),
        }
    }

    pub fn with_placemark(mut self, name: impl Into<String>, position: u64) -> Self {
        self.placemarks.insert(name.into(), position);
        self
    }
}

/// How fresh-case workers are hosted when `concurrency > 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerTransportKind {
    /// Re-execute the current binary in worker mode. The default.
    Subprocess,
    /// In-process worker threads speaking the same protocol over channels.
    /// What the pool tests use; also handy for embedders that cannot
    /// re-execute themselves.
    Threads,
}

/// Everything one run needs. Field defaults are in [`RunConfig::new`];
/// `validate` rejects inconsistent combinations before anything executes.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Registered name of the testable this run exercises.
    pub testable: String,
    /// Replay the failure store before fresh cases. Default true.
    pub revisit_known_failures: bool,
    /// Arm recorded positions as breakpoints during replays and suspend
    /// watchdog budgets for them. Default false.
    pub debug_on_reproduce: bool,
    /// Specific cases to replay after the known failures. Default empty.
    pub explicit_cases: Vec<ExplicitCase>,
    /// Fresh random cases to run; `None` means unlimited (requires a
    /// total-run budget). Default `Some(0)`.
    pub random_cases: Option<u64>,
    /// Stop once this many failures are captured. Default 1.
    pub max_failures: usize,
    /// Resolved records kept in the store before eviction. Default 5.
    pub max_remembered_fixes: usize,
    /// Watchdog budgets. Default none.
    pub budgets: TimeBudgets,
    /// Fresh-case parallelism. Default 1 (sequential, in process).
    pub concurrency: usize,
    /// Recognized placemark names, in store-column order.
    /// Default `["placemark"]`.
    pub placemark_names: Vec<String>,
    /// One line per case on stdout. Default false.
    pub print_progress: bool,
    /// Failure details on stderr. Default true.
    pub print_failures: bool,
    /// Persist failures to the store file. Default true.
    pub persist_failures: bool,
    /// Directory for the store file; default next to the current executable.
    pub store_dir: Option<PathBuf>,
    /// Name the store file after the full `::` path (with `.` separators)
    /// instead of the last segment. Default false.
    pub qualified_store_names: bool,
    /// Seed for the fresh-case seed source; `None` draws one from the
    /// clock so every run explores new ground. Default `None`.
    pub initial_seed: Option<u64>,
    /// Supervisor heartbeat period for pooled runs. Default 1s.
    pub heartbeat_interval: Duration,
    /// Worker hosting for pooled runs. Default subprocesses.
    pub worker_transport: WorkerTransportKind,
}

impl RunConfig {
    pub fn new(testable: impl Into<String>) -> Self {
        Self {
            testable: testable.into(),
            revisit_known_failures: true,
            debug_on_reproduce: false,
            explicit_cases: Vec::new(),
            random_cases: Some(0),
            max_failures: 1,
            max_remembered_fixes: 5,
            budgets: TimeBudgets::none(),
            concurrency: 1,
            placemark_names: vec![DEFAULT_PLACEMARK.to_string()],
            print_progress: false,
            print_failures: true,
            persist_failures: true,
            store_dir: None,
            qualified_store_names: false,
            initial_seed: None,
            heartbeat_interval: Duration::from_secs(1),
            worker_transport: WorkerTransportKind::Subprocess,
        }
    }

    /// Defaults plus the `REGRESS_SEED` environment override, so a failing
    /// CI run can be rerun byte-for-byte locally.
    pub fn from_env_defaults(testable: impl Into<String>) -> Self {
        let mut config = Self::new(testable);
        if let Ok(raw) = std::env::var(SEED_ENV) {
            match parse_seed(&raw) {
                Some(seed) => config.initial_seed = Some(seed),
                None => tracing::warn!(%raw, "ignoring unparsable {SEED_ENV}"),
            }
        }
        config
    }

    /// Use every core for fresh cases.
    pub fn all_cores(mut self) -> Self {
        self.concurrency = num_cpus::get().max(1);
        self
    }

    /// Reject inconsistent configurations before anything runs.
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.testable.trim().is_empty() {
            return Err(HarnessError::config("testable name must not be empty"));
        }
        if self.placemark_names.is_empty() {
            return Err(HarnessError::config(
                "at least one placemark name is required",
            ));
        }
        for name in &self.placemark_names {
            if name.is_empty() || name.contains(',') || name.contains(':') {
                return Err(HarnessError::config(format!(
                    "placemark name {name:?} must be non-empty and contain neither ',' nor ':'"
                )));
            }
        }
        if let Some(dup) = first_duplicate(&self.placemark_names) {
            return Err(HarnessError::config(format!(
                "duplicate placemark name {dup:?}"
            )));
        }
        if self.concurrency == 0 {
            return Err(HarnessError::config("concurrency must be at least 1"));
        }
        if self.max_failures == 0 {
            return Err(HarnessError::config("max_failures must be at least 1"));
        }
        if self.random_cases.is_none() && self.budgets.max_run.is_none() {
            return Err(HarnessError::config(
                "unlimited random cases require a total-run budget",
            ));
        }
        if self.random_cases == Some(0)
            && self.explicit_cases.is_empty()
            && !self.revisit_known_failures
        {
            return Err(HarnessError::config(
                "nothing to run: no random cases, no explicit cases, and known-failure \
                 replay is disabled",
            ));
        }
        if self.persist_failures && self.max_remembered_fixes == 0 {
            return Err(HarnessError::config(
                "max_remembered_fixes must be at least 1 when failures are persisted",
            ));
        }
        if self.concurrency > 1 && self.heartbeat_interval.is_zero() {
            return Err(HarnessError::config(
                "heartbeat interval must be non-zero for pooled runs",
            ));
        }
        Ok(())
    }

    /// Store file stem for this testable under the configured name policy.
    pub fn store_stem(&self) -> String {
        if self.qualified_store_names {
            qualified_name(&self.testable)
        } else {
            simple_name(&self.testable).to_string()
        }
    }

    pub(crate) fn store_path(&self) -> PathBuf {
        FailureStore::locate(
            self.store_dir.as_deref(),
            &self.store_stem(),
            &qualified_name(&self.testable),
        )
    }
}

fn first_duplicate(names: &[String]) -> Option<&str> {
    let mut seen = std::collections::BTreeSet::new();
    names
        .iter()
        .find(|n| !seen.insert(n.as_str()))
        .map(|n| n.as_str())
}

fn parse_seed(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        raw.parse().ok()
    }
}

/// Clock-derived seed for runs without an explicit one. Mixes the pid so
/// harnesses started in the same tick still diverge.
pub(crate) fn entropy_seed() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    nanos ^ u64::from(std::process::id()).rotate_left(32)
}

// ============================================================================
// Summary
// ============================================================================

/// What a finished run looked like.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub cases: u64,
    pub passed: u64,
    pub failures: u64,
    /// Known failures that passed this run and were marked fixed.
    pub fixed: u64,
    /// Resolved records that failed again this run.
    pub regressed: u64,
    pub elapsed: Duration,
    /// Replay coordinates and detail of the first captured failure.
    pub first_failure: Option<String>,
}

impl RunSummary {
    pub fn all_passed(&self) -> bool {
        self.failures == 0
    }

    /// Raise the first captured failure as a hard error, for embedding a
    /// run inside a `#[test]` function.
    pub fn into_result(self) -> Result<(), HarnessError> {
        match self.first_failure {
            None => Ok(()),
            Some(message) => Err(HarnessError::CaseFailed(message)),
        }
    }
}

struct Tally {
    started: Instant,
    cases: u64,
    passed: u64,
    failures: u64,
    fixed: u64,
    regressed: u64,
    first_failure: Option<String>,
}

impl Tally {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            cases: 0,
            passed: 0,
            failures: 0,
            fixed: 0,
            regressed: 0,
            first_failure: None,
        }
    }

    fn into_summary(self) -> RunSummary {
        RunSummary {
            cases: self.cases,
            passed: self.passed,
            failures: self.failures,
            fixed: self.fixed,
            regressed: self.regressed,
            elapsed: self.started.elapsed(),
            first_failure: self.first_failure,
        }
    }
}

fn stop_reached(tally: &Tally, config: &RunConfig) -> bool {
    if tally.failures >= config.max_failures as u64 {
        return true;
    }
    if let Some(max_run) = config.budgets.max_run {
        if tally.started.elapsed() >= max_run {
            return true;
        }
    }
    false
}

// ============================================================================
// Runner
// ============================================================================

/// Owns one run from validation to summary.
pub struct Runner {
    config: RunConfig,
    registry: TestableRegistry,
    hook: Option<Arc<dyn DebugHook>>,
    debug: Arc<DebugState>,
}

impl Runner {
    pub fn new(config: RunConfig, registry: TestableRegistry) -> Result<Self, HarnessError> {
        config.validate()?;
        if !registry.contains(&config.testable) {
            return Err(HarnessError::config(format!(
                "testable {:?} is not registered",
                config.testable
            )));
        }
        Ok(Self {
            config,
            registry,
            hook: None,
            debug: Arc::new(DebugState::new()),
        })
    }

    /// Install the hook fired at breakpoint crossings during replays.
    pub fn with_debug_hook(mut self, hook: Arc<dyn DebugHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Share debugger-helper state with the caller (ignore set, hit
    /// counters). A fresh private one is used otherwise.
    pub fn with_debug_state(mut self, debug: Arc<DebugState>) -> Self {
        self.debug = debug;
        self
    }

    pub fn run(self) -> Result<RunSummary, HarnessError> {
        let Runner {
            config,
            registry,
            hook,
            debug,
        } = self;

        let store = if config.persist_failures || config.revisit_known_failures {
            let path = config.store_path();
            tracing::debug!(path = %path.display(), "opening failure store");
            Some(FailureStore::open(
                path,
                &config.placemark_names,
                config.max_remembered_fixes,
            )?)
        } else {
            None
        };
        let executor = CaseExecutor::new(config.budgets, Arc::clone(&debug), config.debug_on_reproduce);

        let mut state = RunState {
            config,
            registry,
            hook,
            debug,
            store,
            executor,
            tally: Tally::new(),
        };
        let result = state.run_phases();
        let RunState {
            executor,
            tally,
            config,
            ..
        } = state;
        executor.shutdown();
        result?;

        let summary = tally.into_summary();
        if config.print_progress {
            println!(
                "[{}] {} cases: {} passed, {} failed, {} fixed, {} regressed in {:?}",
                config.testable,
                summary.cases,
                summary.passed,
                summary.failures,
                summary.fixed,
                summary.regressed,
                summary.elapsed
            );
        }
        Ok(summary)
    }
}

struct RunState {
    config: RunConfig,
    registry: TestableRegistry,
    hook: Option<Arc<dyn DebugHook>>,
    debug: Arc<DebugState>,
    store: Option<FailureStore>,
    executor: CaseExecutor,
    tally: Tally,
}

impl RunState {
    fn run_phases(&mut self) -> Result<(), HarnessError> {
        if self.config.revisit_known_failures {
            self.replay_known()?;
        }
        if self.stop_reached() {
            return Ok(());
        }
        self.replay_explicit()?;
        if self.stop_reached() {
            return Ok(());
        }
        self.fresh_cases()
    }

    fn stop_reached(&self) -> bool {
        stop_reached(&self.tally, &self.config)
    }

    /// Store handle for mutations, or `None` when persistence is off.
    /// Replay-only runs read the store but never rewrite it.
    fn store_for_writes(&mut self) -> Option<&mut FailureStore> {
        if self.config.persist_failures {
            self.store.as_mut()
        } else {
            None
        }
    }

    // ------------------------------------------------------------------
    // Replays
    // ------------------------------------------------------------------

    fn replay_known(&mut self) -> Result<(), HarnessError> {
        let records: Vec<FailureRecord> = match &self.store {
            Some(store) => store
                .unresolved()
                .cloned()
                .chain(
                    store
                        .resolved()
                        .take(self.config.max_remembered_fixes)
                        .cloned(),
                )
                .collect(),
            None => return Ok(()),
        };
        if !records.is_empty() {
            tracing::debug!(count = records.len(), "replaying known failures");
        }
        for record in &records {
            if self.stop_reached() {
                return Ok(());
            }
            self.replay_record(record)?;
        }
        Ok(())
    }

    fn replay_record(&mut self, record: &FailureRecord) -> Result<(), HarnessError> {
        let breakpoints: Vec<u64> = if self.config.debug_on_reproduce {
            record
                .placemarks
                .values()
                .copied()
                .chain([record.position])
                .collect()
        } else {
            Vec::new()
        };
        let outcome = self.run_one(record.seed, true, &breakpoints)?;

        if outcome.passed() {
            self.tally.passed += 1;
            if record.is_resolved() {
                tracing::debug!(seed = record.seed, "resolved record still passing");
            } else {
                self.note_fixed(record)?;
            }
            return Ok(());
        }

        if record.is_resolved() {
            self.tally.regressed += 1;
            if let Some(store) = self.store_for_writes() {
                store.mark_regressed(record)?;
            }
            self.note_failure("regression", &outcome);
            return Ok(());
        }

        if outcome.position == record.position {
            self.note_failure("known failure reproduced", &outcome);
        } else {
            // Same seed, different failure position: the code under test
            // changed shape. Keep the record, under the fresh coordinates.
            tracing::warn!(
                seed = record.seed,
                recorded = record.position,
                observed = outcome.position,
                "known failure moved to a different position"
            );
            if let Some(store) = self.store_for_writes() {
                store.update_position(record, outcome.position, outcome.placemarks.clone())?;
            }
            self.note_failure("known failure moved", &outcome);
        }
        Ok(())
    }

    fn replay_explicit(&mut self) -> Result<(), HarnessError> {
        let cases = self.config.explicit_cases.clone();
        for case in &cases {
            if self.stop_reached() {
                return Ok(());
            }
            let breakpoints: Vec<u64> = if self.config.debug_on_reproduce {
                case.placemarks.values().copied().collect()
            } else {
                Vec::new()
            };
            let outcome = self.run_one(case.seed, true, &breakpoints)?;
            if outcome.passed() {
                self.tally.passed += 1;
            } else {
                self.record_new_failure(&outcome)?;
                self.note_failure("explicit case failed", &outcome);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Fresh cases
    // ------------------------------------------------------------------

    fn fresh_cases(&mut self) -> Result<(), HarnessError> {
        if self.config.random_cases == Some(0) {
            return Ok(());
        }
        let run_seed = self.config.initial_seed.unwrap_or_else(entropy_seed);
        tracing::debug!(run_seed, "fresh-case seed source");
        if self.config.print_progress {
            println!("[{}] fresh-case seed source {:x}", self.config.testable, run_seed);
        }
        let source = SeedStream::new(run_seed);
        if self.config.concurrency <= 1 {
            self.fresh_sequential(source)
        } else {
            self.fresh_pooled(source)
        }
    }

    fn fresh_sequential(&mut self, mut source: SeedStream) -> Result<(), HarnessError> {
        let mut remaining = self.config.random_cases;
        loop {
            if self.stop_reached() {
                return Ok(());
            }
            match remaining {
                Some(0) => return Ok(()),
                Some(ref mut n) => *n -= 1,
                None => {}
            }
            let seed = source.next_u64();
            let outcome = self.run_one(seed, false, &[])?;
            if outcome.passed() {
                self.tally.passed += 1;
            } else {
                self.record_new_failure(&outcome)?;
                self.note_failure(fresh_failure_label(&outcome.status), &outcome);
            }
        }
    }

    fn fresh_pooled(&mut self, mut source: SeedStream) -> Result<(), HarnessError> {
        let spec = PoolSpec {
            workers: self.config.concurrency,
            testable: self.config.testable.clone(),
            placemark_names: self.config.placemark_names.clone(),
            budgets: self.config.budgets,
            heartbeat_interval: self.config.heartbeat_interval,
            transport: match self.config.worker_transport {
                WorkerTransportKind::Subprocess => WorkerTransport::Subprocess,
                WorkerTransportKind::Threads => {
                    WorkerTransport::Threads(self.registry.clone())
                }
            },
        };
        let mut pool = PoolSupervisor::start(spec)?;

        let mut remaining = self.config.random_cases;
        let mut store_error: Option<HarnessError> = None;
        let assign_result = loop {
            if stop_reached(&self.tally, &self.config) {
                break Ok(());
            }
            match remaining {
                Some(0) => break Ok(()),
                Some(ref mut n) => *n -= 1,
                None => {}
            }
            let seed = source.next_u64();
            let config = &self.config;
            let tally = &mut self.tally;
            let store = &mut self.store;
            let assigned = pool.execute(seed, &mut |outcome| {
                if let Err(e) = absorb_worker_outcome(config, tally, store, outcome) {
                    store_error.get_or_insert(e);
                }
            });
            if let Err(e) = assigned {
                break Err(e);
            }
        };

        let config = &self.config;
        let tally = &mut self.tally;
        let store = &mut self.store;
        let stop_result = pool.stop(&mut |outcome| {
            if let Err(e) = absorb_worker_outcome(config, tally, store, outcome) {
                store_error.get_or_insert(e);
            }
        });

        assign_result?;
        if let Some(e) = store_error.take() {
            return Err(e);
        }
        let stats = stop_result?;
        tracing::debug!(
            assigned = stats.assigned,
            completed = stats.completed,
            dead_workers = stats.dead_workers,
            "worker pool drained"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shared pieces
    // ------------------------------------------------------------------

    /// Run one case on the in-process executor.
    fn run_one(
        &mut self,
        seed: u64,
        reproducing: bool,
        breakpoints: &[u64],
    ) -> Result<CaseOutcome, HarnessError> {
        let mut setup = CaseSetup::new(&self.config.placemark_names)
            .with_debug_state(Arc::clone(&self.debug))
            .with_check_in_tracking(self.config.budgets.wants_check_ins())
            .with_breakpoints(breakpoints);
        if let Some(hook) = &self.hook {
            setup = setup.with_hook(Arc::clone(hook));
        }
        let ctx = setup.context(seed, reproducing);
        let body = self.registry.create(&self.config.testable)?;
        let outcome = self.executor.run_case(ctx, body)?;
        self.tally.cases += 1;
        if self.config.print_progress {
            let verdict = match &outcome.status {
                CaseStatus::Passed => "passed",
                CaseStatus::Failed { .. } => "FAILED",
                CaseStatus::TimedOut { .. } => "TIMED OUT",
            };
            println!(
                "[{}] case {} seed {:x} position {} {} in {:?}",
                self.config.testable,
                self.tally.cases,
                seed,
                outcome.position,
                verdict,
                outcome.elapsed
            );
        }
        Ok(outcome)
    }

    fn record_new_failure(&mut self, outcome: &CaseOutcome) -> Result<(), HarnessError> {
        if let Some(store) = self.store_for_writes() {
            let record = FailureRecord::new(
                outcome.seed,
                outcome.position,
                outcome.placemarks.clone(),
                now_store_time(),
            );
            store.record_failure(record)?;
        }
        Ok(())
    }

    fn note_fixed(&mut self, record: &FailureRecord) -> Result<(), HarnessError> {
        self.tally.fixed += 1;
        tracing::info!(
            seed = record.seed,
            position = record.position,
            "known failure now passes; marking fixed"
        );
        if self.config.print_failures {
            println!(
                "fixed: {} seed {:x} position {} now passes",
                self.config.testable, record.seed, record.position
            );
        }
        if let Some(store) = self.store_for_writes() {
            store.mark_fixed(record, now_store_time())?;
        }
        Ok(())
    }

    fn note_failure(&mut self, label: &str, outcome: &CaseOutcome) {
        self.tally.failures += 1;
        let detail = outcome.status.message().unwrap_or("no detail");
        let message = format!(
            "{label}: {} seed {:x} position {}: {detail}",
            self.config.testable, outcome.seed, outcome.position
        );
        if self.tally.first_failure.is_none() {
            self.tally.first_failure = Some(message.clone());
        }
        if self.config.print_failures {
            eprintln!("{message}");
            for (name, position) in &outcome.placemarks {
                eprintln!("  {name} = {position}");
            }
        }
        tracing::debug!(%message, "captured failure");
    }
}

fn fresh_failure_label(status: &CaseStatus) -> &'static str {
    match status {
        CaseStatus::TimedOut { .. } => "case timed out",
        _ => "new failure",
    }
}

fn absorb_worker_outcome(
    config: &RunConfig,
    tally: &mut Tally,
    store: &mut Option<FailureStore>,
    outcome: WorkerOutcome,
) -> Result<(), HarnessError> {
    tally.cases += 1;
    if config.print_progress {
        let verdict = match &outcome.verdict {
            WorkerVerdict::Passed => "passed",
            WorkerVerdict::Failed { .. } => "FAILED",
        };
        println!(
            "[{}] case {} seed {:x} on worker {} {}",
            config.testable, outcome.case, outcome.seed, outcome.worker, verdict
        );
    }
    match outcome.verdict {
        WorkerVerdict::Passed => {
            tally.passed += 1;
            Ok(())
        }
        WorkerVerdict::Failed {
            position,
            placemarks,
            detail,
        } => {
            tally.failures += 1;
            let message = format!(
                "new failure: {} seed {:x} position {position}: {detail} (worker {})",
                config.testable, outcome.seed, outcome.worker
            );
            if tally.first_failure.is_none() {
                tally.first_failure = Some(message.clone());
            }
            if config.print_failures {
                eprintln!("{message}");
                for (name, mark) in &placemarks {
                    eprintln!("  {name} = {mark}");
                }
            }
            if config.persist_failures {
                if let Some(store) = store.as_mut() {
                    let record = FailureRecord::new(
                        outcome.seed,
                        position,
                        placemarks,
                        now_store_time(),
                    );
                    store.record_failure(record)?;
                }
            }
            Ok(())
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
