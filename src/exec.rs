//! Case execution with watchdog supervision.
//!
//! # Architecture
//!
//! ```text
//!   calling thread                         case-worker thread
//!   ──────────────                         ──────────────────
//!   run_case(ctx, body) ──── request ────► recv request
//!     compute next deadline                catch_unwind(body.run(&mut ctx))
//!     recv_timeout(slice) ◄─── reply ───── send outcome
//!     on deadline: declare timeout,
//!       abandon worker, raise cancel flag
//! ```
//!
//! The worker thread is long-lived and reused across cases. The calling
//! thread supervises with `recv_timeout` slices against three independent
//! budgets: per-case, total-run (measured from the first case this executor
//! ran), and progress-interval (elapsed since the case's last check-in).
//!
//! # Timeout semantics
//!
//! A thread cannot be killed, so a timed-out case's worker is abandoned: a
//! fresh worker serves subsequent cases, and the stale reply is discarded by
//! generation stamp. Cancellation is cooperative: the abandoned case panics
//! at its next placemark, unless a debug session has ever triggered in this
//! process, in which case the case is left running untouched.
//!
//! While budgets can be suspended (a reproduction under an active debug
//! setup), the supervising thread just blocks on the reply.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};

use crate::context::{CaseContext, ProgressCell};
use crate::debug::DebugState;
use crate::error::HarnessError;
use crate::testable::Testable;

// ============================================================================
// Budgets and outcomes
// ============================================================================

/// The three watchdog budgets. Any subset may be configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeBudgets {
    /// Longest a single case may run.
    pub max_case: Option<Duration>,
    /// Longest the whole run may take, measured from the first case.
    pub max_run: Option<Duration>,
    /// Longest a case may go without a check-in (placemark).
    pub max_progress: Option<Duration>,
}

impl TimeBudgets {
    pub fn none() -> Self {
        Self::default()
    }

    /// Check-in tracking is only worth paying for when a progress budget
    /// will read it.
    pub fn wants_check_ins(&self) -> bool {
        self.max_progress.is_some()
    }
}

/// Which budget a timed-out case exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Case,
    Run,
    Progress,
}

impl TimeoutKind {
    fn describe(self) -> &'static str {
        match self {
            TimeoutKind::Case => "per-case",
            TimeoutKind::Run => "total-run",
            TimeoutKind::Progress => "progress-interval",
        }
    }
}

/// Verdict for one executed case. Timeouts are a distinct kind rather than
/// a message-text convention so callers can branch on them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseStatus {
    Passed,
    Failed { message: String },
    TimedOut { kind: TimeoutKind, message: String },
}

impl CaseStatus {
    pub fn is_failure(&self) -> bool {
        !matches!(self, CaseStatus::Passed)
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            CaseStatus::Passed => None,
            CaseStatus::Failed { message } | CaseStatus::TimedOut { message, .. } => Some(message),
        }
    }
}

/// Everything a failure record needs, plus timing.
///
/// For timed-out cases the position and placemarks come from the progress
/// cell, so they are placemark-granular: the body stopped reporting, and
/// this is the last view it gave us.
#[derive(Debug, Clone)]
pub struct CaseOutcome {
    pub seed: u64,
    pub position: u64,
    pub placemarks: BTreeMap<String, u64>,
    pub elapsed: Duration,
    pub status: CaseStatus,
}

impl CaseOutcome {
    pub fn passed(&self) -> bool {
        matches!(self.status, CaseStatus::Passed)
    }
}

// ============================================================================
// Executor
// ============================================================================

struct CaseRequest {
    generation: u64,
    ctx: CaseContext,
    body: Box<dyn Testable>,
}

struct CaseReply {
    generation: u64,
    outcome: CaseOutcome,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn worker_loop(requests: Receiver<CaseRequest>, replies: Sender<CaseReply>) {
    while let Ok(request) = requests.recv() {
        let CaseRequest {
            generation,
            mut ctx,
            mut body,
        } = request;
        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| body.run(&mut ctx)));
        let status = match result {
            Ok(Ok(())) => CaseStatus::Passed,
            Ok(Err(e)) => CaseStatus::Failed {
                message: e.to_string(),
            },
            Err(payload) => CaseStatus::Failed {
                message: panic_message(payload.as_ref()),
            },
        };
        let outcome = CaseOutcome {
            seed: ctx.seed(),
            position: ctx.position(),
            placemarks: ctx.placemarks().clone(),
            elapsed: started.elapsed(),
            status,
        };
        if replies.send(CaseReply { generation, outcome }).is_err() {
            break;
        }
    }
}

/// Runs cases on a dedicated worker thread under watchdog budgets.
pub struct CaseExecutor {
    budgets: TimeBudgets,
    debug: Arc<DebugState>,
    /// Budgets are suspended for reproducing cases when set; a human may be
    /// stepping through the replay.
    debug_reproductions: bool,
    reply_tx: Sender<CaseReply>,
    reply_rx: Receiver<CaseReply>,
    request_tx: Option<Sender<CaseRequest>>,
    worker: Option<JoinHandle<()>>,
    generation: u64,
    run_started: Option<Instant>,
}

impl CaseExecutor {
    pub fn new(budgets: TimeBudgets, debug: Arc<DebugState>, debug_reproductions: bool) -> Self {
        let (reply_tx, reply_rx) = unbounded();
        Self {
            budgets,
            debug,
            debug_reproductions,
            reply_tx,
            reply_rx,
            request_tx: None,
            worker: None,
            generation: 0,
            run_started: None,
        }
    }

    pub fn budgets(&self) -> TimeBudgets {
        self.budgets
    }

    fn ensure_worker(&mut self) -> Result<(), HarnessError> {
        if self.worker.is_some() {
            return Ok(());
        }
        let (request_tx, request_rx) = bounded::<CaseRequest>(1);
        let reply_tx = self.reply_tx.clone();
        let worker = thread::Builder::new()
            .name("case-worker".into())
            .spawn(move || worker_loop(request_rx, reply_tx))
            .map_err(|e| HarnessError::Pool(format!("spawn case worker: {e}")))?;
        self.request_tx = Some(request_tx);
        self.worker = Some(worker);
        Ok(())
    }

    /// Run one case to a verdict. Never returns `Err` for a failing body;
    /// errors mean the executor itself cannot continue.
    pub fn run_case(
        &mut self,
        ctx: CaseContext,
        body: Box<dyn Testable>,
    ) -> Result<CaseOutcome, HarnessError> {
        self.ensure_worker()?;
        let run_started = *self.run_started.get_or_insert_with(Instant::now);
        let case_started = Instant::now();
        let seed = ctx.seed();
        let suspend = self.debug_reproductions && ctx.is_reproducing();
        let cell = Arc::clone(ctx.progress_cell());
        let generation = self.generation;

        let sender = self
            .request_tx
            .as_ref()
            .ok_or_else(|| HarnessError::Pool("case worker not running".into()))?;
        sender
            .send(CaseRequest {
                generation,
                ctx,
                body,
            })
            .map_err(|_| HarnessError::Pool("case worker thread is gone".into()))?;

        loop {
            let deadline = if suspend {
                None
            } else {
                self.next_deadline(case_started, run_started, &cell)
            };
            let reply = match deadline {
                None => self
                    .reply_rx
                    .recv()
                    .map_err(|_| HarnessError::Pool("case worker channel closed".into()))?,
                Some((at, kind)) => {
                    let now = Instant::now();
                    if now >= at {
                        return Ok(self.declare_timeout(kind, seed, case_started, &cell));
                    }
                    match self.reply_rx.recv_timeout(at - now) {
                        Ok(reply) => reply,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => {
                            return Err(HarnessError::Pool("case worker channel closed".into()))
                        }
                    }
                }
            };
            if reply.generation != generation {
                tracing::debug!("discarding reply from an abandoned case");
                continue;
            }
            return Ok(reply.outcome);
        }
    }

    /// Earliest pending deadline, if any budget is armed. The progress
    /// anchor moves with each check-in, so this is recomputed per wait.
    fn next_deadline(
        &self,
        case_started: Instant,
        run_started: Instant,
        cell: &ProgressCell,
    ) -> Option<(Instant, TimeoutKind)> {
        let mut best: Option<(Instant, TimeoutKind)> = None;
        let mut consider = |at: Instant, kind: TimeoutKind| {
            if best.map_or(true, |(b, _)| at < b) {
                best = Some((at, kind));
            }
        };
        if let Some(d) = self.budgets.max_case {
            consider(case_started + d, TimeoutKind::Case);
        }
        if let Some(d) = self.budgets.max_run {
            consider(run_started + d, TimeoutKind::Run);
        }
        if let Some(d) = self.budgets.max_progress {
            let anchor = cell.last_check_in().unwrap_or(case_started);
            consider(anchor + d, TimeoutKind::Progress);
        }
        best
    }

    fn declare_timeout(
        &mut self,
        kind: TimeoutKind,
        seed: u64,
        case_started: Instant,
        cell: &ProgressCell,
    ) -> CaseOutcome {
        // The stuck thread cannot be killed. Abandon it; the next case gets
        // a fresh worker and this generation's reply is discarded.
        self.generation += 1;
        self.request_tx = None;
        let _ = self.worker.take();
        if !self.debug.session_active() {
            cell.cancel();
        }

        let (position, placemarks) = cell.snapshot();
        let budget = match kind {
            TimeoutKind::Case => self.budgets.max_case,
            TimeoutKind::Run => self.budgets.max_run,
            TimeoutKind::Progress => self.budgets.max_progress,
        };
        let last_mark = placemarks
            .iter()
            .max_by_key(|&(_, p)| *p)
            .map(|(name, p)| format!("{name} at position {p}"))
            .unwrap_or_else(|| "none recorded".to_string());
        let message = format!(
            "{} budget {:?} exceeded; worker thread abandoned; last placemark: {}",
            kind.describe(),
            budget.unwrap_or_default(),
            last_mark
        );
        tracing::warn!(seed, position, %message, "case timed out");
        CaseOutcome {
            seed,
            position,
            placemarks,
            elapsed: case_started.elapsed(),
            status: CaseStatus::TimedOut { kind, message },
        }
    }

    /// Close the request channel and join the worker. Call after the last
    /// case; an abandoned worker is not waited for.
    pub fn shutdown(mut self) {
        self.request_tx = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
