//! Worker-side loop.
//!
//! A worker reads assignment lines, runs each case through its own
//! [`CaseExecutor`], and reports started/passed/failed frames on stderr.
//! The same loop serves both transports: a subprocess feeds it from real
//! stdin via a reader thread, an in-process thread worker feeds it from a
//! channel directly. Either way the loop sees newline-stripped lines on a
//! `Receiver<String>` so it can enforce the supervisor-loss timeout with
//! `recv_timeout`.

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::thread;

use chrono::Local;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};

use crate::context::CaseSetup;
use crate::debug::DebugState;
use crate::error::HarnessError;
use crate::exec::{CaseExecutor, CaseStatus, TimeBudgets};
use crate::pool::protocol::{handshake_now, AssignFrame, ReportFrame, WorkerLaunch};
use crate::testable::TestableRegistry;

/// Stdin silence tolerated before a worker assumes its supervisor is gone,
/// as a multiple of the heartbeat interval.
pub(crate) const SUPERVISOR_LOSS_FACTOR: u32 = 5;

/// Worker-process entry point. `args` are the invocation arguments after
/// the marker; the registry must hold the launched testable.
///
/// Call this from `main` before anything else when the marker argument is
/// present, and exit with its result.
pub fn worker_main(args: &[String], registry: &TestableRegistry) -> Result<(), HarnessError> {
    let launch = WorkerLaunch::parse_args(args)?;
    let (line_tx, line_rx) = unbounded();
    thread::Builder::new()
        .name("worker-stdin".into())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) => {
                        if line_tx.send(line).is_err() {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
        })
        .map_err(|e| HarnessError::Pool(format!("spawn stdin reader: {e}")))?;

    let mut stderr = io::stderr();
    let mut report = move |line: String| {
        // Every report line is flushed as written; the supervisor's view of
        // this worker is only as fresh as its last flushed line.
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    };
    run_worker_loop(&launch, registry, &line_rx, &mut report)
}

/// The worker's remaining share of the total-run budget. The supervisor
/// passes its run start so late-starting workers do not restart the clock.
fn remaining_run_budget(launch: &WorkerLaunch) -> TimeBudgets {
    let mut budgets = launch.budgets;
    if let Some(max_run) = budgets.max_run {
        let elapsed = Local::now()
            .naive_local()
            .signed_duration_since(launch.run_started_at)
            .to_std()
            .unwrap_or_default();
        budgets.max_run = Some(max_run.saturating_sub(elapsed));
    }
    budgets
}

/// Serve assignments until stop, stdin loss, or supervisor silence.
pub(crate) fn run_worker_loop(
    launch: &WorkerLaunch,
    registry: &TestableRegistry,
    lines: &Receiver<String>,
    report: &mut dyn FnMut(String),
) -> Result<(), HarnessError> {
    let setup = CaseSetup::new(&launch.placemark_names)
        .with_check_in_tracking(launch.budgets.wants_check_ins());
    let debug = Arc::new(DebugState::new());
    let mut executor = CaseExecutor::new(remaining_run_budget(launch), debug, false);
    let silence_limit = launch
        .heartbeat_interval
        .saturating_mul(SUPERVISOR_LOSS_FACTOR);

    loop {
        let line = match lines.recv_timeout(silence_limit) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    worker = launch.worker_id,
                    "no supervisor traffic for {silence_limit:?}; shutting down"
                );
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match AssignFrame::parse(line.trim_end_matches(['\r', '\n'])) {
            Ok(AssignFrame::Heartbeat) => continue,
            Ok(AssignFrame::Stop) => break,
            Ok(AssignFrame::Case { case, seed }) => {
                report(
                    ReportFrame::Started {
                        case,
                        at: handshake_now(),
                    }
                    .encode(launch.worker_id),
                );
                let ctx = setup.context(seed, false);
                let body = registry.create(&launch.testable)?;
                let outcome = executor.run_case(ctx, body)?;
                let frame = match outcome.status {
                    CaseStatus::Passed => ReportFrame::Passed {
                        case,
                        at: handshake_now(),
                    },
                    CaseStatus::Failed { message }
                    | CaseStatus::TimedOut { message, .. } => ReportFrame::Failed {
                        case,
                        at: handshake_now(),
                        position: outcome.position,
                        marks: launch
                            .placemark_names
                            .iter()
                            .map(|name| outcome.placemarks.get(name).copied())
                            .collect(),
                        detail: message,
                    },
                };
                report(frame.encode(launch.worker_id));
            }
            Err(reason) => {
                tracing::warn!(
                    worker = launch.worker_id,
                    %reason,
                    "ignoring malformed assignment line"
                );
            }
        }
    }
    executor.shutdown();
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
