//! Pool supervisor: spawns workers, assigns cases, watches for death.
//!
//! # Architecture
//!
//! ```text
//!                    ┌────────────────────────────────────────────┐
//!                    │               PoolSupervisor               │
//!                    │  slots[] ── state, in-flight case          │
//!                    │  one event channel, relay, heartbeat pump  │
//!                    └──┬──────────────▲──────────────────────────┘
//!        assign/hb/stop │              │ events: lines, EOFs
//!                       ▼              │
//!         per-worker writer thread   reader threads (stderr, stdout)
//!                       │              ▲
//!                       ▼              │
//!                  worker (subprocess or in-process thread)
//! ```
//!
//! Every worker's lines funnel into one crossbeam channel, so the
//! supervisor is single-threaded over events: assignment, completion,
//! console relay, and death handling all happen on the caller's thread.
//!
//! # Death handling
//!
//! A worker is dead when its stderr closes or an input write fails. Its
//! in-flight case, if any, is reported as a failure exactly once; dead
//! workers are never reassigned. When every worker is dead the pool
//! refuses further work.

use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, Write};
use std::panic::{self, AssertUnwindSafe};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};

use crate::error::HarnessError;
use crate::exec::TimeBudgets;
use crate::pool::protocol::{
    classify_stderr_line, handshake_now, AssignFrame, ReportFrame, StderrLine, WorkerLaunch,
};
use crate::pool::relay::ConsoleRelay;
use crate::pool::worker::run_worker_loop;
use crate::testable::TestableRegistry;

/// Poll slice for event waits; also the relay tick cadence.
const EVENT_TICK: Duration = Duration::from_millis(100);

/// Slack beyond the per-case budget allowed for workers to wind down.
const STOP_GRACE: Duration = Duration::from_secs(10);

// ============================================================================
// Public types
// ============================================================================

/// How workers are hosted.
#[derive(Clone)]
pub enum WorkerTransport {
    /// Re-execute the current binary with worker arguments.
    Subprocess,
    /// Spawn in-process threads running the worker loop over channels.
    /// Speaks the identical wire protocol, minus the pipes.
    Threads(TestableRegistry),
}

/// Everything needed to start a pool.
#[derive(Clone)]
pub struct PoolSpec {
    pub workers: usize,
    pub testable: String,
    pub placemark_names: Vec<String>,
    pub budgets: TimeBudgets,
    pub heartbeat_interval: Duration,
    pub transport: WorkerTransport,
}

/// One completed (or forfeited) pooled case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutcome {
    pub worker: u32,
    pub case: u64,
    pub seed: u64,
    pub verdict: WorkerVerdict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerVerdict {
    Passed,
    Failed {
        position: u64,
        placemarks: BTreeMap<String, u64>,
        detail: String,
    },
}

/// Aggregate counts returned by [`PoolSupervisor::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub assigned: u64,
    pub completed: u64,
    /// Workers that died before being told to stop.
    pub dead_workers: usize,
}

// ============================================================================
// Internals
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineSource {
    Stdout,
    Stderr,
}

#[derive(Debug)]
enum PoolEvent {
    Line {
        slot: usize,
        source: LineSource,
        text: String,
    },
    Eof {
        slot: usize,
        source: LineSource,
    },
    InputClosed {
        slot: usize,
    },
}

#[derive(Debug, Clone, Copy)]
enum SlotState {
    Idle,
    Busy,
    Dead,
}

#[derive(Debug, Clone, Copy)]
struct AssignedCase {
    case: u64,
    seed: u64,
}

struct WorkerSlot {
    id: u32,
    state: SlotState,
    /// Feed to the worker's writer thread (or the thread worker's line
    /// channel). Dropped to close the worker's stdin.
    input: Option<Sender<String>>,
    assigned: Option<AssignedCase>,
    child: Option<Child>,
    thread: Option<JoinHandle<()>>,
}

struct FailedCase {
    position: u64,
    placemarks: BTreeMap<String, u64>,
    detail: String,
}

fn spawn_named<F>(name: String, f: F) -> Result<(), HarnessError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name)
        .spawn(f)
        .map(|_| ())
        .map_err(|e| HarnessError::Pool(format!("spawn pool thread: {e}")))
}

fn write_worker_input(slot: usize, mut stdin: ChildStdin, input: Receiver<String>, events: Sender<PoolEvent>) {
    while let Ok(line) = input.recv() {
        if stdin
            .write_all(line.as_bytes())
            .and_then(|()| stdin.flush())
            .is_err()
        {
            let _ = events.send(PoolEvent::InputClosed { slot });
            return;
        }
    }
    // Input channel closed; dropping stdin here is the worker's EOF.
}

fn read_worker_lines(
    slot: usize,
    source: LineSource,
    pipe: impl io::Read,
    events: Sender<PoolEvent>,
) {
    let reader = BufReader::new(pipe);
    for line in reader.lines() {
        match line {
            Ok(text) => {
                if events.send(PoolEvent::Line { slot, source, text }).is_err() {
                    return;
                }
            }
            Err(_) => break,
        }
    }
    let _ = events.send(PoolEvent::Eof { slot, source });
}

fn spawn_subprocess_worker(
    slot: usize,
    launch: &WorkerLaunch,
    events: &Sender<PoolEvent>,
) -> Result<WorkerSlot, HarnessError> {
    let exe = std::env::current_exe()
        .map_err(|e| HarnessError::Pool(format!("locate current executable: {e}")))?;
    let mut child = Command::new(exe)
        .args(launch.to_args())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| HarnessError::Pool(format!("spawn worker {slot}: {e}")))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| HarnessError::Pool(format!("worker {slot} has no stdin pipe")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| HarnessError::Pool(format!("worker {slot} has no stdout pipe")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| HarnessError::Pool(format!("worker {slot} has no stderr pipe")))?;

    let (input_tx, input_rx) = unbounded::<String>();
    spawn_named(format!("worker-{slot}-writer"), {
        let events = events.clone();
        move || write_worker_input(slot, stdin, input_rx, events)
    })?;
    spawn_named(format!("worker-{slot}-stderr"), {
        let events = events.clone();
        move || read_worker_lines(slot, LineSource::Stderr, stderr, events)
    })?;
    spawn_named(format!("worker-{slot}-stdout"), {
        let events = events.clone();
        move || read_worker_lines(slot, LineSource::Stdout, stdout, events)
    })?;

    Ok(WorkerSlot {
        id: slot as u32,
        state: SlotState::Idle,
        input: Some(input_tx),
        assigned: None,
        child: Some(child),
        thread: None,
    })
}

fn spawn_thread_worker(
    slot: usize,
    launch: WorkerLaunch,
    registry: TestableRegistry,
    events: &Sender<PoolEvent>,
) -> Result<WorkerSlot, HarnessError> {
    let (input_tx, input_rx) = unbounded::<String>();
    let events = events.clone();
    let handle = thread::Builder::new()
        .name(format!("pool-worker-{slot}"))
        .spawn(move || {
            let report_events = events.clone();
            let mut report = move |line: String| {
                let text = line.trim_end_matches('\n').to_string();
                let _ = report_events.send(PoolEvent::Line {
                    slot,
                    source: LineSource::Stderr,
                    text,
                });
            };
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                run_worker_loop(&launch, &registry, &input_rx, &mut report)
            }));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(worker = slot, error = %e, "worker loop failed"),
                Err(_) => tracing::warn!(worker = slot, "worker loop panicked"),
            }
            let _ = events.send(PoolEvent::Eof {
                slot,
                source: LineSource::Stderr,
            });
        })
        .map_err(|e| HarnessError::Pool(format!("spawn worker thread {slot}: {e}")))?;
    Ok(WorkerSlot {
        id: slot as u32,
        state: SlotState::Idle,
        input: Some(input_tx),
        assigned: None,
        child: None,
        thread: Some(handle),
    })
}

struct HeartbeatPump {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatPump {
    fn start(interval: Duration, inputs: Vec<Sender<String>>) -> Result<Self, HarnessError> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("pool-heartbeat".into())
            .spawn(move || {
                let line = AssignFrame::Heartbeat.encode();
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    // Sends to dead workers fail silently; that is fine.
                    for input in &inputs {
                        let _ = input.send(line.clone());
                    }
                }
            })
            .map_err(|e| HarnessError::Pool(format!("spawn heartbeat thread: {e}")))?;
        Ok(Self {
            stop_tx,
            handle: Some(handle),
        })
    }

    fn stop(mut self) {
        let handle = self.handle.take();
        drop(self.stop_tx);
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// Owns N workers and a single-threaded event loop over their output.
pub struct PoolSupervisor {
    spec: PoolSpec,
    slots: Vec<WorkerSlot>,
    /// Keeps the event channel connected while reader threads come and go.
    _events_keepalive: Sender<PoolEvent>,
    events_rx: Receiver<PoolEvent>,
    relay: ConsoleRelay,
    heartbeat: Option<HeartbeatPump>,
    next_case: u64,
    assigned: u64,
    completed: u64,
    unexpected_deaths: usize,
    stopping: bool,
}

impl PoolSupervisor {
    pub fn start(spec: PoolSpec) -> Result<Self, HarnessError> {
        if spec.workers == 0 {
            return Err(HarnessError::Pool(
                "worker pool needs at least one worker".into(),
            ));
        }
        let (events_tx, events_rx) = unbounded();
        let run_started_at = handshake_now();
        let mut slots = Vec::with_capacity(spec.workers);
        for slot in 0..spec.workers {
            let launch = WorkerLaunch {
                worker_id: slot as u32,
                testable: spec.testable.clone(),
                run_started_at,
                budgets: spec.budgets,
                heartbeat_interval: spec.heartbeat_interval,
                placemark_names: spec.placemark_names.clone(),
            };
            let worker = match &spec.transport {
                WorkerTransport::Subprocess => spawn_subprocess_worker(slot, &launch, &events_tx)?,
                WorkerTransport::Threads(registry) => {
                    spawn_thread_worker(slot, launch, registry.clone(), &events_tx)?
                }
            };
            slots.push(worker);
        }
        let inputs: Vec<Sender<String>> = slots.iter().filter_map(|s| s.input.clone()).collect();
        let heartbeat = HeartbeatPump::start(spec.heartbeat_interval, inputs)?;
        let relay = ConsoleRelay::new(spec.workers, Box::new(io::stdout()));
        tracing::debug!(workers = spec.workers, testable = %spec.testable, "worker pool started");
        Ok(Self {
            spec,
            slots,
            _events_keepalive: events_tx,
            events_rx,
            relay,
            heartbeat: Some(heartbeat),
            next_case: 1,
            assigned: 0,
            completed: 0,
            unexpected_deaths: 0,
            stopping: false,
        })
    }

    /// Workers not yet known dead.
    pub fn live_workers(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !matches!(s.state, SlotState::Dead))
            .count()
    }

    /// Block until a worker is idle, then assign it the next case number
    /// with this seed. Completions that arrive while waiting are delivered
    /// through `on_outcome`.
    pub fn execute(
        &mut self,
        seed: u64,
        on_outcome: &mut dyn FnMut(WorkerOutcome),
    ) -> Result<(), HarnessError> {
        loop {
            self.drain_pending(on_outcome);
            if self.live_workers() == 0 {
                return Err(HarnessError::Pool("all workers died".into()));
            }
            let Some(slot) = self.idle_slot() else {
                self.pump_one_event(on_outcome)?;
                continue;
            };
            let case = self.next_case;
            let frame = AssignFrame::Case { case, seed };
            if self.send_to_slot(slot, frame.encode()) {
                self.next_case += 1;
                self.assigned += 1;
                self.slots[slot].state = SlotState::Busy;
                self.slots[slot].assigned = Some(AssignedCase { case, seed });
                return Ok(());
            }
            tracing::warn!(worker = slot, "assignment write failed; marking worker dead");
            self.mark_dead(slot, on_outcome);
        }
    }

    /// Tell every worker to stop after its current case, drain completions
    /// until all workers exit (bounded by a grace period), flush the relay,
    /// and reap.
    pub fn stop(
        mut self,
        on_outcome: &mut dyn FnMut(WorkerOutcome),
    ) -> Result<PoolStats, HarnessError> {
        self.stopping = true;
        let stop_line = AssignFrame::Stop.encode();
        for slot in 0..self.slots.len() {
            if matches!(self.slots[slot].state, SlotState::Dead) {
                continue;
            }
            if !self.send_to_slot(slot, stop_line.clone()) {
                self.mark_dead(slot, on_outcome);
            }
        }

        // Workers finish their in-flight case before exiting.
        let grace = self.spec.budgets.max_case.unwrap_or_default() + STOP_GRACE;
        let deadline = Instant::now() + grace;
        while self
            .slots
            .iter()
            .any(|s| !matches!(s.state, SlotState::Dead))
        {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!("stop grace period expired with workers still up");
                break;
            }
            match self.events_rx.recv_timeout(remaining.min(EVENT_TICK)) {
                Ok(event) => self.handle_event(event, on_outcome),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.relay.tick();
        }

        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }
        self.relay.flush_all();

        for slot in self.slots.iter_mut() {
            slot.input = None;
            if let Some(mut child) = slot.child.take() {
                match child.try_wait() {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        let _ = child.kill();
                        let _ = child.wait();
                    }
                    Err(_) => {}
                }
            }
            if let Some(handle) = slot.thread.take() {
                // Join only loops known to have returned; a wedged worker
                // thread is abandoned rather than hanging shutdown.
                if matches!(slot.state, SlotState::Dead) {
                    let _ = handle.join();
                }
            }
        }

        Ok(PoolStats {
            assigned: self.assigned,
            completed: self.completed,
            dead_workers: self.unexpected_deaths,
        })
    }

    // ------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------

    fn idle_slot(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| matches!(s.state, SlotState::Idle))
    }

    fn send_to_slot(&mut self, slot: usize, line: String) -> bool {
        match &self.slots[slot].input {
            Some(input) => input.send(line).is_ok(),
            None => false,
        }
    }

    fn drain_pending(&mut self, on_outcome: &mut dyn FnMut(WorkerOutcome)) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event, on_outcome);
        }
        self.relay.tick();
    }

    fn pump_one_event(
        &mut self,
        on_outcome: &mut dyn FnMut(WorkerOutcome),
    ) -> Result<(), HarnessError> {
        match self.events_rx.recv_timeout(EVENT_TICK) {
            Ok(event) => self.handle_event(event, on_outcome),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(HarnessError::Pool("pool event channel closed".into()))
            }
        }
        self.relay.tick();
        Ok(())
    }

    fn handle_event(&mut self, event: PoolEvent, on_outcome: &mut dyn FnMut(WorkerOutcome)) {
        match event {
            PoolEvent::Line {
                slot,
                source: LineSource::Stdout,
                text,
            } => self.relay.push(slot, &text),
            PoolEvent::Line {
                slot,
                source: LineSource::Stderr,
                text,
            } => match classify_stderr_line(&text, self.spec.placemark_names.len()) {
                StderrLine::Report(worker_id, frame) if worker_id == self.slots[slot].id => {
                    self.absorb_frame(slot, frame, on_outcome)
                }
                // A frame-shaped line under any other id is the test body
                // talking, not this worker reporting.
                StderrLine::Report(..) | StderrLine::Console => self.relay.push(slot, &text),
            },
            PoolEvent::Eof { slot, source } => {
                // Stdout can close without the worker being gone; stderr
                // closing means the worker has exited.
                if source == LineSource::Stderr {
                    self.mark_dead(slot, on_outcome);
                }
            }
            PoolEvent::InputClosed { slot } => self.mark_dead(slot, on_outcome),
        }
    }

    fn absorb_frame(
        &mut self,
        slot: usize,
        frame: ReportFrame,
        on_outcome: &mut dyn FnMut(WorkerOutcome),
    ) {
        match frame {
            ReportFrame::Started { case, .. } => match &self.slots[slot].assigned {
                Some(assigned) if assigned.case == case => {
                    tracing::debug!(worker = slot, case, "case started");
                }
                _ => tracing::warn!(
                    worker = slot,
                    case,
                    "started frame for a case this worker does not hold"
                ),
            },
            ReportFrame::Passed { case, .. } => self.finish_case(slot, case, None, on_outcome),
            ReportFrame::Failed {
                case,
                position,
                marks,
                detail,
                ..
            } => {
                let placemarks: BTreeMap<String, u64> = self
                    .spec
                    .placemark_names
                    .iter()
                    .zip(&marks)
                    .filter_map(|(name, mark)| mark.map(|m| (name.clone(), m)))
                    .collect();
                self.finish_case(
                    slot,
                    case,
                    Some(FailedCase {
                        position,
                        placemarks,
                        detail,
                    }),
                    on_outcome,
                );
            }
        }
    }

    fn finish_case(
        &mut self,
        slot: usize,
        case: u64,
        failed: Option<FailedCase>,
        on_outcome: &mut dyn FnMut(WorkerOutcome),
    ) {
        // A completion must name the case this worker holds; anything else
        // is noise and the assignment stays put.
        let assigned = match self.slots[slot].assigned {
            Some(assigned) if assigned.case == case => assigned,
            Some(assigned) => {
                tracing::warn!(
                    worker = slot,
                    expected = assigned.case,
                    reported = case,
                    "completion names an unexpected case; keeping the assignment"
                );
                return;
            }
            None => {
                tracing::warn!(
                    worker = slot,
                    case,
                    "completion for a case this worker does not hold"
                );
                return;
            }
        };
        self.slots[slot].assigned = None;
        if !matches!(self.slots[slot].state, SlotState::Dead) {
            self.slots[slot].state = SlotState::Idle;
        }
        self.completed += 1;
        let verdict = match failed {
            None => WorkerVerdict::Passed,
            Some(FailedCase {
                position,
                placemarks,
                detail,
            }) => WorkerVerdict::Failed {
                position,
                placemarks,
                detail,
            },
        };
        on_outcome(WorkerOutcome {
            worker: self.slots[slot].id,
            case,
            seed: assigned.seed,
            verdict,
        });
    }

    /// Exactly-once death bookkeeping; reports the in-flight case as a
    /// failure if the worker held one.
    fn mark_dead(&mut self, slot: usize, on_outcome: &mut dyn FnMut(WorkerOutcome)) {
        if matches!(self.slots[slot].state, SlotState::Dead) {
            return;
        }
        self.slots[slot].state = SlotState::Dead;
        self.slots[slot].input = None;
        if !self.stopping {
            self.unexpected_deaths += 1;
            tracing::warn!(worker = slot, "worker died");
        }
        let Some(assigned) = self.slots[slot].assigned.take() else {
            return;
        };
        self.completed += 1;
        on_outcome(WorkerOutcome {
            worker: self.slots[slot].id,
            case: assigned.case,
            seed: assigned.seed,
            verdict: WorkerVerdict::Failed {
                position: 0,
                placemarks: BTreeMap::new(),
                detail: "worker died while running this case".to_string(),
            },
        });
    }
}

// ============================================================================
// Tests
// ============================================================================
