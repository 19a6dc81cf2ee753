//! Wire protocol between the pool supervisor and its workers.
//!
//! # Channels
//!
//! ```text
//!   supervisor ── stdin ──► worker      assignments, heartbeats, stop
//!   worker ── stderr ──► supervisor     case reports, console output
//!   worker ── stdout ──► supervisor     console output only
//! ```
//!
//! # Grammar
//!
//! Supervisor to worker, one frame per line:
//!
//! | line                      | meaning                      |
//! |---------------------------|------------------------------|
//! | `<hex case>:<hex seed>`   | run this case                |
//! | empty                     | heartbeat                    |
//! | any single character      | stop after the current case  |
//!
//! Worker to supervisor on stderr, protocol lines carry the worker id:
//!
//! | line                                                          | meaning      |
//! |---------------------------------------------------------------|--------------|
//! | `<hex id>:I:<hex case>:<ts>`                                  | case started |
//! | `<hex id>:D:<hex case>:<ts>`                                  | case passed  |
//! | `<hex id>:X:<hex case>:<ts>:<hex pos>:<mark>...:<detail>`     | case failed  |
//!
//! A failed frame has one `<mark>` field per recognized placemark name
//! (lowercase hex, blank when unreached) and the escaped failure detail
//! last; the detail may contain `:` so it is never split. Timestamps use
//! [`HANDSHAKE_TIME_FORMAT`], which contains no colon on purpose.
//!
//! Any stderr line that does not parse as a report, and every stdout line,
//! is console output from the test body. It is relayed verbatim and never
//! parsed.

use std::time::Duration;

use chrono::{Local, NaiveDateTime};

use crate::error::HarnessError;
use crate::exec::TimeBudgets;

/// First argument after the program name that marks a worker invocation.
pub const WORKER_ARG_MARKER: &str = "__regress-worker";

/// Timestamp format for handshake and report lines: `ddMMMyyyy HHmmss.SSS`.
/// Colon-free so frame fields split unambiguously.
pub const HANDSHAKE_TIME_FORMAT: &str = "%d%b%Y %H%M%S%.3f";

/// Canonical stop byte. Workers treat any single-character line as stop.
pub const STOP_BYTE: u8 = b'.';

pub(crate) fn handshake_now() -> NaiveDateTime {
    Local::now().naive_local()
}

// ============================================================================
// Launch arguments
// ============================================================================

/// Everything a worker needs to run, passed as process arguments so a
/// subprocess worker is self-contained from its argv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLaunch {
    pub worker_id: u32,
    pub testable: String,
    /// Supervisor's run start; workers budget their share of the total-run
    /// limit from it.
    pub run_started_at: NaiveDateTime,
    pub budgets: TimeBudgets,
    pub heartbeat_interval: Duration,
    pub placemark_names: Vec<String>,
}

fn encode_budget(budget: Option<Duration>) -> String {
    match budget {
        Some(d) => d.as_millis().to_string(),
        None => "-".to_string(),
    }
}

fn decode_budget(field: &str) -> Result<Option<Duration>, HarnessError> {
    if field == "-" {
        return Ok(None);
    }
    let millis: u64 = field
        .parse()
        .map_err(|e| HarnessError::Pool(format!("bad budget argument {field:?}: {e}")))?;
    Ok(Some(Duration::from_millis(millis)))
}

impl WorkerLaunch {
    /// Arguments in wire order, marker first.
    pub fn to_args(&self) -> Vec<String> {
        vec![
            WORKER_ARG_MARKER.to_string(),
            format!("{:x}", self.worker_id),
            self.testable.clone(),
            self.run_started_at
                .format(HANDSHAKE_TIME_FORMAT)
                .to_string(),
            encode_budget(self.budgets.max_run),
            encode_budget(self.budgets.max_case),
            encode_budget(self.budgets.max_progress),
            self.heartbeat_interval.as_millis().to_string(),
            self.placemark_names.join(","),
        ]
    }

    /// Parse the arguments after the marker.
    pub fn parse_args(args: &[String]) -> Result<Self, HarnessError> {
        if args.len() != 8 {
            return Err(HarnessError::Pool(format!(
                "worker invocation expects 8 arguments after the marker, got {}",
                args.len()
            )));
        }
        let worker_id = u32::from_str_radix(&args[0], 16)
            .map_err(|e| HarnessError::Pool(format!("bad worker id {:?}: {e}", args[0])))?;
        let run_started_at = NaiveDateTime::parse_from_str(&args[2], HANDSHAKE_TIME_FORMAT)
            .map_err(|e| HarnessError::Pool(format!("bad run start {:?}: {e}", args[2])))?;
        let budgets = TimeBudgets {
            max_run: decode_budget(&args[3])?,
            max_case: decode_budget(&args[4])?,
            max_progress: decode_budget(&args[5])?,
        };
        let heartbeat_millis: u64 = args[6]
            .parse()
            .map_err(|e| HarnessError::Pool(format!("bad heartbeat interval {:?}: {e}", args[6])))?;
        let placemark_names = if args[7].is_empty() {
            Vec::new()
        } else {
            args[7].split(',').map(str::to_owned).collect()
        };
        Ok(Self {
            worker_id,
            testable: args[1].clone(),
            run_started_at,
            budgets,
            heartbeat_interval: Duration::from_millis(heartbeat_millis),
            placemark_names,
        })
    }
}

// ============================================================================
// Supervisor to worker
// ============================================================================

/// One stdin line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignFrame {
    Case { case: u64, seed: u64 },
    Heartbeat,
    Stop,
}

impl AssignFrame {
    /// Encode with the trailing newline.
    pub fn encode(&self) -> String {
        match self {
            AssignFrame::Case { case, seed } => format!("{case:x}:{seed:x}\n"),
            AssignFrame::Heartbeat => "\n".to_string(),
            AssignFrame::Stop => format!("{}\n", STOP_BYTE as char),
        }
    }

    /// Parse a line with the newline already stripped.
    pub fn parse(line: &str) -> Result<AssignFrame, String> {
        if line.is_empty() {
            return Ok(AssignFrame::Heartbeat);
        }
        if line.chars().count() == 1 {
            return Ok(AssignFrame::Stop);
        }
        let (case, seed) = line
            .split_once(':')
            .ok_or_else(|| format!("assignment {line:?} has no ':'"))?;
        let case = u64::from_str_radix(case, 16).map_err(|e| format!("bad case {case:?}: {e}"))?;
        let seed = u64::from_str_radix(seed, 16).map_err(|e| format!("bad seed {seed:?}: {e}"))?;
        Ok(AssignFrame::Case { case, seed })
    }
}

// ============================================================================
// Worker to supervisor
// ============================================================================

/// One stderr report line, minus the worker-id prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportFrame {
    Started {
        case: u64,
        at: NaiveDateTime,
    },
    Passed {
        case: u64,
        at: NaiveDateTime,
    },
    Failed {
        case: u64,
        at: NaiveDateTime,
        position: u64,
        /// One entry per recognized placemark name, in launch order.
        marks: Vec<Option<u64>>,
        detail: String,
    },
}

fn escape_detail(detail: &str) -> String {
    let mut out = String::with_capacity(detail.len());
    for c in detail.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_detail(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn parse_hex(field: &str, what: &str) -> Result<u64, String> {
    u64::from_str_radix(field, 16).map_err(|e| format!("bad {what} {field:?}: {e}"))
}

fn parse_ts(field: &str) -> Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(field, HANDSHAKE_TIME_FORMAT)
        .map_err(|e| format!("bad timestamp {field:?}: {e}"))
}

impl ReportFrame {
    /// Encode as a full stderr line, id prefix and newline included.
    pub fn encode(&self, worker_id: u32) -> String {
        match self {
            ReportFrame::Started { case, at } => {
                format!(
                    "{worker_id:x}:I:{case:x}:{}\n",
                    at.format(HANDSHAKE_TIME_FORMAT)
                )
            }
            ReportFrame::Passed { case, at } => {
                format!(
                    "{worker_id:x}:D:{case:x}:{}\n",
                    at.format(HANDSHAKE_TIME_FORMAT)
                )
            }
            ReportFrame::Failed {
                case,
                at,
                position,
                marks,
                detail,
            } => {
                let mut line = format!(
                    "{worker_id:x}:X:{case:x}:{}:{position:x}",
                    at.format(HANDSHAKE_TIME_FORMAT)
                );
                for mark in marks {
                    line.push(':');
                    if let Some(mark) = mark {
                        line.push_str(&format!("{mark:x}"));
                    }
                }
                line.push(':');
                line.push_str(&escape_detail(detail));
                line.push('\n');
                line
            }
        }
    }

    /// Parse the payload after the worker-id prefix. `name_count` is the
    /// number of placemark columns a failed frame carries.
    pub fn parse(payload: &str, name_count: usize) -> Result<ReportFrame, String> {
        let (kind, rest) = payload
            .split_once(':')
            .ok_or_else(|| format!("report {payload:?} has no kind"))?;
        match kind {
            "I" | "D" => {
                let (case, ts) = rest
                    .split_once(':')
                    .ok_or_else(|| format!("report {payload:?} is missing its timestamp"))?;
                let case = parse_hex(case, "case")?;
                let at = parse_ts(ts)?;
                Ok(if kind == "I" {
                    ReportFrame::Started { case, at }
                } else {
                    ReportFrame::Passed { case, at }
                })
            }
            "X" => {
                // Fixed fields, then the mark columns, then the detail as
                // the unsplit remainder.
                let mut fields = rest.splitn(3 + name_count + 1, ':');
                let case = parse_hex(fields.next().ok_or("missing case")?, "case")?;
                let at = parse_ts(fields.next().ok_or("missing timestamp")?)?;
                let position = parse_hex(fields.next().ok_or("missing position")?, "position")?;
                let mut marks = Vec::with_capacity(name_count);
                for _ in 0..name_count {
                    let field = fields.next().ok_or("missing placemark column")?;
                    marks.push(if field.is_empty() {
                        None
                    } else {
                        Some(parse_hex(field, "placemark position")?)
                    });
                }
                let detail = unescape_detail(fields.next().unwrap_or(""));
                Ok(ReportFrame::Failed {
                    case,
                    at,
                    position,
                    marks,
                    detail,
                })
            }
            other => Err(format!("unknown report kind {other:?}")),
        }
    }
}

/// How the supervisor reads one worker stderr line.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum StderrLine {
    Report(u32, ReportFrame),
    Console,
}

/// Protocol lines start `<hex id>:`; everything else is the test body
/// talking. A line with a valid prefix but an unparsable frame is treated
/// as console output too, since bodies are free to print anything.
pub(crate) fn classify_stderr_line(line: &str, name_count: usize) -> StderrLine {
    let Some(colon) = memchr::memchr(b':', line.as_bytes()) else {
        return StderrLine::Console;
    };
    let id_part = &line[..colon];
    if id_part.is_empty() || !id_part.bytes().all(|b| b.is_ascii_hexdigit()) {
        return StderrLine::Console;
    }
    let Ok(worker_id) = u32::from_str_radix(id_part, 16) else {
        return StderrLine::Console;
    };
    match ReportFrame::parse(&line[colon + 1..], name_count) {
        Ok(frame) => StderrLine::Report(worker_id, frame),
        Err(_) => StderrLine::Console,
    }
}

// ============================================================================
// Tests
// ============================================================================
