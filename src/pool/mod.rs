//! Multi-worker execution: wire protocol, supervisor, worker loop, relay.
//!
//! The pool splits a run across N workers. The supervisor side lives in
//! the orchestrating process; the worker side is either a re-executed
//! copy of the current binary (stdin/stdout/stderr pipes) or an
//! in-process thread speaking the same line protocol over channels.
//!
//! | Piece        | Role                                                |
//! |--------------|-----------------------------------------------------|
//! | `protocol`   | Line grammar: assignments down, reports up          |
//! | `supervisor` | Spawns workers, assigns seeds, handles death        |
//! | `worker`     | Per-worker loop around a [`CaseExecutor`]           |
//! | `relay`      | Buffers worker console output, flushes whole lines  |
//!
//! [`CaseExecutor`]: crate::exec::CaseExecutor

mod protocol;
mod relay;
mod supervisor;
mod worker;

pub use protocol::{
    AssignFrame, ReportFrame, WorkerLaunch, HANDSHAKE_TIME_FORMAT, STOP_BYTE, WORKER_ARG_MARKER,
};
pub use relay::{ConsoleRelay, DEFAULT_RELAY_AGE, DEFAULT_RELAY_BUFFER};
pub use supervisor::{
    PoolSpec, PoolStats, PoolSupervisor, WorkerOutcome, WorkerTransport, WorkerVerdict,
};
pub use worker::worker_main;
