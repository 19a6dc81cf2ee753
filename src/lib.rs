//! Deterministic randomized regression harness with a persistent failure store.
//!
//! ## Scope
//! This crate runs randomized test cases ("testables") against a deterministic
//! byte stream, remembers every failure it finds in a `.broken` file, and
//! replays remembered failures first on later runs so regressions and fixes
//! are caught before fresh exploration spends any time.
//!
//! ## Key invariants
//! - Same seed, same draws: a case's entire random input derives from one
//!   `u64` seed, so any failure replays exactly from its seed alone.
//! - Position is bytes consumed: the stream position in every record equals
//!   the literal count of bytes handed out, which makes "the failure moved"
//!   detectable across code changes.
//! - Failures persist: the store survives process exits, keeps resolved
//!   failures for revisiting, and evicts only the oldest fixes.
//! - Replays are sequential: remembered failures and explicit seeds never go
//!   to the worker pool, so breakpoints and debug hooks stay usable.
//!
//! ## Run flow
//! 1) Replay unresolved failures from the store (oldest position first).
//! 2) Revisit recently fixed failures to catch regressions.
//! 3) Replay explicitly requested seeds, if any.
//! 4) Explore fresh seeds, sequentially or across a worker pool, until a
//!    case budget, time budget, or failure budget says stop.
//!
//! ## Notable entry points
//! - [`Runner`] / [`RunConfig`]: configure and drive a whole run.
//! - [`TestableRegistry`] / [`testable_fn`]: name and construct test bodies.
//! - [`CaseContext`]: the draw API handed to each test body.
//! - [`FailureStore`] / [`FailureRecord`]: the persistent failure ledger.
//! - [`pool::worker_main`]: entry point for pooled worker processes.
//!
//! ## Design trade-offs
//! Recording only the seed (not the drawn values) keeps records tiny and
//! replay trivial, at the cost of requiring the stream algorithm to stay
//! stable. Placemark counters cost one stream byte each, which is the price
//! of making "did it reach the same spot" part of every failure's identity.

pub mod pool;

mod choice;
mod context;
mod debug;
mod error;
mod exec;
mod run;
mod store;
mod stream;
mod testable;

pub use choice::{WeightedAction, WeightedChoice};
pub use context::{CaseContext, CaseSetup, DEFAULT_PLACEMARK};
pub use debug::{DebugHook, DebugState, LoggingHook};
pub use error::HarnessError;
pub use exec::{CaseExecutor, CaseOutcome, CaseStatus, TimeBudgets, TimeoutKind};
pub use run::{ExplicitCase, RunConfig, RunSummary, Runner, WorkerTransportKind, SEED_ENV};
pub use store::{FailureRecord, FailureStore, STORE_EXTENSION};
pub use stream::SeedStream;
pub use testable::{
    qualified_name, simple_name, testable_fn, CaseError, Testable, TestableRegistry,
};
