//! Console passthrough for worker output.
//!
//! Test bodies print whatever they like; in pool mode those lines arrive
//! interleaved from many workers. The relay buffers per worker and flushes
//! a worker's run of lines together, so output stays readable without
//! holding it back for long. Per-worker ordering is preserved; interleaving
//! between workers is only as coarse as the flush bounds.

use std::io::{ErrorKind, Write};
use std::time::{Duration, Instant};

/// Buffered bytes per worker before a flush.
pub const DEFAULT_RELAY_BUFFER: usize = 8 * 1024;

/// Oldest a buffered line may get before a flush.
pub const DEFAULT_RELAY_AGE: Duration = Duration::from_millis(250);

#[derive(Default)]
struct WorkerBuffer {
    lines: Vec<String>,
    bytes: usize,
    oldest: Option<Instant>,
}

/// Size- and age-bounded per-worker line buffers over one output sink.
pub struct ConsoleRelay {
    buffers: Vec<WorkerBuffer>,
    max_buffered: usize,
    max_age: Duration,
    sink: Box<dyn Write + Send>,
    /// Downstream is gone; swallow output instead of failing the run.
    broken: bool,
}

impl ConsoleRelay {
    pub fn new(workers: usize, sink: Box<dyn Write + Send>) -> Self {
        let mut buffers = Vec::with_capacity(workers);
        buffers.resize_with(workers, WorkerBuffer::default);
        Self {
            buffers,
            max_buffered: DEFAULT_RELAY_BUFFER,
            max_age: DEFAULT_RELAY_AGE,
            sink,
            broken: false,
        }
    }

    pub fn with_bounds(mut self, max_buffered: usize, max_age: Duration) -> Self {
        self.max_buffered = max_buffered;
        self.max_age = max_age;
        self
    }

    /// Buffer one console line for a worker, flushing that worker if its
    /// buffer crosses the size bound.
    pub fn push(&mut self, worker: usize, line: &str) {
        let Some(buffer) = self.buffers.get_mut(worker) else {
            return;
        };
        buffer.bytes += line.len() + 1;
        buffer.lines.push(line.to_string());
        buffer.oldest.get_or_insert_with(Instant::now);
        if buffer.bytes >= self.max_buffered {
            self.flush_worker(worker);
        }
    }

    /// Flush any worker whose oldest buffered line has aged past the bound.
    /// Called from the supervisor's event loop between waits.
    pub fn tick(&mut self) {
        for worker in 0..self.buffers.len() {
            let due = matches!(
                self.buffers[worker].oldest,
                Some(oldest) if oldest.elapsed() >= self.max_age
            );
            if due {
                self.flush_worker(worker);
            }
        }
    }

    pub fn flush_worker(&mut self, worker: usize) {
        let Some(buffer) = self.buffers.get_mut(worker) else {
            return;
        };
        if buffer.lines.is_empty() {
            buffer.oldest = None;
            return;
        }
        let lines = std::mem::take(&mut buffer.lines);
        buffer.bytes = 0;
        buffer.oldest = None;
        if self.broken {
            return;
        }
        for line in &lines {
            if write_line(&mut self.sink, line).is_err() {
                self.broken = true;
                return;
            }
        }
        if let Err(e) = self.sink.flush() {
            if e.kind() == ErrorKind::BrokenPipe {
                self.broken = true;
            }
        }
    }

    pub fn flush_all(&mut self) {
        for worker in 0..self.buffers.len() {
            self.flush_worker(worker);
        }
    }

    /// Buffered line count, all workers. Used by shutdown to decide whether
    /// a final flush is worth attempting.
    pub fn pending(&self) -> usize {
        self.buffers.iter().map(|b| b.lines.len()).sum()
    }
}

fn write_line(sink: &mut (dyn Write + Send), line: &str) -> std::io::Result<()> {
    sink.write_all(line.as_bytes())?;
    sink.write_all(b"\n")
}

// ============================================================================
// Tests
// ============================================================================
