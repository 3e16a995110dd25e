//! Load statistics tracking.
//!
//! Workers count locally and hand their totals back when they exit; the
//! orchestrator merges them into the final [`LoadReport`].

use std::fmt;
use std::time::Duration;

/// Counters kept by a single worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Records inserted successfully
    pub inserted: usize,
    /// Records handed to the dead-letter sink
    pub rejected: usize,
    /// Failed attempts that were followed by another attempt
    pub retries: usize,
}

impl WorkerStats {
    /// Merge another worker's counters into this one by summing all counts.
    pub fn merge(&mut self, other: WorkerStats) {
        self.inserted += other.inserted;
        self.rejected += other.rejected;
        self.retries += other.retries;
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Data records handed to the pool
    pub dispatched: usize,
    pub inserted: usize,
    pub rejected: usize,
    pub retries: usize,
    /// Set when the source failed before end of input; records after the
    /// failure were never read.
    pub read_error: Option<String>,
    pub elapsed: Duration,
}

impl LoadReport {
    pub fn new(dispatched: usize, workers: WorkerStats, read_error: Option<String>) -> Self {
        Self {
            dispatched,
            inserted: workers.inserted,
            rejected: workers.rejected,
            retries: workers.retries,
            read_error,
            elapsed: Duration::ZERO,
        }
    }

    /// Whole seconds, rounded up.
    pub fn elapsed_seconds(&self) -> u64 {
        let secs = self.elapsed.as_secs();
        if self.elapsed.subsec_nanos() > 0 { secs + 1 } else { secs }
    }

    pub fn is_complete(&self) -> bool {
        self.read_error.is_none() && self.rejected == 0 && self.inserted == self.dispatched
    }
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Load summary:")?;
        writeln!(f, "  dispatched: {}", self.dispatched)?;
        writeln!(f, "  inserted: {}", self.inserted)?;
        writeln!(f, "  rejected: {}", self.rejected)?;
        writeln!(f, "  retries: {}", self.retries)?;
        if let Some(err) = &self.read_error {
            writeln!(f, "  read_error: {}", err)?;
        }
        writeln!(f, "  process_time: {} seconds", self.elapsed_seconds())?;
        Ok(())
    }
}
