//! Parallel bulk loading of delimited-text records into a table.
//!
//! # Architecture Overview
//!
//! - **`source`**: Reads the header row, then streams data records.
//! - **`channel`**: Rendezvous handoff from the producer to the pool; the
//!   producer never runs ahead of an idle worker.
//! - **`worker`**: A fixed pool of tasks, each taking one record at a time and
//!   inserting it through a [`RecordSink`] under the [`RetryPolicy`].
//! - **`barrier`**: Counts dispatched records that have not settled yet.
//! - **`dead_letter`**: Receives records the retry policy gave up on.
//! - **`sink`** / **`statement`**: The PostgreSQL destination and the
//!   single-row INSERT it runs.
//!
//! ## Data Flow
//!
//! 1. **Header**: The caller reads the header and builds a sink for it
//! 2. **Feed**: A blocking thread reads records and hands them off one by one
//! 3. **Insert**: Workers insert, retry, or reject each record they receive
//! 4. **Drain**: The orchestrator waits for the barrier to reach zero
//!
//! Insert order across workers is unspecified. A single worker preserves
//! source order.

pub mod barrier;
pub mod channel;
pub mod dead_letter;
pub mod retry;
pub mod sink;
pub mod source;
pub mod statement;
pub mod stats;
pub mod worker;

pub use barrier::CompletionBarrier;
pub use dead_letter::DeadLetter;
pub use retry::RetryPolicy;
pub use sink::{InsertError, PgSink, RecordSink};
pub use source::{Header, Record, RecordSource, RecordStream, SourceError, SourceOptions};
pub use stats::{LoadReport, WorkerStats};

use crate::error::LoadError;
use channel::{Closed, Dispatcher};
use std::io::Read;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use worker::{WorkerContext, WorkerPool};

pub const DEFAULT_PROGRESS_EVERY: usize = 100;

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub workers: usize,
    pub retry: RetryPolicy,
    pub progress_every: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            retry: RetryPolicy::default(),
            progress_every: DEFAULT_PROGRESS_EVERY,
        }
    }
}

/// What the producer managed before it stopped.
#[derive(Debug, Default)]
struct FeedOutcome {
    dispatched: usize,
    read_error: Option<String>,
}

/// Drives one load: a producer thread, a worker pool and the barrier between
/// them.
pub struct Loader<S> {
    sink: Arc<S>,
    options: LoadOptions,
    dead_letter: Arc<DeadLetter>,
    cancel: CancellationToken,
}

impl<S: RecordSink> Loader<S> {
    pub fn new(sink: Arc<S>, options: LoadOptions) -> Self {
        Self {
            sink,
            options,
            dead_letter: Arc::new(DeadLetter::discard()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_dead_letter(mut self, dead_letter: DeadLetter) -> Self {
        self.dead_letter = Arc::new(dead_letter);
        self
    }

    /// Stop the run when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Load every record of `stream`, returning once each dispatched record
    /// has been inserted or rejected.
    pub async fn run<R>(&self, stream: RecordStream<R>) -> Result<LoadReport, LoadError>
    where
        R: Read + Send + 'static,
    {
        if self.options.workers == 0 {
            return Err(LoadError::InvalidOptions(
                "worker count must be at least 1".to_string(),
            ));
        }

        let started = Instant::now();
        // Scoped to this run so an abort does not cancel the caller's token.
        let cancel = self.cancel.child_token();
        let barrier = CompletionBarrier::new();
        let (dispatcher, receiver) = channel::handoff();

        let context = Arc::new(WorkerContext {
            sink: self.sink.clone(),
            retry: self.options.retry.clone(),
            dead_letter: self.dead_letter.clone(),
            barrier: barrier.clone(),
            cancel: cancel.clone(),
            progress_every: self.options.progress_every,
        });
        let mut workers = WorkerPool::spawn(self.options.workers, receiver, context);

        let producer = tokio::task::spawn_blocking({
            let barrier = barrier.clone();
            let cancel = cancel.clone();
            move || feed(stream, dispatcher, barrier, cancel)
        });

        let result = drive(producer, &mut workers, &barrier, &cancel).await;
        if result.is_err() {
            cancel.cancel();
            workers.shutdown().await;
        }
        let (fed, totals) = result?;

        self.dead_letter.flush().map_err(csv::Error::from)?;

        let mut report = LoadReport::new(fed.dispatched, totals, fed.read_error);
        report.elapsed = started.elapsed();
        log::info!(
            "load finished: {} dispatched, {} inserted, {} rejected, {} retries",
            report.dispatched,
            report.inserted,
            report.rejected,
            report.retries
        );

        Ok(report)
    }
}

/// Wait for the producer, then for the barrier, then for the pool to exit,
/// failing fast on the first fatal worker exit.
async fn drive(
    producer: tokio::task::JoinHandle<FeedOutcome>,
    workers: &mut JoinSet<Result<WorkerStats, LoadError>>,
    barrier: &CompletionBarrier,
    cancel: &CancellationToken,
) -> Result<(FeedOutcome, WorkerStats), LoadError> {
    let mut totals = WorkerStats::default();
    tokio::pin!(producer);

    let fed = loop {
        tokio::select! {
            joined = &mut producer => break joined?,
            Some(exited) = workers.join_next() => collect_exit(exited, &mut totals)?,
        }
    };
    log::debug!("producer finished after {} records", fed.dispatched);

    if cancel.is_cancelled() {
        return Err(LoadError::Cancelled);
    }

    loop {
        tokio::select! {
            _ = barrier.wait() => break,
            _ = cancel.cancelled() => return Err(LoadError::Cancelled),
            Some(exited) = workers.join_next() => collect_exit(exited, &mut totals)?,
        }
    }

    // The dispatcher is gone, so every remaining worker is on its way out.
    while let Some(exited) = workers.join_next().await {
        collect_exit(exited, &mut totals)?;
    }

    Ok((fed, totals))
}

fn collect_exit(
    exited: Result<Result<WorkerStats, LoadError>, JoinError>,
    totals: &mut WorkerStats,
) -> Result<(), LoadError> {
    let stats = exited??;
    totals.merge(stats);
    Ok(())
}

/// Producer loop. Runs on a blocking thread because reading is synchronous.
fn feed<R: Read>(
    mut stream: RecordStream<R>,
    dispatcher: Dispatcher,
    barrier: CompletionBarrier,
    cancel: CancellationToken,
) -> FeedOutcome {
    let mut outcome = FeedOutcome::default();

    loop {
        if cancel.is_cancelled() {
            log::warn!("producer: cancelled after {} records", outcome.dispatched);
            break;
        }

        let record = match stream.next_record() {
            Ok(Some(record)) => record,
            Ok(None) => {
                log::debug!("producer: end of input after {} records", stream.produced());
                break;
            }
            Err(err) => {
                log::error!(
                    "producer: stopping after {} records: {}",
                    outcome.dispatched,
                    err
                );
                outcome.read_error = Some(err.to_string());
                break;
            }
        };

        barrier.add(1);
        match dispatcher.send_blocking(record) {
            Ok(()) => outcome.dispatched += 1,
            Err(Closed(_)) => {
                // Never reached a worker, so nobody else will release it.
                barrier.done();
                log::warn!("producer: worker pool is gone, stopping");
                break;
            }
        }
    }

    outcome
}
