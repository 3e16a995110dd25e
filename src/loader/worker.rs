use super::barrier::CompletionBarrier;
use super::channel::WorkReceiver;
use super::dead_letter::DeadLetter;
use super::retry::{RetryDecision, RetryPolicy};
use super::sink::{InsertError, RecordSink};
use super::source::Record;
use super::stats::WorkerStats;
use crate::error::LoadError;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Everything a worker shares with its siblings.
pub struct WorkerContext<S> {
    pub sink: Arc<S>,
    pub retry: RetryPolicy,
    pub dead_letter: Arc<DeadLetter>,
    pub barrier: CompletionBarrier,
    pub cancel: CancellationToken,
    /// Emit a debug progress line every this many inserts per worker.
    pub progress_every: usize,
}

/// How a record left the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Inserted,
    Rejected,
}

pub struct WorkerPool;

impl WorkerPool {
    /// Start `count` workers pulling from `receiver`.
    ///
    /// A worker returns its counters once the channel is closed and drained or
    /// the run is cancelled, and an error when the run must stop.
    pub fn spawn<S: RecordSink>(
        count: usize,
        receiver: WorkReceiver,
        context: Arc<WorkerContext<S>>,
    ) -> JoinSet<Result<WorkerStats, LoadError>> {
        let mut workers = JoinSet::new();
        for id in 0..count {
            workers.spawn(run_worker(id, receiver.clone(), context.clone()));
        }
        log::debug!("spawned {} workers", count);
        workers
    }
}

async fn run_worker<S: RecordSink>(
    id: usize,
    receiver: WorkReceiver,
    context: Arc<WorkerContext<S>>,
) -> Result<WorkerStats, LoadError> {
    let mut stats = WorkerStats::default();

    loop {
        let record = tokio::select! {
            biased;
            _ = context.cancel.cancelled() => break,
            record = receiver.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };

        match insert_record(id, &record, &context, &mut stats).await? {
            Settled::Inserted => {
                stats.inserted += 1;
                if stats.inserted % context.progress_every.max(1) == 0 {
                    log::debug!("worker {}: inserted {} records", id, stats.inserted);
                }
            }
            Settled::Rejected => stats.rejected += 1,
        }
        context.barrier.done();
    }

    log::trace!("worker {}: exiting", id);
    Ok(stats)
}

/// Insert one record, retrying according to the policy.
async fn insert_record<S: RecordSink>(
    id: usize,
    record: &Record,
    context: &WorkerContext<S>,
    stats: &mut WorkerStats,
) -> Result<Settled, LoadError> {
    let mut attempts: u32 = 0;

    loop {
        // A panic inside one attempt fails that attempt, not the worker.
        let attempt = AssertUnwindSafe(context.sink.insert(record)).catch_unwind();
        let err = match attempt.await {
            Ok(Ok(())) => return Ok(Settled::Inserted),
            Ok(Err(err)) => err,
            Err(panic) => InsertError::Fault(panic_message(panic.as_ref())),
        };
        attempts = attempts.saturating_add(1);

        match context.retry.decide(&err, attempts) {
            RetryDecision::Retry(delay) => {
                stats.retries += 1;
                log::warn!(
                    "worker {}: record {} attempt {} failed, retrying in {:?}: {}",
                    id,
                    record.line,
                    attempts,
                    delay,
                    err
                );

                if context.cancel.is_cancelled() {
                    return Err(LoadError::Cancelled);
                }
                if delay.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::select! {
                        _ = context.cancel.cancelled() => return Err(LoadError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
            RetryDecision::Reject => {
                context.dead_letter.reject(record, &err.to_string())?;
                return Ok(Settled::Rejected);
            }
            RetryDecision::Abort => {
                log::error!("worker {}: aborting run: {}", id, err);
                return Err(LoadError::Aborted {
                    worker: id,
                    source: err,
                });
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "insert panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::channel::handoff;
    use crate::test_support::{FlakySink, RecordingSink};
    use std::time::Duration;

    fn context<S: RecordSink>(sink: Arc<S>, retry: RetryPolicy) -> Arc<WorkerContext<S>> {
        Arc::new(WorkerContext {
            sink,
            retry,
            dead_letter: Arc::new(DeadLetter::discard()),
            barrier: CompletionBarrier::new(),
            cancel: CancellationToken::new(),
            progress_every: 100,
        })
    }

    fn record(line: u64) -> Record {
        Record::new(line, vec![line.to_string()])
    }

    #[tokio::test]
    async fn workers_drain_the_channel_and_exit() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = context(sink.clone(), RetryPolicy::default());
        let (dispatcher, receiver) = handoff();
        let mut workers = WorkerPool::spawn(3, receiver, ctx.clone());

        for line in 1..=10 {
            ctx.barrier.add(1);
            dispatcher.send(record(line)).await.unwrap();
        }
        drop(dispatcher);

        let mut total = WorkerStats::default();
        while let Some(joined) = workers.join_next().await {
            total.merge(joined.unwrap().unwrap());
        }

        assert_eq!(total.inserted, 10);
        assert_eq!(ctx.barrier.pending(), 0);
        assert_eq!(sink.lines_sorted(), (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failing_record_is_retried_then_inserted_once() {
        let sink = Arc::new(FlakySink::failing_line(2, 3));
        let ctx = context(sink.clone(), RetryPolicy::unbounded());
        let mut stats = WorkerStats::default();

        let settled = insert_record(0, &record(2), &ctx, &mut stats).await.unwrap();

        assert_eq!(settled, Settled::Inserted);
        assert_eq!(stats.retries, 3);
        assert_eq!(sink.attempts_for(2), 4);
        assert_eq!(sink.inserted().lines_sorted(), [2]);
    }

    #[tokio::test]
    async fn panicking_attempt_is_retried() {
        let sink = Arc::new(FlakySink::panicking_line(3, 1));
        let ctx = context(sink.clone(), RetryPolicy::unbounded());
        let mut stats = WorkerStats::default();

        let settled = insert_record(0, &record(3), &ctx, &mut stats).await.unwrap();

        assert_eq!(settled, Settled::Inserted);
        assert_eq!(stats.retries, 1);
        assert_eq!(sink.attempts_for(3), 2);
        assert_eq!(sink.inserted().lines_sorted(), [3]);
    }

    #[tokio::test]
    async fn panicking_attempt_counts_against_the_limit() {
        let sink = Arc::new(FlakySink::panicking_line(4, u32::MAX));
        let retry = RetryPolicy::default()
            .with_max_attempts(2)
            .with_backoff(Duration::from_millis(1), Duration::from_millis(1));
        let ctx = context(sink.clone(), retry);
        let mut stats = WorkerStats::default();

        let settled = insert_record(0, &record(4), &ctx, &mut stats).await.unwrap();

        assert_eq!(settled, Settled::Rejected);
        assert_eq!(sink.attempts_for(4), 2);
        assert_eq!(ctx.dead_letter.rejected(), 1);
    }

    #[test]
    fn panic_payloads_become_messages() {
        assert_eq!(panic_message(&"driver fault"), "driver fault");
        assert_eq!(panic_message(&String::from("lost socket")), "lost socket");
        assert_eq!(panic_message(&42u8), "insert panicked");
    }

    #[tokio::test]
    async fn exhausted_record_goes_to_dead_letter() {
        let sink = Arc::new(FlakySink::failing_line(5, u32::MAX));
        let retry = RetryPolicy::default()
            .with_max_attempts(3)
            .with_backoff(Duration::from_millis(1), Duration::from_millis(2));
        let ctx = context(sink.clone(), retry);
        let mut stats = WorkerStats::default();

        let settled = insert_record(0, &record(5), &ctx, &mut stats).await.unwrap();

        assert_eq!(settled, Settled::Rejected);
        assert_eq!(sink.attempts_for(5), 3);
        assert_eq!(ctx.dead_letter.rejected(), 1);
    }

    #[tokio::test]
    async fn acquisition_failure_aborts() {
        let sink = Arc::new(FlakySink::unreachable());
        let ctx = context(sink, RetryPolicy::unbounded());
        let mut stats = WorkerStats::default();

        let err = insert_record(7, &record(1), &ctx, &mut stats).await.unwrap_err();
        assert!(matches!(
            err,
            LoadError::Aborted { worker: 7, source: InsertError::Acquire(_) }
        ));
    }

    #[tokio::test]
    async fn backoff_is_cancellable() {
        let sink = Arc::new(FlakySink::failing_line(1, u32::MAX));
        let retry = RetryPolicy::unbounded()
            .with_backoff(Duration::from_secs(60), Duration::from_secs(60));
        let ctx = context(sink, retry);
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let mut stats = WorkerStats::default();

        let err = tokio::time::timeout(
            Duration::from_secs(1),
            insert_record(0, &record(1), &ctx, &mut stats),
        )
        .await
        .expect("cancellation interrupts backoff")
        .unwrap_err();
        assert!(err.is_cancelled());
    }
}
