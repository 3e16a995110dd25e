use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

/// Counts records that have been dispatched but not yet finished.
///
/// The producer calls [`add`](Self::add) before handing a record off, the
/// worker that owns it calls [`done`](Self::done) once the record is settled,
/// and the orchestrator parks in [`wait`](Self::wait) until the count drains
/// to zero. Clones share the same counter.
#[derive(Debug, Clone, Default)]
pub struct CompletionBarrier {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    pending: AtomicUsize,
    drained: Notify,
}

impl CompletionBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: usize) {
        self.inner.pending.fetch_add(n, Ordering::AcqRel);
    }

    /// Mark one record finished.
    ///
    /// Panics if called more times than records were added; that would mean a
    /// record was settled twice.
    pub fn done(&self) {
        let previous = self.inner.pending.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "completion barrier released below zero");
        if previous == 1 {
            self.inner.drained.notify_waiters();
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Resolve once the pending count is zero.
    pub async fn wait(&self) {
        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            // Register before checking so a concurrent `done` cannot slip between.
            drained.as_mut().enable();

            if self.pending() == 0 {
                return;
            }
            drained.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn wait_returns_immediately_when_nothing_pending() {
        let barrier = CompletionBarrier::new();
        timeout(Duration::from_millis(100), barrier.wait())
            .await
            .expect("barrier should be open");
    }

    #[tokio::test]
    async fn wait_blocks_until_all_done() {
        let barrier = CompletionBarrier::new();
        barrier.add(3);

        let waiter = tokio::spawn({
            let barrier = barrier.clone();
            async move { barrier.wait().await }
        });

        barrier.done();
        barrier.done();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        barrier.done();
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter released")
            .unwrap();
        assert_eq!(barrier.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_done_calls_drain_exactly() {
        let barrier = CompletionBarrier::new();
        barrier.add(1_000);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    barrier.done();
                    tokio::task::yield_now().await;
                }
            }));
        }

        timeout(Duration::from_secs(5), barrier.wait()).await.unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(barrier.pending(), 0);
    }

    #[test]
    #[should_panic(expected = "below zero")]
    fn done_without_add_panics() {
        CompletionBarrier::new().done();
    }
}
