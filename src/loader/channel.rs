//! Rendezvous handoff between the producer and the worker pool.
//!
//! Tokio channels need at least one slot, so every record travels with a
//! oneshot acknowledgement that the receiving worker fires as soon as it owns
//! the record. The producer does not read the next row until that happens,
//! which keeps at most one record between the source and the pool.

use super::source::Record;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, oneshot};

struct Handoff {
    record: Record,
    received: oneshot::Sender<()>,
}

/// Producer half. Dropping it closes the channel.
pub struct Dispatcher {
    tx: mpsc::Sender<Handoff>,
}

/// Consumer half, shared by every worker.
#[derive(Clone)]
pub struct WorkReceiver {
    rx: Arc<Mutex<mpsc::Receiver<Handoff>>>,
}

/// Every receiver is gone. Carries the record back when it never left the
/// dispatcher; `None` when it was dropped while queued.
#[derive(Debug)]
pub struct Closed(pub Option<Record>);

pub fn handoff() -> (Dispatcher, WorkReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (
        Dispatcher { tx },
        WorkReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

impl Dispatcher {
    /// Hand a record to an idle worker, parking the calling thread until one
    /// has taken it.
    ///
    /// Must not be called from inside an async context.
    pub fn send_blocking(&self, record: Record) -> Result<(), Closed> {
        let (received, ack) = oneshot::channel();
        if let Err(mpsc::error::SendError(handoff)) =
            self.tx.blocking_send(Handoff { record, received })
        {
            return Err(Closed(Some(handoff.record)));
        }

        // The ack sender is dropped unread only if the pool shut down with the
        // record still queued.
        ack.blocking_recv().map_err(|_| Closed(None))
    }

    /// Async variant of [`send_blocking`](Self::send_blocking).
    #[cfg(test)]
    pub async fn send(&self, record: Record) -> Result<(), Closed> {
        let (received, ack) = oneshot::channel();
        if let Err(mpsc::error::SendError(handoff)) =
            self.tx.send(Handoff { record, received }).await
        {
            return Err(Closed(Some(handoff.record)));
        }

        ack.await.map_err(|_| Closed(None))
    }
}

impl WorkReceiver {
    /// Next record, or `None` once the dispatcher is dropped and the channel
    /// is drained.
    pub async fn recv(&self) -> Option<Record> {
        let handoff = {
            let mut rx = self.rx.lock().await;
            rx.recv().await?
        };
        // The producer may have given up waiting; the record is still ours.
        let _ = handoff.received.send(());
        Some(handoff.record)
    }
}
