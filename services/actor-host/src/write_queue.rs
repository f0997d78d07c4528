//! Single-flight write queue.
//!
//! At most one write runs at a time. While it runs, newer writes replace any
//! write that is queued but not yet started, and every caller that enqueued
//! during that window is resolved by the write that eventually runs. A write
//! that fails is logged and the queue keeps draining; the failure is handed
//! to the callers of that cycle.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::driver::StorageError;

pub type WriteOutcome = Result<(), StorageError>;

/// A deferred storage write.
pub type WriteOp = BoxFuture<'static, WriteOutcome>;

#[derive(Clone)]
pub struct WriteQueue {
    inner: Arc<Inner>,
}

struct Inner {
    label: &'static str,
    state: Mutex<QueueState>,
    idle_tx: watch::Sender<bool>,
}

#[derive(Default)]
struct QueueState {
    queued: Option<WriteOp>,
    waiters: Vec<oneshot::Sender<WriteOutcome>>,
    draining: bool,
}

/// Resolves when the write cycle this caller joined has completed.
#[must_use = "dropping a ticket does not cancel the write"]
pub struct WriteTicket {
    rx: oneshot::Receiver<WriteOutcome>,
}

impl WriteTicket {
    pub async fn wait(self) -> WriteOutcome {
        self.rx
            .await
            .unwrap_or_else(|_| Err(StorageError::Backend("write queue dropped".into())))
    }
}

impl WriteQueue {
    pub fn new(label: &'static str) -> Self {
        let (idle_tx, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                label,
                state: Mutex::new(QueueState::default()),
                idle_tx,
            }),
        }
    }

    /// Queues `op`, replacing any write that has not started yet.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, op: WriteOp) -> WriteTicket {
        let (tx, rx) = oneshot::channel();

        let start_drain = {
            let mut state = self.inner.lock();
            if state.queued.replace(op).is_some() {
                debug!(queue = self.inner.label, "Replaced pending write");
            }
            state.waiters.push(tx);
            !std::mem::replace(&mut state.draining, true)
        };

        if start_drain {
            self.inner.idle_tx.send_replace(false);
            tokio::spawn(drain(Arc::clone(&self.inner)));
        }

        WriteTicket { rx }
    }

    /// Waits until nothing is queued or running.
    pub async fn drain(&self) {
        let mut idle = self.inner.idle_tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = idle.wait_for(|idle| *idle).await;
    }

    pub fn is_idle(&self) -> bool {
        *self.inner.idle_tx.borrow()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn drain(inner: Arc<Inner>) {
    loop {
        let (op, waiters) = {
            let mut state = inner.lock();
            match state.queued.take() {
                Some(op) => (op, std::mem::take(&mut state.waiters)),
                None => {
                    state.draining = false;
                    inner.idle_tx.send_replace(true);
                    return;
                }
            }
        };

        let outcome = match AssertUnwindSafe(op).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => Err(StorageError::Backend("write panicked".into())),
        };

        if let Err(e) = &outcome {
            warn!(queue = inner.label, error = %e, "Queued write failed");
        }

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}
