//! Task id queue between the dispatcher and the worker pool.
//!
//! Delivery is at-least-once: the same id may be handed out more than once (retries, reaper
//! re-queues, startup recovery), and workers rely on the store's claim transaction to ignore
//! duplicates. The queue holds ids only; task state lives in the store.

use crate::pipeline::TaskId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::Notify;

/// Errors raised by a broker.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker was closed and accepts no more work.
    #[error("broker is closed")]
    Closed,
}

/// Queue of task ids with blocking dequeue.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append ids in order.
    async fn enqueue_batch(&self, ids: &[TaskId]) -> Result<(), BrokerError>;

    /// Wait for the next id. Returns `None` once the broker is closed.
    async fn dequeue(&self) -> Option<TaskId>;

    /// Ids waiting for a worker.
    fn depth(&self) -> usize;

    /// Stop accepting work and wake every waiting consumer.
    fn close(&self);
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<TaskId>,
    closed: bool,
}

/// In-process FIFO broker.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl MemoryBroker {
    /// Create an empty, open broker.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue_batch(&self, ids: &[TaskId]) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(BrokerError::Closed);
            }
            state.queue.extend(ids.iter().copied());
        }
        for _ in ids {
            self.notify.notify_one();
        }
        tracing::trace!(count = ids.len(), "Enqueued task ids");
        Ok(())
    }

    async fn dequeue(&self) -> Option<TaskId> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(id) = state.queue.pop_front() {
                    return Some(id);
                }
            }

            notified.await;
        }
    }

    fn depth(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }
}
