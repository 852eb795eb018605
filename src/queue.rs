//! Bounded task queue between the chunker and the workers
//!
//! A thin wrapper over a bounded MPMC channel. The producer side blocks
//! when the queue is full, which is how backpressure reaches the chunker.
//! The orchestrator closes the queue exactly once after the last chunk has
//! been enqueued; workers observe the close and drain what remains.

use tokio_util::sync::CancellationToken;

use crate::error::{QuarryError, Result};
use crate::task::Task;

/// Queue capacity, independent of the worker count
pub const DEFAULT_DUMP_THREADS: usize = 128;

pub struct TaskQueue {
    tx: async_channel::Sender<Task>,
    rx: async_channel::Receiver<Task>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_DUMP_THREADS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(capacity);
        Self { tx, rx }
    }

    /// Enqueue a task, waiting while the queue is full
    pub async fn push(&self, task: Task) -> Result<()> {
        self.tx
            .send(task)
            .await
            .map_err(|_| QuarryError::Internal("task queue closed while producing".into()))
    }

    /// Enqueue a task unless the dump is canceled. A producer waiting for
    /// queue capacity must observe cancellation, or a failed worker pool
    /// would leave it blocked forever.
    pub async fn push_unless_canceled(&self, task: Task, token: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = token.cancelled() => Err(QuarryError::Canceled),
            sent = self.push(task) => sent,
        }
    }

    /// A receiving handle for one worker
    pub fn receiver(&self) -> async_channel::Receiver<Task> {
        self.rx.clone()
    }

    /// Signal the workers to drain and exit. Called exactly once, after all
    /// producers finished.
    pub fn close(&self) {
        self.tx.close();
    }

    /// Tasks currently waiting in the queue
    pub fn pending(&self) -> usize {
        self.tx.len()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(usize::MAX)
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn schema_task(n: usize) -> Task {
        Task::DatabaseMeta {
            database: format!("d{}", n),
            create_sql: String::new(),
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = TaskQueue::with_capacity(4);
        for i in 0..3 {
            queue.push(schema_task(i)).await.unwrap();
        }
        let rx = queue.receiver();
        for i in 0..3 {
            match rx.recv().await.unwrap() {
                Task::DatabaseMeta { database, .. } => assert_eq!(database, format!("d{}", i)),
                other => panic!("unexpected task {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_push_blocks_when_full() {
        let queue = TaskQueue::with_capacity(2);
        queue.push(schema_task(0)).await.unwrap();
        queue.push(schema_task(1)).await.unwrap();
        assert_eq!(queue.pending(), 2);

        // Third push must block until a consumer makes room
        let blocked = tokio::time::timeout(Duration::from_millis(50), queue.push(schema_task(2)));
        assert!(blocked.await.is_err(), "push should block on a full queue");

        let rx = queue.receiver();
        rx.recv().await.unwrap();
        tokio::time::timeout(Duration::from_millis(200), queue.push(schema_task(2)))
            .await
            .expect("push should complete once capacity frees")
            .unwrap();
    }

    #[tokio::test]
    async fn test_push_unless_canceled_unblocks_on_cancel() {
        let queue = TaskQueue::with_capacity(1);
        queue.push(schema_task(0)).await.unwrap();

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        // Queue is full and nobody consumes; only cancellation frees us
        let result =
            tokio::time::timeout(Duration::from_secs(2), queue.push_unless_canceled(schema_task(1), &token))
                .await
                .expect("cancellation must unblock the producer");
        assert!(matches!(result, Err(crate::error::QuarryError::Canceled)));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = TaskQueue::with_capacity(4);
        queue.push(schema_task(0)).await.unwrap();
        queue.close();

        let rx = queue.receiver();
        // Remaining task is still delivered after close
        assert!(rx.recv().await.is_ok());
        // Then the channel reports closed
        assert!(rx.recv().await.is_err());
        // And producing fails
        assert!(queue.push(schema_task(1)).await.is_err());
    }
}
