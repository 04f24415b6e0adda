//! Schedule callbacks onto a channel's owning loop from any thread.
//!
//! A [`TaskRunner`] can be cloned across threads; posted callbacks are
//! queued and run by whichever single-threaded loop drains the paired
//! [`TaskQueue`]. The queue is the only synchronized structure: everything
//! else on the owning loop is touched by that loop alone.

use tokio::sync::mpsc;

/// A queued callback.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Posting to a queue whose owning loop has gone away.
#[derive(Debug, thiserror::Error)]
#[error("task queue closed")]
pub struct QueueClosed;

/// Create a connected runner/queue pair.
pub fn task_queue() -> (TaskRunner, TaskQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TaskRunner { tx }, TaskQueue { rx })
}

/// Cross-thread handle for posting callbacks to the owning loop.
#[derive(Debug, Clone)]
pub struct TaskRunner {
    tx: mpsc::UnboundedSender<Task>,
}

impl TaskRunner {
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> Result<(), QueueClosed> {
        self.tx.send(Box::new(task)).map_err(|_| QueueClosed)
    }
}

/// The owning loop's end of the queue.
#[derive(Debug)]
pub struct TaskQueue {
    rx: mpsc::UnboundedReceiver<Task>,
}

impl TaskQueue {
    /// Wait for the next posted callback. `None` once every runner is gone.
    pub async fn next(&mut self) -> Option<Task> {
        self.rx.recv().await
    }

    /// Run everything already queued without waiting. Returns the number of
    /// callbacks run.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Drain the queue until every runner has been dropped.
    pub async fn run_until_closed(mut self) {
        while let Some(task) = self.next().await {
            task();
        }
    }
}
