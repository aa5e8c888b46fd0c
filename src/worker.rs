use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::proxy::{TestResult, TestResultData};

/// One queued unit of work plus everything needed to report it.
pub struct Task {
    /// Position in the submitting batch, echoed back with the result.
    pub index: usize,
    pub future: BoxFuture<'static, TestResultData>,
    /// Result template used when the future panics instead of returning.
    pub panic_fallback: TestResultData,
    pub results: mpsc::Sender<(usize, TestResultData)>,
}

/// Submission refusals hand the task back to the caller.
pub enum SubmitError {
    QueueFull(Task),
    ShuttingDown(Task),
}

/// Fixed set of worker loops over a bounded task queue.
///
/// Submission never blocks. The queue holds twice the worker count,
/// so a full queue is a backpressure signal rather than an error.
pub struct WorkerPool {
    queue: mpsc::Sender<Task>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (queue, rx) = mpsc::channel::<Task>(workers * 2);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handles = (0..workers)
            .map(|id| {
                let rx = Arc::clone(&rx);
                tokio::spawn(worker_loop(id, rx))
            })
            .collect();
        WorkerPool {
            queue,
            workers: handles,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Enqueue a task without waiting for a slot.
    pub fn submit(&self, task: Task) -> Result<(), SubmitError> {
        match self.queue.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) => Err(SubmitError::QueueFull(task)),
            Err(TrySendError::Closed(task)) => Err(SubmitError::ShuttingDown(task)),
        }
    }

    /// Close the queue and join the workers. Already queued tasks
    /// still run; each worker exits after its current one.
    pub async fn shutdown(self) {
        drop(self.queue);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

async fn worker_loop(id: usize, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>) {
    loop {
        let task = { rx.lock().await.recv().await };
        let Some(task) = task else {
            debug!(worker = id, "worker exiting");
            break;
        };
        let Task {
            index,
            future,
            mut panic_fallback,
            results,
        } = task;

        let outcome = match std::panic::AssertUnwindSafe(future).catch_unwind().await {
            Ok(data) => data,
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                warn!(worker = id, index, "task panicked: {reason}");
                panic_fallback.result = TestResult::Failure;
                panic_fallback.message = format!("panic: {reason}");
                panic_fallback
            }
        };

        // The channel is sized to the batch, so this only fails when
        // the collector already went away.
        let _ = results.send((index, outcome)).await;
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
