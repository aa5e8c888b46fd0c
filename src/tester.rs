use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::AdmissionController;
use crate::config::Settings;
use crate::metrics::Metrics;
use crate::ports::{PortError, PortManager};
use crate::probe::{Probe, ProbeOutcome};
use crate::proxy::{ProxyConfig, TestResult, TestResultData};
use crate::worker::{SubmitError, Task, WorkerPool};
use crate::xray::{snippet, CoreLauncher, LaunchError};

/// Pause before re-trying a full worker queue.
const SUBMIT_RETRY: Duration = Duration::from_millis(10);

/// Per-batch coordinator. Fans configs out over a worker pool, runs
/// the lease/launch/probe pipeline per config, and collects exactly
/// one result per input even across cancellation.
pub struct Tester {
    launcher: Arc<dyn CoreLauncher>,
    probe: Arc<dyn Probe>,
    ports: Arc<PortManager>,
    admission: Arc<AdmissionController>,
    metrics: Arc<Metrics>,
    max_workers: usize,
    timeout: Duration,
    graceful_timeout: Duration,
    /// Fires on the second shutdown signal; skips the drain window.
    force: CancellationToken,
}

impl Tester {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: &Settings,
        launcher: Arc<dyn CoreLauncher>,
        probe: Arc<dyn Probe>,
        ports: Arc<PortManager>,
        admission: Arc<AdmissionController>,
        metrics: Arc<Metrics>,
        force: CancellationToken,
    ) -> Self {
        Tester {
            launcher,
            probe,
            ports,
            admission,
            metrics,
            max_workers: settings.max_workers.max(1),
            timeout: settings.timeout,
            graceful_timeout: settings.graceful_timeout,
            force,
        }
    }

    /// Test every config in the batch. The returned vector always has
    /// one entry per input; order is arbitrary aside from best effort.
    pub async fn test_batch(
        &self,
        cancel: &CancellationToken,
        batch_id: u64,
        configs: Vec<ProxyConfig>,
    ) -> Vec<TestResultData> {
        if configs.is_empty() {
            return Vec::new();
        }

        let total = configs.len();
        let pool = WorkerPool::new(self.max_workers.min(total));
        debug!(batch_id, total, workers = pool.worker_count(), "batch starting");

        // Sized to the batch so emitters never block during shutdown.
        let (results_tx, mut results_rx) = mpsc::channel::<(usize, TestResultData)>(total);
        let templates: Vec<ProxyConfig> = configs.clone();
        let mut slots: Vec<Option<TestResultData>> = Vec::new();
        slots.resize_with(total, || None);
        let mut received = 0usize;

        for (index, cfg) in configs.into_iter().enumerate() {
            let mut pending = Some(self.make_task(index, cfg, batch_id, &results_tx, cancel));
            while let Some(task) = pending.take() {
                if cancel.is_cancelled() {
                    slots[index] = Some(task.panic_fallback.into_cancelled("batch cancelled"));
                    received += 1;
                    break;
                }
                match pool.submit(task) {
                    Ok(()) => {}
                    Err(SubmitError::QueueFull(task)) => {
                        pending = Some(task);
                        tokio::time::sleep(SUBMIT_RETRY).await;
                    }
                    Err(SubmitError::ShuttingDown(task)) => {
                        slots[index] =
                            Some(task.panic_fallback.into_cancelled("worker pool unavailable"));
                        received += 1;
                    }
                }
            }
        }
        drop(results_tx);

        // Collect until done or until the batch is cancelled.
        while received < total {
            tokio::select! {
                biased;
                _ = self.force.cancelled() => break,
                _ = cancel.cancelled() => break,
                item = results_rx.recv() => match item {
                    Some((index, data)) => {
                        if slots[index].is_none() {
                            received += 1;
                        }
                        slots[index] = Some(data);
                    }
                    None => break,
                },
            }
        }

        // Cancelled mid-batch: give in-flight tasks the drain window.
        if received < total && cancel.is_cancelled() && !self.force.is_cancelled() {
            let deadline = Instant::now() + self.graceful_timeout;
            debug!(batch_id, pending = total - received, "draining after cancel");
            while received < total {
                tokio::select! {
                    biased;
                    _ = self.force.cancelled() => break,
                    _ = tokio::time::sleep_until(deadline) => break,
                    item = results_rx.recv() => match item {
                        Some((index, data)) => {
                            if slots[index].is_none() {
                                received += 1;
                            }
                            slots[index] = Some(data);
                        }
                        None => break,
                    },
                }
            }
        }

        if received == total {
            pool.shutdown().await;
        } else {
            // Workers still hold tasks past the drain deadline. Leave
            // them to finish on the runtime; their child handles kill
            // the processes when dropped.
            warn!(batch_id, missed = total - received, "drain window elapsed");
        }

        let results: Vec<TestResultData> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    TestResultData::new(
                        templates[index].clone(),
                        batch_id,
                        Utc::now(),
                        TestResult::Cancelled,
                        "cancelled during shutdown drain",
                    )
                })
            })
            .collect();

        let succeeded = results.iter().filter(|r| r.result.is_success()).count();
        info!(batch_id, total, succeeded, "batch finished");
        results
    }

    fn make_task(
        &self,
        index: usize,
        cfg: ProxyConfig,
        batch_id: u64,
        results_tx: &mpsc::Sender<(usize, TestResultData)>,
        cancel: &CancellationToken,
    ) -> Task {
        let panic_fallback = TestResultData::new(
            cfg.clone(),
            batch_id,
            Utc::now(),
            TestResult::Failure,
            "",
        );
        let launcher = Arc::clone(&self.launcher);
        let probe = Arc::clone(&self.probe);
        let ports = Arc::clone(&self.ports);
        let admission = Arc::clone(&self.admission);
        let metrics = Arc::clone(&self.metrics);
        let timeout = self.timeout;
        let cancel = cancel.child_token();
        Task {
            index,
            future: async move {
                run_one(
                    launcher, probe, ports, admission, metrics, timeout, cancel, cfg, batch_id,
                )
                .await
            }
            .boxed(),
            panic_fallback,
            results: results_tx.clone(),
        }
    }
}

/// The whole lifecycle of one test: admission, lease, launch, probe,
/// teardown. Always records into metrics exactly once.
#[allow(clippy::too_many_arguments)]
async fn run_one(
    launcher: Arc<dyn CoreLauncher>,
    probe: Arc<dyn Probe>,
    ports: Arc<PortManager>,
    admission: Arc<AdmissionController>,
    metrics: Arc<Metrics>,
    timeout: Duration,
    cancel: CancellationToken,
    mut cfg: ProxyConfig,
    batch_id: u64,
) -> TestResultData {
    let started_at = Utc::now();
    let (result, message, response_time) =
        execute(&launcher, &probe, &ports, &admission, timeout, &cancel, &mut cfg).await;
    let data = TestResultData {
        config: cfg,
        result,
        message,
        response_time,
        batch_id,
        started_at,
    };
    metrics.record(&data);
    data
}

async fn execute(
    launcher: &Arc<dyn CoreLauncher>,
    probe: &Arc<dyn Probe>,
    ports: &Arc<PortManager>,
    admission: &Arc<AdmissionController>,
    timeout: Duration,
    cancel: &CancellationToken,
    cfg: &mut ProxyConfig,
) -> (TestResult, String, f64) {
    if cancel.is_cancelled() {
        return (TestResult::Cancelled, "batch cancelled".to_string(), 0.0);
    }

    if let Err(denied) = admission.check() {
        return (TestResult::ResourceExhausted, denied.to_string(), 0.0);
    }

    // Waiting here serializes tasks when the range is smaller than
    // the worker count.
    let port_wait = timeout.max(Duration::from_millis(100));
    let mut lease = match ports.acquire_within(port_wait, cancel).await {
        Ok(lease) => lease,
        Err(PortError::Cancelled) => {
            return (
                TestResult::Cancelled,
                "cancelled while waiting for a port".to_string(),
                0.0,
            );
        }
        Err(exhausted) => {
            return (TestResult::ResourceExhausted, exhausted.to_string(), 0.0);
        }
    };
    cfg.local_port = Some(lease.port());

    let mut process = match launcher.launch(cfg, lease.port(), cancel).await {
        Ok(process) => process,
        Err(err) => {
            lease.release();
            let result = match &err {
                LaunchError::NotReady { .. } => TestResult::PortConflict,
                LaunchError::Interrupted => TestResult::Cancelled,
                _ => TestResult::LaunchFailed,
            };
            return (result, err.to_string(), 0.0);
        }
    };

    let outcome = probe.probe(cfg, lease.port(), timeout, cancel).await;
    let tail = process.output_tail();
    process.stop().await;
    lease.release();

    match outcome {
        ProbeOutcome::Success { elapsed } => {
            (TestResult::Success, String::new(), elapsed.as_secs_f64())
        }
        ProbeOutcome::Timeout => (
            TestResult::Timeout,
            format!("no response within {:.1}s", timeout.as_secs_f64()),
            0.0,
        ),
        ProbeOutcome::Failed { reason } => {
            let message = if tail.is_empty() {
                reason
            } else {
                format!("{reason}; core output: {}", snippet(&tail))
            };
            (TestResult::ProbeFailed, message, 0.0)
        }
        ProbeOutcome::Cancelled => (
            TestResult::Cancelled,
            "cancelled during probe".to_string(),
            0.0,
        ),
    }
}
