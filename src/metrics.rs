use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{ProcessesToUpdate, System};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::proxy::TestResultData;

/// How often the sampler refreshes the resident memory gauge.
pub const SAMPLE_PERIOD: Duration = Duration::from_secs(5);

struct MeanState {
    samples: u64,
    mean_secs: f64,
}

/// Process-wide test counters and gauges.
///
/// Counters are plain atomics so task completions never contend;
/// only the running mean takes a lock. Snapshot readers tolerate
/// skew between individual counters.
pub struct Metrics {
    total: AtomicU64,
    success: AtomicU64,
    failure: AtomicU64,
    active_processes: AtomicI64,
    memory_mb: AtomicU64,
    mean: Mutex<MeanState>,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            total: AtomicU64::new(0),
            success: AtomicU64::new(0),
            failure: AtomicU64::new(0),
            active_processes: AtomicI64::new(0),
            memory_mb: AtomicU64::new(0),
            mean: Mutex::new(MeanState {
                samples: 0,
                mean_secs: 0.0,
            }),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Record one finished test. Successful response times feed the
    /// running mean; everything else only bumps the failure counter.
    pub fn record(&self, data: &TestResultData) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if data.result.is_success() {
            self.success.fetch_add(1, Ordering::Relaxed);
            let mut mean = self.mean.lock().unwrap();
            mean.samples += 1;
            mean.mean_secs += (data.response_time - mean.mean_secs) / mean.samples as f64;
        } else {
            self.failure.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn process_started(&self) {
        self.active_processes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn process_stopped(&self) {
        self.active_processes.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_processes(&self) -> usize {
        self.active_processes.load(Ordering::Relaxed).max(0) as usize
    }

    pub fn memory_usage_mb(&self) -> u64 {
        self.memory_mb.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let success = self.success.load(Ordering::Relaxed);
        let failure = self.failure.load(Ordering::Relaxed);
        let mean_secs = self.mean.lock().unwrap().mean_secs;
        MetricsSnapshot {
            total_tests: total,
            successful_tests: success,
            failed_tests: failure,
            success_rate: if total > 0 {
                success as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            avg_response_time_seconds: mean_secs,
            memory_usage_mb: self.memory_usage_mb(),
            active_processes: self.active_processes(),
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Background task refreshing the resident memory gauge until
    /// `cancel` fires. The first refresh happens immediately.
    pub fn spawn_sampler(
        self: &Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let metrics = Arc::clone(self);
        tokio::spawn(async move {
            let mut system = System::new();
            let pid = match sysinfo::get_current_pid() {
                Ok(pid) => pid,
                Err(e) => {
                    debug!("memory sampler disabled: {e}");
                    return;
                }
            };
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                        if let Some(process) = system.process(pid) {
                            let mb = process.memory() / (1024 * 1024);
                            metrics.memory_mb.store(mb, Ordering::Relaxed);
                        }
                    }
                }
            }
            debug!("memory sampler stopped");
        })
    }
}

/// JSON body served on `GET /metrics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_tests: u64,
    pub successful_tests: u64,
    pub failed_tests: u64,
    pub success_rate: f64,
    pub avg_response_time_seconds: f64,
    pub memory_usage_mb: u64,
    pub active_processes: usize,
    pub uptime_seconds: u64,
}

/// Serve the metrics API on a pre-bound listener until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(metrics);

    info!("metrics listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    info!("metrics server shut down");
    Ok(())
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> Json<MetricsSnapshot> {
    Json(metrics.snapshot())
}

async fn health_handler() -> &'static str {
    "OK"
}
