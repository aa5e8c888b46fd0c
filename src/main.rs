use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use proxyprobe::admission::AdmissionController;
use proxyprobe::batch::{BatchDriver, DriveOutcome};
use proxyprobe::config::Settings;
use proxyprobe::links;
use proxyprobe::metrics::{self, Metrics, SAMPLE_PERIOD};
use proxyprobe::ports::PortManager;
use proxyprobe::probe::HttpProbe;
use proxyprobe::shutdown::ShutdownSupervisor;
use proxyprobe::tester::Tester;
use proxyprobe::xray::XrayLauncher;

/// Concurrent proxy tester driving candidates through per-test xray processes
#[derive(Parser)]
#[command(name = "proxyprobe")]
#[command(about = "Test proxy nodes through per-test xray processes")]
struct Args {
    /// Proxy list: JSON records or share links, optionally base64 wrapped
    input: PathBuf,

    /// Override PROXY_MAX_WORKERS
    #[arg(long)]
    workers: Option<usize>,

    /// Override PROXY_BATCH_SIZE
    #[arg(long)]
    batch_size: Option<usize>,

    /// Override PROXY_TIMEOUT (seconds)
    #[arg(long)]
    timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Args::parse()).await {
        Ok(code) => code,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let mut settings = Settings::from_env()?;
    if let Some(workers) = args.workers {
        settings.max_workers = workers;
    }
    if let Some(batch_size) = args.batch_size {
        settings.batch_size = batch_size;
    }
    if let Some(timeout) = args.timeout {
        settings.timeout = Duration::from_secs(timeout);
    }
    settings.prepare_dirs().with_context(|| {
        format!("failed to prepare directories under {}", settings.data_dir.display())
    })?;

    let content = tokio::fs::read_to_string(&args.input)
        .await
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let configs = links::parse_input(&content)?;
    info!(
        candidates = configs.len(),
        workers = settings.max_workers,
        batch_size = settings.batch_size,
        "starting test run"
    );

    let supervisor = Arc::new(ShutdownSupervisor::new(settings.graceful_timeout));
    let signals = supervisor.install();
    let cancel = supervisor.cancel_token();

    let metrics = Arc::new(Metrics::new());
    let sampler = metrics.spawn_sampler(SAMPLE_PERIOD, cancel.clone());
    if settings.enable_metrics {
        let listener = TcpListener::bind(("127.0.0.1", settings.metrics_port))
            .await
            .with_context(|| format!("failed to bind metrics port {}", settings.metrics_port))?;
        tokio::spawn(metrics::serve(listener, Arc::clone(&metrics), cancel.clone()));
    }

    let ports = Arc::new(PortManager::new(settings.start_port, settings.end_port));
    let launcher = Arc::new(XrayLauncher::new(
        settings.xray_path.clone(),
        settings.config_dir.clone(),
        Arc::clone(&metrics),
    ));
    let probe = Arc::new(HttpProbe::new(settings.probe_url.clone()));
    let admission = Arc::new(AdmissionController::new(
        settings.max_memory_mb,
        settings.max_workers,
        Arc::clone(&metrics),
    ));

    let tester = Tester::new(
        &settings,
        launcher,
        probe,
        Arc::clone(&ports),
        admission,
        Arc::clone(&metrics),
        supervisor.force_token(),
    );
    let driver = BatchDriver::new(
        tester,
        settings.batch_size,
        settings.incremental_save,
        settings.results_dir(),
        cancel.clone(),
    );

    let (outcome, runs) = driver.run(configs).await?;
    let interrupted = supervisor.interrupted();
    ports.release_all();
    supervisor.stopped();
    signals.abort();
    sampler.abort();

    let snapshot = metrics.snapshot();
    info!(
        batches = runs.len(),
        total = snapshot.total_tests,
        succeeded = snapshot.successful_tests,
        success_rate = format!("{:.1}%", snapshot.success_rate),
        avg_response_time = format!("{:.3}s", snapshot.avg_response_time_seconds),
        "run finished"
    );

    Ok(match outcome {
        DriveOutcome::Completed if !interrupted => ExitCode::SUCCESS,
        _ => ExitCode::from(130),
    })
}
