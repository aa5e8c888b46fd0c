use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Lifecycle of the shutdown coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Running,
    /// First signal seen; in-flight work gets the grace window.
    Draining,
    /// Second signal or grace window elapsed; work is cut off.
    Aborting,
    Stopped,
}

const RUNNING: u8 = 0;
const DRAINING: u8 = 1;
const ABORTING: u8 = 2;
const STOPPED: u8 = 3;

/// Turns OS interrupt signals into cancellation tokens.
///
/// The first signal cancels the graceful token and starts the grace
/// window. A second signal, or the window running out, cancels the
/// force token that short-circuits the tester's drain.
pub struct ShutdownSupervisor {
    cancel: CancellationToken,
    force: CancellationToken,
    state: AtomicU8,
    graceful_timeout: Duration,
}

impl ShutdownSupervisor {
    pub fn new(graceful_timeout: Duration) -> Self {
        ShutdownSupervisor {
            cancel: CancellationToken::new(),
            force: CancellationToken::new(),
            state: AtomicU8::new(RUNNING),
            graceful_timeout,
        }
    }

    /// Token cancelled on the first signal.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Token cancelled on the second signal or the drain deadline.
    pub fn force_token(&self) -> CancellationToken {
        self.force.clone()
    }

    pub fn state(&self) -> SupervisorState {
        match self.state.load(Ordering::SeqCst) {
            RUNNING => SupervisorState::Running,
            DRAINING => SupervisorState::Draining,
            ABORTING => SupervisorState::Aborting,
            _ => SupervisorState::Stopped,
        }
    }

    /// Whether any shutdown signal was observed during the run.
    pub fn interrupted(&self) -> bool {
        self.state.load(Ordering::SeqCst) != RUNNING
    }

    /// Advance the state machine by one observed signal. Used by the
    /// installed handler and directly by tests.
    pub fn signal(self: &Arc<Self>) {
        match self.state.compare_exchange(
            RUNNING,
            DRAINING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                info!("graceful shutdown, waiting for in-flight tests");
                self.cancel.cancel();
                self.spawn_drain_deadline();
            }
            Err(DRAINING) => {
                warn!("second interrupt, aborting");
                self.state.store(ABORTING, Ordering::SeqCst);
                self.force.cancel();
            }
            Err(_) => {}
        }
    }

    /// Mark the run finished. Later deadline expiry becomes a no-op.
    pub fn stopped(&self) {
        self.state.store(STOPPED, Ordering::SeqCst);
    }

    fn spawn_drain_deadline(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(supervisor.graceful_timeout).await;
            if supervisor
                .state
                .compare_exchange(DRAINING, ABORTING, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                warn!("drain window elapsed, aborting");
                supervisor.force.cancel();
            }
        });
    }

    /// Register OS signal handlers and feed them into the state
    /// machine until the run aborts or stops.
    pub fn install(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                wait_for_signal().await;
                supervisor.signal();
                if matches!(
                    supervisor.state(),
                    SupervisorState::Aborting | SupervisorState::Stopped
                ) {
                    break;
                }
            }
        })
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_signal_drains() {
        let supervisor = Arc::new(ShutdownSupervisor::new(Duration::from_secs(30)));
        assert_eq!(supervisor.state(), SupervisorState::Running);
        assert!(!supervisor.interrupted());

        supervisor.signal();
        assert_eq!(supervisor.state(), SupervisorState::Draining);
        assert!(supervisor.cancel_token().is_cancelled());
        assert!(!supervisor.force_token().is_cancelled());
        assert!(supervisor.interrupted());
    }

    #[tokio::test]
    async fn test_second_signal_aborts() {
        let supervisor = Arc::new(ShutdownSupervisor::new(Duration::from_secs(30)));
        supervisor.signal();
        supervisor.signal();
        assert_eq!(supervisor.state(), SupervisorState::Aborting);
        assert!(supervisor.force_token().is_cancelled());

        // Further signals change nothing.
        supervisor.signal();
        assert_eq!(supervisor.state(), SupervisorState::Aborting);
    }

    #[tokio::test]
    async fn test_drain_deadline_forces_abort() {
        let supervisor = Arc::new(ShutdownSupervisor::new(Duration::from_millis(20)));
        supervisor.signal();
        assert!(!supervisor.force_token().is_cancelled());
        supervisor.force_token().cancelled().await;
        assert_eq!(supervisor.state(), SupervisorState::Aborting);
    }

    #[tokio::test]
    async fn test_stopped_run_ignores_deadline() {
        let supervisor = Arc::new(ShutdownSupervisor::new(Duration::from_millis(20)));
        supervisor.signal();
        supervisor.stopped();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert!(!supervisor.force_token().is_cancelled());
    }
}
