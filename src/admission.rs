use std::sync::{Arc, Mutex};

use sysinfo::{Pid, ProcessesToUpdate, System};
use thiserror::Error;

use crate::metrics::Metrics;

/// Why a task was refused before spawning anything.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionDenied {
    #[error("resident memory {used_mb} MB at or above limit {limit_mb} MB")]
    Memory { used_mb: u64, limit_mb: u64 },
    #[error("{active} core processes active, limit {limit}")]
    Processes { active: usize, limit: usize },
}

/// Gates task starts on memory and process headroom.
///
/// Checks are best-effort reads of moving values. Two tasks racing
/// past the gate can overshoot the limits by one process or a few MB,
/// which the limits are sized to absorb.
pub struct AdmissionController {
    max_memory_mb: u64,
    max_processes: usize,
    metrics: Arc<Metrics>,
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl AdmissionController {
    pub fn new(max_memory_mb: u64, max_processes: usize, metrics: Arc<Metrics>) -> Self {
        AdmissionController {
            max_memory_mb,
            max_processes,
            metrics,
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// Decide whether one more test may start right now.
    pub fn check(&self) -> Result<(), AdmissionDenied> {
        let active = self.metrics.active_processes();
        if active >= self.max_processes {
            return Err(AdmissionDenied::Processes {
                active,
                limit: self.max_processes,
            });
        }

        let used_mb = self.resident_memory_mb();
        if used_mb >= self.max_memory_mb {
            return Err(AdmissionDenied::Memory {
                used_mb,
                limit_mb: self.max_memory_mb,
            });
        }

        Ok(())
    }

    fn resident_memory_mb(&self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        let mut system = self.system.lock().unwrap();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .map(|process| process.memory() / (1024 * 1024))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generous_limits_admit() {
        let metrics = Arc::new(Metrics::new());
        let admission = AdmissionController::new(1 << 20, 64, metrics);
        assert!(admission.check().is_ok());
    }

    #[test]
    fn test_tiny_memory_limit_denies_immediately() {
        let metrics = Arc::new(Metrics::new());
        let admission = AdmissionController::new(1, 64, metrics);
        assert!(matches!(
            admission.check(),
            Err(AdmissionDenied::Memory { limit_mb: 1, .. })
        ));
    }

    #[test]
    fn test_process_headroom_denies() {
        let metrics = Arc::new(Metrics::new());
        metrics.process_started();
        metrics.process_started();
        let admission = AdmissionController::new(1 << 20, 2, metrics.clone());
        assert!(matches!(
            admission.check(),
            Err(AdmissionDenied::Processes {
                active: 2,
                limit: 2
            })
        ));
        metrics.process_stopped();
        assert!(admission.check().is_ok());
    }
}
