use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::proxy::{ProxyConfig, TestResultData};
use crate::tester::Tester;

/// How a full driver run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    Completed,
    /// Shutdown arrived before the last batch finished.
    Interrupted,
}

/// Summary of one `test_batch` call.
#[derive(Debug)]
pub struct BatchRun {
    pub batch_id: u64,
    pub size: usize,
    pub results: Vec<TestResultData>,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
}

impl BatchRun {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.result.is_success()).count()
    }
}

/// Slices the input into batches and feeds them through the tester.
pub struct BatchDriver {
    tester: Tester,
    batch_size: usize,
    incremental_save: bool,
    results_dir: PathBuf,
    cancel: CancellationToken,
}

impl BatchDriver {
    pub fn new(
        tester: Tester,
        batch_size: usize,
        incremental_save: bool,
        results_dir: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        BatchDriver {
            tester,
            batch_size: batch_size.max(1),
            incremental_save,
            results_dir,
            cancel,
        }
    }

    /// Run every batch to completion or until shutdown. Each batch
    /// result array lands in `result_<id>.json`; with incremental
    /// save off, files are written together at the end.
    pub async fn run(&self, configs: Vec<ProxyConfig>) -> Result<(DriveOutcome, Vec<BatchRun>)> {
        let total = configs.len();
        let mut runs = Vec::new();
        let mut outcome = DriveOutcome::Completed;

        for (index, chunk) in configs.chunks(self.batch_size).enumerate() {
            let batch_id = index as u64 + 1;
            if self.cancel.is_cancelled() {
                warn!(batch_id, "shutdown before batch start");
                outcome = DriveOutcome::Interrupted;
                break;
            }

            let started = Utc::now();
            let results = self
                .tester
                .test_batch(&self.cancel, batch_id, chunk.to_vec())
                .await;
            let run = BatchRun {
                batch_id,
                size: chunk.len(),
                results,
                started,
                finished: Utc::now(),
            };
            info!(
                batch_id,
                size = run.size,
                succeeded = run.succeeded(),
                "batch done ({} of {} configs processed so far)",
                runs.iter().map(|r: &BatchRun| r.size).sum::<usize>() + run.size,
                total,
            );

            if self.incremental_save {
                self.save(&run)?;
            }
            runs.push(run);

            if self.cancel.is_cancelled() {
                outcome = DriveOutcome::Interrupted;
                break;
            }
        }

        if !self.incremental_save {
            // Incremental runs saved as they went, interrupted or not.
            for run in &runs {
                self.save(run)?;
            }
        }

        Ok((outcome, runs))
    }

    fn save(&self, run: &BatchRun) -> Result<()> {
        let path = self.results_dir.join(format!("result_{}.json", run.batch_id));
        let content = serde_json::to_string_pretty(&run.results)?;
        std::fs::write(&path, content)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(batch_id = run.batch_id, path = %path.display(), "results saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_run_counts_successes() {
        use crate::proxy::{ProxyConfig, TestResult, TestResultData};
        let results = vec![
            TestResultData::success(ProxyConfig::default(), 1, Utc::now(), 0.1),
            TestResultData::new(
                ProxyConfig::default(),
                1,
                Utc::now(),
                TestResult::Timeout,
                "",
            ),
        ];
        let run = BatchRun {
            batch_id: 1,
            size: 2,
            results,
            started: Utc::now(),
            finished: Utc::now(),
        };
        assert_eq!(run.succeeded(), 1);
    }
}
