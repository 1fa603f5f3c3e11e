//! Parallel worker pool
//!
//! Workers take plan items off a shared queue in plan order and drive one
//! coordinator run at a time. Each run is its own task, so a panic inside a
//! run surfaces as a `JoinError` for that test and the worker moves on.

use chrono::Utc;
use clnrm_common::{
    ExecutionPlan, Result, RunRecord, StepResult, TestDefinition, TraceBundleRef, Verdict,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::coordinator::RunCoordinator;

/// Outcome of a batch, records in plan order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteResult {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Runs that could not be judged
    pub errored: usize,
    pub invalid: usize,
    pub cancelled: usize,
    pub workers: usize,
    pub duration_ms: u64,
    pub records: Vec<RunRecord>,
}

impl SuiteResult {
    pub fn from_records(records: Vec<RunRecord>, workers: usize, duration_ms: u64) -> Self {
        let count = |f: fn(&Verdict) -> bool| records.iter().filter(|r| f(&r.verdict)).count();
        Self {
            total: records.len(),
            passed: count(|v| matches!(v, Verdict::Pass)),
            failed: count(|v| matches!(v, Verdict::Fail(_))),
            errored: count(|v| matches!(v, Verdict::Error(_))),
            invalid: count(|v| matches!(v, Verdict::Invalid(_))),
            cancelled: count(|v| matches!(v, Verdict::Cancelled)),
            workers,
            duration_ms,
            records,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }
}

/// Write a suite result as `test-results.json` under `dir`
pub fn write_results(result: &SuiteResult, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join("test-results.json");
    let json = serde_json::to_string_pretty(result)?;
    std::fs::write(&path, json)?;
    info!("Results written to: {}", path.display());
    Ok(path)
}

pub struct WorkerPool {
    coordinator: Arc<RunCoordinator>,
    min_workers: usize,
    max_workers: usize,
}

impl WorkerPool {
    pub fn new(coordinator: Arc<RunCoordinator>, min_workers: usize, max_workers: usize) -> Self {
        let min_workers = min_workers.max(1);
        Self {
            coordinator,
            min_workers,
            max_workers: max_workers.max(min_workers),
        }
    }

    /// Recommended size clamped to the configured bounds
    pub fn size_for(&self, recommended: usize) -> usize {
        recommended.clamp(self.min_workers, self.max_workers)
    }

    /// Run every plan item to a record
    pub async fn run(
        &self,
        plan: &ExecutionPlan,
        definitions: Arc<Vec<TestDefinition>>,
        cancel: CancellationToken,
    ) -> SuiteResult {
        let start = Instant::now();
        let workers = self.size_for(plan.workers).min(plan.items.len()).max(1);
        info!("Running {} test(s) on {} worker(s)...", plan.items.len(), workers);

        let queue: Arc<Mutex<VecDeque<(usize, usize)>>> = Arc::new(Mutex::new(
            plan.items
                .iter()
                .enumerate()
                .map(|(slot, item)| (slot, item.definition_index))
                .collect(),
        ));
        let results: Arc<Mutex<Vec<Option<RunRecord>>>> =
            Arc::new(Mutex::new(vec![None; plan.items.len()]));

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let queue = queue.clone();
            let results = results.clone();
            let definitions = definitions.clone();
            let coordinator = self.coordinator.clone();
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    let next = queue.lock().pop_front();
                    let Some((slot, index)) = next else { break };
                    let Some(definition) = definitions.get(index).cloned() else {
                        error!("Plan references missing definition {}", index);
                        continue;
                    };
                    debug!(worker, "Taking {}", definition.name);

                    let name = definition.name.clone();
                    let run = {
                        let coordinator = coordinator.clone();
                        let definition = definition.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move { coordinator.run(&definition, cancel).await })
                    };
                    let record = match run.await {
                        Ok(record) => record,
                        Err(e) => {
                            error!("✗ {} - worker task failed: {}", name, e);
                            crashed_record(&definition, &e.to_string())
                        }
                    };
                    results.lock()[slot] = Some(record);
                }
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker exited abnormally: {}", e);
            }
        }

        let records: Vec<RunRecord> = {
            let mut slots = results.lock();
            slots
                .iter_mut()
                .zip(plan.items.iter())
                .map(|(slot, item)| {
                    slot.take().unwrap_or_else(|| {
                        let def = definitions.get(item.definition_index);
                        crashed_record_named(&item.test_name, def, "run never completed")
                    })
                })
                .collect()
        };

        let result = SuiteResult::from_records(records, workers, start.elapsed().as_millis() as u64);
        info!(
            "Test Results: {} passed, {} failed, {} errored, {} invalid, {} cancelled ({} ms)",
            result.passed, result.failed, result.errored, result.invalid, result.cancelled, result.duration_ms
        );
        result
    }
}

fn crashed_record(definition: &TestDefinition, reason: &str) -> RunRecord {
    crashed_record_named(&definition.name, Some(definition), reason)
}

fn crashed_record_named(name: &str, definition: Option<&TestDefinition>, reason: &str) -> RunRecord {
    let now = Utc::now();
    RunRecord {
        run_id: uuid::Uuid::new_v4().to_string(),
        test_name: name.to_string(),
        started_at: now,
        finished_at: now,
        step_results: definition
            .map(|d| d.steps.iter().map(|s| StepResult::skipped(&s.name)).collect())
            .unwrap_or_default(),
        assertions: Vec::new(),
        verdict: Verdict::Error(reason.to_string()),
        resources: Default::default(),
        trace: TraceBundleRef::default(),
    }
}
