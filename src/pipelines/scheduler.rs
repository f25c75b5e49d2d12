//! Drives every sample chain to completion with a bounded number of
//! concurrently running stages.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config::defs::PipelineError;
use crate::pipelines::executor::{StageExecutor, TaskInstance};
use crate::pipelines::graph::{BoundStage, BranchRole, SamplePlan};
use crate::pipelines::publish::{OutputOrganizer, PublishOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    Succeeded,
    Failed,
    /// Stopped before completion because another chain hit a fatal error.
    Halted,
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChainStatus::Succeeded => "Succeeded",
            ChainStatus::Failed => "Failed",
            ChainStatus::Halted => "Halted",
        };
        write!(f, "{}", s)
    }
}

/// Terminal state of one sample's chain.
#[derive(Debug)]
pub struct ChainReport {
    pub sample_id: String,
    pub status: ChainStatus,
    pub failed_stage: Option<&'static str>,
    pub diagnostics: Option<String>,
    /// Main chain tasks in execution order.
    pub tasks: Vec<TaskInstance>,
    /// Side reports. Their outcome never changes `status`.
    pub side_tasks: Vec<TaskInstance>,
    pub publish_errors: Vec<PipelineError>,
}

impl ChainReport {
    pub(crate) fn new(sample_id: &str) -> Self {
        ChainReport {
            sample_id: sample_id.to_string(),
            status: ChainStatus::Succeeded,
            failed_stage: None,
            diagnostics: None,
            tasks: Vec::new(),
            side_tasks: Vec::new(),
            publish_errors: Vec::new(),
        }
    }

    fn mark_halted(&mut self, stage: &'static str) {
        warn!("{}: run halted, not dispatching '{}'", self.sample_id, stage);
        self.status = ChainStatus::Halted;
        self.failed_stage.get_or_insert(stage);
        self.diagnostics.get_or_insert_with(|| "run halted after a fatal error".to_string());
    }

    pub fn task(&self, stage: &str) -> Option<&TaskInstance> {
        self.tasks.iter().chain(self.side_tasks.iter()).find(|t| t.stage_name == stage)
    }
}

#[derive(Debug)]
pub struct RunReport {
    /// In sample order.
    pub chains: Vec<ChainReport>,
    pub halted: bool,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        !self.halted && self.chains.iter().all(|c| c.status == ChainStatus::Succeeded)
    }

    pub fn failed_samples(&self) -> Vec<&str> {
        self.chains
            .iter()
            .filter(|c| c.status != ChainStatus::Succeeded)
            .map(|c| c.sample_id.as_str())
            .collect()
    }

    /// Per-sample terminal status, one tab-separated row per sample.
    pub fn status_table(&self) -> String {
        let mut table = String::from("sample_id\tstatus\tfailed_stage\tdiagnostics\n");
        for chain in &self.chains {
            table.push_str(&format!(
                "{}\t{}\t{}\t{}\n",
                chain.sample_id,
                chain.status,
                chain.failed_stage.unwrap_or("-"),
                chain.diagnostics.as_deref().unwrap_or("-").replace(['\t', '\n'], " ")
            ));
        }
        table
    }
}


/// Runs sample chains concurrently and stages within a chain sequentially.
/// Every stage, main or side, holds one worker slot while its tools run.
#[derive(Debug, Clone)]
pub struct Scheduler {
    executor: StageExecutor,
    organizer: OutputOrganizer,
    slots: Arc<Semaphore>,
    halt: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(max_parallel: usize, organizer: OutputOrganizer) -> Self {
        Scheduler {
            executor: StageExecutor::new(),
            organizer,
            slots: Arc::new(Semaphore::new(max_parallel.max(1))),
            halt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stops dispatch of new stages. Running tools are left to finish.
    pub fn halt(&self) {
        self.halt.store(true, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halt.load(Ordering::SeqCst)
    }

    /// Runs all chains to a terminal state.
    ///
    /// # Arguments
    ///
    /// * `plans` - One bound plan per sample.
    ///
    /// # Returns
    /// RunReport with one ChainReport per plan, in the same order.
    pub async fn run(&self, plans: &[SamplePlan]) -> RunReport {
        info!(
            "Scheduling {} samples with {} worker slots",
            plans.len(),
            self.slots.available_permits()
        );
        let chains = join_all(plans.iter().map(|plan| self.run_chain(plan))).await;
        RunReport { chains, halted: self.is_halted() }
    }

    async fn run_chain(&self, plan: &SamplePlan) -> ChainReport {
        let sample_id = &plan.sample.sample_id;
        let mut report = ChainReport::new(sample_id);
        let mut succeeded: HashSet<&'static str> = HashSet::new();
        let mut side_handles: Vec<(&'static str, JoinHandle<Option<(TaskInstance, PublishOutcome)>>)> = Vec::new();

        for stage in &plan.stages {
            if self.is_halted() {
                report.mark_halted(stage.name());
                break;
            }

            let upstream = stage.spec.upstream_stages();
            if !upstream.iter().all(|s| succeeded.contains(s)) {
                // Only side reports can get here: the main chain stops at its first failure.
                debug!("{}: skipping '{}', upstream did not succeed", sample_id, stage.name());
                continue;
            }

            match stage.spec.role {
                BranchRole::SideReport => {
                    let this = self.clone();
                    let stage = stage.clone();
                    let name = stage.name();
                    side_handles.push((name, tokio::spawn(async move { this.run_stage(&stage).await })));
                }
                BranchRole::Main => {
                    let Some((task, outcome)) = self.run_stage(stage).await else {
                        report.mark_halted(stage.name());
                        break;
                    };
                    report.publish_errors.extend(outcome.errors);

                    if task.succeeded() {
                        succeeded.insert(stage.name());
                        report.tasks.push(task);
                        continue;
                    }

                    report.status = ChainStatus::Failed;
                    report.failed_stage = Some(stage.name());
                    report.diagnostics = Some(task.diagnostics());
                    report.tasks.push(task);
                    break;
                }
            }
        }

        for (name, handle) in side_handles {
            match handle.await {
                Ok(None) => debug!("{}: side report '{}' not dispatched, run halted", sample_id, name),
                Ok(Some((task, outcome))) => {
                    if !task.succeeded() {
                        warn!("{}: side report '{}' failed: {}", sample_id, name, task.diagnostics());
                    }
                    report.publish_errors.extend(outcome.errors);
                    report.side_tasks.push(task);
                }
                Err(e) => warn!("{}: side report '{}' did not complete: {}", sample_id, name, e),
            }
        }

        match report.status {
            ChainStatus::Succeeded => info!("{}: chain succeeded", sample_id),
            status => error!(
                "{}: chain {} at '{}'",
                sample_id,
                status,
                report.failed_stage.unwrap_or("-")
            ),
        }
        report
    }

    /// Executes and publishes one stage while holding a worker slot. The slot
    /// is released when the permit drops, whatever the outcome.
    ///
    /// # Returns
    /// None when the run was halted while the stage waited for a slot; the
    /// stage is then never dispatched.
    async fn run_stage(&self, stage: &BoundStage) -> Option<(TaskInstance, PublishOutcome)> {
        let permit = match self.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                let task = TaskInstance::new(stage).fail(PipelineError::Other(anyhow!("worker slots closed: {}", e)));
                return Some((task, PublishOutcome::default()));
            }
        };
        if self.is_halted() {
            drop(permit);
            return None;
        }
        let task = self.executor.execute(stage).await;
        if stage.spec.role == BranchRole::Main && task.error.as_ref().is_some_and(PipelineError::is_fatal) {
            // Raised before the slot is released so no queued stage slips through.
            error!("{}: fatal error in '{}', halting the run", stage.sample_id, stage.name());
            self.halt();
        }
        drop(permit);

        let outcome = self.organizer.publish(stage, &task).await;
        Some((task, outcome))
    }
}
