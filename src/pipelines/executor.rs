//! Runs one bound stage for one sample under its retry policy.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::anyhow;
use log::{debug, error, info, warn};
use tokio::process::Command;

use crate::config::defs::PipelineError;
use crate::pipelines::graph::{BoundStage, NativeStep, Step, ToolCommand};
use crate::utils::fastq::count_fastq_records;
use crate::utils::file::is_non_empty_file;
use crate::utils::sambam::write_low_coverage_mask;
use crate::utils::stats::percent_trimmed;

/// Lifecycle of a task. Running and Retrying may alternate until the retry
/// policy is spent; Succeeded and Failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Retrying,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }

    fn can_advance_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Retrying)
                | (Retrying, Running)
        )
    }
}

/// One concrete execution of a stage for one sample.
#[derive(Debug)]
pub struct TaskInstance {
    pub stage_name: &'static str,
    pub sample_id: String,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub resolved_input_paths: Vec<PathBuf>,
    pub resolved_output_paths: Vec<PathBuf>,
    /// One log per attempt, in attempt order.
    pub attempt_logs: Vec<PathBuf>,
    pub error: Option<PipelineError>,
}

impl TaskInstance {
    pub fn new(stage: &BoundStage) -> Self {
        TaskInstance {
            stage_name: stage.name(),
            sample_id: stage.sample_id.clone(),
            status: TaskStatus::Pending,
            attempt_count: 0,
            resolved_input_paths: stage.input_paths(),
            resolved_output_paths: stage.output_paths(),
            attempt_logs: Vec::new(),
            error: None,
        }
    }

    fn advance(&mut self, next: TaskStatus) {
        debug_assert!(
            self.status.can_advance_to(next),
            "invalid task transition {:?} -> {:?}",
            self.status,
            next
        );
        self.status = next;
    }

    pub(crate) fn fail(mut self, e: PipelineError) -> Self {
        self.advance(TaskStatus::Failed);
        self.error = Some(e);
        self
    }

    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }

    pub fn last_log(&self) -> Option<&Path> {
        self.attempt_logs.last().map(PathBuf::as_path)
    }

    /// Failure message, empty when the task did not fail.
    pub fn diagnostics(&self) -> String {
        self.error.as_ref().map(|e| e.to_string()).unwrap_or_default()
    }
}


/// Stateless runner. Every attempt captures its command lines, stdout and
/// stderr into its own log next to the stage outputs.
#[derive(Debug, Clone, Default)]
pub struct StageExecutor;

impl StageExecutor {
    pub fn new() -> Self {
        StageExecutor
    }

    /// Runs `stage` until it succeeds or its retry policy is spent.
    ///
    /// # Arguments
    ///
    /// * `stage` - Stage bound to one sample's paths.
    ///
    /// # Returns
    /// The terminal TaskInstance. On failure `error` holds a
    /// RetriesExhausted error, or the non-retriable error that stopped it.
    pub async fn execute(&self, stage: &BoundStage) -> TaskInstance {
        let task = TaskInstance::new(stage);

        if let Err(e) = check_inputs(stage) {
            error!("{} [{}]: {}", stage.sample_id, stage.name(), e);
            return task.fail(e);
        }
        if let Err(e) = tokio::fs::create_dir_all(&stage.work_dir).await {
            return task.fail(PipelineError::IOError(format!(
                "Failed to create {}: {}",
                stage.work_dir.display(),
                e
            )));
        }

        self.run_with_retry(stage, task).await
    }

    async fn run_with_retry(&self, stage: &BoundStage, mut task: TaskInstance) -> TaskInstance {
        let policy = &stage.spec.retry_policy;

        for attempt in 1..=policy.max_attempts {
            task.advance(TaskStatus::Running);
            task.attempt_count = attempt;
            debug!("{} [{}]: attempt {}/{}", stage.sample_id, stage.name(), attempt, policy.max_attempts);

            let (result, log_path) = self.run_attempt(stage, attempt, policy.timeout).await;
            if let Some(path) = log_path {
                task.attempt_logs.push(path);
            }

            match result {
                Ok(()) => {
                    task.advance(TaskStatus::Succeeded);
                    info!("{} [{}]: succeeded (attempt {})", stage.sample_id, stage.name(), attempt);
                    return task;
                }
                Err(e) if e.is_retriable() && attempt < policy.max_attempts => {
                    warn!("{} [{}]: {}; retrying", stage.sample_id, stage.name(), e);
                    task.advance(TaskStatus::Retrying);
                    if !policy.backoff.is_zero() {
                        tokio::time::sleep(policy.backoff).await;
                    }
                }
                Err(e) if e.is_retriable() => {
                    error!("{} [{}]: {}; giving up", stage.sample_id, stage.name(), e);
                    return task.fail(PipelineError::RetriesExhausted {
                        stage: stage.name().to_string(),
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    error!("{} [{}]: {}", stage.sample_id, stage.name(), e);
                    return task.fail(e);
                }
            }
        }

        // Only reachable with a zero-attempt policy, which the graph rejects.
        task.fail(PipelineError::Configuration(format!(
            "Stage '{}' has no attempts configured",
            stage.name()
        )))
    }

    /// Runs every step of one attempt and verifies the declared outputs.
    ///
    /// # Returns
    /// The attempt result and the path of its log, if the log could be written.
    async fn run_attempt(
        &self,
        stage: &BoundStage,
        attempt: u32,
        timeout: Option<Duration>,
    ) -> (Result<(), PipelineError>, Option<PathBuf>) {
        let mut log = String::new();
        let _ = writeln!(log, "# sample: {}  stage: {}  attempt: {}", stage.sample_id, stage.name(), attempt);

        let mut result = remove_stale_outputs(stage).await;
        if result.is_ok() {
            for step in &stage.spec.steps {
                result = match step {
                    Step::Tool(cmd) => run_tool(stage, cmd, attempt, timeout, &mut log).await,
                    Step::Native(native) => run_native(stage, native, attempt, &mut log).await,
                };
                if result.is_err() {
                    break;
                }
            }
        }
        if result.is_ok() {
            result = check_outputs(stage);
        }
        if let Err(e) = &result {
            let _ = writeln!(log, "# error: {}", e);
        }

        let log_path = stage
            .work_dir
            .join(format!("{}_{}.attempt{}.log", stage.sample_id, stage.name(), attempt));
        match tokio::fs::write(&log_path, log).await {
            Ok(()) => (result, Some(log_path)),
            Err(e) => {
                warn!("Failed to write attempt log {}: {}", log_path.display(), e);
                (result, None)
            }
        }
    }
}


fn check_inputs(stage: &BoundStage) -> Result<(), PipelineError> {
    for input in &stage.inputs {
        for file in &input.required_files {
            if file.exists() {
                continue;
            }
            return Err(if input.is_static {
                PipelineError::Configuration(format!(
                    "Reference input '{}' for stage '{}' disappeared: {}",
                    input.name,
                    stage.name(),
                    file.display()
                ))
            } else {
                PipelineError::MissingInput {
                    stage: stage.name().to_string(),
                    path: file.clone(),
                }
            });
        }
    }
    Ok(())
}

fn check_outputs(stage: &BoundStage) -> Result<(), PipelineError> {
    match stage.outputs.iter().find(|o| !is_non_empty_file(&o.path)) {
        Some(output) => Err(PipelineError::ToolOutput {
            stage: stage.name().to_string(),
            path: output.path.clone(),
        }),
        None => Ok(()),
    }
}

/// Leftovers from a failed attempt must not pass the output check.
async fn remove_stale_outputs(stage: &BoundStage) -> Result<(), PipelineError> {
    for output in &stage.outputs {
        match tokio::fs::remove_file(&output.path).await {
            Ok(()) => debug!("Removed stale output {}", output.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(PipelineError::IOError(format!(
                    "Failed to remove stale output {}: {}",
                    output.path.display(),
                    e
                )));
            }
        }
    }
    Ok(())
}

async fn run_tool(
    stage: &BoundStage,
    cmd: &ToolCommand,
    attempt: u32,
    timeout: Option<Duration>,
    log: &mut String,
) -> Result<(), PipelineError> {
    let args = stage.render_args(cmd)?;
    let _ = writeln!(log, "$ {} {}", cmd.program, args.join(" "));
    debug!("{} [{}]: {} {}", stage.sample_id, stage.name(), cmd.program, args.join(" "));

    let invocation_error = |status: String| PipelineError::ToolInvocation {
        stage: stage.name().to_string(),
        tool: cmd.tool.to_string(),
        attempt,
        status,
    };

    let mut command = Command::new(&cmd.program);
    command
        .args(&args)
        .current_dir(&stage.work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match timeout {
        Some(limit) => match tokio::time::timeout(limit, command.output()).await {
            Ok(output) => output,
            Err(_) => {
                let _ = writeln!(log, "# timed out after {:?}", limit);
                return Err(invocation_error(format!("timed out after {:?}", limit)));
            }
        },
        None => command.output().await,
    }
    .map_err(|e| invocation_error(format!("failed to spawn {}: {}", cmd.program, e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    match cmd.stdout_to {
        Some(slot) => {
            let path = stage.output_path(slot)?;
            tokio::fs::write(path, &output.stdout).await?;
            let _ = writeln!(log, "--- stdout -> {} ---", path.display());
        }
        None => {
            let _ = writeln!(log, "--- stdout ---\n{}", stdout.trim_end());
        }
    }
    let _ = writeln!(log, "--- stderr ---\n{}", stderr.trim_end());
    let _ = writeln!(log, "# {}", output.status);

    if output.status.success() {
        Ok(())
    } else {
        let detail = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
        Err(invocation_error(format!("{} {}", output.status, detail).trim_end().to_string()))
    }
}

async fn run_native(
    stage: &BoundStage,
    step: &NativeStep,
    attempt: u32,
    log: &mut String,
) -> Result<(), PipelineError> {
    let (label, job): (&str, Box<dyn FnOnce() -> anyhow::Result<String> + Send>) = match step {
        NativeStep::LowCoverageMask { depth, bed, min_depth } => {
            let depth = stage.input_path(depth)?.to_path_buf();
            let bed = stage.output_path(bed)?.to_path_buf();
            let min_depth = *min_depth;
            (
                "low_coverage_mask",
                Box::new(move || {
                    let intervals = write_low_coverage_mask(&depth, &bed, min_depth)?;
                    Ok(format!("{} intervals below depth {} written to {}", intervals, min_depth, bed.display()))
                }),
            )
        }
        NativeStep::TrimSummary { untrimmed, trimmed, report } => {
            let untrimmed = stage.input_path(untrimmed)?.to_path_buf();
            let trimmed = stage.input_path(trimmed)?.to_path_buf();
            let report = stage.output_path(report)?.to_path_buf();
            let sample_id = stage.sample_id.clone();
            (
                "trim_summary",
                Box::new(move || write_trim_summary(&sample_id, &untrimmed, &trimmed, &report)),
            )
        }
    };

    let _ = writeln!(log, "$ [builtin] {}", label);
    let outcome = tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| PipelineError::Other(anyhow!("{} task panicked: {}", label, e)))?;

    match outcome {
        Ok(message) => {
            let _ = writeln!(log, "{}", message);
            Ok(())
        }
        Err(e) => Err(PipelineError::ToolInvocation {
            stage: stage.name().to_string(),
            tool: label.to_string(),
            attempt,
            status: e.to_string(),
        }),
    }
}

/// Writes the one-row read count table for a trimmed sample.
fn write_trim_summary(sample_id: &str, untrimmed: &Path, trimmed: &Path, report: &Path) -> anyhow::Result<String> {
    let untrimmed_reads = count_fastq_records(untrimmed)?;
    let trimmed_reads = count_fastq_records(trimmed)?;
    let percent = percent_trimmed(untrimmed_reads, trimmed_reads);
    std::fs::write(
        report,
        format!(
            "sample_id\tuntrimmed_reads\ttrimmed_reads\tpercent_trimmed\n{}\t{}\t{}\t{}\n",
            sample_id, untrimmed_reads, trimmed_reads, percent
        ),
    )?;
    Ok(format!("{}: {} -> {} reads ({}% trimmed)", sample_id, untrimmed_reads, trimmed_reads, percent))
}


#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::defs::{ReadMode, RetryPolicy};
    use crate::pipelines::discovery::Sample;
    use crate::pipelines::graph::{BranchRole, CommandArg, InputSource, StageSpec, TaskGraph};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy { max_attempts, backoff: Duration::ZERO, timeout: None }
    }

    fn shell(script: &str, extra: Vec<CommandArg>) -> Vec<CommandArg> {
        let mut args = vec![CommandArg::Lit("-c".to_string()), CommandArg::Lit(script.to_string())];
        args.extend(extra);
        args
    }

    fn bind(tmp: &TempDir, stages: Vec<StageSpec>, index: usize) -> anyhow::Result<BoundStage> {
        let raw = tmp.path().join("s1.fastq.gz");
        let graph = TaskGraph::from_stages(ReadMode::SingleEnd, tmp.path().join("work"), stages)?;
        let sample = Arc::new(Sample {
            sample_id: "s1".to_string(),
            read_mode: ReadMode::SingleEnd,
            raw_files: vec![raw],
        });
        let mut plan = graph.plan_for(&sample)?;
        Ok(plan.stages.remove(index))
    }

    fn write_fastq_gz(path: &Path, reads: usize) -> anyhow::Result<()> {
        let mut encoder = GzEncoder::new(std::fs::File::create(path)?, Compression::default());
        for i in 0..reads {
            writeln!(encoder, "@read{}\nACGT\n+\nIIII", i)?;
        }
        encoder.finish()?;
        Ok(())
    }

    #[tokio::test]
    async fn test_success_first_attempt() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let spec = StageSpec::new("echo", BranchRole::Main, &policy(3))
            .output("out", "{sample_id}.txt")
            .tool("sh", "sh", shell("echo hello-log; echo data > \"$0\"", vec![CommandArg::Output("out")]));
        let stage = bind(&tmp, vec![spec], 0)?;

        let task = StageExecutor::new().execute(&stage).await;
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.attempt_count, 1);
        assert!(task.error.is_none());
        assert_eq!(task.resolved_output_paths, vec![tmp.path().join("work/s1/echo/s1.txt")]);

        let log = std::fs::read_to_string(task.last_log().ok_or_else(|| anyhow!("no log"))?)?;
        assert!(log.contains("hello-log"));
        assert!(task.attempt_logs[0].ends_with("s1_echo.attempt1.log"));
        Ok(())
    }

    #[tokio::test]
    async fn test_always_failing_task_exhausts_retries() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let spec = StageSpec::new("broken", BranchRole::Main, &policy(3))
            .output("out", "{sample_id}.txt")
            .tool("sh", "sh", shell("echo boom >&2; exit 3", vec![CommandArg::Output("out")]));
        let stage = bind(&tmp, vec![spec], 0)?;

        let task = StageExecutor::new().execute(&stage).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt_count, 3);
        assert_eq!(task.attempt_logs.len(), 3);
        match &task.error {
            Some(PipelineError::RetriesExhausted { attempts, last, .. }) => {
                assert_eq!(*attempts, 3);
                assert!(matches!(**last, PipelineError::ToolInvocation { attempt: 3, ref status, .. } if status.contains("boom")));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_success_on_second_attempt() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let marker = tmp.path().join("first-attempt-done");
        let script = "if [ -f \"$1\" ]; then echo ok > \"$0\"; else touch \"$1\"; exit 1; fi";
        let spec = StageSpec::new("flaky", BranchRole::Main, &policy(3))
            .output("out", "{sample_id}.txt")
            .tool(
                "sh",
                "sh",
                shell(script, vec![CommandArg::Output("out"), CommandArg::Lit(marker.display().to_string())]),
            );
        let stage = bind(&tmp, vec![spec], 0)?;

        let task = StageExecutor::new().execute(&stage).await;
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.attempt_count, 2);
        assert_eq!(task.attempt_logs.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_output_is_retried_then_fails() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let spec = StageSpec::new("empty", BranchRole::Main, &policy(2))
            .output("out", "{sample_id}.txt")
            .tool("sh", "sh", shell(": > \"$0\"", vec![CommandArg::Output("out")]));
        let stage = bind(&tmp, vec![spec], 0)?;

        let task = StageExecutor::new().execute(&stage).await;
        assert_eq!(task.attempt_count, 2);
        assert!(matches!(
            task.error,
            Some(PipelineError::RetriesExhausted { ref last, .. }) if matches!(**last, PipelineError::ToolOutput { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_upstream_input_fails_without_running() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let first = StageSpec::new("first", BranchRole::Main, &policy(3)).output("out", "{sample_id}.a");
        let second = StageSpec::new("second", BranchRole::Main, &policy(3))
            .input("in", InputSource::Upstream { stage: "first", slot: "out" })
            .output("out", "{sample_id}.b")
            .tool("sh", "sh", shell("cp \"$0\" \"$1\"", vec![CommandArg::Input("in"), CommandArg::Output("out")]));
        let stage = bind(&tmp, vec![first, second], 1)?;

        let task = StageExecutor::new().execute(&stage).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt_count, 0);
        assert!(matches!(task.error, Some(PipelineError::MissingInput { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_reference_is_fatal() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let reference = tmp.path().join("gone.fasta");
        let spec = StageSpec::new("needs_ref", BranchRole::Main, &policy(3))
            .input("ref", InputSource::Static { path: reference.clone(), files: vec![reference] })
            .output("out", "{sample_id}.txt")
            .tool("sh", "sh", shell("echo x > \"$0\"", vec![CommandArg::Output("out")]));
        let stage = bind(&tmp, vec![spec], 0)?;

        let task = StageExecutor::new().execute(&stage).await;
        assert!(task.error.as_ref().is_some_and(PipelineError::is_fatal));
        Ok(())
    }

    #[tokio::test]
    async fn test_timeout_counts_as_invocation_failure() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let retry = RetryPolicy { max_attempts: 1, backoff: Duration::ZERO, timeout: Some(Duration::from_millis(100)) };
        let spec = StageSpec::new("slow", BranchRole::Main, &retry)
            .output("out", "{sample_id}.txt")
            .tool("sh", "sh", shell("sleep 5; echo x > \"$0\"", vec![CommandArg::Output("out")]));
        let stage = bind(&tmp, vec![spec], 0)?;

        let task = StageExecutor::new().execute(&stage).await;
        assert!(matches!(
            task.error,
            Some(PipelineError::RetriesExhausted { ref last, .. })
                if matches!(**last, PipelineError::ToolInvocation { ref status, .. } if status.contains("timed out"))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_stdout_captured_into_slot() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let spec = StageSpec::new("stats", BranchRole::Main, &policy(1))
            .output("report", "{sample_id}.stats.txt")
            .tool_to_stdout("sh", "sh", shell("echo mapped 42", vec![]), "report");
        let stage = bind(&tmp, vec![spec], 0)?;

        let task = StageExecutor::new().execute(&stage).await;
        assert!(task.succeeded());
        assert_eq!(std::fs::read_to_string(&task.resolved_output_paths[0])?, "mapped 42\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_trim_summary_step() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        write_fastq_gz(&tmp.path().join("s1.fastq.gz"), 4)?;
        let trimmed = tmp.path().join("s1_trimmed.fastq.gz");
        write_fastq_gz(&trimmed, 1)?;

        let spec = StageSpec::new("trim_summary", BranchRole::SideReport, &policy(1))
            .input("untrimmed", InputSource::Raw(0))
            .input("trimmed", InputSource::Static { path: trimmed.clone(), files: vec![trimmed] })
            .output("summary", "{sample_id}_trim_summary.tsv")
            .native(NativeStep::TrimSummary { untrimmed: "untrimmed", trimmed: "trimmed", report: "summary" });
        let stage = bind(&tmp, vec![spec], 0)?;

        let task = StageExecutor::new().execute(&stage).await;
        assert!(task.succeeded(), "{}", task.diagnostics());
        let summary = std::fs::read_to_string(&task.resolved_output_paths[0])?;
        assert_eq!(
            summary,
            "sample_id\tuntrimmed_reads\ttrimmed_reads\tpercent_trimmed\ns1\t4\t1\t75\n"
        );
        Ok(())
    }

    #[test]
    fn test_status_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_advance_to(Running));
        assert!(Running.can_advance_to(Retrying));
        assert!(Retrying.can_advance_to(Running));
        assert!(!Succeeded.can_advance_to(Running));
        assert!(!Failed.can_advance_to(Retrying));
        assert!(Succeeded.is_terminal() && Failed.is_terminal());
        assert!(!Retrying.is_terminal());
    }
}
