//! Job instance, job execution and step execution records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::id::{JobExecutionId, JobInstanceId, StepExecutionId};
use crate::parameters::{JobKey, JobParameters};
use crate::status::{BatchStatus, ExitStatus};

/// A job name bound to one identifying parameter set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: JobInstanceId,
    pub job_name: String,
    pub job_key: JobKey,
}

impl JobInstance {
    pub fn new(job_name: impl Into<String>, parameters: &JobParameters) -> Self {
        Self {
            id: JobInstanceId::new(),
            job_name: job_name.into(),
            job_key: parameters.job_key(),
        }
    }
}

/// One attempt to run a job instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: JobExecutionId,
    pub instance: JobInstance,
    /// Captured at creation; never mutated afterwards.
    parameters: JobParameters,
    pub status: BatchStatus,
    pub exit_status: ExitStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    /// Job-scoped context, visible to every step of this run.
    pub execution_context: ExecutionContext,
    /// Step executions in the order they ran.
    pub step_executions: Vec<StepExecution>,
    /// Error messages collected during the run.
    pub failures: Vec<String>,
}

impl JobExecution {
    pub fn new(instance: JobInstance, parameters: JobParameters) -> Self {
        let now = Utc::now();
        Self {
            id: JobExecutionId::new(),
            instance,
            parameters,
            status: BatchStatus::Starting,
            exit_status: ExitStatus::unknown(),
            created_at: now,
            started_at: None,
            ended_at: None,
            last_updated: now,
            execution_context: ExecutionContext::new(),
            step_executions: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.instance.job_name
    }

    pub fn parameters(&self) -> &JobParameters {
        &self.parameters
    }

    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }

    pub fn is_stopping(&self) -> bool {
        self.status == BatchStatus::Stopping
    }

    pub fn step_execution(&self, step_name: &str) -> Option<&StepExecution> {
        self.step_executions.iter().rev().find(|s| s.step_name == step_name)
    }

    /// Mark the execution as running.
    pub fn mark_started(&mut self) {
        let now = Utc::now();
        self.status = BatchStatus::Started;
        self.exit_status = ExitStatus::executing();
        self.started_at = Some(now);
        self.last_updated = now;
    }

    /// Record a terminal status; the exit status is merged with the default for `status`.
    pub fn mark_finished(&mut self, status: BatchStatus) {
        let now = Utc::now();
        self.status = status;
        self.exit_status = settle(&self.exit_status, status);
        self.ended_at = Some(now);
        self.last_updated = now;
    }

    /// Mark as failed and record `error` in the failures and exit description.
    pub fn mark_failed(&mut self, error: &(dyn std::error::Error + 'static)) {
        self.failures.push(error.to_string());
        self.exit_status = self.exit_status.with_error(error);
        self.mark_finished(BatchStatus::Failed);
    }

    pub fn add_failure(&mut self, message: impl Into<String>) {
        self.failures.push(message.into());
        self.last_updated = Utc::now();
    }

    /// Elapsed run time in milliseconds, if the run has started.
    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let end = self.ended_at.unwrap_or_else(Utc::now);
        Some((end - started).num_milliseconds().max(0) as u64)
    }
}

/// One attempt to run one step within a job execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: StepExecutionId,
    pub job_execution_id: JobExecutionId,
    pub step_name: String,
    pub status: BatchStatus,
    pub exit_status: ExitStatus,
    pub read_count: u64,
    pub write_count: u64,
    pub filter_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
    pub read_skip_count: u64,
    pub process_skip_count: u64,
    pub write_skip_count: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    /// Step-scoped context; invisible to other steps.
    pub execution_context: ExecutionContext,
    pub failures: Vec<String>,
    /// Set when the step asks the job to stop after it finishes.
    pub terminate_only: bool,
}

impl StepExecution {
    pub fn new(step_name: impl Into<String>, job_execution_id: JobExecutionId) -> Self {
        let now = Utc::now();
        Self {
            id: StepExecutionId::new(),
            job_execution_id,
            step_name: step_name.into(),
            status: BatchStatus::Starting,
            exit_status: ExitStatus::executing(),
            read_count: 0,
            write_count: 0,
            filter_count: 0,
            commit_count: 0,
            rollback_count: 0,
            read_skip_count: 0,
            process_skip_count: 0,
            write_skip_count: 0,
            started_at: now,
            ended_at: None,
            last_updated: now,
            execution_context: ExecutionContext::new(),
            failures: Vec::new(),
            terminate_only: false,
        }
    }

    pub fn mark_started(&mut self) {
        self.status = BatchStatus::Started;
        self.last_updated = Utc::now();
    }

    /// Record a terminal status; the exit status is merged with the default for `status`.
    pub fn mark_finished(&mut self, status: BatchStatus) {
        let now = Utc::now();
        self.status = status;
        self.exit_status = settle(&self.exit_status, status);
        self.ended_at = Some(now);
        self.last_updated = now;
    }

    /// Mark as failed and record `error` in the failures and exit description.
    pub fn mark_failed(&mut self, error: &(dyn std::error::Error + 'static)) {
        self.failures.push(error.to_string());
        self.exit_status = self.exit_status.with_error(error);
        self.mark_finished(BatchStatus::Failed);
    }

    pub fn set_terminate_only(&mut self) {
        self.terminate_only = true;
    }

    pub fn duration_ms(&self) -> u64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }

    /// Summary line used in logs.
    pub fn summary(&self) -> String {
        format!(
            "{}: status={}, exit={}, read={}, write={}, filter={}, commit={}, rollback={}",
            self.step_name,
            self.status,
            self.exit_status.exit_code(),
            self.read_count,
            self.write_count,
            self.filter_count,
            self.commit_count,
            self.rollback_count
        )
    }
}

/// Final exit status for `status`, keeping a code set while running when it
/// outranks the default. A placeholder (EXECUTING/UNKNOWN) never survives.
fn settle(current: &ExitStatus, status: BatchStatus) -> ExitStatus {
    let default = ExitStatus::for_status(status);
    if current.is_running() {
        default.add_description(current.exit_description())
    } else {
        current.and(&default)
    }
}
