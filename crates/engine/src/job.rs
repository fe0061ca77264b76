//! Jobs: an ordered list of steps plus validation, listeners and restart rules.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{error, info, warn};

use batchline_core::{
    BatchStatus, ExitStatus, JobExecution, JobParameters, JobParametersBuilder, JobParametersValidator,
    ValidationResult,
};
use batchline_infra::JobRepository;

use crate::error::LaunchError;
use crate::listener::{JobExecutionListener, JobListeners};
use crate::step::{Step, StepExecutor};

/// Derives the parameters of the next job instance from the previous one.
pub trait JobParametersIncrementer: Send + Sync {
    fn next(&self, previous: Option<&JobParameters>) -> JobParameters;
}

/// Increments a long parameter, `run.id` by default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunIdIncrementer {
    key: String,
}

impl RunIdIncrementer {
    pub const DEFAULT_KEY: &'static str = "run.id";

    pub fn with_key(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Default for RunIdIncrementer {
    fn default() -> Self {
        Self::with_key(Self::DEFAULT_KEY)
    }
}

impl JobParametersIncrementer for RunIdIncrementer {
    fn next(&self, previous: Option<&JobParameters>) -> JobParameters {
        let builder = previous.map(JobParametersBuilder::from_parameters).unwrap_or_default();
        let id = previous.and_then(|p| p.get_long(&self.key)).unwrap_or(0) + 1;
        builder.add_long(self.key.clone(), id).build()
    }
}

/// A job definition. Cheap to share; holds no run state.
pub struct Job {
    name: String,
    steps: Vec<Arc<dyn Step>>,
    validator: Option<Arc<dyn JobParametersValidator>>,
    listeners: JobListeners,
    restartable: bool,
    incrementer: Option<Arc<dyn JobParametersIncrementer>>,
}

impl Job {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> impl Iterator<Item = &dyn Step> {
        self.steps.iter().map(|step| step.as_ref())
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps().map(|step| step.name()).collect()
    }

    pub fn is_restartable(&self) -> bool {
        self.restartable
    }

    pub fn incrementer(&self) -> Option<&dyn JobParametersIncrementer> {
        self.incrementer.as_deref()
    }

    pub fn listeners(&self) -> &JobListeners {
        &self.listeners
    }

    /// Run the configured validator; jobs without one accept anything.
    pub fn validate(&self, parameters: &JobParameters) -> ValidationResult {
        match &self.validator {
            Some(validator) => validator.validate(parameters),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("steps", &self.step_names())
            .field("restartable", &self.restartable)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobBuildError {
    #[error("job '{0}' has no steps")]
    NoSteps(String),
    #[error("job '{job}' declares step '{step}' more than once")]
    DuplicateStep { job: String, step: String },
}

pub struct JobBuilder {
    name: String,
    steps: Vec<Arc<dyn Step>>,
    validator: Option<Arc<dyn JobParametersValidator>>,
    listeners: JobListeners,
    restartable: bool,
    incrementer: Option<Arc<dyn JobParametersIncrementer>>,
}

impl JobBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            validator: None,
            listeners: JobListeners::default(),
            restartable: true,
            incrementer: None,
        }
    }

    /// First step. Same as [`JobBuilder::next`]; reads better at the head of a chain.
    pub fn start(self, step: impl Step + 'static) -> Self {
        self.next(step)
    }

    pub fn next(self, step: impl Step + 'static) -> Self {
        self.next_shared(Arc::new(step))
    }

    /// Add a step that is also used by other jobs.
    pub fn next_shared(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn validator(mut self, validator: impl JobParametersValidator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn listener(mut self, listener: Arc<dyn JobExecutionListener>) -> Self {
        self.listeners.register(listener);
        self
    }

    /// Refuse to run an instance again after a failed or stopped execution.
    pub fn prevent_restart(mut self) -> Self {
        self.restartable = false;
        self
    }

    pub fn incrementer(mut self, incrementer: impl JobParametersIncrementer + 'static) -> Self {
        self.incrementer = Some(Arc::new(incrementer));
        self
    }

    pub fn build(self) -> Result<Job, JobBuildError> {
        if self.steps.is_empty() {
            return Err(JobBuildError::NoSteps(self.name));
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name().to_string()) {
                return Err(JobBuildError::DuplicateStep {
                    job: self.name,
                    step: step.name().to_string(),
                });
            }
        }
        Ok(Job {
            name: self.name,
            steps: self.steps,
            validator: self.validator,
            listeners: self.listeners,
            restartable: self.restartable,
            incrementer: self.incrementer,
        })
    }
}

/// Runs the steps of a job for one job execution.
pub struct JobExecutor<'r> {
    repository: &'r dyn JobRepository,
    rerun_completed: bool,
}

impl<'r> JobExecutor<'r> {
    pub fn new(repository: &'r dyn JobRepository) -> Self {
        Self {
            repository,
            rerun_completed: false,
        }
    }

    /// Re-run steps that already completed for this instance.
    pub fn with_rerun_completed(mut self, rerun: bool) -> Self {
        self.rerun_completed = rerun;
        self
    }

    /// Run `job` to a terminal status, recording progress in the repository.
    ///
    /// Step failures end the execution `Failed` and return `Ok`; `Err` is
    /// returned when a before-job listener fails or the repository refuses
    /// an update.
    pub fn execute(&self, job: &Job, execution: &mut JobExecution) -> Result<(), LaunchError> {
        execution.mark_started();
        self.repository.update_job_execution(execution)?;
        info!(
            job = %job.name(),
            job_execution_id = %execution.id,
            job_key = %execution.instance.job_key.as_str(),
            "job started"
        );

        if let Err(error) = job.listeners.before_job(execution) {
            error!(job = %job.name(), error = %format!("{error:#}"), "before_job listener failed");
            let cause: &(dyn std::error::Error + 'static) = error.as_ref();
            execution.mark_failed(cause);
            job.listeners.after_job(execution);
            self.repository.update_job_execution(execution)?;
            return Err(LaunchError::ListenerFailed {
                execution: Box::new(execution.clone()),
                source: error,
            });
        }

        let (status, exit_status) = self.run_steps(job, execution)?;
        if let Some(exit_status) = exit_status {
            execution.exit_status = exit_status;
        }
        execution.mark_finished(status);

        job.listeners.after_job(execution);
        self.repository.update_job_execution(execution)?;

        info!(
            job = %job.name(),
            job_execution_id = %execution.id,
            status = %execution.status,
            exit_code = execution.exit_status.exit_code(),
            steps = execution.step_executions.len(),
            duration_ms = execution.duration_ms().unwrap_or_default(),
            "job finished"
        );
        Ok(())
    }

    /// Returns the job status and the exit status of the last step that ran.
    fn run_steps(
        &self,
        job: &Job,
        execution: &mut JobExecution,
    ) -> Result<(BatchStatus, Option<ExitStatus>), LaunchError> {
        let executor = StepExecutor::new(self.repository).with_rerun_completed(self.rerun_completed);
        let mut exit_status = None;

        for step in job.steps() {
            if self.repository.job_execution_status(execution.id)? == Some(BatchStatus::Stopping) {
                info!(job = %job.name(), next_step = step.name(), "stop requested; not starting further steps");
                return Ok((BatchStatus::Stopped, Some(ExitStatus::stopped())));
            }

            let step_execution = match executor.execute(step, execution) {
                Ok(Some(step_execution)) => step_execution,
                Ok(None) => continue,
                Err(step_error) => {
                    error!(job = %job.name(), step = step.name(), error = %step_error, "step could not run");
                    execution.add_failure(step_error.to_string());
                    self.repository.update_job_execution(execution)?;
                    return Ok((BatchStatus::Failed, Some(ExitStatus::failed().with_error(&step_error))));
                }
            };

            self.repository.update_job_execution(execution)?;
            exit_status = Some(step_execution.exit_status.clone());

            if step_execution.status != BatchStatus::Completed {
                if step_execution.status == BatchStatus::Failed {
                    execution.failures.extend(step_execution.failures.iter().cloned());
                } else {
                    warn!(job = %job.name(), step = step.name(), status = %step_execution.status, "step did not complete");
                }
                return Ok((step_execution.status, exit_status));
            }
        }

        Ok((BatchStatus::Completed, exit_status))
    }
}
