//! Metadata repository: job instances, job executions and step executions.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tracing::debug;

use batchline_core::{
    BatchStatus, JobExecution, JobExecutionId, JobInstance, JobInstanceId, JobKey, JobParameters,
    StepExecution, StepExecutionId,
};

/// Job repository abstraction.
///
/// Every write replaces one whole record, so concurrent runs never observe a
/// half-written execution.
pub trait JobRepository: Send + Sync {
    /// Look up the instance for a job name and the identifying part of `parameters`.
    fn get_job_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobInstance>, RepositoryError>;

    /// All instances of a job, oldest first.
    fn find_job_instances(&self, job_name: &str) -> Result<Vec<JobInstance>, RepositoryError>;

    /// Create a new execution, creating the instance on first run.
    ///
    /// The instance's last execution is checked against `rules` in the same
    /// write that records the new one: a running execution is refused, a
    /// completed one only reruns when `rules` allow it, and an abandoned one
    /// (or any prior execution of a non-restartable job) is refused. A restart
    /// (last execution failed or stopped) starts from the previous job context.
    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
        rules: LaunchRules,
    ) -> Result<JobExecution, RepositoryError>;

    /// Replace the stored execution. Step executions are stored separately.
    fn update_job_execution(&self, execution: &JobExecution) -> Result<(), RepositoryError>;

    /// Get an execution with its step executions.
    fn get_job_execution(&self, id: JobExecutionId) -> Result<Option<JobExecution>, RepositoryError>;

    /// Latest execution of the instance for (job name, parameters).
    fn get_last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobExecution>, RepositoryError>;

    /// Executions of one instance, oldest first.
    fn find_job_executions(&self, instance_id: JobInstanceId) -> Result<Vec<JobExecution>, RepositoryError>;

    /// Current status of an execution, without loading its steps.
    fn job_execution_status(&self, id: JobExecutionId) -> Result<Option<BatchStatus>, RepositoryError>;

    /// Flag a running execution as `Stopping`.
    fn request_stop(&self, id: JobExecutionId) -> Result<JobExecution, RepositoryError>;

    /// Register a new step execution under its job execution.
    fn add_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError>;

    /// Replace a step execution (counters + context). Used as the chunk checkpoint.
    fn update_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError>;

    /// Latest execution of `step_name` across every execution of the instance.
    fn get_last_step_execution(
        &self,
        instance_id: JobInstanceId,
        step_name: &str,
    ) -> Result<Option<StepExecution>, RepositoryError>;

    /// How many times `step_name` was started for the instance.
    fn step_execution_count(&self, instance_id: JobInstanceId, step_name: &str) -> Result<usize, RepositoryError>;
}

/// What [`JobRepository::create_job_execution`] accepts as the instance's last execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchRules {
    /// Start a new execution even though the instance already completed.
    pub rerun_completed: bool,
    /// Whether a failed or stopped instance may get another execution.
    pub restartable: bool,
}

impl Default for LaunchRules {
    fn default() -> Self {
        Self {
            rerun_completed: false,
            restartable: true,
        }
    }
}

impl LaunchRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rerun_completed(mut self, rerun_completed: bool) -> Self {
        self.rerun_completed = rerun_completed;
        self
    }

    pub fn with_restartable(mut self, restartable: bool) -> Self {
        self.restartable = restartable;
        self
    }
}

/// Repository error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    #[error("job execution not found: {0}")]
    NotFound(JobExecutionId),
    #[error("step execution not found: {0}")]
    StepNotFound(StepExecutionId),
    #[error("job '{job_name}' already has a running execution: {execution_id}")]
    AlreadyRunning {
        job_name: String,
        execution_id: JobExecutionId,
    },
    #[error("job '{job_name}' already completed (execution {execution_id})")]
    AlreadyComplete {
        job_name: String,
        execution_id: JobExecutionId,
    },
    #[error("job '{job_name}' cannot be restarted: last execution {execution_id} is {status}")]
    NotRestartable {
        job_name: String,
        execution_id: JobExecutionId,
        status: BatchStatus,
    },
    #[error("job execution {id} is not running (status {status})")]
    NotRunning { id: JobExecutionId, status: BatchStatus },
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Default)]
struct Tables {
    instances: HashMap<JobInstanceId, JobInstance>,
    instance_order: Vec<JobInstanceId>,
    instance_keys: HashMap<(String, JobKey), JobInstanceId>,
    /// Stored without step executions; those are joined in on read.
    executions: HashMap<JobExecutionId, JobExecution>,
    executions_by_instance: HashMap<JobInstanceId, Vec<JobExecutionId>>,
    steps: HashMap<StepExecutionId, StepExecution>,
    steps_by_execution: HashMap<JobExecutionId, Vec<StepExecutionId>>,
}

impl Tables {
    fn instance_id(&self, job_name: &str, key: &JobKey) -> Option<JobInstanceId> {
        self.instance_keys
            .get(&(job_name.to_string(), key.clone()))
            .copied()
    }

    fn last_execution_id(&self, instance_id: JobInstanceId) -> Option<JobExecutionId> {
        self.executions_by_instance
            .get(&instance_id)
            .and_then(|ids| ids.last().copied())
    }

    fn assemble(&self, id: JobExecutionId) -> Option<JobExecution> {
        let mut execution = self.executions.get(&id)?.clone();
        execution.step_executions = self
            .steps_by_execution
            .get(&id)
            .map(|ids| ids.iter().filter_map(|s| self.steps.get(s).cloned()).collect())
            .unwrap_or_default();
        Some(execution)
    }
}

/// In-memory job repository for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    tables: RwLock<Tables>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, RepositoryError> {
        self.tables
            .read()
            .map_err(|_| RepositoryError::Storage("repository lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, RepositoryError> {
        self.tables
            .write()
            .map_err(|_| RepositoryError::Storage("repository lock poisoned".to_string()))
    }
}

impl JobRepository for InMemoryJobRepository {
    fn get_job_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobInstance>, RepositoryError> {
        let tables = self.read()?;
        Ok(tables
            .instance_id(job_name, &parameters.job_key())
            .and_then(|id| tables.instances.get(&id).cloned()))
    }

    fn find_job_instances(&self, job_name: &str) -> Result<Vec<JobInstance>, RepositoryError> {
        let tables = self.read()?;
        Ok(tables
            .instance_order
            .iter()
            .filter_map(|id| tables.instances.get(id))
            .filter(|i| i.job_name == job_name)
            .cloned()
            .collect())
    }

    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
        rules: LaunchRules,
    ) -> Result<JobExecution, RepositoryError> {
        let mut tables = self.write()?;
        let key = parameters.job_key();

        let instance = match tables.instance_id(job_name, &key) {
            Some(id) => tables
                .instances
                .get(&id)
                .cloned()
                .ok_or_else(|| RepositoryError::Storage(format!("dangling instance key {id}")))?,
            None => {
                let instance = JobInstance::new(job_name, parameters);
                tables.instances.insert(instance.id, instance.clone());
                tables.instance_order.push(instance.id);
                tables
                    .instance_keys
                    .insert((job_name.to_string(), key), instance.id);
                debug!(job = job_name, instance_id = %instance.id, "created job instance");
                instance
            }
        };

        let mut execution = JobExecution::new(instance.clone(), parameters.clone());
        if let Some(last) = tables
            .last_execution_id(instance.id)
            .and_then(|id| tables.executions.get(&id))
        {
            if last.is_running() {
                return Err(RepositoryError::AlreadyRunning {
                    job_name: job_name.to_string(),
                    execution_id: last.id,
                });
            }
            match last.status {
                BatchStatus::Completed if rules.rerun_completed => {}
                BatchStatus::Completed => {
                    return Err(RepositoryError::AlreadyComplete {
                        job_name: job_name.to_string(),
                        execution_id: last.id,
                    });
                }
                status if !status.is_restartable() || !rules.restartable => {
                    return Err(RepositoryError::NotRestartable {
                        job_name: job_name.to_string(),
                        execution_id: last.id,
                        status,
                    });
                }
                _ => {
                    execution.execution_context = last.execution_context.clone();
                    execution.execution_context.clear_dirty();
                }
            }
        }

        tables.executions.insert(execution.id, execution.clone());
        tables
            .executions_by_instance
            .entry(instance.id)
            .or_default()
            .push(execution.id);
        Ok(execution)
    }

    fn update_job_execution(&self, execution: &JobExecution) -> Result<(), RepositoryError> {
        let mut tables = self.write()?;
        let stored = tables
            .executions
            .get(&execution.id)
            .ok_or(RepositoryError::NotFound(execution.id))?;

        let mut record = execution.clone();
        record.step_executions.clear();
        // A stop request arriving mid-run must not be overwritten by the runner's copy.
        if stored.status == BatchStatus::Stopping && record.status == BatchStatus::Started {
            record.status = BatchStatus::Stopping;
        }
        record.last_updated = Utc::now();
        tables.executions.insert(record.id, record);
        Ok(())
    }

    fn get_job_execution(&self, id: JobExecutionId) -> Result<Option<JobExecution>, RepositoryError> {
        Ok(self.read()?.assemble(id))
    }

    fn get_last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobExecution>, RepositoryError> {
        let tables = self.read()?;
        Ok(tables
            .instance_id(job_name, &parameters.job_key())
            .and_then(|instance| tables.last_execution_id(instance))
            .and_then(|id| tables.assemble(id)))
    }

    fn find_job_executions(&self, instance_id: JobInstanceId) -> Result<Vec<JobExecution>, RepositoryError> {
        let tables = self.read()?;
        Ok(tables
            .executions_by_instance
            .get(&instance_id)
            .map(|ids| ids.iter().filter_map(|id| tables.assemble(*id)).collect())
            .unwrap_or_default())
    }

    fn job_execution_status(&self, id: JobExecutionId) -> Result<Option<BatchStatus>, RepositoryError> {
        Ok(self.read()?.executions.get(&id).map(|e| e.status))
    }

    fn request_stop(&self, id: JobExecutionId) -> Result<JobExecution, RepositoryError> {
        let mut tables = self.write()?;
        let execution = tables
            .executions
            .get_mut(&id)
            .ok_or(RepositoryError::NotFound(id))?;
        if !execution.is_running() {
            return Err(RepositoryError::NotRunning {
                id,
                status: execution.status,
            });
        }
        execution.status = BatchStatus::Stopping;
        execution.last_updated = Utc::now();
        tables.assemble(id).ok_or(RepositoryError::NotFound(id))
    }

    fn add_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let mut tables = self.write()?;
        if !tables.executions.contains_key(&step.job_execution_id) {
            return Err(RepositoryError::NotFound(step.job_execution_id));
        }
        tables.steps.insert(step.id, step.clone());
        tables
            .steps_by_execution
            .entry(step.job_execution_id)
            .or_default()
            .push(step.id);
        Ok(())
    }

    fn update_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let mut tables = self.write()?;
        if !tables.steps.contains_key(&step.id) {
            return Err(RepositoryError::StepNotFound(step.id));
        }
        let mut record = step.clone();
        record.last_updated = Utc::now();
        tables.steps.insert(record.id, record);
        Ok(())
    }

    fn get_last_step_execution(
        &self,
        instance_id: JobInstanceId,
        step_name: &str,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        let tables = self.read()?;
        let Some(executions) = tables.executions_by_instance.get(&instance_id) else {
            return Ok(None);
        };
        let last = executions
            .iter()
            .rev()
            .filter_map(|id| tables.steps_by_execution.get(id))
            .flat_map(|steps| steps.iter().rev())
            .filter_map(|id| tables.steps.get(id))
            .find(|s| s.step_name == step_name)
            .cloned();
        Ok(last)
    }

    fn step_execution_count(&self, instance_id: JobInstanceId, step_name: &str) -> Result<usize, RepositoryError> {
        let tables = self.read()?;
        Ok(tables
            .executions_by_instance
            .get(&instance_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.steps_by_execution.get(id))
            .flatten()
            .filter_map(|id| tables.steps.get(id))
            .filter(|s| s.step_name == step_name)
            .count())
    }
}

impl JobRepository for Arc<InMemoryJobRepository> {
    fn get_job_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobInstance>, RepositoryError> {
        (**self).get_job_instance(job_name, parameters)
    }

    fn find_job_instances(&self, job_name: &str) -> Result<Vec<JobInstance>, RepositoryError> {
        (**self).find_job_instances(job_name)
    }

    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
        rules: LaunchRules,
    ) -> Result<JobExecution, RepositoryError> {
        (**self).create_job_execution(job_name, parameters, rules)
    }

    fn update_job_execution(&self, execution: &JobExecution) -> Result<(), RepositoryError> {
        (**self).update_job_execution(execution)
    }

    fn get_job_execution(&self, id: JobExecutionId) -> Result<Option<JobExecution>, RepositoryError> {
        (**self).get_job_execution(id)
    }

    fn get_last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobExecution>, RepositoryError> {
        (**self).get_last_job_execution(job_name, parameters)
    }

    fn find_job_executions(&self, instance_id: JobInstanceId) -> Result<Vec<JobExecution>, RepositoryError> {
        (**self).find_job_executions(instance_id)
    }

    fn job_execution_status(&self, id: JobExecutionId) -> Result<Option<BatchStatus>, RepositoryError> {
        (**self).job_execution_status(id)
    }

    fn request_stop(&self, id: JobExecutionId) -> Result<JobExecution, RepositoryError> {
        (**self).request_stop(id)
    }

    fn add_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        (**self).add_step_execution(step)
    }

    fn update_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        (**self).update_step_execution(step)
    }

    fn get_last_step_execution(
        &self,
        instance_id: JobInstanceId,
        step_name: &str,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        (**self).get_last_step_execution(instance_id, step_name)
    }

    fn step_execution_count(&self, instance_id: JobInstanceId, step_name: &str) -> Result<usize, RepositoryError> {
        (**self).step_execution_count(instance_id, step_name)
    }
}
