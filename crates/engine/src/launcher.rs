//! Launching, restarting and stopping jobs.

use chrono::Utc;
use tracing::{info, warn};

use batchline_core::{BatchStatus, JobExecution, JobExecutionId, JobParameters, JobParametersBuilder};
use batchline_infra::{JobRepository, LaunchRules, RepositoryError};

use crate::config::{CompletedInstancePolicy, LauncherConfig};
use crate::error::LaunchError;
use crate::job::{Job, JobExecutor};

/// Runs jobs synchronously against a repository.
#[derive(Debug, Clone)]
pub struct JobLauncher<R> {
    repository: R,
    config: LauncherConfig,
}

impl<R: JobRepository> JobLauncher<R> {
    pub fn new(repository: R) -> Self {
        Self {
            repository,
            config: LauncherConfig::default(),
        }
    }

    pub fn with_config(mut self, config: LauncherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Run `job` with `parameters` and return the finished execution.
    ///
    /// Parameters are validated before anything is recorded. If the instance
    /// already exists its last execution decides what happens: a running one
    /// is refused, a failed or stopped one is restarted, a completed one is
    /// handled by [`CompletedInstancePolicy`].
    pub fn run(&self, job: &Job, parameters: JobParameters) -> Result<JobExecution, LaunchError> {
        if let Err(error) = job.validate(&parameters) {
            warn!(job = %job.name(), error = %error, "job parameters rejected");
            return Err(error.into());
        }

        let mut rerun_completed = false;
        if let Some(last) = self.repository.get_last_job_execution(job.name(), &parameters)? {
            if last.is_running() {
                return Err(LaunchError::AlreadyRunning {
                    job_name: job.name().to_string(),
                    execution_id: last.id,
                });
            }
            match last.status {
                BatchStatus::Completed => match self.config.completed_policy {
                    CompletedInstancePolicy::Reject => {
                        return Err(LaunchError::AlreadyComplete {
                            job_name: job.name().to_string(),
                            execution_id: last.id,
                        });
                    }
                    CompletedInstancePolicy::Noop => {
                        info!(job = %job.name(), job_execution_id = %last.id, "instance already completed; nothing to do");
                        return Ok(last);
                    }
                    CompletedInstancePolicy::Rerun => rerun_completed = true,
                },
                status if !status.is_restartable() => {
                    return Err(LaunchError::RestartRefused {
                        job_name: job.name().to_string(),
                        reason: format!("last execution {} is {status}", last.id),
                    });
                }
                _ if !job.is_restartable() => {
                    return Err(LaunchError::RestartRefused {
                        job_name: job.name().to_string(),
                        reason: "job does not allow restarts".to_string(),
                    });
                }
                status => {
                    info!(job = %job.name(), previous_execution = %last.id, previous_status = %status, "restarting job instance");
                }
            }
        }

        // Re-checked by the repository under its write lock.
        let rules = LaunchRules::new()
            .with_rerun_completed(rerun_completed)
            .with_restartable(job.is_restartable());
        let mut execution = match self.repository.create_job_execution(job.name(), &parameters, rules) {
            Ok(execution) => execution,
            Err(RepositoryError::AlreadyComplete { execution_id, .. })
                if self.config.completed_policy == CompletedInstancePolicy::Noop =>
            {
                info!(job = %job.name(), job_execution_id = %execution_id, "instance completed concurrently; nothing to do");
                return self
                    .repository
                    .get_job_execution(execution_id)?
                    .ok_or(LaunchError::NoSuchExecution(execution_id));
            }
            Err(error) => return Err(LaunchError::from_repository(error)),
        };

        JobExecutor::new(&self.repository)
            .with_rerun_completed(rerun_completed)
            .execute(job, &mut execution)?;
        Ok(execution)
    }

    /// Run a new instance with parameters derived from the job's most recent
    /// instance by its incrementer. Entries in `overrides` win.
    pub fn run_next_instance(&self, job: &Job, overrides: JobParameters) -> Result<JobExecution, LaunchError> {
        let incrementer = job
            .incrementer()
            .ok_or_else(|| LaunchError::NoIncrementer(job.name().to_string()))?;

        let previous = match self.repository.find_job_instances(job.name())?.last() {
            Some(instance) => self
                .repository
                .find_job_executions(instance.id)?
                .pop()
                .map(|execution| execution.parameters().clone()),
            None => None,
        };

        let mut builder = JobParametersBuilder::from_parameters(&incrementer.next(previous.as_ref()));
        for (name, parameter) in overrides.iter() {
            builder = builder.add(name, parameter.clone());
        }
        self.run(job, builder.build())
    }

    /// Run the instance of a failed or stopped execution again.
    pub fn restart(&self, job: &Job, execution_id: JobExecutionId) -> Result<JobExecution, LaunchError> {
        let previous = self
            .repository
            .get_job_execution(execution_id)?
            .ok_or(LaunchError::NoSuchExecution(execution_id))?;

        if previous.job_name() != job.name() {
            return Err(LaunchError::RestartRefused {
                job_name: job.name().to_string(),
                reason: format!("execution {execution_id} belongs to job '{}'", previous.job_name()),
            });
        }
        if previous.status == BatchStatus::Completed {
            return Err(LaunchError::AlreadyComplete {
                job_name: job.name().to_string(),
                execution_id,
            });
        }
        if !previous.status.is_restartable() {
            return Err(LaunchError::InvalidState {
                id: execution_id,
                status: previous.status,
            });
        }

        self.run(job, previous.parameters().clone())
    }

    /// Ask a running execution to stop at its next chunk boundary.
    pub fn stop(&self, execution_id: JobExecutionId) -> Result<JobExecution, LaunchError> {
        let execution = self
            .repository
            .request_stop(execution_id)
            .map_err(LaunchError::from_repository)?;
        info!(job = %execution.job_name(), job_execution_id = %execution_id, "stop requested");
        Ok(execution)
    }

    /// Mark a finished or stopping execution `Abandoned` so its instance is never restarted.
    pub fn abandon(&self, execution_id: JobExecutionId) -> Result<JobExecution, LaunchError> {
        let mut execution = self
            .repository
            .get_job_execution(execution_id)?
            .ok_or(LaunchError::NoSuchExecution(execution_id))?;

        if matches!(execution.status, BatchStatus::Starting | BatchStatus::Started) {
            return Err(LaunchError::InvalidState {
                id: execution_id,
                status: execution.status,
            });
        }

        let now = Utc::now();
        execution.status = BatchStatus::Abandoned;
        execution.ended_at.get_or_insert(now);
        execution.last_updated = now;
        self.repository.update_job_execution(&execution)?;
        info!(job = %execution.job_name(), job_execution_id = %execution_id, "execution abandoned");
        Ok(execution)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use batchline_core::{JobInstance, JobInstanceId, StepExecution};
    use batchline_infra::InMemoryJobRepository;

    use super::*;
    use crate::job::JobBuilder;
    use crate::step::StepBuilder;
    use crate::tasklet::RepeatStatus;

    fn job() -> Job {
        JobBuilder::new("job")
            .start(StepBuilder::new("only").tasklet_fn(|_, _| Ok(RepeatStatus::Finished)))
            .build()
            .unwrap()
    }

    #[test]
    fn unknown_execution_is_reported() {
        let launcher = JobLauncher::new(InMemoryJobRepository::new());
        let id = JobExecutionId::new();
        assert!(matches!(launcher.stop(id), Err(LaunchError::NoSuchExecution(found)) if found == id));
        assert!(matches!(launcher.abandon(id), Err(LaunchError::NoSuchExecution(_))));
        assert!(matches!(launcher.restart(&job(), id), Err(LaunchError::NoSuchExecution(_))));
    }

    #[test]
    fn stopping_a_finished_execution_is_refused() {
        let launcher = JobLauncher::new(InMemoryJobRepository::new());
        let execution = launcher.run(&job(), JobParameters::new()).unwrap();
        assert_eq!(execution.status, BatchStatus::Completed);

        let refused = launcher.stop(execution.id);
        assert!(matches!(
            refused,
            Err(LaunchError::InvalidState { status: BatchStatus::Completed, .. })
        ));
    }

    #[test]
    fn abandoned_instance_is_never_restarted() {
        let failing = JobBuilder::new("job")
            .start(StepBuilder::new("only").tasklet_fn(|_, _| anyhow::bail!("boom")))
            .build()
            .unwrap();
        let launcher = JobLauncher::new(InMemoryJobRepository::new());
        let failed = launcher.run(&failing, JobParameters::new()).unwrap();
        assert_eq!(failed.status, BatchStatus::Failed);

        let abandoned = launcher.abandon(failed.id).unwrap();
        assert_eq!(abandoned.status, BatchStatus::Abandoned);

        assert!(matches!(
            launcher.run(&failing, JobParameters::new()),
            Err(LaunchError::RestartRefused { .. })
        ));
        assert!(matches!(
            launcher.restart(&failing, failed.id),
            Err(LaunchError::InvalidState { status: BatchStatus::Abandoned, .. })
        ));
    }

    #[test]
    fn run_next_instance_requires_an_incrementer() {
        let launcher = JobLauncher::new(InMemoryJobRepository::new());
        assert!(matches!(
            launcher.run_next_instance(&job(), JobParameters::new()),
            Err(LaunchError::NoIncrementer(name)) if name == "job"
        ));
    }

    type Interleave = Box<dyn FnOnce() + Send>;

    /// Runs `interleave` once, right after the launcher has read the instance's
    /// last execution and before it records a new one.
    struct InterleavingRepository {
        inner: Arc<InMemoryJobRepository>,
        interleave: Mutex<Option<Interleave>>,
    }

    impl JobRepository for InterleavingRepository {
        fn get_job_instance(
            &self,
            job_name: &str,
            parameters: &JobParameters,
        ) -> Result<Option<JobInstance>, RepositoryError> {
            self.inner.get_job_instance(job_name, parameters)
        }

        fn find_job_instances(&self, job_name: &str) -> Result<Vec<JobInstance>, RepositoryError> {
            self.inner.find_job_instances(job_name)
        }

        fn create_job_execution(
            &self,
            job_name: &str,
            parameters: &JobParameters,
            rules: LaunchRules,
        ) -> Result<JobExecution, RepositoryError> {
            self.inner.create_job_execution(job_name, parameters, rules)
        }

        fn update_job_execution(&self, execution: &JobExecution) -> Result<(), RepositoryError> {
            self.inner.update_job_execution(execution)
        }

        fn get_job_execution(&self, id: JobExecutionId) -> Result<Option<JobExecution>, RepositoryError> {
            self.inner.get_job_execution(id)
        }

        fn get_last_job_execution(
            &self,
            job_name: &str,
            parameters: &JobParameters,
        ) -> Result<Option<JobExecution>, RepositoryError> {
            let last = self.inner.get_last_job_execution(job_name, parameters)?;
            let interleave = self.interleave.lock().unwrap().take();
            if let Some(interleave) = interleave {
                interleave();
            }
            Ok(last)
        }

        fn find_job_executions(&self, instance_id: JobInstanceId) -> Result<Vec<JobExecution>, RepositoryError> {
            self.inner.find_job_executions(instance_id)
        }

        fn job_execution_status(&self, id: JobExecutionId) -> Result<Option<BatchStatus>, RepositoryError> {
            self.inner.job_execution_status(id)
        }

        fn request_stop(&self, id: JobExecutionId) -> Result<JobExecution, RepositoryError> {
            self.inner.request_stop(id)
        }

        fn add_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
            self.inner.add_step_execution(step)
        }

        fn update_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
            self.inner.update_step_execution(step)
        }

        fn get_last_step_execution(
            &self,
            instance_id: JobInstanceId,
            step_name: &str,
        ) -> Result<Option<StepExecution>, RepositoryError> {
            self.inner.get_last_step_execution(instance_id, step_name)
        }

        fn step_execution_count(&self, instance_id: JobInstanceId, step_name: &str) -> Result<usize, RepositoryError> {
            self.inner.step_execution_count(instance_id, step_name)
        }
    }

    fn counting_job(runs: &Arc<AtomicUsize>) -> Arc<Job> {
        let runs = Arc::clone(runs);
        let job = JobBuilder::new("job")
            .start(StepBuilder::new("only").tasklet_fn(move |_, _| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(RepeatStatus::Finished)
            }))
            .build()
            .unwrap();
        Arc::new(job)
    }

    fn racing_launcher(job: &Arc<Job>, parameters: &JobParameters) -> JobLauncher<InterleavingRepository> {
        let inner = InMemoryJobRepository::arc();
        let concurrent = JobLauncher::new(Arc::clone(&inner));
        let (job, parameters) = (Arc::clone(job), parameters.clone());
        let interleave: Interleave = Box::new(move || {
            let finished = concurrent.run(&job, parameters).unwrap();
            assert_eq!(finished.status, BatchStatus::Completed);
        });
        JobLauncher::new(InterleavingRepository {
            inner,
            interleave: Mutex::new(Some(interleave)),
        })
    }

    #[test]
    fn instance_completed_by_a_concurrent_launch_is_not_run_again() {
        let runs = Arc::new(AtomicUsize::new(0));
        let job = counting_job(&runs);
        let parameters = JobParameters::builder().add_long("a", 1).build();
        let launcher = racing_launcher(&job, &parameters);

        let refused = launcher.run(&job, parameters.clone());

        assert!(matches!(refused, Err(LaunchError::AlreadyComplete { .. })));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let instance = launcher
            .repository()
            .get_job_instance("job", &parameters)
            .unwrap()
            .unwrap();
        assert_eq!(launcher.repository().find_job_executions(instance.id).unwrap().len(), 1);
    }

    #[test]
    fn noop_policy_returns_the_concurrently_completed_execution() {
        let runs = Arc::new(AtomicUsize::new(0));
        let job = counting_job(&runs);
        let parameters = JobParameters::new();
        let launcher = racing_launcher(&job, &parameters)
            .with_config(LauncherConfig::default().with_completed_policy(CompletedInstancePolicy::Noop));

        let execution = launcher.run(&job, parameters.clone()).unwrap();

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            launcher.repository().find_job_executions(execution.instance.id).unwrap().len(),
            1
        );
    }
}
