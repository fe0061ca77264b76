//! Steps, their builders, and the executor that wraps a step body with restart
//! lookup, listeners, promotion and persistence.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info};

use batchline_core::{BatchStatus, ExecutionContext, ExitStatus, JobExecution, JobParameters, StepExecution};
use batchline_infra::{JobRepository, ResourcelessTransactionManager, TransactionManager};

use crate::chunk::ChunkProcessor;
use crate::error::StepError;
use crate::item::{ItemProcessor, ItemReader, ItemWriter, PassThroughProcessor};
use crate::listener::{
    ChunkListener, ChunkListeners, ItemListeners, ItemProcessListener, ItemReadListener, ItemWriteListener,
    StepExecutionListener, StepListeners,
};
use crate::scope::{ChunkContext, StepScope};
use crate::tasklet::{RepeatStatus, StepContribution, Tasklet, run_tasklet};

/// A named unit of a job.
pub trait Step: Send + Sync {
    fn settings(&self) -> &StepSettings;

    fn name(&self) -> &str {
        self.settings().name()
    }

    /// The step body, run between the before- and after-step listeners.
    ///
    /// Returns `Completed` or `Stopped`; any error ends the step `Failed`.
    fn execute_body(&self, run: &mut StepRun<'_>) -> Result<BatchStatus, StepError>;
}

/// Configuration shared by every kind of step.
#[derive(Clone)]
pub struct StepSettings {
    name: String,
    start_limit: Option<usize>,
    allow_start_if_complete: bool,
    listeners: StepListeners,
    chunk_listeners: ChunkListeners,
    promotion: Option<PromotionPolicy>,
    transaction_manager: Arc<dyn TransactionManager>,
}

impl StepSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start_limit: None,
            allow_start_if_complete: false,
            listeners: StepListeners::default(),
            chunk_listeners: ChunkListeners::default(),
            promotion: None,
            transaction_manager: Arc::new(ResourcelessTransactionManager::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start_limit(&self) -> Option<usize> {
        self.start_limit
    }

    pub fn allow_start_if_complete(&self) -> bool {
        self.allow_start_if_complete
    }

    pub fn promotion(&self) -> Option<&PromotionPolicy> {
        self.promotion.as_ref()
    }

    pub fn listeners(&self) -> &StepListeners {
        &self.listeners
    }

    pub fn chunk_listeners(&self) -> &ChunkListeners {
        &self.chunk_listeners
    }

    pub fn transaction_manager(&self) -> &dyn TransactionManager {
        self.transaction_manager.as_ref()
    }
}

/// Copies an allow-list of keys from the step context into the job context
/// once the step ends with one of the accepted exit codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionPolicy {
    keys: Vec<String>,
    exit_codes: Vec<String>,
}

impl PromotionPolicy {
    /// Promote `keys` after a `COMPLETED` step.
    pub fn new<K>(keys: K) -> Self
    where
        K: IntoIterator,
        K::Item: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            exit_codes: vec![ExitStatus::COMPLETED.to_string()],
        }
    }

    /// Replace the accepted exit codes; `*` accepts any code.
    pub fn with_exit_codes<C>(mut self, codes: C) -> Self
    where
        C: IntoIterator,
        C::Item: Into<String>,
    {
        self.exit_codes = codes.into_iter().map(Into::into).collect();
        self
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }

    pub fn applies_to(&self, exit_status: &ExitStatus) -> bool {
        self.exit_codes
            .iter()
            .any(|code| code == "*" || code == exit_status.exit_code())
    }

    /// Copy the listed keys present in `step_context`. Returns the keys copied.
    pub fn promote(&self, step_context: &ExecutionContext, job_context: &mut ExecutionContext) -> Vec<String> {
        job_context.copy_keys_from(step_context, self.keys())
    }
}

/// The running step as seen by a step body.
pub struct StepRun<'a> {
    step: &'a mut StepExecution,
    job_context: &'a mut ExecutionContext,
    parameters: &'a JobParameters,
    repository: &'a dyn JobRepository,
    transactions: &'a dyn TransactionManager,
}

impl<'a> StepRun<'a> {
    pub fn new(
        step: &'a mut StepExecution,
        job_context: &'a mut ExecutionContext,
        parameters: &'a JobParameters,
        repository: &'a dyn JobRepository,
        transactions: &'a dyn TransactionManager,
    ) -> Self {
        Self {
            step,
            job_context,
            parameters,
            repository,
            transactions,
        }
    }

    pub fn step_name(&self) -> &str {
        &self.step.step_name
    }

    pub fn step_execution(&self) -> &StepExecution {
        self.step
    }

    pub fn step_context(&self) -> &ExecutionContext {
        &self.step.execution_context
    }

    pub fn step_context_mut(&mut self) -> &mut ExecutionContext {
        &mut self.step.execution_context
    }

    pub fn scope(&self) -> StepScope<'_> {
        StepScope::new(self.parameters, self.job_context, self.step)
    }

    pub fn chunk_context(&mut self) -> ChunkContext<'_> {
        ChunkContext::new(&mut *self.step, &mut *self.job_context, self.parameters)
    }

    /// A stop was requested for the job execution, or the step asked to terminate.
    pub fn stop_requested(&self) -> Result<bool, StepError> {
        if self.step.terminate_only {
            return Ok(true);
        }
        let status = self.repository.job_execution_status(self.step.job_execution_id)?;
        Ok(status == Some(BatchStatus::Stopping))
    }

    /// Persist counters and step context.
    pub fn checkpoint(&mut self) -> Result<(), StepError> {
        self.step.last_updated = Utc::now();
        self.repository.update_step_execution(self.step)?;
        self.step.execution_context.clear_dirty();
        Ok(())
    }

    /// Run `body` as one transaction wrapped by the chunk listeners.
    ///
    /// On success: commit, apply the contribution, checkpoint, `after_chunk`.
    /// On failure: roll back, restore the step context, count the rollback,
    /// `after_chunk_error`, and return the error.
    pub(crate) fn in_transaction<T, F>(&mut self, chunk_listeners: &ChunkListeners, body: F) -> Result<T, StepError>
    where
        F: FnOnce(&mut StepRun<'a>, &mut StepContribution) -> Result<T, StepError>,
    {
        let snapshot = self.step.execution_context.clone();
        let transaction = self.transactions.begin()?;
        let mut contribution = StepContribution::default();

        let before = chunk_listeners.before_chunk(&mut self.chunk_context());
        let outcome = match before {
            Ok(()) => body(self, &mut contribution),
            Err(error) => Err(StepError::listener("before_chunk", error)),
        };

        let value = match outcome {
            Ok(value) => value,
            Err(error) => {
                if let Err(rollback_error) = self.transactions.rollback(transaction) {
                    error!(step = %self.step.step_name, error = %rollback_error, "rollback failed");
                }
                self.fail_transaction(snapshot, chunk_listeners, &error);
                return Err(error);
            }
        };

        if let Err(commit_error) = self.transactions.commit(transaction) {
            let error = StepError::from(commit_error);
            self.fail_transaction(snapshot, chunk_listeners, &error);
            return Err(error);
        }

        contribution.apply_to(self.step);
        self.checkpoint()?;
        chunk_listeners.after_chunk(&mut self.chunk_context());
        Ok(value)
    }

    fn fail_transaction(&mut self, snapshot: ExecutionContext, chunk_listeners: &ChunkListeners, error: &StepError) {
        self.step.execution_context = snapshot;
        self.step.rollback_count += 1;
        debug!(
            step = %self.step.step_name,
            rollbacks = self.step.rollback_count,
            "chunk rolled back"
        );
        chunk_listeners.after_chunk_error(&mut self.chunk_context(), error);
    }
}

/// Runs steps against a repository.
pub struct StepExecutor<'r> {
    repository: &'r dyn JobRepository,
    rerun_completed: bool,
}

impl<'r> StepExecutor<'r> {
    pub fn new(repository: &'r dyn JobRepository) -> Self {
        Self {
            repository,
            rerun_completed: false,
        }
    }

    /// Run steps even when they already completed for this instance.
    pub fn with_rerun_completed(mut self, rerun: bool) -> Self {
        self.rerun_completed = rerun;
        self
    }

    /// Execute `step` as part of `job`.
    ///
    /// Returns `Ok(None)` when the step already completed for this instance
    /// and is skipped. Step failures are recorded on the returned execution;
    /// `Err` means the step could not be started or recorded.
    pub fn execute(&self, step: &dyn Step, job: &mut JobExecution) -> Result<Option<StepExecution>, StepError> {
        let settings = step.settings();
        let name = step.name();
        let instance_id = job.instance.id;

        let last = self.repository.get_last_step_execution(instance_id, name)?;
        if let Some(last) = &last {
            if last.status == BatchStatus::Completed && !settings.allow_start_if_complete && !self.rerun_completed {
                info!(job = %job.job_name(), step = name, "step already completed; skipping");
                return Ok(None);
            }
        }

        if let Some(limit) = settings.start_limit {
            let started = self.repository.step_execution_count(instance_id, name)?;
            if started >= limit {
                return Err(StepError::StartLimitExceeded {
                    step: name.to_string(),
                    limit,
                });
            }
        }

        let mut execution = StepExecution::new(name, job.id);
        if let Some(last) = last.filter(|l| l.status != BatchStatus::Completed) {
            info!(
                job = %job.job_name(),
                step = name,
                previous_status = %last.status,
                "restarting step from its last checkpoint"
            );
            execution.execution_context = last.execution_context;
            execution.execution_context.clear_dirty();
        }
        execution.mark_started();
        self.repository.add_step_execution(&execution)?;
        info!(job = %job.job_name(), step = name, step_execution_id = %execution.id, "step started");

        let parameters = job.parameters().clone();
        let outcome = match settings.listeners.before_step(&mut execution, &mut job.execution_context) {
            Err(error) => Err(StepError::listener("before_step", error)),
            Ok(()) => {
                let mut run = StepRun::new(
                    &mut execution,
                    &mut job.execution_context,
                    &parameters,
                    self.repository,
                    settings.transaction_manager(),
                );
                step.execute_body(&mut run)
            }
        };

        match outcome {
            Ok(status) => execution.mark_finished(status),
            Err(step_error) => {
                error!(
                    job = %job.job_name(),
                    step = name,
                    error = %step_error,
                    "step failed"
                );
                execution.mark_failed(&step_error);
            }
        }

        if let Some(exit_status) = settings.listeners.after_step(&mut execution, &mut job.execution_context) {
            execution.exit_status = exit_status;
        }

        if let Some(policy) = &settings.promotion {
            if policy.applies_to(&execution.exit_status) {
                let promoted = policy.promote(&execution.execution_context, &mut job.execution_context);
                debug!(step = name, keys = ?promoted, "promoted step context keys");
            }
        }

        self.repository.update_step_execution(&execution)?;
        info!(
            job = %job.job_name(),
            step = name,
            status = %execution.status,
            exit_code = execution.exit_status.exit_code(),
            read = execution.read_count,
            written = execution.write_count,
            filtered = execution.filter_count,
            commits = execution.commit_count,
            rollbacks = execution.rollback_count,
            duration_ms = execution.duration_ms(),
            "step finished"
        );

        job.step_executions.push(execution.clone());
        Ok(Some(execution))
    }
}

/// Entry point for building steps.
pub struct StepBuilder {
    settings: StepSettings,
}

impl StepBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            settings: StepSettings::new(name),
        }
    }

    /// Maximum number of executions of this step per job instance.
    pub fn start_limit(mut self, limit: usize) -> Self {
        self.settings.start_limit = Some(limit);
        self
    }

    /// Re-run the step on restart even if it completed before.
    pub fn allow_start_if_complete(mut self, allow: bool) -> Self {
        self.settings.allow_start_if_complete = allow;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn StepExecutionListener>) -> Self {
        self.settings.listeners.register(listener);
        self
    }

    pub fn chunk_listener(mut self, listener: Arc<dyn ChunkListener>) -> Self {
        self.settings.chunk_listeners.register(listener);
        self
    }

    pub fn promotion(mut self, policy: PromotionPolicy) -> Self {
        self.settings.promotion = Some(policy);
        self
    }

    pub fn transaction_manager(mut self, transaction_manager: Arc<dyn TransactionManager>) -> Self {
        self.settings.transaction_manager = transaction_manager;
        self
    }

    /// Tasklet step; `factory` builds a fresh tasklet for every step execution.
    pub fn tasklet<T, F>(self, factory: F) -> TaskletStep
    where
        T: Tasklet + 'static,
        F: Fn(&StepScope<'_>) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        TaskletStep {
            settings: self.settings,
            factory: Box::new(move |scope: &StepScope<'_>| {
                let tasklet: Box<dyn Tasklet> = Box::new(factory(scope)?);
                Ok(tasklet)
            }),
        }
    }

    /// Tasklet step from a shared, stateless function.
    pub fn tasklet_fn<F>(self, tasklet: F) -> TaskletStep
    where
        F: Fn(&mut StepContribution, &mut ChunkContext<'_>) -> anyhow::Result<RepeatStatus> + Send + Sync + 'static,
    {
        let tasklet = Arc::new(tasklet);
        self.tasklet(move |_scope: &StepScope<'_>| {
            let tasklet = Arc::clone(&tasklet);
            Ok(move |contribution: &mut StepContribution, context: &mut ChunkContext<'_>| {
                tasklet(contribution, context)
            })
        })
    }

    /// Chunk step reading `I` and writing `O`, committing every `size` items.
    pub fn chunk<I, O>(self, size: usize) -> ChunkStepBuilder<I, O> {
        ChunkStepBuilder {
            settings: self.settings,
            chunk_size: size.max(1),
            reader: None,
            processor: None,
            writer: None,
            item_listeners: ItemListeners::default(),
        }
    }
}

type TaskletFactory = Box<dyn Fn(&StepScope<'_>) -> anyhow::Result<Box<dyn Tasklet>> + Send + Sync>;

/// Step running a [`Tasklet`] until it finishes.
pub struct TaskletStep {
    settings: StepSettings,
    factory: TaskletFactory,
}

impl Step for TaskletStep {
    fn settings(&self) -> &StepSettings {
        &self.settings
    }

    fn execute_body(&self, run: &mut StepRun<'_>) -> Result<BatchStatus, StepError> {
        let mut tasklet =
            (self.factory)(&run.scope()).map_err(|e| StepError::collaborator("create tasklet", e))?;
        run_tasklet(tasklet.as_mut(), run, &self.settings.chunk_listeners)
    }
}

type ReaderFactory<I> = Box<dyn Fn(&StepScope<'_>) -> anyhow::Result<Box<dyn ItemReader<I>>> + Send + Sync>;
type ProcessorFactory<I, O> =
    Box<dyn Fn(&StepScope<'_>) -> anyhow::Result<Box<dyn ItemProcessor<I, O>>> + Send + Sync>;
type WriterFactory<O> = Box<dyn Fn(&StepScope<'_>) -> anyhow::Result<Box<dyn ItemWriter<O>>> + Send + Sync>;

/// A chunk step definition is missing a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepBuildError {
    #[error("step '{0}' has no reader")]
    MissingReader(String),
    #[error("step '{0}' has no processor")]
    MissingProcessor(String),
    #[error("step '{0}' has no writer")]
    MissingWriter(String),
}

/// Builder for [`ChunkStep`].
pub struct ChunkStepBuilder<I, O> {
    settings: StepSettings,
    chunk_size: usize,
    reader: Option<ReaderFactory<I>>,
    processor: Option<ProcessorFactory<I, O>>,
    writer: Option<WriterFactory<O>>,
    item_listeners: ItemListeners<I, O>,
}

impl<I: 'static, O: 'static> ChunkStepBuilder<I, O> {
    pub fn reader<R, F>(mut self, factory: F) -> Self
    where
        R: ItemReader<I> + 'static,
        F: Fn(&StepScope<'_>) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        self.reader = Some(Box::new(move |scope: &StepScope<'_>| {
            let reader: Box<dyn ItemReader<I>> = Box::new(factory(scope)?);
            Ok(reader)
        }));
        self
    }

    pub fn processor<P, F>(mut self, factory: F) -> Self
    where
        P: ItemProcessor<I, O> + 'static,
        F: Fn(&StepScope<'_>) -> anyhow::Result<P> + Send + Sync + 'static,
    {
        self.processor = Some(Box::new(move |scope: &StepScope<'_>| {
            let processor: Box<dyn ItemProcessor<I, O>> = Box::new(factory(scope)?);
            Ok(processor)
        }));
        self
    }

    /// Processor from a shared, stateless function.
    pub fn processor_fn<F>(self, process: F) -> Self
    where
        F: Fn(&I) -> anyhow::Result<Option<O>> + Send + Sync + 'static,
    {
        let process = Arc::new(process);
        self.processor(move |_scope: &StepScope<'_>| {
            let process = Arc::clone(&process);
            Ok(move |item: &I| process(item))
        })
    }

    pub fn writer<W, F>(mut self, factory: F) -> Self
    where
        W: ItemWriter<O> + 'static,
        F: Fn(&StepScope<'_>) -> anyhow::Result<W> + Send + Sync + 'static,
    {
        self.writer = Some(Box::new(move |scope: &StepScope<'_>| {
            let writer: Box<dyn ItemWriter<O>> = Box::new(factory(scope)?);
            Ok(writer)
        }));
        self
    }

    pub fn read_listener(mut self, listener: Arc<dyn ItemReadListener<I>>) -> Self {
        self.item_listeners.register_read(listener);
        self
    }

    pub fn process_listener(mut self, listener: Arc<dyn ItemProcessListener<I, O>>) -> Self {
        self.item_listeners.register_process(listener);
        self
    }

    pub fn write_listener(mut self, listener: Arc<dyn ItemWriteListener<O>>) -> Self {
        self.item_listeners.register_write(listener);
        self
    }

    pub fn build(self) -> Result<ChunkStep<I, O>, StepBuildError> {
        let name = self.settings.name.clone();
        Ok(ChunkStep {
            reader: self.reader.ok_or_else(|| StepBuildError::MissingReader(name.clone()))?,
            processor: self
                .processor
                .ok_or_else(|| StepBuildError::MissingProcessor(name.clone()))?,
            writer: self.writer.ok_or(StepBuildError::MissingWriter(name))?,
            settings: self.settings,
            chunk_size: self.chunk_size,
            item_listeners: self.item_listeners,
        })
    }
}

impl<T: Clone + Send + 'static> ChunkStepBuilder<T, T> {
    /// Write items exactly as read.
    pub fn pass_through(self) -> Self {
        self.processor(|_scope: &StepScope<'_>| Ok(PassThroughProcessor))
    }
}

/// Step running the read/process/write loop.
pub struct ChunkStep<I, O> {
    settings: StepSettings,
    chunk_size: usize,
    reader: ReaderFactory<I>,
    processor: ProcessorFactory<I, O>,
    writer: WriterFactory<O>,
    item_listeners: ItemListeners<I, O>,
}

impl<I, O> ChunkStep<I, O> {
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl<I: 'static, O: 'static> Step for ChunkStep<I, O> {
    fn settings(&self) -> &StepSettings {
        &self.settings
    }

    fn execute_body(&self, run: &mut StepRun<'_>) -> Result<BatchStatus, StepError> {
        let scope = run.scope();
        let reader = (self.reader)(&scope).map_err(|e| StepError::collaborator("create reader", e))?;
        let processor = (self.processor)(&scope).map_err(|e| StepError::collaborator("create processor", e))?;
        let writer = (self.writer)(&scope).map_err(|e| StepError::collaborator("create writer", e))?;

        ChunkProcessor::new(reader, processor, writer, self.chunk_size).run(
            run,
            &self.item_listeners,
            &self.settings.chunk_listeners,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotion_defaults_to_completed_only() {
        let policy = PromotionPolicy::new(["result"]);
        assert!(policy.applies_to(&ExitStatus::completed()));
        assert!(!policy.applies_to(&ExitStatus::failed()));

        let any = PromotionPolicy::new(["result"]).with_exit_codes(["*"]);
        assert!(any.applies_to(&ExitStatus::failed()));
    }

    #[test]
    fn promotion_copies_only_listed_keys() {
        let mut step = ExecutionContext::new();
        step.put_string("result", "aaaa");
        step.put_long("private", 1);
        let mut job = ExecutionContext::new();

        let copied = PromotionPolicy::new(["result", "absent"]).promote(&step, &mut job);

        assert_eq!(copied, vec!["result".to_string()]);
        assert_eq!(job.get_string("result"), Some("aaaa"));
        assert!(!job.contains_key("private"));
    }

    #[test]
    fn chunk_builder_requires_reader_and_writer() {
        let missing_reader = StepBuilder::new("s").chunk::<i32, i32>(3).pass_through().build();
        assert!(matches!(missing_reader, Err(StepBuildError::MissingReader(name)) if name == "s"));

        let missing_writer = StepBuilder::new("s")
            .chunk::<i32, i32>(3)
            .reader(|_scope: &StepScope<'_>| Ok(|| -> anyhow::Result<Option<i32>> { Ok(None) }))
            .pass_through()
            .build();
        assert!(matches!(missing_writer, Err(StepBuildError::MissingWriter(_))));
    }

    #[test]
    fn chunk_size_is_at_least_one() {
        let step = StepBuilder::new("s")
            .chunk::<i32, i32>(0)
            .reader(|_scope: &StepScope<'_>| Ok(|| -> anyhow::Result<Option<i32>> { Ok(None) }))
            .pass_through()
            .writer(|_scope: &StepScope<'_>| Ok(|_chunk: &crate::item::Chunk<i32>| -> anyhow::Result<()> { Ok(()) }))
            .build()
            .unwrap();
        assert_eq!(step.chunk_size(), 1);
        assert_eq!(step.name(), "s");
    }
}
