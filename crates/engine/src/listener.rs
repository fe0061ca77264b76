//! Listener hooks and their dispatch rules.
//!
//! Every hook has a no-op default, so a listener implements only what it
//! needs. Dispatch order and failure handling are the same at every level:
//!
//! - "before" hooks run in registration order; the first error aborts the
//!   owning scope (job, step or chunk);
//! - "after" hooks run in reverse registration order;
//! - after-job, after-step, after-chunk and error hooks are isolated: their
//!   errors are logged and swallowed and never change the outcome;
//! - item-level after hooks (`after_read`, `after_process`, `after_write`) run
//!   inside the chunk transaction, so their errors fail the chunk.

use std::sync::Arc;

use tracing::warn;

use batchline_core::{ExecutionContext, ExitStatus, JobExecution, StepExecution};

use crate::error::StepError;
use crate::item::Chunk;
use crate::scope::ChunkContext;

pub trait JobExecutionListener: Send + Sync {
    fn before_job(&self, _execution: &mut JobExecution) -> anyhow::Result<()> {
        Ok(())
    }

    fn after_job(&self, _execution: &mut JobExecution) -> anyhow::Result<()> {
        Ok(())
    }
}

pub trait StepExecutionListener: Send + Sync {
    fn before_step(&self, _step: &mut StepExecution, _job_context: &mut ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs once the step status is final. `Some` replaces the step's exit status.
    fn after_step(
        &self,
        _step: &mut StepExecution,
        _job_context: &mut ExecutionContext,
    ) -> anyhow::Result<Option<ExitStatus>> {
        Ok(None)
    }
}

/// Hooks around each chunk transaction (and each tasklet invocation).
pub trait ChunkListener: Send + Sync {
    fn before_chunk(&self, _context: &mut ChunkContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs after the commit.
    fn after_chunk(&self, _context: &mut ChunkContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs after the rollback.
    fn after_chunk_error(&self, _context: &mut ChunkContext<'_>, _error: &StepError) -> anyhow::Result<()> {
        Ok(())
    }
}

pub trait ItemReadListener<T>: Send + Sync {
    fn before_read(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Not called at end of data.
    fn after_read(&self, _item: &T) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_read_error(&self, _error: &anyhow::Error) -> anyhow::Result<()> {
        Ok(())
    }
}

pub trait ItemProcessListener<I, O>: Send + Sync {
    fn before_process(&self, _item: &I) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called for filtered items too, with `result` set to `None`.
    fn after_process(&self, _item: &I, _result: Option<&O>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_process_error(&self, _item: &I, _error: &anyhow::Error) -> anyhow::Result<()> {
        Ok(())
    }
}

pub trait ItemWriteListener<O>: Send + Sync {
    fn before_write(&self, _chunk: &Chunk<O>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs before the transaction commits.
    fn after_write(&self, _chunk: &Chunk<O>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_write_error(&self, _chunk: &Chunk<O>, _error: &anyhow::Error) -> anyhow::Result<()> {
        Ok(())
    }
}

fn swallow(hook: &'static str, result: anyhow::Result<()>) {
    if let Err(error) = result {
        warn!(hook, error = %format!("{error:#}"), "listener failed; ignoring");
    }
}

/// Ordered job listeners.
#[derive(Clone, Default)]
pub struct JobListeners {
    listeners: Vec<Arc<dyn JobExecutionListener>>,
}

impl JobListeners {
    pub fn register(&mut self, listener: Arc<dyn JobExecutionListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn before_job(&self, execution: &mut JobExecution) -> anyhow::Result<()> {
        for listener in &self.listeners {
            listener.before_job(execution)?;
        }
        Ok(())
    }

    pub fn after_job(&self, execution: &mut JobExecution) {
        for listener in self.listeners.iter().rev() {
            swallow("after_job", listener.after_job(execution));
        }
    }
}

/// Ordered step listeners.
#[derive(Clone, Default)]
pub struct StepListeners {
    listeners: Vec<Arc<dyn StepExecutionListener>>,
}

impl StepListeners {
    pub fn register(&mut self, listener: Arc<dyn StepExecutionListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn before_step(&self, step: &mut StepExecution, job_context: &mut ExecutionContext) -> anyhow::Result<()> {
        for listener in &self.listeners {
            listener.before_step(step, job_context)?;
        }
        Ok(())
    }

    /// Returns the exit status override of the last listener (in call order) that gave one.
    pub fn after_step(&self, step: &mut StepExecution, job_context: &mut ExecutionContext) -> Option<ExitStatus> {
        let mut exit_status = None;
        for listener in self.listeners.iter().rev() {
            match listener.after_step(step, job_context) {
                Ok(Some(status)) => exit_status = Some(status),
                Ok(None) => {}
                Err(error) => {
                    warn!(hook = "after_step", step = %step.step_name, error = %format!("{error:#}"), "listener failed; ignoring")
                }
            }
        }
        exit_status
    }
}

/// Ordered chunk listeners.
#[derive(Clone, Default)]
pub struct ChunkListeners {
    listeners: Vec<Arc<dyn ChunkListener>>,
}

impl ChunkListeners {
    pub fn register(&mut self, listener: Arc<dyn ChunkListener>) {
        self.listeners.push(listener);
    }

    pub fn before_chunk(&self, context: &mut ChunkContext<'_>) -> anyhow::Result<()> {
        for listener in &self.listeners {
            listener.before_chunk(context)?;
        }
        Ok(())
    }

    pub fn after_chunk(&self, context: &mut ChunkContext<'_>) {
        for listener in self.listeners.iter().rev() {
            swallow("after_chunk", listener.after_chunk(context));
        }
    }

    pub fn after_chunk_error(&self, context: &mut ChunkContext<'_>, error: &StepError) {
        for listener in self.listeners.iter().rev() {
            swallow("after_chunk_error", listener.after_chunk_error(context, error));
        }
    }
}

/// Item-level listeners of a chunk step.
pub struct ItemListeners<I, O> {
    read: Vec<Arc<dyn ItemReadListener<I>>>,
    process: Vec<Arc<dyn ItemProcessListener<I, O>>>,
    write: Vec<Arc<dyn ItemWriteListener<O>>>,
}

impl<I, O> Default for ItemListeners<I, O> {
    fn default() -> Self {
        Self {
            read: Vec::new(),
            process: Vec::new(),
            write: Vec::new(),
        }
    }
}

impl<I, O> Clone for ItemListeners<I, O> {
    fn clone(&self) -> Self {
        Self {
            read: self.read.clone(),
            process: self.process.clone(),
            write: self.write.clone(),
        }
    }
}

impl<I, O> ItemListeners<I, O> {
    pub fn register_read(&mut self, listener: Arc<dyn ItemReadListener<I>>) {
        self.read.push(listener);
    }

    pub fn register_process(&mut self, listener: Arc<dyn ItemProcessListener<I, O>>) {
        self.process.push(listener);
    }

    pub fn register_write(&mut self, listener: Arc<dyn ItemWriteListener<O>>) {
        self.write.push(listener);
    }

    pub fn before_read(&self) -> anyhow::Result<()> {
        self.read.iter().try_for_each(|l| l.before_read())
    }

    pub fn after_read(&self, item: &I) -> anyhow::Result<()> {
        self.read.iter().rev().try_for_each(|l| l.after_read(item))
    }

    pub fn on_read_error(&self, error: &anyhow::Error) {
        for listener in self.read.iter().rev() {
            swallow("on_read_error", listener.on_read_error(error));
        }
    }

    pub fn before_process(&self, item: &I) -> anyhow::Result<()> {
        self.process.iter().try_for_each(|l| l.before_process(item))
    }

    pub fn after_process(&self, item: &I, result: Option<&O>) -> anyhow::Result<()> {
        self.process
            .iter()
            .rev()
            .try_for_each(|l| l.after_process(item, result))
    }

    pub fn on_process_error(&self, item: &I, error: &anyhow::Error) {
        for listener in self.process.iter().rev() {
            swallow("on_process_error", listener.on_process_error(item, error));
        }
    }

    pub fn before_write(&self, chunk: &Chunk<O>) -> anyhow::Result<()> {
        self.write.iter().try_for_each(|l| l.before_write(chunk))
    }

    pub fn after_write(&self, chunk: &Chunk<O>) -> anyhow::Result<()> {
        self.write.iter().rev().try_for_each(|l| l.after_write(chunk))
    }

    pub fn on_write_error(&self, chunk: &Chunk<O>, error: &anyhow::Error) {
        for listener in self.write.iter().rev() {
            swallow("on_write_error", listener.on_write_error(chunk, error));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use batchline_core::{JobExecutionId, JobInstance, JobParameters};

    #[derive(Default)]
    struct Log(Mutex<Vec<String>>);

    impl Log {
        fn push(&self, entry: impl Into<String>) {
            self.0.lock().unwrap().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct Named {
        name: &'static str,
        log: Arc<Log>,
        fail_before: bool,
        fail_after: bool,
        exit: Option<&'static str>,
    }

    impl Named {
        fn new(name: &'static str, log: &Arc<Log>) -> Self {
            Self {
                name,
                log: log.clone(),
                fail_before: false,
                fail_after: false,
                exit: None,
            }
        }
    }

    impl JobExecutionListener for Named {
        fn before_job(&self, _execution: &mut JobExecution) -> anyhow::Result<()> {
            self.log.push(format!("before:{}", self.name));
            if self.fail_before {
                anyhow::bail!("{} refused", self.name);
            }
            Ok(())
        }

        fn after_job(&self, _execution: &mut JobExecution) -> anyhow::Result<()> {
            self.log.push(format!("after:{}", self.name));
            if self.fail_after {
                anyhow::bail!("{} broke", self.name);
            }
            Ok(())
        }
    }

    impl StepExecutionListener for Named {
        fn after_step(
            &self,
            _step: &mut StepExecution,
            _job_context: &mut ExecutionContext,
        ) -> anyhow::Result<Option<ExitStatus>> {
            self.log.push(format!("after:{}", self.name));
            if self.fail_after {
                anyhow::bail!("{} broke", self.name);
            }
            Ok(self.exit.map(ExitStatus::new))
        }
    }

    fn execution() -> JobExecution {
        let params = JobParameters::new();
        JobExecution::new(JobInstance::new("job", &params), params)
    }

    #[test]
    fn before_in_order_after_in_reverse() {
        let log = Arc::new(Log::default());
        let mut listeners = JobListeners::default();
        listeners.register(Arc::new(Named::new("a", &log)));
        listeners.register(Arc::new(Named::new("b", &log)));

        let mut exec = execution();
        listeners.before_job(&mut exec).unwrap();
        listeners.after_job(&mut exec);

        assert_eq!(log.entries(), vec!["before:a", "before:b", "after:b", "after:a"]);
    }

    #[test]
    fn first_before_failure_stops_dispatch() {
        let log = Arc::new(Log::default());
        let mut failing = Named::new("a", &log);
        failing.fail_before = true;

        let mut listeners = JobListeners::default();
        listeners.register(Arc::new(failing));
        listeners.register(Arc::new(Named::new("b", &log)));

        assert!(listeners.before_job(&mut execution()).is_err());
        assert_eq!(log.entries(), vec!["before:a"]);
    }

    #[test]
    fn after_failures_are_swallowed() {
        let log = Arc::new(Log::default());
        let mut failing = Named::new("a", &log);
        failing.fail_after = true;

        let mut listeners = JobListeners::default();
        listeners.register(Arc::new(Named::new("b", &log)));
        listeners.register(Arc::new(failing));

        listeners.after_job(&mut execution());
        assert_eq!(log.entries(), vec!["after:a", "after:b"]);
    }

    #[test]
    fn last_exit_status_override_wins() {
        let log = Arc::new(Log::default());
        let mut first = Named::new("first", &log);
        first.exit = Some("FIRST");
        let mut second = Named::new("second", &log);
        second.exit = Some("SECOND");
        let mut broken = Named::new("broken", &log);
        broken.fail_after = true;

        let mut listeners = StepListeners::default();
        listeners.register(Arc::new(first));
        listeners.register(Arc::new(second));
        listeners.register(Arc::new(broken));

        let mut step = StepExecution::new("s", JobExecutionId::new());
        let mut job_context = ExecutionContext::new();
        let exit = listeners.after_step(&mut step, &mut job_context);

        // reverse order: broken, second, first
        assert_eq!(exit.map(|e| e.exit_code().to_string()), Some("FIRST".to_string()));
        assert_eq!(log.entries(), vec!["after:broken", "after:second", "after:first"]);
    }
}
