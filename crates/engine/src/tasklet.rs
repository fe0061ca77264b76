//! Tasklet steps: one repeatable unit of work, each call in its own transaction.

use tracing::debug;

use batchline_core::{BatchStatus, ExitStatus, StepExecution};

use crate::error::StepError;
use crate::listener::ChunkListeners;
use crate::scope::ChunkContext;
use crate::step::StepRun;

/// What a tasklet wants after one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatStatus {
    /// Commit and call again.
    Continuable,
    /// Commit and end the step.
    Finished,
}

impl RepeatStatus {
    pub fn continue_if(condition: bool) -> Self {
        if condition {
            RepeatStatus::Continuable
        } else {
            RepeatStatus::Finished
        }
    }

    pub fn is_continuable(self) -> bool {
        self == RepeatStatus::Continuable
    }
}

/// Counters and exit status gathered during one transaction; applied to the
/// step execution only if the transaction commits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepContribution {
    read_count: u64,
    write_count: u64,
    filter_count: u64,
    exit_status: Option<ExitStatus>,
}

impl StepContribution {
    pub fn increment_read_count(&mut self, count: u64) {
        self.read_count += count;
    }

    pub fn increment_write_count(&mut self, count: u64) {
        self.write_count += count;
    }

    pub fn increment_filter_count(&mut self, count: u64) {
        self.filter_count += count;
    }

    pub fn set_exit_status(&mut self, exit_status: ExitStatus) {
        self.exit_status = Some(exit_status);
    }

    pub fn read_count(&self) -> u64 {
        self.read_count
    }

    pub fn write_count(&self) -> u64 {
        self.write_count
    }

    pub fn filter_count(&self) -> u64 {
        self.filter_count
    }

    pub(crate) fn apply_to(self, step: &mut StepExecution) {
        step.read_count += self.read_count;
        step.write_count += self.write_count;
        step.filter_count += self.filter_count;
        step.commit_count += 1;
        if let Some(exit_status) = self.exit_status {
            step.exit_status = exit_status;
        }
    }
}

/// A single repeatable action.
pub trait Tasklet: Send {
    fn execute(
        &mut self,
        contribution: &mut StepContribution,
        context: &mut ChunkContext<'_>,
    ) -> anyhow::Result<RepeatStatus>;
}

impl<F> Tasklet for F
where
    F: FnMut(&mut StepContribution, &mut ChunkContext<'_>) -> anyhow::Result<RepeatStatus> + Send,
{
    fn execute(
        &mut self,
        contribution: &mut StepContribution,
        context: &mut ChunkContext<'_>,
    ) -> anyhow::Result<RepeatStatus> {
        self(contribution, context)
    }
}

/// Call `tasklet` until it reports [`RepeatStatus::Finished`], a stop is
/// requested, or an invocation fails.
///
/// A failure rolls back only the failing invocation; earlier ones stay committed.
pub fn run_tasklet(
    tasklet: &mut dyn Tasklet,
    run: &mut StepRun<'_>,
    chunk_listeners: &ChunkListeners,
) -> Result<BatchStatus, StepError> {
    let mut iteration: u64 = 0;
    loop {
        if run.stop_requested()? {
            return Ok(BatchStatus::Stopped);
        }
        iteration += 1;

        let status = run.in_transaction(chunk_listeners, |run, contribution| {
            tasklet
                .execute(contribution, &mut run.chunk_context())
                .map_err(StepError::Tasklet)
        })?;

        debug!(
            step = %run.step_name(),
            iteration,
            repeat = ?status,
            "tasklet iteration committed"
        );

        if !status.is_continuable() {
            return Ok(BatchStatus::Completed);
        }
    }
}
