//! Views handed to collaborators while a step runs.

use batchline_core::{
    ExecutionContext, JobExecutionId, JobParameters, StepExecution, StepExecutionId,
};

/// Read-only view used by collaborator factories.
///
/// Factories run once per step execution, after the before-step listeners, so
/// a reader or tasklet can be built from this run's parameters and from data
/// earlier steps promoted into the job context.
#[derive(Debug, Clone, Copy)]
pub struct StepScope<'a> {
    parameters: &'a JobParameters,
    job_context: &'a ExecutionContext,
    step: &'a StepExecution,
}

impl<'a> StepScope<'a> {
    pub fn new(parameters: &'a JobParameters, job_context: &'a ExecutionContext, step: &'a StepExecution) -> Self {
        Self {
            parameters,
            job_context,
            step,
        }
    }

    pub fn job_parameters(&self) -> &'a JobParameters {
        self.parameters
    }

    pub fn job_context(&self) -> &'a ExecutionContext {
        self.job_context
    }

    /// The step's own context; non-empty on restart.
    pub fn step_context(&self) -> &'a ExecutionContext {
        &self.step.execution_context
    }

    pub fn step_name(&self) -> &'a str {
        &self.step.step_name
    }

    pub fn step_execution_id(&self) -> StepExecutionId {
        self.step.id
    }

    pub fn job_execution_id(&self) -> JobExecutionId {
        self.step.job_execution_id
    }
}

/// Mutable view of the running step, passed to tasklets and chunk listeners.
#[derive(Debug)]
pub struct ChunkContext<'a> {
    step: &'a mut StepExecution,
    job_context: &'a mut ExecutionContext,
    parameters: &'a JobParameters,
}

impl<'a> ChunkContext<'a> {
    pub fn new(
        step: &'a mut StepExecution,
        job_context: &'a mut ExecutionContext,
        parameters: &'a JobParameters,
    ) -> Self {
        Self {
            step,
            job_context,
            parameters,
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

    pub fn job_context(&self) -> &ExecutionContext {
        self.job_context
    }

    /// Job-scoped context; writes here are visible to later steps.
    pub fn job_context_mut(&mut self) -> &mut ExecutionContext {
        self.job_context
    }

    pub fn job_parameters(&self) -> &JobParameters {
        self.parameters
    }

    /// Ask the step to end `Stopped` once the current transaction commits.
    pub fn request_stop(&mut self) {
        self.step.set_terminate_only();
    }
}
