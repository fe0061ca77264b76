//! `batchline-core` - batch domain building blocks.
//!
//! This crate contains the **pure data model** of a batch run (no execution,
//! no storage): identifiers, statuses, job parameters, execution contexts,
//! execution records and parameter validation.

pub mod context;
pub mod error;
pub mod execution;
pub mod id;
pub mod parameters;
pub mod status;
pub mod validation;

pub use context::ExecutionContext;
pub use error::{ContextError, ParameterError, ValidationError, ValidationResult};
pub use execution::{JobExecution, JobInstance, StepExecution};
pub use id::{JobExecutionId, JobInstanceId, StepExecutionId};
pub use parameters::{
    JobKey, JobParameter, JobParameters, JobParametersBuilder, JobParametersConverter, ParameterValue,
};
pub use status::{BatchStatus, ExitStatus};
pub use validation::{
    CompositeJobParametersValidator, DefaultJobParametersValidator, JobParametersValidator, NoopValidator,
};
