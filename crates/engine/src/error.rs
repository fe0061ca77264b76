//! Error model for step and job execution.

use thiserror::Error;

use batchline_core::{BatchStatus, JobExecution, JobExecutionId, ValidationError};
use batchline_infra::{RepositoryError, TransactionError};

/// Why a step ended `Failed`.
///
/// Collaborator failures arrive as `anyhow::Error`; the variant records which
/// phase of the step produced them.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("item read failed")]
    Read(#[source] anyhow::Error),

    #[error("item processing failed")]
    Process(#[source] anyhow::Error),

    #[error("chunk write failed")]
    Write(#[source] anyhow::Error),

    #[error("tasklet failed")]
    Tasklet(#[source] anyhow::Error),

    #[error("listener {hook} failed")]
    Listener {
        hook: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Creating, opening, updating or closing a reader/writer/tasklet failed.
    #[error("could not {operation}")]
    Collaborator {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("step '{step}' reached its start limit of {limit}")]
    StartLimitExceeded { step: String, limit: usize },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl StepError {
    pub(crate) fn listener(hook: &'static str, source: anyhow::Error) -> Self {
        Self::Listener { hook, source }
    }

    pub(crate) fn collaborator(operation: &'static str, source: anyhow::Error) -> Self {
        Self::Collaborator { operation, source }
    }
}

/// A job run was refused or could not be recorded.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Parameters were rejected; nothing was created.
    #[error(transparent)]
    InvalidParameters(#[from] ValidationError),

    #[error("job '{job_name}' already completed for these parameters (execution {execution_id})")]
    AlreadyComplete {
        job_name: String,
        execution_id: JobExecutionId,
    },

    #[error("job '{job_name}' is already running (execution {execution_id})")]
    AlreadyRunning {
        job_name: String,
        execution_id: JobExecutionId,
    },

    #[error("job '{job_name}' cannot be restarted: {reason}")]
    RestartRefused { job_name: String, reason: String },

    /// A before-job listener failed. The execution was recorded as `Failed`
    /// and no step ran.
    #[error("before-job listener failed for execution {}", .execution.id)]
    ListenerFailed {
        execution: Box<JobExecution>,
        #[source]
        source: anyhow::Error,
    },

    #[error("job '{0}' has no parameters incrementer")]
    NoIncrementer(String),

    #[error("no job execution with id {0}")]
    NoSuchExecution(JobExecutionId),

    #[error("job execution {id} is {status}; operation not allowed")]
    InvalidState { id: JobExecutionId, status: BatchStatus },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl LaunchError {
    /// Map repository refusals onto their launch-level meaning.
    pub(crate) fn from_repository(error: RepositoryError) -> Self {
        match error {
            RepositoryError::AlreadyRunning {
                job_name,
                execution_id,
            } => LaunchError::AlreadyRunning {
                job_name,
                execution_id,
            },
            RepositoryError::AlreadyComplete {
                job_name,
                execution_id,
            } => LaunchError::AlreadyComplete {
                job_name,
                execution_id,
            },
            RepositoryError::NotRestartable {
                job_name,
                execution_id,
                status,
            } => LaunchError::RestartRefused {
                job_name,
                reason: format!("last execution {execution_id} is {status}"),
            },
            RepositoryError::NotFound(id) => LaunchError::NoSuchExecution(id),
            RepositoryError::NotRunning { id, status } => LaunchError::InvalidState { id, status },
            other => LaunchError::Repository(other),
        }
    }
}
