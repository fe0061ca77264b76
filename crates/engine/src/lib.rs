//! `batchline-engine` - runs jobs made of tasklet and chunk steps.
//!
//! A [`Job`] is an ordered list of [`Step`]s. The [`JobLauncher`] validates
//! parameters, resolves the job instance, and hands the execution to the
//! [`JobExecutor`], which runs each step through the [`StepExecutor`].
//!
//! Chunk steps read items one at a time, process them, and write them a chunk
//! at a time; each chunk is one transaction and one checkpoint of the step's
//! execution context, so a failed or stopped step restarts after the last
//! committed chunk.

pub mod chunk;
pub mod config;
pub mod error;
pub mod item;
pub mod job;
pub mod launcher;
pub mod listener;
pub mod scope;
pub mod step;
pub mod support;
pub mod tasklet;


pub use chunk::ChunkProcessor;
pub use config::{CompletedInstancePolicy, ConfigError, LauncherConfig};
pub use error::{LaunchError, StepError};
pub use item::{Chunk, ItemProcessor, ItemReader, ItemWriter, PassThroughProcessor};
pub use job::{Job, JobBuildError, JobBuilder, JobExecutor, JobParametersIncrementer, RunIdIncrementer};
pub use launcher::JobLauncher;
pub use listener::{
    ChunkListener, ItemProcessListener, ItemReadListener, ItemWriteListener, JobExecutionListener,
    StepExecutionListener,
};
pub use scope::{ChunkContext, StepScope};
pub use step::{
    ChunkStep, ChunkStepBuilder, PromotionPolicy, Step, StepBuildError, StepBuilder, StepExecutor, StepRun,
    StepSettings, TaskletStep,
};
pub use support::{ListItemReader, TransactionalList, TransactionalListWriter};
pub use tasklet::{RepeatStatus, StepContribution, Tasklet};
