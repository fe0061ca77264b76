//! Bundled demo jobs.

use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::info;

use batchline_core::{
    CompositeJobParametersValidator, DefaultJobParametersValidator, JobParameters, ValidationError,
};
use batchline_engine::{
    Chunk, ChunkContext, Job, JobBuilder, ListItemReader, PromotionPolicy, RepeatStatus, RunIdIncrementer,
    StepBuilder, StepContribution, StepScope,
};

pub const CATALOG: &[(&str, &str)] = &[
    ("fourSteps", "four tasklet steps; the third repeats five times"),
    ("doubler", "reads `count` integers, writes them doubled, `chunk.size` per chunk"),
    ("promotion", "hands a value from one step to the next through the job context"),
];

pub fn build(name: &str, parameters: &JobParameters) -> Result<Job> {
    let job = match name {
        "fourSteps" => four_steps()?,
        "doubler" => doubler(parameters)?,
        "promotion" => promotion()?,
        other => bail!("unknown job '{other}'; run `batchline list`"),
    };
    Ok(job)
}

fn say(step: &'static str) -> batchline_engine::TaskletStep {
    StepBuilder::new(step).tasklet_fn(move |_, context| {
        info!(step, job_execution_id = %context.step_execution().job_execution_id, "hello from {step}");
        Ok(RepeatStatus::Finished)
    })
}

fn four_steps() -> Result<Job> {
    let repeating = StepBuilder::new("step3").tasklet(|_scope: &StepScope<'_>| {
        let mut remaining = 5u32;
        Ok(
            move |_: &mut StepContribution, _: &mut ChunkContext<'_>| -> anyhow::Result<RepeatStatus> {
                remaining -= 1;
                info!(remaining, "step3 increment");
                Ok(RepeatStatus::continue_if(remaining > 0))
            },
        )
    });

    Ok(JobBuilder::new("fourSteps")
        .start(say("step1"))
        .next(say("step2"))
        .next(repeating)
        .next(say("step4"))
        .incrementer(RunIdIncrementer::default())
        .build()?)
}

fn doubler(parameters: &JobParameters) -> Result<Job> {
    let chunk_size = parameters.get_long("chunk.size").unwrap_or(3);
    if chunk_size < 1 {
        bail!("chunk.size must be at least 1, got {chunk_size}");
    }

    let validator = CompositeJobParametersValidator::new()
        .with(DefaultJobParametersValidator::new(["count"], ["chunk.size"]))
        .with(|parameters: &JobParameters| match parameters.get_long("count") {
            Some(count) if !(0..=10_000).contains(&count) => {
                Err(ValidationError::invalid("count", format!("{count} is outside 0..=10000")))
            }
            Some(_) => Ok(()),
            None => Err(ValidationError::invalid("count", "expected a long value")),
        });

    let step = StepBuilder::new("double")
        .chunk::<i64, String>(chunk_size as usize)
        .reader(|scope: &StepScope<'_>| {
            let count = scope.job_parameters().require_long("count")?;
            Ok(ListItemReader::new((1..=count).collect()))
        })
        .processor_fn(|n: &i64| Ok(Some((n * 2).to_string())))
        .writer(|scope: &StepScope<'_>| {
            let step = scope.step_name().to_string();
            Ok(move |chunk: &Chunk<String>| -> anyhow::Result<()> {
                info!(step = %step, size = chunk.len(), items = ?chunk.items(), "chunk written");
                Ok(())
            })
        })
        .build()?;

    Ok(JobBuilder::new("doubler").start(step).validator(validator).build()?)
}

fn promotion() -> Result<Job> {
    let produce = StepBuilder::new("produce")
        .promotion(PromotionPolicy::new(["greeting"]))
        .tasklet_fn(|_, context| {
            let name = context.job_parameters().get_string("name").unwrap_or("world").to_string();
            context.step_context_mut().put_string("greeting", format!("hello {name}"));
            context.step_context_mut().put_long("scratch", 42);
            Ok(RepeatStatus::Finished)
        });

    let consume = StepBuilder::new("consume").tasklet_fn(|_, context| {
        let greeting = context.job_context().get_string("greeting").map(str::to_string);
        let scratch = context.job_context().get_long("scratch");
        info!(greeting = ?greeting, scratch = ?scratch, "read promoted context");
        Ok(RepeatStatus::Finished)
    });

    Ok(JobBuilder::new("promotion")
        .start(produce)
        .next_shared(Arc::new(consume))
        .build()?)
}
