//! `batchline` - run one of the bundled demo jobs against an in-memory repository.
//!
//! Usage:
//!   batchline list
//!   batchline run doubler count=10,long chunk.size=3,long
//!   batchline --completed-policy noop run fourSteps --times 2

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use batchline_core::{BatchStatus, JobExecution, JobParametersConverter};
use batchline_engine::{CompletedInstancePolicy, JobLauncher, LauncherConfig};
use batchline_infra::InMemoryJobRepository;

mod jobs;

#[derive(Parser, Debug)]
#[command(name = "batchline", about = "Run bundled batch jobs")]
struct Args {
    /// What to do when the job instance already completed: reject, noop or rerun.
    /// Falls back to BATCHLINE_COMPLETED_POLICY, then reject.
    #[arg(long)]
    completed_policy: Option<CompletedInstancePolicy>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the bundled jobs
    List,
    /// Run a job
    Run {
        /// Job name (see `list`)
        job: String,

        /// Job parameters as name=value[,type[,identifying]]
        parameters: Vec<String>,

        /// Launch the job this many times with the same parameters
        #[arg(long, default_value = "1")]
        times: u32,

        /// Print each finished execution as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },
}

fn main() -> Result<ExitCode> {
    batchline_observability::init();
    let args = Args::parse();

    match args.command {
        Command::List => {
            for (name, about) in jobs::CATALOG {
                println!("{name:<12} {about}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            job,
            parameters,
            times,
            json,
        } => {
            let mut config = LauncherConfig::from_env().context("reading launcher configuration")?;
            if let Some(policy) = args.completed_policy {
                config = config.with_completed_policy(policy);
            }

            let parameters = JobParametersConverter
                .parse_args(&parameters)
                .context("parsing job parameters")?;
            let job = jobs::build(&job, &parameters)?;
            let launcher = JobLauncher::new(InMemoryJobRepository::new()).with_config(config);
            info!(job = %job.name(), policy = ?launcher.config().completed_policy, times, "launching");

            let mut succeeded = true;
            for attempt in 1..=times {
                match launcher.run(&job, parameters.clone()) {
                    Ok(execution) => {
                        report(&execution, json)?;
                        succeeded = execution.status == BatchStatus::Completed;
                    }
                    Err(refused) => {
                        error!(attempt, error = %format!("{:#}", anyhow::Error::new(refused)), "launch refused");
                        succeeded = false;
                    }
                }
            }

            Ok(if succeeded { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
    }
}

fn report(execution: &JobExecution, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(execution)?);
        return Ok(());
    }
    println!(
        "{} [{}] status={} exit={}",
        execution.job_name(),
        execution.id,
        execution.status,
        execution.exit_status
    );
    for step in &execution.step_executions {
        println!("  {}", step.summary());
    }
    Ok(())
}
