mod interrupts;
mod utils;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::debug;
use serde_json::Value;

use crate::core::Dispatchman;
use crate::core::database::guard::CancellationToken;
use crate::core::dispatchman_config::{load_config, store_config};
use crate::core::experiments::ExperimentSpec;
use crate::core::jobs::dedup::Registration;
use crate::core::jobs::{StateKind, Status};
use crate::core::schedulers::Scheduler;
use interrupts::InterruptScope;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
  /// Print debug logs
  #[arg(short, long, global = true)]
  verbose: bool,
  /// Use this configuration file instead of the default one
  #[arg(long, global = true)]
  config: Option<PathBuf>,
  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Change and store the configuration
  Configure {
    /// Scheduler jobs are handed to (local, slurm or pbs)
    #[arg(short, long)]
    scheduler: Option<Scheduler>,
    /// Database file to use instead of the default one
    #[arg(short, long)]
    database: Option<PathBuf>,
  },
  /// Submit pending jobs to a cluster within its limits
  Launch {
    #[arg(short, long)]
    cluster: String,
    /// Maximum number of jobs per experiment (0 for no limit)
    #[arg(short, long, default_value_t = 0)]
    limit: u64,
    #[arg(short, long)]
    experiment: Option<String>,
  },
  /// Show how many jobs each experiment could submit
  Monitor {
    #[arg(short, long)]
    cluster: String,
  },
  /// List experiments and the state of their jobs
  List {
    #[arg(short, long)]
    cluster: Option<String>,
  },
  /// Register a job configuration in an experiment
  Register {
    experiment_config: PathBuf,
    job_config: PathBuf,
    /// Reclaim a finished job with the same configuration
    #[arg(short, long)]
    force: bool,
  },
  /// Mark a pending job as running
  Start {
    experiment: String,
    id: i32,
    #[arg(short, long)]
    force: bool,
  },
  /// Record the final status of a running job
  Finish {
    experiment: String,
    id: i32,
    #[arg(long, value_enum)]
    status: StatusArg,
    /// JSON file with the job results
    #[arg(long)]
    results: Option<PathBuf>,
  },
  /// Force the status of every job in a state
  Set {
    experiment: String,
    #[arg(value_enum)]
    from: StateArg,
    #[arg(value_enum)]
    to: StatusArg,
  },
  /// Put every job in a state back to pending
  Reset {
    experiment: String,
    #[arg(value_enum)]
    from: StateArg,
  },
  /// Delete an experiment
  Remove {
    name: String,
    /// Also delete its jobs
    #[arg(long)]
    jobs: bool,
  },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StateArg {
  Pending,
  Running,
  Completed,
  Broken,
}

impl From<StateArg> for StateKind {
  fn from(state: StateArg) -> Self {
    match state {
      StateArg::Pending => StateKind::Pending,
      StateArg::Running => StateKind::Running,
      StateArg::Completed => StateKind::Completed,
      StateArg::Broken => StateKind::Broken,
    }
  }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StatusArg {
  Start,
  Running,
  Done,
  ErrRun,
  ErrSync,
  ErrStart,
}

impl From<StatusArg> for Status {
  fn from(status: StatusArg) -> Self {
    match status {
      StatusArg::Start => Status::Start,
      StatusArg::Running => Status::Running,
      StatusArg::Done => Status::Done,
      StatusArg::ErrRun => Status::ErrRun,
      StatusArg::ErrSync => Status::ErrSync,
      StatusArg::ErrStart => Status::ErrStart,
    }
  }
}

pub fn main() {
  let cli = Cli::parse();

  let level = if cli.verbose { "debug" } else { "warn" };
  if let Err(e) = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).try_init() {
    eprintln!("Failed to initialize logging: {}", e);
  }

  let cancel = CancellationToken::new();
  let result = match InterruptScope::install(&cancel) {
    Ok(_scope) => run(cli, cancel),
    Err(e) => Err(e).context("Failed to install interrupt handlers"),
  };
  if let Err(e) = result {
    eprintln!("❌ {:#}", e);
    std::process::exit(1);
  }
}

fn run(cli: Cli, cancel: CancellationToken) -> Result<()> {
  let mut config = load_config(cli.config.as_deref()).context("Failed to load configuration")?;
  debug!("Configuration: {:?}", config);

  if let Commands::Configure { scheduler, database } = cli.command {
    if let Some(scheduler) = scheduler {
      config.scheduler = scheduler;
    }
    if let Some(database) = database {
      config.database_path = Some(database);
    }
    store_config(cli.config.as_deref(), &config).context("Failed to store configuration")?;
    println!("✅ Configuration stored ({} scheduler)", config.scheduler);
    return Ok(());
  }

  let dispatchman = Dispatchman::new(config, cancel).context("Failed to initialize Dispatchman")?;

  match cli.command {
    Commands::Configure { .. } => unreachable!("handled before opening the database"),
    Commands::Launch {
      cluster,
      limit,
      experiment,
    } => {
      let outcomes = dispatchman.launch(&cluster, Some(limit), experiment.as_deref())?;
      for outcome in &outcomes {
        utils::print_outcome(outcome);
      }
    }
    Commands::Monitor { cluster } => {
      for report in dispatchman.monitor(&cluster)? {
        utils::print_quota(&report);
        println!();
      }
    }
    Commands::List { cluster } => {
      let experiments = dispatchman.list(cluster.as_deref())?;
      if experiments.is_empty() {
        println!("No experiment found");
      }
      for (experiment, counts) in &experiments {
        utils::print_experiment(experiment, counts);
      }
    }
    Commands::Register {
      experiment_config,
      job_config,
      force,
    } => {
      let spec: ExperimentSpec = utils::read_json(&experiment_config)?;
      let job: Value = utils::read_json(&job_config)?;
      let (experiment, registration) = dispatchman.register(&spec, job, force)?;
      match registration {
        Registration::Created(job) => {
          println!("✅ Job {} registered in '{}'", job.id, experiment.name)
        }
        Registration::Existing(job) => {
          println!("Job {} is already registered in '{}'", job.id, experiment.name)
        }
        Registration::Reclaimed(job) => {
          println!("✅ Job {} reset to pending in '{}'", job.id, experiment.name)
        }
      }
    }
    Commands::Start { experiment, id, force } => {
      dispatchman.start_job(&experiment, id, force)?;
      println!("✅ Job {} of '{}' is running", id, experiment);
    }
    Commands::Finish {
      experiment,
      id,
      status,
      results,
    } => {
      let results: Option<Value> = results.as_deref().map(utils::read_json::<Value>).transpose()?;
      let status = Status::from(status);
      dispatchman.finish_job(&experiment, id, status, results)?;
      println!("✅ Job {} of '{}' finished with {}", id, experiment, status);
    }
    Commands::Set { experiment, from, to } => {
      let report = dispatchman.set_jobs(&experiment, from.into(), to.into())?;
      utils::print_batch("Updated", &report);
    }
    Commands::Reset { experiment, from } => {
      let report = dispatchman.reset_jobs(&experiment, from.into())?;
      utils::print_batch("Reset", &report);
    }
    Commands::Remove { name, jobs } => {
      let (removed, deleted) = dispatchman.remove_experiment(&name, jobs)?;
      utils::print_batch("Deleted experiments:", &removed);
      if let Some(deleted) = deleted {
        utils::print_batch("Deleted jobs:", &deleted);
      }
      println!("✅ '{}' removed", name);
    }
  }
  Ok(())
}
