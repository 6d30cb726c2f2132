pub mod admission;
pub mod cache;
pub mod database;
pub mod dispatchman_config;
pub mod experiments;
pub mod jobs;
pub mod schedulers;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::Value;

use crate::core::admission::{AdmissionController, AdmissionOutcome, QuotaReport};
use crate::core::cache::ResultCache;
use crate::core::database::guard::{CancellationToken, TransactionGuard};
use crate::core::database::{BatchReport, Database, Record};
use crate::core::dispatchman_config::DispatchmanConfig;
use crate::core::experiments::{Experiment, ExperimentSpec};
use crate::core::jobs::dedup::Registration;
use crate::core::jobs::{JobCounts, StateKind, Status};
use crate::core::schedulers::{CachedQueueSource, CommandDispatcher, Dispatcher, QueueSource};

pub struct Dispatchman {
  db: Database,
  config: DispatchmanConfig,
  cache: Arc<ResultCache>,
  queue: Box<dyn QueueSource>,
  dispatcher: Box<dyn Dispatcher>,
  username: String,
  cancel: CancellationToken,
}

#[derive(thiserror::Error, Debug)]
pub enum DispatchmanError {
  #[error("Storage Error: {0}")]
  StorageError(#[from] database::StorageError),
  #[error("Config Error: {0}")]
  ConfigError(#[from] dispatchman_config::DispatchmanConfigError),
  #[error("Experiment Error: {0}")]
  ExperimentError(#[from] experiments::ExperimentError),
  #[error("Job Error: {0}")]
  JobError(#[from] jobs::JobError),
  #[error("Scheduler Error: {0}")]
  SchedulerError(#[from] schedulers::SchedulerError),
  #[error("Admission Error: {0}")]
  AdmissionError(#[from] admission::AdmissionError),
  #[error("No experiment is configured for cluster {0}")]
  NoExperiments(String),
}

impl Dispatchman {
  /// Opens the configured database and talks to the configured scheduler as the current user.
  pub fn new(config: DispatchmanConfig, cancel: CancellationToken) -> Result<Self, DispatchmanError> {
    let path = dispatchman_config::database_path(&config)?;
    let guard = TransactionGuard::new(config.transaction_timeout(), config.rollback_timeout(), cancel.clone());
    let db = Database::with_options(&path, guard, config.busy_timeout())?;

    let cache = Arc::new(ResultCache::new());
    let source = schedulers::get_queue_source(config.scheduler);
    let queue = CachedQueueSource::new(source, &cache, config.cache_timeout());
    let dispatcher = CommandDispatcher::new(config.template());
    let username = schedulers::current_username()?;
    debug!("Running as {} with the {} scheduler", username, config.scheduler);

    let mut dispatchman =
      Self::with_collaborators(db, config, Box::new(queue), Box::new(dispatcher), username, cancel);
    // Shared with the queue memoizer.
    dispatchman.cache = cache;
    Ok(dispatchman)
  }

  /// Assembles a facade from explicit collaborators.
  pub fn with_collaborators(
    db: Database,
    config: DispatchmanConfig,
    queue: Box<dyn QueueSource>,
    dispatcher: Box<dyn Dispatcher>,
    username: impl Into<String>,
    cancel: CancellationToken,
  ) -> Self {
    Dispatchman {
      db,
      config,
      cache: Arc::new(ResultCache::new()),
      queue,
      dispatcher,
      username: username.into(),
      cancel,
    }
  }

  pub fn database(&self) -> &Database {
    &self.db
  }

  fn collect_cache(&self) {
    self.cache.collect();
    if !self.cache.is_empty() {
      debug!("{} cached results are still fresh", self.cache.len());
    }
  }

  fn controller(&self) -> AdmissionController<'_> {
    AdmissionController::new(
      &self.db,
      self.queue.as_ref(),
      self.dispatcher.as_ref(),
      self.username.as_str(),
      self.cancel.clone(),
    )
  }

  fn cluster_experiments(&self, cluster: &str, name: Option<&str>) -> Result<Vec<Experiment>, DispatchmanError> {
    let experiments: Vec<Experiment> = experiments::load_experiments(&self.db, Some(cluster), None)?
      .into_iter()
      .filter(|experiment| name.is_none_or(|name| experiment.name == name))
      .collect();
    if experiments.is_empty() {
      return Err(DispatchmanError::NoExperiments(cluster.to_string()));
    }
    Ok(experiments)
  }

  /// Experiments with the number of jobs in each state.
  pub fn list(&self, cluster: Option<&str>) -> Result<Vec<(Experiment, JobCounts)>, DispatchmanError> {
    experiments::load_experiments(&self.db, cluster, None)?
      .into_iter()
      .map(|experiment| -> Result<_, DispatchmanError> {
        let jobs = jobs::load_jobs(&self.db, &experiment.table, None)?;
        Ok((experiment, JobCounts::from_jobs(&jobs)))
      })
      .collect()
  }

  /// Quotas of every experiment on `cluster`, without dispatching.
  pub fn monitor(&self, cluster: &str) -> Result<Vec<QuotaReport>, DispatchmanError> {
    self.collect_cache();
    let controller = self.controller();
    self
      .cluster_experiments(cluster, None)?
      .iter()
      .map(|experiment| -> Result<_, DispatchmanError> {
        Ok(controller.evaluate(cluster, experiment, None)?)
      })
      .collect()
  }

  /// One admission pass over the experiments of `cluster`.
  pub fn launch(
    &self,
    cluster: &str,
    limit: Option<u64>,
    experiment: Option<&str>,
  ) -> Result<Vec<AdmissionOutcome>, DispatchmanError> {
    self.collect_cache();
    let experiments = self.cluster_experiments(cluster, experiment)?;
    info!("Admission pass over {} experiments on {}", experiments.len(), cluster);
    Ok(
      self
        .controller()
        .run_pass(cluster, experiments, limit, self.config.launch_pause())?,
    )
  }

  /// Saves the experiment and registers one job configuration in it.
  pub fn register(
    &self,
    spec: &ExperimentSpec,
    job: Value,
    force: bool,
  ) -> Result<(Experiment, Registration), DispatchmanError> {
    let experiment = experiments::save_experiment(&self.db, spec)?;
    let registration = jobs::dedup::register_job(&self.db, &experiment.table, job, force)?;
    Ok((experiment, registration))
  }

  pub fn start_job(&self, experiment: &str, id: i32, force: bool) -> Result<Record, DispatchmanError> {
    let experiment = experiments::load_experiment(&self.db, experiment)?;
    Ok(jobs::start_job(&self.db, &experiment.table, id, force)?)
  }

  pub fn finish_job(
    &self,
    experiment: &str,
    id: i32,
    status: Status,
    results: Option<Value>,
  ) -> Result<Record, DispatchmanError> {
    let experiment = experiments::load_experiment(&self.db, experiment)?;
    Ok(jobs::finish_job(&self.db, &experiment.table, id, status, results)?)
  }

  pub fn set_jobs(&self, experiment: &str, from: StateKind, to: Status) -> Result<BatchReport, DispatchmanError> {
    let experiment = experiments::load_experiment(&self.db, experiment)?;
    Ok(jobs::set_jobs(&self.db, &experiment.table, from, to)?)
  }

  pub fn reset_jobs(&self, experiment: &str, from: StateKind) -> Result<BatchReport, DispatchmanError> {
    let experiment = experiments::load_experiment(&self.db, experiment)?;
    Ok(jobs::reset_jobs(&self.db, &experiment.table, from)?)
  }

  /// Deletes the experiment and, when `with_jobs` is set, its jobs too.
  pub fn remove_experiment(
    &self,
    name: &str,
    with_jobs: bool,
  ) -> Result<(BatchReport, Option<BatchReport>), DispatchmanError> {
    let experiment = experiments::load_experiment(&self.db, name)?;
    info!("Deleting {}...", name);
    let removed = experiments::delete_experiments(&self.db, std::slice::from_ref(&experiment))?;
    if !with_jobs {
      return Ok((removed, None));
    }
    let jobs = jobs::load_jobs(&self.db, &experiment.table, None)?;
    info!("Deleting {} jobs...", jobs.len());
    let deleted = self.db.delete(&experiment.table, &jobs)?;
    if !deleted.all_succeeded() {
      warn!("{} jobs of {} could not be deleted", deleted.failed().len(), name);
    }
    Ok((removed, Some(deleted)))
  }
}
