
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info};
use rand::seq::SliceRandom;
use thiserror::Error;

use crate::core::database::{Database, StorageError};
use crate::core::database::guard::CancellationToken;
use crate::core::experiments::{ClusterOptions, Experiment};
use crate::core::jobs::{self, JobError, StateKind};
use crate::core::schedulers::{DispatchRequest, Dispatcher, QueueSource, SchedulerError};

const PAUSE_SLICE: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum AdmissionError {
  #[error("Cluster {cluster} is not configured for experiment {experiment}")]
  ClusterNotConfigured { experiment: String, cluster: String },
  #[error("Job Error: {0}")]
  JobError(#[from] JobError),
  #[error("Scheduler Error: {0}")]
  SchedulerError(#[from] SchedulerError),
  #[error("Admission pass interrupted")]
  Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterLimits {
  pub max_running: i64,
  pub max_queued: i64,
}

impl From<&ClusterOptions> for ClusterLimits {
  fn from(options: &ClusterOptions) -> Self {
    ClusterLimits {
      max_running: options.max_running,
      max_queued: options.max_queued,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Occupancy {
  /// Pending jobs of the experiment.
  pub waiting: u64,
  /// Jobs of the current user at the scheduler, all experiments together.
  pub user_submitted: u64,
  /// Jobs of every user; only queried when the cluster has a global ceiling.
  pub global_submitted: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
  pub room: i64,
  pub global_room: Option<i64>,
  /// Quota before the operator limit.
  pub admissible: u64,
  pub quota: u64,
}

fn signed(count: u64) -> i64 {
  i64::try_from(count).unwrap_or(i64::MAX)
}

/// Number of jobs that may be dispatched.
///
/// `quota = max(0, min(waiting, room, global_room))`, then lowered to `limit`
/// when one is given. A `max_queued` of 0 means no global ceiling, and so
/// does a `limit` of 0.
pub fn compute_quota(limits: ClusterLimits, occupancy: Occupancy, limit: Option<u64>) -> Quota {
  let room = limits
    .max_running
    .saturating_sub(signed(occupancy.user_submitted))
    .max(0);
  let mut quota = signed(occupancy.waiting).min(room);

  let global_room = (limits.max_queued > 0).then(|| {
    limits
      .max_queued
      .saturating_sub(signed(occupancy.global_submitted.unwrap_or(0)))
  });
  if let Some(global_room) = global_room {
    quota = quota.min(global_room);
  }

  let admissible = u64::try_from(quota.max(0)).unwrap_or(0);
  let quota = match limit {
    Some(limit) if limit > 0 => admissible.min(limit),
    _ => admissible,
  };
  Quota {
    room,
    global_room,
    admissible,
    quota,
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuotaReport {
  pub experiment: String,
  pub cluster: String,
  pub occupancy: Occupancy,
  pub quota: Quota,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionOutcome {
  Idle(QuotaReport),
  Dispatched(QuotaReport, u64),
  DispatchFailed(QuotaReport, u64, String),
  /// The experiment could not be evaluated; holds its name and the reason.
  Failed(String, String),
}

impl AdmissionOutcome {
  pub fn report(&self) -> Option<&QuotaReport> {
    match self {
      AdmissionOutcome::Idle(report)
      | AdmissionOutcome::Dispatched(report, _)
      | AdmissionOutcome::DispatchFailed(report, _, _) => Some(report),
      AdmissionOutcome::Failed(_, _) => None,
    }
  }
}

fn is_interruption(error: &AdmissionError) -> bool {
  matches!(
    error,
    AdmissionError::Interrupted | AdmissionError::JobError(JobError::StorageError(StorageError::Interrupted))
  )
}

/// Decides how many jobs each experiment may send to a cluster and hands
/// them to the dispatcher.
pub struct AdmissionController<'a> {
  db: &'a Database,
  queue: &'a dyn QueueSource,
  dispatcher: &'a dyn Dispatcher,
  username: String,
  cancel: CancellationToken,
}

impl<'a> AdmissionController<'a> {
  pub fn new(
    db: &'a Database,
    queue: &'a dyn QueueSource,
    dispatcher: &'a dyn Dispatcher,
    username: impl Into<String>,
    cancel: CancellationToken,
  ) -> Self {
    AdmissionController {
      db,
      queue,
      dispatcher,
      username: username.into(),
      cancel,
    }
  }

  fn cluster_options<'e>(
    &self,
    cluster: &str,
    experiment: &'e Experiment,
  ) -> Result<&'e ClusterOptions, AdmissionError> {
    experiment
      .clusters
      .get(cluster)
      .ok_or_else(|| AdmissionError::ClusterNotConfigured {
        experiment: experiment.name.clone(),
        cluster: cluster.to_string(),
      })
  }

  /// Computes the quota of `experiment` on `cluster` without dispatching anything.
  pub fn evaluate(
    &self,
    cluster: &str,
    experiment: &Experiment,
    limit: Option<u64>,
  ) -> Result<QuotaReport, AdmissionError> {
    let options = self.cluster_options(cluster, experiment)?;
    info!("Verifying jobs for experiment \"{}\"", experiment.name);

    let waiting = jobs::count_jobs(self.db, &experiment.table, Some(StateKind::Pending))? as u64;
    let user_submitted = self.queue.count_submitted(Some(&self.username))? as u64;
    let global_submitted = if options.max_queued > 0 {
      Some(self.queue.count_submitted(None)? as u64)
    } else {
      None
    };
    let occupancy = Occupancy {
      waiting,
      user_submitted,
      global_submitted,
    };
    let quota = compute_quota(options.into(), occupancy, limit);
    debug!(
      "{} on {}: waiting {}, submitted {} / {}, global {:?} / {}, quota {}",
      experiment.name,
      cluster,
      waiting,
      user_submitted,
      options.max_running,
      global_submitted,
      options.max_queued,
      quota.quota
    );

    Ok(QuotaReport {
      experiment: experiment.name.clone(),
      cluster: cluster.to_string(),
      occupancy,
      quota,
    })
  }

  /// Evaluates the quota and dispatches that many jobs. A failed dispatch is
  /// reported in the outcome; nothing is written back to the job table.
  pub fn admit(
    &self,
    cluster: &str,
    experiment: &Experiment,
    limit: Option<u64>,
  ) -> Result<AdmissionOutcome, AdmissionError> {
    let report = self.evaluate(cluster, experiment, limit)?;
    let count = report.quota.quota;
    if count == 0 {
      info!("No job to launch for experiment \"{}\"", experiment.name);
      return Ok(AdmissionOutcome::Idle(report));
    }
    if report.quota.admissible > count {
      info!("Would submit {} new jobs", report.quota.admissible);
    }

    let options = self.cluster_options(cluster, experiment)?;
    let request = DispatchRequest {
      cluster,
      root: &options.root,
      duree: &options.duree,
      mem: &options.mem,
      env: &options.env,
      gpu: experiment.gpu,
      count,
      table: &experiment.table,
      database: self.db.location(),
    };
    info!("Submitting {} new jobs for experiment \"{}\"", count, experiment.name);
    match self.dispatcher.submit(&request) {
      Ok(()) => {
        self.queue.refresh();
        Ok(AdmissionOutcome::Dispatched(report, count))
      }
      Err(e) => {
        error!("Could not submit jobs for experiment \"{}\": {}", experiment.name, e);
        Ok(AdmissionOutcome::DispatchFailed(report, count, e.to_string()))
      }
    }
  }

  /// Admits every experiment once, in random order, pausing between them.
  ///
  /// An experiment that fails is reported and the pass moves on; only an
  /// interruption stops it.
  pub fn run_pass(
    &self,
    cluster: &str,
    mut experiments: Vec<Experiment>,
    limit: Option<u64>,
    pause: Duration,
  ) -> Result<Vec<AdmissionOutcome>, AdmissionError> {
    experiments.shuffle(&mut rand::thread_rng());
    let mut outcomes = Vec::with_capacity(experiments.len());
    for (i, experiment) in experiments.iter().enumerate() {
      if self.cancel.is_cancelled() {
        return Err(AdmissionError::Interrupted);
      }
      match self.admit(cluster, experiment, limit) {
        Ok(outcome) => outcomes.push(outcome),
        Err(e) if is_interruption(&e) => return Err(AdmissionError::Interrupted),
        Err(e) => {
          error!("Could not admit experiment \"{}\": {}", experiment.name, e);
          outcomes.push(AdmissionOutcome::Failed(experiment.name.clone(), e.to_string()));
        }
      }
      if i + 1 < experiments.len() {
        self.pause(pause)?;
      }
    }
    Ok(outcomes)
  }

  fn pause(&self, duration: Duration) -> Result<(), AdmissionError> {
    let deadline = Instant::now() + duration;
    loop {
      if self.cancel.is_cancelled() {
        return Err(AdmissionError::Interrupted);
      }
      let left = deadline.saturating_duration_since(Instant::now());
      if left.is_zero() {
        return Ok(());
      }
      thread::sleep(left.min(PAUSE_SLICE));
    }
  }
}
