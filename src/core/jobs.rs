pub mod dedup;


use std::str::FromStr;

use chrono::Utc;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strum::{Display, EnumIter, EnumString};
use thiserror::Error;

use crate::core::database::{
  BatchReport, Database, LIFECYCLE_STATUS, Record, RowUpdate, StorageError, filter_eq,
};

/// Sub-tree holding the results reported by a finished job.
pub const RESULTS: &str = "results";
const PROC_STATUS: &str = "proc_status";

/// Stored lifecycle status of a job.
#[derive(
  Serialize, Deserialize, EnumString, Display, EnumIter, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
  Start,    // Registered, waiting for a worker
  Running,  // Picked up by a worker
  Done,     // Finished successfully
  ErrRun,   // Failed while running
  ErrSync,  // Failed while synchronizing results
  ErrStart, // Failed before running
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokenReason {
  Run,
  Sync,
  Start,
}

impl BrokenReason {
  pub fn status(self) -> Status {
    match self {
      BrokenReason::Run => Status::ErrRun,
      BrokenReason::Sync => Status::ErrSync,
      BrokenReason::Start => Status::ErrStart,
    }
  }
}

/// Classification of a job derived from its stored status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
  Pending,
  Running,
  Completed,
  Broken(BrokenReason),
}

impl From<Status> for JobState {
  fn from(status: Status) -> Self {
    match status {
      Status::Start => JobState::Pending,
      Status::Running => JobState::Running,
      Status::Done => JobState::Completed,
      Status::ErrRun => JobState::Broken(BrokenReason::Run),
      Status::ErrSync => JobState::Broken(BrokenReason::Sync),
      Status::ErrStart => JobState::Broken(BrokenReason::Start),
    }
  }
}

/// The four classes a job can be selected by.
#[derive(EnumString, Display, EnumIter, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[strum(serialize_all = "lowercase")]
pub enum StateKind {
  Pending,
  Running,
  Completed,
  Broken,
}

impl JobState {
  pub fn kind(self) -> StateKind {
    match self {
      JobState::Pending => StateKind::Pending,
      JobState::Running => StateKind::Running,
      JobState::Completed => StateKind::Completed,
      JobState::Broken(_) => StateKind::Broken,
    }
  }

  /// Status reached by applying `transition`, if it is allowed from this state.
  pub fn apply(self, transition: Transition) -> Result<Status, JobError> {
    match (self, transition) {
      (JobState::Pending, Transition::Start) => Ok(Status::Running),
      (JobState::Pending, Transition::Fail(BrokenReason::Start)) => Ok(Status::ErrStart),
      (JobState::Running, Transition::Complete) => Ok(Status::Done),
      (JobState::Running, Transition::Fail(reason @ (BrokenReason::Run | BrokenReason::Sync))) => {
        Ok(reason.status())
      }
      (JobState::Running | JobState::Completed | JobState::Broken(_), Transition::Reset) => {
        Ok(Status::Start)
      }
      // Operator override.
      (_, Transition::Set(status)) => Ok(status),
      (from, transition) => Err(JobError::InvalidTransition { from, transition }),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  Start,
  Complete,
  Fail(BrokenReason),
  Reset,
  Set(Status),
}

#[derive(Error, Debug)]
pub enum JobError {
  #[error("Storage Error: {0}")]
  StorageError(#[from] StorageError),
  #[error("Job ({id}) has an unrecognized status: {status}")]
  InvalidState { id: i32, status: String },
  #[error("Cannot apply {transition:?} to a job in state {from:?}")]
  InvalidTransition { from: JobState, transition: Transition },
  #[error("Job ({0}) is already registered and is neither pending nor running")]
  AlreadyFinished(i32),
  #[error("Job ({0}) is not available")]
  NotAvailable(i32),
  #[error("Status {0} does not finish a job")]
  NotAFinalStatus(Status),
}

pub fn status_of(job: &Record) -> Result<Status, JobError> {
  let text = job
    .get(LIFECYCLE_STATUS)
    .and_then(Value::as_str)
    .ok_or_else(|| JobError::InvalidState {
      id: job.id,
      status: job
        .get(LIFECYCLE_STATUS)
        .map(Value::to_string)
        .unwrap_or_else(|| "<missing>".to_string()),
    })?;
  Status::from_str(text).map_err(|_| JobError::InvalidState {
    id: job.id,
    status: text.to_string(),
  })
}

pub fn classify(job: &Record) -> Result<JobState, JobError> {
  status_of(job).map(JobState::from)
}

/// Attribute update that moves a job to `status`.
/// Going back to `Start` also drops the results of the previous run.
pub fn status_update(status: Status) -> RowUpdate {
  let kind = JobState::from(status).kind();
  let update = RowUpdate::set(json!({
    "lifecycle": {
      "status": status,
      "updated_at": Utc::now().to_rfc3339(),
    },
    PROC_STATUS: kind.to_string(),
  }));
  if status == Status::Start {
    update.unset(RESULTS)
  } else {
    update
  }
}

/// Loads the jobs of `table`, optionally restricted to one class.
pub fn load_jobs(db: &Database, table: &str, kind: Option<StateKind>) -> Result<Vec<Record>, JobError> {
  let status = match kind {
    None => return Ok(db.load(table, None, None)?),
    Some(StateKind::Pending) => Status::Start,
    Some(StateKind::Running) => Status::Running,
    Some(StateKind::Completed) => Status::Done,
    Some(StateKind::Broken) => {
      let jobs = db.load(table, None, None)?;
      return Ok(
        jobs
          .into_iter()
          .filter(|job| matches!(classify(job), Ok(JobState::Broken(_))))
          .collect(),
      );
    }
  };
  Ok(db.load(table, Some(&filter_eq(LIFECYCLE_STATUS, status.to_string())), None)?)
}

pub fn count_jobs(db: &Database, table: &str, kind: Option<StateKind>) -> Result<usize, JobError> {
  Ok(load_jobs(db, table, kind)?.len())
}

/// Number of jobs per class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobCounts {
  pub pending: Vec<i32>,
  pub running: Vec<i32>,
  pub completed: Vec<i32>,
  pub broken: Vec<i32>,
  pub unrecognized: Vec<i32>,
}

impl JobCounts {
  pub fn from_jobs(jobs: &[Record]) -> Self {
    let mut counts = JobCounts::default();
    for job in jobs {
      let ids = match classify(job).map(JobState::kind) {
        Ok(StateKind::Pending) => &mut counts.pending,
        Ok(StateKind::Running) => &mut counts.running,
        Ok(StateKind::Completed) => &mut counts.completed,
        Ok(StateKind::Broken) => &mut counts.broken,
        Err(_) => &mut counts.unrecognized,
      };
      ids.push(job.id);
    }
    counts
  }

  pub fn total(&self) -> usize {
    self.pending.len()
      + self.running.len()
      + self.completed.len()
      + self.broken.len()
      + self.unrecognized.len()
  }
}

/// Applies `transition` to every job that allows it. Jobs that do not are
/// reported as failed rows and left untouched.
pub fn transition_jobs(
  db: &Database,
  table: &str,
  jobs: &[Record],
  transition: Transition,
) -> Result<BatchReport, JobError> {
  let mut allowed = Vec::with_capacity(jobs.len());
  let mut target = None;
  let mut rejected = Vec::new();
  for job in jobs {
    match classify(job).and_then(|state| state.apply(transition)) {
      Ok(status) => {
        target = Some(status);
        allowed.push(job.clone());
      }
      Err(e) => {
        warn!("Job ({}) left unchanged: {}", job.id, e);
        rejected.push((job.id, e.to_string()));
      }
    }
  }

  let mut report = match target {
    Some(status) => db.update(table, &allowed, status_update(status))?,
    None => BatchReport::default(),
  };
  for (id, reason) in rejected {
    report.mark_failed(id, reason);
  }
  Ok(report)
}

/// Operator override: moves every job of class `from` to `to`.
pub fn set_jobs(db: &Database, table: &str, from: StateKind, to: Status) -> Result<BatchReport, JobError> {
  let jobs = load_jobs(db, table, Some(from))?;
  debug!("Setting {} {} jobs to {}", jobs.len(), from, to);
  transition_jobs(db, table, &jobs, Transition::Set(to))
}

/// Puts every job of class `from` back to pending.
pub fn reset_jobs(db: &Database, table: &str, from: StateKind) -> Result<BatchReport, JobError> {
  let jobs = load_jobs(db, table, Some(from))?;
  debug!("Resetting {} {} jobs", jobs.len(), from);
  transition_jobs(db, table, &jobs, Transition::Reset)
}

/// Marks a pending job as running. A job in any other state is refused unless `force` is set.
pub fn start_job(db: &Database, table: &str, id: i32, force: bool) -> Result<Record, JobError> {
  let job = load_job(db, table, id)?;
  let transition = match classify(&job)? {
    JobState::Pending => Transition::Start,
    _ if force => {
      warn!("Job ({}) is not available. Forcing it to run", id);
      Transition::Set(Status::Running)
    }
    _ => return Err(JobError::NotAvailable(id)),
  };
  let report = transition_jobs(db, table, std::slice::from_ref(&job), transition)?;
  into_single(db, table, id, report)
}

/// Records the final status of a running job, along with its results.
pub fn finish_job(
  db: &Database,
  table: &str,
  id: i32,
  status: Status,
  results: Option<Value>,
) -> Result<Record, JobError> {
  let transition = match status {
    Status::Done => Transition::Complete,
    Status::ErrRun => Transition::Fail(BrokenReason::Run),
    Status::ErrSync => Transition::Fail(BrokenReason::Sync),
    Status::ErrStart => Transition::Fail(BrokenReason::Start),
    Status::Start | Status::Running => return Err(JobError::NotAFinalStatus(status)),
  };
  let job = load_job(db, table, id)?;
  classify(&job)?.apply(transition)?;

  let mut update = status_update(status);
  if let Some(results) = results {
    update.set[RESULTS] = results;
    update = update.unset(RESULTS);
  }
  db.update(table, std::slice::from_ref(&job), update)
    .map_err(JobError::from)
    .and_then(|report| into_single(db, table, id, report))
}

fn load_job(db: &Database, table: &str, id: i32) -> Result<Record, JobError> {
  db.load(table, None, Some(id))?
    .pop()
    .ok_or_else(|| JobError::StorageError(StorageError::NotFound { table: table.to_string(), id }))
}

fn into_single(db: &Database, table: &str, id: i32, report: BatchReport) -> Result<Record, JobError> {
  if let Some((_, reason)) = report.failed().first() {
    return Err(JobError::StorageError(StorageError::OperationError(reason.to_string())));
  }
  load_job(db, table, id)
}
