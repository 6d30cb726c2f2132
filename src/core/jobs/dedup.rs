use chrono::Utc;
use log::{debug, warn};
use serde_json::{Value, json};

use super::{JobError, JobState, Status, classify, status_update};
use crate::core::database::codec::CodecError;
use crate::core::database::{Database, LIFECYCLE, Record, StorageError, fingerprint};

/// What registering a job configuration did.
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
  /// No equivalent job existed; a pending one was inserted.
  Created(Record),
  /// An equivalent job is already pending or running.
  Existing(Record),
  /// An equivalent finished or broken job was forced back to pending.
  Reclaimed(Record),
}

impl Registration {
  pub fn record(&self) -> &Record {
    match self {
      Registration::Created(record) | Registration::Existing(record) | Registration::Reclaimed(record) => record,
    }
  }
}

/// Fingerprints an equivalent job would carry if it were pending or running.
pub fn candidate_hashes(state: &Value) -> Vec<String> {
  [Status::Start, Status::Running]
    .into_iter()
    .map(|status| {
      let mut candidate = state.clone();
      candidate[LIFECYCLE] = json!({ "status": status });
      fingerprint(&candidate)
    })
    .collect()
}

/// Registers `config` as a job of `table` unless an equivalent job exists.
///
/// An equivalent job that already finished (or broke) is only put back to
/// pending when `force` is set.
pub fn register_job(
  db: &Database,
  table: &str,
  config: Value,
  force: bool,
) -> Result<Registration, JobError> {
  let mut state = match config {
    Value::Object(map) => map,
    other => {
      return Err(JobError::StorageError(StorageError::Codec(CodecError::NotAMapping(
        other.to_string(),
      ))));
    }
  };
  state.remove("id");
  state.insert(LIFECYCLE.to_string(), json!({ "status": Status::Start }));
  let mut state = Value::Object(state);

  let hashes = candidate_hashes(&state);
  if let Some(job) = db.load_by_hash(table, &hashes)?.into_iter().next() {
    warn!("Job already registered, loading from database");
    return match classify(&job)? {
      JobState::Pending | JobState::Running => Ok(Registration::Existing(job)),
      _ if force => {
        warn!("Job ({}) is neither pending nor running, forcing it back to pending", job.id);
        let report = db.update(table, std::slice::from_ref(&job), status_update(Status::Start))?;
        if let Some((_, reason)) = report.failed().first() {
          return Err(JobError::StorageError(StorageError::OperationError(reason.to_string())));
        }
        let job = db.load(table, None, Some(job.id))?.pop().ok_or_else(|| {
          JobError::StorageError(StorageError::NotFound {
            table: table.to_string(),
            id: job.id,
          })
        })?;
        Ok(Registration::Reclaimed(job))
      }
      _ => Err(JobError::AlreadyFinished(job.id)),
    };
  }

  state[LIFECYCLE]["updated_at"] = Value::from(Utc::now().to_rfc3339());
  let job = db.save(table, state)?;
  debug!("Registered job ({}) in {}", job.id, table);
  Ok(Registration::Created(job))
}
