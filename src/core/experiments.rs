#[cfg(test)]
mod tests;

use std::collections::BTreeMap;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::database::{
  BatchReport, Database, Filter, Record, RowId, RowUpdate, StorageError, filter_eq,
  validate_table_name,
};

pub const EXPERIMENTS_TABLE: &str = "experiments";

const REQUIRED_CLUSTER_OPTIONS: [&str; 3] = ["root", "max_running", "max_queued"];
const RESOURCE_HINTS: [&str; 3] = ["duree", "mem", "env"];
/// Resource hint value meaning "use the experiment default".
pub const INHERIT: &str = "null";

#[derive(Error, Debug)]
pub enum ExperimentError {
  #[error("Storage Error: {0}")]
  StorageError(#[from] StorageError),
  #[error("Required options are missing for cluster {cluster}: {missing:?}")]
  MissingClusterOptions { cluster: String, missing: Vec<String> },
  #[error("Options are defined neither for cluster {cluster} nor as experiment defaults: {missing:?}")]
  MissingDefaults { cluster: String, missing: Vec<String> },
  #[error("Cluster {cluster} inherits {option} but experiment {experiment} has no default for it")]
  UnresolvedDefault {
    experiment: String,
    cluster: String,
    option: String,
  },
  #[error("No experiment named \"{0}\"")]
  NotFound(String),
  #[error("Malformed experiment ({id}): {reason}")]
  Malformed { id: i32, reason: String },
}

/// Experiment definition as written by an operator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ExperimentSpec {
  #[serde(alias = "experiment_name")]
  pub name: String,
  /// Job table; derived from the name when absent.
  #[serde(default)]
  pub table: Option<String>,
  /// Left unchanged on an existing experiment when absent.
  #[serde(default)]
  pub gpu: Option<bool>,
  #[serde(default)]
  pub duree: Option<String>,
  #[serde(default)]
  pub mem: Option<String>,
  #[serde(default)]
  pub env: Option<String>,
  #[serde(default)]
  pub clusters: BTreeMap<String, Map<String, Value>>,
}

impl ExperimentSpec {
  fn defaults(&self) -> Map<String, Value> {
    [("duree", &self.duree), ("mem", &self.mem), ("env", &self.env)]
      .into_iter()
      .filter_map(|(key, value)| value.as_ref().map(|v| (key.to_string(), Value::from(v.as_str()))))
      .collect()
  }
}

/// Cluster options with every inherited resource hint resolved.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClusterOptions {
  pub root: String,
  pub max_running: i64,
  /// Global ceiling for the cluster; 0 means unlimited.
  pub max_queued: i64,
  pub duree: String,
  pub mem: String,
  pub env: String,
  #[serde(flatten)]
  pub extra: BTreeMap<String, Value>,
}

/// A stored experiment, as seen by the admission pass.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Experiment {
  pub id: i32,
  pub name: String,
  pub table: String,
  pub gpu: bool,
  pub clusters: BTreeMap<String, ClusterOptions>,
}

impl RowId for Experiment {
  fn row_id(&self) -> i32 {
    self.id
  }
}

impl Experiment {
  pub fn from_record(record: &Record) -> Result<Self, ExperimentError> {
    let malformed = |reason: &str| ExperimentError::Malformed {
      id: record.id,
      reason: reason.to_string(),
    };
    let name = record
      .get("name")
      .and_then(Value::as_str)
      .ok_or_else(|| malformed("missing name"))?
      .to_string();
    let table = record
      .get("table")
      .and_then(Value::as_str)
      .ok_or_else(|| malformed("missing table"))?
      .to_string();
    let gpu = record.get("gpu").and_then(Value::as_bool).unwrap_or(false);

    let mut clusters = BTreeMap::new();
    if let Some(stored) = record.get("clusters").and_then(Value::as_object) {
      for (cluster, options) in stored {
        let options = options
          .as_object()
          .ok_or_else(|| malformed(&format!("cluster {cluster} is not a mapping")))?;
        let resolved = resolve_cluster(&name, cluster, options, &record.data)?;
        let resolved: ClusterOptions = serde_json::from_value(Value::Object(resolved))
          .map_err(|e| malformed(&format!("cluster {cluster}: {e}")))?;
        clusters.insert(cluster.clone(), resolved);
      }
    }

    Ok(Experiment {
      id: record.id,
      name,
      table,
      gpu,
      clusters,
    })
  }
}

pub fn jobs_table_name(experiment: &str) -> String {
  format!("{experiment}_jobs")
}

fn is_inherited(value: &Value) -> bool {
  value.is_null() || value.as_str() == Some(INHERIT)
}

fn validate_clusters_for_saving(
  clusters: &BTreeMap<String, Map<String, Value>>,
  defaults: &Map<String, Value>,
) -> Result<Map<String, Value>, ExperimentError> {
  let mut valid = Map::new();
  for (name, cluster) in clusters {
    let missing: Vec<String> = REQUIRED_CLUSTER_OPTIONS
      .iter()
      .filter(|key| !cluster.contains_key(**key))
      .map(|key| key.to_string())
      .collect();
    if !missing.is_empty() {
      return Err(ExperimentError::MissingClusterOptions {
        cluster: name.clone(),
        missing,
      });
    }

    let missing: Vec<String> = RESOURCE_HINTS
      .iter()
      .filter(|key| cluster.get(**key).is_none_or(is_inherited) && !defaults.contains_key(**key))
      .map(|key| key.to_string())
      .collect();
    if !missing.is_empty() {
      return Err(ExperimentError::MissingDefaults {
        cluster: name.clone(),
        missing,
      });
    }

    let mut options: Map<String, Value> = RESOURCE_HINTS
      .iter()
      .map(|key| (key.to_string(), Value::from(INHERIT)))
      .collect();
    options.extend(cluster.clone());
    valid.insert(name.clone(), Value::Object(options));
  }
  Ok(valid)
}

fn resolve_cluster(
  experiment: &str,
  cluster: &str,
  options: &Map<String, Value>,
  data: &Value,
) -> Result<Map<String, Value>, ExperimentError> {
  let mut resolved = options.clone();
  for (key, value) in resolved.iter_mut() {
    let value_is_hint = RESOURCE_HINTS.contains(&key.as_str());
    if is_inherited(value) {
      *value = data
        .get(key)
        .filter(|default| !default.is_null())
        .cloned()
        .ok_or_else(|| ExperimentError::UnresolvedDefault {
          experiment: experiment.to_string(),
          cluster: cluster.to_string(),
          option: key.clone(),
        })?;
    }
    // Hints are free-form; numbers such as a memory size are kept as text.
    if value_is_hint && !value.is_string() {
      *value = Value::from(value.to_string());
    }
  }
  Ok(resolved)
}

/// Creates the experiment, or merges the definition into the stored one when
/// an experiment with the same name exists.
pub fn save_experiment(db: &Database, spec: &ExperimentSpec) -> Result<Experiment, ExperimentError> {
  let existing = db.load(EXPERIMENTS_TABLE, Some(&filter_eq("name", spec.name.as_str())), None)?;

  let record = match existing.into_iter().next() {
    Some(stored) => {
      let mut defaults = spec.defaults();
      for key in RESOURCE_HINTS {
        if let Some(value) = stored.get(key).filter(|v| !v.is_null()) {
          defaults.entry(key).or_insert_with(|| value.clone());
        }
      }
      // Supplied options override the stored ones of the same cluster.
      let mut merged = BTreeMap::new();
      for (cluster, options) in &spec.clusters {
        let mut options_with_stored = stored
          .get(&format!("clusters.{cluster}"))
          .and_then(Value::as_object)
          .cloned()
          .unwrap_or_default();
        options_with_stored.extend(options.clone());
        merged.insert(cluster.clone(), options_with_stored);
      }
      let clusters = validate_clusters_for_saving(&merged, &defaults)?;

      let mut set = spec.defaults();
      if let Some(gpu) = spec.gpu {
        set.insert("gpu".to_string(), Value::from(gpu));
      }
      // Written leaf by leaf: clusters left out of `spec` are kept.
      if !clusters.is_empty() {
        set.insert("clusters".to_string(), Value::Object(clusters));
      }
      if !set.is_empty() {
        debug!("Updating experiment {} ({})", spec.name, stored.id);
        let update = RowUpdate::set(Value::Object(set));
        let report = update_experiments(db, std::slice::from_ref(&stored), update)?;
        if let Some((_, reason)) = report.failed().first() {
          return Err(StorageError::OperationError(reason.to_string()).into());
        }
      }
      db.load(EXPERIMENTS_TABLE, None, Some(stored.id))?
        .pop()
        .ok_or_else(|| ExperimentError::NotFound(spec.name.clone()))?
    }
    None => {
      let table = spec
        .table
        .clone()
        .unwrap_or_else(|| jobs_table_name(&spec.name));
      validate_table_name(&table)?;

      let defaults = spec.defaults();
      let clusters = validate_clusters_for_saving(&spec.clusters, &defaults)?;
      let mut data = defaults;
      data.insert("name".to_string(), Value::from(spec.name.as_str()));
      data.insert("table".to_string(), Value::from(table));
      data.insert("gpu".to_string(), Value::from(spec.gpu.unwrap_or(false)));
      data.insert("clusters".to_string(), Value::Object(clusters));
      info!("Creating experiment {}", spec.name);
      db.save(EXPERIMENTS_TABLE, Value::Object(data))?
    }
  };
  Experiment::from_record(&record)
}

/// Loads experiments, optionally only those configured for `cluster`.
pub fn load_experiments(
  db: &Database,
  cluster: Option<&str>,
  filter: Option<&Filter>,
) -> Result<Vec<Experiment>, ExperimentError> {
  let records = db.load(EXPERIMENTS_TABLE, filter, None)?;
  let experiments = records
    .iter()
    .map(Experiment::from_record)
    .collect::<Result<Vec<_>, _>>()?;
  Ok(match cluster {
    Some(cluster) => experiments
      .into_iter()
      .filter(|experiment| experiment.clusters.contains_key(cluster))
      .collect(),
    None => experiments,
  })
}

pub fn load_experiment(db: &Database, name: &str) -> Result<Experiment, ExperimentError> {
  load_experiments(db, None, Some(&filter_eq("name", name)))?
    .into_iter()
    .next()
    .ok_or_else(|| ExperimentError::NotFound(name.to_string()))
}

pub fn update_experiments<R: RowId>(
  db: &Database,
  experiments: &[R],
  update: impl Into<RowUpdate>,
) -> Result<BatchReport, ExperimentError> {
  Ok(db.update(EXPERIMENTS_TABLE, experiments, update)?)
}

/// Deletes the experiment rows only; their job tables are left in place.
pub fn delete_experiments(db: &Database, experiments: &[Experiment]) -> Result<BatchReport, ExperimentError> {
  Ok(db.delete(EXPERIMENTS_TABLE, experiments)?)
}
