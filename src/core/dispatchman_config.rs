use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::database::DEFAULT_BUSY_TIMEOUT;
use crate::core::database::guard::{DEFAULT_ROLLBACK_TIMEOUT, DEFAULT_TIMEOUT};
use crate::core::schedulers::Scheduler;
use crate::core::schedulers::dispatch::{DEFAULT_TEMPLATE, LOCAL_TEMPLATE};

#[cfg(test)]
mod tests;

pub const APP_NAME: &str = "dispatchman";
const CONFIG_NAME: &str = "config";
const DATABASE_FILE: &str = "dispatchman.db";

#[derive(Error, Debug)]
pub enum DispatchmanConfigError {
  #[error("IO Error: {0}")]
  ConfyError(#[from] confy::ConfyError),
  #[error("Could not find a data directory for the database")]
  DataDirNotFound,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DispatchmanConfig {
  pub database_path: Option<PathBuf>,
  pub scheduler: Scheduler,
  pub transaction_timeout_secs: u64,
  pub rollback_timeout_secs: u64,
  pub busy_timeout_ms: u64,
  pub cache_timeout_secs: u64,
  /// Pause between two experiments of a launch pass.
  pub launch_pause_secs: u64,
  pub dispatch_template: String,
  pub local_dispatch_template: String,
}

impl Default for DispatchmanConfig {
  fn default() -> Self {
    DispatchmanConfig {
      database_path: None,
      scheduler: Scheduler::default(),
      transaction_timeout_secs: DEFAULT_TIMEOUT.as_secs(),
      rollback_timeout_secs: DEFAULT_ROLLBACK_TIMEOUT.as_secs(),
      busy_timeout_ms: DEFAULT_BUSY_TIMEOUT.as_millis() as u64,
      cache_timeout_secs: 300,
      launch_pause_secs: 15,
      dispatch_template: DEFAULT_TEMPLATE.to_string(),
      local_dispatch_template: LOCAL_TEMPLATE.to_string(),
    }
  }
}

impl DispatchmanConfig {
  pub fn transaction_timeout(&self) -> Duration {
    Duration::from_secs(self.transaction_timeout_secs)
  }

  pub fn rollback_timeout(&self) -> Duration {
    Duration::from_secs(self.rollback_timeout_secs)
  }

  pub fn busy_timeout(&self) -> Duration {
    Duration::from_millis(self.busy_timeout_ms)
  }

  pub fn cache_timeout(&self) -> Duration {
    Duration::from_secs(self.cache_timeout_secs)
  }

  pub fn launch_pause(&self) -> Duration {
    Duration::from_secs(self.launch_pause_secs)
  }

  /// Template used to hand jobs to the configured scheduler.
  pub fn template(&self) -> &str {
    match self.scheduler {
      Scheduler::Local => &self.local_dispatch_template,
      Scheduler::Slurm | Scheduler::Pbs => &self.dispatch_template,
    }
  }
}

/// Loads the configuration from `path`, or from the user configuration
/// directory. A missing file is created with the defaults.
pub fn load_config(path: Option<&Path>) -> Result<DispatchmanConfig, DispatchmanConfigError> {
  let config = match path {
    Some(path) => confy::load_path(path)?,
    None => confy::load(APP_NAME, CONFIG_NAME)?,
  };
  Ok(config)
}

pub fn store_config(path: Option<&Path>, config: &DispatchmanConfig) -> Result<(), DispatchmanConfigError> {
  match path {
    Some(path) => confy::store_path(path, config)?,
    None => confy::store(APP_NAME, CONFIG_NAME, config)?,
  }
  Ok(())
}

pub fn database_path(config: &DispatchmanConfig) -> Result<PathBuf, DispatchmanConfigError> {
  if let Some(path) = &config.database_path {
    return Ok(path.clone());
  }
  dirs::data_dir()
    .map(|dir| dir.join(APP_NAME).join(DATABASE_FILE))
    .ok_or(DispatchmanConfigError::DataDirNotFound)
}
