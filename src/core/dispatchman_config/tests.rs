use std::path::PathBuf;

use crate::core::dispatchman_config::*;
use crate::core::schedulers::Scheduler;

#[test]
fn missing_config_file_is_created_with_defaults() {
  let temp_dir = tempfile::tempdir().unwrap();
  let path = temp_dir.path().join("dispatchman.toml");
  let config = load_config(Some(&path)).unwrap();
  assert_eq!(config, DispatchmanConfig::default());
  assert!(path.exists());
  assert_eq!(config.transaction_timeout().as_secs(), 300);
  assert_eq!(config.launch_pause().as_secs(), 15);
}

#[test]
fn set_and_get_config() {
  let temp_dir = tempfile::tempdir().unwrap();
  let path = temp_dir.path().join("dispatchman.toml");
  let config = DispatchmanConfig {
    database_path: Some(temp_dir.path().join("jobs.db")),
    scheduler: Scheduler::Slurm,
    cache_timeout_secs: 30,
    ..Default::default()
  };
  store_config(Some(&path), &config).unwrap();

  let loaded = load_config(Some(&path)).unwrap();
  assert_eq!(loaded, config);
  assert_eq!(database_path(&loaded).unwrap(), temp_dir.path().join("jobs.db"));
}

#[test]
fn template_follows_the_scheduler() {
  let mut config = DispatchmanConfig::default();
  assert!(config.template().starts_with("jobdispatch"));
  config.scheduler = Scheduler::Local;
  assert!(config.template().starts_with("jobman"));
}

#[test]
fn database_defaults_to_the_data_directory() {
  let config = DispatchmanConfig::default();
  if let Some(data_dir) = dirs::data_dir() {
    let expected: PathBuf = data_dir.join(APP_NAME).join("dispatchman.db");
    assert_eq!(database_path(&config).unwrap(), expected);
  }
}
