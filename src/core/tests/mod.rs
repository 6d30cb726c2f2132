use std::cell::RefCell;
use std::rc::Rc;

use serde_json::json;
use tempfile::TempDir;

use crate::core::admission::AdmissionOutcome;
use crate::core::database::guard::CancellationToken;
use crate::core::database::tests::init_database_for_tests;
use crate::core::dispatchman_config::DispatchmanConfig;
use crate::core::experiments::ExperimentSpec;
use crate::core::jobs::dedup::Registration;
use crate::core::jobs::{StateKind, Status};
use crate::core::schedulers::{
  DispatchError, DispatchRequest, Dispatcher, QueueEntry, QueueSource, SchedulerError,
};
use crate::core::{Dispatchman, DispatchmanError};

struct IdleQueue;

impl QueueSource for IdleQueue {
  fn entries(&self, _username: Option<&str>) -> Result<Vec<QueueEntry>, SchedulerError> {
    Ok(Vec::new())
  }
}

struct RecordingDispatcher {
  submitted: Rc<RefCell<Vec<(String, u64)>>>,
}

impl Dispatcher for RecordingDispatcher {
  fn submit(&self, request: &DispatchRequest<'_>) -> Result<(), DispatchError> {
    self
      .submitted
      .borrow_mut()
      .push((request.cluster.to_string(), request.count));
    Ok(())
  }
}

fn init_dispatchman_for_tests() -> (TempDir, Dispatchman, Rc<RefCell<Vec<(String, u64)>>>) {
  let (dir, db) = init_database_for_tests();
  let submitted = Rc::new(RefCell::new(Vec::new()));
  let config = DispatchmanConfig {
    launch_pause_secs: 0,
    ..Default::default()
  };
  let dispatchman = Dispatchman::with_collaborators(
    db,
    config,
    Box::new(IdleQueue),
    Box::new(RecordingDispatcher {
      submitted: Rc::clone(&submitted),
    }),
    "alice",
    CancellationToken::new(),
  );
  (dir, dispatchman, submitted)
}

fn spec(name: &str) -> ExperimentSpec {
  serde_json::from_value(json!({
    "experiment_name": name,
    "duree": "1:00:00", "mem": "2000", "env": "",
    "clusters": { "helios": { "root": "/scratch", "max_running": 3, "max_queued": 0 } },
  }))
  .unwrap()
}

#[test]
fn register_then_launch_dispatches_pending_jobs() {
  let (_dir, dispatchman, submitted) = init_dispatchman_for_tests();
  for seed in 0..5 {
    let (_, registration) = dispatchman
      .register(&spec("mnist"), json!({ "seed": seed }), false)
      .unwrap();
    assert!(matches!(registration, Registration::Created(_)));
  }
  let (_, again) = dispatchman
    .register(&spec("mnist"), json!({ "seed": 0 }), false)
    .unwrap();
  assert!(matches!(again, Registration::Existing(_)));

  let reports = dispatchman.monitor("helios").unwrap();
  assert_eq!(reports.len(), 1);
  assert_eq!(reports[0].occupancy.waiting, 5);
  assert_eq!(reports[0].quota.quota, 3);
  assert!(submitted.borrow().is_empty());

  let outcomes = dispatchman.launch("helios", Some(2), None).unwrap();
  assert!(matches!(outcomes[..], [AdmissionOutcome::Dispatched(_, 2)]));
  assert_eq!(*submitted.borrow(), vec![("helios".to_string(), 2)]);
}

#[test]
fn launch_without_experiments_fails() {
  let (_dir, dispatchman, _) = init_dispatchman_for_tests();
  dispatchman.register(&spec("mnist"), json!({ "seed": 1 }), false).unwrap();
  assert!(matches!(
    dispatchman.launch("guillimin", None, None),
    Err(DispatchmanError::NoExperiments(_))
  ));
  assert!(matches!(
    dispatchman.launch("helios", None, Some("cifar")),
    Err(DispatchmanError::NoExperiments(_))
  ));
}

#[test]
fn job_lifecycle_through_the_facade() {
  let (_dir, dispatchman, _) = init_dispatchman_for_tests();
  let (_, registration) = dispatchman
    .register(&spec("mnist"), json!({ "seed": 1 }), false)
    .unwrap();
  let id = registration.record().id;

  dispatchman.start_job("mnist", id, false).unwrap();
  dispatchman
    .finish_job("mnist", id, Status::ErrSync, Some(json!({ "loss": 2.5 })))
    .unwrap();

  let listed = dispatchman.list(None).unwrap();
  assert_eq!(listed.len(), 1);
  assert_eq!(listed[0].1.broken, vec![id]);

  let report = dispatchman.reset_jobs("mnist", StateKind::Broken).unwrap();
  assert_eq!(report.succeeded(), vec![id]);
  let report = dispatchman.set_jobs("mnist", StateKind::Pending, Status::Done).unwrap();
  assert_eq!(report.succeeded(), vec![id]);
  assert_eq!(dispatchman.list(Some("helios")).unwrap()[0].1.completed, vec![id]);
}

#[test]
fn remove_experiment_optionally_keeps_jobs() {
  let (_dir, dispatchman, _) = init_dispatchman_for_tests();
  let (experiment, _) = dispatchman
    .register(&spec("mnist"), json!({ "seed": 1 }), false)
    .unwrap();
  dispatchman.register(&spec("cifar"), json!({ "seed": 1 }), false).unwrap();

  let (removed, jobs) = dispatchman.remove_experiment("mnist", false).unwrap();
  assert!(removed.all_succeeded());
  assert!(jobs.is_none());
  assert_eq!(dispatchman.database().load(&experiment.table, None, None).unwrap().len(), 1);

  let (_, jobs) = dispatchman.remove_experiment("cifar", true).unwrap();
  assert_eq!(jobs.unwrap().succeeded().len(), 1);
  assert!(dispatchman.database().load("cifar_jobs", None, None).unwrap().is_empty());
  assert!(matches!(
    dispatchman.start_job("mnist", 1, false),
    Err(DispatchmanError::ExperimentError(_))
  ));
}
