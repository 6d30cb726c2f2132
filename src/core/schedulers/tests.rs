use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::cache::ResultCache;
use crate::core::schedulers::dispatch::DEFAULT_TEMPLATE;
use crate::core::schedulers::*;

const QSTAT: &str = "\
Job Id: 1234.helios
    Job_Name = mnist
    Job_Owner = alice@helios
    job_state = R
    Variable_List = PBS_O_HOME=/home/alice,PBS_O_LANG=en_US.UTF-8,
\tPBS_O_WORKDIR=/home/alice
    job_array_request = 0-9%4

Job Id: 1235.helios
    Job_Name = cifar
    job_state = Q

";

#[test]
fn qstat_output_is_parsed_into_entries() {
  let entries = parse_qstat(QSTAT).unwrap();
  assert_eq!(entries.len(), 2);
  assert_eq!(entries[0].id, "1234.helios");
  assert_eq!(entries[0].array_size, 10);
  assert_eq!(
    entries[0].attributes.get("Variable_List").map(String::as_str),
    Some("PBS_O_HOME=/home/alice,PBS_O_LANG=en_US.UTF-8,PBS_O_WORKDIR=/home/alice")
  );
  assert_eq!(entries[1].attributes.get("job_state").map(String::as_str), Some("Q"));
  assert_eq!(entries[1].array_size, 1);

  let keys: Vec<&String> = entries[0].attributes.keys().collect();
  assert_eq!(keys[0], "Job_Name");
}

#[test]
fn empty_qstat_output_has_no_entries() {
  assert!(parse_qstat("").unwrap().is_empty());
  assert!(parse_qstat("\n\n").unwrap().is_empty());
}

#[test]
fn malformed_qstat_output_is_rejected() {
  assert!(matches!(
    parse_qstat("    job_state = R\n"),
    Err(SchedulerError::ParseError(_))
  ));
  assert!(matches!(
    parse_qstat("Job Id: 1.helios\ngarbage\n"),
    Err(SchedulerError::ParseError(_))
  ));
}

#[test]
fn array_requests_are_counted() {
  assert_eq!(array_size_of("0-9").unwrap(), 10);
  assert_eq!(array_size_of("5").unwrap(), 1);
  assert_eq!(array_size_of("1,3,5-7").unwrap(), 5);
  assert_eq!(array_size_of("0-99%10").unwrap(), 100);
  assert_eq!(array_size_of("0-10:2").unwrap(), 6);
  assert!(matches!(array_size_of("9-0"), Err(SchedulerError::InvalidArrayRequest(_))));
  assert!(array_size_of("a-b").is_err());
  assert!(array_size_of("").is_err());
}

#[test]
fn squeue_output_counts_one_per_line() {
  let entries = parse_squeue("  101_1\n101_2\n\n102\n");
  let ids: Vec<&str> = entries.iter().map(|entry| entry.id.as_str()).collect();
  assert_eq!(ids, vec!["101_1", "101_2", "102"]);
  assert!(entries.iter().all(|entry| entry.array_size == 1));
}

#[test]
fn scheduler_names_parse_case_insensitively() {
  assert_eq!(Scheduler::from_str("pbs").unwrap(), Scheduler::Pbs);
  assert_eq!(Scheduler::from_str("Slurm").unwrap(), Scheduler::Slurm);
  assert_eq!(Scheduler::default(), Scheduler::Pbs);
  assert!(get_queue_source(Scheduler::Local).entries(Some("alice")).unwrap().is_empty());
}

struct CountingQueue {
  calls: AtomicUsize,
}

impl QueueSource for CountingQueue {
  fn entries(&self, username: Option<&str>) -> Result<Vec<QueueEntry>, SchedulerError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let size = if username.is_some() { 2 } else { 5 };
    Ok(vec![QueueEntry {
      id: "1".to_string(),
      array_size: size,
      ..Default::default()
    }])
  }
}

#[test]
fn cached_queue_source_reuses_answers_until_refreshed() {
  let inner = Arc::new(CountingQueue {
    calls: AtomicUsize::new(0),
  });
  let cache = Arc::new(ResultCache::new());
  let queue = CachedQueueSource::new(inner.clone(), &cache, Duration::from_secs(60));

  assert_eq!(queue.count_submitted(Some("alice")).unwrap(), 2);
  assert_eq!(queue.count_submitted(Some("alice")).unwrap(), 2);
  assert_eq!(queue.count_submitted(None).unwrap(), 5);
  assert_eq!(inner.calls.load(Ordering::SeqCst), 2);

  queue.refresh();
  queue.count_submitted(Some("alice")).unwrap();
  assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
}

fn request() -> DispatchRequest<'static> {
  DispatchRequest {
    cluster: "helios",
    root: "/scratch/mnist",
    duree: "2:00:00",
    mem: "4000",
    env: "",
    gpu: true,
    count: 3,
    table: "mnist_jobs",
    database: "/tmp/dispatchman.db",
  }
}

#[test]
fn dispatch_templates_are_rendered() {
  let dispatcher = CommandDispatcher::new(DEFAULT_TEMPLATE);
  assert_eq!(
    dispatcher.render(&request()),
    "jobdispatch --gpu --duree=2:00:00 --mem=4000 --env= --repeat_jobs=3 \
     jobman sql sqlite:////tmp/dispatchman.db?table=mnist_jobs /scratch/mnist"
  );

  let custom = CommandDispatcher::new("run {cluster} {unknown} {count}");
  assert_eq!(custom.render(&request()), "run helios {unknown} 3");
}

#[test]
fn dispatch_reports_command_failures() {
  let ok = CommandDispatcher::new("true {count}");
  assert!(ok.submit(&request()).is_ok());

  let failing = CommandDispatcher::new("echo no room on {cluster} >&2; exit 3");
  match failing.submit(&request()) {
    Err(DispatchError::Failed { stderr, .. }) => assert_eq!(stderr, "no room on helios"),
    other => panic!("unexpected result: {:?}", other),
  }
}
