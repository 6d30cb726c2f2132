use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

use crate::core::admission::{AdmissionOutcome, QuotaReport};
use crate::core::database::{BatchReport, RowOutcome};
use crate::core::experiments::Experiment;
use crate::core::jobs::JobCounts;

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
  let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
  serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn print_quota(report: &QuotaReport) {
  let occupancy = &report.occupancy;
  println!("{} on {}", report.experiment, report.cluster);
  println!("  waiting jobs:     {}", occupancy.waiting);
  println!("  submitted (user): {}", occupancy.user_submitted);
  if let Some(global) = occupancy.global_submitted {
    println!("  submitted (all):  {}", global);
  }
  println!("  room:             {}", report.quota.room);
  if let Some(global_room) = report.quota.global_room {
    println!("  global room:      {}", global_room);
  }
  println!("  quota:            {}", report.quota.quota);
}

pub fn print_outcome(outcome: &AdmissionOutcome) {
  if let Some(report) = outcome.report() {
    print_quota(report);
  }
  match outcome {
    AdmissionOutcome::Idle(_) => println!("no job to launch"),
    AdmissionOutcome::Dispatched(report, count) => {
      if report.quota.admissible > *count {
        println!("would submit {} new jobs", report.quota.admissible);
      }
      println!("✅ submitted {} new jobs", count);
    }
    AdmissionOutcome::DispatchFailed(_, count, reason) => {
      println!("❌ failed to submit {} jobs: {}", count, reason);
    }
    AdmissionOutcome::Failed(experiment, reason) => {
      println!("❌ {}: {}", experiment, reason);
    }
  }
  println!();
}

pub fn print_experiment(experiment: &Experiment, counts: &JobCounts) {
  let clusters: Vec<&str> = experiment.clusters.keys().map(String::as_str).collect();
  println!("{} ({}) on {}", experiment.name, experiment.table, clusters.join(", "));
  println!(
    "  pending: {}  running: {}  completed: {}  broken: {}  total: {}",
    counts.pending.len(),
    counts.running.len(),
    counts.completed.len(),
    counts.broken.len(),
    counts.total()
  );
  if !counts.unrecognized.is_empty() {
    println!("  unrecognized status: {:?}", counts.unrecognized);
  }
}

pub fn print_batch(action: &str, report: &BatchReport) {
  if report.is_empty() {
    println!("{} nothing, no matching rows", action);
    return;
  }
  println!("{} {} of {} rows", action, report.succeeded().len(), report.len());
  for (id, outcome) in report.outcomes() {
    if let RowOutcome::Failed(reason) = outcome {
      println!("  ❌ row {}: {}", id, reason);
    }
  }
}
