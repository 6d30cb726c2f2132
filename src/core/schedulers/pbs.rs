use once_cell::sync::Lazy;
use regex::Regex;

use super::{QueueEntry, QueueSource, SchedulerError, run_command};

/// Attributes carrying the index range of a job array (Torque, PBS Pro).
const ARRAY_ATTRIBUTES: [&str; 2] = ["job_array_request", "array_indices_submitted"];

static JOB_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Job Id:\s*(\S+)\s*$").unwrap());
static ATTRIBUTE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s+(\S[^=]*?)\s*=\s?(.*)$").unwrap());
static RANGE_RE: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"^(\d+)(?:-(\d+)(?::(\d+))?)?$").unwrap());

pub struct QstatQueue;

impl QueueSource for QstatQueue {
  fn entries(&self, username: Option<&str>) -> Result<Vec<QueueEntry>, SchedulerError> {
    let mut args = vec!["-f"];
    if let Some(username) = username {
      args.extend(["-u", username]);
    }
    parse_qstat(&run_command("qstat", &args)?)
  }
}

/// Parses the full listing printed by `qstat -f`.
pub fn parse_qstat(output: &str) -> Result<Vec<QueueEntry>, SchedulerError> {
  let mut entries: Vec<QueueEntry> = Vec::new();
  let mut last_key: Option<String> = None;

  for line in output.lines() {
    if line.trim().is_empty() {
      continue;
    }
    if let Some(captures) = JOB_ID_RE.captures(line) {
      entries.push(QueueEntry {
        id: captures[1].to_string(),
        array_size: 1,
        ..Default::default()
      });
      last_key = None;
      continue;
    }

    let Some(entry) = entries.last_mut() else {
      return Err(SchedulerError::ParseError(format!("line outside of a job: {line}")));
    };
    if let Some(continued) = line.strip_prefix('\t') {
      // Long values are wrapped onto tab-indented lines.
      let key = last_key
        .as_ref()
        .ok_or_else(|| SchedulerError::ParseError(format!("dangling continuation: {line}")))?;
      if let Some(value) = entry.attributes.get_mut(key) {
        value.push_str(continued.trim_end());
      }
    } else if let Some(captures) = ATTRIBUTE_RE.captures(line) {
      let key = captures[1].to_string();
      entry
        .attributes
        .insert(key.clone(), captures[2].trim_end().to_string());
      last_key = Some(key);
    } else {
      return Err(SchedulerError::ParseError(format!("unrecognized line: {line}")));
    }
  }

  for entry in &mut entries {
    if let Some(request) = ARRAY_ATTRIBUTES
      .iter()
      .find_map(|attribute| entry.attributes.get(*attribute))
    {
      entry.array_size = array_size_of(request)?;
    }
  }
  Ok(entries)
}

/// Number of sub-jobs described by an array request such as `0-9`, `1,3,5-7`,
/// `0-99%10` or `0-10:2`.
pub fn array_size_of(request: &str) -> Result<usize, SchedulerError> {
  let invalid = || SchedulerError::InvalidArrayRequest(request.to_string());
  // A `%n` suffix only limits how many run at once.
  let indices = request.split('%').next().unwrap_or_default().trim();
  if indices.is_empty() {
    return Err(invalid());
  }

  let mut size = 0;
  for range in indices.split(',') {
    let captures = RANGE_RE.captures(range.trim()).ok_or_else(invalid)?;
    let parse = |i: usize| -> Result<Option<usize>, SchedulerError> {
      captures
        .get(i)
        .map(|m| m.as_str().parse::<usize>().map_err(|_| invalid()))
        .transpose()
    };
    let start = parse(1)?.ok_or_else(invalid)?;
    let end = parse(2)?.unwrap_or(start);
    let step = parse(3)?.unwrap_or(1);
    if end < start || step == 0 {
      return Err(invalid());
    }
    size += (end - start) / step + 1;
  }
  Ok(size)
}
