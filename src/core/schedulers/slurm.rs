use super::{QueueEntry, QueueSource, SchedulerError, run_command};

pub struct SqueueQueue;

impl QueueSource for SqueueQueue {
  fn entries(&self, username: Option<&str>) -> Result<Vec<QueueEntry>, SchedulerError> {
    // `-r` prints one line per array element, so every line counts once.
    let mut args = vec!["-h", "-r", "-o", "%i"];
    if let Some(username) = username {
      args.extend(["-u", username]);
    }
    Ok(parse_squeue(&run_command("squeue", &args)?))
  }
}

pub fn parse_squeue(output: &str) -> Vec<QueueEntry> {
  output
    .lines()
    .map(str::trim)
    .filter(|line| !line.is_empty())
    .map(|id| QueueEntry {
      id: id.to_string(),
      array_size: 1,
      ..Default::default()
    })
    .collect()
}
