use std::process::Command;

use log::{debug, error, info};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use thiserror::Error;

pub const DEFAULT_TEMPLATE: &str = "jobdispatch {gpu} --duree={duree} --mem={mem} --env={env} \
  --repeat_jobs={count} jobman sql sqlite:///{database}?table={table} {root}";
pub const LOCAL_TEMPLATE: &str = "jobman sql -n {count} sqlite:///{database}?table={table} {root}";

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{(\w+)\}").unwrap());

#[derive(Error, Debug)]
pub enum DispatchError {
  #[error("Dispatch command `{command}` failed: {stderr}")]
  Failed { command: String, stderr: String },
  #[error("Could not run dispatch command: {0}")]
  IoError(#[from] std::io::Error),
}

/// Everything needed to hand `count` job slots of one experiment to a cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest<'a> {
  pub cluster: &'a str,
  pub root: &'a str,
  pub duree: &'a str,
  pub mem: &'a str,
  pub env: &'a str,
  pub gpu: bool,
  pub count: u64,
  pub table: &'a str,
  pub database: &'a str,
}

pub trait Dispatcher {
  fn submit(&self, request: &DispatchRequest<'_>) -> Result<(), DispatchError>;
}

/// Dispatches by running a shell command rendered from a template.
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
  template: String,
}

impl CommandDispatcher {
  pub fn new(template: impl Into<String>) -> Self {
    CommandDispatcher {
      template: template.into(),
    }
  }

  /// Fills the `{placeholders}` of the template; unknown ones are left as they are.
  pub fn render(&self, request: &DispatchRequest<'_>) -> String {
    let rendered = PLACEHOLDER_RE.replace_all(&self.template, |captures: &Captures| {
      match &captures[1] {
        "gpu" => (if request.gpu { "--gpu" } else { "" }).to_string(),
        "cluster" => request.cluster.to_string(),
        "root" => request.root.to_string(),
        "duree" => request.duree.to_string(),
        "mem" => request.mem.to_string(),
        "env" => request.env.to_string(),
        "count" => request.count.to_string(),
        "table" => request.table.to_string(),
        "database" => request.database.to_string(),
        _ => captures[0].to_string(),
      }
    });
    rendered.split_whitespace().collect::<Vec<_>>().join(" ")
  }
}

impl Dispatcher for CommandDispatcher {
  fn submit(&self, request: &DispatchRequest<'_>) -> Result<(), DispatchError> {
    let command = self.render(request);
    debug!("Running dispatch command: {}", command);
    let output = Command::new("sh").arg("-c").arg(&command).output()?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stdout.trim().is_empty() {
      info!("{}", stdout.trim_end());
    }
    if !output.status.success() {
      error!("Dispatch to {} failed ({})", request.cluster, output.status);
      return Err(DispatchError::Failed {
        command,
        stderr: stderr.trim().to_string(),
      });
    }
    if !stderr.trim().is_empty() {
      info!("{}", stderr.trim_end());
    }
    Ok(())
  }
}
