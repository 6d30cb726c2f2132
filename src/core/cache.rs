#[cfg(test)]
mod tests;

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::debug;
use serde::Serialize;

use crate::core::database::codec;

/// Source of the current time, swappable in tests.
pub trait Clock: Send + Sync {
  fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> Instant {
    Instant::now()
  }
}

struct CachedValue {
  value: Box<dyn Any + Send>,
  stored_at: Instant,
}

struct FunctionCache {
  timeout: Duration,
  entries: HashMap<String, CachedValue>,
}

/// Short-lived memoization of expensive reads, shared by every memoized function.
///
/// Entries are keyed by function name and by the SHA-256 of the canonical JSON
/// of the call arguments. Arguments are plain serializable values; connection
/// handles are never part of a key.
pub struct ResultCache {
  clock: Arc<dyn Clock>,
  functions: Mutex<HashMap<String, FunctionCache>>,
}

impl Default for ResultCache {
  fn default() -> Self {
    Self::new()
  }
}

impl ResultCache {
  pub fn new() -> Self {
    Self::with_clock(Arc::new(SystemClock))
  }

  pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
    ResultCache {
      clock,
      functions: Mutex::new(HashMap::new()),
    }
  }

  fn functions(&self) -> MutexGuard<'_, HashMap<String, FunctionCache>> {
    // Entries are replaced whole, so a poisoned map is still consistent.
    self.functions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Returns the value cached for (`function`, `args`) if it is younger than
  /// `timeout`, otherwise calls `compute` and caches a successful result.
  pub fn get_or_compute<A, T, E, F>(
    &self,
    function: &str,
    timeout: Duration,
    args: &A,
    compute: F,
  ) -> Result<T, E>
  where
    A: Serialize + ?Sized,
    T: Clone + Send + 'static,
    F: FnOnce() -> Result<T, E>,
  {
    let key = match codec::hash_serializable(args) {
      Ok(key) => key,
      Err(e) => {
        debug!("Arguments of {} cannot be cached: {}", function, e);
        return compute();
      }
    };

    if let Some(value) = self.lookup::<T>(function, timeout, &key) {
      debug!("Cache hit for {}", function);
      return Ok(value);
    }

    let value = compute()?;
    let stored_at = self.clock.now();
    let mut functions = self.functions();
    let cache = functions
      .entry(function.to_string())
      .or_insert_with(|| FunctionCache {
        timeout,
        entries: HashMap::new(),
      });
    cache.timeout = timeout;
    cache.entries.insert(
      key,
      CachedValue {
        value: Box::new(value.clone()),
        stored_at,
      },
    );
    Ok(value)
  }

  fn lookup<T: Clone + 'static>(&self, function: &str, timeout: Duration, key: &str) -> Option<T> {
    let now = self.clock.now();
    let functions = self.functions();
    let cached = functions.get(function)?.entries.get(key)?;
    if now.saturating_duration_since(cached.stored_at) >= timeout {
      return None;
    }
    cached.value.downcast_ref::<T>().cloned()
  }

  /// Wraps `function` so that its results are cached for `timeout`.
  pub fn memoize<A, T, E, F>(
    self: &Arc<Self>,
    name: &str,
    timeout: Duration,
    function: F,
  ) -> Memoized<A, T, E>
  where
    F: Fn(&A) -> Result<T, E> + Send + Sync + 'static,
  {
    Memoized {
      name: name.to_string(),
      timeout,
      cache: Arc::clone(self),
      function: Box::new(function),
    }
  }

  /// Evicts every entry older than the timeout of its function.
  pub fn collect(&self) {
    let now = self.clock.now();
    let mut functions = self.functions();
    for cache in functions.values_mut() {
      let timeout = cache.timeout;
      cache
        .entries
        .retain(|_, cached| now.saturating_duration_since(cached.stored_at) < timeout);
    }
  }

  /// Drops every cached result of `function`.
  pub fn invalidate(&self, function: &str) {
    if let Some(cache) = self.functions().get_mut(function) {
      cache.entries.clear();
    }
  }

  pub fn len(&self) -> usize {
    self.functions().values().map(|cache| cache.entries.len()).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// A function whose results go through a [`ResultCache`].
pub struct Memoized<A, T, E> {
  name: String,
  timeout: Duration,
  cache: Arc<ResultCache>,
  function: Box<dyn Fn(&A) -> Result<T, E> + Send + Sync>,
}

impl<A, T, E> Memoized<A, T, E>
where
  A: Serialize,
  T: Clone + Send + 'static,
{
  pub fn call(&self, args: &A) -> Result<T, E> {
    self
      .cache
      .get_or_compute(&self.name, self.timeout, args, || (self.function)(args))
  }

  pub fn invalidate(&self) {
    debug!("Invalidating cached results of {}", self.name);
    self.cache.invalidate(&self.name);
  }
}
