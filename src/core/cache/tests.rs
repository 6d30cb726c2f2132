use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::core::cache::{Clock, ResultCache};

struct ManualClock {
  now: Mutex<Instant>,
}

impl ManualClock {
  fn new() -> Arc<Self> {
    Arc::new(ManualClock {
      now: Mutex::new(Instant::now()),
    })
  }

  fn advance(&self, by: Duration) {
    *self.now.lock().unwrap() += by;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> Instant {
    *self.now.lock().unwrap()
  }
}

fn counting(calls: &Arc<AtomicUsize>) -> impl Fn(&String) -> Result<usize, String> + Send + Sync + 'static {
  let calls = Arc::clone(calls);
  move |user: &String| Ok(calls.fetch_add(1, Ordering::SeqCst) + user.len())
}

#[test]
fn results_are_reused_until_the_timeout() {
  let clock = ManualClock::new();
  let cache = Arc::new(ResultCache::with_clock(clock.clone()));
  let calls = Arc::new(AtomicUsize::new(0));
  let queue = cache.memoize("queue", Duration::from_secs(5), counting(&calls));

  let first = queue.call(&"alice".to_string()).unwrap();
  clock.advance(Duration::from_secs(4));
  assert_eq!(queue.call(&"alice".to_string()).unwrap(), first);
  assert_eq!(calls.load(Ordering::SeqCst), 1);

  clock.advance(Duration::from_secs(2));
  queue.call(&"alice".to_string()).unwrap();
  assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn arguments_are_part_of_the_key() {
  let cache = Arc::new(ResultCache::new());
  let calls = Arc::new(AtomicUsize::new(0));
  let queue = cache.memoize("queue", Duration::from_secs(60), counting(&calls));

  queue.call(&"alice".to_string()).unwrap();
  queue.call(&"bob".to_string()).unwrap();
  queue.call(&"alice".to_string()).unwrap();
  assert_eq!(calls.load(Ordering::SeqCst), 2);
  assert_eq!(cache.len(), 2);
}

#[test]
fn errors_are_not_cached() {
  let cache = Arc::new(ResultCache::new());
  let calls = Arc::new(AtomicUsize::new(0));
  let counter = Arc::clone(&calls);
  let failing = cache.memoize("failing", Duration::from_secs(60), move |_: &()| {
    counter.fetch_add(1, Ordering::SeqCst);
    Err::<usize, _>("unreachable".to_string())
  });

  assert!(failing.call(&()).is_err());
  assert!(failing.call(&()).is_err());
  assert_eq!(calls.load(Ordering::SeqCst), 2);
  assert!(cache.is_empty());
}

#[test]
fn collect_evicts_expired_entries() {
  let clock = ManualClock::new();
  let cache = Arc::new(ResultCache::with_clock(clock.clone()));
  let calls = Arc::new(AtomicUsize::new(0));
  let short = cache.memoize("short", Duration::from_secs(5), counting(&calls));
  let long = cache.memoize("long", Duration::from_secs(60), counting(&calls));

  short.call(&"a".to_string()).unwrap();
  long.call(&"a".to_string()).unwrap();
  clock.advance(Duration::from_secs(5));
  cache.collect();
  assert_eq!(cache.len(), 1);

  long.call(&"a".to_string()).unwrap();
  assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn invalidate_clears_a_single_function() {
  let cache = Arc::new(ResultCache::new());
  let calls = Arc::new(AtomicUsize::new(0));
  let queue = cache.memoize("queue", Duration::from_secs(60), counting(&calls));
  let other = cache.memoize("other", Duration::from_secs(60), counting(&calls));

  queue.call(&"a".to_string()).unwrap();
  other.call(&"a".to_string()).unwrap();
  queue.invalidate();
  assert_eq!(cache.len(), 1);

  queue.call(&"a".to_string()).unwrap();
  other.call(&"a".to_string()).unwrap();
  assert_eq!(calls.load(Ordering::SeqCst), 3);
}
