//! Condvar-backed wake/notify primitive shared by request containers.
//!
//! The waiter's mutex carries no data; it only coordinates blocking. The
//! notify side takes the lock before signalling so a submission can never
//! slip between a waiter's emptiness check and its `wait` call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::request::container::RequestContainer;
use crate::sync::{Condvar, Mutex};

pub struct RequestWaiter {
  wait_lock: Mutex<()>,
  cond: Condvar,
}

impl RequestWaiter {
  pub fn new() -> Arc<RequestWaiter> {
    Arc::new(RequestWaiter { wait_lock: Mutex::new(()), cond: Condvar::new() })
  }

  /// Wakes every thread blocked in [`wait_and_process`](Self::wait_and_process).
  pub fn notify(&self) {
    let _guard = self.wait_lock.lock();
    self.cond.notify_all();
  }

  /// Processes requests from `containers` until the predicate turns true,
  /// the timeout expires, or (with no explicit predicate) something was
  /// processed or one of the containers is disabled.
  ///
  /// `requests_limit` caps how many requests one inner round may process;
  /// zero means unlimited. Handlers run with no waiter lock held, so they
  /// are free to submit further requests. Spurious wakeups only cost an
  /// extra predicate evaluation. Returns the number of requests processed.
  pub fn wait_and_process(
    &self,
    containers: &[Arc<RequestContainer>],
    timeout: Option<Duration>,
    requests_limit: usize,
    predicate: Option<&(dyn Fn() -> bool)>,
  ) -> usize {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut total = 0;

    loop {
      let (processed, disabled) =
        Self::process_pending(containers, requests_limit);
      total += processed;

      let done = match predicate {
        Some(predicate) => predicate(),
        None => processed > 0 || disabled,
      };
      if done {
        return total;
      }

      // Idle. Re-check under the lock: a submission that raced with the
      // processing pass above has already pushed its request, so it is
      // visible here; one that has not pushed yet will block in notify()
      // until we are parked in the condvar.
      let guard = self.wait_lock.lock();
      let has_work = containers
        .iter()
        .any(|c| c.has_pending() || !c.is_enabled());
      if has_work {
        continue;
      }
      match deadline {
        None => {
          let _guard = self.cond.wait(guard);
        }
        Some(deadline) => {
          let now = Instant::now();
          if now >= deadline {
            return total;
          }
          let (_guard, timed_out) =
            self.cond.wait_timeout(guard, deadline - now);
          if timed_out {
            // Final pass, mirrors the predicate evaluation a condvar
            // performs on timeout.
            let (processed, _) =
              Self::process_pending(containers, requests_limit);
            return total + processed;
          }
        }
      }
    }
  }

  /// Drains available requests in rounds: processing one request may enqueue
  /// more for the same containers.
  fn process_pending(
    containers: &[Arc<RequestContainer>],
    requests_limit: usize,
  ) -> (usize, bool) {
    let mut num_processed = 0;
    let mut is_disabled = false;
    loop {
      let mut cur_processed = 0;
      for container in containers {
        if !container.is_enabled() {
          is_disabled = true;
          continue;
        }
        let remaining = if requests_limit == 0 {
          0
        } else {
          requests_limit.saturating_sub(num_processed + cur_processed)
        };
        cur_processed += container.process_requests(remaining);
        if requests_limit != 0
          && num_processed + cur_processed >= requests_limit
        {
          break;
        }
      }
      num_processed += cur_processed;
      if cur_processed == 0
        || (requests_limit != 0 && num_processed >= requests_limit)
      {
        break;
      }
    }
    (num_processed, is_disabled)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::request::container::RequestContainer;
  use crate::request::request::{Request, ResultCode};
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::thread;

  #[test]
  fn test_wait_times_out_when_idle() {
    let waiter = RequestWaiter::new();
    let container =
      RequestContainer::processor_with_waiter("idle", Arc::clone(&waiter));
    container.enable().unwrap();

    let start = Instant::now();
    let n = waiter.wait_and_process(
      &[Arc::clone(&container)],
      Some(Duration::from_millis(50)),
      0,
      None,
    );
    assert_eq!(n, 0);
    assert!(start.elapsed() >= Duration::from_millis(50));
    container.disable();
  }

  #[test]
  fn test_submission_wakes_waiter() {
    let waiter = RequestWaiter::new();
    let container =
      RequestContainer::processor_with_waiter("wake", Arc::clone(&waiter));
    container.enable().unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let request = Request::new();
    {
      let hits = Arc::clone(&hits);
      let request2 = Arc::clone(&request);
      request
        .set_processing_handler(Box::new(move || {
          hits.fetch_add(1, Ordering::SeqCst);
          request2.complete(ResultCode::Ok).unwrap();
        }))
        .unwrap();
    }

    let submitter = {
      let container = Arc::clone(&container);
      thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        container.submit(request).unwrap();
      })
    };

    let n = waiter.wait_and_process(
      &[Arc::clone(&container)],
      Some(Duration::from_secs(2)),
      0,
      None,
    );
    submitter.join().unwrap();
    assert_eq!(n, 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    container.disable();
  }

  #[test]
  fn test_requests_limit_bounds_one_round() {
    let waiter = RequestWaiter::new();
    let container =
      RequestContainer::processor_with_waiter("limit", Arc::clone(&waiter));
    container.enable().unwrap();

    for _ in 0..5 {
      let request = Request::new();
      let r = Arc::clone(&request);
      request
        .set_processing_handler(Box::new(move || {
          r.complete(ResultCode::Ok).unwrap();
        }))
        .unwrap();
      container.submit(request).unwrap();
    }

    let n = waiter.wait_and_process(
      &[Arc::clone(&container)],
      Some(Duration::from_millis(100)),
      2,
      None,
    );
    assert_eq!(n, 2);
    assert_eq!(container.pending_len(), 3);
    container.disable();
  }
}
