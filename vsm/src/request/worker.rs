//! A dedicated thread serving one or more request containers.
//!
//! Workers never steal from each other: each owns its containers and pulls
//! requests off them in a loop until disabled. A worker can host several
//! containers (for example a processor plus a completion context) which then
//! share a single waiter.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crate::error::{Error, Result};
use crate::request::container::RequestContainer;
use crate::request::waiter::RequestWaiter;
use crate::sync::Mutex;

pub struct RequestWorker {
  name: String,
  waiter: Arc<RequestWaiter>,
  containers: Vec<Arc<RequestContainer>>,
  is_enabled: AtomicBool,
  thread: Mutex<Option<JoinHandle<()>>>,
}

impl RequestWorker {
  /// Creates a worker hosting the given containers. All containers must
  /// share the worker's waiter, which is how submissions wake the thread.
  pub fn new(
    name: impl Into<String>,
    waiter: Arc<RequestWaiter>,
    containers: Vec<Arc<RequestContainer>>,
  ) -> Arc<RequestWorker> {
    Arc::new(RequestWorker {
      name: name.into(),
      waiter,
      containers,
      is_enabled: AtomicBool::new(false),
      thread: Mutex::new(None),
    })
  }

  /// Convenience constructor: one processor container served by one thread.
  pub fn single(name: impl Into<String>) -> (Arc<RequestWorker>, Arc<RequestContainer>) {
    let name = name.into();
    let waiter = RequestWaiter::new();
    let container =
      RequestContainer::processor_with_waiter(name.clone(), Arc::clone(&waiter));
    let worker =
      Self::new(name, waiter, vec![Arc::clone(&container)]);
    (worker, container)
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn waiter(&self) -> &Arc<RequestWaiter> {
    &self.waiter
  }

  pub fn containers(&self) -> &[Arc<RequestContainer>] {
    &self.containers
  }

  pub fn is_enabled(&self) -> bool {
    self.is_enabled.load(Ordering::Acquire)
  }

  /// Enables the hosted containers and starts the processing thread.
  pub fn enable(self: &Arc<Self>) -> Result<()> {
    if self.is_enabled.swap(true, Ordering::AcqRel) {
      return Err(Error::InvalidOp("worker already enabled"));
    }
    for container in &self.containers {
      container.enable()?;
    }
    let worker = Arc::clone(self);
    let handle = thread::Builder::new()
      .name(self.name.clone())
      .spawn(move || worker.processing_loop())
      .map_err(|e| Error::Internal(format!("worker thread spawn: {e}")))?;
    *self.thread.lock() = Some(handle);
    Ok(())
  }

  /// Disables the hosted containers (draining their queues) and joins the
  /// processing thread.
  pub fn disable(&self) {
    if !self.is_enabled.swap(false, Ordering::AcqRel) {
      return;
    }
    for container in &self.containers {
      container.disable();
    }
    self.waiter.notify();
    if let Some(handle) = self.thread.lock().take() {
      let _ = handle.join();
    }
  }

  fn processing_loop(&self) {
    while self.is_enabled() {
      self.waiter.wait_and_process(&self.containers, None, 0, None);
    }
    let leftover: usize =
      self.containers.iter().map(|c| c.pending_len()).sum();
    if leftover != 0 {
      tracing::debug!(
        worker = %self.name,
        leftover,
        "requests still queued after processing loop exit"
      );
    }
  }
}

impl Drop for RequestWorker {
  fn drop(&mut self) {
    debug_assert!(
      !self.is_enabled(),
      "worker must be disabled before drop"
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::request::request::{Request, ResultCode};
  use std::sync::atomic::AtomicUsize;
  use std::sync::mpsc;
  use std::time::Duration;

  #[test]
  fn test_worker_processes_submissions() {
    let (worker, container) = RequestWorker::single("test worker");
    worker.enable().unwrap();

    let (tx, rx) = mpsc::channel();
    for i in 0..8 {
      let request = Request::new();
      let tx = tx.clone();
      let r = Arc::clone(&request);
      request
        .set_processing_handler(Box::new(move || {
          tx.send(i).unwrap();
          r.complete(ResultCode::Ok).unwrap();
        }))
        .unwrap();
      container.submit(request).unwrap();
    }
    let mut got = Vec::new();
    for _ in 0..8 {
      got.push(rx.recv_timeout(Duration::from_secs(2)).unwrap());
    }
    assert_eq!(got, (0..8).collect::<Vec<_>>());
    worker.disable();
  }

  #[test]
  fn test_completion_runs_on_completion_container() {
    let waiter = RequestWaiter::new();
    let processor = RequestContainer::processor_with_waiter(
      "proc",
      Arc::clone(&waiter),
    );
    let completion = RequestContainer::completion_context_with_waiter(
      "comp",
      Arc::clone(&waiter),
    );
    let worker = RequestWorker::new(
      "combined",
      waiter,
      vec![Arc::clone(&processor), Arc::clone(&completion)],
    );
    worker.enable().unwrap();

    let completions = Arc::new(AtomicUsize::new(0));
    let request = Request::new();
    let r = Arc::clone(&request);
    request
      .set_processing_handler(Box::new(move || {
        r.complete(ResultCode::Ok).unwrap();
      }))
      .unwrap();
    {
      let completions = Arc::clone(&completions);
      request
        .set_completion_handler(
          Arc::clone(&completion),
          Box::new(move || {
            completions.fetch_add(1, Ordering::SeqCst);
          }),
        )
        .unwrap();
    }
    processor.submit(Arc::clone(&request)).unwrap();

    assert!(request.wait_done(false, Some(Duration::from_secs(2))));
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    worker.disable();
  }

  #[test]
  fn test_disable_is_idempotent() {
    let (worker, _container) = RequestWorker::single("idem");
    worker.enable().unwrap();
    worker.disable();
    worker.disable();
  }
}
