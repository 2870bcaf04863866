//! FIFO containers of requests.
//!
//! A container pairs a queue with a [`RequestWaiter`] and a name. The two
//! kinds differ only in which request phase they drive: a *processor* runs
//! processing handlers, a *completion context* delivers completion
//! handlers. Disabling a container drains its queue by aborting every
//! remaining request until a fixed point is reached; from then on only
//! aborting requests finalizing their completion may still be submitted.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};
use crate::request::request::{Request, Status};
use crate::request::waiter::RequestWaiter;
use crate::sync::Mutex;

/// Which request phase this container drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
  Processor,
  CompletionContext,
}

pub struct RequestContainer {
  name: String,
  kind: ContainerKind,
  waiter: Arc<RequestWaiter>,
  queue: Mutex<VecDeque<Arc<Request>>>,
  is_enabled: AtomicBool,
  disable_ongoing: AtomicBool,
  abort_ongoing: AtomicBool,
}

impl RequestContainer {
  pub fn processor(name: impl Into<String>) -> Arc<RequestContainer> {
    Self::with_waiter(name, ContainerKind::Processor, RequestWaiter::new())
  }

  pub fn completion_context(name: impl Into<String>) -> Arc<RequestContainer> {
    Self::with_waiter(
      name,
      ContainerKind::CompletionContext,
      RequestWaiter::new(),
    )
  }

  /// Processor sharing a waiter with other containers hosted on one worker.
  pub fn processor_with_waiter(
    name: impl Into<String>,
    waiter: Arc<RequestWaiter>,
  ) -> Arc<RequestContainer> {
    Self::with_waiter(name, ContainerKind::Processor, waiter)
  }

  pub fn completion_context_with_waiter(
    name: impl Into<String>,
    waiter: Arc<RequestWaiter>,
  ) -> Arc<RequestContainer> {
    Self::with_waiter(name, ContainerKind::CompletionContext, waiter)
  }

  fn with_waiter(
    name: impl Into<String>,
    kind: ContainerKind,
    waiter: Arc<RequestWaiter>,
  ) -> Arc<RequestContainer> {
    Arc::new(RequestContainer {
      name: name.into(),
      kind,
      waiter,
      queue: Mutex::new(VecDeque::new()),
      is_enabled: AtomicBool::new(false),
      disable_ongoing: AtomicBool::new(false),
      abort_ongoing: AtomicBool::new(false),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn kind(&self) -> ContainerKind {
    self.kind
  }

  pub fn waiter(&self) -> &Arc<RequestWaiter> {
    &self.waiter
  }

  pub fn is_enabled(&self) -> bool {
    self.is_enabled.load(Ordering::Acquire)
  }

  pub fn has_pending(&self) -> bool {
    !self.queue.lock().is_empty()
  }

  pub fn pending_len(&self) -> usize {
    self.queue.lock().len()
  }

  pub fn enable(&self) -> Result<()> {
    if self.is_enabled.swap(true, Ordering::AcqRel) {
      return Err(Error::InvalidOp("container already enabled"));
    }
    Ok(())
  }

  /// Appends a request and wakes the waiter.
  ///
  /// Submission to a disabled container is permitted only while the queue
  /// is being drained, and only for requests finalizing an abort.
  pub fn submit(&self, request: Arc<Request>) -> Result<()> {
    if !self.is_enabled() {
      if !self.abort_ongoing.load(Ordering::Acquire) {
        return Err(Error::InvalidOp(
          "request submitted to fully disabled container",
        ));
      }
      if request.status() != Status::AbortPending {
        return Err(Error::InvalidOp(
          "non-aborting request submitted to disabled container",
        ));
      }
    }
    self.queue.lock().push_back(request);
    self.waiter.notify();
    Ok(())
  }

  /// Pops and processes up to `limit` requests (zero means unlimited).
  /// Handlers run with no queue lock held.
  pub fn process_requests(&self, limit: usize) -> usize {
    let mut num_processed = 0;
    while limit == 0 || num_processed < limit {
      let request = {
        let mut queue = self.queue.lock();
        match queue.pop_front() {
          Some(request) => request,
          None => break,
        }
      };
      self.process_request(&request);
      num_processed += 1;
    }
    num_processed
  }

  fn process_request(&self, request: &Arc<Request>) {
    let process_request = self.kind == ContainerKind::Processor;
    if let Err(err) = request.process(process_request) {
      tracing::error!(
        container = %self.name,
        %err,
        "request processing failed"
      );
    }
  }

  /// Disables the container and drains its queue.
  ///
  /// Every remaining request is aborted and then given a completion pass to
  /// finalize a pending abort; aborting may enqueue finalization requests,
  /// so draining repeats until the queue stays empty. A repeated disable is
  /// tolerated with a log line.
  pub fn disable(&self) {
    if self.disable_ongoing.swap(true, Ordering::AcqRel) {
      tracing::info!(container = %self.name, "repeated container disable");
      return;
    }
    self.is_enabled.store(false, Ordering::Release);
    self.waiter.notify();
    self.abort_requests();
  }

  fn abort_requests(&self) {
    self.abort_ongoing.store(true, Ordering::Release);
    loop {
      let drained: VecDeque<_> = {
        let mut queue = self.queue.lock();
        std::mem::take(&mut *queue)
      };
      if drained.is_empty() {
        break;
      }
      for request in drained {
        request.abort();
        // Completion pass finalizes a pending abort, a no-op otherwise.
        if let Err(err) = request.process(false) {
          tracing::error!(
            container = %self.name,
            %err,
            "abort finalization failed"
          );
        }
      }
    }
    // New submissions are not allowed after this at all.
    self.abort_ongoing.store(false, Ordering::Release);
  }
}

impl std::fmt::Debug for RequestContainer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RequestContainer")
      .field("name", &self.name)
      .field("kind", &self.kind)
      .field("enabled", &self.is_enabled())
      .field("pending", &self.pending_len())
      .finish()
  }
}
