//! User-facing handle over one in-flight request.
//!
//! Returned by value from every asynchronous processor method. Move-only:
//! two handles to the same operation are confusing and error prone, so the
//! type is deliberately not `Clone`.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::request::container::RequestContainer;
use crate::request::request::Request;
use crate::timer::TimerProcessor;

/// Callback invoked when an operation timeout elapses.
pub type TimeoutHandler = Box<dyn FnOnce() + Send + 'static>;

pub struct OperationWaiter {
  request: Option<Arc<Request>>,
}

impl OperationWaiter {
  /// Wraps an in-flight request. A waiter without a request behaves as if
  /// its operation were already done.
  pub fn new(request: Arc<Request>) -> OperationWaiter {
    OperationWaiter { request: Some(request) }
  }

  /// Dummy waiter for operations that completed synchronously.
  pub fn done() -> OperationWaiter {
    OperationWaiter { request: None }
  }

  pub fn is_done(&self) -> bool {
    self.request.as_ref().map(|r| r.is_done()).unwrap_or(true)
  }

  /// Waits until all handlers of the operation have run.
  ///
  /// With `process_ctx` the operation's completion context is drained from
  /// the calling thread, for contexts normally served by this same thread.
  /// Returns `false` when the timeout expired first.
  pub fn wait(&self, process_ctx: bool, timeout: Option<Duration>) -> bool {
    match &self.request {
      Some(request) => request.wait_done(process_ctx, timeout),
      None => true,
    }
  }

  /// Advisory cancel; behavior is defined by the owning processor.
  pub fn cancel(&self) {
    if let Some(request) = &self.request {
      request.cancel();
    }
  }

  /// Forceful abort: the completion handler will not be executed unless its
  /// delivery has already started.
  pub fn abort(&self) {
    if let Some(request) = &self.request {
      request.abort();
    }
  }

  /// Schedules a timeout for the operation on the timer wheel.
  ///
  /// When the timeout elapses first, `handler` is invoked on `ctx` and,
  /// with `cancel_operation`, the operation is canceled. When the operation
  /// finishes first, the timer is canceled.
  pub fn timeout(
    &self,
    timer_processor: &Arc<TimerProcessor>,
    timeout: Duration,
    handler: Option<TimeoutHandler>,
    cancel_operation: bool,
    ctx: Arc<RequestContainer>,
  ) -> Result<()> {
    let Some(request) = &self.request else {
      return Ok(());
    };
    if request.is_done() {
      return Ok(());
    }
    let mut handler = handler;
    let request_for_timer = Arc::clone(request);
    let timer = timer_processor.create_timer(
      timeout,
      Box::new(move || {
        if let Some(handler) = handler.take() {
          handler();
        }
        if cancel_operation {
          request_for_timer.cancel();
        }
        false
      }),
      ctx,
    )?;
    request.set_done_handler(Box::new(move || {
      timer.cancel();
    }));
    Ok(())
  }
}

impl std::fmt::Debug for OperationWaiter {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("OperationWaiter")
      .field("is_done", &self.is_done())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::request::request::ResultCode;
  use crate::request::worker::RequestWorker;
  use std::sync::atomic::{AtomicBool, Ordering};

  #[test]
  fn test_empty_waiter_is_done() {
    let waiter = OperationWaiter::done();
    assert!(waiter.is_done());
    assert!(waiter.wait(false, Some(Duration::from_millis(1))));
  }

  #[test]
  fn test_timeout_cancels_stalled_operation() {
    let timer_processor = TimerProcessor::new();
    timer_processor.enable().unwrap();
    let (worker, container) = RequestWorker::single("op waiter ctx");
    worker.enable().unwrap();

    // A request whose processing handler never completes it; the cancel
    // handler performs the completion instead.
    let request = Request::new();
    let canceled = Arc::new(AtomicBool::new(false));
    {
      let request2 = Arc::clone(&request);
      let canceled = Arc::clone(&canceled);
      request
        .set_cancellation_handler(Box::new(move || {
          canceled.store(true, Ordering::SeqCst);
          let _ = request2.complete(ResultCode::Canceled);
        }))
        .unwrap();
    }
    request.set_processing_handler(Box::new(|| {})).unwrap();
    container.submit(Arc::clone(&request)).unwrap();

    let waiter = OperationWaiter::new(Arc::clone(&request));
    waiter
      .timeout(
        &timer_processor,
        Duration::from_millis(100),
        None,
        true,
        Arc::clone(&container),
      )
      .unwrap();

    assert!(waiter.wait(false, Some(Duration::from_secs(2))));
    assert!(canceled.load(Ordering::SeqCst));
    assert_eq!(
      request.status(),
      crate::request::request::Status::Done(ResultCode::Canceled)
    );

    worker.disable();
    timer_processor.disable();
  }

  #[test]
  fn test_completion_cancels_timeout_timer() {
    let timer_processor = TimerProcessor::new();
    timer_processor.enable().unwrap();
    let (worker, container) = RequestWorker::single("op waiter fast");
    worker.enable().unwrap();

    let request = Request::new();
    let r = Arc::clone(&request);
    request
      .set_processing_handler(Box::new(move || {
        r.complete(ResultCode::Ok).unwrap();
      }))
      .unwrap();

    let fired = Arc::new(AtomicBool::new(false));
    let waiter = OperationWaiter::new(Arc::clone(&request));
    {
      let fired = Arc::clone(&fired);
      waiter
        .timeout(
          &timer_processor,
          Duration::from_millis(200),
          Some(Box::new(move || fired.store(true, Ordering::SeqCst))),
          true,
          Arc::clone(&container),
        )
        .unwrap();
    }
    container.submit(Arc::clone(&request)).unwrap();

    assert!(waiter.wait(false, Some(Duration::from_secs(2))));
    std::thread::sleep(Duration::from_millis(400));
    assert!(!fired.load(Ordering::SeqCst));

    worker.disable();
    timer_processor.disable();
  }
}
