//! The unit of asynchronous work.
//!
//! A [`Request`] is a small state machine with up to four attached
//! callbacks: a processing handler invoked by the owning processor, an
//! optional completion handler dispatched on a separate completion
//! container, an optional cancellation handler which lets the processor
//! interrupt in-flight work, and an optional done handler fired once the
//! request reaches a terminal state.
//!
//! Status moves monotonically along a DAG:
//!
//! ```text
//! PENDING ──▶ PROCESSING ──▶ result code ──▶ (completion delivered)
//!    │             │               │
//!    │             └──▶ ABORT_PENDING ──▶ ABORTED
//!    ├──▶ CANCELLATION_PENDING ──▶ CANCELING ──▶ result code
//!    └──▶ ABORTED
//! ```
//!
//! Terminal transitions clear the internal handler and container
//! references, breaking the reference cycles that would otherwise keep a
//! request, its container and the captured closures alive forever.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::request::container::RequestContainer;
use crate::sync::{Condvar, Mutex};

/// Single-shot callback attached to a request.
pub type Handler = Box<dyn FnOnce() + Send + 'static>;

/// Terminal result of a completed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
  Ok,
  Canceled,
  /// Processor-specific code.
  Custom(u32),
}

/// Request lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
  /// Created but not yet picked up by a processor.
  Pending,
  /// Processing handler is running or has run.
  Processing,
  /// Canceled before the processor saw it.
  CancellationPending,
  /// Processor picked the request up after a cancel.
  Canceling,
  /// Aborted while a completion handler still must be released on its
  /// completion container.
  AbortPending,
  Aborted,
  /// Completed with a result code.
  Done(ResultCode),
}

impl Status {
  pub fn is_result(self) -> bool {
    matches!(self, Status::Done(_))
  }
}

struct Inner {
  status: Status,
  processing_handler: Option<Handler>,
  completion_handler: Option<Handler>,
  completion_context: Option<Arc<RequestContainer>>,
  cancellation_handler: Option<Handler>,
  done_handler: Option<Handler>,
  /// Completion has been pushed into the completion container.
  completion_processed: bool,
  /// Completion handler has actually returned.
  completion_delivered: bool,
}

impl Inner {
  fn is_done(&self) -> bool {
    (self.status.is_result() && self.completion_delivered)
      || self.status == Status::Aborted
  }

  /// True once the completion handler has been taken for delivery (or was
  /// never going to be delivered at all). Abort is a no-op past this point.
  fn is_completion_delivering_started(&self) -> bool {
    self.completion_processed && self.completion_handler.is_none()
  }

  /// Drops internal references to break cycles. The completion context and
  /// the captured closures may transitively own the container this request
  /// sits in.
  fn destroy(&mut self) {
    self.processing_handler = None;
    self.completion_handler = None;
    self.cancellation_handler = None;
    self.completion_context = None;
  }
}

/// Asynchronous request, always handled through `Arc<Request>`.
pub struct Request {
  inner: Mutex<Inner>,
  cond: Condvar,
}

impl Request {
  pub fn new() -> Arc<Request> {
    Arc::new(Request {
      inner: Mutex::new(Inner {
        status: Status::Pending,
        processing_handler: None,
        completion_handler: None,
        completion_context: None,
        cancellation_handler: None,
        done_handler: None,
        completion_processed: false,
        completion_delivered: false,
      }),
      cond: Condvar::new(),
    })
  }

  pub fn status(&self) -> Status {
    self.inner.lock().status
  }

  /// A request is done when its completion handler has returned, or when it
  /// was aborted.
  pub fn is_done(&self) -> bool {
    self.inner.lock().is_done()
  }

  pub fn is_completion_delivered(&self) -> bool {
    self.inner.lock().completion_delivered
  }

  pub fn completion_context(&self) -> Option<Arc<RequestContainer>> {
    self.inner.lock().completion_context.clone()
  }

  /// Sets the handler run by the owning processor when the request is
  /// dequeued. Only allowed while the request is pending.
  pub fn set_processing_handler(&self, handler: Handler) -> Result<()> {
    let mut inner = self.inner.lock();
    if inner.status != Status::Pending {
      return Err(Error::InvalidOp("request not in pending state"));
    }
    inner.processing_handler = Some(handler);
    Ok(())
  }

  /// Sets the completion handler together with the container it will be
  /// delivered on. Only allowed while the request is pending.
  pub fn set_completion_handler(
    &self,
    context: Arc<RequestContainer>,
    handler: Handler,
  ) -> Result<()> {
    let mut inner = self.inner.lock();
    if inner.status != Status::Pending {
      return Err(Error::InvalidOp("request not in pending state"));
    }
    inner.completion_context = Some(context);
    inner.completion_handler = Some(handler);
    Ok(())
  }

  /// Sets the handler a processor may use to interrupt in-flight work.
  pub fn set_cancellation_handler(&self, handler: Handler) -> Result<()> {
    let mut inner = self.inner.lock();
    if inner.status != Status::Pending {
      return Err(Error::InvalidOp("request not in pending state"));
    }
    inner.cancellation_handler = Some(handler);
    Ok(())
  }

  /// Sets the handler fired when the request reaches a terminal state.
  ///
  /// Unlike the other setters this may be called at any time; if the
  /// request is already done the handler is invoked immediately on the
  /// calling thread.
  pub fn set_done_handler(&self, handler: Handler) {
    let mut inner = self.inner.lock();
    if inner.is_done() {
      drop(inner);
      handler();
      return;
    }
    inner.done_handler = Some(handler);
  }

  /// Executes one phase of the request.
  ///
  /// Processors call `process(true)` to run the processing handler;
  /// completion containers call `process(false)` to deliver the completion
  /// handler or to finalize an abort. Handlers always run outside the
  /// request lock.
  pub fn process(self: &Arc<Self>, process_request: bool) -> Result<()> {
    let mut inner = self.inner.lock();
    match inner.status {
      Status::Aborted => {
        // Typical when a request is aborted by a third party while still
        // queued in some container.
        return Ok(());
      }
      Status::AbortPending => {
        if process_request {
          // Only the completion pass finalizes the pending abort.
          return Ok(());
        }
        inner.status = Status::Aborted;
        let completion = inner.completion_handler.take();
        inner.destroy();
        let done = inner.done_handler.take();
        self.cond.notify_all();
        drop(inner);
        // Destruction of the user's completion handler may have arbitrary
        // side effects, keep it outside the lock.
        drop(completion);
        if let Some(done) = done {
          done();
        }
        return Ok(());
      }
      _ => {}
    }

    if process_request {
      if inner.status != Status::Pending
        && inner.status != Status::CancellationPending
      {
        return Err(Error::InvalidOp("processing a request in invalid state"));
      }
      let handler = inner
        .processing_handler
        .take()
        .ok_or(Error::NullHandler("processing handler"))?;
      inner.status = if inner.status == Status::Pending {
        Status::Processing
      } else {
        Status::Canceling
      };
      self.cond.notify_all();
      drop(inner);
      handler();
      Ok(())
    } else {
      if !inner.status.is_result() {
        return Err(Error::InvalidOp(
          "completion processed while request has no result",
        ));
      }
      if let Some(handler) = inner.completion_handler.take() {
        let context = inner.completion_context.take();
        drop(inner);
        handler();
        let mut inner = self.inner.lock();
        inner.completion_delivered = true;
        // Wake up operation waiters possibly parked on the context.
        if let Some(ctx) = &context {
          ctx.waiter().notify();
        }
        self.cond.notify_all();
        inner.destroy();
        let done = inner.done_handler.take();
        drop(inner);
        if let Some(done) = done {
          done();
        }
      } else {
        let done = inner.done_handler.take();
        drop(inner);
        if let Some(done) = done {
          done();
        }
      }
      Ok(())
    }
  }

  /// Transitions the request to a result code.
  ///
  /// Legal from `Processing` or `Canceling` only; an abort racing ahead is
  /// silently tolerated. If a completion handler is set the request is
  /// forwarded to its completion container, otherwise the request becomes
  /// done right here.
  pub fn complete(self: &Arc<Self>, code: ResultCode) -> Result<()> {
    let mut inner = self.inner.lock();
    if inner.status == Status::Aborted || inner.status == Status::AbortPending
    {
      return Ok(());
    }
    if inner.status != Status::Processing && inner.status != Status::Canceling
    {
      return Err(Error::InvalidOp("completing a request in invalid state"));
    }
    if inner.completion_processed {
      return Err(Error::InvalidOp("request is already completed"));
    }
    inner.status = Status::Done(code);
    let cancellation = inner.cancellation_handler.take();
    inner.completion_processed = true;
    self.cond.notify_all();

    if let Some(context) = inner.completion_context.clone() {
      drop(inner);
      drop(cancellation);
      context.submit(Arc::clone(self))
    } else {
      inner.completion_delivered = true;
      let done = inner.done_handler.take();
      inner.destroy();
      drop(inner);
      drop(cancellation);
      if let Some(done) = done {
        done();
      }
      Ok(())
    }
  }

  /// Advisory cancellation.
  ///
  /// A pending request is marked so the processor sees the cancel when
  /// dequeuing it; an in-flight one gets its cancellation handler poked.
  /// Honoring the cancel is up to the processor.
  pub fn cancel(&self) {
    let mut inner = self.inner.lock();
    match inner.status {
      Status::Pending => {
        inner.status = Status::CancellationPending;
      }
      Status::Processing => {
        if let Some(handler) = inner.cancellation_handler.take() {
          drop(inner);
          handler();
        }
      }
      _ => {}
    }
  }

  /// Forceful abort: the completion handler will not run.
  ///
  /// If a completion handler exists its destruction is routed through the
  /// completion container (ABORT_PENDING), otherwise the request becomes
  /// ABORTED immediately. The cancellation handler fires if the request was
  /// being processed.
  pub fn abort(self: &Arc<Self>) {
    let mut inner = self.inner.lock();
    if inner.is_completion_delivering_started() || inner.is_done() {
      return;
    }
    let was_processing =
      matches!(inner.status, Status::Processing | Status::Canceling);
    let mut submit_needed = false;
    if inner.completion_handler.is_some() {
      // Release must take place in the completion context. The request may
      // already sit in its queue (completed but not yet delivered).
      inner.status = Status::AbortPending;
      if !inner.completion_processed {
        submit_needed = true;
      }
    } else {
      inner.status = Status::Aborted;
    }

    let cancellation = if was_processing {
      inner.cancellation_handler.take()
    } else {
      None
    };

    // Break possible cyclic references. The completion handler stays in
    // place for the ABORT_PENDING finalization pass.
    let _processing = inner.processing_handler.take();
    let completion_context = inner.completion_context.take();
    inner.cancellation_handler = None;
    if inner.status == Status::Aborted && !submit_needed {
      inner.destroy();
    }
    if let Some(ctx) = &completion_context {
      ctx.waiter().notify();
    }
    self.cond.notify_all();
    let done = inner.done_handler.take();
    drop(inner);

    if let Some(handler) = cancellation {
      handler();
    }
    if let Some(done) = done {
      done();
    }
    if submit_needed {
      let ctx = completion_context
        .expect("abort finalization requires a completion context");
      if let Err(err) = ctx.submit(Arc::clone(self)) {
        tracing::error!(
          container = ctx.name(),
          %err,
          "abort finalization could not be submitted"
        );
      }
    }
  }

  /// Blocks until the request is done.
  ///
  /// With `process_ctx` set and a completion context present, the context
  /// is drained from the calling thread while waiting, which lets a caller
  /// wait on a context it normally serves itself. `None` timeout waits
  /// indefinitely. Returns whether the request finished.
  pub fn wait_done(
    self: &Arc<Self>,
    process_ctx: bool,
    timeout: Option<Duration>,
  ) -> bool {
    let inner = self.inner.lock();
    if inner.is_done() {
      return true;
    }
    let context = inner.completion_context.clone();
    match (process_ctx, context) {
      (true, Some(ctx)) => {
        drop(inner);
        let waiter = Arc::clone(ctx.waiter());
        let request = Arc::clone(self);
        waiter.wait_and_process(
          &[ctx],
          timeout,
          0,
          Some(&move || request.is_done()),
        );
        self.is_done()
      }
      _ => {
        let mut inner = inner;
        match timeout {
          Some(timeout) => {
            let deadline = std::time::Instant::now() + timeout;
            while !inner.is_done() {
              let now = std::time::Instant::now();
              if now >= deadline {
                break;
              }
              let (guard, _) = self.cond.wait_timeout(inner, deadline - now);
              inner = guard;
            }
          }
          None => {
            while !inner.is_done() {
              inner = self.cond.wait(inner);
            }
          }
        }
        inner.is_done()
      }
    }
  }
}

impl std::fmt::Debug for Request {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let inner = self.inner.lock();
    f.debug_struct("Request")
      .field("status", &inner.status)
      .field("completion_processed", &inner.completion_processed)
      .field("completion_delivered", &inner.completion_delivered)
      .finish()
  }
}
