//! Timer wheel backed by a single dedicated thread.
//!
//! The wheel is an ordered map from millisecond ticks (relative to a
//! process-local monotonic epoch) to timers. Several timers landing on the
//! same tick form an attached chain behind the map entry, keeping the key
//! unique. Each firing travels as a one-shot [`Request`]: the processing
//! handler (wheel thread) re-inserts the timer if it is not yet due, the
//! completion handler (user container) runs the user callback and re-arms
//! the timer when the callback returns `true`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::request::container::RequestContainer;
use crate::request::request::{Request, ResultCode};
use crate::request::waiter::RequestWaiter;
use crate::sync::Mutex;

/// Periodic user callback. Returning `true` re-arms the timer.
pub type TimerHandler = Box<dyn FnMut() -> bool + Send + 'static>;

type TickType = u64;

struct TimerInner {
  interval: Duration,
  fire_time: Instant,
  is_running: bool,
  /// Timers sharing this timer's tick slot.
  attached: VecDeque<Arc<Timer>>,
  request: Option<Arc<Request>>,
  handler: Option<TimerHandler>,
  processor: Weak<TimerProcessor>,
}

pub struct Timer {
  inner: Mutex<TimerInner>,
}

impl Timer {
  fn new(
    processor: &Arc<TimerProcessor>,
    interval: Duration,
    handler: TimerHandler,
  ) -> Arc<Timer> {
    Arc::new(Timer {
      inner: Mutex::new(TimerInner {
        interval,
        fire_time: Instant::now() + interval,
        is_running: true,
        attached: VecDeque::new(),
        request: None,
        handler: Some(handler),
        processor: Arc::downgrade(processor),
      }),
    })
  }

  pub fn is_running(&self) -> bool {
    self.inner.lock().is_running
  }

  fn fire_time(&self) -> Instant {
    self.inner.lock().fire_time
  }

  /// Stops the timer. After this returns the user handler is not invoked
  /// again: a fire already scheduled is aborted, one already delivering is
  /// prevented from re-arming.
  pub fn cancel(self: &Arc<Self>) {
    let inner = self.inner.lock();
    if !inner.is_running {
      return;
    }
    let processor = inner.processor.upgrade();
    drop(inner);
    if let Some(processor) = processor {
      processor.cancel_timer(self);
    }
  }

  /// Delivers attached timers, then completes the timer's request so the
  /// user callback runs on its container.
  fn fire(self: &Arc<Self>) {
    let mut inner = self.inner.lock();
    let attached: Vec<_> = inner.attached.drain(..).collect();
    for timer in &attached {
      timer.fire();
    }
    if !inner.is_running {
      // A canceled timer can still be in the tree if cancellation raced
      // with the wheel popping it.
      return;
    }
    if let Some(request) = inner.request.clone() {
      drop(inner);
      let _ = request.complete(ResultCode::Ok);
    }
  }

  fn destroy(&self, cancel: bool) {
    let mut inner = self.inner.lock();
    if !inner.is_running {
      return;
    }
    inner.is_running = false;
    inner.handler = None;
    debug_assert!(inner.attached.is_empty());
    if let Some(request) = inner.request.take() {
      drop(inner);
      if !cancel || !request.is_completion_delivered() {
        request.abort();
      }
    }
  }

  fn attach(&self, timer: Arc<Timer>) {
    self.inner.lock().attached.push_back(timer);
  }

  fn detach(&self, timer: &Arc<Timer>) {
    self.inner.lock().attached.retain(|t| !Arc::ptr_eq(t, timer));
  }

  /// Pops the first attached timer and hands the rest of the chain over to
  /// it, making it the slot's replacement head.
  fn take_attached_head(&self) -> Option<Arc<Timer>> {
    let mut inner = self.inner.lock();
    let head = inner.attached.pop_front()?;
    let rest: VecDeque<_> = inner.attached.drain(..).collect();
    drop(inner);
    let mut head_inner = head.inner.lock();
    debug_assert!(head_inner.attached.is_empty());
    head_inner.attached = rest;
    drop(head_inner);
    Some(head)
  }

  fn set_request(&self, request: Arc<Request>) {
    let mut inner = self.inner.lock();
    let previous = inner.request.replace(request);
    drop(inner);
    if let Some(previous) = previous {
      previous.abort();
    }
  }

  fn take_handler(&self) -> Option<TimerHandler> {
    self.inner.lock().handler.take()
  }

  fn store_handler(&self, handler: TimerHandler) {
    self.inner.lock().handler = Some(handler);
  }

  /// Advances to the next period without letting missed firings pile up.
  fn advance_fire_time(&self, now: Instant) {
    let mut inner = self.inner.lock();
    let interval = inner.interval;
    inner.fire_time += interval;
    if inner.fire_time < now {
      inner.fire_time = now;
    }
  }
}

/// Single-threaded timer dispatcher.
pub struct TimerProcessor {
  container: Arc<RequestContainer>,
  waiter: Arc<RequestWaiter>,
  epoch: Instant,
  tree: Mutex<BTreeMap<TickType, Arc<Timer>>>,
  is_enabled: AtomicBool,
  thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerProcessor {
  pub fn new() -> Arc<TimerProcessor> {
    let waiter = RequestWaiter::new();
    let container = RequestContainer::processor_with_waiter(
      "timer processor",
      Arc::clone(&waiter),
    );
    Arc::new(TimerProcessor {
      container,
      waiter,
      epoch: Instant::now(),
      tree: Mutex::new(BTreeMap::new()),
      is_enabled: AtomicBool::new(false),
      thread: Mutex::new(None),
    })
  }

  pub fn enable(self: &Arc<Self>) -> Result<()> {
    if self.is_enabled.swap(true, Ordering::AcqRel) {
      return Err(Error::InvalidOp("timer processor already enabled"));
    }
    self.container.enable()?;
    let processor = Arc::clone(self);
    let handle = thread::Builder::new()
      .name("vsm-timer".into())
      .spawn(move || processor.wheel_loop())
      .map_err(|e| Error::Internal(format!("timer thread spawn: {e}")))?;
    *self.thread.lock() = Some(handle);
    Ok(())
  }

  /// Stops the wheel thread and cancels whatever is still scheduled.
  /// Timer users should cancel their timers before this point.
  pub fn disable(self: &Arc<Self>) {
    if !self.is_enabled.swap(false, Ordering::AcqRel) {
      return;
    }
    self.container.disable();
    if let Some(handle) = self.thread.lock().take() {
      let _ = handle.join();
    }
    loop {
      let timer = {
        let tree = self.tree.lock();
        match tree.values().next() {
          Some(timer) => {
            if timer.is_running() {
              tracing::warn!(
                "timer still running at processor disable"
              );
            }
            Arc::clone(timer)
          }
          None => break,
        }
      };
      self.cancel_timer(&timer);
    }
  }

  /// Creates a periodic timer whose callback runs on `container`.
  pub fn create_timer(
    self: &Arc<Self>,
    interval: Duration,
    handler: TimerHandler,
    container: Arc<RequestContainer>,
  ) -> Result<Arc<Timer>> {
    if interval.is_zero() {
      return Err(Error::InvalidParam("timer interval must be non-zero"));
    }
    if !self.is_enabled.load(Ordering::Acquire) {
      return Err(Error::InvalidState("timer processor is not enabled"));
    }
    let timer = Timer::new(self, interval, handler);
    self.create_request(&timer, &container)?;
    Ok(timer)
  }

  pub fn cancel_timer(self: &Arc<Self>, timer: &Arc<Timer>) {
    {
      let mut tree = self.tree.lock();
      let ticks = self.get_ticks(timer.fire_time());
      if let Some(head) = tree.get(&ticks) {
        if Arc::ptr_eq(head, timer) {
          // Replace the node with the head of the attached chain.
          let replacement = timer.take_attached_head();
          tree.remove(&ticks);
          if let Some(replacement) = replacement {
            tree.insert(ticks, replacement);
          }
        } else {
          let head = Arc::clone(head);
          head.detach(timer);
        }
      }
    }
    timer.destroy(true);
  }

  fn get_ticks(&self, time: Instant) -> TickType {
    time.saturating_duration_since(self.epoch).as_millis() as TickType
  }

  /// Builds the one-shot request carrying the next firing of `timer`.
  fn create_request(
    self: &Arc<Self>,
    timer: &Arc<Timer>,
    container: &Arc<RequestContainer>,
  ) -> Result<()> {
    let request = Request::new();
    {
      let processor = Arc::clone(self);
      let timer = Arc::clone(timer);
      request.set_processing_handler(Box::new(move || {
        processor.timer_process_handler(&timer);
      }))?;
    }
    {
      let processor = Arc::clone(self);
      let timer = Arc::clone(timer);
      let ctx = Arc::clone(container);
      request.set_completion_handler(
        Arc::clone(container),
        Box::new(move || {
          processor.timer_fired(&timer, &ctx);
        }),
      )?;
    }
    timer.set_request(Arc::clone(&request));
    self.container.submit(request)
  }

  /// Wheel-thread side of a timer request.
  fn timer_process_handler(self: &Arc<Self>, timer: &Arc<Timer>) {
    if !timer.is_running() {
      // Already canceled.
      return;
    }
    if timer.fire_time() <= Instant::now() {
      timer.fire();
      return;
    }
    self.insert_timer(timer);
  }

  fn insert_timer(&self, timer: &Arc<Timer>) {
    let mut tree = self.tree.lock();
    let ticks = self.get_ticks(timer.fire_time());
    match tree.get(&ticks) {
      Some(head) => {
        // Slot already occupied, chain behind the existing timer.
        let head = Arc::clone(head);
        drop(tree);
        head.attach(Arc::clone(timer));
      }
      None => {
        tree.insert(ticks, Arc::clone(timer));
      }
    }
  }

  /// Completion-container side of a timer request: run the user callback
  /// and re-arm when asked to.
  fn timer_fired(
    self: &Arc<Self>,
    timer: &Arc<Timer>,
    container: &Arc<RequestContainer>,
  ) {
    let Some(mut handler) = timer.take_handler() else {
      // Canceled while the completion was in flight.
      return;
    };
    let rearm = handler();
    if rearm && timer.is_running() {
      timer.advance_fire_time(Instant::now());
      timer.store_handler(handler);
      if let Err(err) = self.create_request(timer, container) {
        tracing::error!(%err, "timer re-arm failed");
        timer.destroy(false);
      }
    } else {
      timer.destroy(false);
    }
  }

  fn wheel_loop(self: &Arc<Self>) {
    while self.is_enabled.load(Ordering::Acquire) {
      let wait_for = {
        let mut tree = self.tree.lock();
        match tree.iter().next().map(|(k, v)| (*k, Arc::clone(v))) {
          None => None,
          Some((ticks, timer)) => {
            let now = Instant::now();
            let fire_time = timer.fire_time();
            if fire_time <= now {
              tree.remove(&ticks);
              drop(tree);
              timer.fire();
              continue;
            }
            Some(fire_time - now)
          }
        }
      };
      self.waiter.wait_and_process(
        &[Arc::clone(&self.container)],
        wait_for,
        0,
        None,
      );
    }
  }
}
