//! The uniform asynchronous stream contract.
//!
//! Every stream — file, serial port, TCP or UDP socket — exposes the same
//! read/write/close surface. Operations return an [`OperationWaiter`] over
//! the underlying request; outcomes arrive in the supplied callback on the
//! supplied completion container. A stream serializes operations per
//! direction: submitting a second read before the first completed is a
//! contract violation and fails synchronously.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::buf::IoBuffer;
use crate::error::{Error, IoResult, Result};
use crate::io::dispatcher::{
  Direction, IoCb, IoOp, IoOutcome, Offset, PollDispatcher,
};
use crate::request::container::RequestContainer;
use crate::request::operation_waiter::OperationWaiter;
use crate::request::request::{Request, ResultCode};
use crate::sync::Mutex;

pub type ReadHandler = Box<dyn FnOnce(IoResult, IoBuffer) + Send + 'static>;
pub type WriteHandler = Box<dyn FnOnce(IoResult) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
  File,
  Serial,
  Tcp,
  TcpListener,
  Udp,
  UdpMultiplexed,
}

pub trait IoStream: Send + Sync {
  fn name(&self) -> String;

  fn kind(&self) -> StreamKind;

  /// Fills up to `max` bytes, completing once at least `min` arrived, the
  /// stream closed, EOF was reached or the operation was canceled. EOF is a
  /// successful result with possibly fewer bytes than `min`.
  fn read(
    &self,
    max: usize,
    min: usize,
    offset: Offset,
    handler: ReadHandler,
    ctx: &Arc<RequestContainer>,
  ) -> Result<OperationWaiter>;

  fn write(
    &self,
    buffer: IoBuffer,
    offset: Offset,
    handler: WriteHandler,
    ctx: &Arc<RequestContainer>,
  ) -> Result<OperationWaiter>;

  fn close(&self);

  fn is_closed(&self) -> bool;

  /// Takes an exclusive advisory lock, blocking until available.
  fn lock(&self) -> Result<()> {
    Err(Error::InvalidOp("stream does not support locking"))
  }

  fn try_lock(&self) -> Result<()> {
    Err(Error::InvalidOp("stream does not support locking"))
  }

  fn unlock(&self) -> Result<()> {
    Err(Error::InvalidOp("stream does not support locking"))
  }
}

/// Shared state of every descriptor-backed stream.
pub(crate) struct FdStream {
  pub name: String,
  pub kind: StreamKind,
  pub fd: RawFd,
  pub dispatcher: Arc<PollDispatcher>,
  /// Processor container owning this stream's operations.
  pub processor: Arc<RequestContainer>,
  pub is_closed: AtomicBool,
  pub read_active: AtomicBool,
  pub write_active: AtomicBool,
}

impl FdStream {
  pub fn new(
    name: impl Into<String>,
    kind: StreamKind,
    fd: RawFd,
    dispatcher: Arc<PollDispatcher>,
    processor: Arc<RequestContainer>,
  ) -> FdStream {
    FdStream {
      name: name.into(),
      kind,
      fd,
      dispatcher,
      processor,
      is_closed: AtomicBool::new(false),
      read_active: AtomicBool::new(false),
      write_active: AtomicBool::new(false),
    }
  }

  /// Claims the per-direction slot, enforcing one operation in flight.
  fn claim(&self, direction: Direction) -> Result<()> {
    if self.is_closed.load(Ordering::Acquire) {
      return Err(Error::ClosedStream);
    }
    let flag = match direction {
      Direction::In => &self.read_active,
      Direction::Out => &self.write_active,
    };
    if flag.swap(true, Ordering::AcqRel) {
      return Err(Error::InvalidOp(
        "operation already in flight on this direction",
      ));
    }
    Ok(())
  }

  fn release(self: &Arc<Self>, direction: Direction) {
    let flag = match direction {
      Direction::In => &self.read_active,
      Direction::Out => &self.write_active,
    };
    flag.store(false, Ordering::Release);
  }

  pub fn read(
    self: &Arc<Self>,
    max: usize,
    min: usize,
    offset: Offset,
    handler: ReadHandler,
    ctx: &Arc<RequestContainer>,
  ) -> Result<OperationWaiter> {
    if max == 0 || min > max {
      return Err(Error::InvalidParam("invalid read bounds"));
    }
    self.claim(Direction::In)?;

    let request = Request::new();
    let cell: Arc<Mutex<Option<(IoResult, IoBuffer)>>> =
      Arc::new(Mutex::new(None));
    {
      let cell = Arc::clone(&cell);
      request.set_completion_handler(
        Arc::clone(ctx),
        Box::new(move || {
          let (result, data) = cell
            .lock()
            .take()
            .unwrap_or((IoResult::OtherFailure, IoBuffer::new()));
          handler(result, data);
        }),
      )?;
    }
    {
      let stream = Arc::clone(self);
      let request2 = Arc::clone(&request);
      let cell = Arc::clone(&cell);
      request.set_processing_handler(Box::new(move || {
        let completer = {
          let stream = Arc::clone(&stream);
          let request = Arc::clone(&request2);
          let cell = Arc::clone(&cell);
          Box::new(move |outcome: IoOutcome| {
            let (result, data) = match outcome {
              IoOutcome::Read { result: Ok(n), data } => {
                let io_result =
                  if n >= min { IoResult::Ok } else { IoResult::EndOfFile };
                (io_result, IoBuffer::from_vec(data))
              }
              IoOutcome::Read { result: Err(err), .. } => {
                (IoResult::from_io_error(&err), IoBuffer::new())
              }
              IoOutcome::Canceled => (IoResult::Canceled, IoBuffer::new()),
              IoOutcome::Closed => (IoResult::Closed, IoBuffer::new()),
              _ => (IoResult::OtherFailure, IoBuffer::new()),
            };
            stream.release(Direction::In);
            let code = result_code(result);
            *cell.lock() = Some((result, data));
            let _ = request.complete(code);
          })
        };
        stream.dispatcher.submit(IoCb {
          fd: stream.fd,
          op: IoOp::Read { max, min },
          offset,
          buf: vec![0; max],
          pos: 0,
          seek_done: false,
          callback: Some(completer),
        });
      }))?;
    }
    {
      let stream = Arc::clone(self);
      request.set_cancellation_handler(Box::new(move || {
        stream.dispatcher.cancel(stream.fd, Direction::In);
      }))?;
    }
    self.processor.submit(Arc::clone(&request))?;
    Ok(OperationWaiter::new(request))
  }

  pub fn write(
    self: &Arc<Self>,
    buffer: IoBuffer,
    offset: Offset,
    handler: WriteHandler,
    ctx: &Arc<RequestContainer>,
  ) -> Result<OperationWaiter> {
    self.claim(Direction::Out)?;

    let request = Request::new();
    let cell: Arc<Mutex<Option<IoResult>>> = Arc::new(Mutex::new(None));
    {
      let cell = Arc::clone(&cell);
      request.set_completion_handler(
        Arc::clone(ctx),
        Box::new(move || {
          let result = cell.lock().take().unwrap_or(IoResult::OtherFailure);
          handler(result);
        }),
      )?;
    }
    {
      let stream = Arc::clone(self);
      let request2 = Arc::clone(&request);
      let cell = Arc::clone(&cell);
      request.set_processing_handler(Box::new(move || {
        let completer = {
          let stream = Arc::clone(&stream);
          let request = Arc::clone(&request2);
          let cell = Arc::clone(&cell);
          Box::new(move |outcome: IoOutcome| {
            let result = match outcome {
              IoOutcome::Write { result: Ok(_) } => IoResult::Ok,
              IoOutcome::Write { result: Err(err) } => {
                IoResult::from_io_error(&err)
              }
              IoOutcome::Canceled => IoResult::Canceled,
              IoOutcome::Closed => IoResult::Closed,
              _ => IoResult::OtherFailure,
            };
            stream.release(Direction::Out);
            let code = result_code(result);
            *cell.lock() = Some(result);
            let _ = request.complete(code);
          })
        };
        stream.dispatcher.submit(IoCb {
          fd: stream.fd,
          op: IoOp::Write,
          offset,
          buf: buffer.to_vec(),
          pos: 0,
          seek_done: false,
          callback: Some(completer),
        });
      }))?;
    }
    {
      let stream = Arc::clone(self);
      request.set_cancellation_handler(Box::new(move || {
        stream.dispatcher.cancel(stream.fd, Direction::Out);
      }))?;
    }
    self.processor.submit(Arc::clone(&request))?;
    Ok(OperationWaiter::new(request))
  }

  /// Closes the stream. Pending operations complete with `Closed`; the
  /// descriptor itself is released by the dispatcher once unpolled.
  pub fn close(&self) {
    if self.is_closed.swap(true, Ordering::AcqRel) {
      return;
    }
    self.dispatcher.close_handle(self.fd);
  }

  pub fn is_closed(&self) -> bool {
    self.is_closed.load(Ordering::Acquire)
  }
}

impl Drop for FdStream {
  fn drop(&mut self) {
    if !self.is_closed.swap(true, Ordering::AcqRel) {
      self.dispatcher.close_handle(self.fd);
    }
  }
}

pub(crate) fn result_code(result: IoResult) -> ResultCode {
  match result {
    IoResult::Canceled => ResultCode::Canceled,
    _ => ResultCode::Ok,
  }
}
