//! Socket processor: TCP listen/accept/connect, UDP, multi-peer UDP demux.
//!
//! Socket system calls run on the processor's worker thread; only readiness
//! waits go through the platform dispatcher. A multiplexed UDP listener
//! accepts pseudo-connections: the first datagram from an unknown source
//! creates a sub-stream, and subsequent reads on that sub-stream only ever
//! yield datagrams from its peer. Each sub-stream buffers at most
//! [`UDP_SUBSTREAM_QUEUE_LIMIT`] datagrams, dropping the oldest on overflow.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::os::fd::{IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::buf::IoBuffer;
use crate::error::{Error, IoResult, Result};
use crate::io::addr::{SocketAddress, std_to_sockaddr};
use crate::io::dispatcher::{
  Direction, IoCb, IoOp, IoOutcome, Offset, PollDispatcher,
};
use crate::io::stream::{
  FdStream, IoStream, ReadHandler, StreamKind, WriteHandler, result_code,
};
use crate::request::container::RequestContainer;
use crate::request::operation_waiter::OperationWaiter;
use crate::request::request::{Request, ResultCode};
use crate::request::worker::RequestWorker;
use crate::sync::Mutex;

/// Bound on datagrams buffered per UDP sub-stream; oldest dropped first.
pub const UDP_SUBSTREAM_QUEUE_LIMIT: usize = 50;

const LISTEN_BACKLOG: libc::c_int = 32;
const UDP_DATAGRAM_MAX: usize = 65536;

pub type ConnectHandler =
  Box<dyn FnOnce(IoResult, Option<Arc<SocketStream>>) + Send + 'static>;
pub type ListenHandler =
  Box<dyn FnOnce(IoResult, Option<Arc<TcpListenerStream>>) + Send + 'static>;
pub type AcceptHandler =
  Box<dyn FnOnce(IoResult, Option<Arc<SocketStream>>) + Send + 'static>;
pub type UdpBindHandler =
  Box<dyn FnOnce(IoResult, Option<Arc<UdpStream>>) + Send + 'static>;
pub type UdpListenHandler =
  Box<dyn FnOnce(IoResult, Option<Arc<UdpListenerStream>>) + Send + 'static>;
pub type UdpAcceptHandler =
  Box<dyn FnOnce(IoResult, Option<Arc<UdpSubStream>>) + Send + 'static>;
pub type ReadFromHandler =
  Box<dyn FnOnce(IoResult, IoBuffer, Option<SocketAddr>) + Send + 'static>;

/// Worker thread owning every socket operation.
pub struct SocketProcessor {
  worker: Arc<RequestWorker>,
  container: Arc<RequestContainer>,
  dispatcher: Arc<PollDispatcher>,
}

impl SocketProcessor {
  pub fn new() -> Result<Arc<SocketProcessor>> {
    Ok(Self::with_dispatcher(PollDispatcher::new()?))
  }

  pub fn with_dispatcher(
    dispatcher: Arc<PollDispatcher>,
  ) -> Arc<SocketProcessor> {
    let (worker, container) = RequestWorker::single("socket processor");
    Arc::new(SocketProcessor { worker, container, dispatcher })
  }

  pub fn enable(&self) -> Result<()> {
    self.worker.enable()
  }

  pub fn disable(&self) {
    self.worker.disable();
  }

  pub fn container(&self) -> &Arc<RequestContainer> {
    &self.container
  }

  /// Starts an outgoing TCP connection. The stream arrives in `handler`
  /// once the connect finished (or failed).
  pub fn connect(
    self: &Arc<Self>,
    addr: SocketAddress,
    handler: ConnectHandler,
    ctx: &Arc<RequestContainer>,
  ) -> Result<OperationWaiter> {
    let request = Request::new();
    let cell: ResultCell<Arc<SocketStream>> = Arc::new(Mutex::new(None));
    let fd_cell: Arc<Mutex<Option<RawFd>>> = Arc::new(Mutex::new(None));
    set_result_completion(&request, ctx, &cell, handler)?;
    {
      let processor = Arc::clone(self);
      let request2 = Arc::clone(&request);
      let cell = Arc::clone(&cell);
      let fd_cell2 = Arc::clone(&fd_cell);
      let mut addr = addr;
      request.set_processing_handler(Box::new(move || {
        processor.connect_blocking(addr.resolve(), &request2, &cell, &fd_cell2);
      }))?;
    }
    {
      let dispatcher = Arc::clone(&self.dispatcher);
      request.set_cancellation_handler(Box::new(move || {
        if let Some(fd) = *fd_cell.lock() {
          dispatcher.cancel(fd, Direction::Out);
        }
      }))?;
    }
    self.container.submit(Arc::clone(&request))?;
    Ok(OperationWaiter::new(request))
  }

  fn connect_blocking(
    self: &Arc<Self>,
    addr: Result<SocketAddr>,
    request: &Arc<Request>,
    cell: &ResultCell<Arc<SocketStream>>,
    fd_cell: &Arc<Mutex<Option<RawFd>>>,
  ) {
    let addr = match addr {
      Ok(addr) => addr,
      Err(_) => {
        finish(request, cell, IoResult::OtherFailure, None);
        return;
      }
    };
    let fd = match new_socket(&addr, libc::SOCK_STREAM) {
      Ok(fd) => fd,
      Err(result) => {
        finish(request, cell, result, None);
        return;
      }
    };
    let (storage, len) = std_to_sockaddr(&addr);
    let res = unsafe {
      libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len)
    };
    if res == 0 {
      let stream = self.wrap_tcp(fd, &addr);
      finish(request, cell, IoResult::Ok, Some(stream));
      return;
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EINPROGRESS) {
      let _ = syscall!(close(fd));
      finish(request, cell, IoResult::from_io_error(&err), None);
      return;
    }
    // Connection in progress; let the dispatcher report writability.
    *fd_cell.lock() = Some(fd);
    let processor = Arc::clone(self);
    let request = Arc::clone(request);
    let cell = Arc::clone(cell);
    self.dispatcher.submit(IoCb {
      fd,
      op: IoOp::Connect,
      offset: Offset::None,
      buf: Vec::new(),
      pos: 0,
      seek_done: true,
      callback: Some(Box::new(move |outcome| match outcome {
        IoOutcome::Connect { result: Ok(()) } => {
          let stream = processor.wrap_tcp(fd, &addr);
          finish(&request, &cell, IoResult::Ok, Some(stream));
        }
        IoOutcome::Connect { result: Err(err) } => {
          let _ = syscall!(close(fd));
          finish(&request, &cell, IoResult::from_io_error(&err), None);
        }
        IoOutcome::Canceled => {
          let _ = syscall!(close(fd));
          finish(&request, &cell, IoResult::Canceled, None);
        }
        _ => {
          finish(&request, &cell, IoResult::Closed, None);
        }
      })),
    });
  }

  /// Opens a listening TCP socket.
  pub fn listen(
    self: &Arc<Self>,
    addr: SocketAddress,
    handler: ListenHandler,
    ctx: &Arc<RequestContainer>,
  ) -> Result<OperationWaiter> {
    let request = Request::new();
    let cell: ResultCell<Arc<TcpListenerStream>> = Arc::new(Mutex::new(None));
    set_result_completion(&request, ctx, &cell, handler)?;
    {
      let processor = Arc::clone(self);
      let request2 = Arc::clone(&request);
      let cell = Arc::clone(&cell);
      let mut addr = addr;
      request.set_processing_handler(Box::new(move || {
        match processor.listen_blocking(addr.resolve()) {
          Ok(listener) => {
            finish(&request2, &cell, IoResult::Ok, Some(listener))
          }
          Err(result) => finish(&request2, &cell, result, None),
        }
      }))?;
    }
    self.container.submit(Arc::clone(&request))?;
    Ok(OperationWaiter::new(request))
  }

  fn listen_blocking(
    self: &Arc<Self>,
    addr: Result<SocketAddr>,
  ) -> std::result::Result<Arc<TcpListenerStream>, IoResult> {
    let addr = addr.map_err(|_| IoResult::OtherFailure)?;
    let fd = new_socket(&addr, libc::SOCK_STREAM)?;
    bind_fd(fd, &addr)?;
    if let Err(err) = syscall!(listen(fd, LISTEN_BACKLOG)) {
      let _ = syscall!(close(fd));
      return Err(IoResult::from_io_error(&err));
    }
    let local = local_addr(fd).unwrap_or(addr);
    Ok(Arc::new(TcpListenerStream {
      inner: Arc::new(FdStream::new(
        format!("tcp-listen:{local}"),
        StreamKind::TcpListener,
        fd,
        Arc::clone(&self.dispatcher),
        Arc::clone(&self.container),
      )),
      local,
      processor: Arc::downgrade(self),
    }))
  }

  /// Binds a plain UDP socket, optionally connected to `peer`.
  pub fn bind_udp(
    self: &Arc<Self>,
    local: SocketAddress,
    peer: Option<SocketAddress>,
    handler: UdpBindHandler,
    ctx: &Arc<RequestContainer>,
  ) -> Result<OperationWaiter> {
    let request = Request::new();
    let cell: ResultCell<Arc<UdpStream>> = Arc::new(Mutex::new(None));
    set_result_completion(&request, ctx, &cell, handler)?;
    {
      let processor = Arc::clone(self);
      let request2 = Arc::clone(&request);
      let cell = Arc::clone(&cell);
      let mut local = local;
      let mut peer = peer;
      request.set_processing_handler(Box::new(move || {
        let peer_addr = match peer.as_mut().map(|p| p.resolve()) {
          Some(Ok(addr)) => Some(addr),
          Some(Err(_)) => {
            finish(&request2, &cell, IoResult::OtherFailure, None);
            return;
          }
          None => None,
        };
        match processor.bind_udp_blocking(local.resolve(), peer_addr) {
          Ok(stream) => finish(&request2, &cell, IoResult::Ok, Some(stream)),
          Err(result) => finish(&request2, &cell, result, None),
        }
      }))?;
    }
    self.container.submit(Arc::clone(&request))?;
    Ok(OperationWaiter::new(request))
  }

  fn bind_udp_blocking(
    self: &Arc<Self>,
    local: Result<SocketAddr>,
    peer: Option<SocketAddr>,
  ) -> std::result::Result<Arc<UdpStream>, IoResult> {
    let local = local.map_err(|_| IoResult::OtherFailure)?;
    let fd = new_socket(&local, libc::SOCK_DGRAM)?;
    bind_fd(fd, &local)?;
    if let Some(peer) = peer {
      let (storage, len) = std_to_sockaddr(&peer);
      let res = unsafe {
        libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len)
      };
      if res != 0 {
        let err = std::io::Error::last_os_error();
        let _ = syscall!(close(fd));
        return Err(IoResult::from_io_error(&err));
      }
    }
    let bound = local_addr(fd).unwrap_or(local);
    Ok(Arc::new(UdpStream {
      inner: Arc::new(FdStream::new(
        format!("udp:{bound}"),
        StreamKind::Udp,
        fd,
        Arc::clone(&self.dispatcher),
        Arc::clone(&self.container),
      )),
      peer,
      processor: Arc::downgrade(self),
    }))
  }

  /// Binds a multiplexing UDP listener that demuxes datagrams per source
  /// into accepted sub-streams.
  pub fn listen_udp(
    self: &Arc<Self>,
    local: SocketAddress,
    handler: UdpListenHandler,
    ctx: &Arc<RequestContainer>,
  ) -> Result<OperationWaiter> {
    let request = Request::new();
    let cell: ResultCell<Arc<UdpListenerStream>> = Arc::new(Mutex::new(None));
    set_result_completion(&request, ctx, &cell, handler)?;
    {
      let processor = Arc::clone(self);
      let request2 = Arc::clone(&request);
      let cell = Arc::clone(&cell);
      let mut local = local;
      request.set_processing_handler(Box::new(move || {
        match processor.bind_udp_blocking(local.resolve(), None) {
          Ok(udp) => {
            let listener = UdpListenerStream::new(udp);
            listener.pump();
            finish(&request2, &cell, IoResult::Ok, Some(listener));
          }
          Err(result) => finish(&request2, &cell, result, None),
        }
      }))?;
    }
    self.container.submit(Arc::clone(&request))?;
    Ok(OperationWaiter::new(request))
  }

  fn wrap_tcp(&self, fd: RawFd, peer: &SocketAddr) -> Arc<SocketStream> {
    Arc::new(SocketStream {
      inner: Arc::new(FdStream::new(
        format!("tcp:{peer}"),
        StreamKind::Tcp,
        fd,
        Arc::clone(&self.dispatcher),
        Arc::clone(&self.container),
      )),
      peer: *peer,
    })
  }

  /// Runs `op` on the socket worker and reports through `cell`+`request`.
  fn submit_op(
    &self,
    request: Arc<Request>,
    op: Box<dyn FnOnce() + Send + 'static>,
  ) -> Result<OperationWaiter> {
    request.set_processing_handler(op)?;
    self.container.submit(Arc::clone(&request))?;
    Ok(OperationWaiter::new(request))
  }
}

type ResultCell<T> = Arc<Mutex<Option<(IoResult, Option<T>)>>>;

fn set_result_completion<T: Send + 'static>(
  request: &Arc<Request>,
  ctx: &Arc<RequestContainer>,
  cell: &ResultCell<T>,
  handler: Box<dyn FnOnce(IoResult, Option<T>) + Send + 'static>,
) -> Result<()> {
  let cell = Arc::clone(cell);
  request.set_completion_handler(
    Arc::clone(ctx),
    Box::new(move || {
      let (result, value) =
        cell.lock().take().unwrap_or((IoResult::OtherFailure, None));
      handler(result, value);
    }),
  )
}

fn finish<T>(
  request: &Arc<Request>,
  cell: &ResultCell<T>,
  result: IoResult,
  value: Option<T>,
) {
  *cell.lock() = Some((result, value));
  let _ = request.complete(result_code(result));
}

fn new_socket(
  addr: &SocketAddr,
  kind: libc::c_int,
) -> std::result::Result<RawFd, IoResult> {
  let family = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
  let fd = match syscall!(socket(family, kind, 0)) {
    Ok(fd) => fd,
    Err(err) => return Err(IoResult::from_io_error(&err)),
  };
  if let Err(err) = crate::io::set_nonblocking(fd) {
    let _ = syscall!(close(fd));
    return Err(IoResult::from_io_error(&err));
  }
  let one: libc::c_int = 1;
  let _ = unsafe {
    libc::setsockopt(
      fd,
      libc::SOL_SOCKET,
      libc::SO_REUSEADDR,
      &one as *const _ as *const libc::c_void,
      std::mem::size_of::<libc::c_int>() as libc::socklen_t,
    )
  };
  Ok(fd)
}

fn bind_fd(fd: RawFd, addr: &SocketAddr) -> std::result::Result<(), IoResult> {
  let (storage, len) = std_to_sockaddr(addr);
  let res = unsafe {
    libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len)
  };
  if res != 0 {
    let err = std::io::Error::last_os_error();
    let _ = syscall!(close(fd));
    return Err(IoResult::from_io_error(&err));
  }
  Ok(())
}

fn local_addr(fd: RawFd) -> Option<SocketAddr> {
  let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
  let mut len =
    std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
  let res = unsafe {
    libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
  };
  if res != 0 {
    return None;
  }
  crate::io::addr::sockaddr_to_std(&storage)
}

/// Connected TCP stream.
pub struct SocketStream {
  inner: Arc<FdStream>,
  peer: SocketAddr,
}

impl SocketStream {
  pub fn peer_addr(&self) -> SocketAddr {
    self.peer
  }

  pub fn local_addr(&self) -> Option<SocketAddr> {
    local_addr(self.inner.fd)
  }
}

impl IoStream for SocketStream {
  fn name(&self) -> String {
    self.inner.name.clone()
  }

  fn kind(&self) -> StreamKind {
    self.inner.kind
  }

  fn read(
    &self,
    max: usize,
    min: usize,
    offset: Offset,
    handler: ReadHandler,
    ctx: &Arc<RequestContainer>,
  ) -> Result<OperationWaiter> {
    self.inner.read(max, min, offset, handler, ctx)
  }

  fn write(
    &self,
    buffer: IoBuffer,
    offset: Offset,
    handler: WriteHandler,
    ctx: &Arc<RequestContainer>,
  ) -> Result<OperationWaiter> {
    self.inner.write(buffer, offset, handler, ctx)
  }

  fn close(&self) {
    self.inner.close();
  }

  fn is_closed(&self) -> bool {
    self.inner.is_closed()
  }
}

/// Listening TCP socket.
pub struct TcpListenerStream {
  inner: Arc<FdStream>,
  local: SocketAddr,
  processor: Weak<SocketProcessor>,
}

impl TcpListenerStream {
  pub fn local_addr(&self) -> SocketAddr {
    self.local
  }

  /// Accepts the next connection; at most one accept may be in flight.
  pub fn accept(
    &self,
    handler: AcceptHandler,
    ctx: &Arc<RequestContainer>,
  ) -> Result<OperationWaiter> {
    let Some(processor) = self.processor.upgrade() else {
      return Err(Error::InvalidState("socket processor is gone"));
    };
    if self.inner.is_closed() {
      return Err(Error::ClosedStream);
    }
    let request = Request::new();
    let cell: ResultCell<Arc<SocketStream>> = Arc::new(Mutex::new(None));
    set_result_completion(&request, ctx, &cell, handler)?;

    let dispatcher = Arc::clone(&self.inner.dispatcher);
    let fd = self.inner.fd;
    let request_for_op = Arc::clone(&request);
    let processor_for_op = Arc::clone(&processor);
    let op = Box::new(move || {
      let processor = processor_for_op;
      let request = request_for_op;
      dispatcher.submit(IoCb {
        fd,
        op: IoOp::Accept,
        offset: Offset::None,
        buf: Vec::new(),
        pos: 0,
        seek_done: true,
        callback: Some(Box::new(move |outcome| match outcome {
          IoOutcome::Accept { result: Ok((owned, peer)) } => {
            let stream = processor.wrap_tcp(owned.into_raw_fd(), &peer);
            finish(&request, &cell, IoResult::Ok, Some(stream));
          }
          IoOutcome::Accept { result: Err(err) } => {
            finish(&request, &cell, IoResult::from_io_error(&err), None);
          }
          IoOutcome::Canceled => {
            finish(&request, &cell, IoResult::Canceled, None);
          }
          _ => finish(&request, &cell, IoResult::Closed, None),
        })),
      });
    });
    {
      let dispatcher = Arc::clone(&self.inner.dispatcher);
      request.set_cancellation_handler(Box::new(move || {
        dispatcher.cancel(fd, Direction::In);
      }))?;
    }
    processor.submit_op(request, op)
  }

  pub fn close(&self) {
    self.inner.close();
  }
}

/// Plain (optionally connected) UDP socket.
pub struct UdpStream {
  inner: Arc<FdStream>,
  peer: Option<SocketAddr>,
  processor: Weak<SocketProcessor>,
}

impl UdpStream {
  pub fn local_addr(&self) -> Option<SocketAddr> {
    local_addr(self.inner.fd)
  }

  pub fn peer(&self) -> Option<SocketAddr> {
    self.peer
  }

  /// Receives one datagram together with its source address.
  pub fn read_from(
    &self,
    max: usize,
    handler: ReadFromHandler,
    ctx: &Arc<RequestContainer>,
  ) -> Result<OperationWaiter> {
    if self.inner.is_closed() {
      return Err(Error::ClosedStream);
    }
    let Some(processor) = self.processor.upgrade() else {
      return Err(Error::InvalidState("socket processor is gone"));
    };
    let request = Request::new();
    let cell: Arc<Mutex<Option<(IoResult, IoBuffer, Option<SocketAddr>)>>> =
      Arc::new(Mutex::new(None));
    {
      let cell = Arc::clone(&cell);
      request.set_completion_handler(
        Arc::clone(ctx),
        Box::new(move || {
          let (result, data, from) = cell.lock().take().unwrap_or((
            IoResult::OtherFailure,
            IoBuffer::new(),
            None,
          ));
          handler(result, data, from);
        }),
      )?;
    }
    let dispatcher = Arc::clone(&self.inner.dispatcher);
    let fd = self.inner.fd;
    let request_for_op = Arc::clone(&request);
    let op = Box::new(move || {
      let request = Arc::clone(&request_for_op);
      let cell = Arc::clone(&cell);
      dispatcher.submit(IoCb {
        fd,
        op: IoOp::RecvFrom { max },
        offset: Offset::None,
        buf: vec![0; max],
        pos: 0,
        seek_done: true,
        callback: Some(Box::new(move |outcome| {
          let (result, data, from) = match outcome {
            IoOutcome::RecvFrom { result: Ok(_), data, from } => {
              (IoResult::Ok, IoBuffer::from_vec(data), from)
            }
            IoOutcome::RecvFrom { result: Err(err), .. } => {
              (IoResult::from_io_error(&err), IoBuffer::new(), None)
            }
            IoOutcome::Canceled => {
              (IoResult::Canceled, IoBuffer::new(), None)
            }
            _ => (IoResult::Closed, IoBuffer::new(), None),
          };
          *cell.lock() = Some((result, data, from));
          let _ = request.complete(result_code(result));
        })),
      });
    });
    {
      let dispatcher = Arc::clone(&self.inner.dispatcher);
      request.set_cancellation_handler(Box::new(move || {
        dispatcher.cancel(fd, Direction::In);
      }))?;
    }
    processor.submit_op(request, op)
  }

  /// Sends one datagram to an explicit destination. Datagram sends do not
  /// wait for readiness; they run directly on the socket worker.
  pub fn write_to(
    &self,
    buffer: IoBuffer,
    to: SocketAddr,
    handler: WriteHandler,
    ctx: &Arc<RequestContainer>,
  ) -> Result<OperationWaiter> {
    if self.inner.is_closed() {
      return Err(Error::ClosedStream);
    }
    let Some(processor) = self.processor.upgrade() else {
      return Err(Error::InvalidState("socket processor is gone"));
    };
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
    let fd = self.inner.fd;
    let request_for_op = Arc::clone(&request);
    let op = Box::new(move || {
      let result = send_datagram(fd, buffer.as_slice(), Some(to));
      *cell.lock() = Some(result);
      let _ = request_for_op.complete(result_code(result));
    });
    processor.submit_op(request, op)
  }
}

impl IoStream for UdpStream {
  fn name(&self) -> String {
    self.inner.name.clone()
  }

  fn kind(&self) -> StreamKind {
    self.inner.kind
  }

  fn read(
    &self,
    max: usize,
    min: usize,
    offset: Offset,
    handler: ReadHandler,
    ctx: &Arc<RequestContainer>,
  ) -> Result<OperationWaiter> {
    self.inner.read(max, min, offset, handler, ctx)
  }

  fn write(
    &self,
    buffer: IoBuffer,
    offset: Offset,
    handler: WriteHandler,
    ctx: &Arc<RequestContainer>,
  ) -> Result<OperationWaiter> {
    self.inner.write(buffer, offset, handler, ctx)
  }

  fn close(&self) {
    self.inner.close();
  }

  fn is_closed(&self) -> bool {
    self.inner.is_closed()
  }
}

fn send_datagram(
  fd: RawFd,
  data: &[u8],
  to: Option<SocketAddr>,
) -> IoResult {
  let res = match to {
    Some(addr) => {
      let (storage, len) = std_to_sockaddr(&addr);
      unsafe {
        libc::sendto(
          fd,
          data.as_ptr() as *const libc::c_void,
          data.len(),
          0,
          &storage as *const _ as *const libc::sockaddr,
          len,
        )
      }
    }
    None => unsafe {
      libc::send(fd, data.as_ptr() as *const libc::c_void, data.len(), 0)
    },
  };
  if res < 0 {
    IoResult::from_io_error(&std::io::Error::last_os_error())
  } else {
    IoResult::Ok
  }
}

struct PendingRead {
  request: Arc<Request>,
  cell: Arc<Mutex<Option<(IoResult, IoBuffer)>>>,
  max: usize,
}

struct SubStreamState {
  queue: VecDeque<IoBuffer>,
  pending_read: Option<PendingRead>,
  closed: bool,
}

/// Pseudo-connection of one UDP peer behind a multiplexed listener.
pub struct UdpSubStream {
  peer: SocketAddr,
  listener: Weak<UdpListenerStream>,
  state: Mutex<SubStreamState>,
}

impl UdpSubStream {
  pub fn peer_addr(&self) -> SocketAddr {
    self.peer
  }

  /// Delivers the next datagram from this sub-stream's peer.
  pub fn read(
    self: &Arc<Self>,
    max: usize,
    handler: ReadHandler,
    ctx: &Arc<RequestContainer>,
  ) -> Result<OperationWaiter> {
    let Some(listener) = self.listener.upgrade() else {
      return Err(Error::ClosedStream);
    };
    let Some(processor) = listener.processor() else {
      return Err(Error::InvalidState("socket processor is gone"));
    };
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
    let substream = Arc::clone(self);
    let request_for_op = Arc::clone(&request);
    let cell_for_op = Arc::clone(&cell);
    let op = Box::new(move || {
      let mut state = substream.state.lock();
      if let Some(datagram) = state.queue.pop_front() {
        drop(state);
        let data = clamp_datagram(datagram, max);
        *cell_for_op.lock() = Some((IoResult::Ok, data));
        let _ = request_for_op.complete(ResultCode::Ok);
        return;
      }
      if state.closed {
        drop(state);
        *cell_for_op.lock() = Some((IoResult::Closed, IoBuffer::new()));
        let _ = request_for_op.complete(ResultCode::Ok);
        return;
      }
      if state.pending_read.is_some() {
        drop(state);
        *cell_for_op.lock() = Some((IoResult::OtherFailure, IoBuffer::new()));
        let _ = request_for_op.complete(ResultCode::Ok);
        return;
      }
      state.pending_read = Some(PendingRead {
        request: Arc::clone(&request_for_op),
        cell: Arc::clone(&cell_for_op),
        max,
      });
    });
    processor.submit_op(request, op)
  }

  /// Sends a datagram back to this sub-stream's peer.
  pub fn write(
    &self,
    buffer: IoBuffer,
    handler: WriteHandler,
    ctx: &Arc<RequestContainer>,
  ) -> Result<OperationWaiter> {
    let Some(listener) = self.listener.upgrade() else {
      return Err(Error::ClosedStream);
    };
    listener.send_to(buffer, self.peer, handler, ctx)
  }

  pub fn close(&self) {
    let mut state = self.state.lock();
    state.closed = true;
    let pending = state.pending_read.take();
    drop(state);
    if let Some(pending) = pending {
      *pending.cell.lock() = Some((IoResult::Closed, IoBuffer::new()));
      let _ = pending.request.complete(ResultCode::Ok);
    }
  }

  pub fn is_closed(&self) -> bool {
    self.state.lock().closed
  }

  /// Called from the listener pump with a datagram from this peer.
  fn push_datagram(&self, datagram: IoBuffer) {
    let mut state = self.state.lock();
    if state.closed {
      return;
    }
    if let Some(pending) = state.pending_read.take() {
      drop(state);
      let data = clamp_datagram(datagram, pending.max);
      *pending.cell.lock() = Some((IoResult::Ok, data));
      let _ = pending.request.complete(ResultCode::Ok);
      return;
    }
    if state.queue.len() >= UDP_SUBSTREAM_QUEUE_LIMIT {
      // Bounded memory: drop-oldest on overflow.
      state.queue.pop_front();
    }
    state.queue.push_back(datagram);
  }
}

fn clamp_datagram(datagram: IoBuffer, max: usize) -> IoBuffer {
  if datagram.len() <= max {
    datagram
  } else {
    datagram.slice(0, max).unwrap_or_default()
  }
}

struct PendingAccept {
  request: Arc<Request>,
  cell: ResultCell<Arc<UdpSubStream>>,
}

struct UdpListenerState {
  substreams: HashMap<SocketAddr, Arc<UdpSubStream>>,
  accept_queue: VecDeque<Arc<UdpSubStream>>,
  pending_accepts: VecDeque<PendingAccept>,
}

/// Multiplexing UDP listener: one socket, many peers.
pub struct UdpListenerStream {
  udp: Arc<UdpStream>,
  state: Mutex<UdpListenerState>,
  pumping: AtomicBool,
}

impl UdpListenerStream {
  fn new(udp: Arc<UdpStream>) -> Arc<UdpListenerStream> {
    Arc::new(UdpListenerStream {
      udp,
      state: Mutex::new(UdpListenerState {
        substreams: HashMap::new(),
        accept_queue: VecDeque::new(),
        pending_accepts: VecDeque::new(),
      }),
      pumping: AtomicBool::new(false),
    })
  }

  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.udp.local_addr()
  }

  fn processor(&self) -> Option<Arc<SocketProcessor>> {
    self.udp.processor.upgrade()
  }

  /// Waits for a pseudo-connection: the first datagram from a source not
  /// seen before produces a new sub-stream.
  pub fn accept(
    self: &Arc<Self>,
    handler: UdpAcceptHandler,
    ctx: &Arc<RequestContainer>,
  ) -> Result<OperationWaiter> {
    let Some(processor) = self.processor() else {
      return Err(Error::InvalidState("socket processor is gone"));
    };
    if self.udp.is_closed() {
      return Err(Error::ClosedStream);
    }
    let request = Request::new();
    let cell: ResultCell<Arc<UdpSubStream>> = Arc::new(Mutex::new(None));
    set_result_completion(&request, ctx, &cell, handler)?;

    let listener = Arc::clone(self);
    let request_for_op = Arc::clone(&request);
    let op = Box::new(move || {
      let mut state = listener.state.lock();
      if let Some(substream) = state.accept_queue.pop_front() {
        drop(state);
        finish(&request_for_op, &cell, IoResult::Ok, Some(substream));
        return;
      }
      state.pending_accepts.push_back(PendingAccept {
        request: Arc::clone(&request_for_op),
        cell: Arc::clone(&cell),
      });
    });
    processor.submit_op(request, op)
  }

  fn send_to(
    &self,
    buffer: IoBuffer,
    to: SocketAddr,
    handler: WriteHandler,
    ctx: &Arc<RequestContainer>,
  ) -> Result<OperationWaiter> {
    self.udp.write_to(buffer, to, handler, ctx)
  }

  pub fn close(&self) {
    let (substreams, pending) = {
      let mut state = self.state.lock();
      state.accept_queue.clear();
      let substreams: Vec<_> = state.substreams.values().cloned().collect();
      let pending: Vec<_> = state.pending_accepts.drain(..).collect();
      (substreams, pending)
    };
    for substream in substreams {
      substream.close();
    }
    for pending in pending {
      finish(&pending.request, &pending.cell, IoResult::Closed, None);
    }
    self.udp.close();
  }

  pub fn is_closed(&self) -> bool {
    self.udp.is_closed()
  }

  /// Keeps one receive in flight, routing datagrams to sub-streams.
  fn pump(self: &Arc<Self>) {
    if self.pumping.swap(true, Ordering::AcqRel) {
      return;
    }
    self.arm_receive();
  }

  fn arm_receive(self: &Arc<Self>) {
    let fd = self.udp.inner.fd;
    let dispatcher = Arc::clone(&self.udp.inner.dispatcher);
    let listener = Arc::clone(self);
    dispatcher.submit(IoCb {
      fd,
      op: IoOp::RecvFrom { max: UDP_DATAGRAM_MAX },
      offset: Offset::None,
      buf: vec![0; UDP_DATAGRAM_MAX],
      pos: 0,
      seek_done: true,
      callback: Some(Box::new(move |outcome| match outcome {
        IoOutcome::RecvFrom { result: Ok(_), data, from: Some(from) } => {
          listener.route_datagram(from, IoBuffer::from_vec(data));
          listener.arm_receive();
        }
        IoOutcome::RecvFrom { result: Ok(_), .. } => {
          listener.arm_receive();
        }
        IoOutcome::RecvFrom { result: Err(err), .. } => {
          tracing::warn!(%err, "udp listener receive failed");
          listener.arm_receive();
        }
        IoOutcome::Canceled | IoOutcome::Closed => {
          listener.on_pump_stopped();
        }
        _ => listener.on_pump_stopped(),
      })),
    });
  }

  fn route_datagram(self: &Arc<Self>, from: SocketAddr, datagram: IoBuffer) {
    let (substream, newly_accepted) = {
      let mut state = self.state.lock();
      match state.substreams.get(&from) {
        Some(substream) => (Arc::clone(substream), None),
        None => {
          let substream = Arc::new(UdpSubStream {
            peer: from,
            listener: Arc::downgrade(self),
            state: Mutex::new(SubStreamState {
              queue: VecDeque::new(),
              pending_read: None,
              closed: false,
            }),
          });
          state.substreams.insert(from, Arc::clone(&substream));
          let pending = state.pending_accepts.pop_front();
          if pending.is_none() {
            state.accept_queue.push_back(Arc::clone(&substream));
          }
          (substream, pending)
        }
      }
    };
    substream.push_datagram(datagram);
    if let Some(pending) = newly_accepted {
      finish(&pending.request, &pending.cell, IoResult::Ok, Some(substream));
    }
  }

  fn on_pump_stopped(self: &Arc<Self>) {
    self.pumping.store(false, Ordering::Release);
    let substreams: Vec<_> = {
      let state = self.state.lock();
      state.substreams.values().cloned().collect()
    };
    for substream in substreams {
      substream.close();
    }
    let pending: Vec<_> = {
      let mut state = self.state.lock();
      state.pending_accepts.drain(..).collect()
    };
    for pending in pending {
      finish(&pending.request, &pending.cell, IoResult::Closed, None);
    }
  }
}
