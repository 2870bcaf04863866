//! Platform I/O dispatcher: one thread multiplexing every native handle.
//!
//! A dedicated thread runs `poll(2)` over the registered descriptors. Slot
//! zero is the read end of a self-pipe; writing one byte wakes the loop
//! whenever the descriptor set changes. Each descriptor carries at most one
//! in-flight operation per direction (streams serialize their own reads and
//! writes), so a ready event maps directly to the callback to run.
//!
//! Closing is deferred: `close_handle` parks the descriptor and the loop
//! closes it only once it is out of the poll set. Closing a descriptor
//! while it is being polled can panic some kernels (observed on OSX), and
//! the ordering is kept as a contract of this dispatcher on every POSIX
//! target.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::sync::Mutex;

/// Positioning of one I/O operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offset {
  /// Sequential, at the current cursor.
  None,
  /// Absolute offset from the start.
  At(u64),
  /// Append at the end.
  End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
  In,
  Out,
}

/// What to execute once the descriptor is ready.
pub(crate) enum IoOp {
  /// Fill up to `max` bytes, finish once at least `min` arrived.
  Read { max: usize, min: usize },
  /// Receive one datagram of up to `max` bytes with its source address.
  RecvFrom { max: usize },
  Accept,
  /// Write the whole buffer.
  Write,
  SendTo(SocketAddr),
  /// Finish a non-blocking connect.
  Connect,
}

impl IoOp {
  fn direction(&self) -> Direction {
    match self {
      IoOp::Read { .. } | IoOp::RecvFrom { .. } | IoOp::Accept => {
        Direction::In
      }
      IoOp::Write | IoOp::SendTo(_) | IoOp::Connect => Direction::Out,
    }
  }
}

/// Outcome delivered to the operation callback, on the dispatcher thread.
pub(crate) enum IoOutcome {
  Read { result: io::Result<usize>, data: Vec<u8> },
  RecvFrom {
    result: io::Result<usize>,
    data: Vec<u8>,
    from: Option<SocketAddr>,
  },
  Accept { result: io::Result<(OwnedFd, SocketAddr)> },
  Write { result: io::Result<usize> },
  Connect { result: io::Result<()> },
  Canceled,
  Closed,
}

pub(crate) type IoCallback = Box<dyn FnOnce(IoOutcome) + Send + 'static>;

/// One in-flight operation on a descriptor.
pub(crate) struct IoCb {
  pub fd: RawFd,
  pub op: IoOp,
  pub offset: Offset,
  /// Read accumulation or data to write.
  pub buf: Vec<u8>,
  /// Bytes transferred so far.
  pub pos: usize,
  pub seek_done: bool,
  pub callback: Option<IoCallback>,
}

impl IoCb {
  fn finish(mut self, outcome: IoOutcome) {
    if let Some(callback) = self.callback.take() {
      callback(outcome);
    }
  }
}

enum Command {
  Submit(IoCb),
  Cancel { fd: RawFd, direction: Direction },
  CloseHandle { fd: RawFd },
  Shutdown,
}

struct Notifier {
  read_fd: OwnedFd,
  write_fd: OwnedFd,
}

impl Notifier {
  fn new() -> io::Result<Notifier> {
    let mut fds = [0i32; 2];
    #[cfg(target_os = "linux")]
    syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK))?;
    #[cfg(not(target_os = "linux"))]
    {
      syscall!(pipe(fds.as_mut_ptr()))?;
      for fd in fds {
        syscall!(fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK))?;
        syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
      }
    }
    Ok(Notifier {
      read_fd: unsafe { OwnedFd::from_raw_fd(fds[0]) },
      write_fd: unsafe { OwnedFd::from_raw_fd(fds[1]) },
    })
  }

  fn notify(&self) -> io::Result<()> {
    let byte: u8 = 1;
    let result = syscall!(write(
      self.write_fd.as_raw_fd(),
      &byte as *const u8 as *const libc::c_void,
      1,
    ));
    match result {
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
      other => other.map(|_| ()),
    }
  }

  fn drain(&self) {
    let mut scratch = [0u8; 64];
    loop {
      let res = unsafe {
        libc::read(
          self.read_fd.as_raw_fd(),
          scratch.as_mut_ptr() as *mut libc::c_void,
          scratch.len(),
        )
      };
      if res <= 0 {
        break;
      }
    }
  }
}

#[derive(Default)]
struct FdEntry {
  read: Option<IoCb>,
  write: Option<IoCb>,
}

impl FdEntry {
  fn is_empty(&self) -> bool {
    self.read.is_none() && self.write.is_none()
  }
}

/// Poll-based dispatcher thread handle.
pub struct PollDispatcher {
  tx: crossbeam_channel::Sender<Command>,
  notifier: Arc<Notifier>,
  thread: Mutex<Option<JoinHandle<()>>>,
}

impl PollDispatcher {
  pub fn new() -> io::Result<Arc<PollDispatcher>> {
    let notifier = Arc::new(Notifier::new()?);
    let (tx, rx) = crossbeam_channel::unbounded();
    let loop_notifier = Arc::clone(&notifier);
    let handle = thread::Builder::new()
      .name("vsm-io".into())
      .spawn(move || DispatchLoop::new(rx, loop_notifier).run())?;
    Ok(Arc::new(PollDispatcher {
      tx,
      notifier,
      thread: Mutex::new(Some(handle)),
    }))
  }

  pub(crate) fn submit(&self, cb: IoCb) {
    let _ = self.tx.send(Command::Submit(cb));
    let _ = self.notifier.notify();
  }

  pub(crate) fn cancel(&self, fd: RawFd, direction: Direction) {
    let _ = self.tx.send(Command::Cancel { fd, direction });
    let _ = self.notifier.notify();
  }

  /// Completes in-flight operations with `Closed` and closes the
  /// descriptor once it left the poll set.
  pub fn close_handle(&self, fd: RawFd) {
    let _ = self.tx.send(Command::CloseHandle { fd });
    let _ = self.notifier.notify();
  }

  /// Stops the dispatcher thread. All in-flight operations complete with
  /// `Closed`.
  pub fn shutdown(&self) {
    let _ = self.tx.send(Command::Shutdown);
    let _ = self.notifier.notify();
    if let Some(handle) = self.thread.lock().take() {
      let _ = handle.join();
    }
  }
}

impl Drop for PollDispatcher {
  fn drop(&mut self) {
    if self.thread.lock().is_some() {
      self.shutdown();
    }
  }
}

struct DispatchLoop {
  rx: crossbeam_channel::Receiver<Command>,
  notifier: Arc<Notifier>,
  entries: HashMap<RawFd, FdEntry>,
  pending_close: Vec<RawFd>,
}

enum Performed {
  Done,
  Retry(IoCb),
}

impl DispatchLoop {
  fn new(
    rx: crossbeam_channel::Receiver<Command>,
    notifier: Arc<Notifier>,
  ) -> DispatchLoop {
    DispatchLoop {
      rx,
      notifier,
      entries: HashMap::new(),
      pending_close: Vec::new(),
    }
  }

  fn run(mut self) {
    loop {
      if !self.drain_commands() {
        break;
      }
      // Descriptors parked for closing are no longer in the poll set;
      // now it is safe to actually close them.
      for fd in self.pending_close.drain(..) {
        let _ = syscall!(close(fd));
      }

      let mut fds = Vec::with_capacity(self.entries.len() + 1);
      fds.push(libc::pollfd {
        fd: self.notifier.read_fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
      });
      for (fd, entry) in &self.entries {
        let mut events = 0;
        if entry.read.is_some() {
          events |= libc::POLLIN;
        }
        if entry.write.is_some() {
          events |= libc::POLLOUT;
        }
        if events != 0 {
          fds.push(libc::pollfd { fd: *fd, events, revents: 0 });
        }
      }

      let res = unsafe {
        libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1)
      };
      if res < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
          continue;
        }
        tracing::error!(%err, "poll failed, dispatcher stopping");
        break;
      }

      if fds[0].revents != 0 {
        self.notifier.drain();
      }

      for slot in &fds[1..] {
        if slot.revents == 0 {
          continue;
        }
        let readable =
          slot.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0;
        let writable =
          slot.revents & (libc::POLLOUT | libc::POLLERR | libc::POLLHUP) != 0;
        if readable {
          self.dispatch(slot.fd, Direction::In);
        }
        if writable {
          self.dispatch(slot.fd, Direction::Out);
        }
      }
      self.entries.retain(|_, entry| !entry.is_empty());
    }
    self.terminate();
  }

  /// Applies queued commands. Returns false on shutdown.
  fn drain_commands(&mut self) -> bool {
    while let Ok(command) = self.rx.try_recv() {
      match command {
        Command::Submit(cb) => {
          let direction = cb.op.direction();
          let entry = self.entries.entry(cb.fd).or_default();
          let slot = match direction {
            Direction::In => &mut entry.read,
            Direction::Out => &mut entry.write,
          };
          if let Some(previous) = slot.replace(cb) {
            // The stream contract forbids two in-flight operations per
            // direction; drop the stale one as failed.
            tracing::error!(
              fd = previous.fd,
              "operation submitted while another is in flight"
            );
            previous.finish(IoOutcome::Canceled);
          }
        }
        Command::Cancel { fd, direction } => {
          if let Some(entry) = self.entries.get_mut(&fd) {
            let slot = match direction {
              Direction::In => &mut entry.read,
              Direction::Out => &mut entry.write,
            };
            if let Some(cb) = slot.take() {
              cb.finish(IoOutcome::Canceled);
            }
          }
        }
        Command::CloseHandle { fd } => {
          if let Some(mut entry) = self.entries.remove(&fd) {
            if let Some(cb) = entry.read.take() {
              cb.finish(IoOutcome::Closed);
            }
            if let Some(cb) = entry.write.take() {
              cb.finish(IoOutcome::Closed);
            }
          }
          self.pending_close.push(fd);
        }
        Command::Shutdown => return false,
      }
    }
    true
  }

  fn dispatch(&mut self, fd: RawFd, direction: Direction) {
    let cb = {
      let Some(entry) = self.entries.get_mut(&fd) else { return };
      let slot = match direction {
        Direction::In => &mut entry.read,
        Direction::Out => &mut entry.write,
      };
      match slot.take() {
        Some(cb) => cb,
        None => return,
      }
    };
    match Self::perform(cb) {
      Performed::Done => {}
      Performed::Retry(cb) => {
        // Short transfer, keep waiting for readiness.
        let entry = self.entries.entry(fd).or_default();
        match direction {
          Direction::In => entry.read = Some(cb),
          Direction::Out => entry.write = Some(cb),
        }
      }
    }
  }

  fn apply_seek(cb: &mut IoCb) -> io::Result<()> {
    if cb.seek_done {
      return Ok(());
    }
    match cb.offset {
      Offset::None => {}
      Offset::At(offset) => {
        syscall!(lseek(cb.fd, offset as libc::off_t, libc::SEEK_SET))?;
      }
      Offset::End => {
        syscall!(lseek(cb.fd, 0, libc::SEEK_END))?;
      }
    }
    cb.seek_done = true;
    Ok(())
  }

  fn perform(mut cb: IoCb) -> Performed {
    match cb.op {
      IoOp::Read { max, min } => {
        if let Err(err) = Self::apply_seek(&mut cb) {
          let data = std::mem::take(&mut cb.buf);
          cb.finish(IoOutcome::Read { result: Err(err), data });
          return Performed::Done;
        }
        loop {
          let want = max - cb.pos;
          let res = unsafe {
            libc::read(
              cb.fd,
              cb.buf.as_mut_ptr().add(cb.pos) as *mut libc::c_void,
              want,
            )
          };
          if res > 0 {
            cb.pos += res as usize;
            if cb.pos >= min {
              break;
            }
            continue;
          }
          if res == 0 {
            // EOF: successful result with possibly fewer than min bytes.
            break;
          }
          let err = io::Error::last_os_error();
          match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => return Performed::Retry(cb),
            _ => {
              let data = std::mem::take(&mut cb.buf);
              cb.finish(IoOutcome::Read { result: Err(err), data });
              return Performed::Done;
            }
          }
        }
        let pos = cb.pos;
        let mut data = std::mem::take(&mut cb.buf);
        data.truncate(pos);
        cb.finish(IoOutcome::Read { result: Ok(pos), data });
        Performed::Done
      }
      IoOp::RecvFrom { max } => {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut addr_len =
          std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let res = unsafe {
          libc::recvfrom(
            cb.fd,
            cb.buf.as_mut_ptr() as *mut libc::c_void,
            max,
            0,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut addr_len,
          )
        };
        if res >= 0 {
          let n = res as usize;
          let mut data = std::mem::take(&mut cb.buf);
          data.truncate(n);
          let from = crate::io::addr::sockaddr_to_std(&storage);
          cb.finish(IoOutcome::RecvFrom { result: Ok(n), data, from });
          return Performed::Done;
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
          Some(libc::EINTR) | Some(libc::EAGAIN) => Performed::Retry(cb),
          _ => {
            let data = std::mem::take(&mut cb.buf);
            cb.finish(IoOutcome::RecvFrom {
              result: Err(err),
              data,
              from: None,
            });
            Performed::Done
          }
        }
      }
      IoOp::Accept => {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut addr_len =
          std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let res = unsafe {
          libc::accept(
            cb.fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut addr_len,
          )
        };
        if res >= 0 {
          let fd = unsafe { OwnedFd::from_raw_fd(res) };
          if let Err(err) = crate::io::set_nonblocking(res) {
            cb.finish(IoOutcome::Accept { result: Err(err) });
            return Performed::Done;
          }
          let peer = crate::io::addr::sockaddr_to_std(&storage)
            .unwrap_or_else(|| "0.0.0.0:0".parse().unwrap());
          cb.finish(IoOutcome::Accept { result: Ok((fd, peer)) });
          return Performed::Done;
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
          Some(libc::EINTR) | Some(libc::EAGAIN) => Performed::Retry(cb),
          _ => {
            cb.finish(IoOutcome::Accept { result: Err(err) });
            Performed::Done
          }
        }
      }
      IoOp::Write => {
        if let Err(err) = Self::apply_seek(&mut cb) {
          cb.finish(IoOutcome::Write { result: Err(err) });
          return Performed::Done;
        }
        loop {
          let res = unsafe {
            libc::write(
              cb.fd,
              cb.buf.as_ptr().add(cb.pos) as *const libc::c_void,
              cb.buf.len() - cb.pos,
            )
          };
          if res >= 0 {
            cb.pos += res as usize;
            if cb.pos >= cb.buf.len() {
              let pos = cb.pos;
              cb.finish(IoOutcome::Write { result: Ok(pos) });
              return Performed::Done;
            }
            continue;
          }
          let err = io::Error::last_os_error();
          match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => return Performed::Retry(cb),
            _ => {
              cb.finish(IoOutcome::Write { result: Err(err) });
              return Performed::Done;
            }
          }
        }
      }
      IoOp::SendTo(addr) => {
        let (storage, len) = crate::io::addr::std_to_sockaddr(&addr);
        let res = unsafe {
          libc::sendto(
            cb.fd,
            cb.buf.as_ptr() as *const libc::c_void,
            cb.buf.len(),
            0,
            &storage as *const _ as *const libc::sockaddr,
            len,
          )
        };
        if res >= 0 {
          cb.finish(IoOutcome::Write { result: Ok(res as usize) });
          return Performed::Done;
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
          Some(libc::EINTR) | Some(libc::EAGAIN) => Performed::Retry(cb),
          _ => {
            cb.finish(IoOutcome::Write { result: Err(err) });
            Performed::Done
          }
        }
      }
      IoOp::Connect => {
        let mut so_error: libc::c_int = 0;
        let mut len =
          std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let res = unsafe {
          libc::getsockopt(
            cb.fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut so_error as *mut _ as *mut libc::c_void,
            &mut len,
          )
        };
        let result = if res < 0 {
          Err(io::Error::last_os_error())
        } else if so_error != 0 {
          Err(io::Error::from_raw_os_error(so_error))
        } else {
          Ok(())
        };
        cb.finish(IoOutcome::Connect { result });
        Performed::Done
      }
    }
  }

  fn terminate(mut self) {
    for (_, mut entry) in self.entries.drain() {
      if let Some(cb) = entry.read.take() {
        cb.finish(IoOutcome::Closed);
      }
      if let Some(cb) = entry.write.take() {
        cb.finish(IoOutcome::Closed);
      }
    }
    for fd in self.pending_close.drain(..) {
      let _ = syscall!(close(fd));
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::mpsc;
  use std::time::Duration;

  fn pipe_pair() -> (RawFd, RawFd) {
    let mut fds = [0i32; 2];
    syscall!(pipe(fds.as_mut_ptr())).unwrap();
    for fd in fds {
      syscall!(fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK)).unwrap();
    }
    (fds[0], fds[1])
  }

  #[test]
  fn test_read_completes_on_data() {
    let dispatcher = PollDispatcher::new().unwrap();
    let (rd, wr) = pipe_pair();

    let (tx, rx) = mpsc::channel();
    dispatcher.submit(IoCb {
      fd: rd,
      op: IoOp::Read { max: 16, min: 1 },
      offset: Offset::None,
      buf: vec![0; 16],
      pos: 0,
      seek_done: false,
      callback: Some(Box::new(move |outcome| {
        tx.send(outcome).unwrap();
      })),
    });

    unsafe {
      libc::write(wr, b"hello".as_ptr() as *const libc::c_void, 5);
    }
    match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
      IoOutcome::Read { result, data } => {
        assert_eq!(result.unwrap(), 5);
        assert_eq!(&data, b"hello");
      }
      _ => panic!("unexpected outcome"),
    }

    dispatcher.close_handle(rd);
    dispatcher.close_handle(wr);
    dispatcher.shutdown();
  }

  #[test]
  fn test_min_bytes_accumulated_over_short_reads() {
    let dispatcher = PollDispatcher::new().unwrap();
    let (rd, wr) = pipe_pair();

    let (tx, rx) = mpsc::channel();
    dispatcher.submit(IoCb {
      fd: rd,
      op: IoOp::Read { max: 8, min: 6 },
      offset: Offset::None,
      buf: vec![0; 8],
      pos: 0,
      seek_done: false,
      callback: Some(Box::new(move |outcome| {
        tx.send(outcome).unwrap();
      })),
    });

    unsafe {
      libc::write(wr, b"abc".as_ptr() as *const libc::c_void, 3);
    }
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    unsafe {
      libc::write(wr, b"def".as_ptr() as *const libc::c_void, 3);
    }
    match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
      IoOutcome::Read { result, data } => {
        assert_eq!(result.unwrap(), 6);
        assert_eq!(&data, b"abcdef");
      }
      _ => panic!("unexpected outcome"),
    }

    dispatcher.close_handle(rd);
    dispatcher.close_handle(wr);
    dispatcher.shutdown();
  }

  #[test]
  fn test_cancel_fires_canceled() {
    let dispatcher = PollDispatcher::new().unwrap();
    let (rd, wr) = pipe_pair();

    let (tx, rx) = mpsc::channel();
    dispatcher.submit(IoCb {
      fd: rd,
      op: IoOp::Read { max: 4, min: 1 },
      offset: Offset::None,
      buf: vec![0; 4],
      pos: 0,
      seek_done: false,
      callback: Some(Box::new(move |outcome| {
        tx.send(matches!(outcome, IoOutcome::Canceled)).unwrap();
      })),
    });
    dispatcher.cancel(rd, Direction::In);
    assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());

    dispatcher.close_handle(rd);
    dispatcher.close_handle(wr);
    dispatcher.shutdown();
  }

  #[test]
  fn test_close_handle_fires_closed_for_pending() {
    let dispatcher = PollDispatcher::new().unwrap();
    let (rd, wr) = pipe_pair();

    let (tx, rx) = mpsc::channel();
    dispatcher.submit(IoCb {
      fd: rd,
      op: IoOp::Read { max: 4, min: 1 },
      offset: Offset::None,
      buf: vec![0; 4],
      pos: 0,
      seek_done: false,
      callback: Some(Box::new(move |outcome| {
        tx.send(matches!(outcome, IoOutcome::Closed)).unwrap();
      })),
    });
    dispatcher.close_handle(rd);
    assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());

    dispatcher.close_handle(wr);
    dispatcher.shutdown();
  }
}
