//! File processor: opens regular files and devices as asynchronous streams.

use std::ffi::CString;
use std::os::fd::RawFd;
use std::sync::Arc;

use crate::buf::IoBuffer;
use crate::error::{Error, IoResult, Result};
use crate::io::dispatcher::{Offset, PollDispatcher};
use crate::io::stream::{
  FdStream, IoStream, ReadHandler, StreamKind, WriteHandler,
};
use crate::request::container::RequestContainer;
use crate::request::operation_waiter::OperationWaiter;
use crate::request::worker::RequestWorker;

/// How to open a file, parsed from a C-style mode string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenMode {
  pub read: bool,
  pub write: bool,
  pub create: bool,
  pub truncate: bool,
  /// Fail if the file already exists.
  pub exclusive: bool,
}

impl OpenMode {
  /// Parses `"r"`, `"w"`, `"r+"`, `"w+"`, `"rx"` and friends.
  ///
  /// `r` opens for reading, `w` for writing (created and truncated), `+`
  /// adds the other direction, `x` demands exclusive creation.
  pub fn parse(mode: &str) -> Result<OpenMode> {
    let mut result = OpenMode::default();
    for ch in mode.chars() {
      match ch {
        'r' => result.read = true,
        'w' => {
          result.write = true;
          result.create = true;
          result.truncate = true;
        }
        '+' => {
          result.read = true;
          result.write = true;
        }
        'x' => result.exclusive = true,
        _ => return Err(Error::InvalidParam("unknown open mode character")),
      }
    }
    if !result.read && !result.write {
      return Err(Error::InvalidParam("open mode selects no direction"));
    }
    Ok(result)
  }

  fn flags(&self) -> libc::c_int {
    let mut flags = match (self.read, self.write) {
      (true, true) => libc::O_RDWR,
      (false, true) => libc::O_WRONLY,
      _ => libc::O_RDONLY,
    };
    if self.create {
      flags |= libc::O_CREAT;
    }
    if self.truncate && !self.exclusive {
      flags |= libc::O_TRUNC;
    }
    if self.exclusive {
      flags |= libc::O_CREAT | libc::O_EXCL;
    }
    flags
  }
}

/// Worker owning the platform dispatcher and every file stream's requests.
pub struct FileProcessor {
  worker: Arc<RequestWorker>,
  container: Arc<RequestContainer>,
  dispatcher: Arc<PollDispatcher>,
}

impl FileProcessor {
  pub fn new() -> Result<Arc<FileProcessor>> {
    let dispatcher = PollDispatcher::new()?;
    Ok(Self::with_dispatcher(dispatcher))
  }

  /// Shares an existing dispatcher, letting several processors multiplex
  /// one poll thread.
  pub fn with_dispatcher(
    dispatcher: Arc<PollDispatcher>,
  ) -> Arc<FileProcessor> {
    let (worker, container) = RequestWorker::single("file processor");
    Arc::new(FileProcessor { worker, container, dispatcher })
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

  pub(crate) fn dispatcher(&self) -> &Arc<PollDispatcher> {
    &self.dispatcher
  }

  /// Opens `name` and wraps it in a stream served by this processor.
  pub fn open(&self, name: &str, mode: OpenMode) -> Result<Arc<FileStream>> {
    let fd = open_fd(name, mode.flags())?;
    Ok(Arc::new(FileStream {
      inner: Arc::new(FdStream::new(
        name,
        StreamKind::File,
        fd,
        Arc::clone(&self.dispatcher),
        Arc::clone(&self.container),
      )),
    }))
  }

  pub(crate) fn wrap_fd(
    &self,
    name: &str,
    kind: StreamKind,
    fd: RawFd,
  ) -> Arc<FileStream> {
    Arc::new(FileStream {
      inner: Arc::new(FdStream::new(
        name,
        kind,
        fd,
        Arc::clone(&self.dispatcher),
        Arc::clone(&self.container),
      )),
    })
  }
}

pub(crate) fn open_fd(name: &str, flags: libc::c_int) -> Result<RawFd> {
  let path = CString::new(name)
    .map_err(|_| Error::InvalidParam("path contains NUL"))?;
  let fd = unsafe {
    libc::open(
      path.as_ptr(),
      flags | libc::O_NONBLOCK | libc::O_CLOEXEC,
      0o644,
    )
  };
  if fd < 0 {
    let err = std::io::Error::last_os_error();
    return Err(match err.raw_os_error() {
      Some(libc::ENOENT) => Error::NotFound(name.into()),
      Some(libc::EACCES) | Some(libc::EPERM) => {
        Error::PermissionDenied(name.into())
      }
      Some(libc::EEXIST) => Error::AlreadyExists(name.into()),
      Some(libc::EBUSY) => Error::AlreadyOpened(name.into()),
      _ => Error::Io(err),
    });
  }
  Ok(fd)
}

/// Stream over a regular file or character device.
pub struct FileStream {
  inner: Arc<FdStream>,
}

impl FileStream {
  pub(crate) fn fd(&self) -> RawFd {
    self.inner.fd
  }
}

impl IoStream for FileStream {
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

  fn lock(&self) -> Result<()> {
    flock(self.inner.fd, libc::LOCK_EX)
  }

  fn try_lock(&self) -> Result<()> {
    flock(self.inner.fd, libc::LOCK_EX | libc::LOCK_NB)
  }

  fn unlock(&self) -> Result<()> {
    flock(self.inner.fd, libc::LOCK_UN)
  }
}

fn flock(fd: RawFd, operation: libc::c_int) -> Result<()> {
  match syscall!(flock(fd, operation)) {
    Ok(_) => Ok(()),
    Err(err) if err.raw_os_error() == Some(libc::EWOULDBLOCK) => {
      Err(Error::InvalidState("file is locked by another process"))
    }
    Err(err) => Err(Error::Io(err)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::mpsc;
  use std::time::Duration;

  #[test]
  fn test_open_mode_parse() {
    assert_eq!(
      OpenMode::parse("r").unwrap(),
      OpenMode { read: true, ..Default::default() }
    );
    let rw = OpenMode::parse("w+").unwrap();
    assert!(rw.read && rw.write && rw.create);
    assert!(OpenMode::parse("z").is_err());
    assert!(OpenMode::parse("").is_err());
  }

  #[test]
  fn test_open_missing_file_not_found() {
    let processor = FileProcessor::new().unwrap();
    processor.enable().unwrap();
    let result =
      processor.open("/definitely/not/here", OpenMode::parse("r").unwrap());
    assert!(matches!(result, Err(Error::NotFound(_))));
    processor.disable();
  }

  #[test]
  fn test_write_then_read_roundtrip() {
    let processor = FileProcessor::new().unwrap();
    processor.enable().unwrap();
    let (_worker, ctx) = RequestWorker::single("file test ctx");
    _worker.enable().unwrap();

    let path = format!("/tmp/vsm_file_test_{}.bin", std::process::id());
    let stream =
      processor.open(&path, OpenMode::parse("w+").unwrap()).unwrap();

    let (tx, rx) = mpsc::channel();
    let tx2 = tx.clone();
    let op = stream
      .write(
        IoBuffer::from_static(b"runtime payload"),
        Offset::At(0),
        Box::new(move |result| tx2.send(result).unwrap()),
        &ctx,
      )
      .unwrap();
    assert_eq!(
      rx.recv_timeout(Duration::from_secs(2)).unwrap(),
      IoResult::Ok
    );
    assert!(op.wait(false, Some(Duration::from_secs(2))));

    let (tx, rx) = mpsc::channel();
    stream
      .read(
        64,
        1,
        Offset::At(0),
        Box::new(move |result, data| tx.send((result, data)).unwrap()),
        &ctx,
      )
      .unwrap();
    let (result, data) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(result, IoResult::Ok);
    assert_eq!(data.as_slice(), b"runtime payload");

    stream.close();
    _worker.disable();
    processor.disable();
    std::fs::remove_file(&path).ok();
  }

  #[test]
  fn test_second_read_while_active_fails() {
    let processor = FileProcessor::new().unwrap();
    processor.enable().unwrap();
    let (worker, ctx) = RequestWorker::single("file test ctx2");
    worker.enable().unwrap();

    // A fifo never becomes readable without a writer, keeping the first
    // read in flight.
    let path = format!("/tmp/vsm_fifo_test_{}", std::process::id());
    let cpath = CString::new(path.clone()).unwrap();
    unsafe {
      libc::mkfifo(cpath.as_ptr(), 0o644);
    }
    let fd = unsafe {
      libc::open(cpath.as_ptr(), libc::O_RDWR | libc::O_NONBLOCK)
    };
    assert!(fd >= 0);
    let stream = processor.wrap_fd(&path, StreamKind::File, fd);

    let first = stream.read(
      16,
      1,
      Offset::None,
      Box::new(|_, _| {}),
      &ctx,
    );
    assert!(first.is_ok());
    std::thread::sleep(Duration::from_millis(50));
    let second = stream.read(
      16,
      1,
      Offset::None,
      Box::new(|_, _| {}),
      &ctx,
    );
    assert!(matches!(second, Err(Error::InvalidOp(_))));

    stream.close();
    worker.disable();
    processor.disable();
    std::fs::remove_file(&path).ok();
  }
}
