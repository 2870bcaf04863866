//! Error taxonomy of the runtime.
//!
//! Synchronous API misuse is reported through [`Error`]. Asynchronous
//! operations never fail synchronously; their outcome arrives in the
//! completion callback as an [`IoResult`].

use std::io;

/// Errors returned by synchronous runtime calls.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// Precondition violated by the caller (bad open mode, zero interval, ...).
  #[error("invalid parameter: {0}")]
  InvalidParam(&'static str),

  /// State-machine misuse (handler set on non-pending request, double
  /// enable, second read while one is in flight).
  #[error("invalid operation: {0}")]
  InvalidOp(&'static str),

  /// A required handler was not set.
  #[error("required handler missing: {0}")]
  NullHandler(&'static str),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("already exists: {0}")]
  AlreadyExists(String),

  #[error("permission denied: {0}")]
  PermissionDenied(String),

  #[error("already opened: {0}")]
  AlreadyOpened(String),

  #[error("invalid state: {0}")]
  InvalidState(&'static str),

  /// I/O attempted against a closed stream.
  #[error("stream is closed")]
  ClosedStream,

  #[error("parse error: {0}")]
  Parse(String),

  #[error("value not convertible: {0}")]
  NotConvertible(String),

  /// Malformed message or action payload, surfaced by upper layers.
  #[error("malformed payload: {0}")]
  Format(String),

  #[error("internal error: {0}")]
  Internal(String),

  #[error(transparent)]
  Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of an asynchronous I/O operation, propagated in callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoResult {
  Ok,
  /// Successful result with possibly fewer bytes than the requested minimum.
  EndOfFile,
  /// The stream was closed while the operation was pending.
  Closed,
  Canceled,
  TimedOut,
  PermissionDenied,
  ConnectionRefused,
  /// File lock could not be taken.
  LockError,
  OtherFailure,
}

impl IoResult {
  pub fn is_ok(self) -> bool {
    matches!(self, IoResult::Ok)
  }

  /// Maps an OS error to the closest outcome kind.
  pub fn from_os_error(errno: i32) -> Self {
    match errno {
      libc::EACCES | libc::EPERM => IoResult::PermissionDenied,
      libc::ECONNREFUSED => IoResult::ConnectionRefused,
      libc::ECANCELED => IoResult::Canceled,
      libc::ETIMEDOUT => IoResult::TimedOut,
      libc::EPIPE | libc::ECONNRESET | libc::EBADF => IoResult::Closed,
      _ => IoResult::OtherFailure,
    }
  }

  pub fn from_io_error(err: &io::Error) -> Self {
    match err.raw_os_error() {
      Some(errno) => Self::from_os_error(errno),
      None => IoResult::OtherFailure,
    }
  }
}
