//! Cross-process serial port arbiter.
//!
//! Two VSM processes probing the same serial device would corrupt each
//! other's detection exchanges. The arbiter serializes access with an
//! advisory lock on a per-device file under the system temp directory:
//! acquire before probing, release (drop) once the stream is closed.

use std::ffi::CString;
use std::os::fd::RawFd;

use crate::error::{Error, Result};

const ARBITER_PREFIX: &str = "vsm-port-";
/// Longest generated lock file name.
const ARBITER_NAME_MAX_LEN: usize = 100;

/// Held while a serial device is being probed or used.
pub struct SerialArbiter {
  fd: RawFd,
  path: String,
}

impl SerialArbiter {
  /// Takes the cross-process lock for `device`. Fails with
  /// [`Error::AlreadyOpened`] when another process holds it.
  pub fn acquire(device: &str) -> Result<SerialArbiter> {
    let path = Self::lock_path(device);
    let cpath = CString::new(path.clone())
      .map_err(|_| Error::InvalidParam("device name contains NUL"))?;
    let fd = unsafe {
      libc::open(
        cpath.as_ptr(),
        libc::O_RDWR | libc::O_CREAT | libc::O_CLOEXEC,
        0o666,
      )
    };
    if fd < 0 {
      return Err(Error::Io(std::io::Error::last_os_error()));
    }
    match syscall!(flock(fd, libc::LOCK_EX | libc::LOCK_NB)) {
      Ok(_) => Ok(SerialArbiter { fd, path }),
      Err(err) => {
        let _ = syscall!(close(fd));
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
          Err(Error::AlreadyOpened(device.into()))
        } else {
          Err(Error::Io(err))
        }
      }
    }
  }

  pub fn path(&self) -> &str {
    &self.path
  }

  fn lock_path(device: &str) -> String {
    let sanitized: String = device
      .chars()
      .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
      .collect();
    let mut name = format!("{ARBITER_PREFIX}{sanitized}");
    name.truncate(ARBITER_NAME_MAX_LEN);
    format!("{}/{name}.lock", std::env::temp_dir().display())
  }
}

impl Drop for SerialArbiter {
  fn drop(&mut self) {
    let _ = syscall!(flock(self.fd, libc::LOCK_UN));
    let _ = syscall!(close(self.fd));
  }
}
