//! Serial port streams: termios configuration and device enumeration.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::io::dispatcher::PollDispatcher;
use crate::io::file::{FileProcessor, FileStream, open_fd};
use crate::io::stream::StreamKind;

/// Serial line settings applied at open time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialMode {
  pub baud: u32,
  /// Character size in bits, 5 to 8.
  pub char_size: u8,
  /// One or two stop bits.
  pub stop_bits: u8,
  pub parity_check: bool,
  /// Odd parity when checking is enabled; even otherwise.
  pub parity_odd: bool,
  pub read_timeout: Duration,
}

impl Default for SerialMode {
  fn default() -> Self {
    SerialMode {
      baud: 57600,
      char_size: 8,
      stop_bits: 1,
      parity_check: false,
      parity_odd: false,
      read_timeout: Duration::from_millis(100),
    }
  }
}

/// Supported baud constants, ascending.
const BAUD_TABLE: &[(u32, libc::speed_t)] = &[
  (1200, libc::B1200),
  (2400, libc::B2400),
  (4800, libc::B4800),
  (9600, libc::B9600),
  (19200, libc::B19200),
  (38400, libc::B38400),
  (57600, libc::B57600),
  (115200, libc::B115200),
  (230400, libc::B230400),
];

/// Rounds to the nearest supported baud constant.
fn nearest_baud(baud: u32) -> (u32, libc::speed_t) {
  let mut best = BAUD_TABLE[0];
  let mut best_diff = u32::MAX;
  for &(value, constant) in BAUD_TABLE {
    let diff = value.abs_diff(baud);
    if diff < best_diff {
      best_diff = diff;
      best = (value, constant);
    }
  }
  best
}

/// Serial processor: opens tty devices as asynchronous streams.
///
/// Reuses the file processor machinery; only the open path differs (raw
/// termios configuration, no controlling terminal).
pub struct SerialProcessor {
  files: Arc<FileProcessor>,
}

impl SerialProcessor {
  pub fn new() -> Result<Arc<SerialProcessor>> {
    Ok(Arc::new(SerialProcessor { files: FileProcessor::new()? }))
  }

  pub fn with_dispatcher(
    dispatcher: Arc<PollDispatcher>,
  ) -> Arc<SerialProcessor> {
    Arc::new(SerialProcessor {
      files: FileProcessor::with_dispatcher(dispatcher),
    })
  }

  pub fn enable(&self) -> Result<()> {
    self.files.enable()
  }

  pub fn disable(&self) {
    self.files.disable();
  }

  /// Opens a serial device and applies `mode`.
  pub fn open(
    &self,
    name: &str,
    mode: &SerialMode,
  ) -> Result<Arc<FileStream>> {
    if !(5..=8).contains(&mode.char_size) {
      return Err(Error::InvalidParam("char size must be 5..=8 bits"));
    }
    if !(1..=2).contains(&mode.stop_bits) {
      return Err(Error::InvalidParam("stop bits must be 1 or 2"));
    }
    let fd = open_fd(name, libc::O_RDWR | libc::O_NOCTTY)?;
    if let Err(err) = configure_tty(fd, mode) {
      let _ = syscall!(close(fd));
      return Err(err);
    }
    Ok(self.files.wrap_fd(name, StreamKind::Serial, fd))
  }

  /// Lists serial device nodes present on the system.
  pub fn enumerate_ports() -> Vec<String> {
    const PREFIXES: &[&str] = if cfg!(target_os = "macos") {
      &["cu.", "tty."]
    } else {
      &["ttyS", "ttyUSB", "ttyACM", "ttyAMA", "rfcomm"]
    };
    let mut ports = Vec::new();
    let Ok(entries) = std::fs::read_dir("/dev") else {
      return ports;
    };
    for entry in entries.flatten() {
      let file_name = entry.file_name();
      let Some(name) = file_name.to_str() else { continue };
      if PREFIXES.iter().any(|p| name.starts_with(p)) {
        ports.push(format!("/dev/{name}"));
      }
    }
    ports.sort();
    ports
  }
}

fn configure_tty(fd: RawFd, mode: &SerialMode) -> Result<()> {
  let mut tio: libc::termios = unsafe { std::mem::zeroed() };
  syscall!(tcgetattr(fd, &mut tio))?;

  unsafe { libc::cfmakeraw(&mut tio) };

  tio.c_cflag &= !(libc::CSIZE | libc::CSTOPB | libc::PARENB | libc::PARODD);
  tio.c_cflag |= match mode.char_size {
    5 => libc::CS5,
    6 => libc::CS6,
    7 => libc::CS7,
    _ => libc::CS8,
  };
  if mode.stop_bits == 2 {
    tio.c_cflag |= libc::CSTOPB;
  }
  if mode.parity_check {
    tio.c_cflag |= libc::PARENB;
    if mode.parity_odd {
      tio.c_cflag |= libc::PARODD;
    }
    tio.c_iflag |= libc::INPCK;
  }
  tio.c_cflag |= libc::CLOCAL | libc::CREAD;

  // The dispatcher polls before reading, VMIN/VTIME only shape what a
  // ready read returns.
  tio.c_cc[libc::VMIN] = 0;
  let deciseconds = (mode.read_timeout.as_millis() / 100).min(255) as u8;
  tio.c_cc[libc::VTIME] = deciseconds;

  let (_, speed) = nearest_baud(mode.baud);
  unsafe {
    libc::cfsetispeed(&mut tio, speed);
    libc::cfsetospeed(&mut tio, speed);
  }

  syscall!(tcsetattr(fd, libc::TCSANOW, &tio))?;
  syscall!(tcflush(fd, libc::TCIOFLUSH))?;
  Ok(())
}
