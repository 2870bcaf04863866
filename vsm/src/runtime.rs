//! Explicit runtime object owning every processor.
//!
//! There are no global singletons: the application constructs one
//! [`Runtime`] at startup, which builds the timer, file, serial and socket
//! processors plus the transport detector in dependency order, all sharing
//! one platform dispatcher. Components needing a processor receive it from
//! here.

use std::sync::Arc;

use crate::detector::TransportDetector;
use crate::error::Result;
use crate::io::dispatcher::PollDispatcher;
use crate::io::file::FileProcessor;
use crate::io::serial::SerialProcessor;
use crate::io::socket::SocketProcessor;
use crate::timer::TimerProcessor;

pub struct Runtime {
  dispatcher: Arc<PollDispatcher>,
  timer: Arc<TimerProcessor>,
  files: Arc<FileProcessor>,
  serial: Arc<SerialProcessor>,
  sockets: Arc<SocketProcessor>,
  detector: Arc<TransportDetector>,
}

impl Runtime {
  /// Builds and enables all processors.
  pub fn new() -> Result<Runtime> {
    let dispatcher = PollDispatcher::new()?;
    let timer = TimerProcessor::new();
    timer.enable()?;
    let files = FileProcessor::with_dispatcher(Arc::clone(&dispatcher));
    files.enable()?;
    let serial = SerialProcessor::with_dispatcher(Arc::clone(&dispatcher));
    serial.enable()?;
    let sockets = SocketProcessor::with_dispatcher(Arc::clone(&dispatcher));
    sockets.enable()?;
    let detector = TransportDetector::new(
      Arc::clone(&timer),
      Arc::clone(&sockets),
      Arc::clone(&serial),
    );
    detector.enable()?;
    Ok(Runtime { dispatcher, timer, files, serial, sockets, detector })
  }

  pub fn dispatcher(&self) -> &Arc<PollDispatcher> {
    &self.dispatcher
  }

  pub fn timer_processor(&self) -> &Arc<TimerProcessor> {
    &self.timer
  }

  pub fn file_processor(&self) -> &Arc<FileProcessor> {
    &self.files
  }

  pub fn serial_processor(&self) -> &Arc<SerialProcessor> {
    &self.serial
  }

  pub fn socket_processor(&self) -> &Arc<SocketProcessor> {
    &self.sockets
  }

  pub fn transport_detector(&self) -> &Arc<TransportDetector> {
    &self.detector
  }

  /// Tears everything down in reverse dependency order. Also invoked on
  /// drop; calling it explicitly gives deterministic shutdown points.
  pub fn shutdown(&self) {
    self.detector.disable();
    self.sockets.disable();
    self.serial.disable();
    self.files.disable();
    self.timer.disable();
    self.dispatcher.shutdown();
  }
}

impl Drop for Runtime {
  fn drop(&mut self) {
    self.shutdown();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_runtime_starts_and_stops() {
    let runtime = Runtime::new().unwrap();
    runtime.shutdown();
  }

  #[test]
  fn test_shutdown_is_idempotent() {
    let runtime = Runtime::new().unwrap();
    runtime.shutdown();
    runtime.shutdown();
    drop(runtime);
  }
}
