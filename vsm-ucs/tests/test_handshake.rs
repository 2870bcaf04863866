use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use vsm::io::socket::SocketProcessor;
use vsm::timer::TimerProcessor;
use vsm_ucs::device::{Device, Subsystem};
use vsm_ucs::property::{PropertyField, Value};
use vsm_ucs::server::{UcsConfig, UcsProcessor};
use vsm_ucs::wire::{
  FrameReader, StatusCode, SUPPORTED_UCS_VERSION_MAJOR,
  SUPPORTED_UCS_VERSION_MINOR, UcsMessage, decode_body, encode_frame,
};

/// Blocking test-side peer speaking the envelope protocol.
struct Client {
  stream: TcpStream,
  reader: FrameReader,
  pending: VecDeque<UcsMessage>,
}

impl Client {
  fn connect(port: u16) -> Client {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    Client { stream, reader: FrameReader::new(), pending: VecDeque::new() }
  }

  fn send(&mut self, message: &UcsMessage) {
    let frame = encode_frame(message).unwrap();
    self.stream.write_all(frame.as_slice()).unwrap();
  }

  /// Next message within `timeout`; `None` on timeout or peer close.
  fn recv(&mut self, timeout: Duration) -> Option<UcsMessage> {
    let deadline = Instant::now() + timeout;
    loop {
      if let Some(message) = self.pending.pop_front() {
        return Some(message);
      }
      let now = Instant::now();
      if now >= deadline {
        return None;
      }
      self
        .stream
        .set_read_timeout(Some(deadline - now))
        .unwrap();
      let mut buf = [0u8; 4096];
      match self.stream.read(&mut buf) {
        Ok(0) => return None,
        Ok(n) => {
          for body in self.reader.feed(&buf[..n]).unwrap() {
            self.pending.push_back(decode_body(&body).unwrap());
          }
        }
        Err(_) => return None,
      }
    }
  }

  /// Waits until the server drops the connection.
  fn wait_for_close(&mut self, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
      let now = Instant::now();
      if now >= deadline {
        return false;
      }
      self
        .stream
        .set_read_timeout(Some(deadline - now))
        .unwrap();
      let mut buf = [0u8; 4096];
      match self.stream.read(&mut buf) {
        Ok(0) => return true,
        Ok(_) => continue,
        Err(err)
          if err.kind() == std::io::ErrorKind::WouldBlock
            || err.kind() == std::io::ErrorKind::TimedOut =>
        {
          return false;
        }
        Err(_) => return true,
      }
    }
  }
}

struct Fixture {
  sockets: Arc<SocketProcessor>,
  timer: Arc<TimerProcessor>,
  processor: Arc<UcsProcessor>,
}

impl Fixture {
  fn new(keep_alive_timeout: Duration) -> Fixture {
    let sockets = SocketProcessor::new().unwrap();
    sockets.enable().unwrap();
    let timer = TimerProcessor::new();
    timer.enable().unwrap();
    let processor = UcsProcessor::new(
      Arc::clone(&sockets),
      Arc::clone(&timer),
      UcsConfig {
        listen_address: "127.0.0.1".into(),
        listen_port: "0".into(),
        peer_id: 99,
        keep_alive_timeout,
      },
    );
    processor.enable().unwrap();
    Fixture { sockets, timer, processor }
  }

  fn port(&self) -> u16 {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
      if let Some(port) = self.processor.local_port() {
        return port;
      }
      assert!(Instant::now() < deadline, "listener never bound");
      std::thread::sleep(Duration::from_millis(10));
    }
  }

  fn teardown(self) {
    self.processor.disable();
    self.timer.disable();
    self.sockets.disable();
  }
}

fn sample_device() -> Arc<Device> {
  let device = Device::new(42, "simulated quad");
  let mut subsystem = Subsystem::new("flight_controller");
  subsystem.add_property(1, "altitude_amsl", Value::Float(0.0));
  subsystem.add_command(10, "arm", vec![]);
  device.build_registration(vec![], &[subsystem]).unwrap();
  device.enable().unwrap();
  device
}

#[test]
fn test_handshake_registration_and_telemetry() {
  let fixture = Fixture::new(Duration::ZERO);
  let device = sample_device();
  fixture
    .processor
    .register_device(Arc::clone(&device))
    .unwrap();

  let mut client = Client::connect(fixture.port());
  client.send(&UcsMessage::RegisterPeer {
    peer_id: 7,
    version_major: SUPPORTED_UCS_VERSION_MAJOR,
    version_minor: SUPPORTED_UCS_VERSION_MINOR,
  });

  // Server identifies itself first.
  match client.recv(Duration::from_secs(3)).unwrap() {
    UcsMessage::RegisterPeer { peer_id, version_major, version_minor } => {
      assert_eq!(peer_id, 99);
      assert_eq!(version_major, SUPPORTED_UCS_VERSION_MAJOR);
      assert_eq!(version_minor, SUPPORTED_UCS_VERSION_MINOR);
    }
    other => panic!("expected RegisterPeer, got {other:?}"),
  }

  // Then announces the pre-enabled device.
  let request_id = match client.recv(Duration::from_secs(3)).unwrap() {
    UcsMessage::RegisterDevice { request_id, registration } => {
      assert_eq!(registration.device_id, 42);
      assert_eq!(registration.name, "simulated quad");
      assert_eq!(registration.subsystems.len(), 1);
      request_id
    }
    other => panic!("expected RegisterDevice, got {other:?}"),
  };
  client.send(&UcsMessage::Response {
    request_id,
    device_id: 42,
    code: StatusCode::Ok,
  });

  // Telemetry travels as changed fields only.
  std::thread::sleep(Duration::from_millis(100));
  fixture.processor.update_device_status(
    42,
    &[
      PropertyField::new(1, Value::Float(10.0)),
      PropertyField::new(2, Value::Bool(true)),
    ],
    &[],
  );
  match client.recv(Duration::from_secs(3)).unwrap() {
    UcsMessage::DeviceStatus { device_id, fields, .. } => {
      assert_eq!(device_id, 42);
      assert_eq!(fields.len(), 2);
    }
    other => panic!("expected DeviceStatus, got {other:?}"),
  }

  fixture.processor.update_device_status(
    42,
    &[
      PropertyField::new(1, Value::Float(10.0)),
      PropertyField::new(2, Value::Bool(false)),
    ],
    &[],
  );
  match client.recv(Duration::from_secs(3)).unwrap() {
    UcsMessage::DeviceStatus { fields, .. } => {
      assert_eq!(fields, vec![PropertyField::new(2, Value::Bool(false))]);
    }
    other => panic!("expected DeviceStatus, got {other:?}"),
  }

  device.disable();
  fixture.teardown();
}

#[test]
fn test_incompatible_peer_gets_no_devices() {
  let fixture = Fixture::new(Duration::ZERO);
  let device = sample_device();
  fixture
    .processor
    .register_device(Arc::clone(&device))
    .unwrap();

  let mut client = Client::connect(fixture.port());
  client.send(&UcsMessage::RegisterPeer {
    peer_id: 8,
    version_major: 0,
    version_minor: 0,
  });

  // The reply still arrives, but never any RegisterDevice.
  assert!(matches!(
    client.recv(Duration::from_secs(3)).unwrap(),
    UcsMessage::RegisterPeer { .. }
  ));
  assert!(client.recv(Duration::from_millis(500)).is_none());

  device.disable();
  fixture.teardown();
}

#[test]
fn test_command_dispatches_to_device_worker() {
  let fixture = Fixture::new(Duration::ZERO);
  let device = sample_device();
  let (tx, rx) = mpsc::channel();
  device.set_command_handler(Arc::new(move |command| {
    tx.send((command.request_id, command.command_id)).unwrap();
  }));
  fixture
    .processor
    .register_device(Arc::clone(&device))
    .unwrap();

  let mut client = Client::connect(fixture.port());
  client.send(&UcsMessage::RegisterPeer {
    peer_id: 9,
    version_major: SUPPORTED_UCS_VERSION_MAJOR,
    version_minor: SUPPORTED_UCS_VERSION_MINOR,
  });
  let request_id = match client.recv(Duration::from_secs(3)).unwrap() {
    UcsMessage::RegisterPeer { .. } => {
      match client.recv(Duration::from_secs(3)).unwrap() {
        UcsMessage::RegisterDevice { request_id, .. } => request_id,
        other => panic!("expected RegisterDevice, got {other:?}"),
      }
    }
    other => panic!("expected RegisterPeer, got {other:?}"),
  };
  client.send(&UcsMessage::Response {
    request_id,
    device_id: 42,
    code: StatusCode::Ok,
  });

  client.send(&UcsMessage::DeviceCommand {
    request_id: 555,
    device_id: 42,
    command_id: 10,
    params: vec![],
  });
  let (got_request, got_command) =
    rx.recv_timeout(Duration::from_secs(3)).unwrap();
  assert_eq!((got_request, got_command), (555, 10));

  match client.recv(Duration::from_secs(3)).unwrap() {
    UcsMessage::Response { request_id, device_id, code } => {
      assert_eq!(request_id, 555);
      assert_eq!(device_id, 42);
      assert_eq!(code, StatusCode::InProgress);
    }
    other => panic!("expected Response, got {other:?}"),
  }

  device.disable();
  fixture.teardown();
}

#[test]
fn test_idle_connection_is_closed_by_keepalive() {
  let fixture = Fixture::new(Duration::from_secs(1));

  let mut client = Client::connect(fixture.port());
  client.send(&UcsMessage::RegisterPeer {
    peer_id: 10,
    version_major: SUPPORTED_UCS_VERSION_MAJOR,
    version_minor: SUPPORTED_UCS_VERSION_MINOR,
  });
  assert!(matches!(
    client.recv(Duration::from_secs(3)).unwrap(),
    UcsMessage::RegisterPeer { .. }
  ));

  // Stay silent; the server pings, gets nothing back, and closes.
  assert!(client.wait_for_close(Duration::from_secs(6)));
  fixture.teardown();
}
