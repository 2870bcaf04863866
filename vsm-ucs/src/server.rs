//! Control-server connection core.
//!
//! Listens for incoming server connections, runs the per-connection
//! framing state machine, enforces the protocol version gate, registers
//! devices on every compatible peer and fans telemetry out to the
//! connections where a device is registered. All of it executes on one
//! worker, so per-connection parsing is strictly in order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use vsm::error::{Error, IoResult, Result};
use vsm::io::addr::SocketAddress;
use vsm::io::dispatcher::Offset;
use vsm::io::socket::{SocketProcessor, SocketStream, TcpListenerStream};
use vsm::io::stream::IoStream;
use vsm::request::container::RequestContainer;
use vsm::request::worker::RequestWorker;
use vsm::sync::Mutex;
use vsm::timer::{Timer, TimerProcessor};

use crate::device::{Device, DeviceCommand, VehicleContext};
use crate::property::PropertyField;
use crate::wire::{
  CommandAvailability, FrameReader, StatusCode,
  SUPPORTED_UCS_VERSION_MAJOR, SUPPORTED_UCS_VERSION_MINOR, UcsMessage,
  decode_body, encode_frame,
};

/// A write not accepted by the peer within this window closes the
/// connection.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct UcsConfig {
  pub listen_address: String,
  pub listen_port: String,
  /// Identity announced in our `RegisterPeer`.
  pub peer_id: u64,
  /// Zero disables keepalive probing.
  pub keep_alive_timeout: Duration,
}

impl Default for UcsConfig {
  fn default() -> Self {
    UcsConfig {
      listen_address: "0.0.0.0".into(),
      listen_port: "5556".into(),
      peer_id: 1,
      keep_alive_timeout: Duration::from_secs(10),
    }
  }
}

struct ConnectionState {
  reader: FrameReader,
  ucs_id: Option<u64>,
  primary: bool,
  is_compatible: bool,
  registered_devices: HashSet<u32>,
  /// Outstanding registration requests: request id to device id.
  pending_registrations: HashMap<u32, u32>,
  last_message_time: Instant,
  keepalive: Option<Arc<Timer>>,
  /// Frames awaiting the single in-flight write.
  write_queue: std::collections::VecDeque<vsm::buf::IoBuffer>,
  writing: bool,
}

pub struct ServerConnection {
  id: u64,
  stream: Arc<SocketStream>,
  state: Mutex<ConnectionState>,
}

impl ServerConnection {
  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn ucs_id(&self) -> Option<u64> {
    self.state.lock().ucs_id
  }

  pub fn is_compatible(&self) -> bool {
    self.state.lock().is_compatible
  }

  pub fn is_primary(&self) -> bool {
    self.state.lock().primary
  }

  pub fn has_device(&self, device_id: u32) -> bool {
    self.state.lock().registered_devices.contains(&device_id)
  }
}

struct UcsState {
  listener: Option<Arc<TcpListenerStream>>,
  connections: HashMap<u64, Arc<ServerConnection>>,
  devices: HashMap<u32, VehicleContext>,
}

/// The wire core: one instance per VSM process.
pub struct UcsProcessor {
  worker: Arc<RequestWorker>,
  container: Arc<RequestContainer>,
  sockets: Arc<SocketProcessor>,
  timer: Arc<TimerProcessor>,
  config: UcsConfig,
  state: Mutex<UcsState>,
  is_enabled: AtomicBool,
  next_request_id: AtomicU32,
  next_connection_id: AtomicU64,
}

impl UcsProcessor {
  pub fn new(
    sockets: Arc<SocketProcessor>,
    timer: Arc<TimerProcessor>,
    config: UcsConfig,
  ) -> Arc<UcsProcessor> {
    let (worker, container) = RequestWorker::single("ucs processor");
    Arc::new(UcsProcessor {
      worker,
      container,
      sockets,
      timer,
      config,
      state: Mutex::new(UcsState {
        listener: None,
        connections: HashMap::new(),
        devices: HashMap::new(),
      }),
      is_enabled: AtomicBool::new(false),
      next_request_id: AtomicU32::new(1),
      next_connection_id: AtomicU64::new(1),
    })
  }

  pub fn container(&self) -> &Arc<RequestContainer> {
    &self.container
  }

  /// Starts listening on the configured endpoint.
  pub fn enable(self: &Arc<Self>) -> Result<()> {
    if self.is_enabled.swap(true, Ordering::AcqRel) {
      return Err(Error::InvalidOp("ucs processor already enabled"));
    }
    self.worker.enable()?;
    let processor = Arc::clone(self);
    self.sockets.listen(
      SocketAddress::new(
        self.config.listen_address.clone(),
        self.config.listen_port.clone(),
      ),
      Box::new(move |result, listener| match (result, listener) {
        (IoResult::Ok, Some(listener)) => {
          tracing::info!(
            addr = %listener.local_addr(),
            "ucs processor listening"
          );
          processor.state.lock().listener = Some(Arc::clone(&listener));
          processor.arm_accept(&listener);
        }
        (result, _) => {
          tracing::error!(?result, "ucs listen failed");
        }
      }),
      &self.container,
    )?;
    Ok(())
  }

  pub fn disable(&self) {
    if !self.is_enabled.swap(false, Ordering::AcqRel) {
      return;
    }
    let (listener, connections) = {
      let mut state = self.state.lock();
      (
        state.listener.take(),
        std::mem::take(&mut state.connections),
      )
    };
    if let Some(listener) = listener {
      listener.close();
    }
    for (_, connection) in connections {
      let keepalive = connection.state.lock().keepalive.take();
      if let Some(timer) = keepalive {
        timer.cancel();
      }
      connection.stream.close();
    }
    self.worker.disable();
  }

  /// The local listening port, once bound (useful with port zero).
  pub fn local_port(&self) -> Option<u16> {
    self
      .state
      .lock()
      .listener
      .as_ref()
      .map(|l| l.local_addr().port())
  }

  pub fn connection_count(&self) -> usize {
    self.state.lock().connections.len()
  }

  fn arm_accept(self: &Arc<Self>, listener: &Arc<TcpListenerStream>) {
    let processor = Arc::clone(self);
    let listener2 = Arc::clone(listener);
    let result = listener.accept(
      Box::new(move |result, stream| {
        if let (IoResult::Ok, Some(stream)) = (result, stream) {
          processor.on_connection(stream);
          processor.arm_accept(&listener2);
        } else if result != IoResult::Closed {
          processor.arm_accept(&listener2);
        }
      }),
      &self.container,
    );
    if let Err(err) = result {
      tracing::debug!(%err, "ucs accept no longer armed");
    }
  }

  fn on_connection(self: &Arc<Self>, stream: Arc<SocketStream>) {
    let id = self.next_connection_id.fetch_add(1, Ordering::AcqRel);
    tracing::info!(id, peer = %stream.peer_addr(), "ucs peer connected");
    let connection = Arc::new(ServerConnection {
      id,
      stream,
      state: Mutex::new(ConnectionState {
        reader: FrameReader::new(),
        ucs_id: None,
        primary: false,
        is_compatible: false,
        registered_devices: HashSet::new(),
        pending_registrations: HashMap::new(),
        last_message_time: Instant::now(),
        keepalive: None,
        write_queue: std::collections::VecDeque::new(),
        writing: false,
      }),
    });
    self
      .state
      .lock()
      .connections
      .insert(id, Arc::clone(&connection));
    self.arm_keepalive(&connection);
    self.schedule_next_read(connection);
  }

  fn arm_keepalive(self: &Arc<Self>, connection: &Arc<ServerConnection>) {
    let timeout = self.config.keep_alive_timeout;
    if timeout.is_zero() {
      return;
    }
    let processor = Arc::clone(self);
    let weak = Arc::downgrade(connection);
    let timer = self.timer.create_timer(
      timeout,
      Box::new(move || {
        let Some(connection) = weak.upgrade() else { return false };
        let idle = connection.state.lock().last_message_time.elapsed();
        if idle > timeout {
          tracing::info!(id = connection.id, "ucs peer idle, closing");
          processor.close_connection(&connection);
          return false;
        }
        processor.send_message(&connection, &UcsMessage::Ping);
        true
      }),
      Arc::clone(&self.container),
    );
    match timer {
      Ok(timer) => connection.state.lock().keepalive = Some(timer),
      Err(err) => tracing::error!(%err, "keepalive timer failed"),
    }
  }

  /// Reads exactly what the framing state machine asks for next.
  fn schedule_next_read(self: &Arc<Self>, connection: Arc<ServerConnection>) {
    let to_read = connection.state.lock().reader.next_read_size();
    let processor = Arc::clone(self);
    let connection2 = Arc::clone(&connection);
    let result = connection.stream.read(
      to_read,
      to_read,
      Offset::None,
      Box::new(move |result, data| {
        let connection = connection2;
        if result != IoResult::Ok {
          processor.close_connection(&connection);
          return;
        }
        let bodies = {
          let mut state = connection.state.lock();
          state.last_message_time = Instant::now();
          state.reader.feed(data.as_slice())
        };
        match bodies {
          Ok(bodies) => {
            for body in bodies {
              match decode_body(&body) {
                Ok(message) => {
                  processor.handle_message(&connection, message)
                }
                Err(err) => {
                  tracing::warn!(%err, "undecodable ucs message");
                }
              }
            }
            processor.schedule_next_read(connection);
          }
          Err(err) => {
            tracing::warn!(%err, "hostile ucs frame, closing");
            processor.close_connection(&connection);
          }
        }
      }),
      &self.container,
    );
    if result.is_err() {
      self.close_connection_by_id(connection.id);
    }
  }

  fn handle_message(
    self: &Arc<Self>,
    connection: &Arc<ServerConnection>,
    message: UcsMessage,
  ) {
    match message {
      UcsMessage::RegisterPeer { peer_id, version_major, version_minor } => {
        let compatible = version_major >= SUPPORTED_UCS_VERSION_MAJOR
          && version_minor >= SUPPORTED_UCS_VERSION_MINOR;
        {
          let mut state = connection.state.lock();
          state.ucs_id = Some(peer_id);
          state.is_compatible = compatible;
          // The first server to identify itself becomes primary.
          state.primary = connection.id == 1;
        }
        if !compatible {
          tracing::warn!(
            peer_id,
            version_major,
            version_minor,
            "ucs peer version not supported, no devices will register"
          );
        }
        self.send_message(
          connection,
          &UcsMessage::RegisterPeer {
            peer_id: self.config.peer_id,
            version_major: SUPPORTED_UCS_VERSION_MAJOR,
            version_minor: SUPPORTED_UCS_VERSION_MINOR,
          },
        );
        if compatible {
          self.register_known_devices(connection);
        }
      }
      UcsMessage::Ping => {
        // Receipt alone refreshed the idle clock.
      }
      UcsMessage::Response { request_id, device_id, code } => {
        let registered = {
          let mut state = connection.state.lock();
          match state.pending_registrations.remove(&request_id) {
            Some(pending_device) if code == StatusCode::Ok => {
              state.registered_devices.insert(pending_device);
              debug_assert_eq!(pending_device, device_id);
              true
            }
            _ => false,
          }
        };
        if registered {
          tracing::info!(
            device_id,
            connection = connection.id,
            "device registered on ucs peer"
          );
          self.send_full_status(connection, device_id);
        }
      }
      UcsMessage::DeviceCommand {
        request_id,
        device_id,
        command_id,
        params,
      } => {
        self.dispatch_command(
          connection,
          request_id,
          device_id,
          command_id,
          params,
        );
      }
      other => {
        tracing::warn!(?other, "unexpected message from ucs peer");
      }
    }
  }

  fn dispatch_command(
    self: &Arc<Self>,
    connection: &Arc<ServerConnection>,
    request_id: u32,
    device_id: u32,
    command_id: u32,
    params: Vec<PropertyField>,
  ) {
    let device: Option<Arc<Device>> = {
      let state = self.state.lock();
      state.devices.get(&device_id).map(|ctx| Arc::clone(ctx.device()))
    };
    let outcome = match device {
      Some(device) => device
        .dispatch_command(DeviceCommand { request_id, command_id, params })
        .map_or(StatusCode::UnsupportedCommand, |_| StatusCode::InProgress),
      None => StatusCode::InvalidCommand,
    };
    self.send_message(
      connection,
      &UcsMessage::Response { request_id, device_id, code: outcome },
    );
  }

  /// Announces every known device on a (newly compatible) connection.
  fn register_known_devices(
    self: &Arc<Self>,
    connection: &Arc<ServerConnection>,
  ) {
    let registrations: Vec<_> = {
      let state = self.state.lock();
      state
        .devices
        .values()
        .map(|ctx| ctx.registration().clone())
        .collect()
    };
    for registration in registrations {
      let request_id = self.next_request_id.fetch_add(1, Ordering::AcqRel);
      connection
        .state
        .lock()
        .pending_registrations
        .insert(request_id, registration.device_id);
      self.send_message(
        connection,
        &UcsMessage::RegisterDevice { request_id, registration },
      );
    }
  }

  /// Registers a device with every compatible connected server. The
  /// device's registration must be frozen beforehand.
  pub fn register_device(self: &Arc<Self>, device: Arc<Device>) -> Result<()> {
    let context = VehicleContext::new(Arc::clone(&device))?;
    let registration = context.registration().clone();
    let connections: Vec<_> = {
      let mut state = self.state.lock();
      if state.devices.contains_key(&device.id()) {
        return Err(Error::AlreadyExists(format!(
          "device {} is already registered",
          device.id()
        )));
      }
      state.devices.insert(device.id(), context);
      state.connections.values().cloned().collect()
    };
    for connection in connections {
      if !connection.is_compatible() {
        continue;
      }
      let request_id = self.next_request_id.fetch_add(1, Ordering::AcqRel);
      connection
        .state
        .lock()
        .pending_registrations
        .insert(request_id, registration.device_id);
      self.send_message(
        &connection,
        &UcsMessage::RegisterDevice {
          request_id,
          registration: registration.clone(),
        },
      );
    }
    Ok(())
  }

  /// Withdraws a device from every server that saw it.
  pub fn unregister_device(self: &Arc<Self>, device_id: u32) {
    let connections: Vec<_> = {
      let mut state = self.state.lock();
      state.devices.remove(&device_id);
      state.connections.values().cloned().collect()
    };
    for connection in connections {
      let was_registered = {
        let mut state = connection.state.lock();
        state.pending_registrations.retain(|_, d| *d != device_id);
        state.registered_devices.remove(&device_id)
      };
      if was_registered {
        let request_id = self.next_request_id.fetch_add(1, Ordering::AcqRel);
        self.send_message(
          &connection,
          &UcsMessage::UnregisterDevice { request_id, device_id },
        );
      }
    }
  }

  /// Publishes telemetry and command availability. Only fields that
  /// changed since the last update travel, and only to connections where
  /// the device is registered.
  pub fn update_device_status(
    self: &Arc<Self>,
    device_id: u32,
    fields: &[PropertyField],
    commands: &[CommandAvailability],
  ) {
    let message = {
      let mut state = self.state.lock();
      let Some(context) = state.devices.get_mut(&device_id) else {
        return;
      };
      let fields = context.diff_telemetry(fields);
      let commands = context.diff_availability(commands);
      if fields.is_empty() && commands.is_empty() {
        return;
      }
      UcsMessage::DeviceStatus { device_id, fields, commands }
    };
    self.fan_out(&message, Some(device_id), None);
  }

  /// Catch-up snapshot for a connection that just registered the device.
  fn send_full_status(
    self: &Arc<Self>,
    connection: &Arc<ServerConnection>,
    device_id: u32,
  ) {
    let message = {
      let state = self.state.lock();
      let Some(context) = state.devices.get(&device_id) else { return };
      let fields = context.snapshot_telemetry();
      let commands = context.snapshot_availability();
      if fields.is_empty() && commands.is_empty() {
        return;
      }
      UcsMessage::DeviceStatus { device_id, fields, commands }
    };
    self.send_message(connection, &message);
  }

  /// Sends to one server (by ucs id) or to all compatible ones, primary
  /// first.
  pub fn broadcast(
    self: &Arc<Self>,
    message: &UcsMessage,
    server_id: Option<u64>,
  ) {
    self.fan_out(message, None, server_id);
  }

  fn fan_out(
    self: &Arc<Self>,
    message: &UcsMessage,
    device_gate: Option<u32>,
    server_id: Option<u64>,
  ) {
    let mut connections: Vec<_> = {
      let state = self.state.lock();
      state.connections.values().cloned().collect()
    };
    // Primary first.
    connections.sort_by_key(|c| (!c.is_primary(), c.id()));
    for connection in connections {
      if !connection.is_compatible() {
        continue;
      }
      if let Some(ucs_id) = server_id
        && connection.ucs_id() != Some(ucs_id)
      {
        continue;
      }
      if let Some(device_id) = device_gate
        && !connection.has_device(device_id)
      {
        continue;
      }
      self.send_message(&connection, message);
    }
  }

  /// Frames one message and queues it behind the connection's single
  /// in-flight write.
  fn send_message(
    self: &Arc<Self>,
    connection: &Arc<ServerConnection>,
    message: &UcsMessage,
  ) {
    let frame = match encode_frame(message) {
      Ok(frame) => frame,
      Err(err) => {
        tracing::error!(%err, "unencodable ucs message");
        return;
      }
    };
    let start = {
      let mut state = connection.state.lock();
      state.write_queue.push_back(frame);
      if state.writing {
        false
      } else {
        state.writing = true;
        true
      }
    };
    if start {
      self.write_next(connection);
    }
  }

  /// Writes the queue head; a write that neither completes nor fails
  /// within [`WRITE_TIMEOUT`] tears the connection down.
  fn write_next(self: &Arc<Self>, connection: &Arc<ServerConnection>) {
    let frame = {
      let mut state = connection.state.lock();
      match state.write_queue.pop_front() {
        Some(frame) => frame,
        None => {
          state.writing = false;
          return;
        }
      }
    };
    let processor = Arc::clone(self);
    let connection2 = Arc::clone(connection);
    let result = connection.stream.write(
      frame,
      Offset::None,
      Box::new(move |result| {
        if result != IoResult::Ok {
          processor.close_connection(&connection2);
          return;
        }
        processor.write_next(&connection2);
      }),
      &self.container,
    );
    match result {
      Ok(waiter) => {
        if let Err(err) = waiter.timeout(
          &self.timer,
          WRITE_TIMEOUT,
          None,
          true,
          Arc::clone(&self.container),
        ) {
          tracing::error!(%err, "write timeout arming failed");
        }
      }
      Err(err) => {
        tracing::debug!(%err, id = connection.id, "ucs write failed");
        self.close_connection(connection);
      }
    }
  }

  fn close_connection(self: &Arc<Self>, connection: &Arc<ServerConnection>) {
    self.close_connection_by_id(connection.id);
  }

  fn close_connection_by_id(self: &Arc<Self>, id: u64) {
    let connection = self.state.lock().connections.remove(&id);
    if let Some(connection) = connection {
      tracing::info!(id, "ucs connection closed");
      let keepalive = connection.state.lock().keepalive.take();
      if let Some(timer) = keepalive {
        timer.cancel();
      }
      connection.stream.close();
    }
  }
}
