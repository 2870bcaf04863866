//! Device, subsystem and vehicle scaffolding on top of the request kernel.
//!
//! A [`Device`] owns a dedicated worker: everything the server sends to the
//! device (commands, mission payloads) executes there, never on the wire
//! threads. Its registration is assembled from [`Subsystem`] declarations
//! and frozen at registration time — the exact message sent to one server
//! is resent verbatim to every later one.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use vsm::error::{Error, Result};
use vsm::request::container::RequestContainer;
use vsm::request::request::{Request, ResultCode};
use vsm::request::worker::RequestWorker;
use vsm::sync::Mutex;

use crate::property::{Property, PropertyField, Value, diff_fields};
use crate::wire::CommandAvailability;

/// Declaration of one command a subsystem supports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
  pub command_id: u32,
  pub name: String,
  /// Declared parameters with their default values.
  pub params: Vec<PropertyField>,
}

/// Wire form of one subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsystemRegistration {
  pub kind: String,
  pub properties: Vec<PropertyField>,
  pub commands: Vec<CommandSpec>,
}

/// Frozen registration message of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRegistration {
  pub device_id: u32,
  pub name: String,
  pub properties: Vec<PropertyField>,
  pub subsystems: Vec<SubsystemRegistration>,
}

/// Builder-side subsystem: typed properties plus command declarations.
pub struct Subsystem {
  kind: String,
  properties: Vec<Property>,
  commands: Vec<CommandSpec>,
}

impl Subsystem {
  pub fn new(kind: impl Into<String>) -> Subsystem {
    Subsystem { kind: kind.into(), properties: Vec::new(), commands: Vec::new() }
  }

  pub fn add_property(
    &mut self,
    id: u32,
    name: impl Into<String>,
    value: Value,
  ) -> &mut Property {
    self.properties.push(Property::new(id, name, value));
    self.properties.last_mut().expect("just pushed")
  }

  pub fn add_command(
    &mut self,
    command_id: u32,
    name: impl Into<String>,
    params: Vec<PropertyField>,
  ) {
    self.commands.push(CommandSpec {
      command_id,
      name: name.into(),
      params,
    });
  }

  pub fn properties(&self) -> &[Property] {
    &self.properties
  }

  fn registration(&self) -> SubsystemRegistration {
    SubsystemRegistration {
      kind: self.kind.clone(),
      properties: self.properties.iter().map(Property::as_field).collect(),
      commands: self.commands.clone(),
    }
  }
}

/// Command arriving from a control server.
#[derive(Debug, Clone)]
pub struct DeviceCommand {
  pub request_id: u32,
  pub command_id: u32,
  pub params: Vec<PropertyField>,
}

pub type CommandHandler =
  Arc<dyn Fn(DeviceCommand) + Send + Sync + 'static>;

/// One vehicle (or payload) exposed to control servers.
pub struct Device {
  id: u32,
  name: String,
  worker: Arc<RequestWorker>,
  container: Arc<RequestContainer>,
  registration: Mutex<Option<DeviceRegistration>>,
  command_handler: Mutex<Option<CommandHandler>>,
}

impl Device {
  pub fn new(id: u32, name: impl Into<String>) -> Arc<Device> {
    let name = name.into();
    let (worker, container) =
      RequestWorker::single(format!("device {name}"));
    Arc::new(Device {
      id,
      name,
      worker,
      container,
      registration: Mutex::new(None),
      command_handler: Mutex::new(None),
    })
  }

  pub fn id(&self) -> u32 {
    self.id
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Processing context of this device; command dispatch lands here.
  pub fn processor(&self) -> &Arc<RequestContainer> {
    &self.container
  }

  pub fn enable(&self) -> Result<()> {
    self.worker.enable()
  }

  pub fn disable(&self) {
    self.worker.disable();
  }

  pub fn set_command_handler(&self, handler: CommandHandler) {
    *self.command_handler.lock() = Some(handler);
  }

  /// Assembles and freezes the registration message. Fails when already
  /// frozen: whatever was announced once must stay announced.
  pub fn build_registration(
    &self,
    properties: Vec<PropertyField>,
    subsystems: &[Subsystem],
  ) -> Result<DeviceRegistration> {
    let mut slot = self.registration.lock();
    if slot.is_some() {
      return Err(Error::InvalidOp("device registration is frozen"));
    }
    let registration = DeviceRegistration {
      device_id: self.id,
      name: self.name.clone(),
      properties,
      subsystems: subsystems.iter().map(Subsystem::registration).collect(),
    };
    *slot = Some(registration.clone());
    Ok(registration)
  }

  pub fn registration(&self) -> Option<DeviceRegistration> {
    self.registration.lock().clone()
  }

  /// Hands a command to the device's own worker thread.
  pub fn dispatch_command(&self, command: DeviceCommand) -> Result<()> {
    let handler = self
      .command_handler
      .lock()
      .clone()
      .ok_or(Error::NullHandler("device command handler"))?;
    let request = Request::new();
    let request2 = Arc::clone(&request);
    request.set_processing_handler(Box::new(move || {
      handler(command);
      let _ = request2.complete(ResultCode::Ok);
    }))?;
    self.container.submit(request)
  }
}

/// Server-side view of one registered device: what was announced and what
/// the servers already know, so updates carry changed fields only.
pub struct VehicleContext {
  device: Arc<Device>,
  registration: DeviceRegistration,
  telemetry_cache: HashMap<u32, Value>,
  availability_cache: HashMap<u32, bool>,
}

impl VehicleContext {
  pub fn new(device: Arc<Device>) -> Result<VehicleContext> {
    let registration = device
      .registration()
      .ok_or(Error::InvalidState("device registration is not frozen"))?;
    Ok(VehicleContext {
      device,
      registration,
      telemetry_cache: HashMap::new(),
      availability_cache: HashMap::new(),
    })
  }

  pub fn device(&self) -> &Arc<Device> {
    &self.device
  }

  pub fn registration(&self) -> &DeviceRegistration {
    &self.registration
  }

  /// Fields that differ from what was last sent; cache updated.
  pub fn diff_telemetry(
    &mut self,
    fields: &[PropertyField],
  ) -> Vec<PropertyField> {
    diff_fields(&mut self.telemetry_cache, fields)
  }

  /// Everything the servers have been told so far, for catching up a
  /// connection that registered the device late.
  pub fn snapshot_telemetry(&self) -> Vec<PropertyField> {
    let mut fields: Vec<_> = self
      .telemetry_cache
      .iter()
      .map(|(id, value)| PropertyField::new(*id, value.clone()))
      .collect();
    fields.sort_by_key(|f| f.id);
    fields
  }

  pub fn snapshot_availability(&self) -> Vec<CommandAvailability> {
    let mut commands: Vec<_> = self
      .availability_cache
      .iter()
      .map(|(id, available)| CommandAvailability {
        command_id: *id,
        is_available: *available,
      })
      .collect();
    commands.sort_by_key(|c| c.command_id);
    commands
  }

  /// Command availability transitions; cache updated.
  pub fn diff_availability(
    &mut self,
    updates: &[CommandAvailability],
  ) -> Vec<CommandAvailability> {
    let mut changed = Vec::new();
    for update in updates {
      let stale = self
        .availability_cache
        .get(&update.command_id)
        .map(|known| *known != update.is_available)
        .unwrap_or(true);
      if stale {
        self
          .availability_cache
          .insert(update.command_id, update.is_available);
        changed.push(update.clone());
      }
    }
    changed
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::mpsc;
  use std::time::Duration;

  fn sample_subsystem() -> Subsystem {
    let mut subsystem = Subsystem::new("flight_controller");
    subsystem.add_property(1, "altitude_amsl", Value::Float(0.0));
    subsystem.add_property(2, "is_armed", Value::Bool(false));
    subsystem.add_command(10, "arm", vec![]);
    subsystem.add_command(
      11,
      "takeoff",
      vec![PropertyField::new(1, Value::Float(10.0))],
    );
    subsystem
  }

  #[test]
  fn test_registration_freezes_once() {
    let device = Device::new(1, "quad");
    let registration = device
      .build_registration(vec![], &[sample_subsystem()])
      .unwrap();
    assert_eq!(registration.device_id, 1);
    assert_eq!(registration.subsystems.len(), 1);
    assert_eq!(registration.subsystems[0].commands.len(), 2);
    assert!(device.build_registration(vec![], &[]).is_err());
    assert_eq!(device.registration().unwrap(), registration);
  }

  #[test]
  fn test_command_dispatch_runs_on_device_worker() {
    let device = Device::new(2, "rover");
    device.enable().unwrap();
    let (tx, rx) = mpsc::channel();
    device.set_command_handler(Arc::new(move |command| {
      tx.send((
        command.command_id,
        std::thread::current().name().map(String::from),
      ))
      .unwrap();
    }));
    device
      .dispatch_command(DeviceCommand {
        request_id: 7,
        command_id: 10,
        params: vec![],
      })
      .unwrap();
    let (command_id, thread_name) =
      rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(command_id, 10);
    assert_eq!(thread_name.as_deref(), Some("device rover"));
    device.disable();
  }

  #[test]
  fn test_dispatch_without_handler_fails() {
    let device = Device::new(3, "bare");
    device.enable().unwrap();
    assert!(matches!(
      device.dispatch_command(DeviceCommand {
        request_id: 1,
        command_id: 1,
        params: vec![],
      }),
      Err(Error::NullHandler(_))
    ));
    device.disable();
  }

  #[test]
  fn test_vehicle_context_requires_frozen_registration() {
    let device = Device::new(4, "ctx");
    assert!(VehicleContext::new(Arc::clone(&device)).is_err());
    device.build_registration(vec![], &[]).unwrap();
    let mut ctx = VehicleContext::new(device).unwrap();

    let first = ctx.diff_telemetry(&[PropertyField::new(1, Value::Int(5))]);
    assert_eq!(first.len(), 1);
    let second = ctx.diff_telemetry(&[PropertyField::new(1, Value::Int(5))]);
    assert!(second.is_empty());

    let avail = ctx.diff_availability(&[CommandAvailability {
      command_id: 10,
      is_available: true,
    }]);
    assert_eq!(avail.len(), 1);
    let avail = ctx.diff_availability(&[CommandAvailability {
      command_id: 10,
      is_available: true,
    }]);
    assert!(avail.is_empty());
  }
}
