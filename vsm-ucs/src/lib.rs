//! # Control-server wire core
//!
//! Speaks the length-delimited envelope protocol towards universal control
//! servers: varint-prefixed frames over TCP, a `RegisterPeer` handshake
//! with a protocol version gate, device registration with request/response
//! correlation, changed-fields-only telemetry fan-out and keepalive.
//!
//! Built entirely on the `vsm` runtime: the [`server::UcsProcessor`] owns
//! one worker thread, every connection's parsing happens in order there,
//! and device commands hop onto the target device's own worker.

pub mod device;
pub mod property;
pub mod server;
pub mod wire;

pub use device::{
  CommandSpec, Device, DeviceCommand, DeviceRegistration, Subsystem,
  SubsystemRegistration, VehicleContext,
};
pub use property::{Property, PropertyField, Value};
pub use server::{ServerConnection, UcsConfig, UcsProcessor, WRITE_TIMEOUT};
pub use wire::{
  CommandAvailability, FrameReader, MAX_MESSAGE_SIZE, StatusCode,
  SUPPORTED_UCS_VERSION_MAJOR, SUPPORTED_UCS_VERSION_MINOR, UcsMessage,
  decode_body, encode_frame,
};
