//! # MAVLink codec and demultiplexer
//!
//! Length-prefixed, CRC-protected, identifier-demultiplexed framing as
//! spoken by vehicle-side links. [`MavlinkDecoder`] turns a byte stream
//! into verified frames, [`MavlinkEncoder`] builds v1 and v2 frames, and
//! [`MavlinkDemuxer`] routes decoded frames to per-(message, system,
//! component) handlers, optionally on a foreign execution context.
//!
//! The codec is schema-agnostic: payloads travel as opaque
//! [`vsm::IoBuffer`]s, and only the per-message CRC extra byte is needed
//! (see [`crc::register_extra_byte`] for dialect extensions).

pub mod codec;
pub mod crc;
pub mod demux;

pub use codec::{
  DecodeHandler, DecoderStats, HEADER_LEN_V1, HEADER_LEN_V2, MAX_PAYLOAD_LEN,
  MavlinkDecoder, MavlinkEncoder, START_SIGN_V1, START_SIGN_V2,
};
pub use crc::{Checksum, extra_byte, register_extra_byte};
pub use demux::{
  DefaultHandler, DemuxHandler, DemuxKey, ID_ANY, MavlinkDemuxer,
};

/// Well-known common-set message ids used by the runtime itself.
pub mod msgid {
  pub const HEARTBEAT: u32 = 0;
  pub const SYS_STATUS: u32 = 1;
  pub const SYSTEM_TIME: u32 = 2;
  pub const PING: u32 = 4;
  pub const PARAM_VALUE: u32 = 22;
  pub const GPS_RAW_INT: u32 = 24;
  pub const ATTITUDE: u32 = 30;
  pub const GLOBAL_POSITION_INT: u32 = 33;
  pub const MISSION_ITEM: u32 = 39;
  pub const MISSION_ACK: u32 = 47;
  pub const RC_CHANNELS: u32 = 65;
  pub const VFR_HUD: u32 = 74;
  pub const COMMAND_LONG: u32 = 76;
  pub const COMMAND_ACK: u32 = 77;
  pub const RADIO_STATUS: u32 = 109;
  pub const BATTERY_STATUS: u32 = 147;
  pub const STATUSTEXT: u32 = 253;
}

/// Codec errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MavlinkError {
  /// No CRC extra byte known for this id; the frame cannot be encoded or
  /// verified.
  #[error("unknown mavlink message id {0}")]
  UnknownMessageId(u32),

  #[error("payload of {0} bytes exceeds the 255 byte limit")]
  PayloadTooLong(usize),
}
