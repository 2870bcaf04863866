//! Length-delimited envelope framing for the control-server link.
//!
//! Each message travels as `varint(length) || body`. The length prefix is
//! little-endian base-128, one to five bytes; a declared length of a
//! megabyte or more is treated as hostile and kills the connection. The
//! body is a [`UcsMessage`] serialized with bincode.
//!
//! A [`FrameReader`] is a per-connection state machine alternating between
//! header and body: [`FrameReader::next_read_size`] always names the exact
//! number of bytes the next stream read should request, so messages parse
//! in order without over-reading.

use serde::{Deserialize, Serialize};

use vsm::buf::IoBuffer;
use vsm::error::{Error, Result};

use crate::property::PropertyField;

/// Declared lengths at or above this are rejected as hostile.
pub const MAX_MESSAGE_SIZE: usize = 1_000_000;
const MAX_VARINT_BYTES: u32 = 5;

/// Protocol version this module speaks.
pub const SUPPORTED_UCS_VERSION_MAJOR: u16 = 1;
pub const SUPPORTED_UCS_VERSION_MINOR: u16 = 0;

/// Outcome code carried in command and registration responses.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum StatusCode {
  Ok,
  Failed,
  InProgress,
  InvalidCommand,
  UnsupportedCommand,
}

/// Envelope message bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UcsMessage {
  /// First message on every connection, both directions.
  RegisterPeer {
    peer_id: u64,
    version_major: u16,
    version_minor: u16,
  },
  /// Keepalive probe; no reply required, receipt refreshes the peer.
  Ping,
  RegisterDevice {
    request_id: u32,
    registration: crate::device::DeviceRegistration,
  },
  UnregisterDevice { request_id: u32, device_id: u32 },
  /// Answer to a request-carrying message, correlated by request id.
  Response {
    request_id: u32,
    device_id: u32,
    code: StatusCode,
  },
  /// Changed telemetry fields and command availability of one device.
  DeviceStatus {
    device_id: u32,
    fields: Vec<PropertyField>,
    commands: Vec<CommandAvailability>,
  },
  /// Command directed at one device.
  DeviceCommand {
    request_id: u32,
    device_id: u32,
    command_id: u32,
    params: Vec<PropertyField>,
  },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandAvailability {
  pub command_id: u32,
  pub is_available: bool,
}

/// Serializes one message with its varint length prefix.
pub fn encode_frame(message: &UcsMessage) -> Result<IoBuffer> {
  let body = bincode::serialize(message)
    .map_err(|e| Error::Format(format!("message serialization: {e}")))?;
  if body.len() >= MAX_MESSAGE_SIZE {
    return Err(Error::Format(format!(
      "message of {} bytes exceeds the frame limit",
      body.len()
    )));
  }
  let mut frame = Vec::with_capacity(body.len() + 5);
  let mut length = body.len();
  loop {
    let mut byte = (length & 0x7f) as u8;
    length >>= 7;
    if length != 0 {
      byte |= 0x80;
    }
    frame.push(byte);
    if length == 0 {
      break;
    }
  }
  frame.extend_from_slice(&body);
  Ok(IoBuffer::from_vec(frame))
}

pub fn decode_body(body: &[u8]) -> Result<UcsMessage> {
  bincode::deserialize(body)
    .map_err(|e| Error::Format(format!("message deserialization: {e}")))
}

/// Per-connection framing state machine.
pub struct FrameReader {
  reading_header: bool,
  to_read: usize,
  shift: u32,
  message_size: usize,
  body: Vec<u8>,
}

impl FrameReader {
  pub fn new() -> FrameReader {
    FrameReader {
      reading_header: true,
      to_read: 1,
      shift: 0,
      message_size: 0,
      body: Vec::new(),
    }
  }

  /// Exact byte count the next read should request.
  pub fn next_read_size(&self) -> usize {
    self.to_read
  }

  /// Consumes received bytes, returning every completed message body.
  /// An oversized or overlong length prefix fails the connection.
  pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut messages = Vec::new();
    for byte in data {
      if self.reading_header {
        self.message_size |= ((byte & 0x7f) as usize) << self.shift;
        self.shift += 7;
        if byte & 0x80 != 0 {
          if self.shift >= MAX_VARINT_BYTES * 7 {
            return Err(Error::Format(
              "overlong varint length prefix".into(),
            ));
          }
          continue;
        }
        if self.message_size >= MAX_MESSAGE_SIZE {
          return Err(Error::Format(format!(
            "declared message size {} is hostile",
            self.message_size
          )));
        }
        self.reading_header = false;
        self.shift = 0;
        self.to_read = self.message_size;
        self.body = Vec::with_capacity(self.message_size);
        if self.message_size == 0 {
          messages.push(std::mem::take(&mut self.body));
          self.start_header();
        }
        continue;
      }
      self.body.push(*byte);
      self.to_read -= 1;
      if self.to_read == 0 {
        messages.push(std::mem::take(&mut self.body));
        self.start_header();
      }
    }
    Ok(messages)
  }

  fn start_header(&mut self) {
    self.reading_header = true;
    self.to_read = 1;
    self.shift = 0;
    self.message_size = 0;
  }
}

impl Default for FrameReader {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::property::Value;

  fn sample_message() -> UcsMessage {
    UcsMessage::DeviceStatus {
      device_id: 3,
      fields: vec![PropertyField::new(7, Value::Float(99.5))],
      commands: vec![CommandAvailability {
        command_id: 1,
        is_available: true,
      }],
    }
  }

  #[test]
  fn test_frame_roundtrip() {
    let frame = encode_frame(&sample_message()).unwrap();
    let mut reader = FrameReader::new();
    let messages = reader.feed(frame.as_slice()).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(decode_body(&messages[0]).unwrap(), sample_message());
    // Reader is back at a header boundary.
    assert_eq!(reader.next_read_size(), 1);
  }

  #[test]
  fn test_multiple_frames_in_one_feed() {
    let a = encode_frame(&UcsMessage::Ping).unwrap();
    let b = encode_frame(&sample_message()).unwrap();
    let joined = a.concat(&b);
    let mut reader = FrameReader::new();
    let messages = reader.feed(joined.as_slice()).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(decode_body(&messages[0]).unwrap(), UcsMessage::Ping);
    assert_eq!(decode_body(&messages[1]).unwrap(), sample_message());
  }

  #[test]
  fn test_byte_at_a_time_feed() {
    let frame = encode_frame(&sample_message()).unwrap();
    let mut reader = FrameReader::new();
    let mut messages = Vec::new();
    for byte in frame.as_slice() {
      messages.extend(reader.feed(&[*byte]).unwrap());
    }
    assert_eq!(messages.len(), 1);
    assert_eq!(decode_body(&messages[0]).unwrap(), sample_message());
  }

  #[test]
  fn test_next_read_size_tracks_header_then_body() {
    let frame = encode_frame(&sample_message()).unwrap();
    let bytes = frame.as_slice();
    let mut reader = FrameReader::new();
    assert_eq!(reader.next_read_size(), 1);
    // One-byte prefix for this message size.
    reader.feed(&bytes[..1]).unwrap();
    assert_eq!(reader.next_read_size(), bytes.len() - 1);
  }

  #[test]
  fn test_hostile_length_is_rejected() {
    // varint for exactly MAX_MESSAGE_SIZE (0xF4240): c0 84 3d.
    let mut reader = FrameReader::new();
    assert!(matches!(
      reader.feed(&[0xc0, 0x84, 0x3d]),
      Err(Error::Format(_))
    ));
  }

  #[test]
  fn test_overlong_varint_is_rejected() {
    let mut reader = FrameReader::new();
    assert!(matches!(
      reader.feed(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]),
      Err(Error::Format(_))
    ));
  }

  #[test]
  fn test_two_byte_varint_lengths() {
    // A 300 byte body needs a two byte prefix: ac 02.
    let body = vec![0xaa; 300];
    let mut frame = vec![0xac, 0x02];
    frame.extend_from_slice(&body);
    let mut reader = FrameReader::new();
    let messages = reader.feed(&frame).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0], body);
  }
}
