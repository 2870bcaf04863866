//! MAVLink frame decoder and encoder.
//!
//! The decoder is a state machine over STX, HEADER, PAYLOAD and CHECKSUM.
//! It keeps the bytes of the frame candidate it is assembling, so a
//! verification failure can resume scanning one byte past the previous
//! start sign: a false STX inside another frame's payload never loses the
//! real frame behind it. [`MavlinkDecoder::next_read_size`] tells the
//! transport exactly how many bytes to request next.

use std::collections::VecDeque;

use vsm::buf::IoBuffer;

use crate::MavlinkError;
use crate::crc::{Checksum, extra_byte};

pub const START_SIGN_V1: u8 = 0xfe;
pub const START_SIGN_V2: u8 = 0xfd;

pub const HEADER_LEN_V1: usize = 6;
pub const HEADER_LEN_V2: usize = 10;
const CHECKSUM_LEN: usize = 2;
pub const MAX_PAYLOAD_LEN: usize = 255;

/// Invoked for every verified frame: payload, message id, system id,
/// component id.
pub type DecodeHandler =
  Box<dyn FnMut(IoBuffer, u32, u8, u8) + Send + 'static>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecoderStats {
  pub bytes_received: u64,
  /// Frames verified and delivered to the handler.
  pub handled: u64,
  /// Frames verified while no handler was registered.
  pub no_handler: u64,
  pub bad_checksum: u64,
  pub unknown_id: u64,
  /// Times the scanner resumed one byte past a rejected start sign.
  pub stx_syncs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
  Stx,
  Header,
  Payload,
  Checksum,
}

pub struct MavlinkDecoder {
  state: State,
  /// Bytes of the current frame candidate, start sign included.
  frame: Vec<u8>,
  header_len: usize,
  stats: DecoderStats,
  handler: Option<DecodeHandler>,
}

impl MavlinkDecoder {
  pub fn new() -> MavlinkDecoder {
    MavlinkDecoder {
      state: State::Stx,
      frame: Vec::new(),
      header_len: 0,
      stats: DecoderStats::default(),
      handler: None,
    }
  }

  pub fn register_handler(&mut self, handler: DecodeHandler) {
    self.handler = Some(handler);
  }

  /// Drops the handler; frames still decode and count into statistics.
  pub fn disable(&mut self) {
    self.handler = None;
  }

  pub fn stats(&self) -> DecoderStats {
    self.stats
  }

  /// Resets the frame state machine, optionally the statistics too.
  pub fn reset(&mut self, reset_stats: bool) {
    self.state = State::Stx;
    self.frame.clear();
    self.header_len = 0;
    if reset_stats {
      self.stats = DecoderStats::default();
    }
  }

  /// How many bytes the transport should read next so frames arrive
  /// without over-reading.
  pub fn next_read_size(&self) -> usize {
    match self.state {
      State::Stx => HEADER_LEN_V1,
      State::Header => self.header_len - self.frame.len(),
      State::Payload => {
        // Read the remaining payload together with the checksum.
        self.header_len + self.payload_len() + CHECKSUM_LEN
          - self.frame.len()
      }
      State::Checksum => {
        self.header_len + self.payload_len() + CHECKSUM_LEN
          - self.frame.len()
      }
    }
  }

  fn payload_len(&self) -> usize {
    self.frame.get(1).copied().unwrap_or(0) as usize
  }

  fn message_id(&self) -> u32 {
    if self.header_len == HEADER_LEN_V1 {
      self.frame[5] as u32
    } else {
      (self.frame[7] as u32)
        | ((self.frame[8] as u32) << 8)
        | ((self.frame[9] as u32) << 16)
    }
  }

  /// Consumes a buffer of received bytes, firing the handler for every
  /// verified frame.
  pub fn decode(&mut self, buffer: &IoBuffer) {
    self.stats.bytes_received += buffer.len() as u64;
    let mut pending: VecDeque<u8> =
      buffer.as_slice().iter().copied().collect();
    while let Some(byte) = pending.pop_front() {
      if let Some(replay) = self.feed(byte) {
        // Rescan everything after the rejected start sign.
        for byte in replay.into_iter().rev() {
          pending.push_front(byte);
        }
      }
    }
  }

  /// Advances the state machine by one byte. Returns bytes to rescan when
  /// the current frame candidate was rejected.
  fn feed(&mut self, byte: u8) -> Option<Vec<u8>> {
    match self.state {
      State::Stx => {
        match byte {
          START_SIGN_V1 => {
            self.header_len = HEADER_LEN_V1;
          }
          START_SIGN_V2 => {
            self.header_len = HEADER_LEN_V2;
          }
          _ => return None,
        }
        self.frame.clear();
        self.frame.push(byte);
        self.state = State::Header;
        None
      }
      State::Header => {
        self.frame.push(byte);
        if self.frame.len() == self.header_len {
          self.state = if self.payload_len() == 0 {
            State::Checksum
          } else {
            State::Payload
          };
        }
        None
      }
      State::Payload => {
        self.frame.push(byte);
        if self.frame.len() == self.header_len + self.payload_len() {
          self.state = State::Checksum;
        }
        None
      }
      State::Checksum => {
        self.frame.push(byte);
        let total =
          self.header_len + self.payload_len() + CHECKSUM_LEN;
        if self.frame.len() < total {
          return None;
        }
        self.verify()
      }
    }
  }

  fn verify(&mut self) -> Option<Vec<u8>> {
    let body_end = self.header_len + self.payload_len();
    let mut sum = Checksum::new();
    sum.accumulate(&self.frame[1..body_end]);
    let received = (self.frame[body_end] as u16)
      | ((self.frame[body_end + 1] as u16) << 8);

    let extra = match extra_byte(self.message_id()) {
      Ok(extra) => extra,
      Err(_) => {
        tracing::debug!(
          message_id = self.message_id(),
          "unknown mavlink message id"
        );
        self.stats.unknown_id += 1;
        return self.resync();
      }
    };
    let calculated = sum.accumulate_byte(extra);
    if calculated != received {
      tracing::debug!(
        received = format_args!("{received:#06x}"),
        calculated = format_args!("{calculated:#06x}"),
        "mavlink checksum mismatch"
      );
      self.stats.bad_checksum += 1;
      return self.resync();
    }

    let payload = IoBuffer::copy_from_slice(
      &self.frame[self.header_len..body_end],
    );
    let message_id = self.message_id();
    let (system_id, component_id) = if self.header_len == HEADER_LEN_V1 {
      (self.frame[3], self.frame[4])
    } else {
      (self.frame[5], self.frame[6])
    };
    match self.handler.as_mut() {
      Some(handler) => {
        handler(payload, message_id, system_id, component_id);
        self.stats.handled += 1;
      }
      None => {
        self.stats.no_handler += 1;
      }
    }
    self.frame.clear();
    self.state = State::Stx;
    None
  }

  /// Rejects the current candidate and resumes scanning one byte past its
  /// start sign.
  fn resync(&mut self) -> Option<Vec<u8>> {
    self.stats.stx_syncs += 1;
    let replay = self.frame.split_off(1);
    self.frame.clear();
    self.state = State::Stx;
    Some(replay)
  }
}

impl Default for MavlinkDecoder {
  fn default() -> Self {
    Self::new()
  }
}

/// Frame builder with a per-encoder wrapping sequence counter.
pub struct MavlinkEncoder {
  seq: u8,
}

impl MavlinkEncoder {
  pub fn new() -> MavlinkEncoder {
    MavlinkEncoder { seq: 0 }
  }

  fn next_seq(&mut self) -> u8 {
    let seq = self.seq;
    self.seq = self.seq.wrapping_add(1);
    seq
  }

  /// Encodes a v1 frame (6 byte header, 8-bit message id).
  pub fn encode_v1(
    &mut self,
    message_id: u8,
    payload: &[u8],
    system_id: u8,
    component_id: u8,
  ) -> Result<IoBuffer, MavlinkError> {
    if payload.len() > MAX_PAYLOAD_LEN {
      return Err(MavlinkError::PayloadTooLong(payload.len()));
    }
    let extra = extra_byte(message_id as u32)?;
    let mut frame =
      Vec::with_capacity(HEADER_LEN_V1 + payload.len() + CHECKSUM_LEN);
    frame.push(START_SIGN_V1);
    frame.push(payload.len() as u8);
    frame.push(self.next_seq());
    frame.push(system_id);
    frame.push(component_id);
    frame.push(message_id);
    frame.extend_from_slice(payload);
    Self::push_checksum(&mut frame, extra);
    Ok(IoBuffer::from_vec(frame))
  }

  /// Encodes a v2 frame (10 byte header, 24-bit message id). Trailing
  /// payload zeros are trimmed down to at least one byte before the
  /// length is written.
  pub fn encode_v2(
    &mut self,
    message_id: u32,
    payload: &[u8],
    system_id: u8,
    component_id: u8,
  ) -> Result<IoBuffer, MavlinkError> {
    if payload.len() > MAX_PAYLOAD_LEN {
      return Err(MavlinkError::PayloadTooLong(payload.len()));
    }
    if message_id > 0x00ff_ffff {
      return Err(MavlinkError::UnknownMessageId(message_id));
    }
    let extra = extra_byte(message_id)?;
    let mut trimmed = payload.len();
    while trimmed > 1 && payload[trimmed - 1] == 0 {
      trimmed -= 1;
    }
    let payload = &payload[..trimmed];

    let mut frame =
      Vec::with_capacity(HEADER_LEN_V2 + payload.len() + CHECKSUM_LEN);
    frame.push(START_SIGN_V2);
    frame.push(payload.len() as u8);
    frame.push(0); // incompat_flags
    frame.push(0); // compat_flags
    frame.push(self.next_seq());
    frame.push(system_id);
    frame.push(component_id);
    frame.push((message_id & 0xff) as u8);
    frame.push(((message_id >> 8) & 0xff) as u8);
    frame.push(((message_id >> 16) & 0xff) as u8);
    frame.extend_from_slice(payload);
    Self::push_checksum(&mut frame, extra);
    Ok(IoBuffer::from_vec(frame))
  }

  fn push_checksum(frame: &mut Vec<u8>, extra: u8) {
    let mut sum = Checksum::new();
    sum.accumulate(&frame[1..]);
    let crc = sum.accumulate_byte(extra);
    frame.push((crc & 0xff) as u8);
    frame.push((crc >> 8) as u8);
  }
}

impl Default for MavlinkEncoder {
  fn default() -> Self {
    Self::new()
  }
}
