//! Immutable shared byte spans used across the I/O layer.
//!
//! An [`IoBuffer`] is a cheaply cloneable view into reference-counted byte
//! storage. Slicing is O(1) and never copies; concatenation allocates once.
//! The data a buffer points at stays valid for as long as any view of it is
//! alive, which lets decoded frames travel between threads without copies.

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};

/// Length sentinel meaning "up to the end of the buffer".
pub const END: usize = usize::MAX;

/// Immutable shared byte span.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IoBuffer {
  data: Bytes,
}

impl IoBuffer {
  /// Creates an empty buffer.
  pub fn new() -> Self {
    Self { data: Bytes::new() }
  }

  /// Takes ownership of a byte vector without copying.
  pub fn from_vec(data: Vec<u8>) -> Self {
    Self { data: Bytes::from(data) }
  }

  pub fn from_static(data: &'static [u8]) -> Self {
    Self { data: Bytes::from_static(data) }
  }

  pub fn from_bytes(data: Bytes) -> Self {
    Self { data }
  }

  pub fn copy_from_slice(data: &[u8]) -> Self {
    Self { data: Bytes::copy_from_slice(data) }
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  /// Borrow the underlying bytes.
  pub fn as_slice(&self) -> &[u8] {
    &self.data
  }

  /// Returns the sub-span `[offset, offset + len)` sharing the same storage.
  ///
  /// `len` may be [`END`] to take everything from `offset` to the end.
  pub fn slice(&self, offset: usize, len: usize) -> Result<IoBuffer> {
    if len == END {
      if offset > self.data.len() {
        return Err(Error::InvalidParam("offset is too large"));
      }
      return Ok(Self { data: self.data.slice(offset..) });
    }
    let end = offset
      .checked_add(len)
      .ok_or(Error::InvalidParam("offset and length overflow"))?;
    if end > self.data.len() {
      return Err(Error::InvalidParam(
        "offset and length exceed buffer boundary",
      ));
    }
    Ok(Self { data: self.data.slice(offset..end) })
  }

  /// Returns a new buffer holding `self` followed by `other`.
  pub fn concat(&self, other: &IoBuffer) -> IoBuffer {
    if self.is_empty() {
      return other.clone();
    }
    if other.is_empty() {
      return self.clone();
    }
    let mut out = BytesMut::with_capacity(self.len() + other.len());
    out.extend_from_slice(&self.data);
    out.extend_from_slice(&other.data);
    Self { data: out.freeze() }
  }

  pub fn into_bytes(self) -> Bytes {
    self.data
  }

  pub fn to_vec(&self) -> Vec<u8> {
    self.data.to_vec()
  }
}

impl From<Vec<u8>> for IoBuffer {
  fn from(data: Vec<u8>) -> Self {
    Self::from_vec(data)
  }
}

impl From<&str> for IoBuffer {
  fn from(data: &str) -> Self {
    Self::copy_from_slice(data.as_bytes())
  }
}

impl AsRef<[u8]> for IoBuffer {
  fn as_ref(&self) -> &[u8] {
    self.as_slice()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_slice_shares_storage() {
    let buf = IoBuffer::from_vec(vec![1, 2, 3, 4, 5]);
    let tail = buf.slice(2, END).unwrap();
    assert_eq!(tail.as_slice(), &[3, 4, 5]);
    let mid = buf.slice(1, 3).unwrap();
    assert_eq!(mid.as_slice(), &[2, 3, 4]);
    // Sub-slices of a slice index relative to the slice start.
    assert_eq!(mid.slice(1, END).unwrap().as_slice(), &[3, 4]);
  }

  #[test]
  fn test_slice_bounds() {
    let buf = IoBuffer::from_vec(vec![0; 4]);
    assert!(buf.slice(5, END).is_err());
    assert!(buf.slice(2, 3).is_err());
    assert_eq!(buf.slice(4, END).unwrap().len(), 0);
    assert_eq!(buf.slice(0, 4).unwrap().len(), 4);
  }

  #[test]
  fn test_concat() {
    let a = IoBuffer::from_static(b"ab");
    let b = IoBuffer::from_static(b"cd");
    assert_eq!(a.concat(&b).as_slice(), b"abcd");
    assert_eq!(a.concat(&IoBuffer::new()).as_slice(), b"ab");
    assert_eq!(IoBuffer::new().concat(&b).as_slice(), b"cd");
  }

  #[test]
  fn test_data_outlives_original_handle() {
    let buf = IoBuffer::from_vec(vec![7; 16]);
    let slice = buf.slice(8, END).unwrap();
    drop(buf);
    assert_eq!(slice.as_slice(), &[7; 8]);
  }
}
