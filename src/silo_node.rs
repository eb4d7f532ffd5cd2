use byteorder::{ByteOrder, LittleEndian};

use crate::{
  error::{Error, Result},
  strtab::UNSET,
};

bitflags::bitflags! {
  /// The two flag bits packed into the first byte of a node record. A clear
  /// `IS_ELEMENT` bit marks the one-byte sentinel terminating a sibling run,
  /// so the writer must never emit an element without it.
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct SiloNodeFlags: u8 {
    const IS_ELEMENT = 0b01;
    const IS_TOKENIZED = 0b10;
  }
}

/// Fixed part of an element record: flags+attr_count, token_count,
/// element_name, parent, next, text, tail.
pub(crate) const NODE_SIZE: u32 = 22;
pub(crate) const ATTR_SIZE: u32 = 8;
pub(crate) const TOKEN_SIZE: u32 = 4;
pub(crate) const SENTINEL_SIZE: u32 = 1;

/// Attribute count lives in the upper six bits of the first byte.
pub(crate) const ATTR_COUNT_MAX: usize = 63;

/// Borrowed view of one node record inside the silo byte area.
#[derive(Clone, Copy)]
pub(crate) struct SiloNodeRecord<'a> {
  data: &'a [u8],
  off: u32,
}

impl<'a> SiloNodeRecord<'a> {
  /// Validates bounds for the record starting at `off` within `data`.
  pub fn parse(data: &'a [u8], off: u32) -> Result<Self> {
    let start = off as usize;
    if start >= data.len() {
      return Err(Error::InvalidData(format!(
        "node offset @{} is outside the blob",
        off
      )));
    }
    let record = Self { data, off };
    if record.is_element() {
      if start + 2 > data.len() {
        return Err(Error::InvalidData(format!(
          "node record @{} is truncated",
          off
        )));
      }
      let end = start + record.size() as usize;
      if end > data.len() {
        return Err(Error::InvalidData(format!(
          "node record @{} is truncated",
          off
        )));
      }
    }
    Ok(record)
  }

  fn byte(&self, rel: u32) -> u8 {
    self.data[(self.off + rel) as usize]
  }

  fn word(&self, rel: u32) -> u32 {
    let start = (self.off + rel) as usize;
    LittleEndian::read_u32(&self.data[start..start + 4])
  }

  pub fn flags(&self) -> SiloNodeFlags {
    SiloNodeFlags::from_bits_truncate(self.byte(0) & 0x03)
  }

  pub fn is_element(&self) -> bool {
    self.flags().contains(SiloNodeFlags::IS_ELEMENT)
  }

  pub fn is_tokenized(&self) -> bool {
    self.flags().contains(SiloNodeFlags::IS_TOKENIZED)
  }

  pub fn attr_count(&self) -> u8 {
    self.byte(0) >> 2
  }

  pub fn token_count(&self) -> u8 {
    self.byte(1)
  }

  pub fn element_name(&self) -> u32 {
    self.word(2)
  }

  pub fn parent(&self) -> u32 {
    self.word(6)
  }

  pub fn next(&self) -> u32 {
    self.word(10)
  }

  pub fn text(&self) -> u32 {
    self.word(14)
  }

  pub fn tail(&self) -> u32 {
    self.word(18)
  }

  /// Attribute pair `(name offset, value offset)`, `idx < attr_count()`.
  pub fn attr(&self, idx: u8) -> (u32, u32) {
    let rel = NODE_SIZE + ATTR_SIZE * idx as u32;
    (self.word(rel), self.word(rel + 4))
  }

  /// Search-token string offset, `idx < token_count()`.
  pub fn token(&self, idx: u8) -> u32 {
    if !self.is_tokenized() {
      return UNSET;
    }
    let rel = NODE_SIZE + ATTR_SIZE * self.attr_count() as u32 + TOKEN_SIZE * idx as u32;
    self.word(rel)
  }

  /// On-disk size of this record including attribute and token arrays; a
  /// sentinel is a single byte.
  pub fn size(&self) -> u32 {
    if !self.is_element() {
      return SENTINEL_SIZE;
    }
    NODE_SIZE + ATTR_SIZE * self.attr_count() as u32 + TOKEN_SIZE * self.token_count() as u32
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use byteorder::WriteBytesExt;

  fn write_record(buf: &mut Vec<u8>, attr_count: u8, token_count: u8, tokenized: bool) {
    let mut b0 = SiloNodeFlags::IS_ELEMENT.bits();
    if tokenized {
      b0 |= SiloNodeFlags::IS_TOKENIZED.bits();
    }
    buf.push(b0 | (attr_count << 2));
    buf.push(token_count);
    for word in [7u32, 0, 0, UNSET, UNSET] {
      buf.write_u32::<LittleEndian>(word).unwrap();
    }
    for i in 0..attr_count {
      buf.write_u32::<LittleEndian>(100 + i as u32).unwrap();
      buf.write_u32::<LittleEndian>(200 + i as u32).unwrap();
    }
    for i in 0..token_count {
      buf.write_u32::<LittleEndian>(300 + i as u32).unwrap();
    }
  }

  #[test]
  fn test_element_record() {
    let mut buf = Vec::new();
    write_record(&mut buf, 2, 1, true);
    buf.push(0); // sentinel
    let n = SiloNodeRecord::parse(&buf, 0).unwrap();
    assert!(n.is_element());
    assert!(n.is_tokenized());
    assert_eq!(n.attr_count(), 2);
    assert_eq!(n.token_count(), 1);
    assert_eq!(n.element_name(), 7);
    assert_eq!(n.text(), UNSET);
    assert_eq!(n.attr(1), (101, 201));
    assert_eq!(n.token(0), 300);
    assert_eq!(n.size(), NODE_SIZE + 2 * ATTR_SIZE + TOKEN_SIZE);

    let sentinel = SiloNodeRecord::parse(&buf, n.size()).unwrap();
    assert!(!sentinel.is_element());
    assert_eq!(sentinel.size(), SENTINEL_SIZE);
  }

  #[test]
  fn test_truncated() {
    let mut buf = Vec::new();
    write_record(&mut buf, 2, 0, false);
    buf.truncate(10);
    assert!(SiloNodeRecord::parse(&buf, 0).is_err());
    assert!(SiloNodeRecord::parse(&buf, 999).is_err());
  }
}
