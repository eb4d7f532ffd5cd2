use std::fmt;

use sha1::{Digest, Sha1};

/// Content fingerprint identifying a silo's inputs: the first 16 bytes of the
/// SHA-1 digest of the GUID-input string. Used as the cache key for
/// [`Builder::ensure`](crate::Builder::ensure).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Guid([u8; Guid::SIZE]);

impl Guid {
  pub const SIZE: usize = 16;

  /// Computes the fingerprint of a byte buffer. An empty buffer hashes to the
  /// all-zero GUID so that a builder with no inputs stays stable.
  pub fn compute_for_data(buf: &[u8]) -> Self {
    if buf.is_empty() {
      return Self::default();
    }
    let mut hasher = Sha1::new();
    hasher.update(buf);
    let digest = hasher.finalize();
    let mut out = [0u8; Self::SIZE];
    out.copy_from_slice(&digest[..Self::SIZE]);
    Self(out)
  }

  pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
    Self(bytes)
  }

  pub fn as_bytes(&self) -> &[u8; Self::SIZE] {
    &self.0
  }
}

impl fmt::Display for Guid {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let b = &self.0;
    write!(
      f,
      "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
      b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]
    )
  }
}

impl fmt::Debug for Guid {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Guid({})", self)
  }
}

#[cfg(test)]
mod tests {
  use super::Guid;

  #[test]
  fn test_empty_is_zero() {
    let guid = Guid::compute_for_data(b"");
    assert_eq!(guid, Guid::default());
    assert_eq!(
      guid.to_string(),
      "00000000-0000-0000-0000-000000000000"
    );
  }

  #[test]
  fn test_stable() {
    let g1 = Guid::compute_for_data(b"source.xml:12345&fr&C");
    let g2 = Guid::compute_for_data(b"source.xml:12345&fr&C");
    let g3 = Guid::compute_for_data(b"source.xml:12346&fr&C");
    assert_eq!(g1, g2);
    assert_ne!(g1, g3);
  }

  #[test]
  fn test_roundtrip_bytes() {
    let g1 = Guid::compute_for_data(b"hello");
    let g2 = Guid::from_bytes(*g1.as_bytes());
    assert_eq!(g1, g2);
  }
}
