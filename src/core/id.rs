//! Protocol identifier types.

use std::{fmt, str::FromStr};

#[cfg(feature = "codec")]
use bincode::{Decode, Encode};

use crate::core::error::Error;

/// A 160-bit identifier placed on the overlay ring.
///
/// Identifiers are written as 40 hexadecimal digits, most-significant digit first. Digit `i` is
/// what the prefix routing table indexes on at row `i`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub struct NodeId {
    bytes: [u8; Self::BYTES],
}

impl NodeId {
    /// The size of the identifier in bytes.
    pub const BYTES: usize = 20;

    /// The size of the identifier in bits.
    pub const BITS: usize = Self::BYTES * 8;

    /// The number of hexadecimal digits in the identifier.
    pub const DIGITS: usize = Self::BYTES * 2;

    /// The number of values a single digit can take.
    pub const RADIX: usize = 16;

    /// Creates a new identifier from the supplied big-endian bytes.
    pub fn new(bytes: [u8; Self::BYTES]) -> Self {
        NodeId { bytes }
    }

    /// Returns the big-endian bytes backing the identifier.
    pub fn bytes(&self) -> [u8; Self::BYTES] {
        self.bytes
    }

    /// Parses a 40 digit hexadecimal identifier, case-insensitively.
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        if s.len() != Self::DIGITS {
            return Err(Error::InvalidIdLength { len: s.len() });
        }

        let mut bytes = [0u8; Self::BYTES];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| Error::InvalidIdDigit(s.to_owned()))?;

        Ok(Self { bytes })
    }

    /// Returns the hexadecimal digit at position `i` (0 is the most-significant digit).
    ///
    /// Panics if `i >= NodeId::DIGITS`.
    pub fn digit(&self, i: usize) -> u8 {
        let byte = self.bytes[i / 2];
        if i % 2 == 0 {
            byte >> 4
        } else {
            byte & 0x0f
        }
    }

    /// Returns the identifier as 40 upper-case hexadecimal digits.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.bytes)
    }

    #[cfg(test)]
    /// Convenience function for working with small identifiers during testing, the value is
    /// placed in the least-significant bytes.
    pub fn from_u16(raw: u16) -> Self {
        let mut bytes = [0u8; Self::BYTES];
        bytes[Self::BYTES - 2..].copy_from_slice(&raw.to_be_bytes());

        Self { bytes }
    }

    #[doc(hidden)]
    /// Convenience function for generating random identifiers during testing.
    pub fn rand() -> Self {
        use rand::{thread_rng, Fill};

        let mut rng = thread_rng();
        let mut bytes = [0u8; Self::BYTES];
        assert!(bytes.try_fill(&mut rng).is_ok());

        Self { bytes }
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}
