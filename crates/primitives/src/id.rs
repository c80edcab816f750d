use std::fmt;
use std::str::FromStr;

use arbitrary::Arbitrary;
use borsh::{BorshDeserialize, BorshSerialize};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Error parsing an [`Id256`] from its hex form.
#[derive(Debug, thiserror::Error)]
#[error("invalid 256-bit id hex string")]
pub struct ParseIdError;

/// A 256-bit opaque identifier.
///
/// Used for channel IDs, transaction IDs and block hashes.  Only equality
/// and hex encoding are meaningful; the interpretation of the bytes is up
/// to whoever produced the value.
#[derive(
    Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, BorshSerialize, BorshDeserialize,
)]
pub struct Id256([u8; 32]);

impl Id256 {
    /// Number of bytes in an id.
    pub const LEN: usize = 32;

    pub const ZERO: Self = Self([0; 32]);

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Parses the lower-case or mixed-case hex representation.
    pub fn from_hex(s: &str) -> Result<Self, ParseIdError> {
        if s.len() != 64 {
            return Err(ParseIdError);
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| ParseIdError)?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; 32]> for Id256 {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl FromStr for Id256 {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Debug for Id256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Display for Id256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Id256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Id256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as Deserialize<'de>>::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(D::Error::custom)
    }
}

impl<'a> Arbitrary<'a> for Id256 {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let mut bytes = [0u8; 32];
        u.fill_buffer(&mut bytes)?;
        Ok(Self(bytes))
    }
}
