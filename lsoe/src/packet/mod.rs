//
// Copyright (c) The LSOE Project Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod consts;
pub mod error;
pub mod pdu;
pub mod transport;

use bytes::{Buf, BufMut, Bytes, BytesMut, TryGetError};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// 10-octet router identifier advertised in HELLO and OPEN PDUs.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct LocalId([u8; 10]);

// Error returned when parsing a malformed local-id string.
#[derive(Debug, Eq, PartialEq)]
pub struct LocalIdParseError(String);

// ===== impl LocalId =====

impl LocalId {
    pub const LENGTH: usize = 10;

    pub const fn new(bytes: [u8; 10]) -> Self {
        LocalId(bytes)
    }

    pub fn as_bytes(&self) -> [u8; 10] {
        self.0
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.0);
    }

    pub(crate) fn decode(buf: &mut Bytes) -> Result<Self, TryGetError> {
        let mut bytes = [0; Self::LENGTH];
        buf.try_copy_to_slice(&mut bytes)?;
        Ok(LocalId(bytes))
    }
}

impl From<[u8; 10]> for LocalId {
    fn from(bytes: [u8; 10]) -> Self {
        LocalId(bytes)
    }
}

impl std::fmt::Display for LocalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i != 0 {
                write!(f, ":")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for LocalId {
    type Err = LocalIdParseError;

    // Accepts both colon and hyphen separated notations.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; Self::LENGTH];
        let mut octets = s.split(|c| c == ':' || c == '-');
        for byte in bytes.iter_mut() {
            let octet = octets
                .next()
                .ok_or_else(|| LocalIdParseError(s.to_owned()))?;
            *byte = u8::from_str_radix(octet, 16)
                .map_err(|_| LocalIdParseError(s.to_owned()))?;
        }
        if octets.next().is_some() {
            return Err(LocalIdParseError(s.to_owned()));
        }
        Ok(LocalId(bytes))
    }
}

impl Serialize for LocalId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for LocalId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

// ===== impl LocalIdParseError =====

impl std::fmt::Display for LocalIdParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid local-id: {}", self.0)
    }
}

impl std::error::Error for LocalIdParseError {}
