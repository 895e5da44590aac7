//
// Copyright (c) The LSOE Project Contributors
//
// SPDX-License-Identifier: MIT
//

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// 48-bit MAC address (IEEE EUI-48 format).
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MacAddr([u8; 6]);

// Error returned when parsing a malformed MAC address string.
#[derive(Debug, Eq, PartialEq)]
pub struct MacAddrParseError(String);

// ===== impl MacAddr =====

impl MacAddr {
    pub const LENGTH: usize = 6;
    pub const BROADCAST: Self = Self([0xff; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        MacAddr(bytes)
    }

    pub fn as_bytes(&self) -> [u8; 6] {
        self.0
    }

    // Group bit: set for multicast and broadcast destinations.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_unspecified(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(bytes: [u8; 6]) -> Self {
        MacAddr(bytes)
    }
}

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5],
        ))
    }
}

impl std::str::FromStr for MacAddr {
    type Err = MacAddrParseError;

    // Accepts both colon and hyphen separated notations.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; 6];
        let mut octets = s.split(|c| c == ':' || c == '-');
        for byte in bytes.iter_mut() {
            let octet = octets
                .next()
                .ok_or_else(|| MacAddrParseError(s.to_owned()))?;
            *byte = u8::from_str_radix(octet, 16)
                .map_err(|_| MacAddrParseError(s.to_owned()))?;
        }
        if octets.next().is_some() {
            return Err(MacAddrParseError(s.to_owned()));
        }
        Ok(MacAddr(bytes))
    }
}

impl Serialize for MacAddr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

// ===== impl MacAddrParseError =====

impl std::fmt::Display for MacAddrParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid MAC address: {}", self.0)
    }
}

impl std::error::Error for MacAddrParseError {}

// ===== unit tests =====
