//
// Copyright (c) The LSOE Project Contributors
//
// SPDX-License-Identifier: MIT
//

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

// LSOE protocol version implemented by this crate.
pub const VERSION: u8 = 0;

// IEEE Local Experimental EtherType 1.
pub const ETHERTYPE: u16 = 0x88B5;

// Multicast destinations accepted for HELLO PDUs. The first entry (nearest
// bridge scope) is the default.
pub const HELLO_MULTICAST_ADDRS: [[u8; 6]; 3] = [
    [0x01, 0x80, 0xC2, 0x00, 0x00, 0x0E],
    [0x01, 0x80, 0xC2, 0x00, 0x00, 0x03],
    [0x01, 0x80, 0xC2, 0x00, 0x00, 0x00],
];

// LSOE PDU types.
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, Hash, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum PduType {
    Hello = 1,
    Open = 2,
    Keepalive = 3,
    Ack = 4,
    Ipv4Encap = 5,
    Ipv6Encap = 6,
    MplsEncap = 7,
    Vendor = 8,
    Error = 9,
    Close = 10,
}

// Error codes carried in ERROR PDUs.
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum ErrorCode {
    MalformedPdu = 1,
    VersionMismatch = 2,
    MissingMandatoryField = 3,
    VendorRejected = 4,
}

// ===== impl PduType =====

impl PduType {
    // Returns whether PDUs of this type are acknowledged by the receiver.
    pub const fn is_ackable(&self) -> bool {
        !matches!(self, PduType::Hello | PduType::Ack)
    }
}

impl std::fmt::Display for PduType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PduType::Hello => write!(f, "HELLO"),
            PduType::Open => write!(f, "OPEN"),
            PduType::Keepalive => write!(f, "KEEPALIVE"),
            PduType::Ack => write!(f, "ACK"),
            PduType::Ipv4Encap => write!(f, "IPV4-ENCAPSULATION"),
            PduType::Ipv6Encap => write!(f, "IPV6-ENCAPSULATION"),
            PduType::MplsEncap => write!(f, "MPLS-ENCAPSULATION"),
            PduType::Vendor => write!(f, "VENDOR"),
            PduType::Error => write!(f, "ERROR"),
            PduType::Close => write!(f, "CLOSE"),
        }
    }
}

// ===== impl ErrorCode =====

impl ErrorCode {
    // Fatal errors transition the session to the Closing state.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorCode::VersionMismatch | ErrorCode::MissingMandatoryField
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::MalformedPdu => write!(f, "malformed PDU"),
            ErrorCode::VersionMismatch => write!(f, "version mismatch"),
            ErrorCode::MissingMandatoryField => {
                write!(f, "missing mandatory field")
            }
            ErrorCode::VendorRejected => write!(f, "vendor extension rejected"),
        }
    }
}
