//
// Copyright (c) The LSOE Project Contributors
//
// SPDX-License-Identifier: MIT
//

use bytes::TryGetError;
use serde::{Deserialize, Serialize};

use crate::packet::consts::ErrorCode;

// Type aliases.
pub type DecodeResult<T> = Result<T, DecodeError>;

// LSOE message decoding errors.
#[derive(Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum DecodeError {
    ReadOutOfBounds,
    // Transport frame header
    IncompleteFrame,
    ChecksumMismatch { expected: u32, actual: u32 },
    // PDU header
    IncompletePdu,
    InvalidVersion(u8),
    UnknownPduType(u8),
    InvalidPduLength(u16),
    // PDU bodies
    NonZeroReserved,
    InvalidHoldtime(u16),
    InvalidAckType(u8),
    InvalidPrefixLength(u8),
    InvalidLabel(u32),
    InvalidErrorCode(u16),
}

// ===== impl DecodeError =====

impl DecodeError {
    // Maps the decoding failure to the error code reported back to the peer.
    //
    // Failures answered with `None` are recovered locally (dropped and
    // counted) instead of being surfaced as an ERROR PDU.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            DecodeError::IncompleteFrame
            | DecodeError::ChecksumMismatch { .. }
            | DecodeError::UnknownPduType(..) => None,
            DecodeError::InvalidVersion(..) => {
                Some(ErrorCode::VersionMismatch)
            }
            DecodeError::IncompletePdu | DecodeError::InvalidPduLength(..) => {
                Some(ErrorCode::MissingMandatoryField)
            }
            _ => Some(ErrorCode::MalformedPdu),
        }
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::ReadOutOfBounds => {
                write!(f, "attempt to read out of bounds")
            }
            DecodeError::IncompleteFrame => {
                write!(f, "incomplete transport frame")
            }
            DecodeError::ChecksumMismatch { expected, actual } => {
                write!(
                    f,
                    "frame checksum mismatch (expected {expected:#010x}, actual {actual:#010x})"
                )
            }
            DecodeError::IncompletePdu => {
                write!(f, "incomplete PDU")
            }
            DecodeError::InvalidVersion(version) => {
                write!(f, "invalid version: {version}")
            }
            DecodeError::UnknownPduType(pdu_type) => {
                write!(f, "unknown PDU type: {pdu_type}")
            }
            DecodeError::InvalidPduLength(pdu_len) => {
                write!(f, "invalid PDU length: {pdu_len}")
            }
            DecodeError::NonZeroReserved => {
                write!(f, "non-zero reserved field")
            }
            DecodeError::InvalidHoldtime(holdtime) => {
                write!(f, "invalid hold time: {holdtime}")
            }
            DecodeError::InvalidAckType(pdu_type) => {
                write!(f, "invalid acknowledged PDU type: {pdu_type}")
            }
            DecodeError::InvalidPrefixLength(plen) => {
                write!(f, "invalid prefix length: {plen}")
            }
            DecodeError::InvalidLabel(label) => {
                write!(f, "invalid MPLS label: {label}")
            }
            DecodeError::InvalidErrorCode(code) => {
                write!(f, "invalid error code: {code}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<TryGetError> for DecodeError {
    fn from(_error: TryGetError) -> DecodeError {
        DecodeError::ReadOutOfBounds
    }
}
