//
// Copyright (c) The LSOE Project Contributors
//
// SPDX-License-Identifier: MIT
//

use bytes::{Buf, BufMut, Bytes};
use lsoe_utils::bytes::TLS_BUF;
use serde::{Deserialize, Serialize};

use crate::packet::consts::VERSION;
use crate::packet::error::{DecodeError, DecodeResult};

//
// Transport frame header, prepended to every slice of a PDU put on the wire.
//
//  0               1               2               3
//  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
// +-------+-------+-+-------------+---------------+---------------+
// | Version       |L| PDU-Number  |          PDU Length           |
// +-------+-------+-+-------------+---------------+---------------+
// |                           Checksum                            |
// +---------------+---------------+---------------+---------------+
//
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Frame {
    pub last: bool,
    pub seqno: u8,
    pub pdu_len: u16,
    pub payload: Bytes,
}

// ===== impl Frame =====

impl Frame {
    pub const HDR_LEN: usize = 8;
    pub const MAX_SEQNO: u8 = 0x7f;
    const LAST_FLAG: u8 = 0x80;

    // Encodes the frame into a bytes buffer, computing the payload checksum.
    pub fn encode(&self) -> Bytes {
        TLS_BUF.with(|buf| {
            let mut buf = buf.borrow_mut();
            buf.clear();

            buf.put_u8(VERSION);
            let mut flags = self.seqno & Self::MAX_SEQNO;
            if self.last {
                flags |= Self::LAST_FLAG;
            }
            buf.put_u8(flags);
            buf.put_u16(self.pdu_len);
            buf.put_u32(checksum(&self.payload));
            buf.put_slice(&self.payload);

            Bytes::copy_from_slice(&buf[..])
        })
    }

    // Decodes a frame from a bytes buffer, validating the payload checksum.
    pub fn decode(data: &[u8]) -> DecodeResult<Self> {
        let mut buf = Bytes::copy_from_slice(data);

        if data.len() < Self::HDR_LEN {
            return Err(DecodeError::IncompleteFrame);
        }

        let version = buf.try_get_u8()?;
        if version != VERSION {
            return Err(DecodeError::InvalidVersion(version));
        }
        let flags = buf.try_get_u8()?;
        let last = flags & Self::LAST_FLAG != 0;
        let seqno = flags & Self::MAX_SEQNO;
        let pdu_len = buf.try_get_u16()?;
        let expected = buf.try_get_u32()?;

        let payload = buf;
        let actual = checksum(&payload);
        if actual != expected {
            return Err(DecodeError::ChecksumMismatch { expected, actual });
        }

        Ok(Frame {
            last,
            seqno,
            pdu_len,
            payload,
        })
    }
}

// ===== global functions =====

// CRC-32 (polynomial 0xEDB88320) over the frame payload.
pub fn checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}
