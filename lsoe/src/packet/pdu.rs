//
// Copyright (c) The LSOE Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use derive_new::new;
use lsoe_utils::bytes::{BytesExt, BytesMutExt, TLS_BUF};
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};

use crate::packet::LocalId;
use crate::packet::consts::{ErrorCode, PduType, VERSION};
use crate::packet::error::{DecodeError, DecodeResult};

// LSOE PDU.
//
// Every PDU starts with a common 4-byte header: version (1), type (1) and
// total length (2, network order). Bodies are fixed-layout records; every
// acknowledgeable body starts with the per-session sequence identifier
// echoed by the peer's ACK.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum Pdu {
    Hello(Hello),
    Open(Open),
    Keepalive(Keepalive),
    Ack(Ack),
    Ipv4Encap(Ipv4Encap),
    Ipv6Encap(Ipv6Encap),
    MplsEncap(MplsEncap),
    Vendor(Vendor),
    Error(ErrorPdu),
    Close(Close),
}

// HELLO PDU: periodic multicast beacon carrying the sender's identity.
#[derive(Clone, Debug, Eq, new, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Hello {
    pub local_id: LocalId,
}

// OPEN PDU: starts the bidirectional session and advertises the hold time.
#[derive(Clone, Debug, Eq, new, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Open {
    pub seq: u32,
    pub local_id: LocalId,
    pub hold_time: u16,
}

// KEEPALIVE PDU: sent on sending silence while the session is established.
#[derive(Clone, Debug, Eq, new, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Keepalive {
    pub seq: u32,
}

// ACK PDU: acknowledges a single PDU by type and sequence identifier.
#[derive(Clone, Debug, Eq, new, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Ack {
    pub acked_type: PduType,
    pub acked_seq: u32,
}

// IPv4 encapsulation PDU: full replacement of the sender's IPv4 prefixes.
#[derive(Clone, Debug, Eq, new, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Ipv4Encap {
    pub seq: u32,
    pub entries: Vec<Ipv4Entry>,
}

#[derive(Clone, Copy, Debug, Eq, new, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Ipv4Entry {
    pub addr: Ipv4Addr,
    pub plen: u8,
}

// IPv6 encapsulation PDU: full replacement of the sender's IPv6 prefixes.
#[derive(Clone, Debug, Eq, new, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Ipv6Encap {
    pub seq: u32,
    pub entries: Vec<Ipv6Entry>,
}

#[derive(Clone, Copy, Debug, Eq, new, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Ipv6Entry {
    pub addr: Ipv6Addr,
    pub plen: u8,
}

// MPLS encapsulation PDU. Advertised with an empty label list until the
// encapsulation semantics stabilise; the codec round-trips entries so the
// wire format stays forward compatible.
#[derive(Clone, Debug, Eq, new, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct MplsEncap {
    pub seq: u32,
    pub entries: Vec<MplsEntry>,
}

#[derive(Clone, Copy, Debug, Eq, new, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct MplsEntry {
    pub label: u32,
}

// VENDOR PDU: opaque extension keyed by an enterprise number.
#[derive(Clone, Debug, Eq, new, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Vendor {
    pub seq: u32,
    pub enterprise: u32,
    pub body: Bytes,
}

// ERROR PDU: reports a protocol error, carrying a prefix of the offending
// PDU as diagnostic data.
#[derive(Clone, Debug, Eq, new, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct ErrorPdu {
    pub seq: u32,
    pub code: ErrorCode,
    pub data: Bytes,
}

// CLOSE PDU: starts the teardown handshake.
#[derive(Clone, Debug, Eq, new, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Close {
    pub seq: u32,
}

// MPLS labels are 20 bits wide; the upper bits of the carrier word MBZ.
const MPLS_LABEL_MAX: u32 = (1 << 20) - 1;

// ===== impl Pdu =====

impl Pdu {
    pub const HDR_LEN: usize = 4;

    // Decodes an LSOE PDU from a reassembled bytes buffer.
    pub fn decode(data: &[u8]) -> DecodeResult<Self> {
        let mut buf = Bytes::copy_from_slice(data);

        // Decode and validate the common header.
        if data.len() < Self::HDR_LEN {
            return Err(DecodeError::IncompletePdu);
        }
        let version = buf.try_get_u8()?;
        if version != VERSION {
            return Err(DecodeError::InvalidVersion(version));
        }
        let pdu_type = buf.try_get_u8()?;
        let length = buf.try_get_u16()?;
        if (length as usize) < Self::HDR_LEN || length as usize > data.len() {
            return Err(DecodeError::InvalidPduLength(length));
        }
        buf.truncate(length as usize - Self::HDR_LEN);
        let Some(pdu_type) = PduType::from_u8(pdu_type) else {
            return Err(DecodeError::UnknownPduType(pdu_type));
        };

        // Decode PDU-specific fields.
        let pdu = match pdu_type {
            PduType::Hello => Pdu::Hello(Hello::decode(&mut buf)?),
            PduType::Open => Pdu::Open(Open::decode(&mut buf)?),
            PduType::Keepalive => Pdu::Keepalive(Keepalive::decode(&mut buf)?),
            PduType::Ack => Pdu::Ack(Ack::decode(&mut buf)?),
            PduType::Ipv4Encap => Pdu::Ipv4Encap(Ipv4Encap::decode(&mut buf)?),
            PduType::Ipv6Encap => Pdu::Ipv6Encap(Ipv6Encap::decode(&mut buf)?),
            PduType::MplsEncap => Pdu::MplsEncap(MplsEncap::decode(&mut buf)?),
            PduType::Vendor => Pdu::Vendor(Vendor::decode(&mut buf)?),
            PduType::Error => Pdu::Error(ErrorPdu::decode(&mut buf)?),
            PduType::Close => Pdu::Close(Close::decode(&mut buf)?),
        };

        Ok(pdu)
    }

    // Encodes the PDU into a bytes buffer.
    pub fn encode(&self) -> Bytes {
        TLS_BUF.with(|buf| {
            let mut buf = buf.borrow_mut();
            buf.clear();

            buf.put_u8(VERSION);
            buf.put_u8(self.pdu_type() as u8);
            // The length will be initialized later.
            buf.put_u16(0);
            match self {
                Pdu::Hello(pdu) => pdu.encode(&mut buf),
                Pdu::Open(pdu) => pdu.encode(&mut buf),
                Pdu::Keepalive(pdu) => pdu.encode(&mut buf),
                Pdu::Ack(pdu) => pdu.encode(&mut buf),
                Pdu::Ipv4Encap(pdu) => pdu.encode(&mut buf),
                Pdu::Ipv6Encap(pdu) => pdu.encode(&mut buf),
                Pdu::MplsEncap(pdu) => pdu.encode(&mut buf),
                Pdu::Vendor(pdu) => pdu.encode(&mut buf),
                Pdu::Error(pdu) => pdu.encode(&mut buf),
                Pdu::Close(pdu) => pdu.encode(&mut buf),
            }

            // Initialize PDU length.
            let length = buf.len() as u16;
            buf[2..4].copy_from_slice(&length.to_be_bytes());
            Bytes::copy_from_slice(&buf[..])
        })
    }

    // Returns the LSOE PDU type.
    pub const fn pdu_type(&self) -> PduType {
        match self {
            Pdu::Hello(_) => PduType::Hello,
            Pdu::Open(_) => PduType::Open,
            Pdu::Keepalive(_) => PduType::Keepalive,
            Pdu::Ack(_) => PduType::Ack,
            Pdu::Ipv4Encap(_) => PduType::Ipv4Encap,
            Pdu::Ipv6Encap(_) => PduType::Ipv6Encap,
            Pdu::MplsEncap(_) => PduType::MplsEncap,
            Pdu::Vendor(_) => PduType::Vendor,
            Pdu::Error(_) => PduType::Error,
            Pdu::Close(_) => PduType::Close,
        }
    }

    // Returns the sequence identifier of acknowledgeable PDUs.
    pub const fn seq(&self) -> Option<u32> {
        match self {
            Pdu::Hello(_) | Pdu::Ack(_) => None,
            Pdu::Open(pdu) => Some(pdu.seq),
            Pdu::Keepalive(pdu) => Some(pdu.seq),
            Pdu::Ipv4Encap(pdu) => Some(pdu.seq),
            Pdu::Ipv6Encap(pdu) => Some(pdu.seq),
            Pdu::MplsEncap(pdu) => Some(pdu.seq),
            Pdu::Vendor(pdu) => Some(pdu.seq),
            Pdu::Error(pdu) => Some(pdu.seq),
            Pdu::Close(pdu) => Some(pdu.seq),
        }
    }
}

// ===== impl Hello =====

impl Hello {
    fn encode(&self, buf: &mut BytesMut) {
        self.local_id.encode(buf);
    }

    fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let local_id = LocalId::decode(buf)?;

        Ok(Hello { local_id })
    }
}

// ===== impl Open =====

impl Open {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.seq);
        self.local_id.encode(buf);
        buf.put_u16(self.hold_time);
        buf.put_u16(0);
    }

    fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let seq = buf.try_get_u32()?;
        let local_id = LocalId::decode(buf)?;
        let hold_time = buf.try_get_u16()?;
        if hold_time == 0 {
            return Err(DecodeError::InvalidHoldtime(hold_time));
        }
        let reserved = buf.try_get_u16()?;
        if reserved != 0 {
            return Err(DecodeError::NonZeroReserved);
        }

        Ok(Open {
            seq,
            local_id,
            hold_time,
        })
    }
}

// ===== impl Keepalive =====

impl Keepalive {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.seq);
    }

    fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let seq = buf.try_get_u32()?;

        Ok(Keepalive { seq })
    }
}

// ===== impl Ack =====

impl Ack {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.acked_type as u8);
        buf.put_u8(0);
        buf.put_u32(self.acked_seq);
    }

    fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let acked_type = buf.try_get_u8()?;
        let Some(acked_type) = PduType::from_u8(acked_type) else {
            return Err(DecodeError::InvalidAckType(acked_type));
        };
        if !acked_type.is_ackable() {
            return Err(DecodeError::InvalidAckType(acked_type as u8));
        }
        let reserved = buf.try_get_u8()?;
        if reserved != 0 {
            return Err(DecodeError::NonZeroReserved);
        }
        let acked_seq = buf.try_get_u32()?;

        Ok(Ack {
            acked_type,
            acked_seq,
        })
    }
}

// ===== impl Ipv4Encap =====

impl Ipv4Encap {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.seq);
        buf.put_u16(self.entries.len() as u16);
        for entry in &self.entries {
            buf.put_ipv4(&entry.addr);
            buf.put_u8(entry.plen);
        }
    }

    fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let seq = buf.try_get_u32()?;
        let count = buf.try_get_u16()?;
        let mut entries = Vec::with_capacity(count.min(128) as usize);
        for _ in 0..count {
            let addr = buf.try_get_ipv4()?;
            let plen = buf.try_get_u8()?;
            if plen > 32 {
                return Err(DecodeError::InvalidPrefixLength(plen));
            }
            entries.push(Ipv4Entry { addr, plen });
        }

        Ok(Ipv4Encap { seq, entries })
    }
}

// ===== impl Ipv6Encap =====

impl Ipv6Encap {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.seq);
        buf.put_u16(self.entries.len() as u16);
        for entry in &self.entries {
            buf.put_ipv6(&entry.addr);
            buf.put_u8(entry.plen);
        }
    }

    fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let seq = buf.try_get_u32()?;
        let count = buf.try_get_u16()?;
        let mut entries = Vec::with_capacity(count.min(128) as usize);
        for _ in 0..count {
            let addr = buf.try_get_ipv6()?;
            let plen = buf.try_get_u8()?;
            if plen > 128 {
                return Err(DecodeError::InvalidPrefixLength(plen));
            }
            entries.push(Ipv6Entry { addr, plen });
        }

        Ok(Ipv6Encap { seq, entries })
    }
}

// ===== impl MplsEncap =====

impl MplsEncap {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.seq);
        buf.put_u16(self.entries.len() as u16);
        for entry in &self.entries {
            buf.put_u32(entry.label);
        }
    }

    fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let seq = buf.try_get_u32()?;
        let count = buf.try_get_u16()?;
        let mut entries = Vec::with_capacity(count.min(128) as usize);
        for _ in 0..count {
            let label = buf.try_get_u32()?;
            if label > MPLS_LABEL_MAX {
                return Err(DecodeError::InvalidLabel(label));
            }
            entries.push(MplsEntry { label });
        }

        Ok(MplsEncap { seq, entries })
    }
}

// ===== impl Vendor =====

impl Vendor {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.seq);
        buf.put_u32(self.enterprise);
        buf.put_slice(&self.body);
    }

    fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let seq = buf.try_get_u32()?;
        // The enterprise number is opaque to the protocol; unknown values are
        // accepted and dispatched to the registered handler table.
        let enterprise = buf.try_get_u32()?;
        let body = buf.copy_to_bytes(buf.remaining());

        Ok(Vendor {
            seq,
            enterprise,
            body,
        })
    }
}

// ===== impl ErrorPdu =====

impl ErrorPdu {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.seq);
        buf.put_u16(self.code as u16);
        buf.put_u16(self.data.len() as u16);
        buf.put_slice(&self.data);
    }

    fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let seq = buf.try_get_u32()?;
        let code = buf.try_get_u16()?;
        let Some(code) = ErrorCode::from_u16(code) else {
            return Err(DecodeError::InvalidErrorCode(code));
        };
        let data_len = buf.try_get_u16()?;
        if data_len as usize > buf.remaining() {
            return Err(DecodeError::ReadOutOfBounds);
        }
        let data = buf.copy_to_bytes(data_len as usize);

        Ok(ErrorPdu { seq, code, data })
    }
}

// ===== impl Close =====

impl Close {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.seq);
    }

    fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let seq = buf.try_get_u32()?;

        Ok(Close { seq })
    }
}
