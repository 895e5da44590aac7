//
// Copyright (c) The LSOE Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::packet::transport::Frame;
use crate::session::DropReason;

// Outbound fragmentation failure: the PDU cannot be carried within the
// 7-bit frame sequence space at the given MTU.
#[derive(Debug, Eq, PartialEq)]
pub enum FragmentError {
    PduTooLarge { len: usize, mtu: u32 },
}

// Inbound reassembly failures. Both discard the partial buffer; the sender's
// retransmission recovers the PDU.
#[derive(Debug, Eq, PartialEq)]
pub enum ReassembleError {
    OutOfOrder { expected: u8, got: u8 },
    LengthMismatch { expected: u16, got: usize },
}

// Per-peer reassembly buffer. Reassembly is lock-step: there is at most one
// in-flight PDU per direction per peer.
#[derive(Debug)]
pub struct Reassembler {
    next_seqno: u8,
    pdu_len: u16,
    buf: BytesMut,
    last_progress: Instant,
}

// ===== impl FragmentError =====

impl std::fmt::Display for FragmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FragmentError::PduTooLarge { len, mtu } => {
                write!(f, "PDU of {len} octets does not fit MTU {mtu}")
            }
        }
    }
}

impl std::error::Error for FragmentError {}

// ===== impl ReassembleError =====

impl ReassembleError {
    pub(crate) fn drop_reason(&self) -> DropReason {
        match self {
            ReassembleError::OutOfOrder { .. }
            | ReassembleError::LengthMismatch { .. } => DropReason::OutOfOrder,
        }
    }
}

impl std::fmt::Display for ReassembleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReassembleError::OutOfOrder { expected, got } => {
                write!(
                    f,
                    "out-of-order frame (expected {expected}, got {got})"
                )
            }
            ReassembleError::LengthMismatch { expected, got } => {
                write!(
                    f,
                    "PDU length mismatch (expected {expected}, got {got})"
                )
            }
        }
    }
}

impl std::error::Error for ReassembleError {}

// ===== impl Reassembler =====

impl Reassembler {
    pub fn new(now: Instant) -> Reassembler {
        Reassembler {
            next_seqno: 0,
            pdu_len: 0,
            buf: BytesMut::new(),
            last_progress: now,
        }
    }

    // Returns whether a partially reassembled PDU is buffered.
    pub fn is_active(&self) -> bool {
        self.next_seqno != 0
    }

    // Returns the instant at which the partial buffer must be discarded.
    pub fn deadline(&self, ttl: Duration) -> Option<Instant> {
        self.is_active().then(|| self.last_progress + ttl)
    }

    // Discards any partially reassembled PDU.
    pub fn reset(&mut self) {
        self.next_seqno = 0;
        self.pdu_len = 0;
        self.buf.clear();
    }

    // Feeds one received frame into the buffer. Returns the complete PDU
    // once the last frame arrives.
    pub fn push(
        &mut self,
        frame: Frame,
        now: Instant,
    ) -> Result<Option<Bytes>, ReassembleError> {
        // Frames must arrive strictly in sequence; anything else discards the
        // partial buffer together with the offending frame.
        if frame.seqno != self.next_seqno {
            let expected = self.next_seqno;
            self.reset();
            return Err(ReassembleError::OutOfOrder {
                expected,
                got: frame.seqno,
            });
        }

        // All frames of one PDU must agree on the total length.
        if self.next_seqno == 0 {
            self.pdu_len = frame.pdu_len;
        } else if frame.pdu_len != self.pdu_len {
            let expected = self.pdu_len;
            self.reset();
            return Err(ReassembleError::LengthMismatch {
                expected,
                got: frame.pdu_len as usize,
            });
        }

        self.buf.extend_from_slice(&frame.payload);
        self.next_seqno = self.next_seqno.saturating_add(1);
        self.last_progress = now;

        if self.buf.len() > self.pdu_len as usize {
            let expected = self.pdu_len;
            let got = self.buf.len();
            self.reset();
            return Err(ReassembleError::LengthMismatch { expected, got });
        }

        if frame.last {
            let expected = self.pdu_len;
            let data = self.buf.split().freeze();
            self.reset();
            if data.len() != expected as usize {
                return Err(ReassembleError::LengthMismatch {
                    expected,
                    got: data.len(),
                });
            }
            return Ok(Some(data));
        }

        Ok(None)
    }
}

// ===== global functions =====

// Splits an encoded PDU into transport frames no larger than the interface
// MTU. The packet socket prepends the Ethernet header outside the MTU'd
// payload, so the per-frame budget is MTU minus the transport header.
pub fn fragment(pdu: Bytes, mtu: u32) -> Result<Vec<Frame>, FragmentError> {
    let budget = (mtu as usize).saturating_sub(Frame::HDR_LEN);
    if budget == 0 {
        return Err(FragmentError::PduTooLarge {
            len: pdu.len(),
            mtu,
        });
    }

    let pdu_len = pdu.len() as u16;
    let nframes = pdu.len().div_ceil(budget).max(1);
    if nframes > Frame::MAX_SEQNO as usize + 1 {
        return Err(FragmentError::PduTooLarge {
            len: pdu.len(),
            mtu,
        });
    }

    let mut frames = Vec::with_capacity(nframes);
    for seqno in 0..nframes {
        let start = seqno * budget;
        let end = (start + budget).min(pdu.len());
        frames.push(Frame {
            last: seqno == nframes - 1,
            seqno: seqno as u8,
            pdu_len,
            payload: pdu.slice(start..end),
        });
    }

    Ok(frames)
}

// ===== unit tests =====
