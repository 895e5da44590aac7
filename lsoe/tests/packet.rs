//
// Copyright (c) The LSOE Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::LazyLock as Lazy;

use bytes::Bytes;
use lsoe::packet::LocalId;
use lsoe::packet::consts::{ErrorCode, PduType};
use lsoe::packet::error::DecodeError;
use lsoe::packet::pdu::{
    Ack, Close, ErrorPdu, Hello, Ipv4Encap, Ipv4Entry, Ipv6Encap, Ipv6Entry,
    Keepalive, MplsEncap, MplsEntry, Open, Pdu, Vendor,
};
use lsoe::packet::transport::Frame;

//
// Helper functions.
//

fn test_encode_pdu(bytes_expected: &[u8], pdu: &Pdu) {
    let bytes_actual = pdu.encode();
    assert_eq!(bytes_expected, bytes_actual.as_ref());
}

fn test_decode_pdu(bytes: &[u8], pdu_expected: &Pdu) {
    let pdu_actual = Pdu::decode(bytes).unwrap();
    assert_eq!(*pdu_expected, pdu_actual);
}

fn local_id() -> LocalId {
    LocalId::new([0xde, 0xad, 0xbe, 0xef, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01])
}

//
// Test PDUs.
//

static HELLO: Lazy<(Vec<u8>, Pdu)> = Lazy::new(|| {
    (
        vec![
            0x00, 0x01, 0x00, 0x0e, 0xde, 0xad, 0xbe, 0xef, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x01,
        ],
        Pdu::Hello(Hello::new(local_id())),
    )
});

static OPEN: Lazy<(Vec<u8>, Pdu)> = Lazy::new(|| {
    (
        vec![
            0x00, 0x02, 0x00, 0x16, 0x00, 0x00, 0x00, 0x01, 0xde, 0xad, 0xbe,
            0xef, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x28, 0x00, 0x00,
        ],
        Pdu::Open(Open::new(1, local_id(), 40)),
    )
});

static KEEPALIVE: Lazy<(Vec<u8>, Pdu)> = Lazy::new(|| {
    (
        vec![0x00, 0x03, 0x00, 0x08, 0x00, 0x00, 0x00, 0x2a],
        Pdu::Keepalive(Keepalive::new(42)),
    )
});

static ACK: Lazy<(Vec<u8>, Pdu)> = Lazy::new(|| {
    (
        vec![
            0x00, 0x04, 0x00, 0x0a, 0x02, 0x00, 0x00, 0x00, 0x00, 0x01,
        ],
        Pdu::Ack(Ack::new(PduType::Open, 1)),
    )
});

static IPV4_ENCAP: Lazy<(Vec<u8>, Pdu)> = Lazy::new(|| {
    (
        vec![
            0x00, 0x05, 0x00, 0x14, 0x00, 0x00, 0x00, 0x03, 0x00, 0x02, 0xc0,
            0x00, 0x02, 0x01, 0x18, 0x0a, 0x00, 0x00, 0x01, 0x20,
        ],
        Pdu::Ipv4Encap(Ipv4Encap::new(
            3,
            vec![
                Ipv4Entry::new("192.0.2.1".parse().unwrap(), 24),
                Ipv4Entry::new("10.0.0.1".parse().unwrap(), 32),
            ],
        )),
    )
});

static IPV6_ENCAP: Lazy<(Vec<u8>, Pdu)> = Lazy::new(|| {
    (
        vec![
            0x00, 0x06, 0x00, 0x1b, 0x00, 0x00, 0x00, 0x04, 0x00, 0x01, 0x20,
            0x01, 0x0d, 0xb8, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x01, 0x40,
        ],
        Pdu::Ipv6Encap(Ipv6Encap::new(
            4,
            vec![Ipv6Entry::new("2001:db8::1".parse().unwrap(), 64)],
        )),
    )
});

static MPLS_ENCAP_EMPTY: Lazy<(Vec<u8>, Pdu)> = Lazy::new(|| {
    (
        vec![
            0x00, 0x07, 0x00, 0x0a, 0x00, 0x00, 0x00, 0x05, 0x00, 0x00,
        ],
        Pdu::MplsEncap(MplsEncap::new(5, vec![])),
    )
});

static MPLS_ENCAP: Lazy<(Vec<u8>, Pdu)> = Lazy::new(|| {
    (
        vec![
            0x00, 0x07, 0x00, 0x0e, 0x00, 0x00, 0x00, 0x05, 0x00, 0x01, 0x00,
            0x00, 0x00, 0x64,
        ],
        Pdu::MplsEncap(MplsEncap::new(5, vec![MplsEntry::new(100)])),
    )
});

static VENDOR: Lazy<(Vec<u8>, Pdu)> = Lazy::new(|| {
    (
        vec![
            0x00, 0x08, 0x00, 0x0f, 0x00, 0x00, 0x00, 0x06, 0x00, 0x00, 0x0b,
            0xad, 0x65, 0x78, 0x74,
        ],
        Pdu::Vendor(Vendor::new(6, 0x0bad, Bytes::from_static(b"ext"))),
    )
});

static ERROR: Lazy<(Vec<u8>, Pdu)> = Lazy::new(|| {
    (
        vec![
            0x00, 0x09, 0x00, 0x0e, 0x00, 0x00, 0x00, 0x07, 0x00, 0x01, 0x00,
            0x02, 0xde, 0xad,
        ],
        Pdu::Error(ErrorPdu::new(
            7,
            ErrorCode::MalformedPdu,
            Bytes::from_static(&[0xde, 0xad]),
        )),
    )
});

static CLOSE: Lazy<(Vec<u8>, Pdu)> = Lazy::new(|| {
    (
        vec![0x00, 0x0a, 0x00, 0x08, 0x00, 0x00, 0x00, 0x08],
        Pdu::Close(Close::new(8)),
    )
});

//
// Encode/decode tests.
//

#[test]
fn test_encode_hello() {
    let (ref bytes, ref pdu) = *HELLO;
    test_encode_pdu(bytes, pdu);
}

#[test]
fn test_decode_hello() {
    let (ref bytes, ref pdu) = *HELLO;
    test_decode_pdu(bytes, pdu);
}

#[test]
fn test_encode_open() {
    let (ref bytes, ref pdu) = *OPEN;
    test_encode_pdu(bytes, pdu);
}

#[test]
fn test_decode_open() {
    let (ref bytes, ref pdu) = *OPEN;
    test_decode_pdu(bytes, pdu);
}

#[test]
fn test_encode_keepalive() {
    let (ref bytes, ref pdu) = *KEEPALIVE;
    test_encode_pdu(bytes, pdu);
}

#[test]
fn test_decode_keepalive() {
    let (ref bytes, ref pdu) = *KEEPALIVE;
    test_decode_pdu(bytes, pdu);
}

#[test]
fn test_encode_ack() {
    let (ref bytes, ref pdu) = *ACK;
    test_encode_pdu(bytes, pdu);
}

#[test]
fn test_decode_ack() {
    let (ref bytes, ref pdu) = *ACK;
    test_decode_pdu(bytes, pdu);
}

#[test]
fn test_encode_ipv4_encap() {
    let (ref bytes, ref pdu) = *IPV4_ENCAP;
    test_encode_pdu(bytes, pdu);
}

#[test]
fn test_decode_ipv4_encap() {
    let (ref bytes, ref pdu) = *IPV4_ENCAP;
    test_decode_pdu(bytes, pdu);
}

#[test]
fn test_encode_ipv6_encap() {
    let (ref bytes, ref pdu) = *IPV6_ENCAP;
    test_encode_pdu(bytes, pdu);
}

#[test]
fn test_decode_ipv6_encap() {
    let (ref bytes, ref pdu) = *IPV6_ENCAP;
    test_decode_pdu(bytes, pdu);
}

#[test]
fn test_encode_mpls_encap_empty() {
    let (ref bytes, ref pdu) = *MPLS_ENCAP_EMPTY;
    test_encode_pdu(bytes, pdu);
}

#[test]
fn test_decode_mpls_encap_empty() {
    let (ref bytes, ref pdu) = *MPLS_ENCAP_EMPTY;
    test_decode_pdu(bytes, pdu);
}

#[test]
fn test_encode_mpls_encap() {
    let (ref bytes, ref pdu) = *MPLS_ENCAP;
    test_encode_pdu(bytes, pdu);
}

#[test]
fn test_decode_mpls_encap() {
    let (ref bytes, ref pdu) = *MPLS_ENCAP;
    test_decode_pdu(bytes, pdu);
}

#[test]
fn test_encode_vendor() {
    let (ref bytes, ref pdu) = *VENDOR;
    test_encode_pdu(bytes, pdu);
}

#[test]
fn test_decode_vendor() {
    let (ref bytes, ref pdu) = *VENDOR;
    test_decode_pdu(bytes, pdu);
}

#[test]
fn test_encode_error() {
    let (ref bytes, ref pdu) = *ERROR;
    test_encode_pdu(bytes, pdu);
}

#[test]
fn test_decode_error() {
    let (ref bytes, ref pdu) = *ERROR;
    test_decode_pdu(bytes, pdu);
}

#[test]
fn test_encode_close() {
    let (ref bytes, ref pdu) = *CLOSE;
    test_encode_pdu(bytes, pdu);
}

#[test]
fn test_decode_close() {
    let (ref bytes, ref pdu) = *CLOSE;
    test_decode_pdu(bytes, pdu);
}

// Every PDU round-trips through the codec unchanged.
#[test]
fn test_round_trip() {
    for fixture in [
        &*HELLO,
        &*OPEN,
        &*KEEPALIVE,
        &*ACK,
        &*IPV4_ENCAP,
        &*IPV6_ENCAP,
        &*MPLS_ENCAP_EMPTY,
        &*MPLS_ENCAP,
        &*VENDOR,
        &*ERROR,
        &*CLOSE,
    ] {
        let (_, ref pdu) = *fixture;
        assert_eq!(Pdu::decode(&pdu.encode()), Ok(pdu.clone()));
    }
}

//
// Malformed input tests.
//

#[test]
fn test_decode_truncated_header() {
    assert_eq!(
        Pdu::decode(&[0x00, 0x01, 0x00]),
        Err(DecodeError::IncompletePdu)
    );
}

#[test]
fn test_decode_length_shorter_than_header() {
    assert_eq!(
        Pdu::decode(&[0x00, 0x01, 0x00, 0x03]),
        Err(DecodeError::InvalidPduLength(3))
    );
}

#[test]
fn test_decode_length_past_buffer() {
    assert_eq!(
        Pdu::decode(&[0x00, 0x03, 0x00, 0x14, 0x00, 0x00, 0x00, 0x2a]),
        Err(DecodeError::InvalidPduLength(20))
    );
}

#[test]
fn test_decode_unknown_pdu_type() {
    assert_eq!(
        Pdu::decode(&[0x00, 0x63, 0x00, 0x04]),
        Err(DecodeError::UnknownPduType(99))
    );
}

#[test]
fn test_decode_version_mismatch() {
    let (ref bytes, _) = *HELLO;
    let mut bytes = bytes.clone();
    bytes[0] = 0x01;
    assert_eq!(Pdu::decode(&bytes), Err(DecodeError::InvalidVersion(1)));
}

#[test]
fn test_decode_open_reserved_must_be_zero() {
    let (ref bytes, _) = *OPEN;
    let mut bytes = bytes.clone();
    *bytes.last_mut().unwrap() = 0x01;
    assert_eq!(Pdu::decode(&bytes), Err(DecodeError::NonZeroReserved));
}

#[test]
fn test_decode_open_zero_hold_time() {
    let (ref bytes, _) = *OPEN;
    let mut bytes = bytes.clone();
    bytes[18] = 0x00;
    bytes[19] = 0x00;
    assert_eq!(Pdu::decode(&bytes), Err(DecodeError::InvalidHoldtime(0)));
}

#[test]
fn test_decode_encap_count_overrun() {
    assert_eq!(
        Pdu::decode(&[
            0x00, 0x05, 0x00, 0x0a, 0x00, 0x00, 0x00, 0x03, 0x00, 0x05,
        ]),
        Err(DecodeError::ReadOutOfBounds)
    );
}

#[test]
fn test_decode_encap_invalid_prefix_length() {
    assert_eq!(
        Pdu::decode(&[
            0x00, 0x05, 0x00, 0x0f, 0x00, 0x00, 0x00, 0x03, 0x00, 0x01, 0xc0,
            0x00, 0x02, 0x01, 0x21,
        ]),
        Err(DecodeError::InvalidPrefixLength(33))
    );
}

#[test]
fn test_decode_ack_of_unackable_type() {
    assert_eq!(
        Pdu::decode(&[
            0x00, 0x04, 0x00, 0x0a, 0x01, 0x00, 0x00, 0x00, 0x00, 0x01,
        ]),
        Err(DecodeError::InvalidAckType(1))
    );
}

#[test]
fn test_decode_error_unknown_code() {
    assert_eq!(
        Pdu::decode(&[
            0x00, 0x09, 0x00, 0x0c, 0x00, 0x00, 0x00, 0x07, 0x00, 0x63, 0x00,
            0x00,
        ]),
        Err(DecodeError::InvalidErrorCode(99))
    );
}

#[test]
fn test_decode_truncated_body() {
    assert_eq!(
        Pdu::decode(&[0x00, 0x03, 0x00, 0x06, 0x00, 0x00]),
        Err(DecodeError::ReadOutOfBounds)
    );
}

//
// Transport frame tests.
//

// CRC-32 check value of "123456789" is 0xCBF43926.
static FRAME: Lazy<(Vec<u8>, Frame)> = Lazy::new(|| {
    (
        vec![
            0x00, 0x80, 0x00, 0x09, 0xcb, 0xf4, 0x39, 0x26, 0x31, 0x32, 0x33,
            0x34, 0x35, 0x36, 0x37, 0x38, 0x39,
        ],
        Frame {
            last: true,
            seqno: 0,
            pdu_len: 9,
            payload: Bytes::from_static(b"123456789"),
        },
    )
});

#[test]
fn test_encode_frame() {
    let (ref bytes, ref frame) = *FRAME;
    assert_eq!(bytes.as_slice(), frame.encode().as_ref());
}

#[test]
fn test_decode_frame() {
    let (ref bytes, ref frame) = *FRAME;
    assert_eq!(Frame::decode(bytes), Ok(frame.clone()));
}

#[test]
fn test_decode_frame_flags() {
    let (ref bytes, _) = *FRAME;
    let mut bytes = bytes.clone();
    // Mid-PDU frame carrying sequence number 5.
    bytes[1] = 0x05;
    let frame = Frame::decode(&bytes).unwrap();
    assert!(!frame.last);
    assert_eq!(frame.seqno, 5);
}

#[test]
fn test_decode_frame_version_mismatch() {
    let (ref bytes, _) = *FRAME;
    let mut bytes = bytes.clone();
    bytes[0] = 0x02;
    assert_eq!(Frame::decode(&bytes), Err(DecodeError::InvalidVersion(2)));
}

#[test]
fn test_decode_frame_truncated() {
    assert_eq!(
        Frame::decode(&[0x00, 0x80, 0x00]),
        Err(DecodeError::IncompleteFrame)
    );
}

// Flipping any single payload bit is caught by the checksum.
#[test]
fn test_frame_checksum_sensitivity() {
    let (ref bytes, _) = *FRAME;
    for byte in Frame::HDR_LEN..bytes.len() {
        for bit in 0..8 {
            let mut corrupted = bytes.clone();
            corrupted[byte] ^= 1 << bit;
            assert!(
                matches!(
                    Frame::decode(&corrupted),
                    Err(DecodeError::ChecksumMismatch { .. })
                ),
                "corruption at byte {byte} bit {bit} went undetected"
            );
        }
    }
}
