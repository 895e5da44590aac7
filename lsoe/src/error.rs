//
// Copyright (c) The LSOE Project Contributors
//
// SPDX-License-Identifier: MIT
//

use tracing::{error, warn};

use crate::fragment::FragmentError;
use crate::packet::consts::{ErrorCode, PduType};
use crate::packet::error::DecodeError;
use crate::session::PeerKey;

// LSOE errors.
#[derive(Debug)]
pub enum Error {
    // I/O errors
    IoError(IoError),
    // Packet input
    PduDecodeError(PeerKey, DecodeError),
    // Session failures
    KeepaliveTimeout(PeerKey),
    RetransmitExhausted(PeerKey, PduType),
    LinkDown(String),
    PeerError(PeerKey, ErrorCode),
    VendorRejected(PeerKey, u32),
    // Packet output
    FragmentError(PeerKey, FragmentError),
}

// LSOE I/O errors.
#[derive(Debug)]
pub enum IoError {
    SocketError(std::io::Error),
    RecvError(std::io::Error),
    SendError(std::io::Error),
    RecvMissingSourceAddr,
    FrameTooLarge { len: usize, mtu: u32 },
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        match self {
            Error::IoError(error) => {
                error.log();
            }
            Error::PduDecodeError(key, error) => {
                warn!(session = %key, error = %with_source(error), "{}", self);
            }
            Error::KeepaliveTimeout(key) => {
                warn!(session = %key, "{}", self);
            }
            Error::RetransmitExhausted(key, pdu_type) => {
                warn!(session = %key, %pdu_type, "{}", self);
            }
            Error::LinkDown(ifname) => {
                warn!(interface = %ifname, "{}", self);
            }
            Error::PeerError(key, code) => {
                warn!(session = %key, %code, "{}", self);
            }
            Error::VendorRejected(key, enterprise) => {
                warn!(session = %key, %enterprise, "{}", self);
            }
            Error::FragmentError(key, error) => {
                warn!(session = %key, error = %error, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(error) => error.fmt(f),
            Error::PduDecodeError(..) => {
                write!(f, "failed to decode PDU")
            }
            Error::KeepaliveTimeout(..) => {
                write!(f, "hold time expired")
            }
            Error::RetransmitExhausted(..) => {
                write!(f, "retransmission attempts exhausted")
            }
            Error::LinkDown(..) => {
                write!(f, "interface is gone")
            }
            Error::PeerError(..) => {
                write!(f, "peer reported an error")
            }
            Error::VendorRejected(..) => {
                write!(f, "vendor extension rejected")
            }
            Error::FragmentError(..) => {
                write!(f, "failed to fragment PDU")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(error) => Some(error),
            Error::PduDecodeError(_, error) => Some(error),
            Error::FragmentError(_, error) => Some(error),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(error: IoError) -> Error {
        Error::IoError(error)
    }
}

// ===== impl IoError =====

impl IoError {
    pub(crate) fn log(&self) {
        match self {
            IoError::SocketError(error)
            | IoError::RecvError(error)
            | IoError::SendError(error) => {
                warn!(error = %with_source(error), "{}", self);
            }
            IoError::RecvMissingSourceAddr => {
                warn!("{}", self);
            }
            IoError::FrameTooLarge { len, mtu } => {
                error!(%len, %mtu, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for IoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoError::SocketError(..) => {
                write!(f, "failed to create raw socket")
            }
            IoError::RecvError(..) => {
                write!(f, "failed to receive frame")
            }
            IoError::SendError(..) => {
                write!(f, "failed to send frame")
            }
            IoError::RecvMissingSourceAddr => {
                write!(
                    f,
                    "failed to retrieve source address from received frame"
                )
            }
            IoError::FrameTooLarge { .. } => {
                write!(f, "frame exceeds interface MTU")
            }
        }
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IoError::SocketError(error)
            | IoError::RecvError(error)
            | IoError::SendError(error) => Some(error),
            _ => None,
        }
    }
}

// ===== global functions =====

fn with_source<E: std::error::Error>(error: E) -> String {
    if let Some(source) = error.source() {
        format!("{} ({})", error, with_source(source))
    } else {
        error.to_string()
    }
}
