//
// Copyright (c) The LSOE Project Contributors
//
// SPDX-License-Identifier: MIT
//

use ipnetwork::IpNetwork;
use tracing::{debug, debug_span};

use crate::packet::consts::PduType;
use crate::session::{PeerKey, State};

// LSOE debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    SessionCreate(&'a PeerKey),
    SessionDelete(&'a PeerKey),
    FsmTransition(&'a PeerKey, State, State),
    Retransmit(&'a PeerKey, PduType, u8),
    HoldTimeExpiry(&'a PeerKey),
    ReassemblyExpiry(&'a PeerKey),
    HelloTx(&'a str),
    InterfaceUpdate(&'a str),
    InterfaceDelete(&'a str),
    AddressAdd(&'a str, &'a IpNetwork),
    AddressDelete(&'a str, &'a IpNetwork),
    SnapshotPush(u64),
}

// ===== impl Debug =====

impl Debug<'_> {
    // Log debug message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::SessionCreate(key)
            | Debug::SessionDelete(key)
            | Debug::HoldTimeExpiry(key)
            | Debug::ReassemblyExpiry(key) => {
                debug_span!("session", %key).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::FsmTransition(key, old_state, new_state) => {
                debug_span!("session", %key).in_scope(|| {
                    debug!(%old_state, %new_state, "{}", self);
                });
            }
            Debug::Retransmit(key, pdu_type, attempts) => {
                debug_span!("session", %key).in_scope(|| {
                    debug!(%pdu_type, %attempts, "{}", self);
                });
            }
            Debug::HelloTx(ifname)
            | Debug::InterfaceUpdate(ifname)
            | Debug::InterfaceDelete(ifname) => {
                debug!(interface = %ifname, "{}", self);
            }
            Debug::AddressAdd(ifname, addr)
            | Debug::AddressDelete(ifname, addr) => {
                debug!(interface = %ifname, address = %addr, "{}", self);
            }
            Debug::SnapshotPush(serial) => {
                debug!(%serial, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Debug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::SessionCreate(..) => {
                write!(f, "session created")
            }
            Debug::SessionDelete(..) => {
                write!(f, "session deleted")
            }
            Debug::FsmTransition(..) => {
                write!(f, "state transition")
            }
            Debug::Retransmit(..) => {
                write!(f, "retransmitting unacknowledged PDU")
            }
            Debug::HoldTimeExpiry(..) => {
                write!(f, "hold time expired")
            }
            Debug::ReassemblyExpiry(..) => {
                write!(f, "reassembly buffer expired")
            }
            Debug::HelloTx(..) => {
                write!(f, "sending hello")
            }
            Debug::InterfaceUpdate(..) => {
                write!(f, "interface updated")
            }
            Debug::InterfaceDelete(..) => {
                write!(f, "interface removed")
            }
            Debug::AddressAdd(..) => {
                write!(f, "address added")
            }
            Debug::AddressDelete(..) => {
                write!(f, "address removed")
            }
            Debug::SnapshotPush(..) => {
                write!(f, "pushing northbound snapshot")
            }
        }
    }
}
