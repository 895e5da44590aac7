//
// Copyright (c) The LSOE Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use lsoe_utils::mac_addr::MacAddr;
use serde::{Deserialize, Serialize};

use crate::Config;
use crate::debug::Debug;
use crate::fragment::Reassembler;
use crate::packet::LocalId;
use crate::packet::consts::PduType;
use crate::packet::pdu::{Ipv4Entry, Ipv6Entry, MplsEntry, Pdu};

// Session lookup key: local interface index plus peer MAC address.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct PeerKey {
    pub ifindex: u32,
    pub mac: MacAddr,
}

// Session FSM states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum State {
    Idle,
    OpenSent,
    OpenRcvd,
    Established,
    Closing,
    Closed,
}

// Reasons a session deadline can fire.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionDeadline {
    HoldExpiry,
    Retransmit,
    KeepaliveSend,
    Reassembly,
}

// Reasons for dropping a received frame or PDU.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DropReason {
    ChecksumFailure,
    OutOfOrder,
    ReassemblyTimeout,
    UnknownPduType,
    Malformed,
    VersionMismatch,
}

// Rolling counters of dropped-frame reasons.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Serialize)]
pub struct DropCounters {
    pub checksum_failure: u64,
    pub out_of_order: u64,
    pub reassembly_timeout: u64,
    pub unknown_pdu_type: u64,
    pub malformed: u64,
    pub version_mismatch: u64,
}

// Retransmit queue entry. Only acknowledgeable PDUs are queued; a matching
// ACK removes the entry by (PDU type, sequence identifier).
#[derive(Debug)]
pub struct RxmtEntry {
    pub pdu: Pdu,
    pub first_sent: Instant,
    pub next_retry: Instant,
    pub attempts: u8,
}

// Peer's advertised address and encapsulation snapshot, replaced atomically
// per address family on every received encapsulation PDU.
#[derive(Clone, Debug, Default)]
#[derive(Serialize)]
pub struct PeerSnapshot {
    pub ipv4: Vec<Ipv4Entry>,
    pub ipv6: Vec<Ipv6Entry>,
    pub mpls: Vec<MplsEntry>,
}

#[derive(Debug)]
#[derive(Serialize)]
pub struct SessionStatistics {
    pub create_time: DateTime<Utc>,
    pub last_state_change_time: Option<DateTime<Utc>>,
    pub rx_pdus: u64,
    pub tx_pdus: u64,
}

#[derive(Debug)]
pub struct Session {
    pub key: PeerKey,
    pub state: State,
    // Peer identity, learned from HELLO and confirmed by OPEN.
    pub peer_id: Option<LocalId>,
    pub peer_hold_time: Option<u16>,
    pub snapshot: PeerSnapshot,
    // Sequence identifier counter shared by all acknowledgeable PDU kinds.
    pub tx_seq: u32,
    // Sequence identifiers of our in-flight OPEN and CLOSE, gating the
    // OpenRcvd -> Established and Closing -> terminal transitions.
    pub open_seq: Option<u32>,
    pub close_seq: Option<u32>,
    pub rxmt_queue: VecDeque<RxmtEntry>,
    pub last_rx: Instant,
    pub last_tx: Instant,
    pub reassembler: Reassembler,
    pub statistics: SessionStatistics,
    pub counters: DropCounters,
}

#[derive(Debug, Default)]
pub struct Sessions(BTreeMap<PeerKey, Session>);

// ===== impl State =====

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Closed)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Idle => write!(f, "idle"),
            State::OpenSent => write!(f, "open-sent"),
            State::OpenRcvd => write!(f, "open-rcvd"),
            State::Established => write!(f, "established"),
            State::Closing => write!(f, "closing"),
            State::Closed => write!(f, "closed"),
        }
    }
}

// ===== impl DropCounters =====

impl DropCounters {
    pub fn bump(&mut self, reason: DropReason) {
        match reason {
            DropReason::ChecksumFailure => self.checksum_failure += 1,
            DropReason::OutOfOrder => self.out_of_order += 1,
            DropReason::ReassemblyTimeout => self.reassembly_timeout += 1,
            DropReason::UnknownPduType => self.unknown_pdu_type += 1,
            DropReason::Malformed => self.malformed += 1,
            DropReason::VersionMismatch => self.version_mismatch += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.checksum_failure
            + self.out_of_order
            + self.reassembly_timeout
            + self.unknown_pdu_type
            + self.malformed
            + self.version_mismatch
    }
}

// ===== impl Session =====

impl Session {
    // Creates a new session for a freshly discovered peer.
    pub(crate) fn new(key: PeerKey, now: Instant) -> Session {
        Debug::SessionCreate(&key).log();

        Session {
            key,
            state: State::Idle,
            peer_id: None,
            peer_hold_time: None,
            snapshot: Default::default(),
            tx_seq: 0,
            open_seq: None,
            close_seq: None,
            rxmt_queue: Default::default(),
            last_rx: now,
            last_tx: now,
            reassembler: Reassembler::new(now),
            statistics: Default::default(),
            counters: Default::default(),
        }
    }

    // Updates the FSM state of the session.
    pub(crate) fn state_update(&mut self, state: State) {
        let old_state = self.state;
        if old_state == state {
            return;
        }
        self.state = state;
        self.statistics.last_state_change_time = Some(Utc::now());

        Debug::FsmTransition(&self.key, old_state, state).log();
    }

    // Allocates the next sequence identifier for an acknowledgeable PDU.
    pub(crate) fn next_seq(&mut self) -> u32 {
        self.tx_seq = self.tx_seq.wrapping_add(1);
        self.tx_seq
    }

    // Effective hold time: the minimum of the two sides wins.
    pub(crate) fn hold_time(&self, config: &Config) -> Duration {
        let hold_time = self
            .peer_hold_time
            .map(|peer| std::cmp::min(peer, config.hold_time))
            .unwrap_or(config.hold_time);
        Duration::from_secs(hold_time as u64)
    }

    // Places an acknowledgeable PDU on the retransmit queue. A stale entry
    // of the same PDU kind is replaced, keeping at most one in-flight PDU
    // per kind.
    pub(crate) fn rxmt_enqueue(&mut self, pdu: Pdu, now: Instant, base: Duration) {
        let pdu_type = pdu.pdu_type();
        self.rxmt_queue.retain(|entry| entry.pdu.pdu_type() != pdu_type);
        self.rxmt_queue.push_back(RxmtEntry {
            pdu,
            first_sent: now,
            next_retry: now + base,
            attempts: 1,
        });
    }

    // Removes the retransmit queue entry matching the given acknowledgement.
    // Returns whether an entry was removed.
    pub(crate) fn rxmt_ack(&mut self, acked_type: PduType, acked_seq: u32) -> bool {
        let len = self.rxmt_queue.len();
        self.rxmt_queue.retain(|entry| {
            entry.pdu.pdu_type() != acked_type
                || entry.pdu.seq() != Some(acked_seq)
        });
        self.rxmt_queue.len() != len
    }

    // Returns the earliest deadline pending on this session, if any.
    pub(crate) fn next_deadline(
        &self,
        config: &Config,
    ) -> Option<(Instant, SessionDeadline)> {
        if self.state.is_terminal() {
            return None;
        }

        let mut next =
            Some((self.last_rx + self.hold_time(config), SessionDeadline::HoldExpiry));

        let mut consider = |deadline: Instant, reason: SessionDeadline| {
            if next.is_none_or(|(earliest, _)| deadline < earliest) {
                next = Some((deadline, reason));
            }
        };

        if let Some(deadline) =
            self.rxmt_queue.iter().map(|entry| entry.next_retry).min()
        {
            consider(deadline, SessionDeadline::Retransmit);
        }
        if self.state == State::Established {
            consider(
                self.last_tx + config.keepalive_interval,
                SessionDeadline::KeepaliveSend,
            );
        }
        if let Some(deadline) = self.reassembler.deadline(config.reassembly_ttl)
        {
            consider(deadline, SessionDeadline::Reassembly);
        }

        next
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        Debug::SessionDelete(&self.key).log();
    }
}

// ===== impl SessionStatistics =====

impl Default for SessionStatistics {
    fn default() -> SessionStatistics {
        SessionStatistics {
            create_time: Utc::now(),
            last_state_change_time: None,
            rx_pdus: 0,
            tx_pdus: 0,
        }
    }
}

// ===== impl Sessions =====

impl Sessions {
    // Returns a mutable reference to the session for the given peer,
    // creating it if it does not exist yet.
    pub(crate) fn insert(&mut self, key: PeerKey, now: Instant) -> &mut Session {
        self.0.entry(key).or_insert_with(|| Session::new(key, now))
    }

    pub fn get(&self, key: &PeerKey) -> Option<&Session> {
        self.0.get(key)
    }

    pub fn get_mut(&mut self, key: &PeerKey) -> Option<&mut Session> {
        self.0.get_mut(key)
    }

    pub(crate) fn remove(&mut self, key: &PeerKey) -> Option<Session> {
        self.0.remove(key)
    }

    // Returns an iterator visiting all sessions, ordered by peer key.
    pub fn iter(&self) -> impl Iterator<Item = &'_ Session> + '_ {
        self.0.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = PeerKey> + '_ {
        self.0.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for PeerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}%{}", self.mac, self.ifindex)
    }
}

// ===== global functions =====

// OPEN collision avoidance: the numerically lower MAC initiates. Identical
// MACs are not expected on real links; the lower local-id breaks the tie,
// and fully identical identities make both ends initiate (the collision
// then resolves through the OpenRcvd path).
pub(crate) fn is_initiator(
    local_mac: MacAddr,
    local_id: LocalId,
    peer_mac: MacAddr,
    peer_id: LocalId,
) -> bool {
    match local_mac.cmp(&peer_mac) {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Greater => false,
        std::cmp::Ordering::Equal => local_id <= peer_id,
    }
}

// ===== unit tests =====
