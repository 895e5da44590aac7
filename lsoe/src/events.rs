//
// Copyright (c) The LSOE Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::{Duration, Instant};

use bytes::Bytes;
use lsoe_utils::ip::AddressFamily;
use tracing::trace;

use crate::debug::Debug;
use crate::engine::{Engine, VendorDecision};
use crate::error::Error;
use crate::fragment::{self, Reassembler};
use crate::interface::{Interface, TxHandle};
use crate::packet::consts::{ErrorCode, PduType};
use crate::packet::error::DecodeError;
use crate::packet::pdu::{
    Ack, Close, ErrorPdu, Hello, Ipv4Encap, Ipv6Encap, Keepalive, MplsEncap,
    Open, Pdu, Vendor,
};
use crate::packet::transport::Frame;
use crate::session::{
    self, DropReason, PeerKey, SessionDeadline, State,
};
use crate::tasks::messages::input::{IfaceEventMsg, NetRxFrameMsg};

// Longest prefix of an offending PDU echoed back in an ERROR PDU.
const ERROR_DATA_MAX: usize = 64;

// Deadlines serviced by the scheduler loop.
#[derive(Debug)]
enum TimerAction {
    HelloBeacon,
    Session(PeerKey, SessionDeadline),
    PendingReassembly(PeerKey),
}

// ===== frame input =====

pub(crate) fn process_frame(
    engine: &mut Engine,
    msg: NetRxFrameMsg,
    now: Instant,
) -> Result<(), Error> {
    let NetRxFrameMsg { ifindex, src, data } = msg;

    let Some(iface) = engine.interfaces.get(ifindex) else {
        return Ok(());
    };
    // Our own multicast transmissions may be delivered back to us.
    if src == iface.mac {
        return Ok(());
    }
    let key = PeerKey { ifindex, mac: src };

    // Decode the transport header; frames failing its checks are dropped
    // silently and counted. The sender retransmits.
    let frame = match Frame::decode(&data) {
        Ok(frame) => frame,
        Err(error) => {
            let reason = match &error {
                DecodeError::ChecksumMismatch { .. } => {
                    DropReason::ChecksumFailure
                }
                DecodeError::InvalidVersion(..) => DropReason::VersionMismatch,
                _ => DropReason::Malformed,
            };
            count_drop(engine, &key, reason);
            return Ok(());
        }
    };

    // Feed the frame into the peer's reassembly buffer. Peers without a
    // session reassemble in a side table until their HELLO completes.
    let completed = match engine.sessions.get_mut(&key) {
        Some(sess) => {
            // Any frame from the peer counts as liveness.
            sess.last_rx = now;
            match sess.reassembler.push(frame, now) {
                Ok(completed) => completed,
                Err(error) => {
                    sess.counters.bump(error.drop_reason());
                    None
                }
            }
        }
        None => {
            let reasm = engine
                .pending_reasm
                .entry(key)
                .or_insert_with(|| Reassembler::new(now));
            match reasm.push(frame, now) {
                Ok(Some(data)) => {
                    engine.pending_reasm.remove(&key);
                    Some(data)
                }
                Ok(None) => None,
                Err(error) => {
                    engine.counters.bump(error.drop_reason());
                    None
                }
            }
        }
    };

    match completed {
        Some(data) => process_pdu(engine, key, &data, now),
        None => Ok(()),
    }
}

// PDUs are handed to the state machine in the exact order their reassembly
// completes.
fn process_pdu(
    engine: &mut Engine,
    key: PeerKey,
    data: &Bytes,
    now: Instant,
) -> Result<(), Error> {
    let pdu = match Pdu::decode(data) {
        Ok(pdu) => pdu,
        Err(error) => {
            match error.error_code() {
                // Recovered locally: drop and count.
                None => {
                    let reason = match &error {
                        DecodeError::UnknownPduType(..) => {
                            DropReason::UnknownPduType
                        }
                        _ => DropReason::Malformed,
                    };
                    count_drop(engine, &key, reason);
                }
                // Surfaced to the peer as an ERROR PDU. Fatal codes also
                // transition the session to Closing.
                Some(code) => {
                    let reason = match code {
                        ErrorCode::VersionMismatch => {
                            DropReason::VersionMismatch
                        }
                        _ => DropReason::Malformed,
                    };
                    count_drop(engine, &key, reason);
                    if engine.sessions.get(&key).is_some() {
                        send_error(engine, key, code, data, now);
                        if code.is_fatal() {
                            enter_closing(engine, key, now);
                        }
                    }
                }
            }
            return Err(Error::PduDecodeError(key, error));
        }
    };

    trace!(session = %key, ?pdu, "received PDU");
    if let Some(sess) = engine.sessions.get_mut(&key) {
        sess.statistics.rx_pdus += 1;
    }

    match pdu {
        Pdu::Hello(hello) => process_hello(engine, key, hello, now),
        Pdu::Open(open) => process_open(engine, key, open, now),
        Pdu::Keepalive(keepalive) => {
            process_keepalive(engine, key, keepalive, now)
        }
        Pdu::Ack(ack) => process_ack(engine, key, ack, now),
        Pdu::Ipv4Encap(encap) => process_ipv4_encap(engine, key, encap, now),
        Pdu::Ipv6Encap(encap) => process_ipv6_encap(engine, key, encap, now),
        Pdu::MplsEncap(encap) => process_mpls_encap(engine, key, encap, now),
        Pdu::Vendor(vendor) => process_vendor(engine, key, vendor, now),
        Pdu::Error(error) => process_error(engine, key, error, now),
        Pdu::Close(close) => process_close(engine, key, close, now),
    }
}

// ===== PDU handlers =====

// HELLOs are stateless: the first valid one from an unknown peer creates
// the session, and the lower MAC schedules the OPEN.
fn process_hello(
    engine: &mut Engine,
    key: PeerKey,
    hello: Hello,
    now: Instant,
) -> Result<(), Error> {
    let Some(iface) = engine.interfaces.get(key.ifindex) else {
        return Ok(());
    };
    let local_mac = iface.mac;
    let iface_tx = iface.tx_handle();
    let local_id = engine.config.local_id;
    let hold_time = engine.config.hold_time;
    let base = engine.config.retransmit_base;

    let created = engine.sessions.get(&key).is_none();
    let sess = engine.sessions.insert(key, now);
    if created {
        engine.dirty = true;
    }
    if sess.peer_id != Some(hello.local_id) {
        sess.peer_id = Some(hello.local_id);
        engine.dirty = true;
    }

    if sess.state == State::Idle
        && session::is_initiator(local_mac, local_id, key.mac, hello.local_id)
    {
        let seq = sess.next_seq();
        sess.open_seq = Some(seq);
        let pdu = Pdu::Open(Open::new(seq, local_id, hold_time));
        if let Some(iface_tx) = &iface_tx {
            queue_and_send(iface_tx, sess, pdu, now, base);
        }
        sess.state_update(State::OpenSent);
        engine.dirty = true;
    }

    Ok(())
}

fn process_open(
    engine: &mut Engine,
    key: PeerKey,
    open: Open,
    now: Instant,
) -> Result<(), Error> {
    // An OPEN from a peer whose HELLO was never seen is ignored; sessions
    // are only created by HELLO.
    if engine.sessions.get(&key).is_none() {
        return Ok(());
    }
    ack_pdu(engine, key, PduType::Open, open.seq, now);

    let iface_tx =
        engine.interfaces.get(key.ifindex).and_then(Interface::tx_handle);
    let local_id = engine.config.local_id;
    let hold_time = engine.config.hold_time;
    let base = engine.config.retransmit_base;
    let Some(sess) = engine.sessions.get_mut(&key) else {
        return Ok(());
    };

    sess.peer_id = Some(open.local_id);
    sess.peer_hold_time = Some(open.hold_time);

    let mut established = false;
    match sess.state {
        State::Idle => {
            // We are the responder: emit our own OPEN and wait for its
            // acknowledgement before declaring the session up.
            let seq = sess.next_seq();
            sess.open_seq = Some(seq);
            let pdu = Pdu::Open(Open::new(seq, local_id, hold_time));
            if let Some(iface_tx) = &iface_tx {
                queue_and_send(iface_tx, sess, pdu, now, base);
            }
            sess.state_update(State::OpenRcvd);
            engine.dirty = true;
        }
        State::OpenSent => {
            // Both sides have now exchanged OPEN.
            established = true;
        }
        // Duplicate OPEN retransmission: the acknowledgement above is all
        // the peer needs.
        _ => (),
    }

    if established {
        enter_established(engine, key, now);
    }

    Ok(())
}

fn process_keepalive(
    engine: &mut Engine,
    key: PeerKey,
    keepalive: Keepalive,
    now: Instant,
) -> Result<(), Error> {
    // Liveness was refreshed at frame level; just acknowledge.
    ack_pdu(engine, key, PduType::Keepalive, keepalive.seq, now);
    Ok(())
}

fn process_ack(
    engine: &mut Engine,
    key: PeerKey,
    ack: Ack,
    now: Instant,
) -> Result<(), Error> {
    enum FollowUp {
        Established,
        Terminal,
    }

    let Some(sess) = engine.sessions.get_mut(&key) else {
        return Ok(());
    };
    if !sess.rxmt_ack(ack.acked_type, ack.acked_seq) {
        // Stale or unsolicited acknowledgement.
        return Ok(());
    }

    let follow_up = match (sess.state, ack.acked_type) {
        // Our OPEN is known to the peer: the exchange is complete.
        (State::OpenRcvd, PduType::Open)
            if sess.open_seq == Some(ack.acked_seq) =>
        {
            Some(FollowUp::Established)
        }
        // Our CLOSE is acknowledged: the teardown handshake is done.
        (State::Closing, PduType::Close)
            if sess.close_seq == Some(ack.acked_seq) =>
        {
            Some(FollowUp::Terminal)
        }
        _ => None,
    };

    match follow_up {
        Some(FollowUp::Established) => enter_established(engine, key, now),
        Some(FollowUp::Terminal) => session_terminate(engine, &key),
        None => (),
    }

    Ok(())
}

fn process_ipv4_encap(
    engine: &mut Engine,
    key: PeerKey,
    encap: Ipv4Encap,
    now: Instant,
) -> Result<(), Error> {
    ack_pdu(engine, key, PduType::Ipv4Encap, encap.seq, now);
    if let Some(sess) = engine.sessions.get_mut(&key)
        && sess.snapshot.ipv4 != encap.entries
    {
        sess.snapshot.ipv4 = encap.entries;
        engine.dirty = true;
    }
    Ok(())
}

fn process_ipv6_encap(
    engine: &mut Engine,
    key: PeerKey,
    encap: Ipv6Encap,
    now: Instant,
) -> Result<(), Error> {
    ack_pdu(engine, key, PduType::Ipv6Encap, encap.seq, now);
    if let Some(sess) = engine.sessions.get_mut(&key)
        && sess.snapshot.ipv6 != encap.entries
    {
        sess.snapshot.ipv6 = encap.entries;
        engine.dirty = true;
    }
    Ok(())
}

fn process_mpls_encap(
    engine: &mut Engine,
    key: PeerKey,
    encap: MplsEncap,
    now: Instant,
) -> Result<(), Error> {
    ack_pdu(engine, key, PduType::MplsEncap, encap.seq, now);
    if let Some(sess) = engine.sessions.get_mut(&key)
        && sess.snapshot.mpls != encap.entries
    {
        sess.snapshot.mpls = encap.entries;
        engine.dirty = true;
    }
    Ok(())
}

fn process_vendor(
    engine: &mut Engine,
    key: PeerKey,
    vendor: Vendor,
    now: Instant,
) -> Result<(), Error> {
    ack_pdu(engine, key, PduType::Vendor, vendor.seq, now);

    // Unknown enterprise numbers are acknowledged and discarded.
    let decision = match engine.vendor_handlers.get(&vendor.enterprise) {
        Some(handler) => handler.handle(&key, &vendor),
        None => {
            trace!(session = %key, enterprise = %vendor.enterprise,
                "discarding vendor extension with no registered handler");
            return Ok(());
        }
    };

    match decision {
        VendorDecision::Accept => Ok(()),
        VendorDecision::Reject => {
            send_error(engine, key, ErrorCode::VendorRejected, &vendor.body, now);
            Err(Error::VendorRejected(key, vendor.enterprise))
        }
    }
}

fn process_error(
    engine: &mut Engine,
    key: PeerKey,
    error: ErrorPdu,
    now: Instant,
) -> Result<(), Error> {
    ack_pdu(engine, key, PduType::Error, error.seq, now);
    if error.code.is_fatal() {
        enter_closing(engine, key, now);
    }
    Err(Error::PeerError(key, error.code))
}

fn process_close(
    engine: &mut Engine,
    key: PeerKey,
    close: Close,
    now: Instant,
) -> Result<(), Error> {
    ack_pdu(engine, key, PduType::Close, close.seq, now);

    let Some(sess) = engine.sessions.get(&key) else {
        return Ok(());
    };
    match sess.state {
        // Both sides sent CLOSE: terminal once ours is acknowledged.
        State::Closing | State::Closed => (),
        _ => enter_closing(engine, key, now),
    }

    Ok(())
}

// ===== session transitions =====

fn enter_established(engine: &mut Engine, key: PeerKey, now: Instant) {
    let Some(iface) = engine.interfaces.get(key.ifindex) else {
        return;
    };
    let iface_tx = iface.tx_handle();
    let ipv4 = iface.ipv4_entries();
    let ipv6 = iface.ipv6_entries();
    let mpls = iface.mpls_entries();
    let base = engine.config.retransmit_base;
    let Some(sess) = engine.sessions.get_mut(&key) else {
        return;
    };

    sess.state_update(State::Established);
    engine.dirty = true;

    // Advertise the current encapsulations of every address family with
    // non-empty content.
    let Some(iface_tx) = iface_tx else {
        return;
    };
    if !ipv4.is_empty() {
        let seq = sess.next_seq();
        let pdu = Pdu::Ipv4Encap(Ipv4Encap::new(seq, ipv4));
        queue_and_send(&iface_tx, sess, pdu, now, base);
    }
    if !ipv6.is_empty() {
        let seq = sess.next_seq();
        let pdu = Pdu::Ipv6Encap(Ipv6Encap::new(seq, ipv6));
        queue_and_send(&iface_tx, sess, pdu, now, base);
    }
    if !mpls.is_empty() {
        let seq = sess.next_seq();
        let pdu = Pdu::MplsEncap(MplsEncap::new(seq, mpls));
        queue_and_send(&iface_tx, sess, pdu, now, base);
    }
}

fn enter_closing(engine: &mut Engine, key: PeerKey, now: Instant) {
    let iface_tx =
        engine.interfaces.get(key.ifindex).and_then(Interface::tx_handle);
    let base = engine.config.retransmit_base;
    let Some(sess) = engine.sessions.get_mut(&key) else {
        return;
    };
    if matches!(sess.state, State::Closing | State::Closed) {
        return;
    }

    // Only the CLOSE is retransmitted from here on.
    sess.rxmt_queue.clear();
    let seq = sess.next_seq();
    sess.close_seq = Some(seq);
    let pdu = Pdu::Close(Close::new(seq));
    if let Some(iface_tx) = &iface_tx {
        queue_and_send(iface_tx, sess, pdu, now, base);
    }
    sess.state_update(State::Closing);
    engine.dirty = true;
}

fn session_terminate(engine: &mut Engine, key: &PeerKey) {
    if let Some(sess) = engine.sessions.get_mut(key) {
        sess.state_update(State::Closed);
    }
    engine.sessions.remove(key);
    engine.dirty = true;
}

// ===== timers =====

// Services every expired deadline in time order, then returns. The caller
// recomputes the next wake-up from `Engine::next_deadline`.
pub(crate) fn process_timers(engine: &mut Engine, now: Instant) {
    loop {
        let mut next: Option<(Instant, TimerAction)> = None;
        let mut consider = |deadline: Instant, action: TimerAction| {
            if next
                .as_ref()
                .is_none_or(|(earliest, _)| deadline < *earliest)
            {
                next = Some((deadline, action));
            }
        };

        consider(engine.next_hello, TimerAction::HelloBeacon);
        for sess in engine.sessions.iter() {
            if let Some((deadline, reason)) =
                sess.next_deadline(&engine.config)
            {
                consider(deadline, TimerAction::Session(sess.key, reason));
            }
        }
        for (key, reasm) in engine.pending_reasm.iter() {
            if let Some(deadline) =
                reasm.deadline(engine.config.reassembly_ttl)
            {
                consider(deadline, TimerAction::PendingReassembly(*key));
            }
        }

        let Some((deadline, action)) = next else {
            break;
        };
        if deadline > now {
            break;
        }

        match action {
            TimerAction::HelloBeacon => {
                hello_beacon(engine, now);
            }
            TimerAction::Session(key, SessionDeadline::HoldExpiry) => {
                // The peer is presumed unreachable: terminate immediately
                // without sending CLOSE.
                Debug::HoldTimeExpiry(&key).log();
                Error::KeepaliveTimeout(key).log();
                session_terminate(engine, &key);
            }
            TimerAction::Session(key, SessionDeadline::KeepaliveSend) => {
                let iface_tx = engine
                    .interfaces
                    .get(key.ifindex)
                    .and_then(Interface::tx_handle);
                let base = engine.config.retransmit_base;
                let Some(sess) = engine.sessions.get_mut(&key) else {
                    continue;
                };
                // Advance the send clock even if the interface lost its
                // socket; the hold timer cleans up eventually.
                sess.last_tx = now;
                let seq = sess.next_seq();
                let pdu = Pdu::Keepalive(Keepalive::new(seq));
                if let Some(iface_tx) = &iface_tx {
                    queue_and_send(iface_tx, sess, pdu, now, base);
                }
            }
            TimerAction::Session(key, SessionDeadline::Retransmit) => {
                retransmit_due(engine, &key, now);
            }
            TimerAction::Session(key, SessionDeadline::Reassembly) => {
                let Some(sess) = engine.sessions.get_mut(&key) else {
                    continue;
                };
                Debug::ReassemblyExpiry(&key).log();
                sess.reassembler.reset();
                sess.counters.bump(DropReason::ReassemblyTimeout);
            }
            TimerAction::PendingReassembly(key) => {
                Debug::ReassemblyExpiry(&key).log();
                engine.pending_reasm.remove(&key);
                engine.counters.bump(DropReason::ReassemblyTimeout);
            }
        }
    }
}

fn retransmit_due(engine: &mut Engine, key: &PeerKey, now: Instant) {
    let iface_tx =
        engine.interfaces.get(key.ifindex).and_then(Interface::tx_handle);
    let base = engine.config.retransmit_base;
    let cap = engine.config.retransmit_cap;
    let max_attempts = engine.config.max_attempts;
    let Some(sess) = engine.sessions.get_mut(key) else {
        return;
    };

    let Some(entry) = sess
        .rxmt_queue
        .iter_mut()
        .filter(|entry| entry.next_retry <= now)
        .min_by_key(|entry| entry.next_retry)
    else {
        return;
    };

    // Reaching the attempt cap without an acknowledgement tears the
    // session down.
    if entry.attempts >= max_attempts {
        let pdu_type = entry.pdu.pdu_type();
        Error::RetransmitExhausted(*key, pdu_type).log();
        session_terminate(engine, key);
        return;
    }

    entry.attempts += 1;
    let exp = u32::from(entry.attempts - 1).min(16);
    let backoff = std::cmp::min(base * (1u32 << exp), cap);
    entry.next_retry = now + backoff;
    let pdu = entry.pdu.clone();
    Debug::Retransmit(key, pdu.pdu_type(), entry.attempts).log();

    if let Some(iface_tx) = &iface_tx {
        session_output(iface_tx, sess, &pdu, now);
    }
}

fn hello_beacon(engine: &mut Engine, now: Instant) {
    let hello = Pdu::Hello(Hello::new(engine.config.local_id));
    let buf = hello.encode();
    let dst = engine.config.hello_dst;

    for iface in engine.interfaces.iter() {
        let Some(iface_tx) = iface.tx_handle() else {
            continue;
        };
        Debug::HelloTx(&iface.name).log();
        if let Ok(frames) = fragment::fragment(buf.clone(), iface_tx.mtu) {
            for frame in frames {
                iface_tx.send_frame(dst, frame.encode());
            }
        }
    }

    engine.next_hello = now + engine.config.hello_interval;
}

// ===== interface monitor input =====

pub(crate) fn process_iface_event(
    engine: &mut Engine,
    msg: IfaceEventMsg,
    now: Instant,
) {
    match msg {
        IfaceEventMsg::Update(msg) => {
            Debug::InterfaceUpdate(&msg.name).log();
            let ifindex = msg.ifindex;
            let operative = msg.operative;
            let name = msg.name.clone();
            engine.interfaces.update(msg);
            engine.refresh_interface_io(ifindex, now);
            if !operative {
                kill_sessions(engine, ifindex, &name);
            }
            engine.dirty = true;
        }
        IfaceEventMsg::Delete(ifindex) => {
            if let Some(iface) = engine.interfaces.remove(ifindex) {
                Debug::InterfaceDelete(&iface.name).log();
                kill_sessions(engine, ifindex, &iface.name);
                engine.dirty = true;
            }
        }
        IfaceEventMsg::AddrAdd(ifindex, addr) => {
            let Some(iface) = engine.interfaces.get_mut(ifindex) else {
                return;
            };
            if !iface.addresses.insert(addr) {
                return;
            }
            Debug::AddressAdd(&iface.name, &addr).log();
            engine.refresh_interface_io(ifindex, now);
            readvertise(engine, ifindex, AddressFamily::of(&addr.ip()), now);
            engine.dirty = true;
        }
        IfaceEventMsg::AddrDel(ifindex, addr) => {
            let Some(iface) = engine.interfaces.get_mut(ifindex) else {
                return;
            };
            if !iface.addresses.remove(&addr) {
                return;
            }
            Debug::AddressDelete(&iface.name, &addr).log();
            engine.refresh_interface_io(ifindex, now);
            readvertise(engine, ifindex, AddressFamily::of(&addr.ip()), now);
            engine.dirty = true;
        }
    }
}

// Re-sends the encapsulation PDU of the changed address family on every
// established session of the interface.
fn readvertise(
    engine: &mut Engine,
    ifindex: u32,
    family: AddressFamily,
    now: Instant,
) {
    let Some(iface) = engine.interfaces.get(ifindex) else {
        return;
    };
    let Some(iface_tx) = iface.tx_handle() else {
        return;
    };
    let base = engine.config.retransmit_base;
    let keys: Vec<_> = engine
        .sessions
        .keys()
        .filter(|key| key.ifindex == ifindex)
        .collect();

    for key in keys {
        let Some(sess) = engine.sessions.get_mut(&key) else {
            continue;
        };
        if sess.state != State::Established {
            continue;
        }
        let seq = sess.next_seq();
        let pdu = match family {
            AddressFamily::Ipv4 => {
                Pdu::Ipv4Encap(Ipv4Encap::new(seq, iface.ipv4_entries()))
            }
            AddressFamily::Ipv6 => {
                Pdu::Ipv6Encap(Ipv6Encap::new(seq, iface.ipv6_entries()))
            }
        };
        queue_and_send(&iface_tx, sess, pdu, now, base);
    }
}

fn kill_sessions(engine: &mut Engine, ifindex: u32, ifname: &str) {
    let keys: Vec<_> = engine
        .sessions
        .keys()
        .filter(|key| key.ifindex == ifindex)
        .collect();
    if keys.is_empty() {
        return;
    }

    Error::LinkDown(ifname.to_owned()).log();
    for key in keys {
        session_terminate(engine, &key);
    }
}

// ===== shutdown =====

// Best-effort CLOSE on every established session; no retransmit wait.
pub(crate) fn process_shutdown(engine: &mut Engine, now: Instant) {
    let keys: Vec<_> = engine.sessions.keys().collect();
    for key in keys {
        let iface_tx =
            engine.interfaces.get(key.ifindex).and_then(Interface::tx_handle);
        let Some(sess) = engine.sessions.get_mut(&key) else {
            continue;
        };
        if sess.state == State::Established
            && let Some(iface_tx) = iface_tx
        {
            let seq = sess.next_seq();
            sess.close_seq = Some(seq);
            let pdu = Pdu::Close(Close::new(seq));
            session_output(&iface_tx, sess, &pdu, now);
            sess.state_update(State::Closing);
        }
    }
}

// ===== helper functions =====

fn count_drop(engine: &mut Engine, key: &PeerKey, reason: DropReason) {
    match engine.sessions.get_mut(key) {
        Some(sess) => sess.counters.bump(reason),
        None => engine.counters.bump(reason),
    }
}

fn ack_pdu(
    engine: &mut Engine,
    key: PeerKey,
    acked_type: PduType,
    acked_seq: u32,
    now: Instant,
) {
    let Some(iface_tx) =
        engine.interfaces.get(key.ifindex).and_then(Interface::tx_handle)
    else {
        return;
    };
    let Some(sess) = engine.sessions.get_mut(&key) else {
        return;
    };
    let pdu = Pdu::Ack(Ack::new(acked_type, acked_seq));
    session_output(&iface_tx, sess, &pdu, now);
}

fn send_error(
    engine: &mut Engine,
    key: PeerKey,
    code: ErrorCode,
    offending: &[u8],
    now: Instant,
) {
    let Some(iface_tx) =
        engine.interfaces.get(key.ifindex).and_then(Interface::tx_handle)
    else {
        return;
    };
    let base = engine.config.retransmit_base;
    let Some(sess) = engine.sessions.get_mut(&key) else {
        return;
    };
    let seq = sess.next_seq();
    let data = Bytes::copy_from_slice(
        &offending[..offending.len().min(ERROR_DATA_MAX)],
    );
    let pdu = Pdu::Error(ErrorPdu::new(seq, code, data));
    queue_and_send(&iface_tx, sess, pdu, now, base);
}

fn output_pdu(
    iface_tx: &TxHandle,
    key: &PeerKey,
    pdu: &Pdu,
) -> Result<(), Error> {
    let buf = pdu.encode();
    let frames = fragment::fragment(buf, iface_tx.mtu)
        .map_err(|error| Error::FragmentError(*key, error))?;
    for frame in frames {
        iface_tx.send_frame(key.mac, frame.encode());
    }
    Ok(())
}

fn session_output(
    iface_tx: &TxHandle,
    sess: &mut crate::session::Session,
    pdu: &Pdu,
    now: Instant,
) {
    trace!(session = %sess.key, pdu_type = %pdu.pdu_type(), "sending PDU");
    sess.last_tx = now;
    sess.statistics.tx_pdus += 1;
    if let Err(error) = output_pdu(iface_tx, &sess.key, pdu) {
        error.log();
    }
}

fn queue_and_send(
    iface_tx: &TxHandle,
    sess: &mut crate::session::Session,
    pdu: Pdu,
    now: Instant,
    base: Duration,
) {
    sess.rxmt_enqueue(pdu.clone(), now, base);
    session_output(iface_tx, sess, &pdu, now);
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use bytes::{BufMut, BytesMut};
    use lsoe_utils::UnboundedReceiver;
    use lsoe_utils::mac_addr::MacAddr;
    use tokio::sync::mpsc;

    use super::*;
    use crate::Config;
    use crate::interface::{Interface, InterfaceIo};
    use crate::packet::LocalId;
    use crate::packet::pdu::{Ipv4Entry, Ipv6Entry};
    use crate::tasks::messages::output::NetTxFrameMsg;

    const IFINDEX: u32 = 1;
    const LOCAL_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
    const HIGH_LOCAL_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x03];
    const PEER_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];
    const MTU: u32 = 1500;

    fn peer_key() -> PeerKey {
        PeerKey {
            ifindex: IFINDEX,
            mac: MacAddr::new(PEER_MAC),
        }
    }

    fn peer_id() -> LocalId {
        LocalId::new([0xbb; 10])
    }

    // Engine with one interface whose Tx queue is captured by the returned
    // receiver instead of a socket.
    fn test_engine(
        local_mac: [u8; 6],
    ) -> (Engine, UnboundedReceiver<NetTxFrameMsg>) {
        let config = Config {
            local_id: LocalId::new([0xaa; 10]),
            ..Default::default()
        };
        let (mut engine, _event_rx) = Engine::new(config, BTreeMap::new());
        // Keep the beacon quiet unless a test asks for it.
        engine.next_hello = Instant::now() + Duration::from_secs(3600);

        let (net_tx, net_rx) = mpsc::unbounded_channel();
        let mut addresses = BTreeSet::new();
        addresses.insert("192.0.2.1/24".parse().unwrap());
        engine.interfaces.insert(Interface {
            ifindex: IFINDEX,
            name: "eth0".to_owned(),
            mac: MacAddr::new(local_mac),
            mtu: MTU,
            loopback: false,
            operative: true,
            addresses,
            mpls_labels: Vec::new(),
            io: Some(InterfaceIo {
                mtu: MTU,
                net_tx,
                _rx_task: None,
                _tx_task: None,
            }),
        });
        (engine, net_rx)
    }

    // Fragments and delivers a PDU as if received from the peer.
    fn deliver(engine: &mut Engine, pdu: Pdu, now: Instant) {
        for frame in fragment::fragment(pdu.encode(), MTU).unwrap() {
            let msg = NetRxFrameMsg {
                ifindex: IFINDEX,
                src: MacAddr::new(PEER_MAC),
                data: frame.encode(),
            };
            let _ = process_frame(engine, msg, now);
        }
    }

    // Drains and decodes everything the engine transmitted.
    fn sent_pdus(
        net_rx: &mut UnboundedReceiver<NetTxFrameMsg>,
        now: Instant,
    ) -> Vec<Pdu> {
        let mut reasm = Reassembler::new(now);
        let mut pdus = Vec::new();
        while let Ok(msg) = net_rx.try_recv() {
            let frame = Frame::decode(&msg.data).unwrap();
            if let Some(data) = reasm.push(frame, now).unwrap() {
                pdus.push(Pdu::decode(&data).unwrap());
            }
        }
        pdus
    }

    // Drives the initiator handshake to Established with all our PDUs
    // acknowledged. Returns the drained transmissions.
    fn establish(
        engine: &mut Engine,
        net_rx: &mut UnboundedReceiver<NetTxFrameMsg>,
        now: Instant,
    ) -> Vec<Pdu> {
        deliver(engine, Pdu::Hello(Hello::new(peer_id())), now);
        let sent = sent_pdus(net_rx, now);
        let open_seq = match &sent[..] {
            [Pdu::Open(open)] => open.seq,
            _ => panic!("expected OPEN, got {sent:?}"),
        };
        deliver(engine, Pdu::Open(Open::new(7, peer_id(), 40)), now);
        deliver(engine, Pdu::Ack(Ack::new(PduType::Open, open_seq)), now);
        let sent = sent_pdus(net_rx, now);
        for pdu in &sent {
            if let Some(seq) = pdu.seq() {
                deliver(
                    engine,
                    Pdu::Ack(Ack::new(pdu.pdu_type(), seq)),
                    now,
                );
            }
        }
        assert_eq!(
            engine.sessions.get(&peer_key()).unwrap().state,
            State::Established
        );
        assert!(
            engine
                .sessions
                .get(&peer_key())
                .unwrap()
                .rxmt_queue
                .is_empty()
        );
        sent
    }

    #[test]
    fn initiator_bring_up() {
        let now = Instant::now();
        let (mut engine, mut net_rx) = test_engine(LOCAL_MAC);

        // The first HELLO creates the session, and the lower MAC sends
        // the OPEN.
        deliver(&mut engine, Pdu::Hello(Hello::new(peer_id())), now);
        let sess = engine.sessions.get(&peer_key()).unwrap();
        assert_eq!(sess.state, State::OpenSent);
        assert_eq!(sess.peer_id, Some(peer_id()));
        let sent = sent_pdus(&mut net_rx, now);
        let open_seq = match &sent[..] {
            [Pdu::Open(open)] => {
                assert_eq!(open.local_id, engine.config.local_id);
                assert_eq!(open.hold_time, 40);
                open.seq
            }
            _ => panic!("expected OPEN, got {sent:?}"),
        };

        // The peer's OPEN completes the exchange: acknowledged, session
        // established, initial encapsulations advertised.
        deliver(&mut engine, Pdu::Open(Open::new(7, peer_id(), 40)), now);
        let sess = engine.sessions.get(&peer_key()).unwrap();
        assert_eq!(sess.state, State::Established);
        assert_eq!(sess.peer_hold_time, Some(40));
        let sent = sent_pdus(&mut net_rx, now);
        assert!(matches!(
            sent[0],
            Pdu::Ack(Ack { acked_type: PduType::Open, acked_seq: 7 })
        ));
        let encap_seq = match &sent[1] {
            Pdu::Ipv4Encap(encap) => {
                assert_eq!(
                    encap.entries,
                    vec![Ipv4Entry::new("192.0.2.1".parse().unwrap(), 24)]
                );
                encap.seq
            }
            pdu => panic!("expected IPv4 encapsulation, got {pdu:?}"),
        };
        assert_eq!(sent.len(), 2);

        // Acknowledgements drain the retransmit queue.
        deliver(
            &mut engine,
            Pdu::Ack(Ack::new(PduType::Open, open_seq)),
            now,
        );
        deliver(
            &mut engine,
            Pdu::Ack(Ack::new(PduType::Ipv4Encap, encap_seq)),
            now,
        );
        let sess = engine.sessions.get(&peer_key()).unwrap();
        assert!(sess.rxmt_queue.is_empty());
        assert_eq!(sess.state, State::Established);
    }

    #[test]
    fn responder_bring_up() {
        let now = Instant::now();
        let (mut engine, mut net_rx) = test_engine(HIGH_LOCAL_MAC);

        // Higher MAC: wait for the peer's OPEN.
        deliver(&mut engine, Pdu::Hello(Hello::new(peer_id())), now);
        assert_eq!(
            engine.sessions.get(&peer_key()).unwrap().state,
            State::Idle
        );
        assert!(sent_pdus(&mut net_rx, now).is_empty());

        // The peer's OPEN is acknowledged and answered with our own.
        deliver(&mut engine, Pdu::Open(Open::new(1, peer_id(), 30)), now);
        let sess = engine.sessions.get(&peer_key()).unwrap();
        assert_eq!(sess.state, State::OpenRcvd);
        let sent = sent_pdus(&mut net_rx, now);
        assert!(matches!(
            sent[0],
            Pdu::Ack(Ack { acked_type: PduType::Open, acked_seq: 1 })
        ));
        let open_seq = match &sent[1] {
            Pdu::Open(open) => open.seq,
            pdu => panic!("expected OPEN, got {pdu:?}"),
        };

        // Established only once our OPEN is known to the peer.
        deliver(
            &mut engine,
            Pdu::Ack(Ack::new(PduType::Open, open_seq)),
            now,
        );
        let sess = engine.sessions.get(&peer_key()).unwrap();
        assert_eq!(sess.state, State::Established);
        let sent = sent_pdus(&mut net_rx, now);
        assert!(
            sent.iter().any(|pdu| matches!(pdu, Pdu::Ipv4Encap(_))),
            "expected initial encapsulation, got {sent:?}"
        );
    }

    #[test]
    fn stray_pdus_do_not_create_sessions() {
        let now = Instant::now();
        let (mut engine, mut net_rx) = test_engine(LOCAL_MAC);

        deliver(&mut engine, Pdu::Keepalive(Keepalive::new(1)), now);
        deliver(&mut engine, Pdu::Open(Open::new(1, peer_id(), 30)), now);
        assert!(engine.sessions.is_empty());
        assert!(sent_pdus(&mut net_rx, now).is_empty());
    }

    #[test]
    fn keepalive_send_and_hold_expiry() {
        let now = Instant::now();
        let (mut engine, mut net_rx) = test_engine(LOCAL_MAC);
        establish(&mut engine, &mut net_rx, now);

        // Sending silence triggers a keepalive after keepalive-interval.
        let sess = engine.sessions.get(&peer_key()).unwrap();
        let (deadline, reason) =
            sess.next_deadline(&engine.config).unwrap();
        assert_eq!(reason, SessionDeadline::KeepaliveSend);
        assert!(deadline <= now + Duration::from_secs(10));

        let t1 = now + Duration::from_secs(10);
        process_timers(&mut engine, t1);
        let sent = sent_pdus(&mut net_rx, t1);
        let keepalive_seq = match &sent[..] {
            [Pdu::Keepalive(keepalive)] => keepalive.seq,
            _ => panic!("expected KEEPALIVE, got {sent:?}"),
        };
        deliver(
            &mut engine,
            Pdu::Ack(Ack::new(PduType::Keepalive, keepalive_seq)),
            t1,
        );

        // Under total inbound silence the session dies exactly at the
        // hold time after the last received frame.
        let last_rx = engine.sessions.get(&peer_key()).unwrap().last_rx;
        let expiry = last_rx + Duration::from_secs(40);
        process_timers(&mut engine, expiry - Duration::from_millis(1));
        assert!(engine.sessions.get(&peer_key()).is_some());
        process_timers(&mut engine, expiry);
        assert!(engine.sessions.get(&peer_key()).is_none());

        // No CLOSE on the wire: the peer is presumed unreachable.
        let sent = sent_pdus(&mut net_rx, expiry);
        assert!(
            !sent.iter().any(|pdu| matches!(pdu, Pdu::Close(_))),
            "unexpected CLOSE, got {sent:?}"
        );
    }

    #[test]
    fn retransmit_then_ack() {
        let now = Instant::now();
        let (mut engine, mut net_rx) = test_engine(LOCAL_MAC);

        deliver(&mut engine, Pdu::Hello(Hello::new(peer_id())), now);
        let sent = sent_pdus(&mut net_rx, now);
        let open_seq = match &sent[..] {
            [Pdu::Open(open)] => open.seq,
            _ => panic!("expected OPEN, got {sent:?}"),
        };
        deliver(&mut engine, Pdu::Open(Open::new(7, peer_id(), 40)), now);
        deliver(&mut engine, Pdu::Ack(Ack::new(PduType::Open, open_seq)), now);
        let sent = sent_pdus(&mut net_rx, now);
        let encap_seq = sent
            .iter()
            .find_map(|pdu| match pdu {
                Pdu::Ipv4Encap(encap) => Some(encap.seq),
                _ => None,
            })
            .unwrap();

        // The unacknowledged encapsulation is retransmitted unchanged
        // after retransmit-base.
        let t1 = now + Duration::from_secs(1);
        process_timers(&mut engine, t1);
        let sent = sent_pdus(&mut net_rx, t1);
        match &sent[..] {
            [Pdu::Ipv4Encap(encap)] => assert_eq!(encap.seq, encap_seq),
            _ => panic!("expected retransmitted encapsulation, got {sent:?}"),
        }

        // The late acknowledgement drains the queue; no state change.
        deliver(
            &mut engine,
            Pdu::Ack(Ack::new(PduType::Ipv4Encap, encap_seq)),
            t1,
        );
        let sess = engine.sessions.get(&peer_key()).unwrap();
        assert!(sess.rxmt_queue.is_empty());
        assert_eq!(sess.state, State::Established);
    }

    #[test]
    fn retransmit_exhaustion_tears_down() {
        let now = Instant::now();
        let (mut engine, mut net_rx) = test_engine(LOCAL_MAC);

        // OPEN is sent but never acknowledged.
        deliver(&mut engine, Pdu::Hello(Hello::new(peer_id())), now);
        assert_eq!(
            engine.sessions.get(&peer_key()).unwrap().state,
            State::OpenSent
        );

        // Walk the scheduler until the retry budget is exhausted; with
        // the defaults this happens before the hold time.
        for _ in 0..16 {
            if engine.sessions.is_empty() {
                break;
            }
            let deadline = engine.next_deadline();
            process_timers(&mut engine, deadline);
        }
        assert!(engine.sessions.is_empty());
        assert!(
            sent_pdus(&mut net_rx, now)
                .iter()
                .all(|pdu| matches!(pdu, Pdu::Open(_)))
        );
    }

    #[test]
    fn fragmented_encap_replaces_snapshot() {
        let now = Instant::now();
        let (mut engine, mut net_rx) = test_engine(LOCAL_MAC);
        establish(&mut engine, &mut net_rx, now);

        // 600 entries make the PDU span multiple frames at this MTU.
        let entries: Vec<_> = (0..600u32)
            .map(|i| Ipv4Entry::new(std::net::Ipv4Addr::from(i), 32))
            .collect();
        let pdu = Pdu::Ipv4Encap(Ipv4Encap::new(99, entries.clone()));
        assert!(fragment::fragment(pdu.encode(), MTU).unwrap().len() > 1);

        deliver(&mut engine, pdu, now);
        let sess = engine.sessions.get(&peer_key()).unwrap();
        assert_eq!(sess.snapshot.ipv4, entries);
        let sent = sent_pdus(&mut net_rx, now);
        assert!(matches!(
            sent[..],
            [Pdu::Ack(Ack { acked_type: PduType::Ipv4Encap, acked_seq: 99 })]
        ));
    }

    #[test]
    fn malformed_pdu_answered_with_error() {
        let now = Instant::now();
        let (mut engine, mut net_rx) = test_engine(LOCAL_MAC);
        establish(&mut engine, &mut net_rx, now);

        // IPv4 encapsulation whose entry count overruns the buffer.
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        buf.put_u8(PduType::Ipv4Encap as u8);
        buf.put_u16(10);
        buf.put_u32(123);
        buf.put_u16(500);
        let data = buf.freeze();
        let frame = Frame {
            last: true,
            seqno: 0,
            pdu_len: 10,
            payload: data,
        };
        let msg = NetRxFrameMsg {
            ifindex: IFINDEX,
            src: MacAddr::new(PEER_MAC),
            data: frame.encode(),
        };
        assert!(process_frame(&mut engine, msg, now).is_err());

        // ERROR reply, state unchanged, drop counted.
        let sent = sent_pdus(&mut net_rx, now);
        match &sent[..] {
            [Pdu::Error(error)] => {
                assert_eq!(error.code, ErrorCode::MalformedPdu)
            }
            _ => panic!("expected ERROR, got {sent:?}"),
        }
        let sess = engine.sessions.get(&peer_key()).unwrap();
        assert_eq!(sess.state, State::Established);
        assert_eq!(sess.counters.malformed, 1);
    }

    #[test]
    fn version_mismatch_is_fatal() {
        let now = Instant::now();
        let (mut engine, mut net_rx) = test_engine(LOCAL_MAC);
        establish(&mut engine, &mut net_rx, now);

        // PDU with an unsupported protocol version.
        let mut buf = BytesMut::new();
        buf.put_u8(9);
        buf.put_u8(PduType::Keepalive as u8);
        buf.put_u16(8);
        buf.put_u32(1);
        let data = buf.freeze();
        let frame = Frame {
            last: true,
            seqno: 0,
            pdu_len: 8,
            payload: data,
        };
        let msg = NetRxFrameMsg {
            ifindex: IFINDEX,
            src: MacAddr::new(PEER_MAC),
            data: frame.encode(),
        };
        assert!(process_frame(&mut engine, msg, now).is_err());

        let sent = sent_pdus(&mut net_rx, now);
        assert!(matches!(
            sent[0],
            Pdu::Error(ErrorPdu { code: ErrorCode::VersionMismatch, .. })
        ));
        assert!(matches!(sent[1], Pdu::Close(_)));
        assert_eq!(
            engine.sessions.get(&peer_key()).unwrap().state,
            State::Closing
        );
    }

    #[test]
    fn close_handshake() {
        let now = Instant::now();
        let (mut engine, mut net_rx) = test_engine(LOCAL_MAC);
        establish(&mut engine, &mut net_rx, now);

        // The peer's CLOSE is acknowledged and answered with our own.
        deliver(&mut engine, Pdu::Close(Close::new(42)), now);
        assert_eq!(
            engine.sessions.get(&peer_key()).unwrap().state,
            State::Closing
        );
        let sent = sent_pdus(&mut net_rx, now);
        assert!(matches!(
            sent[0],
            Pdu::Ack(Ack { acked_type: PduType::Close, acked_seq: 42 })
        ));
        let close_seq = match &sent[1] {
            Pdu::Close(close) => close.seq,
            pdu => panic!("expected CLOSE, got {pdu:?}"),
        };

        // Terminal once our CLOSE is acknowledged.
        deliver(
            &mut engine,
            Pdu::Ack(Ack::new(PduType::Close, close_seq)),
            now,
        );
        assert!(engine.sessions.is_empty());
    }

    #[test]
    fn address_change_readvertises() {
        let now = Instant::now();
        let (mut engine, mut net_rx) = test_engine(LOCAL_MAC);
        establish(&mut engine, &mut net_rx, now);

        let addr: ipnetwork::IpNetwork = "2001:db8::1/64".parse().unwrap();
        process_iface_event(
            &mut engine,
            IfaceEventMsg::AddrAdd(IFINDEX, addr),
            now,
        );

        let sent = sent_pdus(&mut net_rx, now);
        match &sent[..] {
            [Pdu::Ipv6Encap(encap)] => {
                assert_eq!(
                    encap.entries,
                    vec![Ipv6Entry::new("2001:db8::1".parse().unwrap(), 64)]
                );
            }
            _ => panic!("expected IPv6 encapsulation, got {sent:?}"),
        }
    }

    #[test]
    fn vendor_unknown_enterprise_discarded() {
        let now = Instant::now();
        let (mut engine, mut net_rx) = test_engine(LOCAL_MAC);
        establish(&mut engine, &mut net_rx, now);

        let pdu = Pdu::Vendor(Vendor::new(
            55,
            4242,
            Bytes::from_static(b"opaque"),
        ));
        deliver(&mut engine, pdu, now);

        // Acknowledged and discarded; no ERROR, no state change.
        let sent = sent_pdus(&mut net_rx, now);
        assert!(matches!(
            sent[..],
            [Pdu::Ack(Ack { acked_type: PduType::Vendor, acked_seq: 55 })]
        ));
        assert_eq!(
            engine.sessions.get(&peer_key()).unwrap().state,
            State::Established
        );
    }

    #[test]
    fn interface_removal_kills_sessions() {
        let now = Instant::now();
        let (mut engine, mut net_rx) = test_engine(LOCAL_MAC);
        establish(&mut engine, &mut net_rx, now);

        process_iface_event(&mut engine, IfaceEventMsg::Delete(IFINDEX), now);
        assert!(engine.sessions.is_empty());
        assert!(engine.interfaces.get(IFINDEX).is_none());
    }

    #[test]
    fn hello_beacon_multicasts() {
        let now = Instant::now();
        let (mut engine, mut net_rx) = test_engine(LOCAL_MAC);
        engine.next_hello = now;

        process_timers(&mut engine, now);
        let msg = net_rx.try_recv().unwrap();
        assert_eq!(msg.dst, engine.config.hello_dst);
        let frame = Frame::decode(&msg.data).unwrap();
        let pdu = Pdu::decode(&frame.payload).unwrap();
        assert_eq!(
            pdu,
            Pdu::Hello(Hello::new(engine.config.local_id))
        );
        assert_eq!(
            engine.next_hello,
            now + engine.config.hello_interval
        );
    }

    #[test]
    fn shutdown_sends_best_effort_close() {
        let now = Instant::now();
        let (mut engine, mut net_rx) = test_engine(LOCAL_MAC);
        establish(&mut engine, &mut net_rx, now);

        process_shutdown(&mut engine, now);
        let sent = sent_pdus(&mut net_rx, now);
        assert!(matches!(sent[..], [Pdu::Close(_)]));
        assert_eq!(
            engine.sessions.get(&peer_key()).unwrap().state,
            State::Closing
        );
    }
}
