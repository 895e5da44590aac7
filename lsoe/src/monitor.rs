//
// Copyright (c) The LSOE Project Contributors
//
// SPDX-License-Identifier: MIT
//

#![allow(clippy::single_match)]

use std::collections::{BTreeSet, HashMap};
use std::net::{Ipv4Addr, Ipv6Addr};

use futures::TryStreamExt;
use futures::channel::mpsc::UnboundedReceiver;
use futures::stream::StreamExt;
use ipnetwork::IpNetwork;
use lsoe_utils::Sender;
use lsoe_utils::mac_addr::MacAddr;
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::constants::{
    AF_INET, AF_INET6, ARPHRD_LOOPBACK, IFF_RUNNING, RTNLGRP_IPV4_IFADDR,
    RTNLGRP_IPV4_ROUTE, RTNLGRP_IPV6_IFADDR, RTNLGRP_IPV6_ROUTE, RTNLGRP_LINK,
};
use netlink_packet_route::rtnl::RtnlMessage;
use netlink_packet_route::{AddressMessage, LinkMessage};
use netlink_sys::{AsyncSocket, SocketAddr};
use rtnetlink::{Handle, new_connection};
use tracing::{trace, warn};

use crate::tasks::messages::input::{EngineMsg, IfaceEventMsg, IfaceUpdateMsg};

pub type NetlinkMonitor =
    UnboundedReceiver<(NetlinkMessage<RtnlMessage>, SocketAddr)>;

// Kernel-facing interface monitor. Owns the netlink snapshot and publishes
// normalized interface and address events to the engine, which never talks
// to the kernel itself.
struct Monitor {
    handle: Handle,
    ifaces: HashMap<u32, IfaceSnapshot>,
    event_tx: Sender<EngineMsg>,
}

#[derive(Debug)]
struct IfaceSnapshot {
    name: String,
    mac: MacAddr,
    mtu: u32,
    loopback: bool,
    operative: bool,
    addrs: BTreeSet<IpNetwork>,
}

// ===== impl Monitor =====

impl Monitor {
    async fn emit(&self, msg: IfaceEventMsg) {
        let _ = self.event_tx.send(EngineMsg::IfaceEvent(msg)).await;
    }

    async fn process_msg(&mut self, msg: NetlinkMessage<RtnlMessage>) {
        if let NetlinkPayload::InnerMessage(msg) = msg.payload {
            match msg {
                RtnlMessage::NewLink(msg) => {
                    self.process_newlink_msg(msg).await;
                }
                RtnlMessage::DelLink(msg) => {
                    self.process_dellink_msg(msg).await;
                }
                RtnlMessage::NewAddress(msg) => {
                    self.process_newaddr_msg(msg).await;
                }
                RtnlMessage::DelAddress(msg) => {
                    self.process_deladdr_msg(msg).await;
                }
                // On some kernels the IPv6 address-added event is not
                // delivered reliably. Re-enumerate all addresses on every
                // routing-table change and synthesize the missing events.
                RtnlMessage::NewRoute(_) | RtnlMessage::DelRoute(_) => {
                    self.resync_addresses().await;
                }
                _ => (),
            }
        }
    }

    async fn process_newlink_msg(&mut self, msg: LinkMessage) {
        use netlink_packet_route::link::nlas::Nla;

        trace!(?msg, "received RTM_NEWLINK message");

        // Fetch interface attributes.
        let ifindex = msg.header.index;
        let mut ifname = None;
        let mut mtu = None;
        let mut mac = [0u8; 6];
        let loopback = msg.header.link_layer_type == ARPHRD_LOOPBACK;
        let operative = msg.header.flags & IFF_RUNNING != 0;
        for nla in msg.nlas.into_iter() {
            match nla {
                Nla::IfName(nla_ifname) => ifname = Some(nla_ifname),
                Nla::Mtu(nla_mtu) => mtu = Some(nla_mtu),
                Nla::Address(addr) => {
                    mac = addr.try_into().unwrap_or([0u8; 6]);
                }
                _ => (),
            }
        }
        let (Some(ifname), Some(mtu)) = (ifname, mtu) else {
            return;
        };
        let mac = MacAddr::from(mac);

        // Suppress events that change nothing.
        if let Some(snapshot) = self.ifaces.get(&ifindex)
            && snapshot.name == ifname
            && snapshot.mac == mac
            && snapshot.mtu == mtu
            && snapshot.loopback == loopback
            && snapshot.operative == operative
        {
            return;
        }

        // Add or update interface.
        let snapshot =
            self.ifaces
                .entry(ifindex)
                .or_insert_with(|| IfaceSnapshot {
                    name: ifname.clone(),
                    mac,
                    mtu,
                    loopback,
                    operative,
                    addrs: Default::default(),
                });
        snapshot.name = ifname.clone();
        snapshot.mac = mac;
        snapshot.mtu = mtu;
        snapshot.loopback = loopback;
        snapshot.operative = operative;

        self.emit(IfaceEventMsg::Update(IfaceUpdateMsg {
            ifindex,
            name: ifname,
            mac,
            mtu,
            loopback,
            operative,
        }))
        .await;
    }

    async fn process_dellink_msg(&mut self, msg: LinkMessage) {
        trace!(?msg, "received RTM_DELLINK message");

        let ifindex = msg.header.index;
        if self.ifaces.remove(&ifindex).is_some() {
            self.emit(IfaceEventMsg::Delete(ifindex)).await;
        }
    }

    async fn process_newaddr_msg(&mut self, msg: AddressMessage) {
        trace!(?msg, "received RTM_NEWADDR message");

        let Some((ifindex, addr)) = parse_addr_msg(msg) else {
            return;
        };
        if let Some(snapshot) = self.ifaces.get_mut(&ifindex)
            && snapshot.addrs.insert(addr)
        {
            self.emit(IfaceEventMsg::AddrAdd(ifindex, addr)).await;
        }
    }

    async fn process_deladdr_msg(&mut self, msg: AddressMessage) {
        trace!(?msg, "received RTM_DELADDR message");

        let Some((ifindex, addr)) = parse_addr_msg(msg) else {
            return;
        };
        if let Some(snapshot) = self.ifaces.get_mut(&ifindex)
            && snapshot.addrs.remove(&addr)
        {
            self.emit(IfaceEventMsg::AddrDel(ifindex, addr)).await;
        }
    }

    // Re-enumerates all interface addresses, diffs against the snapshot and
    // synthesizes the events the kernel did not deliver.
    async fn resync_addresses(&mut self) {
        let mut current: HashMap<u32, BTreeSet<IpNetwork>> = HashMap::new();
        let mut request = self.handle.address().get().execute();
        loop {
            match request.try_next().await {
                Ok(Some(msg)) => {
                    if let Some((ifindex, addr)) = parse_addr_msg(msg) {
                        current.entry(ifindex).or_default().insert(addr);
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    warn!(%error, "failed to re-enumerate interface addresses");
                    return;
                }
            }
        }

        let mut events = Vec::new();
        for (ifindex, snapshot) in self.ifaces.iter_mut() {
            let addrs = current.remove(ifindex).unwrap_or_default();
            for addr in addrs.difference(&snapshot.addrs) {
                events.push(IfaceEventMsg::AddrAdd(*ifindex, *addr));
            }
            for addr in snapshot.addrs.difference(&addrs) {
                events.push(IfaceEventMsg::AddrDel(*ifindex, *addr));
            }
            snapshot.addrs = addrs;
        }
        for event in events {
            self.emit(event).await;
        }
    }

    // Fetches interface information from the kernel at startup.
    async fn dump_links(&mut self) {
        let mut request = self.handle.link().get().execute();
        loop {
            match request.try_next().await {
                Ok(Some(msg)) => self.process_newlink_msg(msg).await,
                Ok(None) => break,
                Err(error) => {
                    warn!(%error, "failed to fetch interface information");
                    return;
                }
            }
        }
    }
}

// ===== helper functions =====

fn parse_addr_msg(msg: AddressMessage) -> Option<(u32, IpNetwork)> {
    use netlink_packet_route::address::nlas::Nla;

    let ifindex = msg.header.index;
    let mut addr = None;
    for nla in msg.nlas.into_iter() {
        match nla {
            Nla::Address(nla_addr) => addr = Some(nla_addr),
            _ => (),
        }
    }

    let addr =
        parse_address(msg.header.family, msg.header.prefix_len, addr?)?;
    Some((ifindex, addr))
}

fn parse_address(
    family: u8,
    prefixlen: u8,
    bytes: Vec<u8>,
) -> Option<IpNetwork> {
    let addr = match family as u16 {
        AF_INET => {
            let addr_array: [u8; 4] = bytes.try_into().ok()?;
            Ipv4Addr::from(addr_array).into()
        }
        AF_INET6 => {
            let addr_array: [u8; 16] = bytes.try_into().ok()?;
            Ipv6Addr::from(addr_array).into()
        }
        _ => return None,
    };
    IpNetwork::new(addr, prefixlen).ok()
}

async fn init() -> (Handle, NetlinkMonitor) {
    // Create the request socket.
    let (conn, handle, _) =
        new_connection().expect("failed to create netlink socket");
    tokio::spawn(conn);

    // Create the monitor socket, subscribed to the link, address and route
    // multicast groups.
    let (mut conn, _, monitor) =
        new_connection().expect("failed to create netlink socket");
    let groups = [
        RTNLGRP_LINK,
        RTNLGRP_IPV4_IFADDR,
        RTNLGRP_IPV6_IFADDR,
        RTNLGRP_IPV4_ROUTE,
        RTNLGRP_IPV6_ROUTE,
    ]
    .iter()
    .map(|group| 1 << (group - 1))
    .fold(0, std::ops::BitOr::bitor);
    let addr = SocketAddr::new(0, groups);
    conn.socket_mut()
        .socket_mut()
        .bind(&addr)
        .expect("failed to bind netlink socket");
    tokio::spawn(conn);

    (handle, monitor)
}

// ===== global functions =====

pub(crate) async fn run(event_tx: Sender<EngineMsg>) {
    let (handle, mut monitor_rx) = init().await;
    let mut monitor = Monitor {
        handle,
        ifaces: HashMap::new(),
        event_tx,
    };

    // Initial enumeration of interfaces and addresses.
    monitor.dump_links().await;
    monitor.resync_addresses().await;

    // Process kernel notifications.
    while let Some((msg, _)) = monitor_rx.next().await {
        monitor.process_msg(msg).await;
    }
}
