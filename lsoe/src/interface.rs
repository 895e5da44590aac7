//
// Copyright (c) The LSOE Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use ipnetwork::IpNetwork;
use lsoe_utils::UnboundedSender;
use lsoe_utils::mac_addr::MacAddr;
use lsoe_utils::task::Task;

use crate::Config;
use crate::packet::pdu::{Ipv4Entry, Ipv6Entry, MplsEntry};
use crate::tasks::messages::input::IfaceUpdateMsg;
use crate::tasks::messages::output::NetTxFrameMsg;

// Local interface, mirrored from the monitor's event stream. The engine
// never queries the kernel directly.
#[derive(Debug)]
pub struct Interface {
    pub ifindex: u32,
    pub name: String,
    pub mac: MacAddr,
    pub mtu: u32,
    pub loopback: bool,
    pub operative: bool,
    pub addresses: BTreeSet<IpNetwork>,
    // MPLS encapsulations advertised for this interface. Left empty until
    // the encapsulation semantics stabilise.
    pub mpls_labels: Vec<u32>,
    pub(crate) io: Option<InterfaceIo>,
}

// Live I/O attachment of an interface: the Tx queue feeding the write loop
// plus the task handles keeping both loops alive.
#[derive(Debug)]
pub(crate) struct InterfaceIo {
    pub(crate) mtu: u32,
    pub(crate) net_tx: UnboundedSender<NetTxFrameMsg>,
    pub(crate) _rx_task: Option<Task<()>>,
    pub(crate) _tx_task: Option<Task<()>>,
}

// Cloneable handle used to transmit frames out of an interface.
#[derive(Clone, Debug)]
pub(crate) struct TxHandle {
    pub(crate) mtu: u32,
    pub(crate) net_tx: UnboundedSender<NetTxFrameMsg>,
}

#[derive(Debug, Default)]
pub struct Interfaces(BTreeMap<u32, Interface>);

// ===== impl Interface =====

impl Interface {
    fn new(msg: IfaceUpdateMsg) -> Interface {
        Interface {
            ifindex: msg.ifindex,
            name: msg.name,
            mac: msg.mac,
            mtu: msg.mtu,
            loopback: msg.loopback,
            operative: msg.operative,
            addresses: Default::default(),
            mpls_labels: Default::default(),
            io: None,
        }
    }

    // Returns whether LSOE should run on this interface. Loopbacks and
    // interfaces without addresses are excluded unless explicitly listed.
    pub(crate) fn eligible(&self, config: &Config) -> bool {
        if !self.operative {
            return false;
        }
        match &config.interfaces {
            Some(allowlist) => allowlist.iter().any(|name| *name == self.name),
            None => {
                (!self.loopback || config.include_loopback)
                    && !self.addresses.is_empty()
            }
        }
    }

    pub(crate) fn tx_handle(&self) -> Option<TxHandle> {
        self.io.as_ref().map(|io| TxHandle {
            mtu: io.mtu,
            net_tx: io.net_tx.clone(),
        })
    }

    pub(crate) fn ipv4_entries(&self) -> Vec<Ipv4Entry> {
        self.addresses
            .iter()
            .filter_map(|addr| match addr {
                IpNetwork::V4(addr) => {
                    Some(Ipv4Entry::new(addr.ip(), addr.prefix()))
                }
                IpNetwork::V6(_) => None,
            })
            .collect()
    }

    pub(crate) fn ipv6_entries(&self) -> Vec<Ipv6Entry> {
        self.addresses
            .iter()
            .filter_map(|addr| match addr {
                IpNetwork::V4(_) => None,
                IpNetwork::V6(addr) => {
                    Some(Ipv6Entry::new(addr.ip(), addr.prefix()))
                }
            })
            .collect()
    }

    pub(crate) fn mpls_entries(&self) -> Vec<MplsEntry> {
        self.mpls_labels.iter().copied().map(MplsEntry::new).collect()
    }
}

// ===== impl TxHandle =====

impl TxHandle {
    pub(crate) fn send_frame(&self, dst: MacAddr, data: Bytes) {
        let _ = self.net_tx.send(NetTxFrameMsg { dst, data });
    }
}

// ===== impl Interfaces =====

impl Interfaces {
    // Creates or updates an interface from a monitor event, preserving the
    // address list and I/O attachment.
    pub(crate) fn update(&mut self, msg: IfaceUpdateMsg) -> &mut Interface {
        let iface = self
            .0
            .entry(msg.ifindex)
            .or_insert_with(|| Interface::new(msg.clone()));
        iface.name = msg.name;
        iface.mac = msg.mac;
        iface.mtu = msg.mtu;
        iface.loopback = msg.loopback;
        iface.operative = msg.operative;
        iface
    }

    pub(crate) fn insert(&mut self, iface: Interface) {
        self.0.insert(iface.ifindex, iface);
    }

    pub(crate) fn remove(&mut self, ifindex: u32) -> Option<Interface> {
        self.0.remove(&ifindex)
    }

    pub fn get(&self, ifindex: u32) -> Option<&Interface> {
        self.0.get(&ifindex)
    }

    pub(crate) fn get_mut(&mut self, ifindex: u32) -> Option<&mut Interface> {
        self.0.get_mut(&ifindex)
    }

    // Returns an iterator visiting all interfaces, ordered by ifindex.
    pub fn iter(&self) -> impl Iterator<Item = &'_ Interface> + '_ {
        self.0.values()
    }
}
