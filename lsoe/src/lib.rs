//
// Copyright (c) The LSOE Project Contributors
//
// SPDX-License-Identifier: MIT
//

#![cfg_attr(
    feature = "testing",
    allow(dead_code, unused_variables, unused_imports)
)]

pub mod debug;
pub mod engine;
pub mod error;
pub mod events;
pub mod fragment;
pub mod interface;
pub mod monitor;
pub mod network;
pub mod northbound;
pub mod packet;
pub mod session;
pub mod tasks;

use std::time::Duration;

use lsoe_utils::mac_addr::MacAddr;

use crate::packet::LocalId;
use crate::packet::consts::{ETHERTYPE, HELLO_MULTICAST_ADDRS};

// Protocol configuration, fixed for the lifetime of the engine.
#[derive(Clone, Debug)]
pub struct Config {
    // 10-octet router identifier.
    pub local_id: LocalId,
    pub ethertype: u16,
    // Destination MAC for HELLO PDUs; everything else is unicast.
    pub hello_dst: MacAddr,
    pub hello_interval: Duration,
    pub keepalive_interval: Duration,
    // Advertised in OPEN; the minimum of the two sides wins (seconds).
    pub hold_time: u16,
    pub retransmit_base: Duration,
    pub retransmit_cap: Duration,
    pub max_attempts: u8,
    pub reassembly_ttl: Duration,
    // Northbound POST target; reporting is disabled when unset.
    pub report_url: Option<String>,
    // Optional interface allowlist; the default is all operative
    // non-loopback interfaces carrying at least one address.
    pub interfaces: Option<Vec<String>>,
    pub include_loopback: bool,
}

// ===== impl Config =====

impl Default for Config {
    fn default() -> Config {
        Config {
            local_id: LocalId::default(),
            ethertype: ETHERTYPE,
            hello_dst: MacAddr::new(HELLO_MULTICAST_ADDRS[0]),
            hello_interval: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(10),
            hold_time: 40,
            retransmit_base: Duration::from_secs(1),
            retransmit_cap: Duration::from_secs(30),
            max_attempts: 5,
            reassembly_ttl: Duration::from_secs(5),
            report_url: None,
            interfaces: None,
            include_loopback: false,
        }
    }
}
