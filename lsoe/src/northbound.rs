//
// Copyright (c) The LSOE Project Contributors
//
// SPDX-License-Identifier: MIT
//

use chrono::{DateTime, Utc};
use lsoe_utils::mac_addr::MacAddr;
use lsoe_utils::task::Task;
use serde::Serialize;
use tracing::warn;

use crate::debug::Debug;
use crate::engine::Engine;
use crate::packet::LocalId;
use crate::session::{DropCounters, PeerSnapshot, SessionStatistics, State};

// Northbound reporter: serializes the current session state into a JSON
// document and POSTs it out-of-band. The engine only guarantees snapshot
// atomicity; transport is fire-and-forget.
#[derive(Debug)]
pub struct Reporter {
    url: Option<String>,
    client: reqwest::Client,
    serial: u64,
}

// RFC 7752-shaped snapshot document. The "unique" list plus the per-boot
// instance token let the consumer deduplicate pushes.
#[derive(Debug, Serialize)]
pub struct Document<'a> {
    pub unique: Vec<String>,
    pub local_id: LocalId,
    pub instance: String,
    pub serial: u64,
    pub generated: DateTime<Utc>,
    pub interfaces: Vec<InterfaceReport>,
    pub sessions: Vec<SessionReport<'a>>,
    pub drops: &'a DropCounters,
}

#[derive(Debug, Serialize)]
pub struct InterfaceReport {
    pub name: String,
    pub ifindex: u32,
    pub mac: MacAddr,
    pub mtu: u32,
    pub addresses: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionReport<'a> {
    pub unique: String,
    pub ifindex: u32,
    pub peer_mac: MacAddr,
    pub peer_id: Option<LocalId>,
    pub state: State,
    pub hold_time: u64,
    pub encapsulations: &'a PeerSnapshot,
    pub statistics: &'a SessionStatistics,
    pub drops: &'a DropCounters,
}

// ===== impl Reporter =====

impl Reporter {
    pub(crate) fn new(url: Option<String>) -> Reporter {
        Reporter {
            url,
            client: reqwest::Client::new(),
            serial: 0,
        }
    }
}

// ===== global functions =====

// Assembles the current snapshot and hands it to the HTTP client. Called
// by the engine whenever the reportable state changed; disappeared
// sessions are simply absent from the next document.
pub(crate) fn push_snapshot(engine: &mut Engine) {
    engine.reporter.serial += 1;
    let serial = engine.reporter.serial;
    Debug::SnapshotPush(serial).log();

    let document = build_document(engine, serial);
    let body = match serde_json::to_value(&document) {
        Ok(body) => body,
        Err(error) => {
            warn!(%error, "failed to serialize northbound snapshot");
            return;
        }
    };

    let Some(url) = engine.reporter.url.clone() else {
        return;
    };
    let client = engine.reporter.client.clone();
    let mut task = Task::spawn(async move {
        match client.post(&url).json(&body).send().await {
            Ok(response) if !response.status().is_success() => {
                warn!(status = %response.status(), "northbound push rejected");
            }
            Ok(_) => (),
            Err(error) => {
                warn!(%error, "northbound push failed");
            }
        }
    });
    task.detach();
}

fn build_document(engine: &Engine, serial: u64) -> Document<'_> {
    let interfaces = engine
        .interfaces
        .iter()
        .map(|iface| InterfaceReport {
            name: iface.name.clone(),
            ifindex: iface.ifindex,
            mac: iface.mac,
            mtu: iface.mtu,
            addresses: iface
                .addresses
                .iter()
                .map(|addr| addr.to_string())
                .collect(),
        })
        .collect();

    let sessions: Vec<_> = engine
        .sessions
        .iter()
        .map(|sess| SessionReport {
            unique: session_unique(engine.instance_token, sess.key.ifindex, sess.key.mac),
            ifindex: sess.key.ifindex,
            peer_mac: sess.key.mac,
            peer_id: sess.peer_id,
            state: sess.state,
            hold_time: sess.hold_time(&engine.config).as_secs(),
            encapsulations: &sess.snapshot,
            statistics: &sess.statistics,
            drops: &sess.counters,
        })
        .collect();

    Document {
        unique: sessions.iter().map(|sess| sess.unique.clone()).collect(),
        local_id: engine.config.local_id,
        instance: format!("{:016x}", engine.instance_token),
        serial,
        generated: Utc::now(),
        interfaces,
        sessions,
        drops: &engine.counters,
    }
}

fn session_unique(instance_token: u64, ifindex: u32, mac: MacAddr) -> String {
    format!("{instance_token:016x}/{ifindex}/{mac}")
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Instant;

    use super::*;
    use crate::Config;
    use crate::session::PeerKey;

    #[test]
    fn document_shape() {
        let (mut engine, _event_rx) =
            Engine::new(Config::default(), BTreeMap::new());
        let key = PeerKey {
            ifindex: 7,
            mac: MacAddr::new([0x02, 0, 0, 0, 0, 0x09]),
        };
        engine.sessions.insert(key, Instant::now());

        let document = build_document(&engine, 3);
        assert_eq!(document.serial, 3);
        assert_eq!(document.unique.len(), 1);
        assert_eq!(
            document.unique[0],
            format!("{:016x}/7/02:00:00:00:00:09", engine.instance_token)
        );

        let body = serde_json::to_value(&document).unwrap();
        assert_eq!(body["serial"], 3);
        assert_eq!(body["sessions"][0]["state"], "Idle");
        assert!(body["unique"].is_array());
    }
}
