//
// Copyright (c) The LSOE Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use lsoe_utils::{Receiver, Sender};
use rand::RngCore;
use tokio::sync::mpsc;
use tracing::info;

use crate::fragment::Reassembler;
use crate::interface::Interfaces;
use crate::northbound::Reporter;
use crate::packet::pdu::Vendor;
use crate::session::{DropCounters, PeerKey, Sessions};
use crate::tasks::messages::input::EngineMsg;
use crate::{Config, events, northbound, tasks};

// Decision returned by a vendor extension handler.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VendorDecision {
    Accept,
    Reject,
}

// Handler for VENDOR PDUs of one enterprise number. The registry is
// populated at engine construction; unknown enterprise numbers are
// acknowledged and discarded.
pub trait VendorHandler: Send {
    fn handle(&self, key: &PeerKey, pdu: &Vendor) -> VendorDecision;
}

// Process-wide protocol coordinator. A single event loop owns every
// session, every socket and the scheduler; it wakes on the earliest
// pending deadline or on the next queued event.
pub struct Engine {
    pub config: Config,
    pub interfaces: Interfaces,
    pub sessions: Sessions,
    // Reassembly buffers for peers that have not completed a HELLO yet.
    pub(crate) pending_reasm: HashMap<PeerKey, Reassembler>,
    // Drop counters for frames not attributable to a session.
    pub counters: DropCounters,
    pub(crate) vendor_handlers: BTreeMap<u32, Box<dyn VendorHandler>>,
    pub(crate) reporter: Reporter,
    // Random per-boot token, part of the stable ids the northbound consumer
    // uses for deduplication.
    pub instance_token: u64,
    pub(crate) next_hello: Instant,
    // Set whenever the reportable state changed; drained into a northbound
    // push at the end of the loop iteration.
    pub(crate) dirty: bool,
    pub(crate) event_tx: Sender<EngineMsg>,
}

// ===== impl Engine =====

impl Engine {
    pub fn new(
        config: Config,
        vendor_handlers: BTreeMap<u32, Box<dyn VendorHandler>>,
    ) -> (Engine, Receiver<EngineMsg>) {
        let (event_tx, event_rx) = mpsc::channel(1024);
        let reporter = Reporter::new(config.report_url.clone());
        let engine = Engine {
            config,
            interfaces: Default::default(),
            sessions: Default::default(),
            pending_reasm: Default::default(),
            counters: Default::default(),
            vendor_handlers,
            reporter,
            instance_token: rand::rng().next_u64(),
            next_hello: Instant::now(),
            dirty: false,
            event_tx,
        };
        (engine, event_rx)
    }

    // Runs the engine until shutdown is requested.
    pub async fn run(mut self, mut event_rx: Receiver<EngineMsg>) {
        let _monitor = tasks::netlink_monitor(&self.event_tx);
        let _signals = tasks::signal_listener(&self.event_tx);

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                msg = event_rx.recv() => {
                    match msg {
                        Some(EngineMsg::Shutdown) | None => break,
                        Some(msg) => self.process_msg(msg),
                    }
                }
                _ = sleep_until(deadline) => {
                    events::process_timers(&mut self, Instant::now());
                }
            }

            if self.dirty {
                northbound::push_snapshot(&mut self);
                self.dirty = false;
            }
        }

        info!("shutting down");
        events::process_shutdown(&mut self, Instant::now());
        // Dropping the engine aborts the I/O tasks and closes the sockets.
    }

    fn process_msg(&mut self, msg: EngineMsg) {
        let now = Instant::now();
        match msg {
            EngineMsg::NetRxFrame(msg) => {
                if let Err(error) = events::process_frame(self, msg, now) {
                    error.log();
                }
            }
            EngineMsg::IfaceEvent(msg) => {
                events::process_iface_event(self, msg, now);
            }
            EngineMsg::Shutdown => (),
        }
    }

    // Earliest deadline across the HELLO beacon and every session.
    pub(crate) fn next_deadline(&self) -> Instant {
        let mut next = self.next_hello;
        for sess in self.sessions.iter() {
            if let Some((deadline, _)) = sess.next_deadline(&self.config)
                && deadline < next
            {
                next = deadline;
            }
        }
        for reasm in self.pending_reasm.values() {
            if let Some(deadline) = reasm.deadline(self.config.reassembly_ttl)
                && deadline < next
            {
                next = deadline;
            }
        }
        next
    }

    // Opens or closes the raw socket of an interface to match its
    // eligibility, restarting the I/O tasks when the MTU changed.
    pub(crate) fn refresh_interface_io(&mut self, ifindex: u32, now: Instant) {
        let Some(iface) = self.interfaces.get_mut(ifindex) else {
            return;
        };

        if !iface.eligible(&self.config) {
            iface.io = None;
            return;
        }
        if let Some(io) = &iface.io
            && io.mtu == iface.mtu
        {
            return;
        }

        #[cfg(not(feature = "testing"))]
        {
            use std::sync::Arc;

            use lsoe_utils::socket::AsyncFd;

            use crate::error::IoError;
            use crate::interface::InterfaceIo;
            use crate::network;

            let socket = network::socket(ifindex, self.config.ethertype)
                .and_then(AsyncFd::new);
            match socket {
                Ok(socket) => {
                    let socket = Arc::new(socket);
                    let (net_tx, net_tx_rx) = mpsc::unbounded_channel();
                    let rx_task =
                        tasks::net_rx(socket.clone(), ifindex, &self.event_tx);
                    let tx_task = tasks::net_tx(
                        socket,
                        ifindex,
                        self.config.ethertype,
                        iface.mtu,
                        net_tx_rx,
                    );
                    iface.io = Some(InterfaceIo {
                        mtu: iface.mtu,
                        net_tx,
                        _rx_task: Some(rx_task),
                        _tx_task: Some(tx_task),
                    });
                    // Announce ourselves without waiting for the next
                    // beacon tick.
                    self.next_hello = now;
                }
                Err(error) => {
                    IoError::SocketError(error).log();
                }
            }
        }
        #[cfg(feature = "testing")]
        {
            // Unit tests install their own Tx channel.
            let _ = now;
        }
    }
}

// ===== helper functions =====

async fn sleep_until(deadline: Instant) {
    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
}
