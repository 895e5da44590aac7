//
// Copyright (c) The LSOE Project Contributors
//
// SPDX-License-Identifier: MIT
//

#[cfg(not(feature = "testing"))]
use std::sync::Arc;

use lsoe_utils::Sender;
#[cfg(not(feature = "testing"))]
use lsoe_utils::UnboundedReceiver;
#[cfg(not(feature = "testing"))]
use lsoe_utils::socket::{AsyncFd, Socket};
use lsoe_utils::task::Task;
#[cfg(not(feature = "testing"))]
use tracing::Instrument;

#[cfg(not(feature = "testing"))]
use crate::tasks::messages::output::NetTxFrameMsg;
use crate::tasks::messages::input::EngineMsg;
#[cfg(not(feature = "testing"))]
use crate::{monitor, network};

//
// LSOE tasks diagram:
//                               +--------------+
//                net_rx (Nx) -> |              | -> (Nx) net_tx
//       netlink_monitor (1x) -> |    engine    |
//       signal_listener (1x) -> |              | -> (Nx) northbound push
//                               +--------------+
//
// The engine itself is a single event loop waking on the earliest session
// deadline or on the next queued event; the tasks above only move bytes in
// and out of it.
//

// LSOE inter-task message types.
pub mod messages {
    use bytes::Bytes;
    use ipnetwork::IpNetwork;
    use lsoe_utils::mac_addr::MacAddr;
    use serde::{Deserialize, Serialize};

    // Input messages (child task -> engine).
    pub mod input {
        use super::*;

        #[derive(Debug)]
        #[derive(Deserialize, Serialize)]
        pub enum EngineMsg {
            NetRxFrame(NetRxFrameMsg),
            IfaceEvent(IfaceEventMsg),
            Shutdown,
        }

        #[derive(Debug)]
        #[derive(Deserialize, Serialize)]
        pub struct NetRxFrameMsg {
            pub ifindex: u32,
            pub src: MacAddr,
            pub data: Bytes,
        }

        #[derive(Debug)]
        #[derive(Deserialize, Serialize)]
        pub enum IfaceEventMsg {
            Update(IfaceUpdateMsg),
            Delete(u32),
            AddrAdd(u32, IpNetwork),
            AddrDel(u32, IpNetwork),
        }

        #[derive(Clone, Debug)]
        #[derive(Deserialize, Serialize)]
        pub struct IfaceUpdateMsg {
            pub ifindex: u32,
            pub name: String,
            pub mac: MacAddr,
            pub mtu: u32,
            pub loopback: bool,
            pub operative: bool,
        }
    }

    // Output messages (engine -> child task).
    pub mod output {
        use super::*;

        #[derive(Debug)]
        #[derive(Serialize)]
        pub struct NetTxFrameMsg {
            pub dst: MacAddr,
            pub data: Bytes,
        }
    }
}

// ===== LSOE tasks =====

// Per-interface frame Rx task.
#[cfg(not(feature = "testing"))]
pub(crate) fn net_rx(
    socket: Arc<AsyncFd<Socket>>,
    ifindex: u32,
    event_tx: &Sender<EngineMsg>,
) -> Task<()> {
    let event_tx = event_tx.clone();
    Task::spawn(
        async move {
            let _ = network::read_loop(socket, ifindex, event_tx).await;
        }
        .in_current_span(),
    )
}

// Per-interface frame Tx task.
#[cfg(not(feature = "testing"))]
pub(crate) fn net_tx(
    socket: Arc<AsyncFd<Socket>>,
    ifindex: u32,
    ethertype: u16,
    mtu: u32,
    net_tx_rx: UnboundedReceiver<NetTxFrameMsg>,
) -> Task<()> {
    Task::spawn(
        async move {
            network::write_loop(socket, ifindex, ethertype, mtu, net_tx_rx)
                .await;
        }
        .in_current_span(),
    )
}

// Netlink interface/address monitor task.
pub(crate) fn netlink_monitor(event_tx: &Sender<EngineMsg>) -> Task<()> {
    #[cfg(not(feature = "testing"))]
    {
        let event_tx = event_tx.clone();
        Task::spawn(
            async move {
                monitor::run(event_tx).await;
            }
            .in_current_span(),
        )
    }
    #[cfg(feature = "testing")]
    {
        Task::spawn(async move { std::future::pending().await })
    }
}

// Delivers SIGINT/SIGTERM as a shutdown event.
pub(crate) fn signal_listener(event_tx: &Sender<EngineMsg>) -> Task<()> {
    #[cfg(not(feature = "testing"))]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let event_tx = event_tx.clone();
        Task::spawn(async move {
            let mut sigterm = signal(SignalKind::terminate())
                .expect("failed to register signal handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => (),
                _ = sigterm.recv() => (),
            }
            let _ = event_tx.send(EngineMsg::Shutdown).await;
        })
    }
    #[cfg(feature = "testing")]
    {
        Task::spawn(async move { std::future::pending().await })
    }
}
