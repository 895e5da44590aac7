//
// Copyright (c) The LSOE Project Contributors
//
// SPDX-License-Identifier: MIT
//

#[cfg(not(feature = "testing"))]
use std::io::IoSliceMut;
#[cfg(not(feature = "testing"))]
use std::ops::Deref;
#[cfg(not(feature = "testing"))]
use std::os::fd::AsRawFd;
#[cfg(not(feature = "testing"))]
use std::sync::Arc;

#[cfg(not(feature = "testing"))]
use bytes::Bytes;
#[cfg(not(feature = "testing"))]
use lsoe_utils::Sender;
#[cfg(not(feature = "testing"))]
use lsoe_utils::UnboundedReceiver;
#[cfg(not(feature = "testing"))]
use lsoe_utils::mac_addr::MacAddr;
use lsoe_utils::socket::Socket;
#[cfg(not(feature = "testing"))]
use lsoe_utils::socket::{AsyncFd, LinkAddrExt};
#[cfg(not(feature = "testing"))]
use nix::sys::socket::{self, LinkAddr};
#[cfg(not(feature = "testing"))]
use tokio::sync::mpsc::error::SendError;

#[cfg(not(feature = "testing"))]
use crate::error::IoError;
#[cfg(not(feature = "testing"))]
use crate::tasks::messages::input::{EngineMsg, NetRxFrameMsg};
#[cfg(not(feature = "testing"))]
use crate::tasks::messages::output::NetTxFrameMsg;

// ===== global functions =====

// Opens the per-interface link-layer socket, bound to the LSOE EtherType.
pub(crate) fn socket(
    ifindex: u32,
    ethertype: u16,
) -> Result<Socket, std::io::Error> {
    #[cfg(not(feature = "testing"))]
    {
        use socket2::{Domain, Protocol, Type};

        // Create raw socket.
        let socket = lsoe_utils::capabilities::raise(|| {
            Socket::new(
                Domain::PACKET,
                Type::DGRAM,
                Some(Protocol::from(libc::ETH_P_ALL)),
            )
        })?;
        socket.set_nonblocking(true)?;

        // Bind to the local interface and EtherType.
        let sockaddr = LinkAddr::new(ethertype, ifindex, None);
        socket::bind(socket.as_raw_fd(), &sockaddr)?;

        Ok(socket)
    }
    #[cfg(feature = "testing")]
    {
        Ok(Socket {})
    }
}

#[cfg(not(feature = "testing"))]
pub(crate) async fn read_loop(
    socket: Arc<AsyncFd<Socket>>,
    ifindex: u32,
    event_tx: Sender<EngineMsg>,
) -> Result<(), SendError<EngineMsg>> {
    let mut buf = [0; 16384];
    let mut iov = [IoSliceMut::new(&mut buf)];

    loop {
        // Receive a link-layer frame.
        match socket
            .async_io(tokio::io::Interest::READABLE, |socket| {
                match socket::recvmsg::<LinkAddr>(
                    socket.as_raw_fd(),
                    &mut iov,
                    None,
                    socket::MsgFlags::empty(),
                ) {
                    Ok(msg) => Ok((msg.address.unwrap(), msg.bytes)),
                    Err(errno) => Err(errno.into()),
                }
            })
            .await
        {
            Ok((src, bytes)) => {
                // Extract the source MAC address from the frame metadata.
                let Some(src) = src.addr() else {
                    IoError::RecvMissingSourceAddr.log();
                    continue;
                };

                let data = Bytes::copy_from_slice(&iov[0].deref()[..bytes]);
                let msg = NetRxFrameMsg {
                    ifindex,
                    src: MacAddr::from(src),
                    data,
                };
                event_tx.send(EngineMsg::NetRxFrame(msg)).await?;
            }
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {
                // Retry if the syscall was interrupted (EINTR).
                continue;
            }
            Err(error) => {
                IoError::RecvError(error).log();
            }
        }
    }
}

#[cfg(not(feature = "testing"))]
pub(crate) async fn write_loop(
    socket: Arc<AsyncFd<Socket>>,
    ifindex: u32,
    ethertype: u16,
    mtu: u32,
    mut net_tx_rx: UnboundedReceiver<NetTxFrameMsg>,
) {
    while let Some(NetTxFrameMsg { dst, data }) = net_tx_rx.recv().await {
        // The fragmenter sizes frames to the MTU; this is a backstop.
        if data.len() > mtu as usize {
            IoError::FrameTooLarge {
                len: data.len(),
                mtu,
            }
            .log();
            continue;
        }

        if let Err(error) =
            send_frame(&socket, ifindex, ethertype, dst, &data).await
        {
            error.log();
        }
    }
}

// ===== helper functions =====

#[cfg(not(feature = "testing"))]
async fn send_frame(
    socket: &AsyncFd<Socket>,
    ifindex: u32,
    ethertype: u16,
    dst: MacAddr,
    data: &[u8],
) -> Result<usize, IoError> {
    socket
        .async_io(tokio::io::Interest::WRITABLE, |socket| {
            let sockaddr =
                LinkAddr::new(ethertype, ifindex, Some(dst.as_bytes()));
            socket::sendto(
                socket.as_raw_fd(),
                data,
                &sockaddr,
                socket::MsgFlags::empty(),
            )
            .map_err(|errno| errno.into())
        })
        .await
        .map_err(IoError::SendError)
}
