//
// Copyright (c) The LSOE Project Contributors
//
// SPDX-License-Identifier: MIT
//

use nix::sys::socket::{LinkAddr, SockaddrLike};

// Normal build: re-export standard socket types.
#[cfg(not(feature = "testing"))]
pub use {socket2::Socket, tokio::io::unix::AsyncFd};

// Test build: export mock sockets.
#[cfg(feature = "testing")]
pub use crate::socket::mock::{AsyncFd, Socket};

// Extension methods for LinkAddr.
pub trait LinkAddrExt {
    // Creates a new `LinkAddr` using the given protocol number, interface
    // index, and an optional MAC address.
    fn new(protocol: u16, ifindex: u32, addr: Option<[u8; 6]>) -> Self;
}

// ===== impl LinkAddr =====

impl LinkAddrExt for LinkAddr {
    fn new(protocol: u16, ifindex: u32, addr: Option<[u8; 6]>) -> Self {
        let mut sll = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: protocol.to_be(),
            sll_ifindex: ifindex as _,
            sll_halen: 0,
            sll_hatype: 0,
            sll_pkttype: 0,
            sll_addr: [0; 8],
        };
        if let Some(addr) = addr {
            sll.sll_halen = 6;
            sll.sll_addr[..6].copy_from_slice(&addr);
        }
        let sll_len = size_of_val(&sll) as libc::socklen_t;
        unsafe {
            LinkAddr::from_raw(&sll as *const _ as *const _, Some(sll_len))
        }
        .unwrap()
    }
}

// ===== mock sockets =====

#[cfg(feature = "testing")]
pub mod mock {
    #[derive(Debug)]
    pub struct Socket {}

    #[derive(Debug)]
    pub struct AsyncFd<T> {
        _inner: T,
    }
}
