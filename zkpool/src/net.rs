// Copyright 2020 Joyent, Inc.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

// Any routable address works; nothing is sent.
const PROBE_ADDR: &str = "192.0.2.1:9";

/// The address this host would use to reach the network, falling back to
/// the loopback address when it cannot be determined.
pub fn local_address() -> IpAddr {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect(PROBE_ADDR)?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
