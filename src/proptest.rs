use crate::{Protocol, TransportAddr4, TransportAddr6};
use proptest::prelude::*;
use std::net::{Ipv4Addr, Ipv6Addr};

pub fn protocol() -> impl Strategy<Value = Protocol> {
    prop_oneof![
        Just(Protocol::Tcp),
        Just(Protocol::Udp),
        Just(Protocol::Icmp),
    ]
}

pub fn transport_addr6() -> impl Strategy<Value = TransportAddr6> {
    (any::<u128>(), any::<u16>())
        .prop_map(|(addr, port)| TransportAddr6::new(Ipv6Addr::from(addr), port))
}

pub fn transport_addr4() -> impl Strategy<Value = TransportAddr4> {
    (any::<u32>(), any::<u16>())
        .prop_map(|(addr, port)| TransportAddr4::new(Ipv4Addr::from(addr), port))
}

/// IPv6 transport addresses drawn from a handful of hosts and ports, for
/// collision-heavy sequences.
pub fn clustered_addr6() -> impl Strategy<Value = TransportAddr6> {
    (0..4u16, 0..4u16).prop_map(|(host, port)| {
        TransportAddr6::new(
            Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, host + 1),
            port,
        )
    })
}

/// The IPv4 counterpart of [`clustered_addr6`].
pub fn clustered_addr4() -> impl Strategy<Value = TransportAddr4> {
    (0..4u8, 0..4u16)
        .prop_map(|(host, port)| TransportAddr4::new(Ipv4Addr::new(192, 0, 2, host + 1), port))
}
