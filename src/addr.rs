use core::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// An IPv6 address paired with its layer-4 identifier: a port for TCP and
/// UDP, the ICMP id otherwise.
///
/// Ordered lexicographically by `(addr, port)`; addresses compare as unsigned
/// bytes in network order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransportAddr6 {
    pub addr: Ipv6Addr,
    pub port: u16,
}

impl TransportAddr6 {
    pub fn new(addr: Ipv6Addr, port: u16) -> Self {
        Self { addr, port }
    }
}

impl fmt::Display for TransportAddr6 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.addr, self.port)
    }
}

/// The IPv4 counterpart of [`TransportAddr6`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransportAddr4 {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl TransportAddr4 {
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self { addr, port }
    }
}

impl fmt::Display for TransportAddr4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.addr, self.port)
    }
}

/// The layer-4 protocols a translator keeps state for. Each protocol owns its
/// own pair of BIB and session tables; tables never mix protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("TCP"),
            Protocol::Udp => f.write_str("UDP"),
            Protocol::Icmp => f.write_str("ICMP"),
        }
    }
}

/// The halves of a packet's 5-tuple the state tables care about.
///
/// `dst` of an incoming packet is the translator-side ("local") address,
/// `src` the remote endpoint. The address family is part of the type, so a
/// lookup can never be handed a tuple of an unknown network protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tuple {
    V6 {
        src: TransportAddr6,
        dst: TransportAddr6,
        proto: Protocol,
    },
    V4 {
        src: TransportAddr4,
        dst: TransportAddr4,
        proto: Protocol,
    },
}

impl Tuple {
    pub fn proto(&self) -> Protocol {
        match self {
            Tuple::V6 { proto, .. } | Tuple::V4 { proto, .. } => *proto,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v6(addr: &str, port: u16) -> TransportAddr6 {
        TransportAddr6::new(addr.parse().unwrap(), port)
    }

    fn v4(addr: &str, port: u16) -> TransportAddr4 {
        TransportAddr4::new(addr.parse().unwrap(), port)
    }

    #[test]
    fn transport_addr_orders_by_address_then_port() {
        assert!(v6("2001:db8::1", 9) < v6("2001:db8::1", 10));
        assert!(v6("2001:db8::1", u16::MAX) < v6("2001:db8::2", 0));
        assert!(v4("192.0.2.1", 9) < v4("192.0.2.1", 10));
        assert!(v4("192.0.2.1", u16::MAX) < v4("192.0.2.2", 0));
    }

    #[test]
    fn ipv6_addresses_compare_as_network_order_bytes() {
        assert!(v6("::ff", 0) < v6("1::", 0));
        assert!(v4("9.0.0.0", 0) < v4("10.0.0.0", 0));
    }

    #[test]
    fn display_renders_address_and_port() {
        assert_eq!(v6("2001:db8::1", 10000).to_string(), "2001:db8::1#10000");
        assert_eq!(v4("192.0.2.5", 40000).to_string(), "192.0.2.5#40000");
    }
}
