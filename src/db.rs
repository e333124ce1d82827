use crate::addr::{Protocol, Tuple};
use crate::bib::BibTable;
use crate::expiry::{DieOnTimeout, ExpirerConfig, ExpiryPolicy, Wake};
use crate::session::{NoQueue, PacketQueue, Session, SessionTable};
use ip_network::Ipv4Network;
use smallvec::SmallVec;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default state lifetimes, per RFC 6146.
pub const TCP_EST_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
pub const TCP_TRANS_TIMEOUT: Duration = Duration::from_secs(4 * 60);
pub const UDP_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const ICMP_TIMEOUT: Duration = Duration::from_secs(60);

/// One [`BibTable`] per protocol.
pub struct BibDb {
    tcp: BibTable,
    udp: BibTable,
    icmp: BibTable,
}

impl BibDb {
    pub fn new() -> Self {
        Self {
            tcp: BibTable::new(Protocol::Tcp),
            udp: BibTable::new(Protocol::Udp),
            icmp: BibTable::new(Protocol::Icmp),
        }
    }

    pub fn table(&self, proto: Protocol) -> &BibTable {
        match proto {
            Protocol::Tcp => &self.tcp,
            Protocol::Udp => &self.udp,
            Protocol::Icmp => &self.icmp,
        }
    }

    pub fn count(&self) -> u64 {
        self.tcp.count() + self.udp.count() + self.icmp.count()
    }

    pub fn flush(&self) {
        self.tcp.flush();
        self.udp.flush();
        self.icmp.flush();
    }

    pub fn delete_in_range(&self, prefix: Ipv4Network, ports: RangeInclusive<u16>) {
        self.tcp.delete_in_range(prefix, ports.clone());
        self.udp.delete_in_range(prefix, ports.clone());
        self.icmp.delete_in_range(prefix, ports);
    }

    pub fn set_log_changes(&self, log_changes: bool) {
        self.tcp.set_log_changes(log_changes);
        self.udp.set_log_changes(log_changes);
        self.icmp.set_log_changes(log_changes);
    }
}

impl Default for BibDb {
    fn default() -> Self {
        Self::new()
    }
}

/// One [`SessionTable`] per protocol, wired up with the RFC 6146 default
/// timeouts.
///
/// Only TCP has a connection state machine, so only its tables take the
/// translator's classifier and pending-SYN queue; UDP and ICMP sessions
/// simply die when they time out.
pub struct SessionDb {
    tcp: SessionTable,
    udp: SessionTable,
    icmp: SessionTable,
}

impl SessionDb {
    pub fn new(tcp_policy: Arc<dyn ExpiryPolicy>, syn_queue: Arc<dyn PacketQueue>) -> Self {
        Self {
            tcp: SessionTable::new(
                Protocol::Tcp,
                ExpirerConfig::new(TCP_EST_TIMEOUT, Arc::clone(&tcp_policy)),
                ExpirerConfig::new(TCP_TRANS_TIMEOUT, tcp_policy),
                syn_queue,
            ),
            udp: SessionTable::new(
                Protocol::Udp,
                ExpirerConfig::new(UDP_TIMEOUT, Arc::new(DieOnTimeout)),
                ExpirerConfig::new(UDP_TIMEOUT, Arc::new(DieOnTimeout)),
                Arc::new(NoQueue),
            ),
            icmp: SessionTable::new(
                Protocol::Icmp,
                ExpirerConfig::new(ICMP_TIMEOUT, Arc::new(DieOnTimeout)),
                ExpirerConfig::new(ICMP_TIMEOUT, Arc::new(DieOnTimeout)),
                Arc::new(NoQueue),
            ),
        }
    }

    pub fn table(&self, proto: Protocol) -> &SessionTable {
        match proto {
            Protocol::Tcp => &self.tcp,
            Protocol::Udp => &self.udp,
            Protocol::Icmp => &self.icmp,
        }
    }

    pub fn lookup(&self, tuple: &Tuple) -> Option<Arc<Session>> {
        self.table(tuple.proto()).lookup(tuple)
    }

    pub fn count(&self) -> u64 {
        self.tcp.count() + self.udp.count() + self.icmp.count()
    }

    pub fn flush(&self) -> usize {
        self.tcp.flush() + self.udp.flush() + self.icmp.flush()
    }

    pub fn delete_by_prefix4(&self, prefix: Ipv4Network) -> usize {
        self.tcp.delete_by_prefix4(prefix)
            + self.udp.delete_by_prefix4(prefix)
            + self.icmp.delete_by_prefix4(prefix)
    }

    /// Re-arms every table's timers; an empty queue disarms.
    pub fn update_timers(&self, now: Instant) -> SmallVec<[(Protocol, Wake); 6]> {
        let mut wakes = SmallVec::new();

        for proto in [Protocol::Tcp, Protocol::Udp, Protocol::Icmp] {
            for wake in self.table(proto).update_timers(now) {
                wakes.push((proto, wake));
            }
        }

        wakes
    }
}
