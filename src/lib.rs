//! State tracking for a stateful NAT64 translator.
//!
//! Two families of per-protocol tables hold everything the packet path needs:
//! the Binding Information Base ([`BibTable`]) maps an inside IPv6 transport
//! address to the outside IPv4 one it was assigned, and the session table
//! ([`SessionTable`]) records which remote endpoints each binding is
//! currently talking to, together with expiry timing. A session pins its
//! binding; a dynamic binding disappears once its last session does.
//!
//! The tables are driven, not driving: they arm no timers and perform no I/O.
//! Every time-sensitive operation takes `now` and hands back the [`Wake`]
//! deadlines the caller must schedule, and an expiry sweep returns the
//! sessions the caller has to probe.

mod addr;
mod bib;
mod db;
mod expiry;
mod index;
mod session;

#[cfg(feature = "proptest")]
pub mod proptest;

pub use addr::{Protocol, TransportAddr4, TransportAddr6, Tuple};
pub use bib::{AlreadyExists, BibEntry, BibRef, BibTable, PoolHandle};
pub use db::{
    BibDb, ICMP_TIMEOUT, SessionDb, TCP_EST_TIMEOUT, TCP_TRANS_TIMEOUT, UDP_TIMEOUT,
};
pub use expiry::{
    DieOnTimeout, ExpirerConfig, ExpiryClass, ExpiryPolicy, MIN_TIMER_SLEEP, Verdict, Wake,
};
pub use session::{
    Detached, InsertError, NoQueue, PacketQueue, QueueBusy, Session, SessionTable, Sweep,
};
