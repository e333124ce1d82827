use crate::addr::{Protocol, TransportAddr4, TransportAddr6, Tuple};
use crate::bib::{BibEntry, BibRef};
use crate::expiry::{Expirer, ExpirerConfig, ExpiryClass, MIN_TIMER_SLEEP, Verdict, Wake};
use crate::index::OrderedIndex;
use ip_network::Ipv4Network;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::net::Ipv4Addr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

type Key6 = (TransportAddr6, TransportAddr6);
type Key4 = (TransportAddr4, TransportAddr4);

const CLASS_DETACHED: u8 = 0;
const CLASS_ESTABLISHED: u8 = 1;
const CLASS_TRANSITORY: u8 = 2;

/// Per-connection 4-tuple state, pinned to the BIB entry it was derived from.
///
/// `local` is the translator-side transport address of each family, `remote`
/// the respective endpoint. The bookkeeping fields are atomics purely for
/// interior mutability; they are only written under the owning table's lock.
#[derive(Debug)]
pub struct Session {
    local6: TransportAddr6,
    remote6: TransportAddr6,
    local4: TransportAddr4,
    remote4: TransportAddr4,
    proto: Protocol,
    bib: BibRef,

    /// Opaque connection-state token; the tables pass it through to the
    /// expiry classifier without interpreting it.
    state: AtomicU8,
    /// Nanoseconds since the owning table's epoch, stamped on every refresh.
    update_time: AtomicU64,
    class: AtomicU8,
    queue_key: AtomicU64,
}

impl Session {
    pub fn new(
        local6: TransportAddr6,
        remote6: TransportAddr6,
        local4: TransportAddr4,
        remote4: TransportAddr4,
        proto: Protocol,
        bib: BibRef,
    ) -> Arc<Self> {
        Arc::new(Self {
            local6,
            remote6,
            local4,
            remote4,
            proto,
            bib,
            state: AtomicU8::new(0),
            update_time: AtomicU64::new(0),
            class: AtomicU8::new(CLASS_DETACHED),
            queue_key: AtomicU64::new(0),
        })
    }

    pub fn local6(&self) -> TransportAddr6 {
        self.local6
    }

    pub fn remote6(&self) -> TransportAddr6 {
        self.remote6
    }

    pub fn local4(&self) -> TransportAddr4 {
        self.local4
    }

    pub fn remote4(&self) -> TransportAddr4 {
        self.remote4
    }

    pub fn proto(&self) -> Protocol {
        self.proto
    }

    pub fn bib(&self) -> &BibEntry {
        &self.bib
    }

    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    pub fn set_state(&self, state: u8) {
        self.state.store(state, Ordering::Release);
    }

    /// The expiry class currently holding the session, if any.
    pub fn expirer(&self) -> Option<ExpiryClass> {
        match self.class.load(Ordering::Acquire) {
            CLASS_ESTABLISHED => Some(ExpiryClass::Established),
            CLASS_TRANSITORY => Some(ExpiryClass::Transitory),
            _ => None,
        }
    }

    fn set_expirer(&self, class: Option<ExpiryClass>) {
        let encoded = match class {
            None => CLASS_DETACHED,
            Some(ExpiryClass::Established) => CLASS_ESTABLISHED,
            Some(ExpiryClass::Transitory) => CLASS_TRANSITORY,
        };
        self.class.store(encoded, Ordering::Release);
    }
}

/// The pending-SYN queue consulted before a session is admitted.
pub trait PacketQueue: Send + Sync {
    /// Drops any packet still queued for `session`.
    fn remove(&self, session: &Session) -> Result<(), QueueBusy>;
}

/// The packet queue refused to release its packet for this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("packet queue is busy")]
pub struct QueueBusy;

/// For tables without a pending-packet queue.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoQueue;

impl PacketQueue for NoQueue {
    fn remove(&self, _: &Session) -> Result<(), QueueBusy> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InsertError {
    /// One of the two indices already holds a session for this 4-tuple.
    #[error("session already exists")]
    AlreadyExists,
    #[error(transparent)]
    QueueBusy(#[from] QueueBusy),
}

/// The session was asked about its timeout while no expiry class holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("session is not attached to an expirer")]
pub struct Detached;

/// The outcome of one cleaner pass.
#[derive(Debug)]
#[must_use]
pub struct Sweep {
    /// Sessions the caller must send a probe packet for. Each carries a
    /// reference that is released by dropping the list.
    pub probes: SmallVec<[Arc<Session>; 4]>,
    /// Timers to re-arm.
    pub wakes: SmallVec<[Wake; 2]>,
}

struct Queue {
    /// Sessions in refresh order, which the monotonic clock makes update-time
    /// order: refreshed sessions always re-enter at the tail.
    sessions: OrderedIndex<u64, Session>,
    /// The deadline the caller's timer is currently armed at, if any.
    scheduled: Option<Instant>,
}

struct State {
    tree6: OrderedIndex<Key6, Session>,
    tree4: OrderedIndex<Key4, Session>,
    queues: [Queue; 2],
    seq: u64,
    count: u64,
}

/// The per-protocol session table: who every binding is currently talking to,
/// indexed by both 4-tuple halves, with per-class expiry.
pub struct SessionTable {
    proto: Protocol,
    epoch: Instant,
    state: Mutex<State>,
    expirers: [Expirer; 2],
    queue: Arc<dyn PacketQueue>,
}

impl SessionTable {
    pub fn new(
        proto: Protocol,
        established: ExpirerConfig,
        transitory: ExpirerConfig,
        queue: Arc<dyn PacketQueue>,
    ) -> Self {
        Self {
            proto,
            epoch: Instant::now(),
            state: Mutex::new(State {
                tree6: OrderedIndex::new(),
                tree4: OrderedIndex::new(),
                queues: [
                    Queue {
                        sessions: OrderedIndex::new(),
                        scheduled: None,
                    },
                    Queue {
                        sessions: OrderedIndex::new(),
                        scheduled: None,
                    },
                ],
                seq: 0,
                count: 0,
            }),
            expirers: [Expirer::new(established), Expirer::new(transitory)],
            queue,
        }
    }

    pub fn proto(&self) -> Protocol {
        self.proto
    }

    /// Finds the session the packet described by `tuple` belongs to.
    ///
    /// A hit takes a reference for the caller.
    pub fn lookup(&self, tuple: &Tuple) -> Option<Arc<Session>> {
        debug_assert_eq!(tuple.proto(), self.proto);

        let state = self.state.lock();

        match tuple {
            Tuple::V6 { src, dst, .. } => state.tree6.find(&(*dst, *src)).cloned(),
            Tuple::V4 { src, dst, .. } => state.tree4.find(&(*dst, *src)).cloned(),
        }
    }

    /// Endpoint-independent filtering: is *any* session talking to the
    /// tuple's source address, on any source port, through the tuple's
    /// destination?
    pub fn allow(&self, tuple: &Tuple) -> bool {
        let Tuple::V4 { src, dst, .. } = tuple else {
            debug_assert!(false, "allow takes an IPv4 tuple");
            return false;
        };

        let probe = (*dst, TransportAddr4::new(src.addr, 0));
        let state = self.state.lock();

        state
            .tree4
            .iter_from(Some(&probe), true)
            .next()
            .is_some_and(|(key, _)| key.0 == *dst && key.1.addr == src.addr)
    }

    /// Admits `session` into the table and its first expiry class.
    ///
    /// The pending-packet queue is consulted first; a refusal aborts the
    /// insert. Returns the wake to arm if the class timer was idle.
    #[must_use = "the returned wake must be armed"]
    pub fn add(
        &self,
        session: &Arc<Session>,
        class: ExpiryClass,
        now: Instant,
    ) -> Result<Option<Wake>, InsertError> {
        debug_assert_eq!(session.proto(), self.proto);

        self.queue.remove(session)?;

        let mut state = self.state.lock();

        let key6 = (session.local6(), session.remote6());
        let key4 = (session.local4(), session.remote4());

        if state.tree6.insert_unique(key6, Arc::clone(session)).is_err() {
            return Err(InsertError::AlreadyExists);
        }

        if state.tree4.insert_unique(key4, Arc::clone(session)).is_err() {
            state.tree6.erase(&key6);
            return Err(InsertError::AlreadyExists);
        }

        let needs_commit = Self::set_timer_locked(&mut state, session, class, self.rel(now));
        state.count += 1;
        debug_assert_eq!(state.tree6.len(), state.tree4.len());
        drop(state);

        self.log_session(session, "Added session");

        Ok(needs_commit.then(|| self.commit_timer(class, now)))
    }

    /// Refreshes `session` into `class`, stamping it with `now`.
    ///
    /// The refreshed session re-enters its queue at the tail. Sessions that
    /// have already been excised are left alone. Returns the wake to arm if
    /// the class timer was idle.
    #[must_use = "the returned wake must be armed"]
    pub fn set_timer(
        &self,
        session: &Arc<Session>,
        class: ExpiryClass,
        now: Instant,
    ) -> Option<Wake> {
        let mut state = self.state.lock();

        if session.expirer().is_none() {
            return None;
        }

        let needs_commit = Self::set_timer_locked(&mut state, session, class, self.rel(now));
        drop(state);

        needs_commit.then(|| self.commit_timer(class, now))
    }

    /// The current timeout of the class holding `session`.
    pub fn timeout_of(&self, session: &Session) -> Result<Duration, Detached> {
        match session.expirer() {
            Some(class) => Ok(self.expirer(class).timeout()),
            None => Err(Detached),
        }
    }

    pub fn set_timeout(&self, class: ExpiryClass, timeout: Duration) {
        self.expirer(class).set_timeout(timeout);
    }

    /// Expires the head of `class`'s queue, given that its timer fired at
    /// `now`.
    ///
    /// Expired sessions are classified by the class policy under the lock;
    /// references are released and probes handed out only after it is gone.
    pub fn handle_timer(&self, class: ExpiryClass, now: Instant) -> Sweep {
        let expirer = self.expirer(class);
        let timeout_nanos = expirer.timeout().as_nanos() as u64;
        let rel_now = self.rel(now);

        let mut state = self.state.lock();
        state.queues[class.idx()].scheduled = None;

        // The queue is sorted by update time, so everything expired sits at
        // the head. Collect first, classify after; the verdicts mutate the
        // queues under our feet otherwise.
        let mut expired = Vec::new();
        for (_, session) in state.queues[class.idx()].sessions.iter_from(None, false) {
            if session.update_time.load(Ordering::Acquire) + timeout_nanos > rel_now {
                break;
            }
            expired.push(Arc::clone(session));
        }

        let mut dead = Vec::new();
        let mut probes = SmallVec::new();
        for session in expired {
            match expirer.policy.on_expire(&session) {
                Verdict::Die => {
                    self.remove_locked(&mut state, &session);
                    dead.push(session);
                }
                Verdict::Probe => {
                    Self::set_timer_locked(
                        &mut state,
                        &session,
                        ExpiryClass::Transitory,
                        rel_now,
                    );
                    probes.push(session);
                }
            }
        }
        drop(state);

        // References die outside the lock: a session's drop releases its BIB
        // pin, which may take the BIB table's lock to detach a dead binding.
        drop(dead);

        let wakes = self.update_timers(now);

        Sweep { probes, wakes }
    }

    /// Re-arms both classes from their queue heads; an empty queue disarms.
    pub fn update_timers(&self, now: Instant) -> SmallVec<[Wake; 2]> {
        let mut wakes = SmallVec::new();
        let mut state = self.state.lock();

        for class in [ExpiryClass::Established, ExpiryClass::Transitory] {
            let timeout = self.expirer(class).timeout();
            let queue = &mut state.queues[class.idx()];

            let Some(head) = queue.sessions.first() else {
                queue.scheduled = None;
                continue;
            };

            let death = self.epoch
                + Duration::from_nanos(head.update_time.load(Ordering::Acquire))
                + timeout;
            let deadline = death.max(now + MIN_TIMER_SLEEP);
            queue.scheduled = Some(deadline);
            wakes.push(Wake { class, deadline });
        }

        wakes
    }

    /// In-order traversal over the IPv4 index, strictly after the
    /// `(local, remote)` offset pair.
    ///
    /// The lock is held for the whole walk; `f` must not block or call back
    /// into the table.
    pub fn foreach(
        &self,
        offset: Option<(TransportAddr4, TransportAddr4)>,
        mut f: impl FnMut(&Arc<Session>) -> ControlFlow<()>,
    ) {
        let state = self.state.lock();

        for (_, session) in state.tree4.iter_from(offset.as_ref(), false) {
            if f(session).is_break() {
                break;
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.state.lock().count
    }

    /// Excises every session riding on `bib`, i.e. whose translator-side
    /// IPv4 transport address equals the binding's.
    pub fn delete_by_bib(&self, bib: &BibEntry) -> usize {
        let local = bib.ipv4();
        let start = (local, TransportAddr4::new(Ipv4Addr::UNSPECIFIED, 0));

        self.excise(Some(start), |key| key.0 == local)
    }

    /// Excises every session whose translator-side IPv4 address falls inside
    /// `prefix`.
    pub fn delete_by_prefix4(&self, prefix: Ipv4Network) -> usize {
        let base = TransportAddr4::new(prefix.network_address(), 0);
        let start = (base, TransportAddr4::new(Ipv4Addr::UNSPECIFIED, 0));

        self.excise(Some(start), move |key| prefix.contains(key.0.addr))
    }

    /// Excises everything.
    pub fn flush(&self) -> usize {
        self.excise(None, |_| true)
    }

    fn excise(&self, start: Option<Key4>, mut keep_going: impl FnMut(&Key4) -> bool) -> usize {
        let mut state = self.state.lock();

        let victims = state
            .tree4
            .iter_from(start.as_ref(), true)
            .take_while(|&(key, _)| keep_going(key))
            .map(|(_, session)| Arc::clone(session))
            .collect::<Vec<_>>();

        for session in &victims {
            self.remove_locked(&mut state, session);
        }
        drop(state);

        let deleted = victims.len();
        drop(victims);
        tracing::debug!(target: "session", "Deleted {deleted} sessions");

        deleted
    }

    fn expirer(&self, class: ExpiryClass) -> &Expirer {
        &self.expirers[class.idx()]
    }

    fn rel(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_nanos() as u64
    }

    /// Stamps and (re)queues `session` on `class`. Returns whether the class
    /// timer still needs to be armed. The state lock must be held.
    fn set_timer_locked(
        state: &mut State,
        session: &Arc<Session>,
        class: ExpiryClass,
        rel_now: u64,
    ) -> bool {
        Self::unlink_locked(state, session);

        session.update_time.store(rel_now, Ordering::Release);
        state.seq += 1;
        let key = state.seq;
        session.queue_key.store(key, Ordering::Release);
        session.set_expirer(Some(class));

        let queue = &mut state.queues[class.idx()];
        let linked = queue.sessions.insert_unique(key, Arc::clone(session));
        debug_assert!(linked.is_ok());

        queue.scheduled.is_none()
    }

    fn unlink_locked(state: &mut State, session: &Session) {
        if let Some(class) = session.expirer() {
            state.queues[class.idx()]
                .sessions
                .erase(&session.queue_key.load(Ordering::Acquire));
        }
    }

    /// Unlinks `session` from both indices and its queue. The state lock
    /// must be held; the caller drops the collected reference after
    /// releasing it.
    fn remove_locked(&self, state: &mut State, session: &Arc<Session>) {
        let in6 = state
            .tree6
            .erase(&(session.local6(), session.remote6()))
            .is_some();
        let in4 = state
            .tree4
            .erase(&(session.local4(), session.remote4()))
            .is_some();
        debug_assert!(in6, "faulty IPv6 index");
        debug_assert!(in4, "faulty IPv4 index");

        Self::unlink_locked(state, session);
        session.set_expirer(None);
        state.count = state.count.saturating_sub(1);

        self.log_session(session, "Forgot session");
    }

    /// Publishes the armed deadline for `class` and returns the wake the
    /// caller must schedule. Must be called without the state lock held; the
    /// caller's timer has its own synchronization.
    fn commit_timer(&self, class: ExpiryClass, now: Instant) -> Wake {
        let timeout = self.expirer(class).timeout().max(MIN_TIMER_SLEEP);
        let deadline = now + timeout;

        self.state.lock().queues[class.idx()].scheduled = Some(deadline);

        Wake { class, deadline }
    }

    fn log_session(&self, session: &Session, action: &str) {
        tracing::debug!(
            target: "session",
            local6 = %session.local6(),
            remote6 = %session.remote6(),
            local4 = %session.local4(),
            remote4 = %session.remote4(),
            proto = %self.proto,
            "{action}"
        );
    }

    /// Update-time stamps of `class`'s queue, head to tail.
    #[cfg(any(test, feature = "proptest"))]
    pub fn queue_times(&self, class: ExpiryClass) -> Vec<Duration> {
        self.state.lock().queues[class.idx()]
            .sessions
            .iter_from(None, false)
            .map(|(_, session)| {
                Duration::from_nanos(session.update_time.load(Ordering::Acquire))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expiry::DieOnTimeout;
    use std::net::Ipv6Addr;

    fn v6(host: u16, port: u16) -> TransportAddr6 {
        TransportAddr6::new(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, host), port)
    }

    fn v4(last: u8, port: u16) -> TransportAddr4 {
        TransportAddr4::new(Ipv4Addr::new(192, 0, 2, last), port)
    }

    fn table() -> SessionTable {
        SessionTable::new(
            Protocol::Udp,
            ExpirerConfig::new(Duration::from_secs(300), Arc::new(DieOnTimeout)),
            ExpirerConfig::new(Duration::from_secs(30), Arc::new(DieOnTimeout)),
            Arc::new(NoQueue),
        )
    }

    fn session(remote_port4: u16) -> Arc<Session> {
        let bib = BibEntry::new(v6(1, 10000), v4(5, 40000), Protocol::Udp, false);
        Session::new(
            v6(1, 10000),
            v6(99, remote_port4),
            v4(5, 40000),
            v4(77, remote_port4),
            Protocol::Udp,
            bib,
        )
    }

    fn v4_tuple(session: &Session) -> Tuple {
        Tuple::V4 {
            src: session.remote4(),
            dst: session.local4(),
            proto: session.proto(),
        }
    }

    #[test]
    fn added_session_is_reachable_under_both_tuples() {
        let table = table();
        let now = Instant::now();
        let session = session(33333);

        let wake = table.add(&session, ExpiryClass::Established, now).unwrap();

        assert!(wake.is_some());
        assert_eq!(table.count(), 1);

        let by_v4 = table.lookup(&v4_tuple(&session)).unwrap();
        assert!(Arc::ptr_eq(&by_v4, &session));

        let by_v6 = table
            .lookup(&Tuple::V6 {
                src: session.remote6(),
                dst: session.local6(),
                proto: Protocol::Udp,
            })
            .unwrap();
        assert!(Arc::ptr_eq(&by_v6, &session));
    }

    #[test]
    fn duplicate_tuple_is_rejected() {
        let table = table();
        let now = Instant::now();
        let session = session(33333);
        let _ = table.add(&session, ExpiryClass::Established, now).unwrap();

        let duplicate = session.clone();
        let error = table
            .add(&duplicate, ExpiryClass::Established, now)
            .unwrap_err();

        assert_eq!(error, InsertError::AlreadyExists);
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn refused_packet_queue_aborts_the_insert() {
        struct Busy;

        impl PacketQueue for Busy {
            fn remove(&self, _: &Session) -> Result<(), QueueBusy> {
                Err(QueueBusy)
            }
        }

        let table = SessionTable::new(
            Protocol::Udp,
            ExpirerConfig::new(Duration::from_secs(300), Arc::new(DieOnTimeout)),
            ExpirerConfig::new(Duration::from_secs(30), Arc::new(DieOnTimeout)),
            Arc::new(Busy),
        );

        let error = table
            .add(&session(33333), ExpiryClass::Established, Instant::now())
            .unwrap_err();

        assert_eq!(error, InsertError::QueueBusy(QueueBusy));
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn second_add_reuses_the_armed_timer() {
        let table = table();
        let now = Instant::now();

        let first = table
            .add(&session(33333), ExpiryClass::Established, now)
            .unwrap();
        let second = table
            .add(&session(33334), ExpiryClass::Established, now)
            .unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[test]
    fn refresh_moves_the_session_to_the_tail() {
        let table = table();
        let epoch = Instant::now();
        let a = session(1);
        let b = session(2);
        let _ = table.add(&a, ExpiryClass::Established, epoch).unwrap();
        let _ = table
            .add(&b, ExpiryClass::Established, epoch + Duration::from_secs(1))
            .unwrap();

        let _ = table.set_timer(&a, ExpiryClass::Established, epoch + Duration::from_secs(2));

        let times = table.queue_times(ExpiryClass::Established);
        assert_eq!(times.len(), 2);
        assert!(times[0] <= times[1]);
        assert_eq!(*times.last().unwrap(), stamp(&a));
    }

    fn stamp(session: &Session) -> Duration {
        Duration::from_nanos(session.update_time.load(Ordering::Acquire))
    }

    #[test]
    fn refreshing_a_detached_session_is_a_no_op() {
        let table = table();
        let session = session(1);

        let wake = table.set_timer(&session, ExpiryClass::Established, Instant::now());

        assert!(wake.is_none());
        assert!(table.queue_times(ExpiryClass::Established).is_empty());
    }

    #[test]
    fn timeout_of_requires_an_attached_session() {
        let table = table();
        let session = session(1);

        assert_eq!(table.timeout_of(&session), Err(Detached));

        let _ = table
            .add(&session, ExpiryClass::Established, Instant::now())
            .unwrap();

        assert_eq!(table.timeout_of(&session), Ok(Duration::from_secs(300)));
    }

    #[test]
    fn allow_matches_on_remote_address_not_port() {
        let table = table();
        let session = session(33333);
        let _ = table
            .add(&session, ExpiryClass::Established, Instant::now())
            .unwrap();

        let other_port = Tuple::V4 {
            src: TransportAddr4::new(session.remote4().addr, 55555),
            dst: session.local4(),
            proto: Protocol::Udp,
        };
        let other_host = Tuple::V4 {
            src: v4(78, 33333),
            dst: session.local4(),
            proto: Protocol::Udp,
        };

        assert!(table.allow(&other_port));
        assert!(!table.allow(&other_host));
    }

    #[test]
    fn expired_sessions_die_in_queue_order() {
        let table = table();
        table.set_timeout(ExpiryClass::Established, Duration::from_secs(5));
        let epoch = Instant::now();
        let a = session(1);
        let b = session(2);
        let _ = table.add(&a, ExpiryClass::Established, epoch).unwrap();
        let _ = table
            .add(&b, ExpiryClass::Established, epoch + Duration::from_secs(3))
            .unwrap();

        let sweep = table.handle_timer(ExpiryClass::Established, epoch + Duration::from_secs(6));

        assert!(sweep.probes.is_empty());
        assert_eq!(table.count(), 1);
        assert!(table.lookup(&v4_tuple(&a)).is_none());
        assert!(table.lookup(&v4_tuple(&b)).is_some());
    }

    #[test]
    fn unexpired_head_stops_the_sweep_without_wakes_for_empty_queues() {
        let table = table();
        let epoch = Instant::now();
        let session = session(1);
        let _ = table.add(&session, ExpiryClass::Established, epoch).unwrap();

        let sweep = table.handle_timer(ExpiryClass::Established, epoch + Duration::from_secs(1));

        assert_eq!(table.count(), 1);
        assert_eq!(sweep.wakes.len(), 1);
        assert_eq!(sweep.wakes[0].class, ExpiryClass::Established);
    }

    #[test]
    fn probe_verdict_moves_the_session_to_transitory() {
        struct ProbeFirst;

        impl crate::expiry::ExpiryPolicy for ProbeFirst {
            fn on_expire(&self, _: &Session) -> Verdict {
                Verdict::Probe
            }
        }

        let table = SessionTable::new(
            Protocol::Tcp,
            ExpirerConfig::new(Duration::from_secs(5), Arc::new(ProbeFirst)),
            ExpirerConfig::new(Duration::from_secs(5), Arc::new(DieOnTimeout)),
            Arc::new(NoQueue),
        );
        let epoch = Instant::now();
        let bib = BibEntry::new(v6(1, 10000), v4(5, 40000), Protocol::Tcp, false);
        let session = Session::new(
            v6(99, 20000),
            v6(1, 10000),
            v4(5, 40000),
            v4(77, 33333),
            Protocol::Tcp,
            bib,
        );
        let _ = table.add(&session, ExpiryClass::Established, epoch).unwrap();

        let sweep = table.handle_timer(ExpiryClass::Established, epoch + Duration::from_secs(6));

        assert_eq!(sweep.probes.len(), 1);
        assert_eq!(session.expirer(), Some(ExpiryClass::Transitory));
        assert_eq!(table.count(), 1);
        assert!(
            sweep
                .wakes
                .iter()
                .any(|wake| wake.class == ExpiryClass::Transitory)
        );
    }

    #[test]
    fn delete_by_prefix_spares_other_prefixes() {
        let table = table();
        let now = Instant::now();
        let inside = session(1);
        let outside_local4 = TransportAddr4::new(Ipv4Addr::new(198, 51, 100, 1), 40001);
        let bib = BibEntry::new(v6(2, 10001), outside_local4, Protocol::Udp, false);
        let outside = Session::new(
            v6(2, 10001),
            v6(98, 20000),
            outside_local4,
            v4(77, 2),
            Protocol::Udp,
            bib,
        );
        let _ = table.add(&inside, ExpiryClass::Established, now).unwrap();
        let _ = table.add(&outside, ExpiryClass::Established, now).unwrap();

        let prefix = Ipv4Network::new(Ipv4Addr::new(192, 0, 2, 0), 24).unwrap();
        let deleted = table.delete_by_prefix4(prefix);

        assert_eq!(deleted, 1);
        assert_eq!(table.count(), 1);
        assert!(table.lookup(&v4_tuple(&inside)).is_none());
        assert!(table.lookup(&v4_tuple(&outside)).is_some());
    }

    #[test]
    fn flush_empties_the_table_and_detaches_every_session() {
        let table = table();
        let now = Instant::now();
        let a = session(1);
        let b = session(2);
        let _ = table.add(&a, ExpiryClass::Established, now).unwrap();
        let _ = table.add(&b, ExpiryClass::Transitory, now).unwrap();

        let deleted = table.flush();

        assert_eq!(deleted, 2);
        assert_eq!(table.count(), 0);
        assert_eq!(a.expirer(), None);
        assert_eq!(b.expirer(), None);
        assert!(table.queue_times(ExpiryClass::Established).is_empty());
        assert!(table.queue_times(ExpiryClass::Transitory).is_empty());
    }

    #[test]
    fn foreach_stops_early_and_honors_the_offset() {
        let table = table();
        let now = Instant::now();
        for port in [1, 2, 3] {
            let _ = table.add(&session(port), ExpiryClass::Established, now).unwrap();
        }

        let mut seen = Vec::new();
        let offset = (v4(5, 40000), v4(77, 1));
        table.foreach(Some(offset), |session| {
            seen.push(session.remote4().port);
            if seen.len() == 1 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });

        assert_eq!(seen, vec![2]);
    }

    #[test]
    fn update_timers_clamps_to_the_minimum_sleep() {
        let table = table();
        table.set_timeout(ExpiryClass::Established, Duration::ZERO);
        let epoch = Instant::now();
        let session = session(1);
        let _ = table.add(&session, ExpiryClass::Established, epoch).unwrap();

        let now = epoch + Duration::from_secs(10);
        let wakes = table.update_timers(now);

        assert_eq!(wakes.len(), 1);
        assert!(wakes[0].deadline >= now + MIN_TIMER_SLEEP);
    }
}
