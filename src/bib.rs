use crate::addr::{Protocol, TransportAddr4, TransportAddr6};
use crate::index::OrderedIndex;
use ip_network::Ipv4Network;
use parking_lot::Mutex;
use std::ops::{ControlFlow, Deref, RangeInclusive};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// An opaque handle into the external per-IPv4-host port pool.
///
/// The tables store it on behalf of the pool manager and never interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolHandle(pub u64);

/// A single inside-IPv6 to outside-IPv4 binding.
///
/// An entry is either indexed by exactly one [`BibTable`] (under both of its
/// orders) or detached. Once indexed, everything but the bookkeeping fields
/// is immutable.
pub struct BibEntry {
    ipv6: TransportAddr6,
    ipv4: TransportAddr4,
    proto: Protocol,
    is_static: bool,

    /// One reference for the indexing table, one for the administrative pin
    /// of a static entry, one per outstanding [`BibRef`].
    refcount: AtomicU64,
    /// Set until the administrative pin has been flushed.
    pinned: AtomicBool,
    /// The table currently indexing this entry. Assigned only once both
    /// indices have accepted the entry; cleared on removal.
    table: Mutex<Option<Weak<Shared>>>,
    pool: Mutex<Option<PoolHandle>>,
}

impl BibEntry {
    /// Creates a detached entry and hands its first reference to the caller.
    ///
    /// Static entries are born with the administrative pin on top; it stays
    /// until [`BibTable::flush`] or [`BibTable::delete_in_range`] drops it.
    pub fn new(
        ipv6: TransportAddr6,
        ipv4: TransportAddr4,
        proto: Protocol,
        is_static: bool,
    ) -> BibRef {
        BibRef {
            entry: Arc::new(BibEntry {
                ipv6,
                ipv4,
                proto,
                is_static,
                refcount: AtomicU64::new(if is_static { 2 } else { 1 }),
                pinned: AtomicBool::new(is_static),
                table: Mutex::new(None),
                pool: Mutex::new(None),
            }),
        }
    }

    pub fn ipv6(&self) -> TransportAddr6 {
        self.ipv6
    }

    pub fn ipv4(&self) -> TransportAddr4 {
        self.ipv4
    }

    pub fn proto(&self) -> Protocol {
        self.proto
    }

    pub fn is_static(&self) -> bool {
        self.is_static
    }

    pub fn refcount(&self) -> u64 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn pool(&self) -> Option<PoolHandle> {
        *self.pool.lock()
    }

    pub fn set_pool(&self, handle: Option<PoolHandle>) {
        *self.pool.lock() = handle;
    }
}

impl PartialEq for BibEntry {
    fn eq(&self, other: &Self) -> bool {
        self.ipv6 == other.ipv6 && self.ipv4 == other.ipv4 && self.proto == other.proto
    }
}

impl Eq for BibEntry {}

impl std::fmt::Debug for BibEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BibEntry")
            .field("ipv6", &self.ipv6)
            .field("ipv4", &self.ipv4)
            .field("proto", &self.proto)
            .field("is_static", &self.is_static)
            .finish_non_exhaustive()
    }
}

/// A counted handle on a [`BibEntry`].
///
/// Cloning takes another reference, dropping releases one. Releasing the last
/// reference besides the table's own hold detaches the entry from its table,
/// which acquires that table's lock; a guard must therefore never be dropped
/// while a table lock is held.
#[derive(Debug)]
pub struct BibRef {
    entry: Arc<BibEntry>,
}

impl Deref for BibRef {
    type Target = BibEntry;

    fn deref(&self) -> &BibEntry {
        &self.entry
    }
}

impl Clone for BibRef {
    fn clone(&self) -> Self {
        get(&self.entry)
    }
}

impl Drop for BibRef {
    fn drop(&mut self) {
        put(&self.entry);
    }
}

fn get(entry: &Arc<BibEntry>) -> BibRef {
    entry.refcount.fetch_add(1, Ordering::AcqRel);

    BibRef {
        entry: Arc::clone(entry),
    }
}

/// Ordinary reference drop.
///
/// When only the table's own hold remains, the entry removes itself from its
/// table. Must not be called with that table's lock held; [`Shared::put_locked`]
/// is the variant for call sites that already hold it.
fn put(entry: &Arc<BibEntry>) {
    if entry.refcount.fetch_sub(1, Ordering::AcqRel) != 2 {
        return;
    }

    let shared = entry.table.lock().as_ref().and_then(Weak::upgrade);
    let Some(shared) = shared else {
        return;
    };

    let mut state = shared.state.lock();

    // A lookup may have revived the entry while we were waiting for the lock.
    let revived = entry.refcount.load(Ordering::Acquire) != 1;
    let attached_here = entry
        .table
        .lock()
        .as_ref()
        .is_some_and(|weak| Weak::ptr_eq(weak, &Arc::downgrade(&shared)));

    if !revived && attached_here {
        shared.rm_locked(&mut state, entry);
    }
}

struct Shared {
    proto: Protocol,
    state: Mutex<State>,
    log_changes: AtomicBool,
}

struct State {
    tree6: OrderedIndex<TransportAddr6, BibEntry>,
    tree4: OrderedIndex<TransportAddr4, BibEntry>,
    count: u64,
}

impl Shared {
    /// Unlinks `entry` from both indices and drops the table's own hold.
    /// The state lock must be held.
    fn rm_locked(&self, state: &mut State, entry: &Arc<BibEntry>) {
        let in6 = state.tree6.erase(&entry.ipv6).is_some();
        let in4 = state.tree4.erase(&entry.ipv4).is_some();
        debug_assert!(in6, "faulty IPv6 index");
        debug_assert!(in4, "faulty IPv4 index");
        if !in6 && !in4 {
            return;
        }

        *entry.table.lock() = None;
        state.count -= 1;
        entry.refcount.fetch_sub(1, Ordering::AcqRel);

        if self.log_changes.load(Ordering::Relaxed) {
            tracing::info!(
                target: "bib",
                "Forgot {} to {} ({})",
                entry.ipv6,
                entry.ipv4,
                entry.proto
            );
        }
    }

    /// Reference drop for call sites already holding the state lock.
    ///
    /// Returns whether the entry died.
    fn put_locked(&self, state: &mut State, entry: &Arc<BibEntry>) -> bool {
        if entry.refcount.fetch_sub(1, Ordering::AcqRel) != 2 {
            return false;
        }

        self.rm_locked(state, entry);
        true
    }
}

/// One entry already holds the colliding transport address.
#[derive(Debug, thiserror::Error)]
#[error("binding already exists")]
pub struct AlreadyExists {
    /// The entry occupying one of the two indices, with a reference taken.
    pub existing: BibRef,
}

/// The per-protocol Binding Information Base: every inside-IPv6 transport
/// address currently mapped to an outside-IPv4 one, indexed under both.
pub struct BibTable {
    shared: Arc<Shared>,
}

impl BibTable {
    pub fn new(proto: Protocol) -> Self {
        Self {
            shared: Arc::new(Shared {
                proto,
                state: Mutex::new(State {
                    tree6: OrderedIndex::new(),
                    tree4: OrderedIndex::new(),
                    count: 0,
                }),
                log_changes: AtomicBool::new(false),
            }),
        }
    }

    pub fn proto(&self) -> Protocol {
        self.shared.proto
    }

    pub fn lookup6(&self, addr: &TransportAddr6) -> Option<BibRef> {
        let state = self.shared.state.lock();

        state.tree6.find(addr).map(get)
    }

    pub fn lookup4(&self, addr: &TransportAddr4) -> Option<BibRef> {
        let state = self.shared.state.lock();

        state.tree4.find(addr).map(get)
    }

    pub fn contains4(&self, addr: &TransportAddr4) -> bool {
        self.shared.state.lock().tree4.find(addr).is_some()
    }

    /// Indexes `entry` under both of its transport addresses.
    ///
    /// The insert is two-phase: a collision on the IPv4 index rolls the IPv6
    /// insert back, so the entry is in both indices or in neither. The entry's
    /// back-reference is assigned only once success is imminent; an ordinary
    /// drop of a rejected entry must not try to unlink it.
    pub fn add(&self, entry: &BibRef) -> Result<(), AlreadyExists> {
        debug_assert_eq!(entry.proto, self.shared.proto);

        let mut state = self.shared.state.lock();

        if let Err(existing) = state
            .tree6
            .insert_unique(entry.ipv6, Arc::clone(&entry.entry))
        {
            tracing::debug!(target: "bib", "IPv6 index failed");
            return Err(AlreadyExists {
                existing: get(&existing),
            });
        }

        if let Err(existing) = state
            .tree4
            .insert_unique(entry.ipv4, Arc::clone(&entry.entry))
        {
            state.tree6.erase(&entry.ipv6);
            tracing::debug!(target: "bib", "IPv4 index failed");
            return Err(AlreadyExists {
                existing: get(&existing),
            });
        }

        *entry.table.lock() = Some(Arc::downgrade(&self.shared));
        entry.refcount.fetch_add(1, Ordering::AcqRel);
        state.count += 1;
        debug_assert_eq!(state.tree6.len(), state.tree4.len());

        if self.shared.log_changes.load(Ordering::Relaxed) {
            tracing::info!(
                target: "bib",
                "Mapped {} to {} ({})",
                entry.ipv6,
                entry.ipv4,
                self.shared.proto
            );
        }

        Ok(())
    }

    /// Unlinks `entry` from the table.
    ///
    /// The caller keeps, and remains responsible for dropping, its own
    /// reference.
    pub fn remove(&self, entry: &BibRef) {
        let mut state = self.shared.state.lock();

        self.shared.rm_locked(&mut state, &entry.entry);
    }

    /// In-order traversal over the IPv4 index, strictly after `offset`.
    ///
    /// The lock is held for the whole walk; `f` must not block or call back
    /// into the table.
    pub fn foreach(
        &self,
        offset: Option<TransportAddr4>,
        mut f: impl FnMut(&BibEntry) -> ControlFlow<()>,
    ) {
        let state = self.shared.state.lock();

        for (_, entry) in state.tree4.iter_from(offset.as_ref(), false) {
            if f(entry).is_break() {
                break;
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.shared.state.lock().count
    }

    /// Drops the administrative pin of every static entry.
    ///
    /// Dynamic entries are left to expire through their sessions. Idempotent:
    /// a pin is only ever dropped once.
    pub fn flush(&self) {
        let mut state = self.shared.state.lock();

        let entries = state
            .tree4
            .iter_from(None, false)
            .map(|(_, entry)| Arc::clone(entry))
            .collect::<Vec<_>>();

        let mut deleted = 0;
        for entry in entries {
            if entry.pinned.swap(false, Ordering::AcqRel)
                && self.shared.put_locked(&mut state, &entry)
            {
                deleted += 1;
            }
        }

        tracing::debug!(target: "bib", "Deleted {deleted} BIB entries");
    }

    /// [`BibTable::flush`] restricted to the entries whose IPv4 address falls
    /// inside `prefix` and whose port falls inside `ports`.
    pub fn delete_in_range(&self, prefix: Ipv4Network, ports: RangeInclusive<u16>) {
        let offset = TransportAddr4::new(prefix.network_address(), *ports.start());

        let mut state = self.shared.state.lock();

        let entries = state
            .tree4
            .iter_from(Some(&offset), true)
            .take_while(|&(key, _)| prefix.contains(key.addr))
            .filter(|&(key, _)| ports.contains(&key.port))
            .map(|(_, entry)| Arc::clone(entry))
            .collect::<Vec<_>>();

        let mut deleted = 0;
        for entry in entries {
            if entry.pinned.swap(false, Ordering::AcqRel)
                && self.shared.put_locked(&mut state, &entry)
            {
                deleted += 1;
            }
        }

        tracing::debug!(target: "bib", "Deleted {deleted} BIB entries");
    }

    pub fn log_changes(&self) -> bool {
        self.shared.log_changes.load(Ordering::Relaxed)
    }

    pub fn set_log_changes(&self, log_changes: bool) {
        self.shared.log_changes.store(log_changes, Ordering::Relaxed);
    }
}
