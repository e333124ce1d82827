use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::ops::Bound;
use std::sync::Arc;

/// One of the two co-indices of a state table.
///
/// Both indices of a table alias the same `Arc`ed entries, which is what lets
/// a single entry be found under two different orders at once. The table is
/// responsible for keeping its indices mutually consistent; a partial insert
/// is rolled back by erasing the key that did go in.
#[derive(Debug)]
pub(crate) struct OrderedIndex<K, V> {
    map: BTreeMap<K, Arc<V>>,
}

impl<K, V> OrderedIndex<K, V>
where
    K: Ord + Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    pub(crate) fn find(&self, key: &K) -> Option<&Arc<V>> {
        self.map.get(key)
    }

    /// Links `value` under `key` unless the key is taken.
    ///
    /// On a collision nothing is linked and the entry already holding the key
    /// is returned.
    pub(crate) fn insert_unique(&mut self, key: K, value: Arc<V>) -> Result<(), Arc<V>> {
        match self.map.entry(key) {
            Entry::Occupied(existing) => Err(Arc::clone(existing.get())),
            Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(())
            }
        }
    }

    pub(crate) fn erase(&mut self, key: &K) -> Option<Arc<V>> {
        self.map.remove(key)
    }

    pub(crate) fn first(&self) -> Option<&Arc<V>> {
        self.map.first_key_value().map(|(_, value)| value)
    }

    /// In-order traversal starting at `offset` or at its successor.
    ///
    /// With `include_offset`, traversal begins at the first key `>= offset`,
    /// otherwise strictly after it. An offset that is not present starts at
    /// the successor position either way. No offset starts at the beginning.
    pub(crate) fn iter_from(
        &self,
        offset: Option<&K>,
        include_offset: bool,
    ) -> impl Iterator<Item = (&K, &Arc<V>)> {
        let lower = match offset {
            None => Bound::Unbounded,
            Some(key) if include_offset => Bound::Included(key.clone()),
            Some(key) => Bound::Excluded(key.clone()),
        };

        self.map.range((lower, Bound::Unbounded))
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }
}
