//! Storage for a session's streams: a slab keyed by a compact [`Key`],
//! indexed by the wire-level [`StreamId`]. Adapted from
//! `carllerche-h2`'s `proto::streams::store`, generalized from an
//! HTTP/2 `Stream<B>` (a request/response body buffer) to our
//! [`StreamEntry`] (a procedure invocation's full lifecycle).

use super::stream::StreamEntry;
use crate::id::StreamId;
use fnv::FnvHashMap;
use std::ops;

/// A "pointer" to an entry in the store: a stable handle independent of
/// `StreamId` lookups, the way h2's `store::Ptr` lets callers hold a
/// resolved reference across a borrow of the slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key(usize);

#[derive(Debug, Default)]
pub struct Store {
    slab: slab::Slab<StreamEntry>,
    ids: FnvHashMap<StreamId, Key>,
}

pub enum Entry<'a> {
    Occupied(Key),
    Vacant(VacantEntry<'a>),
}

pub struct VacantEntry<'a> {
    store: &'a mut Store,
    id: StreamId,
}

impl<'a> VacantEntry<'a> {
    pub fn insert(self, value: StreamEntry) -> Key {
        self.store.insert(self.id, value)
    }
}

impl Store {
    pub fn new() -> Self {
        Store {
            slab: slab::Slab::new(),
            ids: FnvHashMap::default(),
        }
    }

    pub fn insert(&mut self, id: StreamId, value: StreamEntry) -> Key {
        let idx = self.slab.insert(value);
        let key = Key(idx);
        self.ids.insert(id, key);
        key
    }

    pub fn find(&self, id: &StreamId) -> Option<Key> {
        self.ids.get(id).copied()
    }

    pub fn find_entry(&mut self, id: StreamId) -> Entry<'_> {
        match self.ids.get(&id).copied() {
            Some(key) => Entry::Occupied(key),
            None => Entry::Vacant(VacantEntry { store: self, id }),
        }
    }

    pub fn get(&self, key: Key) -> Option<&StreamEntry> {
        self.slab.get(key.0)
    }

    pub fn get_mut(&mut self, key: Key) -> Option<&mut StreamEntry> {
        self.slab.get_mut(key.0)
    }

    /// Removes the entry both from the slab and from the id index.
    /// Called once a stream's both halves are closed or it has finished
    /// abort processing (spec.md §4.4).
    pub fn remove(&mut self, id: &StreamId) -> Option<StreamEntry> {
        let key = self.ids.remove(id)?;
        Some(self.slab.remove(key.0))
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &StreamId> {
        self.ids.keys()
    }
}

impl ops::Index<Key> for Store {
    type Output = StreamEntry;

    fn index(&self, key: Key) -> &StreamEntry {
        &self.slab[key.0]
    }
}

impl ops::IndexMut<Key> for Store {
    fn index_mut(&mut self, key: Key) -> &mut StreamEntry {
        &mut self.slab[key.0]
    }
}
