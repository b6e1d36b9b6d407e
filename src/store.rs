//! Per-type record store.

use crate::codec::{self, CountingReader};
use crate::container::{Catalog, ContainerCore};
use crate::error::{Result, StoreError};
use crate::integrity::Probe;
use crate::links::wiring::Holder;
use crate::links::ForeignKey;
use crate::shape::Record;
use crate::specialize::{specialization, Specialization};
use crate::types::{shared, EntityId, Shared, StoreStats};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::BTreeMap;
use std::io::{BufRead, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

struct StoreState<T> {
    records: BTreeMap<EntityId, Shared<T>>,
    last_id: i64,
}

/// All records of one type within a container.
///
/// Identities are assigned from a counter that only moves forward, so an
/// identity is never handed out twice while the store lives. Reads share
/// the store lock; `add`, `attach`, `remove` and `clear` take it exclusively.
/// Records handed out are wired on the way out.
pub struct Store<T: Record> {
    slot: &'static str,
    spec: Arc<Specialization<T>>,
    state: RwLock<StoreState<T>>,
    version: AtomicU64,
    container: OnceCell<Weak<ContainerCore>>,
}

impl<T: Record> Store<T> {
    pub(crate) fn new(slot: &'static str, spec: Arc<Specialization<T>>) -> Self {
        Self {
            slot,
            spec,
            state: RwLock::new(StoreState {
                records: BTreeMap::new(),
                last_id: 0,
            }),
            version: AtomicU64::new(0),
            container: OnceCell::new(),
        }
    }

    pub(crate) fn open(catalog: &Catalog, slot: &'static str) -> Result<OpenedStore> {
        let store = Arc::new(Self::new(slot, specialization::<T>(catalog)?));
        Ok(OpenedStore {
            any: store.clone(),
            erased: store,
        })
    }

    /// Slot this store is declared under.
    pub fn slot(&self) -> &'static str {
        self.slot
    }

    pub fn specialization(&self) -> &Arc<Specialization<T>> {
        &self.spec
    }

    /// Mutation counter, bumped by every insert, removal and load.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Highest identity handed out so far.
    pub fn last_id(&self) -> i64 {
        self.state.read_recursive().last_id
    }

    pub fn len(&self) -> usize {
        self.state.read_recursive().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    fn core(&self) -> Result<Arc<ContainerCore>> {
        self.container
            .get()
            .and_then(Weak::upgrade)
            .ok_or(StoreError::ContainerClosed)
    }

    pub(crate) fn identity_of(&self, record: &Shared<T>) -> EntityId {
        self.spec.identity(&record.read_recursive())
    }

    fn snapshot(&self) -> Vec<Shared<T>> {
        self.state.read_recursive().records.values().cloned().collect()
    }

    // --- Insertion ---

    /// Insert a new record under the next identity.
    pub fn add(&self, record: T) -> Result<Shared<T>> {
        let record = shared(record);
        self.add_shared(&record)?;
        Ok(record)
    }

    /// Insert an already shared record under the next identity.
    ///
    /// Fails if a record with the same identity is present; use
    /// [`attach_shared`](Self::attach_shared) to overwrite.
    pub fn add_shared(&self, record: &Shared<T>) -> Result<EntityId> {
        self.add_held(record, None)
    }

    pub(crate) fn add_held(&self, record: &Shared<T>, held: Option<Holder>) -> Result<EntityId> {
        let id = {
            let mut state = self.state.write();
            let mut guard = record.write();
            let current = self.spec.identity(&guard);
            if current.is_set() && state.records.contains_key(&current) {
                return Err(StoreError::DuplicateIdentity {
                    record: T::NAME,
                    id: current,
                });
            }
            state.last_id += 1;
            let id = EntityId(state.last_id);
            self.spec.set_identity(&mut guard, id);
            drop(guard);
            state.records.insert(id, Arc::clone(record));
            id
        };
        self.bump();
        self.wire_held(record, held)?;
        Ok(id)
    }

    /// Insert or overwrite a record at its own identity.
    pub fn attach(&self, record: T) -> Result<Shared<T>> {
        let record = shared(record);
        self.attach_shared(&record)?;
        Ok(record)
    }

    /// Insert or overwrite at the record's identity; records without one
    /// are added. The identity counter moves past any larger identity.
    pub fn attach_shared(&self, record: &Shared<T>) -> Result<EntityId> {
        self.attach_held(record, None)
    }

    /// [`attach_shared`](Self::attach_shared) from inside a chain that holds
    /// `held`'s write guard. The held record is re-inserted under its known
    /// identity and left unwired.
    pub(crate) fn attach_held(&self, record: &Shared<T>, held: Option<Holder>) -> Result<EntityId> {
        let id = match held.filter(|h| h.is(record)) {
            Some(h) => h.id,
            None => self.identity_of(record),
        };
        if !id.is_set() {
            return self.add_held(record, held);
        }
        {
            let mut state = self.state.write();
            state.records.insert(id, Arc::clone(record));
            if id.0 > state.last_id {
                state.last_id = id.0;
            }
        }
        self.bump();
        self.wire_held(record, held)?;
        Ok(id)
    }

    // --- Removal ---

    /// Remove by identity. No reference check is made; see
    /// [`delete`](Self::delete).
    pub fn remove(&self, record: &Shared<T>) -> bool {
        self.remove_key(self.identity_of(record)).is_some()
    }

    pub fn remove_key(&self, id: EntityId) -> Option<Shared<T>> {
        let removed = self.state.write().records.remove(&id);
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    /// Remove every listed record. Returns how many were present.
    pub fn remove_range<'a, I>(&self, records: I) -> usize
    where
        I: IntoIterator<Item = &'a Shared<T>>,
    {
        let ids: Vec<EntityId> = records.into_iter().map(|r| self.identity_of(r)).collect();
        let removed = {
            let mut state = self.state.write();
            ids.iter()
                .filter(|id| state.records.remove(*id).is_some())
                .count()
        };
        if removed > 0 {
            self.bump();
        }
        removed
    }

    /// Remove every record. The identity counter is kept.
    pub fn clear(&self) -> usize {
        let removed = {
            let mut state = self.state.write();
            let n = state.records.len();
            state.records.clear();
            n
        };
        self.bump();
        removed
    }

    // --- Integrity ---

    /// Look for single links in other stores that point at `record`.
    ///
    /// With `cascade` those foreign keys are cleared; without it the first
    /// one found is reported as [`StoreError::Integrity`] and nothing
    /// changes. Returns whether any reference existed.
    pub fn find_references(&self, record: &Shared<T>, cascade: bool) -> Result<bool> {
        let id = self.identity_of(record);
        let core = self.core()?;
        self.spec.scan(id, &core, cascade)
    }

    /// Reference-checked removal.
    pub fn delete(&self, record: &Shared<T>, cascade: bool) -> Result<bool> {
        self.find_references(record, cascade)?;
        Ok(self.remove(record))
    }

    pub(crate) fn keys_matching(&self, probe: &Probe<T>, id: EntityId) -> Vec<ForeignKey> {
        self.snapshot()
            .iter()
            .filter_map(|record| {
                let guard = record.read_recursive();
                probe(&*guard).filter(|key| key.get() == Some(id))
            })
            .collect()
    }

    // --- Lookup ---

    pub fn find_by_key(&self, id: EntityId) -> Option<Shared<T>> {
        let found = self.state.read_recursive().records.get(&id).cloned()?;
        self.wire_logged(&found);
        Some(found)
    }

    pub fn contains_key(&self, id: EntityId) -> bool {
        self.state.read_recursive().records.contains_key(&id)
    }

    /// Whether a record with the same identity is present.
    pub fn contains(&self, record: &Shared<T>) -> bool {
        self.contains_key(self.identity_of(record))
    }

    /// Records present at call time, in identity order, wired as yielded.
    pub fn iter(&self) -> impl Iterator<Item = Shared<T>> + '_ {
        self.snapshot().into_iter().map(move |record| {
            self.wire_logged(&record);
            record
        })
    }

    pub fn filter<F>(&self, predicate: F) -> Vec<Shared<T>>
    where
        F: Fn(&T) -> bool,
    {
        let matched: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|record| predicate(&*record.read_recursive()))
            .collect();
        for record in &matched {
            self.wire_logged(record);
        }
        matched
    }

    pub fn find<F>(&self, predicate: F) -> Option<Shared<T>>
    where
        F: Fn(&T) -> bool,
    {
        let found = self
            .snapshot()
            .into_iter()
            .find(|record| predicate(&*record.read_recursive()))?;
        self.wire_logged(&found);
        Some(found)
    }

    pub fn count_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&T) -> bool,
    {
        self.snapshot()
            .iter()
            .filter(|record| predicate(&*record.read_recursive()))
            .count()
    }

    // --- Wiring ---

    /// Bind the link members of `record` to this container. Idempotent.
    pub fn wire(&self, record: &Shared<T>) -> Result<()> {
        self.wire_held(record, None)
    }

    fn wire_held(&self, record: &Shared<T>, held: Option<Holder>) -> Result<()> {
        if !self.spec.shape().has_links() {
            return Ok(());
        }
        let core = self.core()?;
        self.spec.wire(record, &core, held)
    }

    fn wire_logged(&self, record: &Shared<T>) {
        if let Err(e) = self.wire(record) {
            warn!(record = T::NAME, error = %e, "failed to wire record");
        }
    }

    /// Wire every record. Returns how many records were visited.
    pub fn wire_all(&self) -> Result<usize> {
        let records = self.snapshot();
        for record in &records {
            self.wire(record)?;
        }
        Ok(records.len())
    }

    // --- Persistence ---

    /// Replace the store's contents with the records in `data`.
    ///
    /// `ids` holds the identity counter; an empty stream means zero. On any
    /// decode error the store is left as it was. Records are not wired.
    pub fn load(&self, ids: &mut dyn Read, data: &mut dyn BufRead) -> Result<usize> {
        let stored = codec::read_counter(ids).map_err(|e| StoreError::Decode {
            record: T::NAME,
            index: 0,
            offset: 0,
            message: e.to_string(),
        })?;

        let mut reader = CountingReader::new(data);
        let mut records = BTreeMap::new();
        let mut index = 0;
        loop {
            let offset = reader.position();
            let decode_error = move |e: std::io::Error| StoreError::Decode {
                record: T::NAME,
                index,
                offset,
                message: e.to_string(),
            };
            if reader.at_end().map_err(decode_error)? {
                break;
            }
            let record = self
                .spec
                .shape()
                .decode(&mut reader)
                .map_err(decode_error)?;
            records.insert(self.spec.identity(&record), shared(record));
            index += 1;
        }

        let highest = records.keys().next_back().map_or(0, |id| id.0);
        let count = records.len();
        {
            let mut state = self.state.write();
            state.records = records;
            state.last_id = stored.unwrap_or(0).max(highest);
        }
        self.bump();
        debug!(record = T::NAME, records = count, "loaded store");
        Ok(count)
    }

    /// Write the identity counter to `ids` and every record to `data`.
    pub fn save(&self, ids: &mut dyn Write, data: &mut dyn Write) -> Result<usize> {
        self.write_snapshot(ids, data).map(|(count, _)| count)
    }

    fn write_snapshot(&self, ids: &mut dyn Write, data: &mut dyn Write) -> Result<(usize, i64)> {
        let (last_id, records) = {
            let state = self.state.read_recursive();
            let records: Vec<_> = state.records.values().cloned().collect();
            (state.last_id, records)
        };
        codec::write_i64(ids, last_id)?;
        for record in &records {
            self.spec.shape().encode(&record.read_recursive(), data)?;
        }
        debug!(record = T::NAME, records = records.len(), "saved store");
        Ok((records.len(), last_id))
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.state.read_recursive();
        StoreStats {
            record: T::NAME,
            slot: self.slot,
            records: state.records.len(),
            last_id: state.last_id,
            version: self.version(),
        }
    }
}

/// A freshly opened store, as seen by the container.
pub(crate) struct OpenedStore {
    pub any: Arc<dyn Any + Send + Sync>,
    pub erased: Arc<dyn ErasedStore>,
}

/// Type-erased view of a store for container-wide operations.
pub(crate) trait ErasedStore: Send + Sync {
    fn record(&self) -> &'static str;
    fn attach_container(&self, core: Weak<ContainerCore>);
    fn load_streams(&self, ids: &mut dyn Read, data: &mut dyn BufRead) -> Result<usize>;
    fn save_streams(&self, ids: &mut dyn Write, data: &mut dyn Write) -> Result<(usize, i64)>;
    fn wire_all(&self) -> Result<usize>;
    fn stats(&self) -> StoreStats;
}

impl<T: Record> ErasedStore for Store<T> {
    fn record(&self) -> &'static str {
        T::NAME
    }

    fn attach_container(&self, core: Weak<ContainerCore>) {
        let _ = self.container.set(core);
    }

    fn load_streams(&self, ids: &mut dyn Read, data: &mut dyn BufRead) -> Result<usize> {
        self.load(ids, data)
    }

    fn save_streams(&self, ids: &mut dyn Write, data: &mut dyn Write) -> Result<(usize, i64)> {
        self.write_snapshot(ids, data)
    }

    fn wire_all(&self) -> Result<usize> {
        Store::wire_all(self)
    }

    fn stats(&self) -> StoreStats {
        Store::stats(self)
    }
}
