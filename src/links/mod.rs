//! Lazy link handles between records.
//!
//! A record refers to another record through a [`ForeignKey`] member and,
//! optionally, a [`Ref`] or [`Many`] member that resolves the key on demand.
//! Handles start out detached (holding whatever the caller supplied) and are
//! bound to the container's stores by wiring.

pub(crate) mod wiring;

use self::wiring::Holder;
use crate::error::{Result, StoreError};
use crate::shape::{KeyAccessor, Record};
use crate::store::Store;
use crate::types::{EntityId, Shared};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

/// Foreign-key member: the identity of the linked record, if any.
///
/// The value lives in a shared cell so a bound [`Link`] observes every
/// change made through the record. Values below 1 read as unset.
pub struct ForeignKey {
    cell: Arc<AtomicI64>,
}

impl ForeignKey {
    pub fn new(id: Option<EntityId>) -> Self {
        Self {
            cell: Arc::new(AtomicI64::new(Self::raw(id))),
        }
    }

    fn raw(id: Option<EntityId>) -> i64 {
        id.filter(|id| id.is_set()).map_or(0, |id| id.0)
    }

    pub fn get(&self) -> Option<EntityId> {
        let id = EntityId(self.cell.load(Ordering::Acquire));
        id.is_set().then_some(id)
    }

    pub fn set(&self, id: Option<EntityId>) {
        self.cell.store(Self::raw(id), Ordering::Release);
    }

    pub fn clear(&self) {
        self.set(None);
    }

    /// Another handle on the same cell.
    pub(crate) fn share(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }

    pub(crate) fn same_cell(&self, other: &ForeignKey) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl Default for ForeignKey {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Cloning copies the value into a fresh cell.
impl Clone for ForeignKey {
    fn clone(&self) -> Self {
        Self::new(self.get())
    }
}

impl PartialEq for ForeignKey {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl From<EntityId> for ForeignKey {
    fn from(id: EntityId) -> Self {
        Self::new(Some(id))
    }
}

impl fmt::Debug for ForeignKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(id) => write!(f, "ForeignKey({id})"),
            None => write!(f, "ForeignKey(None)"),
        }
    }
}

struct Resolved<U> {
    key: EntityId,
    version: u64,
    record: Weak<RwLock<U>>,
}

/// A single-record link bound to a store.
///
/// Resolution is by key lookup and is cached until either the foreign key or
/// the target store changes. The handle never keeps its target alive.
pub struct Link<U: Record> {
    store: Weak<Store<U>>,
    key: ForeignKey,
    holder: Holder,
    cache: Mutex<Option<Resolved<U>>>,
}

impl<U: Record> Link<U> {
    pub(crate) fn new(store: &Arc<Store<U>>, key: ForeignKey, holder: Holder) -> Self {
        Self {
            store: Arc::downgrade(store),
            key,
            holder,
            cache: Mutex::new(None),
        }
    }

    /// Current foreign-key value.
    pub fn id(&self) -> Option<EntityId> {
        self.key.get()
    }

    /// Resolve the linked record.
    pub fn get(&self) -> Option<Shared<U>> {
        let key = self.key.get()?;
        let store = self.store.upgrade()?;
        let version = store.version();

        if let Some(hit) = self
            .cache
            .lock()
            .as_ref()
            .filter(|c| c.key == key && c.version == version)
            .and_then(|c| c.record.upgrade())
        {
            return Some(hit);
        }

        let found = store.find_by_key(key);
        *self.cache.lock() = found.as_ref().map(|record| Resolved {
            key,
            version,
            record: Arc::downgrade(record),
        });
        found
    }

    /// Point the link at `value`, adding it to the target store first when
    /// it has no identity yet.
    ///
    /// The record holding this link may be write-locked by the caller; it
    /// is never locked again while `value` is added and wired.
    pub fn set(&self, value: Option<&Shared<U>>) -> Result<()> {
        let Some(record) = value else {
            self.key.clear();
            return Ok(());
        };
        let store = self.store.upgrade().ok_or(StoreError::ContainerClosed)?;
        let mut id = if self.holder.is(record) {
            self.holder.id
        } else {
            store.identity_of(record)
        };
        if !id.is_set() {
            id = store.add_held(record, Some(self.holder))?;
        }
        self.key.set(Some(id));
        Ok(())
    }

    pub(crate) fn is_bound_to(&self, store: &Arc<Store<U>>, key: &ForeignKey) -> bool {
        Weak::as_ptr(&self.store) == Arc::as_ptr(store) && self.key.same_cell(key)
    }
}

/// Single-record link member.
pub enum Ref<U: Record> {
    /// Not wired yet. Holds a record supplied by the caller, if any; wiring
    /// attaches it to the target store and syncs the foreign key.
    Detached(Option<Shared<U>>),
    /// Wired to the target store.
    Bound(Link<U>),
}

impl<U: Record> Ref<U> {
    /// A detached link to `value`.
    pub fn new(value: Shared<U>) -> Self {
        Ref::Detached(Some(value))
    }

    pub fn get(&self) -> Option<Shared<U>> {
        match self {
            Ref::Detached(value) => value.clone(),
            Ref::Bound(link) => link.get(),
        }
    }

    pub fn set(&mut self, value: Option<Shared<U>>) -> Result<()> {
        match self {
            Ref::Detached(current) => {
                *current = value;
                Ok(())
            }
            Ref::Bound(link) => link.set(value.as_ref()),
        }
    }

    /// Foreign-key value of a bound link.
    pub fn id(&self) -> Option<EntityId> {
        match self {
            Ref::Detached(_) => None,
            Ref::Bound(link) => link.id(),
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(self, Ref::Bound(_))
    }
}

impl<U: Record> Default for Ref<U> {
    fn default() -> Self {
        Ref::Detached(None)
    }
}

impl<U: Record> fmt::Debug for Ref<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ref::Detached(None) => write!(f, "Ref::Detached(None)"),
            Ref::Detached(Some(_)) => write!(f, "Ref::Detached({})", U::NAME),
            Ref::Bound(link) => write!(f, "Ref::Bound({}, {:?})", U::NAME, link.id()),
        }
    }
}

/// The records of a store whose foreign key points at one owner.
///
/// Every read queries the store, so the view always reflects the current
/// foreign keys.
pub struct Collection<U: Record> {
    store: Weak<Store<U>>,
    owner: EntityId,
    holder: Holder,
    key: KeyAccessor<U>,
}

impl<U: Record> Collection<U> {
    pub(crate) fn new(store: &Arc<Store<U>>, holder: Holder, key: KeyAccessor<U>) -> Self {
        Self {
            store: Arc::downgrade(store),
            owner: holder.id,
            holder,
            key,
        }
    }

    pub fn owner(&self) -> EntityId {
        self.owner
    }

    fn matches(&self, record: &U) -> bool {
        (self.key)(record).get() == Some(self.owner)
    }

    pub fn to_vec(&self) -> Vec<Shared<U>> {
        match self.store.upgrade() {
            Some(store) => store.filter(|record| self.matches(record)),
            None => Vec::new(),
        }
    }

    pub fn iter(&self) -> std::vec::IntoIter<Shared<U>> {
        self.to_vec().into_iter()
    }

    pub fn len(&self) -> usize {
        self.store
            .upgrade()
            .map_or(0, |store| store.count_where(|record| self.matches(record)))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, item: &Shared<U>) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        let matches = self.matches(&item.read_recursive());
        matches && store.contains(item)
    }

    /// Point `item` at the owner and attach it to the store.
    ///
    /// The owner may be write-locked by the caller; records reached while
    /// wiring `item` that link back to it are attached without locking it.
    pub fn push(&self, item: &Shared<U>) -> Result<EntityId> {
        let store = self.store.upgrade().ok_or(StoreError::ContainerClosed)?;
        (self.key)(&item.read_recursive()).set(Some(self.owner));
        store.attach_held(item, Some(self.holder))
    }

    /// Unlink `item` from the owner. The record stays in its store.
    pub fn remove(&self, item: &Shared<U>) -> bool {
        let guard = item.read_recursive();
        if !self.matches(&guard) {
            return false;
        }
        (self.key)(&guard).clear();
        true
    }

    /// Unlink every member. Returns how many were unlinked.
    pub fn clear(&self) -> usize {
        let items = self.to_vec();
        for item in &items {
            (self.key)(&item.read_recursive()).clear();
        }
        items.len()
    }

    pub(crate) fn is_bound_to(&self, store: &Arc<Store<U>>, owner: EntityId) -> bool {
        Weak::as_ptr(&self.store) == Arc::as_ptr(store) && self.owner == owner
    }
}

/// Multi-record link member.
pub enum Many<U: Record> {
    /// Records supplied by the caller before the owner was stored. Wiring
    /// points each one at the owner and attaches it.
    Detached(Vec<Shared<U>>),
    /// Wired to the target store.
    Bound(Collection<U>),
}

impl<U: Record> Many<U> {
    pub fn push(&mut self, item: Shared<U>) -> Result<()> {
        match self {
            Many::Detached(items) => {
                items.push(item);
                Ok(())
            }
            Many::Bound(collection) => collection.push(&item).map(|_| ()),
        }
    }

    pub fn remove(&mut self, item: &Shared<U>) -> bool {
        match self {
            Many::Detached(items) => {
                let before = items.len();
                items.retain(|i| !Arc::ptr_eq(i, item));
                items.len() != before
            }
            Many::Bound(collection) => collection.remove(item),
        }
    }

    pub fn items(&self) -> Vec<Shared<U>> {
        match self {
            Many::Detached(items) => items.clone(),
            Many::Bound(collection) => collection.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Many::Detached(items) => items.len(),
            Many::Bound(collection) => collection.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_bound(&self) -> bool {
        matches!(self, Many::Bound(_))
    }
}

impl<U: Record> Default for Many<U> {
    fn default() -> Self {
        Many::Detached(Vec::new())
    }
}

impl<U: Record> From<Vec<Shared<U>>> for Many<U> {
    fn from(items: Vec<Shared<U>>) -> Self {
        Many::Detached(items)
    }
}

impl<U: Record> fmt::Debug for Many<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Many::Detached(items) => write!(f, "Many::Detached({} x {})", items.len(), U::NAME),
            Many::Bound(c) => write!(f, "Many::Bound({} of owner {})", U::NAME, c.owner),
        }
    }
}
