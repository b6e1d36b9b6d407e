//! Core types shared by every store.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identity of a record within its store.
///
/// Identities are assigned by the store, start at 1 and are never reused
/// while the store lives. Anything below 1 means "not assigned yet".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct EntityId(pub i64);

impl EntityId {
    /// The unassigned identity.
    pub const UNSET: EntityId = EntityId(0);

    /// Whether the store has assigned this identity.
    pub fn is_set(self) -> bool {
        self.0 >= 1
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EntityId {
    fn from(v: i64) -> Self {
        EntityId(v)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A record as held by a store: shared between the store, link handles and
/// callers, guarded by its own lock.
pub type Shared<T> = Arc<RwLock<T>>;

/// Wrap a value for insertion into a store.
pub fn shared<T>(value: T) -> Shared<T> {
    Arc::new(RwLock::new(value))
}

/// Per-store statistics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreStats {
    /// Record type name.
    pub record: &'static str,
    /// Slot the store is declared under in its schema.
    pub slot: &'static str,
    /// Number of records currently held.
    pub records: usize,
    /// Last identity assigned.
    pub last_id: i64,
    /// Mutation counter.
    pub version: u64,
}
