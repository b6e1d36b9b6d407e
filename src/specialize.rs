//! Per-type specializations and their process-wide cache.
//!
//! A [`Specialization`] bundles everything the store needs to handle one
//! record type inside one schema: the codec, link wiring and the integrity
//! sites that can reference the type. Bundles are built once per
//! (record type, schema) pair and shared by every container of that schema.

use crate::container::{Catalog, ContainerCore};
use crate::error::{Result, StoreError};
use crate::integrity::{self, LinkSite};
use crate::links::wiring::Holder;
use crate::shape::{Field, Record, Shape};
use crate::types::{EntityId, Shared};
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::debug;

/// Codec, wiring and integrity scan for one record type.
pub struct Specialization<T: Record> {
    shape: Shape<T>,
    identity: Field<T, EntityId>,
    sites: Vec<LinkSite>,
}

impl<T: Record> Specialization<T> {
    fn build(catalog: &Catalog) -> Result<Self> {
        let shape = Shape::<T>::introspect()?;
        let identity = shape.identity().ok_or_else(|| {
            StoreError::config(T::NAME, None, "stored record types must declare an identity")
        })?;

        let mut targets = Vec::new();
        shape.link_targets("", &mut targets);
        for target in &targets {
            if !catalog.contains(target.type_id) {
                return Err(StoreError::config(
                    T::NAME,
                    Some(&target.member),
                    format!(
                        "{} has no store in {}",
                        target.type_name,
                        catalog.schema_name()
                    ),
                ));
            }
        }

        let me = TypeId::of::<T>();
        let mut sites = Vec::new();
        for entry in catalog.entries().iter().filter(|e| e.type_id != me) {
            sites.extend((entry.sites)(entry.slot, me)?);
        }

        debug!(
            record = T::NAME,
            schema = catalog.schema_name(),
            members = shape.members.len(),
            links = targets.len(),
            sites = sites.len(),
            "built specialization"
        );

        Ok(Self {
            shape,
            identity,
            sites,
        })
    }

    pub fn shape(&self) -> &Shape<T> {
        &self.shape
    }

    /// Write one record in stream format.
    pub fn encode(&self, record: &T, w: &mut dyn Write) -> Result<()> {
        Ok(self.shape.encode(record, w)?)
    }

    /// Read one record. Links come back detached.
    pub fn decode(&self, r: &mut dyn Read) -> Result<T> {
        self.shape.decode(r).map_err(|e| StoreError::Decode {
            record: T::NAME,
            index: 0,
            offset: 0,
            message: e.to_string(),
        })
    }

    /// Paths of the foreign keys in other stores that can reference `T`.
    pub fn referencing_paths(&self) -> Vec<&str> {
        self.sites.iter().map(LinkSite::path).collect()
    }

    pub(crate) fn identity(&self, record: &T) -> EntityId {
        *(self.identity.get)(record)
    }

    pub(crate) fn set_identity(&self, record: &mut T, id: EntityId) {
        *(self.identity.get_mut)(record) = id;
    }

    /// Bind the link members of `record`. Idempotent.
    pub(crate) fn wire(
        &self,
        record: &Shared<T>,
        core: &ContainerCore,
        held: Option<Holder>,
    ) -> Result<()> {
        if !self.shape.has_links() {
            return Ok(());
        }
        self.shape.wire(record, self.identity, core, held)
    }

    /// Search the other stores for references to `id`.
    pub(crate) fn scan(&self, id: EntityId, core: &ContainerCore, cascade: bool) -> Result<bool> {
        integrity::scan(&self.sites, T::NAME, id, core, cascade)
    }
}

type Cell = Arc<OnceCell<Arc<dyn Any + Send + Sync>>>;

static REGISTRY: Lazy<Mutex<HashMap<(TypeId, TypeId), Cell>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// The specialization of `T` for the schema `catalog` describes.
///
/// Built on first request and cached for the life of the process; repeated
/// lookups return the same instance. Concurrent first requests build once.
pub fn specialization<T: Record>(catalog: &Catalog) -> Result<Arc<Specialization<T>>> {
    let key = (TypeId::of::<T>(), catalog.schema_id());
    let cell = Arc::clone(REGISTRY.lock().entry(key).or_default());

    let built = cell.get_or_try_init(|| {
        Specialization::<T>::build(catalog).map(|s| Arc::new(s) as Arc<dyn Any + Send + Sync>)
    })?;

    Arc::clone(built)
        .downcast::<Specialization<T>>()
        .map_err(|_| StoreError::config(T::NAME, None, "cached specialization has the wrong type"))
}
