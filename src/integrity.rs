//! Referential integrity scanning.
//!
//! Before a record is deleted, every other store in the container is
//! searched for single links still pointing at it. The scan either refuses
//! the delete or clears the dangling foreign keys.

use crate::container::ContainerCore;
use crate::error::{Result, StoreError};
use crate::links::ForeignKey;
use crate::shape::{Record, Shape};
use crate::types::EntityId;
use std::any::TypeId;
use std::sync::Arc;
use tracing::debug;

/// Reads the foreign key a site refers to out of a record.
pub(crate) type Probe<T> = Arc<dyn Fn(&T) -> Option<ForeignKey> + Send + Sync>;

/// A foreign key within one record type, addressed by its member path.
pub(crate) struct Site<T> {
    pub path: String,
    pub probe: Probe<T>,
}

type Lookup = Box<dyn Fn(&ContainerCore, EntityId) -> Result<Vec<ForeignKey>> + Send + Sync>;

/// A foreign key in another store that can reference the scanned type.
pub(crate) struct LinkSite {
    owner: &'static str,
    path: String,
    lookup: Lookup,
}

impl LinkSite {
    /// `{slot}.{member path}` of the referencing foreign key.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn owner(&self) -> &'static str {
        self.owner
    }

    /// Foreign keys at this site currently equal to `id`.
    pub fn references(&self, core: &ContainerCore, id: EntityId) -> Result<Vec<ForeignKey>> {
        (self.lookup)(core, id)
    }
}

/// All sites in the store of `O` (declared under `slot`) that can point at
/// records of `target`.
pub(crate) fn sites_for<O: Record>(slot: &'static str, target: TypeId) -> Result<Vec<LinkSite>> {
    let shape = Shape::<O>::introspect()?;
    Ok(shape
        .sites_to(target, "")
        .into_iter()
        .map(|site| {
            let probe = site.probe;
            let lookup: Lookup = Box::new(move |core: &ContainerCore, id: EntityId| {
                Ok(core.store::<O>()?.keys_matching(&probe, id))
            });
            LinkSite {
                owner: O::NAME,
                path: format!("{slot}.{}", site.path),
                lookup,
            }
        })
        .collect())
}

/// Look for references to `id` through `sites`.
///
/// Without `cascade` the first reference found is reported as an integrity
/// error and nothing is modified. With `cascade` every referencing foreign
/// key is cleared. Returns whether any reference existed.
pub(crate) fn scan(
    sites: &[LinkSite],
    record: &'static str,
    id: EntityId,
    core: &ContainerCore,
    cascade: bool,
) -> Result<bool> {
    if !id.is_set() {
        return Ok(false);
    }

    let mut found = false;
    for site in sites {
        let references = site.references(core, id)?;
        if references.is_empty() {
            continue;
        }
        if !cascade {
            return Err(StoreError::Integrity {
                record,
                id,
                path: site.path.clone(),
            });
        }
        for key in &references {
            key.clear();
        }
        debug!(
            record,
            %id,
            owner = site.owner(),
            path = %site.path,
            cleared = references.len(),
            "cleared references"
        );
        found = true;
    }
    Ok(found)
}
