//! Link wiring.
//!
//! Wiring replaces detached link members with handles bound to the
//! container's stores. Records supplied through detached members are
//! attached to their stores afterwards, once the owning record's lock has
//! been released. If an attach fails the detached value is put back.
//!
//! Callers mutate link members through a record's write guard, so a chain
//! of attaches started from a bound handle carries a [`Holder`] naming that
//! record. Attaching or wiring the held record never locks it again.

use super::{Collection, Link, Many, Ref};
use crate::container::ContainerCore;
use crate::error::{Result, StoreError};
use crate::shape::{Field, KeyAccessor, RawSlot, Record, Shape, ShapeBuilder, Slot};
use crate::types::{EntityId, Shared};
use std::any::TypeId;
use std::mem;
use std::sync::Arc;
use tracing::trace;

/// A record identified by address, together with its identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Holder {
    addr: usize,
    pub(crate) id: EntityId,
}

impl Holder {
    pub(crate) fn of<T>(record: &Shared<T>, id: EntityId) -> Self {
        Self {
            addr: Arc::as_ptr(record) as *const () as usize,
            id,
        }
    }

    pub(crate) fn is<U>(&self, record: &Shared<U>) -> bool {
        Arc::as_ptr(record) as *const () as usize == self.addr
    }
}

/// An attach left for after the record lock is released, with the undo
/// that restores the detached member if it fails.
pub(crate) struct Deferred<T> {
    run: Box<dyn FnOnce(Option<Holder>) -> Result<()>>,
    undo: Box<dyn FnOnce(&mut T)>,
}

impl<T: 'static> Deferred<T> {
    fn new(
        run: impl FnOnce(Option<Holder>) -> Result<()> + 'static,
        undo: impl FnOnce(&mut T) + 'static,
    ) -> Self {
        Self {
            run: Box::new(run),
            undo: Box::new(undo),
        }
    }

    pub(crate) fn undo(self, record: &mut T) {
        (self.undo)(record)
    }

    /// Re-target the undo at the value `project` reaches inside `S`.
    pub(crate) fn nest<S: 'static>(
        self,
        project: impl Fn(&mut S) -> Option<&mut T> + 'static,
    ) -> Deferred<S> {
        let undo = self.undo;
        Deferred {
            run: self.run,
            undo: Box::new(move |outer: &mut S| {
                if let Some(inner) = project(outer) {
                    undo(inner);
                }
            }),
        }
    }
}

pub(crate) trait LinkSlot<T>: Send + Sync {
    fn target(&self) -> (TypeId, &'static str);

    fn is_bound(&self, record: &T, owner: EntityId, core: &ContainerCore) -> bool;

    fn bind(
        &self,
        record: &mut T,
        owner: EntityId,
        holder: Holder,
        core: &ContainerCore,
        deferred: &mut Vec<Deferred<T>>,
    ) -> Result<()>;
}

/// A single link whose foreign key has not been resolved yet.
pub(crate) trait LinkPlan<T> {
    fn target(&self) -> (TypeId, &'static str);
    fn bind(self: Box<Self>, key: KeyAccessor<T>) -> Box<dyn LinkSlot<T>>;
}

/// A collection whose foreign key on the target has not been resolved yet.
pub(crate) trait ManyPlan<T> {
    fn target(&self) -> (TypeId, &'static str);
    fn resolve(
        self: Box<Self>,
        owner: &'static str,
        foreign_key: &str,
    ) -> Result<Box<dyn LinkSlot<T>>>;
}

pub(crate) fn single_plan<T: Record, U: Record>(
    name: &'static str,
    field: Field<T, Ref<U>>,
) -> Box<dyn LinkPlan<T>> {
    Box::new(SinglePlan { name, field })
}

pub(crate) fn many_plan<T: Record, U: Record>(
    name: &'static str,
    field: Field<T, Many<U>>,
) -> Box<dyn ManyPlan<T>> {
    Box::new(CollectionPlan { name, field })
}

struct SinglePlan<T, U: Record> {
    name: &'static str,
    field: Field<T, Ref<U>>,
}

impl<T: Record, U: Record> LinkPlan<T> for SinglePlan<T, U> {
    fn target(&self) -> (TypeId, &'static str) {
        (TypeId::of::<U>(), U::NAME)
    }

    fn bind(self: Box<Self>, key: KeyAccessor<T>) -> Box<dyn LinkSlot<T>> {
        Box::new(SingleLink {
            name: self.name,
            field: self.field,
            key,
        })
    }
}

struct SingleLink<T, U: Record> {
    name: &'static str,
    field: Field<T, Ref<U>>,
    key: KeyAccessor<T>,
}

impl<T: Record, U: Record> LinkSlot<T> for SingleLink<T, U> {
    fn target(&self) -> (TypeId, &'static str) {
        (TypeId::of::<U>(), U::NAME)
    }

    fn is_bound(&self, record: &T, _owner: EntityId, core: &ContainerCore) -> bool {
        let Ref::Bound(link) = (self.field.get)(record) else {
            return false;
        };
        core.store::<U>()
            .map_or(false, |store| link.is_bound_to(&store, (self.key)(record)))
    }

    fn bind(
        &self,
        record: &mut T,
        _owner: EntityId,
        holder: Holder,
        core: &ContainerCore,
        deferred: &mut Vec<Deferred<T>>,
    ) -> Result<()> {
        let store = core.store::<U>()?;
        let key = (self.key)(record).share();
        let bound = Ref::Bound(Link::new(&store, key.share(), holder));
        let previous = mem::replace((self.field.get_mut)(record), bound);
        trace!(record = T::NAME, link = self.name, target = U::NAME, "bound link");

        if let Ref::Detached(Some(value)) = previous {
            let get_mut = self.field.get_mut;
            let restore = Arc::clone(&value);
            deferred.push(Deferred::new(
                move |held| {
                    let id = store.attach_held(&value, held)?;
                    key.set(Some(id));
                    Ok(())
                },
                move |record: &mut T| *get_mut(record) = Ref::Detached(Some(restore)),
            ));
        }
        Ok(())
    }
}

struct CollectionPlan<T, U: Record> {
    name: &'static str,
    field: Field<T, Many<U>>,
}

impl<T: Record, U: Record> ManyPlan<T> for CollectionPlan<T, U> {
    fn target(&self) -> (TypeId, &'static str) {
        (TypeId::of::<U>(), U::NAME)
    }

    fn resolve(
        self: Box<Self>,
        owner: &'static str,
        foreign_key: &str,
    ) -> Result<Box<dyn LinkSlot<T>>> {
        let target = ShapeBuilder::<U>::describe();
        let key = target
            .members
            .iter()
            .find_map(|member| match &member.slot {
                RawSlot::ForeignKey { get, .. } if member.name == foreign_key => Some(*get),
                _ => None,
            })
            .ok_or_else(|| {
                StoreError::config(
                    owner,
                    Some(self.name),
                    format!("foreign key property {foreign_key} not found on {}", U::NAME),
                )
            })?;

        Ok(Box::new(CollectionLink {
            name: self.name,
            field: self.field,
            key,
        }))
    }
}

struct CollectionLink<T, U: Record> {
    name: &'static str,
    field: Field<T, Many<U>>,
    key: KeyAccessor<U>,
}

impl<T: Record, U: Record> LinkSlot<T> for CollectionLink<T, U> {
    fn target(&self) -> (TypeId, &'static str) {
        (TypeId::of::<U>(), U::NAME)
    }

    fn is_bound(&self, record: &T, owner: EntityId, core: &ContainerCore) -> bool {
        if !owner.is_set() {
            return true;
        }
        let Many::Bound(collection) = (self.field.get)(record) else {
            return false;
        };
        core.store::<U>()
            .map_or(false, |store| collection.is_bound_to(&store, owner))
    }

    fn bind(
        &self,
        record: &mut T,
        owner: EntityId,
        holder: Holder,
        core: &ContainerCore,
        deferred: &mut Vec<Deferred<T>>,
    ) -> Result<()> {
        if !owner.is_set() {
            return Ok(());
        }
        let store = core.store::<U>()?;
        let bound = Many::Bound(Collection::new(&store, holder, self.key));
        let previous = mem::replace((self.field.get_mut)(record), bound);
        trace!(record = T::NAME, link = self.name, target = U::NAME, %owner, "bound collection");

        if let Many::Detached(items) = previous {
            if !items.is_empty() {
                let key = self.key;
                let get_mut = self.field.get_mut;
                let restore = items.clone();
                deferred.push(Deferred::new(
                    move |held| {
                        for item in &items {
                            // The held record's members belong to its holder.
                            if !held.map_or(false, |h| h.is(item)) {
                                key(&item.read_recursive()).set(Some(owner));
                            }
                            store.attach_held(item, held)?;
                        }
                        Ok(())
                    },
                    move |record: &mut T| *get_mut(record) = Many::Detached(restore),
                ));
            }
        }
        Ok(())
    }
}

impl<T: Record> Shape<T> {
    /// Whether every link member, including those inside embedded values,
    /// is bound to `core`.
    pub(crate) fn is_bound(&self, record: &T, owner: EntityId, core: &ContainerCore) -> bool {
        self.members.iter().all(|member| match &member.slot {
            Slot::SingleLink { link, .. } | Slot::MultiLink(link) => {
                link.is_bound(record, owner, core)
            }
            Slot::Embedded(slot) => slot.is_bound(record, core),
            _ => true,
        })
    }

    /// Bind every unbound link member, queueing attaches in `deferred`.
    pub(crate) fn bind(
        &self,
        record: &mut T,
        owner: EntityId,
        holder: Holder,
        core: &ContainerCore,
        deferred: &mut Vec<Deferred<T>>,
    ) -> Result<()> {
        for member in &self.members {
            match &member.slot {
                Slot::SingleLink { link, .. } | Slot::MultiLink(link) => {
                    if !link.is_bound(record, owner, core) {
                        link.bind(record, owner, holder, core, deferred)?;
                    }
                }
                Slot::Embedded(slot) => slot.bind(record, holder, core, deferred)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Bind `record` and run its queued attaches.
    ///
    /// `held` is a record whose write guard the caller holds; it is neither
    /// locked nor wired here. On failure every member whose attach did not
    /// run is restored to its detached value.
    pub(crate) fn wire(
        &self,
        record: &Shared<T>,
        identity: Field<T, EntityId>,
        core: &ContainerCore,
        held: Option<Holder>,
    ) -> Result<()> {
        if held.map_or(false, |h| h.is(record)) {
            return Ok(());
        }
        {
            let guard = record.read_recursive();
            if self.is_bound(&guard, *(identity.get)(&guard), core) {
                return Ok(());
            }
        }

        let mut deferred = Vec::new();
        {
            let mut guard = record.write();
            let owner = *(identity.get)(&guard);
            let holder = Holder::of(record, owner);
            if let Err(e) = self.bind(&mut guard, owner, holder, core, &mut deferred) {
                deferred.into_iter().for_each(|step| step.undo(&mut guard));
                return Err(e);
            }
        }
        settle(record, deferred, held)
    }
}

/// Run queued attaches in order. The first failure undoes itself and every
/// step after it, then is returned.
fn settle<T: 'static>(
    record: &Shared<T>,
    deferred: Vec<Deferred<T>>,
    held: Option<Holder>,
) -> Result<()> {
    let mut pending = deferred.into_iter();
    while let Some(Deferred { run, undo }) = pending.next() {
        if let Err(e) = run(held) {
            let mut guard = record.write();
            undo(&mut *guard);
            pending.for_each(|step| step.undo(&mut guard));
            return Err(e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::shared;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn step(slot: usize, outcome: Result<()>) -> Deferred<[&'static str; 3]> {
        Deferred::new(
            move |_| outcome,
            move |slots: &mut [&'static str; 3]| slots[slot] = "detached",
        )
    }

    #[test]
    fn test_failed_attach_restores_itself_and_later_members() {
        let record = shared(["bound"; 3]);
        let ran_last = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran_last);
        let deferred = vec![
            step(0, Ok(())),
            step(1, Err(StoreError::ContainerClosed)),
            Deferred::new(
                move |_| {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                },
                |slots: &mut [&'static str; 3]| slots[2] = "detached",
            ),
        ];

        let result = settle(&record, deferred, None);

        assert!(matches!(result, Err(StoreError::ContainerClosed)));
        assert!(!ran_last.load(Ordering::SeqCst));
        assert_eq!(*record.read(), ["bound", "detached", "detached"]);
    }

    #[test]
    fn test_settle_all_succeed() {
        let record = shared(["bound"; 3]);
        let deferred = (0..3).map(|slot| step(slot, Ok(()))).collect();
        settle(&record, deferred, None).unwrap();
        assert_eq!(*record.read(), ["bound"; 3]);
    }

    #[test]
    fn test_nested_undo_skips_absent_value() {
        let inner = Deferred::new(|_| Ok(()), |value: &mut String| value.push_str("-restored"));
        let mut present = Some("finance".to_string());
        inner
            .nest(|outer: &mut Option<String>| outer.as_mut())
            .undo(&mut present);
        assert_eq!(present.as_deref(), Some("finance-restored"));

        let inner = Deferred::new(|_| Ok(()), |value: &mut String| value.push_str("-restored"));
        let mut absent: Option<String> = None;
        inner
            .nest(|outer: &mut Option<String>| outer.as_mut())
            .undo(&mut absent);
        assert_eq!(absent, None);
    }

    #[test]
    fn test_holder_matches_by_address() {
        let a = shared(1u8);
        let b = shared(1u8);
        let holder = Holder::of(&a, EntityId(7));
        assert!(holder.is(&a));
        assert!(holder.is(&Arc::clone(&a)));
        assert!(!holder.is(&b));
        assert_eq!(holder.id, EntityId(7));
    }
}
