//! Typed member slots: scalars and embedded values.

use super::{Field, Record, Shape};
use crate::codec::{read_flag, write_flag, Scalar};
use crate::container::ContainerCore;
use crate::error::{Result, StoreError};
use crate::integrity::{Probe, Site};
use crate::links::wiring::{Deferred, Holder};
use crate::links::ForeignKey;
use crate::shape::LinkTarget;
use crate::types::EntityId;
use std::any::TypeId;
use std::io::{self, Read, Write};
use std::sync::Arc;

pub(crate) trait ScalarSlot<T>: Send + Sync {
    fn encode(&self, record: &T, w: &mut dyn Write) -> io::Result<()>;
    fn decode(&self, record: &mut T, r: &mut dyn Read) -> io::Result<()>;
}

impl<T: 'static, F: Scalar> ScalarSlot<T> for Field<T, F> {
    fn encode(&self, record: &T, w: &mut dyn Write) -> io::Result<()> {
        (self.get)(record).encode(w)
    }

    fn decode(&self, record: &mut T, r: &mut dyn Read) -> io::Result<()> {
        *(self.get_mut)(record) = F::decode(r)?;
        Ok(())
    }
}

/// An embedded value with its own resolved shape.
pub(crate) trait EmbeddedSlot<T>: Send + Sync {
    fn encode(&self, record: &T, w: &mut dyn Write) -> io::Result<()>;
    fn decode(&self, record: &mut T, r: &mut dyn Read) -> io::Result<()>;
    fn has_links(&self) -> bool;
    fn link_targets(&self, prefix: &str, out: &mut Vec<LinkTarget>);
    fn is_bound(&self, record: &T, core: &ContainerCore) -> bool;
    fn bind(
        &self,
        record: &mut T,
        holder: Holder,
        core: &ContainerCore,
        deferred: &mut Vec<Deferred<T>>,
    ) -> Result<()>;
    fn sites_to(&self, target: TypeId, prefix: &str) -> Vec<Site<T>>;
}

/// An embedded declaration waiting for its shape to be introspected.
pub(crate) trait EmbeddedPlan<T> {
    fn type_name(&self) -> &'static str;
    fn nullable(&self) -> bool;
    fn resolve(&self, visiting: &mut Vec<TypeId>) -> Result<Box<dyn EmbeddedSlot<T>>>;
}

pub(crate) fn embedded_plan<T: Record, E: Record>(
    field: Field<T, E>,
) -> Box<dyn EmbeddedPlan<T>> {
    Box::new(Inline { field, shape: () })
}

pub(crate) fn optional_embedded_plan<T: Record, E: Record>(
    field: Field<T, Option<E>>,
) -> Box<dyn EmbeddedPlan<T>> {
    Box::new(OptionalInline { field, shape: () })
}

fn embedded_shape<E: Record>(visiting: &mut Vec<TypeId>) -> Result<Shape<E>> {
    let shape = Shape::<E>::introspect_within(visiting)?;
    if shape.identity().is_some() {
        return Err(StoreError::config(
            E::NAME,
            None,
            "embedded values cannot declare an identity; declare a link instead",
        ));
    }
    Ok(shape)
}

fn nest<T: Record, E: Record>(
    site: Site<E>,
    probe: impl Fn(&T, &Probe<E>) -> Option<ForeignKey> + Send + Sync + 'static,
) -> Site<T> {
    let inner = site.probe;
    Site {
        path: site.path,
        probe: Arc::new(move |record: &T| probe(record, &inner)),
    }
}

/// A required embedded value. `S` is `()` until the shape is resolved.
struct Inline<T, E, S> {
    field: Field<T, E>,
    shape: S,
}

impl<T: Record, E: Record> EmbeddedPlan<T> for Inline<T, E, ()> {
    fn type_name(&self) -> &'static str {
        E::NAME
    }

    fn nullable(&self) -> bool {
        false
    }

    fn resolve(&self, visiting: &mut Vec<TypeId>) -> Result<Box<dyn EmbeddedSlot<T>>> {
        Ok(Box::new(Inline {
            field: self.field,
            shape: embedded_shape::<E>(visiting)?,
        }))
    }
}

impl<T: Record, E: Record> EmbeddedSlot<T> for Inline<T, E, Shape<E>> {
    fn encode(&self, record: &T, w: &mut dyn Write) -> io::Result<()> {
        self.shape.encode((self.field.get)(record), w)
    }

    fn decode(&self, record: &mut T, r: &mut dyn Read) -> io::Result<()> {
        *(self.field.get_mut)(record) = self.shape.decode(r)?;
        Ok(())
    }

    fn has_links(&self) -> bool {
        self.shape.has_links()
    }

    fn link_targets(&self, prefix: &str, out: &mut Vec<LinkTarget>) {
        self.shape.link_targets(prefix, out);
    }

    fn is_bound(&self, record: &T, core: &ContainerCore) -> bool {
        self.shape
            .is_bound((self.field.get)(record), EntityId::UNSET, core)
    }

    fn bind(
        &self,
        record: &mut T,
        holder: Holder,
        core: &ContainerCore,
        deferred: &mut Vec<Deferred<T>>,
    ) -> Result<()> {
        let get_mut = self.field.get_mut;
        let mut inner = Vec::new();
        let bound = self
            .shape
            .bind(get_mut(record), EntityId::UNSET, holder, core, &mut inner);
        deferred.extend(
            inner
                .into_iter()
                .map(|step| step.nest(move |record: &mut T| Some(get_mut(record)))),
        );
        bound
    }

    fn sites_to(&self, target: TypeId, prefix: &str) -> Vec<Site<T>> {
        let get = self.field.get;
        self.shape
            .sites_to(target, prefix)
            .into_iter()
            .map(|site| nest(site, move |record: &T, inner: &Probe<E>| inner(get(record))))
            .collect()
    }
}

/// An optional embedded value, written behind a presence flag.
struct OptionalInline<T, E, S> {
    field: Field<T, Option<E>>,
    shape: S,
}

impl<T: Record, E: Record> EmbeddedPlan<T> for OptionalInline<T, E, ()> {
    fn type_name(&self) -> &'static str {
        E::NAME
    }

    fn nullable(&self) -> bool {
        true
    }

    fn resolve(&self, visiting: &mut Vec<TypeId>) -> Result<Box<dyn EmbeddedSlot<T>>> {
        Ok(Box::new(OptionalInline {
            field: self.field,
            shape: embedded_shape::<E>(visiting)?,
        }))
    }
}

impl<T: Record, E: Record> EmbeddedSlot<T> for OptionalInline<T, E, Shape<E>> {
    fn encode(&self, record: &T, w: &mut dyn Write) -> io::Result<()> {
        match (self.field.get)(record) {
            Some(value) => {
                write_flag(w, true)?;
                self.shape.encode(value, w)
            }
            None => write_flag(w, false),
        }
    }

    fn decode(&self, record: &mut T, r: &mut dyn Read) -> io::Result<()> {
        let value = if read_flag(r)? {
            Some(self.shape.decode(r)?)
        } else {
            None
        };
        *(self.field.get_mut)(record) = value;
        Ok(())
    }

    fn has_links(&self) -> bool {
        self.shape.has_links()
    }

    fn link_targets(&self, prefix: &str, out: &mut Vec<LinkTarget>) {
        self.shape.link_targets(prefix, out);
    }

    fn is_bound(&self, record: &T, core: &ContainerCore) -> bool {
        (self.field.get)(record)
            .as_ref()
            .map_or(true, |value| self.shape.is_bound(value, EntityId::UNSET, core))
    }

    fn bind(
        &self,
        record: &mut T,
        holder: Holder,
        core: &ContainerCore,
        deferred: &mut Vec<Deferred<T>>,
    ) -> Result<()> {
        let get_mut = self.field.get_mut;
        let Some(value) = get_mut(record) else {
            return Ok(());
        };
        let mut inner = Vec::new();
        let bound = self
            .shape
            .bind(value, EntityId::UNSET, holder, core, &mut inner);
        deferred.extend(
            inner
                .into_iter()
                .map(|step| step.nest(move |record: &mut T| get_mut(record).as_mut())),
        );
        bound
    }

    fn sites_to(&self, target: TypeId, prefix: &str) -> Vec<Site<T>> {
        let get = self.field.get;
        self.shape
            .sites_to(target, prefix)
            .into_iter()
            .map(|site| {
                nest(site, move |record: &T, inner: &Probe<E>| {
                    get(record).as_ref().and_then(|value| inner(value))
                })
            })
            .collect()
    }
}
