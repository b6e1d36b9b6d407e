//! Member classification and validation.

use super::members::{EmbeddedSlot, ScalarSlot};
use super::{
    Field, KeyAccessor, MemberKind, RawMember, RawSlot, Record, ScalarKind, ScalarRole, ShapeBuilder,
};
use crate::error::{Result, StoreError};
use crate::integrity::{Probe, Site};
use crate::links::wiring::LinkSlot;
use crate::types::EntityId;
use heck::ToSnakeCase;
use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// The classified members of a record type, in stream order.
pub struct Shape<T> {
    pub(crate) members: Vec<Member<T>>,
    identity: Option<Field<T, EntityId>>,
    has_links: bool,
}

pub(crate) struct Member<T> {
    pub name: &'static str,
    pub kind: MemberKind,
    pub slot: Slot<T>,
}

pub(crate) enum Slot<T> {
    Identity(Field<T, EntityId>),
    Scalar(Box<dyn ScalarSlot<T>>),
    ForeignKey { get: KeyAccessor<T>, nullable: bool },
    Embedded(Box<dyn EmbeddedSlot<T>>),
    SingleLink {
        link: Box<dyn LinkSlot<T>>,
        key: KeyAccessor<T>,
    },
    MultiLink(Box<dyn LinkSlot<T>>),
    Excluded,
}

/// A link found while walking a shape, used to check that every target
/// has a store.
pub(crate) struct LinkTarget {
    pub type_id: TypeId,
    pub type_name: &'static str,
    pub member: String,
}

impl<T: Record> Shape<T> {
    /// Classify and validate the members `T` declares.
    pub fn introspect() -> Result<Self> {
        Self::introspect_within(&mut Vec::new())
    }

    pub(crate) fn introspect_within(visiting: &mut Vec<TypeId>) -> Result<Self> {
        // Accessors may hand back the record itself or a boxed copy, so an
        // embedding can cycle even though no type contains itself by value.
        let me = TypeId::of::<T>();
        if visiting.contains(&me) {
            return Err(StoreError::config(
                T::NAME,
                None,
                "embedded value contains itself",
            ));
        }
        visiting.push(me);
        let shape = Self::classify(ShapeBuilder::<T>::describe(), visiting);
        visiting.pop();
        shape
    }

    fn classify(builder: ShapeBuilder<T>, visiting: &mut Vec<TypeId>) -> Result<Self> {
        let mut names = HashSet::new();
        let mut identity = None;
        let mut keys: HashMap<&'static str, (KeyAccessor<T>, bool)> = HashMap::new();

        for raw in &builder.members {
            if !names.insert(raw.name) {
                return Err(StoreError::config(
                    T::NAME,
                    Some(raw.name),
                    "member declared more than once",
                ));
            }
            match &raw.slot {
                RawSlot::Identity(field) => {
                    if identity.is_some() {
                        return Err(StoreError::config(
                            T::NAME,
                            Some(raw.name),
                            "only one identity member may be declared",
                        ));
                    }
                    identity = Some(*field);
                }
                RawSlot::ForeignKey { get, nullable } => {
                    keys.insert(raw.name, (*get, *nullable));
                }
                _ => {}
            }
        }

        let mut members = Vec::with_capacity(builder.members.len());
        let mut has_links = false;

        for raw in builder.members {
            let RawMember {
                name,
                slot,
                foreign_key,
            } = raw;

            let (kind, slot) = match slot {
                RawSlot::Identity(field) => (
                    MemberKind::Scalar {
                        kind: ScalarKind::I64,
                        nullable: false,
                        role: ScalarRole::Identity,
                    },
                    Slot::Identity(field),
                ),
                RawSlot::Scalar {
                    kind,
                    nullable,
                    slot,
                } => (
                    MemberKind::Scalar {
                        kind,
                        nullable,
                        role: ScalarRole::Plain,
                    },
                    Slot::Scalar(slot),
                ),
                RawSlot::ForeignKey { get, nullable } => (
                    MemberKind::Scalar {
                        kind: ScalarKind::I64,
                        nullable,
                        role: ScalarRole::ForeignKey,
                    },
                    Slot::ForeignKey { get, nullable },
                ),
                RawSlot::Embedded(plan) => {
                    let slot = plan.resolve(visiting)?;
                    has_links |= slot.has_links();
                    (
                        MemberKind::Embedded {
                            type_name: plan.type_name(),
                            nullable: plan.nullable(),
                        },
                        Slot::Embedded(slot),
                    )
                }
                RawSlot::Link(plan) => {
                    let fk = foreign_key
                        .map(str::to_owned)
                        .unwrap_or_else(|| format!("{name}_id"));
                    let (key, nullable) = keys.get(fk.as_str()).copied().ok_or_else(|| {
                        StoreError::config(
                            T::NAME,
                            Some(name),
                            format!("foreign key property {fk} not found on {}", T::NAME),
                        )
                    })?;
                    let (_, target) = plan.target();
                    has_links = true;
                    (
                        MemberKind::SingleLink {
                            target,
                            foreign_key: fk,
                            nullable,
                        },
                        Slot::SingleLink {
                            link: plan.bind(key),
                            key,
                        },
                    )
                }
                RawSlot::Many(plan) => {
                    if identity.is_none() {
                        return Err(StoreError::config(
                            T::NAME,
                            Some(name),
                            format!("{} needs an identity to own a collection", T::NAME),
                        ));
                    }
                    let fk = foreign_key
                        .map(str::to_owned)
                        .unwrap_or_else(|| format!("{}_id", T::NAME.to_snake_case()));
                    let (_, target) = plan.target();
                    let link = plan.resolve(T::NAME, &fk)?;
                    has_links = true;
                    (
                        MemberKind::MultiLink {
                            target,
                            foreign_key: fk,
                        },
                        Slot::MultiLink(link),
                    )
                }
                RawSlot::Excluded => (MemberKind::Excluded, Slot::Excluded),
            };

            members.push(Member { name, kind, slot });
        }

        Ok(Self {
            members,
            identity,
            has_links,
        })
    }

    /// Record type name.
    pub fn name(&self) -> &'static str {
        T::NAME
    }

    /// Members and their classification, in stream order.
    pub fn members(&self) -> impl Iterator<Item = (&'static str, &MemberKind)> + '_ {
        self.members.iter().map(|m| (m.name, &m.kind))
    }

    /// Classification of a single member.
    pub fn member(&self, name: &str) -> Option<&MemberKind> {
        self.members
            .iter()
            .find(|m| m.name == name)
            .map(|m| &m.kind)
    }

    pub fn has_identity(&self) -> bool {
        self.identity.is_some()
    }

    /// Whether any member, directly or through embedded values, is a link.
    pub fn has_links(&self) -> bool {
        self.has_links
    }

    pub(crate) fn identity(&self) -> Option<Field<T, EntityId>> {
        self.identity
    }

    pub(crate) fn link_targets(&self, prefix: &str, out: &mut Vec<LinkTarget>) {
        for member in &self.members {
            match &member.slot {
                Slot::SingleLink { link, .. } | Slot::MultiLink(link) => {
                    let (type_id, type_name) = link.target();
                    out.push(LinkTarget {
                        type_id,
                        type_name,
                        member: format!("{prefix}{}", member.name),
                    });
                }
                Slot::Embedded(slot) => {
                    slot.link_targets(&format!("{prefix}{}.", member.name), out);
                }
                _ => {}
            }
        }
    }

    /// Every single-link foreign key that can point at records of `target`,
    /// walking embedded values.
    pub(crate) fn sites_to(&self, target: TypeId, prefix: &str) -> Vec<Site<T>> {
        let mut sites = Vec::new();
        for member in &self.members {
            match (&member.slot, &member.kind) {
                (Slot::SingleLink { link, key }, MemberKind::SingleLink { foreign_key, .. })
                    if link.target().0 == target =>
                {
                    let key = *key;
                    let probe: Probe<T> = Arc::new(move |record: &T| Some(key(record).share()));
                    sites.push(Site {
                        path: format!("{prefix}{foreign_key}"),
                        probe,
                    });
                }
                (Slot::Embedded(slot), _) => {
                    sites.extend(slot.sites_to(target, &format!("{prefix}{}.", member.name)));
                }
                _ => {}
            }
        }
        sites
    }
}
