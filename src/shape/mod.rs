//! Record shapes.
//!
//! Every stored type describes its members once through a [`ShapeBuilder`].
//! The description is then classified by the introspector into a
//! [`Shape`], the closed set of member kinds the codec, the wiring and the
//! integrity scan work from.
//!
//! ```ignore
//! impl Record for Person {
//!     const NAME: &'static str = "Person";
//!
//!     fn describe(shape: &mut ShapeBuilder<Self>) {
//!         shape.identity("id", |p| &p.id, |p| &mut p.id);
//!         shape.nullable_foreign_key("company_id", |p| &p.company_id);
//!         shape.scalar("name", |p| &p.name, |p| &mut p.name);
//!         shape.link("company", |p| &p.company, |p| &mut p.company);
//!         shape.exclude("scratch");
//!     }
//! }
//! ```

mod introspect;
mod members;

pub use introspect::Shape;
pub(crate) use introspect::{LinkTarget, Slot};
pub(crate) use members::{EmbeddedPlan, EmbeddedSlot, ScalarSlot};

use crate::codec::Scalar;
use crate::links::wiring::{LinkPlan, ManyPlan};
use crate::links::{ForeignKey, Many, Ref};
use crate::types::EntityId;

/// A type the archive can store or embed.
pub trait Record: Default + Send + Sync + 'static {
    /// Stable type name. Used for stream names and in error messages.
    const NAME: &'static str;

    /// Declare the members of this type, in stream order.
    fn describe(shape: &mut ShapeBuilder<Self>);
}

/// Scalar value kinds known to the codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalarKind {
    Bool,
    U8,
    I8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Char,
    Text,
    Timestamp,
    /// Enumeration written as its 32-bit discriminant.
    Enum(&'static str),
}

/// What a scalar member means to the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalarRole {
    Plain,
    Identity,
    ForeignKey,
}

/// Classification of a declared member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemberKind {
    Scalar {
        kind: ScalarKind,
        nullable: bool,
        role: ScalarRole,
    },
    Embedded {
        type_name: &'static str,
        nullable: bool,
    },
    SingleLink {
        target: &'static str,
        foreign_key: String,
        nullable: bool,
    },
    MultiLink {
        target: &'static str,
        foreign_key: String,
    },
    Excluded,
}

impl MemberKind {
    /// Whether the member is written to the record stream.
    pub fn is_persisted(&self) -> bool {
        matches!(self, MemberKind::Scalar { .. } | MemberKind::Embedded { .. })
    }
}

/// Typed accessor pair for one member.
pub(crate) struct Field<T, F> {
    pub get: fn(&T) -> &F,
    pub get_mut: fn(&mut T) -> &mut F,
}

impl<T, F> Clone for Field<T, F> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, F> Copy for Field<T, F> {}

/// Accessor for a foreign-key member. Foreign keys mutate through a shared
/// cell, so a getter is enough.
pub(crate) type KeyAccessor<T> = fn(&T) -> &ForeignKey;

pub(crate) struct RawMember<T> {
    pub name: &'static str,
    pub slot: RawSlot<T>,
    pub foreign_key: Option<&'static str>,
}

pub(crate) enum RawSlot<T> {
    Identity(Field<T, EntityId>),
    Scalar {
        kind: ScalarKind,
        nullable: bool,
        slot: Box<dyn ScalarSlot<T>>,
    },
    ForeignKey {
        get: KeyAccessor<T>,
        nullable: bool,
    },
    Embedded(Box<dyn EmbeddedPlan<T>>),
    Link(Box<dyn LinkPlan<T>>),
    Many(Box<dyn ManyPlan<T>>),
    Excluded,
}

/// Collects the member declarations of a record type.
pub struct ShapeBuilder<T> {
    pub(crate) members: Vec<RawMember<T>>,
}

impl<T: Record> ShapeBuilder<T> {
    pub(crate) fn describe() -> Self {
        let mut builder = Self {
            members: Vec::new(),
        };
        T::describe(&mut builder);
        builder
    }

    fn push(&mut self, name: &'static str, slot: RawSlot<T>) -> &mut RawMember<T> {
        self.members.push(RawMember {
            name,
            slot,
            foreign_key: None,
        });
        let last = self.members.len() - 1;
        &mut self.members[last]
    }

    /// Declare the identity member.
    pub fn identity(
        &mut self,
        name: &'static str,
        get: fn(&T) -> &EntityId,
        get_mut: fn(&mut T) -> &mut EntityId,
    ) -> &mut Self {
        self.push(name, RawSlot::Identity(Field { get, get_mut }));
        self
    }

    /// Declare a scalar member. `Option<_>` scalars are nullable.
    pub fn scalar<F: Scalar>(
        &mut self,
        name: &'static str,
        get: fn(&T) -> &F,
        get_mut: fn(&mut T) -> &mut F,
    ) -> &mut Self {
        self.push(
            name,
            RawSlot::Scalar {
                kind: F::KIND,
                nullable: F::NULLABLE,
                slot: Box::new(Field { get, get_mut }),
            },
        );
        self
    }

    /// Declare a foreign key that always holds a value on disk (0 when unset).
    pub fn foreign_key(&mut self, name: &'static str, get: KeyAccessor<T>) -> &mut Self {
        self.push(
            name,
            RawSlot::ForeignKey {
                get,
                nullable: false,
            },
        );
        self
    }

    /// Declare a foreign key written with a presence flag.
    pub fn nullable_foreign_key(&mut self, name: &'static str, get: KeyAccessor<T>) -> &mut Self {
        self.push(name, RawSlot::ForeignKey { get, nullable: true });
        self
    }

    /// Declare an embedded value, serialized inline through its own shape.
    pub fn embedded<E: Record>(
        &mut self,
        name: &'static str,
        get: fn(&T) -> &E,
        get_mut: fn(&mut T) -> &mut E,
    ) -> &mut Self {
        self.push(
            name,
            RawSlot::Embedded(members::embedded_plan(Field { get, get_mut })),
        );
        self
    }

    /// Declare an optional embedded value, written with a presence flag.
    pub fn optional_embedded<E: Record>(
        &mut self,
        name: &'static str,
        get: fn(&T) -> &Option<E>,
        get_mut: fn(&mut T) -> &mut Option<E>,
    ) -> &mut Self {
        self.push(
            name,
            RawSlot::Embedded(members::optional_embedded_plan(Field { get, get_mut })),
        );
        self
    }

    /// Declare a link to a single record of another store.
    ///
    /// The link is backed by the foreign key `{name}_id` on this type unless
    /// overridden through the returned options.
    pub fn link<U: Record>(
        &mut self,
        name: &'static str,
        get: fn(&T) -> &Ref<U>,
        get_mut: fn(&mut T) -> &mut Ref<U>,
    ) -> LinkOptions<'_> {
        let plan = crate::links::wiring::single_plan(name, Field { get, get_mut });
        let member = self.push(name, RawSlot::Link(plan));
        LinkOptions {
            foreign_key: &mut member.foreign_key,
        }
    }

    /// Declare a collection of records whose foreign key points back at
    /// this record.
    ///
    /// The foreign key on the target defaults to `{owner}_id` with the owner
    /// type name in snake case.
    pub fn many<U: Record>(
        &mut self,
        name: &'static str,
        get: fn(&T) -> &Many<U>,
        get_mut: fn(&mut T) -> &mut Many<U>,
    ) -> LinkOptions<'_> {
        let plan = crate::links::wiring::many_plan(name, Field { get, get_mut });
        let member = self.push(name, RawSlot::Many(plan));
        LinkOptions {
            foreign_key: &mut member.foreign_key,
        }
    }

    /// Declare a member that is never serialized, wired or scanned.
    pub fn exclude(&mut self, name: &'static str) -> &mut Self {
        self.push(name, RawSlot::Excluded);
        self
    }
}

/// Options for a link declaration.
pub struct LinkOptions<'a> {
    foreign_key: &'a mut Option<&'static str>,
}

impl LinkOptions<'_> {
    /// Use an explicitly named foreign key instead of the convention.
    pub fn foreign_key(self, name: &'static str) {
        *self.foreign_key = Some(name);
    }
}
