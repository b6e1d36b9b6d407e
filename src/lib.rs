//! # Entity Archive
//!
//! An embedded object store that keeps collections of linked records in
//! memory and persists them, one stream pair per record type, to a
//! directory or a single archive file.
//!
//! ## Core Concepts
//!
//! - **Records**: Plain structs that describe their persisted members once
//! - **Stores**: One per record type, assigning identities from a counter
//! - **Links**: Single and multi-valued references stored as foreign keys
//!   and resolved lazily against the target store
//! - **Containers**: A schema's stores plus the location they persist to
//!
//! ## Example
//!
//! ```ignore
//! use entity_archive::{CatalogBuilder, Container, EntityId, Record, Schema, ShapeBuilder};
//!
//! #[derive(Default)]
//! struct Person {
//!     id: EntityId,
//!     name: String,
//! }
//!
//! impl Record for Person {
//!     const NAME: &'static str = "Person";
//!
//!     fn describe(shape: &mut ShapeBuilder<Self>) {
//!         shape
//!             .identity("id", |p| &p.id, |p| &mut p.id)
//!             .scalar("name", |p| &p.name, |p| &mut p.name);
//!     }
//! }
//!
//! struct People;
//!
//! impl Schema for People {
//!     fn declare(catalog: &mut CatalogBuilder) {
//!         catalog.set::<Person>("people");
//!     }
//! }
//!
//! let container = Container::<People>::open_archive("./people.ear")?;
//! let people = container.store::<Person>()?;
//! people.add(Person { name: "Alice".into(), ..Default::default() })?;
//! container.save()?;
//! ```

pub mod codec;
pub mod container;
pub mod error;
mod integrity;
pub mod links;
pub mod shape;
pub mod specialize;
pub mod store;
pub mod types;

// Re-exports
pub use codec::Scalar;
pub use container::{
    Catalog, CatalogBuilder, Container, ContainerConfig, Location, Manifest, ManifestEntry, Schema,
};
pub use error::{Result, StoreError};
pub use links::{Collection, ForeignKey, Link, Many, Ref};
pub use shape::{LinkOptions, MemberKind, Record, ScalarKind, ScalarRole, Shape, ShapeBuilder};
pub use specialize::{specialization, Specialization};
pub use store::Store;
pub use types::*;
