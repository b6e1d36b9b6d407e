//! Fixture record types shared by the integration tests.

#![allow(dead_code)]

use entity_archive::{
    scalar_enum, CatalogBuilder, Container, EntityId, ForeignKey, Many, Record, Ref, Schema,
    ShapeBuilder, Shared, Timestamp,
};
use tempfile::TempDir;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Rank {
    #[default]
    Junior,
    Senior,
    Principal,
}

scalar_enum!(Rank { Junior, Senior, Principal });

#[derive(Debug, Default)]
pub struct Person {
    pub id: EntityId,
    pub name: String,
    pub age: i32,
    pub rank: Rank,
    pub nickname: Option<String>,
    pub hired: Timestamp,
    pub company_id: ForeignKey,
    pub company: Ref<Company>,
    /// Never persisted.
    pub scratch: String,
}

impl Record for Person {
    const NAME: &'static str = "Person";

    fn describe(shape: &mut ShapeBuilder<Self>) {
        shape
            .identity("id", |p| &p.id, |p| &mut p.id)
            .scalar("name", |p| &p.name, |p| &mut p.name)
            .scalar("age", |p| &p.age, |p| &mut p.age)
            .scalar("rank", |p| &p.rank, |p| &mut p.rank)
            .scalar("nickname", |p| &p.nickname, |p| &mut p.nickname)
            .scalar("hired", |p| &p.hired, |p| &mut p.hired)
            .nullable_foreign_key("company_id", |p| &p.company_id)
            .exclude("scratch");
        shape.link("company", |p| &p.company, |p| &mut p.company);
    }
}

/// Embedded in [`Company`]; carries its own link.
#[derive(Debug, Default)]
pub struct Finance {
    pub revenue: f64,
    pub fiscal_year: u16,
    pub auditor_id: ForeignKey,
    pub auditor: Ref<Person>,
}

impl Record for Finance {
    const NAME: &'static str = "Finance";

    fn describe(shape: &mut ShapeBuilder<Self>) {
        shape
            .scalar("revenue", |f| &f.revenue, |f| &mut f.revenue)
            .scalar("fiscal_year", |f| &f.fiscal_year, |f| &mut f.fiscal_year)
            .nullable_foreign_key("auditor_id", |f| &f.auditor_id);
        shape.link("auditor", |f| &f.auditor, |f| &mut f.auditor);
    }
}

#[derive(Debug, Default)]
pub struct Company {
    pub id: EntityId,
    pub name: String,
    pub founder: ForeignKey,
    pub owner: Ref<Person>,
    pub finance: Option<Finance>,
    pub employees: Many<Person>,
}

impl Record for Company {
    const NAME: &'static str = "Company";

    fn describe(shape: &mut ShapeBuilder<Self>) {
        shape
            .identity("id", |c| &c.id, |c| &mut c.id)
            .scalar("name", |c| &c.name, |c| &mut c.name)
            .foreign_key("owner_id", |c| &c.founder)
            .optional_embedded("finance", |c| &c.finance, |c| &mut c.finance);
        shape.link("owner", |c| &c.owner, |c| &mut c.owner);
        shape.many("employees", |c| &c.employees, |c| &mut c.employees);
    }
}

pub struct Hr;

impl Schema for Hr {
    fn declare(catalog: &mut CatalogBuilder) {
        catalog.set::<Person>("people").set::<Company>("companies");
    }
}

pub fn person(name: &str, age: i32) -> Person {
    Person {
        name: name.to_string(),
        age,
        ..Default::default()
    }
}

pub fn company(name: &str) -> Company {
    Company {
        name: name.to_string(),
        ..Default::default()
    }
}

pub fn archive(dir: &TempDir) -> Container<Hr> {
    Container::<Hr>::open_archive(dir.path().join("hr.ear")).unwrap()
}

/// Route store logs to the test harness. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn name_of(record: &Shared<Person>) -> String {
    record.read().name.clone()
}
