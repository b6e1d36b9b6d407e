//! Integration tests for containers, stores and links.

mod common;

use common::*;
use entity_archive::{
    shared, Container, ContainerConfig, EntityId, ForeignKey, Location, Many, Ref, Timestamp,
};
use std::sync::Arc;
use tempfile::TempDir;

// --- End-to-end Scenarios ---

#[test]
fn test_person_company_survives_archive_reload() {
    init_tracing();
    let dir = TempDir::new().unwrap();

    {
        let container = archive(&dir);
        let people = container.store::<Person>().unwrap();
        let companies = container.store::<Company>().unwrap();

        let alice = shared(Person {
            rank: Rank::Senior,
            nickname: Some("Al".to_string()),
            hired: Timestamp(1_700_000_000),
            ..person("Alice", 30)
        });
        let bob = shared(person("Bob", 25));

        let mut acme = company("Acme");
        acme.owner = Ref::new(Arc::clone(&alice));
        acme.employees = Many::from(vec![Arc::clone(&alice), Arc::clone(&bob)]);
        let acme = companies.add(acme).unwrap();

        assert_eq!(acme.read().id, EntityId(1));
        assert_eq!(people.len(), 2);
        assert_eq!(alice.read().id, EntityId(1));
        assert_eq!(bob.read().id, EntityId(2));
        assert_eq!(acme.read().founder.get(), Some(EntityId(1)));
        assert_eq!(bob.read().company_id.get(), Some(EntityId(1)));

        container.save().unwrap();
    }

    let container = archive(&dir);
    let people = container.store::<Person>().unwrap();
    let companies = container.store::<Company>().unwrap();
    assert_eq!(people.len(), 2);
    assert_eq!(companies.len(), 1);

    let acme = companies.find_by_key(EntityId(1)).unwrap();
    let owner = acme.read().owner.get().unwrap();
    assert_eq!(name_of(&owner), "Alice");
    assert_eq!(owner.read().rank, Rank::Senior);
    assert_eq!(owner.read().nickname.as_deref(), Some("Al"));
    assert_eq!(owner.read().hired, Timestamp(1_700_000_000));

    let mut staff: Vec<String> = acme.read().employees.items().iter().map(name_of).collect();
    staff.sort();
    assert_eq!(staff, vec!["Alice", "Bob"]);

    let bob = people.find_by_key(EntityId(2)).unwrap();
    let employer = bob.read().company.get().unwrap();
    assert!(Arc::ptr_eq(&employer, &acme));

    // Identities keep counting from the stored counter.
    let carol = people.add(person("Carol", 41)).unwrap();
    assert_eq!(carol.read().id, EntityId(3));
}

#[test]
fn test_stored_person_joins_company_through_stream_reload() {
    let source = Container::<Hr>::in_memory().unwrap();
    let people = source.store::<Person>().unwrap();
    let companies = source.store::<Company>().unwrap();

    let alice = people.add(person("Alice", 30)).unwrap();
    assert_eq!(alice.read().id, EntityId(1));

    let mut acme = company("Acme");
    acme.employees = Many::from(vec![Arc::clone(&alice)]);
    let acme = companies.add(acme).unwrap();

    assert_eq!(acme.read().id, EntityId(1));
    assert_eq!(alice.read().id, EntityId(1));
    assert_eq!(alice.read().company_id.get(), Some(EntityId(1)));
    assert_eq!(people.len(), 1);
    assert_eq!(people.last_id(), 1);
    assert!(Arc::ptr_eq(&people.find_by_key(EntityId(1)).unwrap(), &alice));

    let (mut person_ids, mut person_data) = (Vec::new(), Vec::new());
    let (mut company_ids, mut company_data) = (Vec::new(), Vec::new());
    people.save(&mut person_ids, &mut person_data).unwrap();
    companies.save(&mut company_ids, &mut company_data).unwrap();

    let target = Container::<Hr>::in_memory().unwrap();
    target
        .store::<Person>()
        .unwrap()
        .load(&mut person_ids.as_slice(), &mut person_data.as_slice())
        .unwrap();
    let reloaded = target.store::<Company>().unwrap();
    reloaded
        .load(&mut company_ids.as_slice(), &mut company_data.as_slice())
        .unwrap();

    let acme = reloaded.find_by_key(EntityId(1)).unwrap();
    let staff: Vec<String> = acme.read().employees.items().iter().map(name_of).collect();
    assert_eq!(staff, vec!["Alice"]);
}

#[test]
fn test_directory_backing_writes_one_stream_pair_per_type() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("hr");

    {
        let container = Container::<Hr>::open_directory(&root).unwrap();
        let people = container.store::<Person>().unwrap();
        people.add(person("Alice", 30)).unwrap();
        people.add(person("Bob", 25)).unwrap();
        container.save().unwrap();
    }

    for name in ["Person.id", "Person.data", "Company.id", "Company.data", "_manifest"] {
        assert!(root.join(name).exists(), "missing stream {name}");
    }
    assert_eq!(
        std::fs::read(root.join("Person.id")).unwrap(),
        2i64.to_le_bytes().to_vec()
    );
    assert!(std::fs::read(root.join("Company.data")).unwrap().is_empty());

    let container = Container::<Hr>::open_directory(&root).unwrap();
    let people = container.store::<Person>().unwrap();
    let names: Vec<String> = people.iter().map(|p| name_of(&p)).collect();
    assert_eq!(names, vec!["Alice", "Bob"]);
}

#[test]
fn test_excluded_member_is_not_persisted() {
    let dir = TempDir::new().unwrap();
    {
        let container = archive(&dir);
        let people = container.store::<Person>().unwrap();
        people
            .add(Person {
                scratch: "temporary".to_string(),
                ..person("Alice", 30)
            })
            .unwrap();
        container.save().unwrap();
    }

    let container = archive(&dir);
    let alice = container
        .store::<Person>()
        .unwrap()
        .find_by_key(EntityId(1))
        .unwrap();
    assert_eq!(alice.read().name, "Alice");
    assert_eq!(alice.read().scratch, "");
    assert_eq!(alice.read().nickname, None);
}

#[test]
fn test_embedded_value_with_link() {
    let dir = TempDir::new().unwrap();
    {
        let container = archive(&dir);
        let people = container.store::<Person>().unwrap();
        let companies = container.store::<Company>().unwrap();

        let auditor = shared(person("Dana", 52));
        let acme = companies
            .add(Company {
                finance: Some(Finance {
                    revenue: 1_250_000.5,
                    fiscal_year: 2024,
                    auditor: Ref::new(Arc::clone(&auditor)),
                    ..Default::default()
                }),
                ..company("Acme")
            })
            .unwrap();
        companies.add(company("Shell Co")).unwrap();

        assert!(people.contains(&auditor));
        let guard = acme.read();
        let finance = guard.finance.as_ref().unwrap();
        assert!(finance.auditor.is_bound());
        assert_eq!(finance.auditor_id.get(), Some(EntityId(1)));
        drop(guard);

        container.save().unwrap();
    }

    let container = archive(&dir);
    let companies = container.store::<Company>().unwrap();

    let acme = companies.find_by_key(EntityId(1)).unwrap();
    let guard = acme.read();
    let finance = guard.finance.as_ref().unwrap();
    assert_eq!(finance.revenue, 1_250_000.5);
    assert_eq!(finance.fiscal_year, 2024);
    assert_eq!(name_of(&finance.auditor.get().unwrap()), "Dana");
    drop(guard);

    let shell = companies.find_by_key(EntityId(2)).unwrap();
    assert!(shell.read().finance.is_none());
}

// --- Link Behavior Tests ---

#[test]
fn test_lazy_link_follows_foreign_key_changes() {
    let container = Container::<Hr>::in_memory().unwrap();
    let people = container.store::<Person>().unwrap();
    let companies = container.store::<Company>().unwrap();

    let acme = companies.add(company("Acme")).unwrap();
    let globex = companies.add(company("Globex")).unwrap();
    let alice = people
        .add(Person {
            company_id: ForeignKey::from(EntityId(1)),
            ..person("Alice", 30)
        })
        .unwrap();

    let employer = alice.read().company.get().unwrap();
    assert!(Arc::ptr_eq(&employer, &acme));

    alice.read().company_id.set(Some(EntityId(2)));
    let employer = alice.read().company.get().unwrap();
    assert!(Arc::ptr_eq(&employer, &globex));
    assert_eq!(alice.read().company.id(), Some(EntityId(2)));

    assert!(acme.read().employees.is_empty());
    assert_eq!(globex.read().employees.len(), 1);

    alice.read().company_id.clear();
    assert!(alice.read().company.get().is_none());
    assert!(globex.read().employees.is_empty());
}

#[test]
fn test_lazy_link_follows_target_replacement() {
    let container = Container::<Hr>::in_memory().unwrap();
    let people = container.store::<Person>().unwrap();
    let companies = container.store::<Company>().unwrap();

    companies.add(company("Acme")).unwrap();
    let alice = people
        .add(Person {
            company_id: ForeignKey::from(EntityId(1)),
            ..person("Alice", 30)
        })
        .unwrap();
    assert_eq!(alice.read().company.get().unwrap().read().name, "Acme");

    let renamed = companies
        .attach(Company {
            id: EntityId(1),
            ..company("Acme Holdings")
        })
        .unwrap();
    let employer = alice.read().company.get().unwrap();
    assert!(Arc::ptr_eq(&employer, &renamed));
}

#[test]
fn test_setting_link_adds_unsaved_target() {
    let container = Container::<Hr>::in_memory().unwrap();
    let people = container.store::<Person>().unwrap();
    let companies = container.store::<Company>().unwrap();

    let acme = companies.add(company("Acme")).unwrap();
    let erin = shared(person("Erin", 35));
    acme.write().owner.set(Some(Arc::clone(&erin))).unwrap();

    assert_eq!(erin.read().id, EntityId(1));
    assert!(people.contains(&erin));
    assert_eq!(acme.read().founder.get(), Some(EntityId(1)));
    assert_eq!(acme.read().owner.id(), Some(EntityId(1)));

    acme.write().owner.set(None).unwrap();
    assert_eq!(acme.read().founder.get(), None);
    assert!(acme.read().owner.get().is_none());
    assert_eq!(people.len(), 1);
}

#[test]
fn test_collection_push_remove_clear() {
    let container = Container::<Hr>::in_memory().unwrap();
    let people = container.store::<Person>().unwrap();
    let companies = container.store::<Company>().unwrap();

    let acme = companies.add(company("Acme")).unwrap();
    assert!(acme.read().employees.is_bound());

    let frank = shared(person("Frank", 28));
    let grace = shared(person("Grace", 33));
    acme.write().employees.push(Arc::clone(&frank)).unwrap();
    acme.write().employees.push(Arc::clone(&grace)).unwrap();

    assert_eq!(people.len(), 2);
    assert_eq!(acme.read().employees.len(), 2);
    assert_eq!(frank.read().company_id.get(), Some(EntityId(1)));

    assert!(acme.write().employees.remove(&frank));
    assert!(!acme.write().employees.remove(&frank));
    assert_eq!(frank.read().company_id.get(), None);
    assert!(people.contains(&frank));

    if let Many::Bound(collection) = &acme.read().employees {
        assert!(collection.contains(&grace));
        assert!(!collection.contains(&frank));
        assert_eq!(collection.owner(), EntityId(1));
        assert_eq!(collection.clear(), 1);
    } else {
        panic!("employees should be bound");
    }
    assert!(acme.read().employees.is_empty());
    assert_eq!(people.len(), 2);
}

#[test]
fn test_detached_collection_before_wiring() {
    let mut employees: Many<Person> = Many::default();
    let henry = shared(person("Henry", 44));
    employees.push(Arc::clone(&henry)).unwrap();
    employees.push(shared(person("Iris", 39))).unwrap();
    assert!(!employees.is_bound());
    assert_eq!(employees.len(), 2);
    assert!(employees.remove(&henry));
    assert_eq!(employees.len(), 1);

    let container = Container::<Hr>::in_memory().unwrap();
    let companies = container.store::<Company>().unwrap();
    let acme = companies
        .add(Company {
            employees,
            ..company("Acme")
        })
        .unwrap();

    let staff = acme.read().employees.items();
    assert_eq!(staff.len(), 1);
    assert_eq!(name_of(&staff[0]), "Iris");
    assert_eq!(henry.read().id, EntityId::UNSET);
}

#[test]
fn test_wiring_is_idempotent() {
    let container = Container::<Hr>::in_memory().unwrap();
    let people = container.store::<Person>().unwrap();
    let companies = container.store::<Company>().unwrap();

    let carol = people
        .add(Person {
            company: Ref::new(shared(company("Initech"))),
            ..person("Carol", 41)
        })
        .unwrap();
    assert_eq!(companies.len(), 1);
    assert_eq!(carol.read().company_id.get(), Some(EntityId(1)));
    assert!(carol.read().company.is_bound());

    let people_version = people.version();
    let companies_version = companies.version();
    people.wire(&carol).unwrap();
    people.wire(&carol).unwrap();
    assert_eq!(container.wire_all().unwrap(), 2);

    assert_eq!(companies.len(), 1);
    assert_eq!(people.version(), people_version);
    assert_eq!(companies.version(), companies_version);
    assert_eq!(name_of(&carol), "Carol");
    assert_eq!(carol.read().company.get().unwrap().read().name, "Initech");
}

#[test]
fn test_loaded_records_wired_on_access() {
    let dir = TempDir::new().unwrap();
    {
        let container = archive(&dir);
        let companies = container.store::<Company>().unwrap();
        companies
            .add(Company {
                employees: Many::from(vec![shared(person("Jay", 22))]),
                ..company("Acme")
            })
            .unwrap();
        container.save().unwrap();
    }

    let container = archive(&dir);
    let companies = container.store::<Company>().unwrap();
    let acme = companies.iter().next().unwrap();
    assert!(acme.read().employees.is_bound());
    assert!(acme.read().owner.is_bound());
    assert_eq!(acme.read().employees.len(), 1);
}

#[test]
fn test_wire_on_open_binds_loaded_records() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("hr.ear");
    {
        let container = Container::<Hr>::open_archive(&path).unwrap();
        container
            .store::<Person>()
            .unwrap()
            .add(person("Kim", 29))
            .unwrap();
        container.save().unwrap();
    }

    let container = Container::<Hr>::open(ContainerConfig {
        location: Location::Archive(path),
        wire_on_open: true,
        ..Default::default()
    })
    .unwrap();
    let people = container.store::<Person>().unwrap();
    let kim = people.find(|p| p.name == "Kim").unwrap();
    assert!(kim.read().company.is_bound());
}

// --- Container Tests ---

#[test]
fn test_manifest_and_stats() {
    let dir = TempDir::new().unwrap();
    let container = archive(&dir);
    let people = container.store::<Person>().unwrap();
    people.add(person("Alice", 30)).unwrap();
    let bob = people.add(person("Bob", 25)).unwrap();
    people.remove(&bob);

    let stats = container.stats();
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[0].record, "Person");
    assert_eq!(stats[0].slot, "people");
    assert_eq!(stats[0].records, 1);
    assert_eq!(stats[0].last_id, 2);

    let manifest = container.manifest();
    assert_eq!(manifest.schema, "Hr");
    assert_eq!(manifest.entries[1].record, "Company");
    assert_eq!(manifest.entries[1].slot, "companies");
    assert_eq!(manifest.entries[1].records, 0);

    let slots: Vec<_> = container.catalog().slots().collect();
    assert_eq!(slots, vec![("people", "Person"), ("companies", "Company")]);
    assert_eq!(
        container.location(),
        &Location::Archive(dir.path().join("hr.ear"))
    );
}

#[test]
fn test_in_memory_save_is_noop() {
    let container = Container::<Hr>::in_memory().unwrap();
    container
        .store::<Person>()
        .unwrap()
        .add(person("Alice", 30))
        .unwrap();
    container.save().unwrap();
    assert_eq!(container.location(), &Location::Memory);

    let fresh = Container::<Hr>::in_memory().unwrap();
    assert!(fresh.store::<Person>().unwrap().is_empty());
}

#[test]
fn test_specialization_shared_between_containers() {
    let first = Container::<Hr>::in_memory().unwrap();
    let second = Container::<Hr>::in_memory().unwrap();
    let a = first.store::<Person>().unwrap();
    let b = second.store::<Person>().unwrap();
    assert!(Arc::ptr_eq(a.specialization(), b.specialization()));

    let paths = b.specialization().referencing_paths();
    assert_eq!(paths, vec!["companies.finance.auditor_id", "companies.owner_id"]);
}
