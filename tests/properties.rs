//! Property tests for persistence and identity assignment.

mod common;

use common::*;
use entity_archive::{Container, EntityId, ForeignKey, Timestamp};
use proptest::prelude::*;

fn rank_strategy() -> impl Strategy<Value = Rank> {
    prop_oneof![Just(Rank::Junior), Just(Rank::Senior), Just(Rank::Principal)]
}

fn person_strategy() -> impl Strategy<Value = Person> {
    (
        "\\PC{0,24}",
        any::<i32>(),
        rank_strategy(),
        proptest::option::of("[a-z]{1,8}"),
        any::<i64>(),
        proptest::option::of(1i64..1000),
    )
        .prop_map(|(name, age, rank, nickname, hired, company)| Person {
            name,
            age,
            rank,
            nickname,
            hired: Timestamp(hired),
            company_id: ForeignKey::new(company.map(EntityId)),
            ..Default::default()
        })
}

#[derive(Clone, Debug)]
enum Op {
    Add,
    Remove(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![3 => Just(Op::Add), 1 => any::<usize>().prop_map(Op::Remove)]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    })]

    /// Saved records load back with identical persisted members.
    #[test]
    fn prop_store_roundtrip(people in proptest::collection::vec(person_strategy(), 0..20)) {
        let source = Container::<Hr>::in_memory().unwrap();
        let store = source.store::<Person>().unwrap();
        let expected: Vec<_> = people
            .into_iter()
            .map(|p| store.add(p).unwrap())
            .collect();

        let mut ids = Vec::new();
        let mut data = Vec::new();
        prop_assert_eq!(store.save(&mut ids, &mut data).unwrap(), expected.len());

        let target = Container::<Hr>::in_memory().unwrap();
        let loaded = target.store::<Person>().unwrap();
        loaded.load(&mut ids.as_slice(), &mut data.as_slice()).unwrap();
        prop_assert_eq!(loaded.len(), expected.len());
        prop_assert_eq!(loaded.last_id(), store.last_id());

        for original in &expected {
            let original = original.read();
            let copy = loaded.find_by_key(original.id).unwrap();
            let copy = copy.read();
            prop_assert_eq!(&copy.name, &original.name);
            prop_assert_eq!(copy.age, original.age);
            prop_assert_eq!(copy.rank, original.rank);
            prop_assert_eq!(&copy.nickname, &original.nickname);
            prop_assert_eq!(copy.hired, original.hired);
            prop_assert_eq!(copy.company_id.get(), original.company_id.get());
        }
    }

    /// Identities only grow, whatever removals happen in between.
    #[test]
    fn prop_identities_never_reused(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let container = Container::<Hr>::in_memory().unwrap();
        let store = container.store::<Person>().unwrap();
        let mut live = Vec::new();
        let mut highest = 0;

        for op in ops {
            match op {
                Op::Add => {
                    let id = store.add(person("p", 1)).unwrap().read().id;
                    prop_assert!(id.0 > highest);
                    highest = id.0;
                    live.push(id);
                }
                Op::Remove(index) if !live.is_empty() => {
                    let id = live.remove(index % live.len());
                    prop_assert!(store.remove_key(id).is_some());
                }
                Op::Remove(_) => {}
            }
            prop_assert_eq!(store.len(), live.len());
            prop_assert_eq!(store.last_id(), highest);
        }
    }

    /// Attaching a record without an identity is the same as adding it.
    #[test]
    fn prop_attach_unset_matches_add(count in 1usize..20) {
        let added = Container::<Hr>::in_memory().unwrap();
        let attached = Container::<Hr>::in_memory().unwrap();
        let by_add = added.store::<Person>().unwrap();
        let by_attach = attached.store::<Person>().unwrap();

        for i in 0..count {
            let a = by_add.add(person(&format!("p{i}"), i as i32)).unwrap();
            let b = by_attach.attach(person(&format!("p{i}"), i as i32)).unwrap();
            prop_assert_eq!(a.read().id, b.read().id);
        }
        prop_assert_eq!(by_add.len(), by_attach.len());
        prop_assert_eq!(by_add.last_id(), by_attach.last_id());
    }
}
