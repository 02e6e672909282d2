//! Optimistic merge checks between concurrent contexts.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use common::{commit, document, link, members, person, schema};
use revkb_core::{CoreError, ItemReader, KnowledgeBase, MergeConflict, Value};
use revkb_storage::InMemoryBackend;

fn conflicts_of(err: CoreError) -> Vec<MergeConflict> {
    assert!(err.is_conflict(), "expected a conflict, got {err}");
    err.conflicts().to_vec()
}

#[test]
fn concurrent_change_is_rejected_and_context_stays_open() {
    let kb = common::open();
    let setup = kb.begin_transaction("setup").unwrap();
    let ada = person(&setup, "ada");
    commit(&setup);

    let first = kb.begin_transaction("ada").unwrap();
    let second = kb.begin_transaction("bob").unwrap();
    first.set_value(&ada, "city", "paris").unwrap();
    second.set_value(&ada, "city", "rome").unwrap();
    let r2 = commit(&first);

    let conflicts = conflicts_of(second.commit().unwrap_err());
    assert_eq!(
        conflicts,
        vec![MergeConflict::ConcurrentChange {
            key: ada.key().clone(),
            revision: r2,
        }]
    );
    assert!(second.is_open());
    assert_eq!(second.value(&ada, "city").unwrap(), Value::from("rome"));

    // The session cannot move past the conflicting commit either.
    assert!(second.update_session_revision().unwrap_err().is_conflict());
    assert_eq!(second.session_revision(), r2 - 1);
    second.rollback().unwrap();
    assert_eq!(kb.reader(r2).values(&ada).unwrap()[1], Value::from("paris"));
}

#[test]
fn disjoint_changes_merge() {
    let kb = common::open();
    let setup = kb.begin_transaction("setup").unwrap();
    let ada = person(&setup, "ada");
    let bob = person(&setup, "bob");
    commit(&setup);

    let first = kb.begin_transaction("ada").unwrap();
    let second = kb.begin_transaction("bob").unwrap();
    first.set_value(&ada, "city", "paris").unwrap();
    second.set_value(&bob, "city", "rome").unwrap();
    commit(&first);
    let r3 = commit(&second);

    assert_eq!(ada.value_at("city", r3).unwrap(), Value::from("paris"));
    assert_eq!(bob.value_at("city", r3).unwrap(), Value::from("rome"));
}

#[test]
fn change_against_concurrent_delete() {
    let kb = common::open();
    let setup = kb.begin_transaction("setup").unwrap();
    let ada = person(&setup, "ada");
    commit(&setup);

    let deleter = kb.begin_transaction("ada").unwrap();
    let editor = kb.begin_transaction("bob").unwrap();
    deleter.delete(&ada).unwrap();
    editor.set_value(&ada, "city", "rome").unwrap();
    commit(&deleter);

    assert_eq!(
        conflicts_of(editor.commit().unwrap_err()),
        vec![MergeConflict::ChangedDeleted {
            key: ada.key().clone()
        }]
    );
}

#[test]
fn flex_change_against_concurrent_delete() {
    let kb = common::open();
    let setup = kb.begin_transaction("setup").unwrap();
    let ada = person(&setup, "ada");
    commit(&setup);

    let deleter = kb.begin_transaction("ada").unwrap();
    let editor = kb.begin_transaction("bob").unwrap();
    deleter.delete(&ada).unwrap();
    editor.set_value(&ada, "nickname", "a").unwrap();
    commit(&deleter);

    assert_eq!(
        conflicts_of(editor.commit().unwrap_err()),
        vec![MergeConflict::ChangedDeleted {
            key: ada.key().clone()
        }]
    );
}

#[test]
fn delete_against_concurrent_change() {
    let kb = common::open();
    let setup = kb.begin_transaction("setup").unwrap();
    let ada = person(&setup, "ada");
    commit(&setup);

    let editor = kb.begin_transaction("ada").unwrap();
    let deleter = kb.begin_transaction("bob").unwrap();
    editor.set_value(&ada, "city", "rome").unwrap();
    deleter.delete(&ada).unwrap();
    let r2 = commit(&editor);

    assert_eq!(
        conflicts_of(deleter.commit().unwrap_err()),
        vec![MergeConflict::DeletedChanged {
            key: ada.key().clone(),
            revision: r2,
        }]
    );
}

#[test]
fn reference_to_concurrently_deleted_object() {
    let kb = common::open();
    let setup = kb.begin_transaction("setup").unwrap();
    let doc = document(&setup, "d");
    let ada = person(&setup, "ada");
    commit(&setup);

    let deleter = kb.begin_transaction("ada").unwrap();
    let writer = kb.begin_transaction("bob").unwrap();
    deleter.delete(&ada).unwrap();
    writer.set_reference(&doc, "owner", &ada).unwrap();
    commit(&deleter);

    assert_eq!(
        conflicts_of(writer.commit().unwrap_err()),
        vec![MergeConflict::ReferenceToDeleted {
            key: doc.key().clone(),
            target: ada.key().clone(),
        }]
    );
}

#[test]
fn deleting_a_concurrently_referenced_object() {
    let kb = common::open();
    let setup = kb.begin_transaction("setup").unwrap();
    let doc = document(&setup, "d");
    let ada = person(&setup, "ada");
    commit(&setup);

    let writer = kb.begin_transaction("ada").unwrap();
    let deleter = kb.begin_transaction("bob").unwrap();
    writer.set_reference(&doc, "owner", &ada).unwrap();
    deleter.delete(&ada).unwrap();
    let r2 = commit(&writer);

    assert_eq!(
        conflicts_of(deleter.commit().unwrap_err()),
        vec![MergeConflict::DeletingReference {
            key: ada.key().clone(),
            referrer: doc.key().clone(),
            revision: r2,
        }]
    );
}

#[test]
fn creation_through_another_knowledge_base() {
    let backend = Arc::new(InMemoryBackend::new());
    let kb_a = KnowledgeBase::open(backend.clone(), schema()).unwrap();
    let kb_b = KnowledgeBase::open(backend, schema()).unwrap();

    let late = kb_b.begin_transaction("bob").unwrap();
    let theirs = late.create_item_with_id("Person", 4242).unwrap();
    late.set_value(&theirs, "name", "bob").unwrap();

    let early = kb_a.begin_transaction("ada").unwrap();
    let ours = early.create_item_with_id("Person", 4242).unwrap();
    early.set_value(&ours, "name", "ada").unwrap();
    commit(&early);

    assert_eq!(
        conflicts_of(late.commit().unwrap_err()),
        vec![MergeConflict::ConcurrentCreation {
            key: theirs.key().clone()
        }]
    );
    assert!(matches!(
        kb_a.begin_transaction("ada")
            .unwrap()
            .create_item_with_id("Person", 4242)
            .unwrap_err(),
        CoreError::InvalidOperation { .. }
    ));
}

#[test]
fn change_through_another_knowledge_base_conflicts() {
    let backend = Arc::new(InMemoryBackend::new());
    let kb_a = KnowledgeBase::open(backend.clone(), schema()).unwrap();
    let kb_b = KnowledgeBase::open(backend, schema()).unwrap();

    let setup = kb_a.begin_transaction("setup").unwrap();
    let ada = person(&setup, "ada");
    commit(&setup);

    let late = kb_b.begin_transaction("bob").unwrap();
    let theirs = kb_b.resolve_object_key(ada.key()).unwrap().unwrap();
    late.set_value(&theirs, "city", "rome").unwrap();

    let early = kb_a.begin_transaction("ada").unwrap();
    early.set_value(&ada, "city", "paris").unwrap();
    let r2 = commit(&early);

    assert_eq!(
        conflicts_of(late.commit().unwrap_err()),
        vec![MergeConflict::ConcurrentChange {
            key: ada.key().clone(),
            revision: r2,
        }]
    );
    assert!(late.is_open());
    assert_eq!(kb_b.last_revision(), r2);
    assert_eq!(kb_b.reader(r2).values(&theirs).unwrap()[1], Value::from("paris"));

    let replayed = kb_b.poll(r2 - 1, 10);
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].author, "ada");
    assert!(replayed[0].updated.contains(ada.key()));
    late.rollback().unwrap();
}

#[test]
fn instances_see_each_others_commits() {
    let backend = Arc::new(InMemoryBackend::new());
    let kb_a = KnowledgeBase::open(backend.clone(), schema()).unwrap();
    let kb_b = KnowledgeBase::open(backend, schema()).unwrap();

    let setup = kb_a.begin_transaction("setup").unwrap();
    let ada = person(&setup, "ada");
    commit(&setup);
    let first = kb_a.begin_transaction("ada").unwrap();
    first.set_value(&ada, "city", "paris").unwrap();
    let r2 = commit(&first);
    assert_eq!(kb_a.reader(r2).values(&ada).unwrap()[1], Value::from("paris"));

    let second = kb_b.begin_transaction("bob").unwrap();
    assert_eq!(second.session_revision(), r2);
    let theirs = second.resolve(ada.key()).unwrap().unwrap();
    assert_eq!(second.value(&theirs, "city").unwrap(), Value::from("paris"));
    second.set_value(&theirs, "city", "rome").unwrap();
    let r3 = commit(&second);

    // kb_a still holds ada's row from r2 as the open head.
    assert_eq!(kb_a.last_revision(), r2);
    assert_eq!(kb_a.refetch().unwrap(), r3);
    assert_eq!(kb_a.reader(r3).values(&ada).unwrap()[1], Value::from("rome"));
    assert_eq!(kb_a.reader(r2).values(&ada).unwrap()[1], Value::from("paris"));

    let third = kb_a.begin_transaction("ada").unwrap();
    third.set_value(&ada, "city", "oslo").unwrap();
    assert_eq!(commit(&third), r3 + 1);
}

#[test]
fn session_refresh_picks_up_other_instances() {
    let backend = Arc::new(InMemoryBackend::new());
    let kb_a = KnowledgeBase::open(backend.clone(), schema()).unwrap();
    let kb_b = KnowledgeBase::open(backend, schema()).unwrap();

    let setup = kb_a.begin_transaction("setup").unwrap();
    let ada = person(&setup, "ada");
    let bob = person(&setup, "bob");
    commit(&setup);

    let reader = kb_b.begin_transaction("bob").unwrap();
    let their_bob = reader.resolve(bob.key()).unwrap().unwrap();
    reader.set_value(&their_bob, "city", "rome").unwrap();

    let writer = kb_a.begin_transaction("ada").unwrap();
    writer.set_value(&ada, "city", "paris").unwrap();
    let r2 = commit(&writer);

    assert_eq!(reader.update_session_revision().unwrap(), r2);
    let their_ada = reader.resolve(ada.key()).unwrap().unwrap();
    assert_eq!(reader.value(&their_ada, "city").unwrap(), Value::from("paris"));
    let r3 = commit(&reader);
    assert_eq!(kb_a.refetch().unwrap(), r3);
    assert_eq!(kb_a.reader(r3).values(&bob).unwrap()[1], Value::from("rome"));
}

#[test]
fn delete_on_both_sides_merges() {
    let kb = common::open();
    let setup = kb.begin_transaction("setup").unwrap();
    let ada = person(&setup, "ada");
    let bob = person(&setup, "bob");
    commit(&setup);

    let first = kb.begin_transaction("ada").unwrap();
    let second = kb.begin_transaction("bob").unwrap();
    first.delete(&ada).unwrap();
    second.delete(&ada).unwrap();
    second.set_value(&bob, "city", "rome").unwrap();
    commit(&first);

    let r3 = commit(&second);
    assert!(kb.resolve_object_key(ada.key()).unwrap().is_none());
    assert_eq!(kb.reader(r3).values(&bob).unwrap()[1], Value::from("rome"));
}

#[test]
fn session_refresh_merges_later_commits() {
    let kb = common::open();
    let setup = kb.begin_transaction("setup").unwrap();
    let doc = document(&setup, "d");
    let ada = person(&setup, "ada");
    let bob = person(&setup, "bob");
    commit(&setup);
    let members = members(&kb);

    let reader = kb.begin_transaction("bob").unwrap();
    reader.set_value(&bob, "city", "rome").unwrap();
    assert!(reader.association(&doc, &members).unwrap().is_empty());

    let writer = kb.begin_transaction("ada").unwrap();
    writer.set_value(&ada, "city", "paris").unwrap();
    let l = link(&writer, &doc, &ada, 1);
    let r2 = commit(&writer);

    assert_eq!(reader.value(&ada, "city").unwrap(), Value::Null);
    assert_eq!(reader.update_session_revision().unwrap(), r2);
    assert_eq!(reader.session_revision(), r2);
    assert_eq!(reader.value(&ada, "city").unwrap(), Value::from("paris"));
    assert_eq!(reader.value(&bob, "city").unwrap(), Value::from("rome"));

    let view = reader.association(&doc, &members).unwrap();
    assert_eq!(view.links(), vec![l.key().clone()]);
    assert_eq!(view.revision(), r2);

    let r3 = commit(&reader);
    assert_eq!(bob.value_at("city", r3).unwrap(), Value::from("rome"));
}

#[test]
fn racing_writers_on_one_object_have_one_winner() {
    let kb = common::open();
    let setup = kb.begin_transaction("setup").unwrap();
    let ada = person(&setup, "ada");
    commit(&setup);

    let contexts: Vec<_> = (0..8)
        .map(|i| {
            let ctx = kb.begin_transaction(&format!("writer-{i}")).unwrap();
            ctx.set_value(&ada, "city", format!("city-{i}")).unwrap();
            ctx
        })
        .collect();

    let outcomes: Vec<bool> = thread::scope(|scope| {
        let handles: Vec<_> = contexts
            .iter()
            .map(|ctx| scope.spawn(move || ctx.commit().is_ok()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(outcomes.iter().filter(|won| **won).count(), 1);
    assert_eq!(kb.last_revision(), 2);
}

#[test]
fn parallel_creators_get_distinct_ids_and_revisions() {
    let kb = common::open();
    let revisions: Vec<u64> = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let kb = kb.clone();
                scope.spawn(move || {
                    let ctx = kb.begin_transaction(&format!("creator-{i}")).unwrap();
                    let items = (0..25)
                        .map(|n| person(&ctx, &format!("p{i}-{n}")))
                        .collect::<Vec<_>>();
                    assert_eq!(items.len(), 25);
                    commit(&ctx)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let distinct: BTreeSet<u64> = revisions.iter().copied().collect();
    assert_eq!(distinct, (1..=8).collect());
    assert_eq!(kb.item_count(), 200);

    let ids: BTreeSet<u64> = kb
        .revisions()
        .unwrap()
        .iter()
        .map(|r| r.number)
        .collect();
    assert_eq!(ids.len(), 8);
}
