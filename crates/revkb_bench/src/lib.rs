//! Benchmark utilities.

use revkb_core::{
    AssociationQuery, DbContext, KnowledgeBase, KnowledgeItem, Operand, Schema, SimpleQuery,
    TypeDef, Value, DEST, SOURCE,
};
use revkb_storage::{InMemoryBackend, StorageBackend};
use std::sync::Arc;

/// Cities assigned round-robin by [`populate`].
pub const CITIES: [&str; 4] = ["paris", "rome", "oslo", "lima"];

/// Schema used by every benchmark: `Person`, `Group` and a `memberOf`
/// association ordered by `order`.
pub fn bench_schema() -> Schema {
    Schema::new()
        .with_type(TypeDef::object("Person").mandatory_value("name").value("city"))
        .and_then(|s| s.with_type(TypeDef::object("Group").value("title")))
        .and_then(|s| {
            s.with_type(
                TypeDef::association("memberOf")
                    .endpoint_type(SOURCE, "Group")
                    .endpoint_type(DEST, "Person")
                    .value("order"),
            )
        })
        .expect("bench schema is valid")
}

/// Opens a knowledge base over a fresh in-memory backend.
pub fn open_memory() -> KnowledgeBase {
    let backend: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
    KnowledgeBase::open(backend, bench_schema()).expect("Failed to open knowledge base")
}

/// Commits `ctx`, returning the revision number.
pub fn commit(ctx: &DbContext) -> u64 {
    ctx.commit()
        .expect("Failed to commit")
        .expect("context had changes")
        .number
}

/// Creates `count` people in one revision.
pub fn populate(kb: &KnowledgeBase, count: usize) -> Vec<Arc<KnowledgeItem>> {
    let ctx = kb.begin_transaction("bench").expect("Failed to begin transaction");
    let people = (0..count)
        .map(|i| {
            ctx.create_item_with(
                "Person",
                [
                    ("name", Value::from(format!("person_{i}"))),
                    ("city", Value::from(CITIES[i % CITIES.len()])),
                ],
            )
            .expect("Failed to create person")
        })
        .collect();
    commit(&ctx);
    people
}

/// Renames `person` once per revision, `revisions` times.
pub fn rename_history(kb: &KnowledgeBase, person: &KnowledgeItem, revisions: usize) {
    for i in 0..revisions {
        let ctx = kb.begin_transaction("bench").expect("Failed to begin transaction");
        ctx.set_value(person, "name", format!("name_{i}"))
            .expect("Failed to rename");
        commit(&ctx);
    }
}

/// Creates a group linked to every person of `members`, in order.
pub fn group_with(kb: &KnowledgeBase, members: &[Arc<KnowledgeItem>]) -> Arc<KnowledgeItem> {
    let ctx = kb.begin_transaction("bench").expect("Failed to begin transaction");
    let group = ctx
        .create_item_with("Group", [("title", Value::from("group"))])
        .expect("Failed to create group");
    for (i, member) in members.iter().enumerate() {
        let link = ctx.create_item("memberOf").expect("Failed to create link");
        ctx.set_reference(&link, SOURCE, &group)
            .and_then(|()| ctx.set_reference(&link, DEST, member))
            .and_then(|()| ctx.set_value(&link, "order", (i as i64 + 1) * 1024))
            .expect("Failed to set link");
    }
    commit(&ctx);
    group
}

/// Outgoing `memberOf` links of a group as a live ordered list.
pub fn members_query(kb: &KnowledgeBase) -> Arc<AssociationQuery> {
    AssociationQuery::outgoing("members", "memberOf")
        .expected_type("Person")
        .live_ordered_by("order")
        .build(kb.schema())
        .expect("members query matches the bench schema")
}

/// People living in the city passed as the first argument.
pub fn by_city(kb: &KnowledgeBase) -> Arc<SimpleQuery> {
    SimpleQuery::builder("by_city", "Person")
        .equals("city", Operand::Param(0))
        .build(kb.schema())
        .expect("city query matches the bench schema")
}
