//! Shared setup for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use revkb_core::{
    AssociationQuery, DbContext, KbConfig, KnowledgeBase, KnowledgeItem, NoWrappers, Schema,
    TypeDef, Value, DEST, SOURCE,
};
use revkb_storage::InMemoryBackend;

/// `Person` (flex), `Document`, the `hasMember` association from documents
/// to people, and the immutable `Setting`.
pub fn schema() -> Schema {
    Schema::new()
        .with_type(
            TypeDef::object("Person")
                .mandatory_value("name")
                .value("city")
                .flex(true),
        )
        .unwrap()
        .with_type(
            TypeDef::object("Document")
                .value("title")
                .reference("owner", Some("Person")),
        )
        .unwrap()
        .with_type(
            TypeDef::association("hasMember")
                .endpoint_type(SOURCE, "Document")
                .endpoint_type(DEST, "Person")
                .value("order")
                .value("role"),
        )
        .unwrap()
        .with_type(TypeDef::object("Setting").value("value").immutable(true))
        .unwrap()
}

pub fn open() -> KnowledgeBase {
    open_with(KbConfig::default())
}

pub fn open_with(config: KbConfig) -> KnowledgeBase {
    KnowledgeBase::open_with(
        Arc::new(InMemoryBackend::new()),
        schema(),
        config,
        Arc::new(NoWrappers),
    )
    .unwrap()
}

pub fn person(ctx: &DbContext, name: &str) -> Arc<KnowledgeItem> {
    ctx.create_item_with("Person", [("name", Value::from(name))])
        .unwrap()
}

pub fn document(ctx: &DbContext, title: &str) -> Arc<KnowledgeItem> {
    ctx.create_item_with("Document", [("title", Value::from(title))])
        .unwrap()
}

/// Creates a `hasMember` link from `doc` to `member`.
pub fn link(
    ctx: &DbContext,
    doc: &KnowledgeItem,
    member: &KnowledgeItem,
    order: i64,
) -> Arc<KnowledgeItem> {
    let link = ctx.create_item("hasMember").unwrap();
    ctx.set_reference(&link, SOURCE, doc).unwrap();
    ctx.set_reference(&link, DEST, member).unwrap();
    ctx.set_value(&link, "order", order).unwrap();
    link
}

pub fn members(kb: &KnowledgeBase) -> Arc<AssociationQuery> {
    AssociationQuery::outgoing("members", "hasMember")
        .expected_type("Person")
        .build(kb.schema())
        .unwrap()
}

pub fn documents_of(kb: &KnowledgeBase) -> Arc<AssociationQuery> {
    AssociationQuery::incoming("documents", "hasMember")
        .expected_type("Document")
        .build(kb.schema())
        .unwrap()
}

pub fn ordered_members(kb: &KnowledgeBase) -> Arc<AssociationQuery> {
    AssociationQuery::outgoing("ordered_members", "hasMember")
        .live_ordered_by("order")
        .build(kb.schema())
        .unwrap()
}

/// Commits and returns the new revision number.
pub fn commit(ctx: &DbContext) -> u64 {
    ctx.commit().unwrap().expect("context had changes").number
}
