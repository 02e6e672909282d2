//! Test fixtures and knowledge base helpers.
//!
//! Provides a demo schema, knowledge bases that clean up after themselves
//! and a few pre-populated scenarios.

use revkb_core::{
    AssociationQuery, DbContext, KbConfig, KnowledgeBase, KnowledgeItem, NoWrappers, Schema,
    TypeDef, Value, DEST, SOURCE,
};
use revkb_storage::{FileBackend, InMemoryBackend, StorageBackend};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// The schema used by fixtures and scenarios.
///
/// - `Person`: mandatory `name`, `city`, flex attributes allowed
/// - `Document`: `title`, `owner` referencing a `Person`
/// - `hasMember`: association from a `Document` to a `Person`, with
///   `order` and `role`
pub fn demo_schema() -> Schema {
    Schema::new()
        .with_type(
            TypeDef::object("Person")
                .mandatory_value("name")
                .value("city")
                .flex(true),
        )
        .and_then(|s| {
            s.with_type(
                TypeDef::object("Document")
                    .value("title")
                    .reference("owner", Some("Person")),
            )
        })
        .and_then(|s| {
            s.with_type(
                TypeDef::association("hasMember")
                    .endpoint_type(SOURCE, "Document")
                    .endpoint_type(DEST, "Person")
                    .value("order")
                    .value("role"),
            )
        })
        .expect("demo schema is valid")
}

/// Outgoing `hasMember` links of a document, as a live list ordered by
/// `order`.
pub fn members_query(kb: &KnowledgeBase) -> Arc<AssociationQuery> {
    AssociationQuery::outgoing("members", "hasMember")
        .expected_type("Person")
        .live_ordered_by("order")
        .build(kb.schema())
        .expect("members query matches the demo schema")
}

/// Incoming `hasMember` links of a person.
pub fn documents_query(kb: &KnowledgeBase) -> Arc<AssociationQuery> {
    AssociationQuery::incoming("documents", "hasMember")
        .expected_type("Document")
        .build(kb.schema())
        .expect("documents query matches the demo schema")
}

/// A test knowledge base with automatic cleanup.
pub struct TestKnowledgeBase {
    /// The knowledge base.
    pub kb: KnowledgeBase,
    /// The storage behind `kb`.
    pub backend: Arc<dyn StorageBackend>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestKnowledgeBase {
    /// Creates a new in-memory knowledge base over [`demo_schema`].
    pub fn memory() -> Self {
        Self::memory_with(KbConfig::default())
    }

    /// Creates a new in-memory knowledge base with `config`.
    pub fn memory_with(config: KbConfig) -> Self {
        let backend: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
        let kb = KnowledgeBase::open_with(
            Arc::clone(&backend),
            demo_schema(),
            config,
            Arc::new(NoWrappers),
        )
        .expect("Failed to open in-memory knowledge base");
        Self {
            kb,
            backend,
            _temp_dir: None,
        }
    }

    /// Creates a new knowledge base journaled in a temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let backend: Arc<dyn StorageBackend> = Arc::new(
            FileBackend::open(&temp_dir.path().join("store"), true)
                .expect("Failed to open file backend"),
        );
        let kb = KnowledgeBase::open(Arc::clone(&backend), demo_schema())
            .expect("Failed to open file knowledge base");
        Self {
            kb,
            backend,
            _temp_dir: Some(temp_dir),
        }
    }

    /// Returns the store directory if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self._temp_dir.as_ref().map(|d| d.path().join("store"))
    }

    /// Opens a second knowledge base over the same storage, with cold
    /// caches.
    pub fn reopen(&self) -> KnowledgeBase {
        KnowledgeBase::open(Arc::clone(&self.backend), demo_schema())
            .expect("Failed to reopen knowledge base")
    }
}

impl std::ops::Deref for TestKnowledgeBase {
    type Target = KnowledgeBase;

    fn deref(&self) -> &Self::Target {
        &self.kb
    }
}

/// Runs a test with a temporary in-memory knowledge base.
///
/// # Example
///
/// ```rust,ignore
/// use revkb_testkit::with_temp_kb;
///
/// #[test]
/// fn my_test() {
///     with_temp_kb(|kb| {
///         let ctx = kb.begin_transaction("ada").unwrap();
///         // ... test operations
///     });
/// }
/// ```
pub fn with_temp_kb<F, R>(f: F) -> R
where
    F: FnOnce(&KnowledgeBase) -> R,
{
    let test_kb = TestKnowledgeBase::memory();
    f(&test_kb.kb)
}

/// Runs a test with a temporary file-based knowledge base.
pub fn with_file_kb<F, R>(f: F) -> R
where
    F: FnOnce(&KnowledgeBase, &Path) -> R,
{
    let test_kb = TestKnowledgeBase::file();
    let path = test_kb.path().expect("File knowledge base should have a path");
    f(&test_kb.kb, &path)
}

/// Creates a `Person` named `name`.
pub fn create_person(ctx: &DbContext, name: &str) -> Arc<KnowledgeItem> {
    ctx.create_item_with("Person", [("name", Value::from(name))])
        .expect("Failed to create person")
}

/// Creates a `Document` titled `title`.
pub fn create_document(ctx: &DbContext, title: &str) -> Arc<KnowledgeItem> {
    ctx.create_item_with("Document", [("title", Value::from(title))])
        .expect("Failed to create document")
}

/// Creates a `hasMember` link from `doc` to `member` with `order`.
pub fn create_link(
    ctx: &DbContext,
    doc: &KnowledgeItem,
    member: &KnowledgeItem,
    order: i64,
) -> Arc<KnowledgeItem> {
    let link = ctx.create_item("hasMember").expect("Failed to create link");
    ctx.set_reference(&link, SOURCE, doc)
        .and_then(|()| ctx.set_reference(&link, DEST, member))
        .and_then(|()| ctx.set_value(&link, "order", order))
        .expect("Failed to set link endpoints");
    link
}

/// Commits `ctx` and returns the new revision number.
pub fn commit(ctx: &DbContext) -> u64 {
    ctx.commit()
        .expect("Failed to commit")
        .expect("context had changes")
        .number
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Creates a knowledge base with `count` people committed in one
    /// revision.
    pub fn populated(count: usize) -> (TestKnowledgeBase, Vec<Arc<KnowledgeItem>>) {
        let test_kb = TestKnowledgeBase::memory();
        let ctx = test_kb
            .begin_transaction("fixture")
            .expect("Failed to begin transaction");
        let people = (0..count)
            .map(|i| create_person(&ctx, &format!("person_{i}")))
            .collect();
        commit(&ctx);
        (test_kb, people)
    }

    /// Creates one document with `count` ordered members.
    pub fn document_with_members(
        count: usize,
    ) -> (TestKnowledgeBase, Arc<KnowledgeItem>, Vec<Arc<KnowledgeItem>>) {
        let test_kb = TestKnowledgeBase::memory();
        let ctx = test_kb
            .begin_transaction("fixture")
            .expect("Failed to begin transaction");
        let doc = create_document(&ctx, "doc");
        let links = (0..count)
            .map(|i| {
                let member = create_person(&ctx, &format!("member_{i}"));
                create_link(&ctx, &doc, &member, (i as i64 + 1) * 1024)
            })
            .collect();
        commit(&ctx);
        (test_kb, doc, links)
    }

    /// Creates one person and renames it once per entry of `names`, one
    /// revision each. Returns the revision of every name.
    pub fn renamed_person(names: &[&str]) -> (TestKnowledgeBase, Arc<KnowledgeItem>, Vec<u64>) {
        assert!(!names.is_empty(), "need at least one name");
        let test_kb = TestKnowledgeBase::memory();
        let ctx = test_kb
            .begin_transaction("fixture")
            .expect("Failed to begin transaction");
        let person = create_person(&ctx, names[0]);
        let mut revisions = vec![commit(&ctx)];
        for name in &names[1..] {
            let ctx = test_kb
                .begin_transaction("fixture")
                .expect("Failed to begin transaction");
            ctx.set_value(&person, "name", *name)
                .expect("Failed to rename");
            revisions.push(commit(&ctx));
        }
        (test_kb, person, revisions)
    }
}
