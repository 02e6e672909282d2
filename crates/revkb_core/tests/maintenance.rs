//! Branches, history cleanup, the update feed, wrappers and durable
//! storage.

mod common;

use std::any::Any;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use common::{commit, document, person, schema};
use revkb_core::{
    Bound, CommitNotice, CoreError, ItemReader, KbConfig, KnowledgeBase, KnowledgeItem,
    ObjectKey, SubscriptionId, UpdateListener, Value, Wrapper, WrapperFactory, CURRENT_REV,
    TRUNK,
};
use revkb_storage::{FileBackend, InMemoryBackend};
use tempfile::TempDir;

// ---- branches -----------------------------------------------------------

#[test]
fn branch_copies_objects_and_diverges() {
    let kb = common::open();
    let ctx = kb.begin_transaction("ada").unwrap();
    let ada = person(&ctx, "ada");
    let doc = document(&ctx, "d");
    ctx.set_reference(&doc, "owner", &ada).unwrap();
    let r1 = commit(&ctx);

    let (branch, created) = kb.create_branch(TRUNK, r1, "ada").unwrap();
    assert_ne!(branch, TRUNK);
    assert_eq!(created.number, r1 + 1);
    assert_eq!(kb.last_revision(), created.number);
    let row = kb
        .branches()
        .unwrap()
        .into_iter()
        .find(|b| b.id == branch)
        .unwrap();
    assert_eq!(row.base_branch, Some(TRUNK));
    assert_eq!(row.base_revision, r1);

    let on_branch = kb.begin_transaction_on(branch, "ada").unwrap();
    assert_eq!(on_branch.branch(), branch);
    let branch_doc_key = ObjectKey::current(branch, "Document", doc.key().id);
    let branch_doc = on_branch.resolve(&branch_doc_key).unwrap().unwrap();
    let owner = on_branch.referenced_item(&branch_doc, "owner").unwrap().unwrap();
    assert_eq!(owner.key().branch, branch);
    assert_eq!(owner.key().id, ada.key().id);

    // Trunk objects are not writable from a branch context.
    assert!(matches!(
        on_branch.set_value(&ada, "city", "rome").unwrap_err(),
        CoreError::InvalidOperation { .. }
    ));
    on_branch.set_value(&owner, "city", "oslo").unwrap();
    let r3 = commit(&on_branch);

    assert_eq!(owner.value_at("city", r3).unwrap(), Value::from("oslo"));
    assert_eq!(ada.value_at("city", r3).unwrap(), Value::Null);
}

#[test]
fn branch_creation_is_checked() {
    let kb = common::open_with(KbConfig::default().branching(false));
    assert!(matches!(
        kb.create_branch(TRUNK, 0, "ada").unwrap_err(),
        CoreError::InvalidOperation { .. }
    ));

    let kb = common::open();
    assert!(matches!(
        kb.create_branch(TRUNK, 5, "ada").unwrap_err(),
        CoreError::InvalidOperation { .. }
    ));
}

// ---- cleanup ------------------------------------------------------------

#[test]
fn cleanup_keeps_what_open_contexts_can_read() {
    let kb = common::open();
    let ctx = kb.begin_transaction("ada").unwrap();
    let ada = person(&ctx, "ada");
    let r1 = commit(&ctx);
    let ctx = kb.begin_transaction("ada").unwrap();
    ctx.set_value(&ada, "city", "paris").unwrap();
    let r2 = commit(&ctx);

    let old_session = kb.begin_transaction("bob").unwrap();
    let ctx = kb.begin_transaction("ada").unwrap();
    ctx.set_value(&ada, "city", "rome").unwrap();
    let r3 = commit(&ctx);
    assert_eq!(ada.chain_ranges(), vec![(r3, CURRENT_REV), (r2, r2), (r1, r1)]);

    let report = kb.cleanup();
    assert_eq!(report.oldest_revision, r2);
    assert_eq!(ada.chain_ranges(), vec![(r3, CURRENT_REV), (r2, r2)]);
    assert_eq!(old_session.value(&ada, "city").unwrap(), Value::from("paris"));

    drop(old_session);
    let report = kb.cleanup();
    assert_eq!(report.oldest_revision, r3);
    assert_eq!(ada.chain_ranges(), vec![(r3, CURRENT_REV)]);
    assert_eq!(kb.poll(0, 10).len(), 1);

    // Dropped history is reloaded from storage on demand.
    assert_eq!(kb.reader(r1).values(&ada).unwrap()[1], Value::Null);
    assert_eq!(ada.chain_ranges(), vec![(r3, CURRENT_REV), (r1, r1)]);
}

#[test]
fn cleanup_evicts_unheld_items_and_releases_caches() {
    let kb = common::open();
    let ctx = kb.begin_transaction("ada").unwrap();
    let ada = person(&ctx, "ada");
    let doc_key = document(&ctx, "d").key().clone();
    commit(&ctx);
    drop(ctx);
    assert_eq!(kb.item_count(), 2);

    let query = revkb_core::SimpleQuery::builder("all", "Person")
        .build(kb.schema())
        .unwrap();
    let cache = kb.query_cache(query, Vec::new());
    cache.invalidate();

    let report = kb.cleanup();
    assert_eq!(report.evicted_items, 1);
    assert_eq!(report.released_query_caches, 1);
    assert_eq!(kb.item_count(), 1);
    assert_eq!(kb.query_cache_count(), 0);

    let doc = kb.resolve_object_key(&doc_key).unwrap().unwrap();
    assert_eq!(doc.value_at("title", kb.last_revision()).unwrap(), Value::from("d"));
    assert!(kb.resolve_object_key(ada.key()).unwrap().is_some());
}

#[test]
fn eviction_can_be_disabled() {
    let kb = common::open_with(KbConfig::default().evict_unreferenced(false));
    let ctx = kb.begin_transaction("ada").unwrap();
    person(&ctx, "ada");
    commit(&ctx);
    drop(ctx);
    assert_eq!(kb.cleanup().evicted_items, 0);
    assert_eq!(kb.item_count(), 1);
}

// ---- feed ---------------------------------------------------------------

#[derive(Debug, Default)]
struct Recorder {
    seen: Mutex<Vec<(u64, usize)>>,
}

impl UpdateListener for Recorder {
    fn on_commit(&self, notice: &CommitNotice<'_>) {
        self.seen
            .lock()
            .unwrap()
            .push((notice.event.revision, notice.changes.len()));
    }
}

#[test]
fn listeners_see_every_commit_until_unsubscribed() {
    let kb = common::open();
    let recorder = Arc::new(Recorder::default());
    let id = kb.subscribe(recorder.clone());
    let events = kb.feed().channel();

    let ctx = kb.begin_transaction("ada").unwrap();
    let ada = person(&ctx, "ada");
    let r1 = commit(&ctx);
    let ctx = kb.begin_transaction("ada").unwrap();
    ctx.set_value(&ada, "city", "paris").unwrap();
    let r2 = commit(&ctx);

    assert_eq!(*recorder.seen.lock().unwrap(), vec![(r1, 1), (r2, 1)]);
    let first = events.try_recv().unwrap();
    assert_eq!(first.revision, r1);
    assert_eq!(first.created, vec![ada.key().clone()]);
    let second = events.try_recv().unwrap();
    assert_eq!(second.updated, vec![ada.key().clone()]);
    assert_eq!(kb.poll(r1, 10), vec![second]);

    assert!(kb.unsubscribe(id));
    assert!(!kb.unsubscribe(id));
    let ctx = kb.begin_transaction("ada").unwrap();
    ctx.delete(&ada).unwrap();
    let r3 = commit(&ctx);
    assert_eq!(recorder.seen.lock().unwrap().len(), 2);
    assert_eq!(events.try_recv().unwrap().deleted, vec![ada.key().clone()]);
    assert_eq!(kb.feed().latest_revision(), r3);
}

#[test]
fn cache_maintenance_cannot_be_unsubscribed() {
    let kb = common::open();
    let listeners = kb.feed().listener_count();
    assert_eq!(listeners, 1);
    assert!(!kb.unsubscribe(SubscriptionId(1)));
    assert_eq!(kb.feed().listener_count(), listeners);
}

#[test]
fn flex_only_commits_report_updates() {
    let kb = common::open();
    let ctx = kb.begin_transaction("ada").unwrap();
    let ada = person(&ctx, "ada");
    let r1 = commit(&ctx);

    let ctx = kb.begin_transaction("ada").unwrap();
    ctx.set_value(&ada, "nickname", "a").unwrap();
    let r2 = commit(&ctx);
    let event = kb.poll(r1, 1).remove(0);
    assert_eq!(event.revision, r2);
    assert_eq!(event.updated, vec![ada.key().clone()]);
    assert!(event.touches(ada.key()));
}

// ---- wrappers -----------------------------------------------------------

#[derive(Debug)]
struct PersonHandle {
    key: ObjectKey,
}

impl Wrapper for PersonHandle {
    fn key(&self) -> &ObjectKey {
        &self.key
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Default)]
struct PeopleOnly {
    calls: AtomicUsize,
}

impl WrapperFactory for PeopleOnly {
    fn wrap(&self, item: &Arc<KnowledgeItem>) -> Option<Arc<dyn Wrapper>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (&**item.type_def().name() == "Person").then(|| {
            Arc::new(PersonHandle {
                key: item.key().clone(),
            }) as Arc<dyn Wrapper>
        })
    }
}

#[test]
fn items_are_bound_once() {
    let factory = Arc::new(PeopleOnly::default());
    let kb = KnowledgeBase::open_with(
        Arc::new(InMemoryBackend::new()),
        schema(),
        KbConfig::default(),
        factory.clone(),
    )
    .unwrap();
    let ctx = kb.begin_transaction("ada").unwrap();
    let ada = person(&ctx, "ada");
    let doc = document(&ctx, "d");

    let bound = kb.wrap(&ada);
    let handle = bound.downcast::<PersonHandle>().unwrap();
    assert_eq!(&handle.key, ada.key());
    assert!(matches!(kb.wrap(&doc), Bound::Item(_)));
    assert_eq!(kb.wrap(&doc).key(), doc.key());

    let again = kb.wrap(&ada);
    match (bound, again) {
        (Bound::Wrapped(a), Bound::Wrapped(b)) => assert!(Arc::ptr_eq(&a, &b)),
        other => panic!("unexpected binding {other:?}"),
    }
    assert_eq!(factory.calls.load(Ordering::SeqCst), 2);
}

// ---- durable storage ----------------------------------------------------

#[test]
fn file_backend_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let (key, r1, r2) = {
        let backend = Arc::new(FileBackend::open(dir.path(), true).unwrap());
        let kb = KnowledgeBase::open(backend, schema()).unwrap();
        let ctx = kb.begin_transaction("ada").unwrap();
        let x = person(&ctx, "a");
        let r1 = ctx.commit_with_log("first").unwrap().unwrap().number;
        let ctx = kb.begin_transaction("bob").unwrap();
        ctx.set_value(&x, "name", "b").unwrap();
        let r2 = commit(&ctx);
        (x.key().clone(), r1, r2)
    };

    let backend = Arc::new(FileBackend::open(dir.path(), true).unwrap());
    let kb = KnowledgeBase::open(backend, schema()).unwrap();
    assert_eq!(kb.last_revision(), r2);
    let x = kb.resolve_object_key(&key).unwrap().unwrap();
    assert_eq!(x.value_at("name", r1).unwrap(), Value::from("a"));
    assert_eq!(x.value_at("name", r2).unwrap(), Value::from("b"));

    let first = kb.revision(r1).unwrap().unwrap();
    assert_eq!(first.author, "ada");
    assert_eq!(first.log, "first");

    // Fresh ids never collide with ids handed out before the reopen.
    let ctx = kb.begin_transaction("ada").unwrap();
    let y = person(&ctx, "c");
    assert_ne!(y.key().id, key.id);
}

#[test]
fn small_id_chunks_stay_unique_across_knowledge_bases() {
    let backend = Arc::new(InMemoryBackend::new());
    let config = KbConfig::default().id_chunk_size(2).id_max_multiplier(1);
    let open = || {
        KnowledgeBase::open_with(
            backend.clone(),
            schema(),
            config.clone(),
            Arc::new(revkb_core::NoWrappers),
        )
        .unwrap()
    };
    let (kb_a, kb_b) = (open(), open());
    let ctx_a = kb_a.begin_transaction("ada").unwrap();
    let ctx_b = kb_b.begin_transaction("bob").unwrap();

    let mut ids = BTreeSet::new();
    for i in 0..10 {
        let ctx = if i % 2 == 0 { &ctx_a } else { &ctx_b };
        assert!(ids.insert(person(ctx, "p").key().id));
    }
    let batch = ctx_a.create_items("Person", 7).unwrap();
    for item in &batch {
        assert!(ids.insert(item.key().id));
    }
    assert_eq!(ids.len(), 17);
}
