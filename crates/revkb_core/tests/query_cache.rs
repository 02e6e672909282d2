//! Query caches: committed results, local adaptation, commit folding.

mod common;

use std::sync::Arc;

use common::commit;
use revkb_core::{
    CoreError, DbContext, KbConfig, KnowledgeItem, ObjectKey, Operand, QueryCacheStrategy,
    SimpleQuery, Value, CURRENT_REV, TRUNK,
};

fn resident(ctx: &DbContext, name: &str, city: &str) -> Arc<KnowledgeItem> {
    ctx.create_item_with(
        "Person",
        [("name", Value::from(name)), ("city", Value::from(city))],
    )
    .unwrap()
}

fn keys(items: &[Arc<KnowledgeItem>]) -> Vec<ObjectKey> {
    items.iter().map(|item| item.key().clone()).collect()
}

fn by_city(kb: &revkb_core::KnowledgeBase) -> Arc<SimpleQuery> {
    SimpleQuery::builder("by_city", "Person")
        .equals("city", Operand::Param(0))
        .build(kb.schema())
        .unwrap()
}

#[test]
fn local_results_follow_edits_of_the_context() {
    let kb = common::open();
    let setup = kb.begin_transaction("setup").unwrap();
    let ada = resident(&setup, "ada", "paris");
    let bob = resident(&setup, "bob", "rome");
    let cy = resident(&setup, "cy", "paris");
    let r1 = commit(&setup);

    let cache = kb.query_cache(by_city(&kb), vec![Value::from("paris")]);
    assert_eq!(keys(&cache.read().unwrap()), vec![ada.key().clone(), cy.key().clone()]);

    let ctx = kb.begin_transaction("ada").unwrap();
    let bystander = kb.begin_transaction("bob").unwrap();
    ctx.delete(&ada).unwrap();
    ctx.set_value(&bob, "city", "paris").unwrap();
    ctx.set_value(&cy, "city", "rome").unwrap();
    let dan = resident(&ctx, "dan", "paris");
    resident(&ctx, "eve", "oslo");

    let local = keys(&cache.read_in(&ctx).unwrap());
    assert_eq!(local, vec![bob.key().clone(), dan.key().clone()]);
    assert_eq!(
        keys(&cache.read_in(&bystander).unwrap()),
        vec![ada.key().clone(), cy.key().clone()]
    );
    assert_eq!(keys(&cache.read().unwrap()), vec![ada.key().clone(), cy.key().clone()]);

    let r2 = commit(&ctx);
    assert_eq!(keys(&cache.read().unwrap()), local);
    assert_eq!(cache.ranges(), vec![(r2, CURRENT_REV), (r1, r1)]);
    assert_eq!(
        keys(&cache.read_in(&bystander).unwrap()),
        vec![ada.key().clone(), cy.key().clone()],
        "an older session keeps its results"
    );
}

#[test]
fn unrelated_commits_do_not_add_nodes() {
    let kb = common::open();
    let setup = kb.begin_transaction("setup").unwrap();
    resident(&setup, "ada", "paris");
    let r1 = commit(&setup);
    let cache = kb.query_cache(by_city(&kb), vec![Value::from("paris")]);
    assert_eq!(cache.read().unwrap().len(), 1);

    let ctx = kb.begin_transaction("ada").unwrap();
    common::document(&ctx, "d");
    resident(&ctx, "bob", "rome");
    commit(&ctx);

    assert_eq!(cache.ranges(), vec![(r1, CURRENT_REV)]);
    assert_eq!(cache.read().unwrap().len(), 1);
}

#[test]
fn literal_and_not_null_conditions() {
    let kb = common::open();
    let with_city = SimpleQuery::builder("with_city", "Person")
        .not_null("city")
        .build(kb.schema())
        .unwrap();
    let in_rome = SimpleQuery::builder("in_rome", "Person")
        .equals("city", Value::from("rome"))
        .build(kb.schema())
        .unwrap();

    let ctx = kb.begin_transaction("ada").unwrap();
    let ada = common::person(&ctx, "ada");
    let bob = resident(&ctx, "bob", "rome");
    commit(&ctx);

    let with_city = kb.query_cache(with_city, Vec::new());
    let in_rome = kb.query_cache(in_rome, Vec::new());
    assert_eq!(keys(&with_city.read().unwrap()), vec![bob.key().clone()]);
    assert_eq!(keys(&in_rome.read().unwrap()), vec![bob.key().clone()]);

    let ctx = kb.begin_transaction("ada").unwrap();
    ctx.set_value(&ada, "city", "rome").unwrap();
    assert_eq!(
        keys(&with_city.read_in(&ctx).unwrap()),
        vec![ada.key().clone(), bob.key().clone()]
    );
    commit(&ctx);
    assert_eq!(in_rome.read().unwrap().len(), 2);
}

#[test]
fn invalidation_is_idempotent() {
    let kb = common::open();
    let cache = kb.query_cache(by_city(&kb), vec![Value::from("paris")]);
    assert_eq!(kb.query_cache_count(), 1);
    assert!(cache.read().unwrap().is_empty());

    kb.invalidate_query_cache(&cache);
    kb.invalidate_query_cache(&cache);
    assert!(cache.is_invalidated());
    assert_eq!(kb.query_cache_count(), 0);
    assert!(cache.ranges().is_empty());

    match cache.read().unwrap_err() {
        CoreError::InvalidatedCache { name } => assert_eq!(name, "by_city"),
        other => panic!("unexpected error {other}"),
    }

    // Commits after invalidation are not fed to the cache.
    let ctx = kb.begin_transaction("ada").unwrap();
    resident(&ctx, "ada", "paris");
    commit(&ctx);
    assert!(cache.read_in(&kb.begin_transaction("bob").unwrap()).is_err());
}

#[test]
fn id_strategy_resolves_on_every_read() {
    let kb = common::open_with(KbConfig::default().query_cache_strategy(QueryCacheStrategy::Ids));
    let ctx = kb.begin_transaction("ada").unwrap();
    let ada = resident(&ctx, "ada", "paris");
    commit(&ctx);

    let cache = kb.query_cache(by_city(&kb), vec![Value::from("paris")]);
    assert_eq!(cache.strategy(), QueryCacheStrategy::Ids);
    let first = cache.read().unwrap();
    assert!(Arc::ptr_eq(&first[0], &ada));

    let ctx = kb.begin_transaction("ada").unwrap();
    let bob = resident(&ctx, "bob", "paris");
    commit(&ctx);
    assert_eq!(keys(&cache.read().unwrap()), vec![ada.key().clone(), bob.key().clone()]);
}

#[test]
fn branch_caches_only_serve_their_branch() {
    let kb = common::open();
    let ctx = kb.begin_transaction("ada").unwrap();
    resident(&ctx, "ada", "paris");
    let r1 = commit(&ctx);
    let (branch, _) = kb.create_branch(TRUNK, r1, "ada").unwrap();

    let trunk_cache = kb.query_cache(by_city(&kb), vec![Value::from("paris")]);
    let branch_cache = kb.query_cache_with(
        by_city(&kb),
        vec![Value::from("paris")],
        branch,
        QueryCacheStrategy::Values,
    );

    let on_branch = kb.begin_transaction_on(branch, "ada").unwrap();
    let copy = branch_cache.read_in(&on_branch).unwrap();
    assert_eq!(copy.len(), 1);
    assert_eq!(copy[0].key().branch, branch);

    assert!(matches!(
        trunk_cache.read_in(&on_branch).unwrap_err(),
        CoreError::InvalidOperation { .. }
    ));
}

#[test]
fn missing_arguments_surface_on_read() {
    let kb = common::open();
    let ctx = kb.begin_transaction("ada").unwrap();
    resident(&ctx, "ada", "paris");
    commit(&ctx);

    let cache = kb.query_cache(by_city(&kb), Vec::new());
    assert!(matches!(
        cache.read().unwrap_err(),
        CoreError::InvalidOperation { .. }
    ));
}
