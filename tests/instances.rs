mod common;

use rescache::application::pagination::PageRequest;
use rescache::cache::{
    ChangeEvent, IdListKind, KeyScheme, ListDetail, ListDetailByIds, ListDetailByUniqueKey,
    ListState,
};
use rescache::domain::tenant::Scope;
use rescache::infra::kv::KvStore;

use common::{
    INSTANCE_NAME, InstanceHarness, InstanceSource, eventually, instance, instance_resource, oids,
};

fn catalog() -> InstanceSource {
    InstanceSource::new([
        instance("a1", &["m1"], "0"),
        instance("b2", &["m1", "m2"], "0"),
        instance("c3", &["m1"], "0"),
        instance("d4", &["m2"], "0"),
        instance("e9", &["m1"], "t1"),
    ])
}

fn keys() -> KeyScheme {
    KeyScheme::new(&instance_resource())
}

fn model_list_key(model: &str) -> String {
    keys().id_list_key(&IdListKind::System {
        sub_res: Some(model.to_string()),
        tenant: "0".to_string(),
    })
}

async fn members(harness: &InstanceHarness, model: &str) -> Vec<String> {
    harness
        .kv
        .zrange(&model_list_key(model), 0, 100)
        .await
        .expect("zrange")
}

async fn refresh(harness: &InstanceHarness, model: &str) {
    harness
        .cache()
        .refresh_id_list(Some(model), "0")
        .await
        .expect("refresh")
        .finished()
        .await;
}

#[tokio::test]
async fn model_lists_page_by_oid() {
    let harness = InstanceHarness::new(catalog());
    let cache = harness.cache();
    let first_page = ListDetail::new("0", PageRequest::first(2), Scope::system())
        .with_sub_res("m1")
        .with_count();

    let page = cache.list_detail(&first_page).await.expect("list");
    assert_eq!(oids(&page.details), vec!["a1", "b2"]);
    assert_eq!(page.count, Some(3));

    eventually("model list to become fresh", || async move {
        matches!(cache.id_list_state(Some("m1"), "0").await, Ok(ListState::Fresh))
    })
    .await;
    // Rebuilt across two source pages of two.
    assert_eq!(members(&harness, "m1").await, vec!["a1", "b2", "c3"]);
    assert!(!harness.kv.exists(&model_list_key("m2")).await.expect("exists"));
    let listed = harness.source.list_calls();

    let page = cache.list_detail(&first_page).await.expect("list");
    assert_eq!(oids(&page.details), vec!["a1", "b2"]);
    assert_eq!(page.count, Some(3));

    let next = ListDetail::new("0", PageRequest::after("b2", 2), Scope::system()).with_sub_res("m1");
    let page = cache.list_detail(&next).await.expect("list");
    assert_eq!(oids(&page.details), vec!["c3"]);
    assert_eq!(harness.source.list_calls(), listed);

    let missing_model = ListDetail::new("0", PageRequest::first(2), Scope::system());
    let err = cache.list_detail(&missing_model).await.expect_err("model required");
    assert!(err.is_validation(), "unexpected error: {err}");
}

#[tokio::test]
async fn changes_reach_every_model_list() {
    let harness = InstanceHarness::new(catalog());
    let cache = harness.cache();
    refresh(&harness, "m1").await;
    refresh(&harness, "m2").await;
    assert_eq!(members(&harness, "m2").await, vec!["b2", "d4"]);

    for model in ["m1", "m2"] {
        let details = cache
            .list_detail_by_ids(&ListDetailByIds::new(["b2"], Scope::system()).with_sub_res(model))
            .await
            .expect("lookup");
        assert_eq!(oids(&details), vec!["b2"]);
    }

    let added = instance("f5", &["m1", "m2"], "0");
    let removed = instance("b2", &["m1", "m2"], "0");
    harness.source.put(added.clone());
    harness.source.remove("b2");
    cache
        .apply_changes(vec![
            ChangeEvent::insert("f5", added),
            ChangeEvent::delete("b2", removed),
        ])
        .await
        .expect("apply");

    assert_eq!(members(&harness, "m1").await, vec!["a1", "c3", "f5"]);
    assert_eq!(members(&harness, "m2").await, vec!["d4", "f5"]);
    for model in ["m1", "m2"] {
        let detail_key = keys().detail_key(Some(model), "b2");
        assert_eq!(harness.kv.get(&detail_key).await.expect("get"), None);
    }

    let details = cache
        .list_detail_by_ids(&ListDetailByIds::new(["b2", "f5"], Scope::system()).with_sub_res("m2"))
        .await
        .expect("lookup");
    assert_eq!(oids(&details), vec!["f5"]);
}

#[tokio::test]
async fn renamed_instance_is_refetched() {
    let harness = InstanceHarness::new(catalog());
    let cache = harness.cache();
    let lookup = ListDetailByIds::new(["a1"], Scope::system())
        .with_sub_res("m1")
        .with_fields(["name"]);

    let details = cache.list_detail_by_ids(&lookup).await.expect("lookup");
    assert_eq!(details, vec![r#"{"name":"inst-a1"}"#.to_string()]);

    let mut renamed = instance("a1", &["m1"], "0");
    renamed["name"] = "web-a1".into();
    harness.source.put(renamed.clone());
    cache
        .apply_changes(vec![ChangeEvent::update("a1", renamed)])
        .await
        .expect("apply");

    let details = cache.list_detail_by_ids(&lookup).await.expect("lookup");
    assert_eq!(details, vec![r#"{"name":"web-a1"}"#.to_string()]);
}

#[tokio::test]
async fn unique_key_lookup_checks_model_before_writing() {
    let harness = InstanceHarness::new(catalog());
    let cache = harness.cache();

    let without_model = ListDetailByUniqueKey::new(INSTANCE_NAME, ["inst-a1"], Scope::system());
    let err = cache
        .list_detail_by_unique_key(&without_model)
        .await
        .expect_err("model required");
    assert!(err.is_validation(), "unexpected error: {err}");
    assert_eq!(harness.source.resolver_calls(), 0);
    assert!(harness.kv.keys_with_prefix("rescache:instance").is_empty());

    let details = cache
        .list_detail_by_unique_key(&without_model.clone().with_sub_res("m1"))
        .await
        .expect("lookup");
    assert_eq!(oids(&details), vec!["a1"]);
    assert_eq!(harness.source.resolver_calls(), 1);
    assert!(
        harness
            .kv
            .get(&keys().detail_key(Some("m1"), "a1"))
            .await
            .expect("get")
            .is_some()
    );
}
