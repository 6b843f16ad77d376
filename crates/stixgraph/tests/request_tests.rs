//! Requests: feed selection, mirror answers, traversal and merging.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use stixgraph::request::{FEED_FIELD, TAGS_FIELD};
use stixgraph::{
    EngineConfig, EngineContext, Error, Feed, FeedOptions, Request, RequestOptions,
    StorageParadigm,
};
use stixgraph_mirror::MirrorConnection;
use stixgraph_pattern::PatternError;
use stixgraph_store::{Document, MemoryStore};

fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap()
}

fn at(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).unwrap()
}

const INSERTED: i64 = 1_700_000_000;

fn grouped() -> FeedOptions {
    FeedOptions::default()
        .paradigm(StorageParadigm::Grouped)
        .date(at(INSERTED))
}

fn address(id: &str, value: &str) -> Document {
    doc(json!({"type": "ipv4-addr", "id": id, "value": value}))
}

fn request(ctx: &EngineContext) -> Request {
    Request::new(ctx, at(INSERTED + 3_600))
}

fn ids(results: &[Document]) -> Vec<String> {
    let mut ids: Vec<String> = results
        .iter()
        .map(|r| r["id"].as_str().unwrap().to_string())
        .collect();
    ids.sort();
    ids
}

/// identity <-source_ref- relationship -target_ref-> ipv4 <-resolves_to_refs- domain
fn graph() -> Vec<Document> {
    vec![
        doc(json!({"type": "identity", "id": "identity--1", "name": "ACME"})),
        address("ipv4-addr--1", "10.0.0.1"),
        doc(json!({
            "type": "relationship", "id": "relationship--1",
            "relationship_type": "owns",
            "source_ref": "identity--1", "target_ref": "ipv4-addr--1",
        })),
        doc(json!({
            "type": "domain-name", "id": "domain-name--1", "value": "example.com",
            "resolves_to_refs": ["ipv4-addr--1"],
        })),
    ]
}

#[tokio::test]
async fn test_subnet_containment_on_primary_store() {
    let ctx = EngineContext::in_memory().unwrap();
    let mut feed = Feed::new(&ctx, "net_feed", grouped().tags(["net"])).unwrap();
    feed.insert(&[
        address("ipv4-addr--1", "97.8.8.0/24"),
        address("ipv4-addr--2", "97.8.9.0/24"),
    ])
    .unwrap();

    let results = request(&ctx)
        .request("[ipv4-addr:x_ip = '97.8.8.8']", RequestOptions::default().tags(["net"]))
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result["value"], "97.8.8.0/24");
    assert_eq!(result[FEED_FIELD], "net_feed");
    assert_eq!(result[TAGS_FIELD], json!(["net"]));
    assert!(result.keys().all(|k| !k.starts_with('_')));
}

#[tokio::test]
async fn test_subnet_containment_through_mirror() {
    let ctx = EngineContext::in_memory().unwrap();
    let mut feed = Feed::new(&ctx, "net_feed", grouped().tags(["net"])).unwrap();
    feed.add_optimizer("ipv4-addr:x_ip").unwrap();
    feed.insert(&[
        address("ipv4-addr--1", "97.8.8.0/24"),
        address("ipv4-addr--2", "97.8.9.0/24"),
    ])
    .unwrap();

    let results = request(&ctx)
        .request("[ipv4-addr:x_ip = '97.8.8.8']", RequestOptions::default().tags(["net"]))
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result["id"], "ipv4-addr--1");
    assert_eq!(result["value"], "97.8.8.0/24");
    // re-joined objects look like unmirrored ones
    assert_eq!(
        result["x_ip"],
        json!({"network_addr": 1_627_916_288u32, "broadcast_addr": 1_627_916_543u32})
    );
    assert!(result.keys().all(|k| !k.starts_with('_')));
}

#[tokio::test]
async fn test_mirrored_source_field_comparisons() {
    let ctx = EngineContext::in_memory().unwrap();
    let mut feed = Feed::new(&ctx, "mirrored", grouped()).unwrap();
    feed.add_optimizer("domain-name:value").unwrap();
    feed.insert(&[
        doc(json!({"type": "domain-name", "id": "domain-name--1", "value": "example.com"})),
        doc(json!({"type": "domain-name", "id": "domain-name--2", "value": "example.org"})),
        doc(json!({"type": "domain-name", "id": "domain-name--3", "value": "other.net"})),
    ])
    .unwrap();

    let results = request(&ctx)
        .request("[domain-name:value LIKE 'example.%']", RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(ids(&results), vec!["domain-name--1", "domain-name--2"]);

    let results = request(&ctx)
        .request("[domain-name:value = 'other.net']", RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(ids(&results), vec!["domain-name--3"]);
    assert_eq!(results[0]["value"], "other.net");
}

#[tokio::test]
async fn test_optimizers_leave_answers_unchanged() {
    let host_pattern = "[ipv4-addr:value = '97.8.8.8']";
    let subnet_pattern = "[ipv4-addr:x_ip = '97.8.8.8']";
    for optimizer in [None, Some("ipv4-addr:x_ip"), Some("ipv4-addr:value")] {
        let ctx = EngineContext::in_memory().unwrap();
        let mut feed = Feed::new(&ctx, "hosts", grouped()).unwrap();
        if let Some(field) = optimizer {
            feed.add_optimizer(field).unwrap();
        }
        feed.insert(&[
            address("ipv4-addr--host", "97.8.8.8"),
            address("ipv4-addr--net", "97.8.8.0/24"),
            address("ipv4-addr--far", "10.0.0.1"),
        ])
        .unwrap();

        let exact = request(&ctx)
            .request(host_pattern, RequestOptions::default().max_depth(0))
            .await
            .unwrap();
        assert_eq!(ids(&exact), vec!["ipv4-addr--host"], "{optimizer:?}");

        let contained = request(&ctx)
            .request(subnet_pattern, RequestOptions::default().max_depth(0))
            .await
            .unwrap();
        assert_eq!(
            ids(&contained),
            vec!["ipv4-addr--host", "ipv4-addr--net"],
            "{optimizer:?}"
        );
    }
}

#[tokio::test]
async fn test_grouped_feed_keeps_types_of_earlier_instances() {
    let ctx = EngineContext::in_memory().unwrap();
    Feed::new(&ctx, "shared", grouped())
        .unwrap()
        .insert(&[address("ipv4-addr--1", "10.0.0.1")])
        .unwrap();
    Feed::new(&ctx, "shared", grouped().date(at(INSERTED + 60)))
        .unwrap()
        .insert(&[doc(json!({"type": "identity", "id": "identity--1", "name": "ACME"}))])
        .unwrap();

    let feeds = request(&ctx).candidate_feeds("ipv4-addr", &[]).unwrap();
    assert_eq!(feeds.len(), 1);
    assert_eq!(feeds[0].date(), at(INSERTED + 60));

    let results = request(&ctx)
        .request("[ipv4-addr:value = '10.0.0.1']", RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(ids(&results), vec!["ipv4-addr--1"]);
}

#[tokio::test]
async fn test_grouped_feed_rejoins_documents_of_earlier_instances() {
    let ctx = EngineContext::in_memory().unwrap();
    let mut first = Feed::new(&ctx, "shared", grouped()).unwrap();
    first.add_optimizer("ipv4-addr:value").unwrap();
    first.insert(&[address("ipv4-addr--1", "10.0.0.1")]).unwrap();
    Feed::new(&ctx, "shared", grouped().date(at(INSERTED + 60)))
        .unwrap()
        .insert(&[address("ipv4-addr--2", "10.0.0.2")])
        .unwrap();

    let mirrored = request(&ctx)
        .request("[ipv4-addr:value = '10.0.0.1']", RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(ids(&mirrored), vec!["ipv4-addr--1"]);
    assert_eq!(mirrored[0]["value"], "10.0.0.1");

    // the later instance stored its object whole
    let plain = request(&ctx)
        .request("[ipv4-addr:value = '10.0.0.2']", RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(ids(&plain), vec!["ipv4-addr--2"]);

    let everything = request(&ctx)
        .request("[ipv4-addr:value LIKE '10.0.0.%']", RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(ids(&everything), vec!["ipv4-addr--1", "ipv4-addr--2"]);
}

#[tokio::test]
async fn test_feeds_are_filtered_by_tags_and_types() {
    let ctx = EngineContext::in_memory().unwrap();
    Feed::new(&ctx, "net_feed", grouped().tags(["net", "osint"]))
        .unwrap()
        .insert(&[address("ipv4-addr--1", "10.0.0.1")])
        .unwrap();
    Feed::new(&ctx, "dns_feed", grouped().tags(["dns"]))
        .unwrap()
        .insert(&[address("ipv4-addr--1", "10.0.0.1")])
        .unwrap();
    Feed::new(&ctx, "people", grouped().tags(["net"]))
        .unwrap()
        .insert(&[doc(json!({"type": "identity", "id": "identity--1", "name": "ACME"}))])
        .unwrap();

    let tags = vec!["net".to_string()];
    let candidates = request(&ctx).candidate_feeds("ipv4-addr", &tags).unwrap();
    let names: Vec<&str> = candidates.iter().map(Feed::name).collect();
    assert_eq!(names, vec!["net_feed"]);

    let results = request(&ctx)
        .request("[ipv4-addr:value = '10.0.0.1']", RequestOptions::default())
        .await
        .unwrap();
    // the same object from two feeds differs in provenance
    assert_eq!(results.len(), 2);
    let mut feeds: Vec<&str> = results.iter().map(|r| r[FEED_FIELD].as_str().unwrap()).collect();
    feeds.sort();
    assert_eq!(feeds, vec!["dns_feed", "net_feed"]);
}

#[tokio::test]
async fn test_latest_time_based_feed_before_reference_date() {
    let ctx = EngineContext::in_memory().unwrap();
    let dated = |seconds| FeedOptions::default().date(at(seconds));
    Feed::new(&ctx, "daily", dated(INSERTED))
        .unwrap()
        .insert(&[address("ipv4-addr--1", "10.0.0.1")])
        .unwrap();
    Feed::new(&ctx, "daily", dated(INSERTED + 86_400))
        .unwrap()
        .insert(&[address("ipv4-addr--2", "10.0.0.2")])
        .unwrap();

    let pattern = "[ipv4-addr:value LIKE '10.0.0.%']";
    let before = Request::new(&ctx, at(INSERTED - 1))
        .request(pattern, RequestOptions::default())
        .await
        .unwrap();
    assert!(before.is_empty());

    let first_day = Request::new(&ctx, at(INSERTED + 3_600))
        .request(pattern, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(ids(&first_day), vec!["ipv4-addr--1"]);

    let second_day = Request::new(&ctx, at(INSERTED + 2 * 86_400))
        .request(pattern, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(ids(&second_day), vec!["ipv4-addr--2"]);
}

#[tokio::test]
async fn test_two_hop_traversal_through_relationships() {
    let ctx = EngineContext::in_memory().unwrap();
    Feed::new(&ctx, "graph", grouped())
        .unwrap()
        .insert(&graph())
        .unwrap();

    let results = request(&ctx)
        .request("[identity:name = 'ACME']", RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(
        ids(&results),
        vec!["identity--1", "ipv4-addr--1", "relationship--1"]
    );

    let results = request(&ctx)
        .request("[identity:name = 'ACME']", RequestOptions::default().max_depth(1))
        .await
        .unwrap();
    assert_eq!(ids(&results), vec!["identity--1", "relationship--1"]);

    // the address is not a relationship, so the walk stops there
    let results = request(&ctx)
        .request("[domain-name:value = 'example.com']", RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(ids(&results), vec!["domain-name--1", "ipv4-addr--1"]);

    let results = request(&ctx)
        .request(
            "[domain-name:value = 'example.com']",
            RequestOptions::default().max_depth(0),
        )
        .await
        .unwrap();
    assert_eq!(ids(&results), vec!["domain-name--1"]);
}

#[tokio::test]
async fn test_shared_neighbours_are_merged() {
    let ctx = EngineContext::in_memory().unwrap();
    Feed::new(&ctx, "asn", grouped())
        .unwrap()
        .insert(&[
            doc(json!({"type": "autonomous-system", "id": "autonomous-system--1", "number": 64500})),
            doc(json!({
                "type": "ipv4-addr", "id": "ipv4-addr--1", "value": "10.0.0.1",
                "belongs_to_refs": ["autonomous-system--1"],
            })),
            doc(json!({
                "type": "ipv4-addr", "id": "ipv4-addr--2", "value": "10.0.0.2",
                "belongs_to_refs": ["autonomous-system--1"],
            })),
        ])
        .unwrap();

    let results = request(&ctx)
        .request("[ipv4-addr:value LIKE '10.0.0.%']", RequestOptions::default().max_depth(1))
        .await
        .unwrap();
    assert_eq!(
        ids(&results),
        vec!["autonomous-system--1", "ipv4-addr--1", "ipv4-addr--2"]
    );
}

#[tokio::test]
async fn test_limit_caps_matches_per_feed() {
    let ctx = EngineContext::in_memory().unwrap();
    Feed::new(&ctx, "many", grouped())
        .unwrap()
        .insert(&[
            address("ipv4-addr--1", "10.0.0.1"),
            address("ipv4-addr--2", "10.0.0.2"),
            address("ipv4-addr--3", "10.0.0.3"),
        ])
        .unwrap();

    let results = request(&ctx)
        .request("[ipv4-addr:value LIKE '10.%']", RequestOptions::default().limit(2))
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
}

#[tokio::test]
async fn test_indexes_follow_equality_queries() {
    let memory = Arc::new(MemoryStore::new());
    let ctx = EngineContext::from_parts(
        memory.clone(),
        Some(MirrorConnection::open_in_memory().unwrap()),
        EngineConfig::default(),
    );
    let mut feed = Feed::new(&ctx, "indexed", grouped()).unwrap();
    feed.insert(&[address("ipv4-addr--1", "10.0.0.1")]).unwrap();
    let collection = feed.collection_name();

    request(&ctx)
        .request("[ipv4-addr:value LIKE '10.%']", RequestOptions::default())
        .await
        .unwrap();
    assert!(memory.indexes(&collection).is_empty());

    request(&ctx)
        .request("[ipv4-addr:value = '10.0.0.1']", RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(
        memory.indexes(&collection),
        vec![vec!["value".to_string(), "type".to_string()]]
    );

    request(&ctx)
        .request(
            "[ipv4-addr:id = 'ipv4-addr--1']",
            RequestOptions::default().create_index(false),
        )
        .await
        .unwrap();
    assert_eq!(memory.indexes(&collection).len(), 1);
}

#[tokio::test]
async fn test_compile_errors_surface() {
    let ctx = EngineContext::in_memory().unwrap();
    let err = request(&ctx)
        .request("[ipv4-addr:value = '1' AND identity:name = 'x']", RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Pattern(PatternError::PatternAlreadyContainsType { .. })
    ));

    let err = request(&ctx)
        .request("[ipv4-addr:value = '1'", RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Pattern(PatternError::MalformedExpression(_))));
}

#[tokio::test]
async fn test_no_feeds_no_results() {
    let ctx = EngineContext::in_memory().unwrap();
    let results = request(&ctx)
        .request("[ipv4-addr:value = '1.2.3.4']", RequestOptions::default())
        .await
        .unwrap();
    assert!(results.is_empty());
}
